//! Reader for the DWARF-based language-specific data area (LSDA).
//!
//! Layout of one function's LSDA, as emitted by GCC and LLVM:
//!
//! ```text
//! lpstart encoding (u8), [lpstart]
//! type table encoding (u8), [uleb128 offset to end of type table]
//! call-site encoding (u8), uleb128 call-site table length
//! call-site records: start, length, landing pad, uleb128 action (1-based)
//! action records: sleb128 filter, sleb128 displacement to next record
//! type table (grows downward from its end), exception-spec index lists
//! ```

use core::mem;
use core::ptr;

use crate::error::LsdaError;
use crate::rtti::TypeInfo;
use crate::unwind::FrameContext;

pub const DW_EH_PE_OMIT: u8 = 0xFF;
pub const DW_EH_PE_ABSPTR: u8 = 0x00;

pub const DW_EH_PE_ULEB128: u8 = 0x01;
pub const DW_EH_PE_UDATA2: u8 = 0x02;
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_UDATA8: u8 = 0x04;
pub const DW_EH_PE_SLEB128: u8 = 0x09;
pub const DW_EH_PE_SDATA2: u8 = 0x0A;
pub const DW_EH_PE_SDATA4: u8 = 0x0B;
pub const DW_EH_PE_SDATA8: u8 = 0x0C;

pub const DW_EH_PE_PCREL: u8 = 0x10;
pub const DW_EH_PE_TEXTREL: u8 = 0x20;
pub const DW_EH_PE_DATAREL: u8 = 0x30;
pub const DW_EH_PE_FUNCREL: u8 = 0x40;
pub const DW_EH_PE_ALIGNED: u8 = 0x50;

pub const DW_EH_PE_INDIRECT: u8 = 0x80;

/// A cursor over raw LSDA bytes.
pub struct DwarfReader {
    pub ptr: *const u8,
}

impl DwarfReader {
    pub fn new(ptr: *const u8) -> Self {
        Self { ptr }
    }

    /// # Safety
    /// At least `size_of::<T>()` readable bytes must remain.
    pub unsafe fn read<T: Copy>(&mut self) -> T {
        let value = ptr::read_unaligned(self.ptr.cast::<T>());
        self.ptr = self.ptr.add(mem::size_of::<T>());
        value
    }

    /// # Safety
    /// A complete LEB128 value must be readable.
    pub unsafe fn read_uleb128(&mut self) -> Result<u64, LsdaError> {
        let mut shift: u32 = 0;
        let mut result: u64 = 0;
        loop {
            let byte: u8 = self.read();
            if shift >= 64 {
                return Err(LsdaError::LebOverflow);
            }
            result |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// # Safety
    /// A complete LEB128 value must be readable.
    pub unsafe fn read_sleb128(&mut self) -> Result<i64, LsdaError> {
        let mut shift: u32 = 0;
        let mut result: u64 = 0;
        let mut byte: u8;
        loop {
            byte = self.read();
            if shift >= 64 {
                return Err(LsdaError::LebOverflow);
            }
            result |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
        }
        // Sign-extend
        if shift < 64 && (byte & 0x40) != 0 {
            result |= !0 << shift;
        }
        Ok(result as i64)
    }
}

/// Base addresses that relative pointer encodings are measured from.
#[derive(Debug, Clone, Copy, Default)]
pub struct EhBases {
    pub func_start: usize,
    pub text_start: usize,
    pub data_start: usize,
}

impl EhBases {
    pub fn of<F: FrameContext>(frame: &F) -> Self {
        Self {
            func_start: frame.region_start(),
            text_start: frame.text_rel_base(),
            data_start: frame.data_rel_base(),
        }
    }
}

/// Byte size of a fixed-size encoding, as used to index the type table.
pub fn size_of_encoding(encoding: u8) -> Result<usize, LsdaError> {
    if encoding == DW_EH_PE_OMIT {
        return Ok(0);
    }
    match encoding & 0x0F {
        DW_EH_PE_ABSPTR => Ok(mem::size_of::<usize>()),
        DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => Ok(2),
        DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => Ok(4),
        DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => Ok(8),
        _ => Err(LsdaError::VariableSizeTypeEntry(encoding)),
    }
}

/// Reads the raw value of an encoded pointer, before any base is applied.
///
/// # Safety
/// The encoded value must be readable.
unsafe fn read_encoded_value(reader: &mut DwarfReader, encoding: u8) -> Result<usize, LsdaError> {
    Ok(match encoding & 0x0F {
        DW_EH_PE_ABSPTR => reader.read::<usize>(),
        DW_EH_PE_ULEB128 => reader.read_uleb128()? as usize,
        DW_EH_PE_UDATA2 => reader.read::<u16>() as usize,
        DW_EH_PE_UDATA4 => reader.read::<u32>() as usize,
        DW_EH_PE_UDATA8 => reader.read::<u64>() as usize,
        DW_EH_PE_SLEB128 => reader.read_sleb128()? as usize,
        DW_EH_PE_SDATA2 => reader.read::<i16>() as usize,
        DW_EH_PE_SDATA4 => reader.read::<i32>() as usize,
        DW_EH_PE_SDATA8 => reader.read::<i64>() as usize,
        _ => return Err(LsdaError::UnsupportedEncoding(encoding)),
    })
}

/// Applies the base and indirection of `encoding` to a raw value read from
/// `origin`.
///
/// # Safety
/// For indirect encodings the resolved address must be readable.
unsafe fn resolve_encoded_value(
    raw: usize,
    origin: *const u8,
    encoding: u8,
    bases: &EhBases,
) -> Result<usize, LsdaError> {
    let base = match encoding & 0x70 {
        DW_EH_PE_ABSPTR => 0,
        DW_EH_PE_PCREL => origin as usize,
        DW_EH_PE_FUNCREL => bases.func_start,
        DW_EH_PE_TEXTREL => bases.text_start,
        DW_EH_PE_DATAREL => bases.data_start,
        _ => return Err(LsdaError::UnsupportedEncoding(encoding)),
    };
    let mut result = base.wrapping_add(raw);
    if encoding & DW_EH_PE_INDIRECT != 0 {
        result = *(result as *const usize);
    }
    Ok(result)
}

/// Reads a pointer with the given encoding.
///
/// # Safety
/// The encoded value must be readable.
pub unsafe fn read_encoded_pointer(
    reader: &mut DwarfReader,
    bases: &EhBases,
    encoding: u8,
) -> Result<usize, LsdaError> {
    if encoding == DW_EH_PE_OMIT {
        return Err(LsdaError::Omitted);
    }
    if encoding == DW_EH_PE_ALIGNED {
        let align = mem::size_of::<usize>();
        let aligned = (reader.ptr as usize).next_multiple_of(align);
        reader.ptr = aligned as *const u8;
        return Ok(reader.read::<usize>());
    }
    let origin = reader.ptr;
    let raw = read_encoded_value(reader, encoding)?;
    resolve_encoded_value(raw, origin, encoding, bases)
}

/// The call-site entry covering the current instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Landing pad address, or 0 if the call site has none.
    pub landing_pad: usize,
    /// First action record, or null for a cleanup-only call site.
    pub action_record: *const u8,
}

/// One decoded action record.
#[derive(Debug, Clone, Copy)]
pub struct ActionRecord {
    /// Positive: catch clause (type table index). Negative: exception
    /// specification (offset into the spec lists). Zero: cleanup.
    pub filter: i64,
    /// The next record in the chain, or null.
    pub next: *const u8,
}

impl ActionRecord {
    /// # Safety
    /// `record` must point at an action record inside a valid LSDA.
    pub unsafe fn read(record: *const u8) -> Result<Self, LsdaError> {
        let mut reader = DwarfReader::new(record);
        let filter = reader.read_sleb128()?;
        let displacement_base = reader.ptr;
        let displacement = reader.read_sleb128()?;
        let next = if displacement == 0 {
            ptr::null()
        } else {
            displacement_base.offset(displacement as isize)
        };
        Ok(Self { filter, next })
    }
}

/// A parsed LSDA header.
#[derive(Debug, Clone)]
pub struct Lsda {
    pub bases: EhBases,
    pub lpstart: usize,
    pub type_table: *const u8,
    pub type_table_encoding: u8,
    pub call_site_encoding: u8,
    pub call_site_table: *const u8,
    pub action_table: *const u8,
}

impl Lsda {
    /// Parses the LSDA header at `lsda` for the given frame.
    ///
    /// # Safety
    /// `lsda` must point to a well-formed LSDA.
    pub unsafe fn parse<F: FrameContext>(frame: &F, lsda: *const u8) -> Result<Self, LsdaError> {
        let bases = EhBases::of(frame);
        let mut reader = DwarfReader::new(lsda);

        let lpstart_encoding: u8 = reader.read();
        let lpstart = if lpstart_encoding == DW_EH_PE_OMIT {
            bases.func_start
        } else {
            read_encoded_pointer(&mut reader, &bases, lpstart_encoding)?
        };

        let type_table_encoding: u8 = reader.read();
        let type_table = if type_table_encoding == DW_EH_PE_OMIT {
            ptr::null()
        } else {
            let offset = reader.read_uleb128()?;
            reader.ptr.add(offset as usize)
        };

        let call_site_encoding: u8 = reader.read();
        let call_site_table_length = reader.read_uleb128()?;
        let call_site_table = reader.ptr;
        let action_table = call_site_table.add(call_site_table_length as usize);

        Ok(Self {
            bases,
            lpstart,
            type_table,
            type_table_encoding,
            call_site_encoding,
            call_site_table,
            action_table,
        })
    }

    /// Finds the call-site record covering `ip`.
    ///
    /// Returns `Ok(None)` when no record covers it: the call was made from a
    /// region with no unwind scope at all.
    ///
    /// # Safety
    /// The LSDA must be well formed.
    pub unsafe fn find_call_site(&self, ip: usize) -> Result<Option<CallSite>, LsdaError> {
        let mut reader = DwarfReader::new(self.call_site_table);
        while reader.ptr < self.action_table {
            let start = read_encoded_value(&mut reader, self.call_site_encoding)?;
            let length = read_encoded_value(&mut reader, self.call_site_encoding)?;
            let landing_pad = read_encoded_value(&mut reader, self.call_site_encoding)?;
            let action = reader.read_uleb128()?;

            let region = self.bases.func_start.wrapping_add(start);
            // Records are sorted by start address
            if ip < region {
                break;
            }
            if ip < region.wrapping_add(length) {
                return Ok(Some(CallSite {
                    landing_pad: if landing_pad == 0 {
                        0
                    } else {
                        self.lpstart.wrapping_add(landing_pad)
                    },
                    action_record: if action == 0 {
                        ptr::null()
                    } else {
                        self.action_table.add(action as usize - 1)
                    },
                }));
            }
        }
        Ok(None)
    }

    /// Returns the catch type for a positive filter; null is a catch-all.
    ///
    /// # Safety
    /// `filter` must come from this LSDA's action table.
    pub unsafe fn type_info_entry(&self, filter: u64) -> Result<*const TypeInfo, LsdaError> {
        if self.type_table.is_null() {
            return Err(LsdaError::MissingTypeTable);
        }
        let size = size_of_encoding(self.type_table_encoding)?;
        let record = self.type_table.sub(size * filter as usize);
        let mut reader = DwarfReader::new(record);
        let raw = read_encoded_value(&mut reader, self.type_table_encoding)?;
        if raw == 0 {
            return Ok(ptr::null());
        }
        let resolved = resolve_encoded_value(raw, record, self.type_table_encoding, &self.bases)?;
        Ok(resolved as *const TypeInfo)
    }

    /// Returns the type-table indices listed by a negative filter.
    ///
    /// # Safety
    /// `filter` must come from this LSDA's action table.
    pub unsafe fn exception_spec(&self, filter: i64) -> Result<Vec<u64>, LsdaError> {
        if self.type_table.is_null() {
            return Err(LsdaError::MissingTypeTable);
        }
        let mut reader = DwarfReader::new(self.type_table.add((-filter - 1) as usize));
        let mut indices = Vec::new();
        loop {
            let index = reader.read_uleb128()?;
            if index == 0 {
                return Ok(indices);
            }
            indices.push(index);
        }
    }
}
