//! Shared fixtures: an LSDA assembler, fake stack frames and a two-phase
//! unwinder that drives the real personality routine over them.

#![allow(dead_code)]

use std::cell::RefCell;
use std::ffi::{c_int, c_void};
use std::mem;

use cxxrt_runtime::dwarf::{DW_EH_PE_ABSPTR, DW_EH_PE_OMIT, DW_EH_PE_UDATA4};
use cxxrt_runtime::exceptions::{prepare_throw, Destructor, Envelope};
use cxxrt_runtime::personality::personality_with;
use cxxrt_runtime::rtti::TypeInfo;
use cxxrt_runtime::unwind::{
    FrameContext, UnwindActions, UnwindException, UnwindReasonCode, Unwinder, UNWIND_DATA_REG,
};
use cxxrt_runtime::cxxrt_allocate_exception;

/// Start address of every fake function.
pub const REGION_START: usize = 0x1000;

pub fn uleb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb128(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct CallSiteSpec {
    start: u32,
    length: u32,
    landing_pad: u32,
    filters: Vec<i64>,
}

/// Assembles an LSDA the way a compiler lays one out: udata4 call sites,
/// an absptr type table and exception-spec lists after the table base.
#[derive(Default)]
pub struct LsdaBuilder {
    call_sites: Vec<CallSiteSpec>,
    types: Vec<*const TypeInfo>,
    specs: Vec<Vec<u64>>,
}

impl LsdaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type table entry and returns its (positive) filter.
    pub fn catch_type(&mut self, ty: &TypeInfo) -> i64 {
        self.types.push(ty as *const TypeInfo);
        self.types.len() as i64
    }

    /// Adds a `catch (...)` entry.
    pub fn catch_all(&mut self) -> i64 {
        self.types.push(std::ptr::null());
        self.types.len() as i64
    }

    /// Adds an exception specification and returns its (negative) filter.
    pub fn exception_spec(&mut self, allowed: &[&TypeInfo]) -> i64 {
        let indices: Vec<u64> = allowed
            .iter()
            .map(|ty| self.catch_type(ty) as u64)
            .collect();
        let offset: usize = self.specs.iter().map(|spec| spec.len() + 1).sum();
        self.specs.push(indices);
        -(offset as i64) - 1
    }

    /// Adds a call site covering `[start, start + length)` relative to the
    /// function. `filters` is its action chain in order; 0 is a cleanup and
    /// an empty chain means "cleanup only, no action record".
    pub fn call_site(&mut self, start: u32, length: u32, landing_pad: u32, filters: &[i64]) {
        self.call_sites.push(CallSiteSpec {
            start,
            length,
            landing_pad,
            filters: filters.to_vec(),
        });
    }

    pub fn build(&self) -> Vec<u8> {
        let mut actions = Vec::new();
        let mut call_sites = Vec::new();
        for site in &self.call_sites {
            call_sites.extend_from_slice(&site.start.to_ne_bytes());
            call_sites.extend_from_slice(&site.length.to_ne_bytes());
            call_sites.extend_from_slice(&site.landing_pad.to_ne_bytes());
            if site.filters.is_empty() {
                uleb128(0, &mut call_sites);
                continue;
            }
            uleb128(actions.len() as u64 + 1, &mut call_sites);
            for (i, filter) in site.filters.iter().enumerate() {
                sleb128(*filter, &mut actions);
                let last = i + 1 == site.filters.len();
                // Next record starts right after this displacement byte
                actions.push(if last { 0 } else { 1 });
            }
        }

        let mut after_ttype_offset = vec![DW_EH_PE_UDATA4];
        uleb128(call_sites.len() as u64, &mut after_ttype_offset);
        after_ttype_offset.extend_from_slice(&call_sites);
        after_ttype_offset.extend_from_slice(&actions);
        for ty in self.types.iter().rev() {
            after_ttype_offset.extend_from_slice(&(*ty as usize).to_ne_bytes());
        }
        let ttype_offset = after_ttype_offset.len();

        let mut lsda = vec![DW_EH_PE_OMIT, DW_EH_PE_ABSPTR];
        uleb128(ttype_offset as u64, &mut lsda);
        lsda.extend_from_slice(&after_ttype_offset);
        for spec in &self.specs {
            for index in spec {
                uleb128(*index, &mut lsda);
            }
            lsda.push(0);
        }
        lsda
    }
}

/// A stack frame as the personality routine sees it.
pub struct MockFrame {
    lsda: Option<Vec<u8>>,
    ip: usize,
    installed_ip: Option<usize>,
    registers: [usize; 2],
    on_cleanup: Option<Box<dyn Fn()>>,
}

impl MockFrame {
    /// A frame with no unwind information at all.
    pub fn without_lsda() -> Self {
        Self {
            lsda: None,
            ip: REGION_START,
            installed_ip: None,
            registers: [0; 2],
            on_cleanup: None,
        }
    }

    /// A frame stopped at `offset` into its function.
    pub fn new(lsda: Vec<u8>, offset: usize) -> Self {
        Self {
            lsda: Some(lsda),
            ip: REGION_START + offset,
            ..Self::without_lsda()
        }
    }

    /// Runs `f` when this frame's cleanup landing pad is entered.
    pub fn on_cleanup(mut self, f: impl Fn() + 'static) -> Self {
        self.on_cleanup = Some(Box::new(f));
        self
    }
}

impl FrameContext for MockFrame {
    fn language_specific_data(&self) -> *const u8 {
        self.lsda
            .as_ref()
            .map_or(std::ptr::null(), |lsda| lsda.as_ptr())
    }

    fn call_site_ip(&self) -> usize {
        self.ip
    }

    fn region_start(&self) -> usize {
        REGION_START
    }

    fn text_rel_base(&self) -> usize {
        0
    }

    fn data_rel_base(&self) -> usize {
        0
    }

    fn set_ip(&mut self, ip: usize) {
        self.installed_ip = Some(ip);
    }

    fn set_gr(&mut self, index: c_int, value: usize) {
        if index == UNWIND_DATA_REG.0 {
            self.registers[0] = value;
        } else if index == UNWIND_DATA_REG.1 {
            self.registers[1] = value;
        }
    }
}

/// Where control was transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Landing {
    pub frame: usize,
    pub landing_pad: usize,
    pub exception: usize,
    pub selector: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Cleanup(Landing),
    Handler(Landing),
}

/// A two-phase unwinder over a fixed stack, innermost frame first.
///
/// Returns `InstallContext` when the handler frame's landing pad is
/// installed instead of jumping to it.
pub struct MockUnwinder {
    frames: RefCell<Vec<MockFrame>>,
    events: RefCell<Vec<Event>>,
}

impl MockUnwinder {
    pub fn new(frames: Vec<MockFrame>) -> Self {
        Self {
            frames: RefCell::new(frames),
            events: RefCell::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn cleanups(&self) -> Vec<usize> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Cleanup(landing) => Some(landing.frame),
                Event::Handler(_) => None,
            })
            .collect()
    }

    pub fn handler(&self) -> Option<Landing> {
        self.events.borrow().iter().find_map(|event| match event {
            Event::Handler(landing) => Some(*landing),
            Event::Cleanup(_) => None,
        })
    }

    unsafe fn unwind(&self, exception: *mut UnwindException) -> UnwindReasonCode {
        let class = (*exception).exception_class;
        let mut frames = self.frames.borrow_mut();

        let mut handler = None;
        for (index, frame) in frames.iter_mut().enumerate() {
            match personality_with(1, UnwindActions::SEARCH_PHASE, class, exception, frame) {
                UnwindReasonCode::ContinueUnwind => {}
                UnwindReasonCode::HandlerFound => {
                    handler = Some(index);
                    break;
                }
                _ => return UnwindReasonCode::FatalPhase1Error,
            }
        }
        let Some(handler) = handler else {
            return UnwindReasonCode::EndOfStack;
        };

        for (index, frame) in frames.iter_mut().enumerate().take(handler + 1) {
            let mut actions = UnwindActions::CLEANUP_PHASE;
            if index == handler {
                actions |= UnwindActions::HANDLER_FRAME;
            }
            frame.installed_ip = None;
            match personality_with(1, actions, class, exception, frame) {
                UnwindReasonCode::ContinueUnwind => {}
                UnwindReasonCode::InstallContext => {
                    let landing = Landing {
                        frame: index,
                        landing_pad: frame.installed_ip.unwrap_or(0),
                        exception: frame.registers[0],
                        selector: frame.registers[1] as i64,
                    };
                    if index == handler {
                        self.events.borrow_mut().push(Event::Handler(landing));
                        return UnwindReasonCode::InstallContext;
                    }
                    // The landing pad runs its cleanup, then resumes
                    self.events.borrow_mut().push(Event::Cleanup(landing));
                    if let Some(cleanup) = &frame.on_cleanup {
                        cleanup();
                    }
                }
                _ => return UnwindReasonCode::FatalPhase2Error,
            }
        }
        UnwindReasonCode::FatalPhase2Error
    }
}

impl Unwinder for MockUnwinder {
    unsafe fn raise_exception(&self, exception: *mut UnwindException) -> UnwindReasonCode {
        self.unwind(exception)
    }

    unsafe fn resume_or_rethrow(&self, exception: *mut UnwindException) -> UnwindReasonCode {
        self.unwind(exception)
    }
}

/// Allocates and prepares a thrown `value` of type `ty`, returning its
/// envelope.
pub fn throw_value<T>(value: T, ty: &TypeInfo, destructor: Option<Destructor>) -> *mut Envelope {
    unsafe {
        let payload = cxxrt_allocate_exception(mem::size_of::<T>());
        payload.cast::<T>().write(value);
        prepare_throw(payload, ty, destructor)
    }
}

/// The value a landing pad's exception register points at, as
/// `begin_catch` receives it.
pub fn landing_header(landing: &Landing) -> *mut c_void {
    landing.exception as *mut c_void
}
