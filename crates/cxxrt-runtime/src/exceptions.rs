//! Exception envelopes and the throw / catch entry points.
//!
//! Every thrown value lives directly after an [`Envelope`] holding the
//! runtime's bookkeeping. The envelope ends with the unwinder's
//! [`UnwindException`] header, so the header, the envelope and the thrown
//! value can each be derived from one another:
//!
//! ```text
//! | Envelope fields ... | UnwindException | thrown value ... |
//! ^ envelope            ^ header          ^ payload
//! ```

use core::ffi::{c_int, c_void};
use core::mem;
use core::ptr;

use log::debug;

use crate::error::TerminateReason;
use crate::handlers::{self, terminate_with, unexpected_via, Handler};
use crate::memory;
use crate::report::report_failure;
use crate::rtti::TypeInfo;
use crate::thread_state;
use crate::unwind::{SystemUnwinder, UnwindException, UnwindReasonCode, Unwinder};

/// `"GNUCC++\0"`: vendor GNUC, language C++.
pub const EXCEPTION_CLASS: u64 = u64::from_be_bytes(*b"GNUCC++\0");

/// Destroys a thrown value in place.
pub type Destructor = unsafe extern "C-unwind" fn(*mut c_void);

/// What [`HandlerCount::leave`] asks the caller to do with the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other catch blocks still use it.
    Keep,
    /// Rethrown: take it off the handler stack but keep it alive.
    Unlink,
    /// Nothing references it any more.
    Free,
}

/// Number of catch blocks using an envelope, plus whether it is currently
/// being rethrown.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCount {
    count: u32,
    rethrown: bool,
}

impl HandlerCount {
    pub const fn new() -> Self {
        Self {
            count: 0,
            rethrown: false,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_rethrown(&self) -> bool {
        self.rethrown
    }

    /// A catch block starts using the envelope.
    pub fn enter(&mut self) {
        self.count = self.count.saturating_add(1);
        self.rethrown = false;
    }

    /// The innermost catch block rethrows the envelope.
    pub fn mark_rethrown(&mut self) {
        self.rethrown = true;
    }

    /// A catch block stops using the envelope.
    pub fn leave(&mut self) -> Release {
        self.count = self.count.saturating_sub(1);
        match (self.count, self.rethrown) {
            (0, false) => Release::Free,
            (0, true) => Release::Unlink,
            _ => Release::Keep,
        }
    }
}

/// The runtime's header in front of every thrown value.
#[repr(C)]
pub struct Envelope {
    pub exception_type: *const TypeInfo,
    pub destructor: Option<Destructor>,
    /// Hooks in effect when the exception was thrown.
    pub unexpected_handler: Option<Handler>,
    pub terminate_handler: Option<Handler>,
    /// Next older exception on the thread's handler stack.
    pub next: *mut Envelope,
    pub handler_count: HandlerCount,

    // Phase 1 results cached for phase 2
    pub handler_switch_value: c_int,
    pub action_record: *const u8,
    pub language_specific_data: *const u8,
    pub catch_temp: usize,
    pub adjusted_ptr: *mut c_void,

    pub unwind_header: UnwindException,
}

impl Envelope {
    /// # Safety
    /// `envelope` must point into an allocation from [`memory`].
    pub unsafe fn payload(envelope: *mut Envelope) -> *mut c_void {
        envelope.add(1).cast()
    }

    /// # Safety
    /// `payload` must be the payload of a live envelope.
    pub unsafe fn from_payload(payload: *mut c_void) -> *mut Envelope {
        payload.cast::<Envelope>().sub(1)
    }

    /// # Safety
    /// `header` must be the header of a live native envelope.
    pub unsafe fn from_header(header: *mut UnwindException) -> *mut Envelope {
        header
            .byte_sub(mem::offset_of!(Envelope, unwind_header))
            .cast()
    }

    /// # Safety
    /// `envelope` must be live.
    pub unsafe fn header(envelope: *mut Envelope) -> *mut UnwindException {
        ptr::addr_of_mut!((*envelope).unwind_header)
    }

    /// Whether `header` was thrown by this runtime.
    pub fn is_native(header: &UnwindException) -> bool {
        header.exception_class == EXCEPTION_CLASS
    }

    pub fn exception_type(&self) -> Option<&TypeInfo> {
        unsafe { self.exception_type.as_ref() }
    }
}

/// Lets a foreign runtime that caught one of our exceptions destroy it.
unsafe extern "C" fn exception_cleanup(_reason: UnwindReasonCode, header: *mut UnwindException) {
    memory::free_envelope(Envelope::from_header(header));
}

/// Fills in a freshly allocated envelope for throwing and counts it as
/// uncaught.
///
/// # Safety
/// `payload` must come from [`memory::cxxrt_allocate_exception`] and hold a
/// constructed value of type `exception_type`.
pub unsafe fn prepare_throw(
    payload: *mut c_void,
    exception_type: *const TypeInfo,
    destructor: Option<Destructor>,
) -> *mut Envelope {
    let envelope = Envelope::from_payload(payload);
    (*envelope).exception_type = exception_type;
    (*envelope).destructor = destructor;
    (*envelope).unexpected_handler = Some(handlers::unexpected_handler());
    (*envelope).terminate_handler = Some(handlers::terminate_handler());
    (*envelope).unwind_header = UnwindException::new(EXCEPTION_CLASS);
    (*envelope).unwind_header.exception_cleanup = Some(exception_cleanup);
    thread_state::with(|state| state.increment_uncaught());
    envelope
}

/// Starts unwinding with `envelope`. Only returns if no handler took it.
///
/// # Safety
/// `envelope` must come from [`prepare_throw`].
pub unsafe fn raise_exception<U: Unwinder>(
    unwinder: &U,
    envelope: *mut Envelope,
) -> UnwindReasonCode {
    unwinder.raise_exception(Envelope::header(envelope))
}

/// Throws the value at `thrown`.
///
/// # Safety
/// See [`prepare_throw`].
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_throw")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C-unwind" fn cxxrt_throw(
    thrown: *mut c_void,
    exception_type: *const TypeInfo,
    destructor: Option<Destructor>,
) -> ! {
    let envelope = prepare_throw(thrown, exception_type, destructor);
    let code = raise_exception(&SystemUnwinder, envelope);
    report_failure(
        code,
        thrown,
        exception_type.as_ref(),
        (*envelope).terminate_handler,
    )
}

/// What a rethrow handed back to the unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rethrown {
    Native(*mut Envelope),
    Foreign(*mut UnwindException),
}

/// Rethrows the innermost caught exception. Returns once the unwinder gives
/// up, with its reason code.
///
/// The exception stays on the handler stack; the `end_catch` run while
/// unwinding out of the catch block takes it off without freeing it.
///
/// # Safety
/// Must be called from inside a catch block.
pub unsafe fn rethrow_with<U: Unwinder>(
    unwinder: &U,
) -> Result<(UnwindReasonCode, Rethrown), TerminateReason> {
    let target = thread_state::with(|state| {
        if let Some(foreign) = state.innermost_foreign() {
            state.mark_foreign_rethrown();
            state.increment_uncaught();
            return Some(Rethrown::Foreign(foreign.header));
        }
        let head = state.caught_head();
        if head.is_null() {
            return None;
        }
        (*head).handler_count.mark_rethrown();
        state.increment_uncaught();
        Some(Rethrown::Native(head))
    })
    .ok_or(TerminateReason::NoActiveException)?;

    let header = match target {
        Rethrown::Native(envelope) => Envelope::header(envelope),
        Rethrown::Foreign(header) => header,
    };
    debug!("rethrowing exception {header:p}");
    Ok((unwinder.resume_or_rethrow(header), target))
}

/// Rethrows the exception being handled.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_rethrow")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C-unwind" fn cxxrt_rethrow() -> ! {
    match unsafe { rethrow_with(&SystemUnwinder) } {
        Ok((code, Rethrown::Native(envelope))) => unsafe {
            report_failure(
                code,
                Envelope::payload(envelope),
                (*envelope).exception_type(),
                (*envelope).terminate_handler,
            )
        },
        Ok((code, Rethrown::Foreign(header))) => {
            report_failure(code, unsafe { header.add(1) }.cast::<c_void>(), None, None)
        }
        Err(reason) => terminate_with(reason),
    }
}

/// Enters a catch block for the exception whose header the landing pad
/// received. Returns the pointer the catch parameter binds to.
///
/// # Safety
/// `header` must be the exception pointer handed to the landing pad.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_begin_catch")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_begin_catch(header: *mut c_void) -> *mut c_void {
    let header = header.cast::<UnwindException>();
    thread_state::with(|state| {
        state.decrement_uncaught();

        if !Envelope::is_native(&*header) {
            debug!("catching foreign exception {header:p}");
            state.push_foreign(header);
            return header.add(1).cast::<c_void>();
        }

        let envelope = Envelope::from_header(header);
        // Caught again inside the block that rethrew it
        if state.caught_head() != envelope {
            state.push_caught(envelope);
        }
        (*envelope).handler_count.enter();
        debug!(
            "catching exception {envelope:p} (handlers: {})",
            (*envelope).handler_count.count()
        );
        (*envelope).adjusted_ptr
    })
}

/// Leaves the innermost catch block, freeing its exception once no catch
/// block uses it.
pub fn end_catch() -> Result<(), TerminateReason> {
    thread_state::with(|state| {
        if state.innermost_foreign().is_some() {
            if let Some(foreign) = state.pop_foreign() {
                if !foreign.rethrown {
                    unsafe { foreign.delete() };
                }
            }
            return Ok(());
        }

        let envelope = state.caught_head();
        if envelope.is_null() {
            return Err(TerminateReason::EndCatchWithoutException);
        }
        let release = unsafe { (*envelope).handler_count.leave() };
        debug!("leaving catch of {envelope:p}: {release:?}");
        match release {
            Release::Keep => {}
            Release::Unlink => {
                state.pop_caught();
            }
            Release::Free => {
                state.pop_caught();
                unsafe { memory::free_envelope(envelope) };
            }
        }
        Ok(())
    })
}

#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_end_catch")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_end_catch() {
    if let Err(reason) = end_catch() {
        if cfg!(debug_assertions) {
            terminate_with(reason);
        }
        log::warn!("{reason}");
    }
}

/// Type of the innermost caught exception, or null if there is none or it
/// is foreign.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_current_exception_type")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_current_exception_type() -> *const TypeInfo {
    thread_state::try_with(|state| {
        if state.innermost_foreign().is_some() {
            return ptr::null();
        }
        let head = state.caught_head();
        if head.is_null() {
            ptr::null()
        } else {
            unsafe { (*head).exception_type }
        }
    })
    .unwrap_or(ptr::null())
}

/// The pointer a catch block would receive, without entering it.
///
/// # Safety
/// `header` must be the header of a native exception.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_get_exception_ptr")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_get_exception_ptr(header: *mut c_void) -> *mut c_void {
    (*Envelope::from_header(header.cast())).adjusted_ptr
}

/// Called by the landing pad of a function whose exception specification
/// was violated. Runs the unexpected hook in effect at the throw.
///
/// # Safety
/// `header` must be the exception pointer handed to the landing pad.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_call_unexpected")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C-unwind" fn cxxrt_call_unexpected(header: *mut c_void) -> ! {
    let header = header.cast::<UnwindException>();
    if !header.is_null() && Envelope::is_native(&*header) {
        if let Some(handler) = (*Envelope::from_header(header)).unexpected_handler {
            unexpected_via(handler);
        }
    }
    handlers::unexpected()
}
