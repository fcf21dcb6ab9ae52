//! Interface to the external stack unwinder.
//!
//! The runtime never walks the stack itself. It hands exceptions to an
//! [`Unwinder`] and is called back once per frame with a [`FrameContext`].
//! The system implementations bind the Itanium `_Unwind_*` API provided by
//! libgcc_s / libunwind; tests substitute their own.

#![allow(non_camel_case_types)]

use core::ffi::{c_int, c_void};

use bitflags::bitflags;

/// `_Unwind_Reason_Code`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindReasonCode {
    NoReason = 0,
    /// A different runtime caught this exception.
    ForeignExceptionCaught = 1,
    FatalPhase2Error = 2,
    FatalPhase1Error = 3,
    NormalStop = 4,
    /// Phase 1 reached the end of the stack without finding a handler.
    EndOfStack = 5,
    HandlerFound = 6,
    InstallContext = 7,
    ContinueUnwind = 8,
}

bitflags! {
    /// `_Unwind_Action`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnwindActions: c_int {
        const SEARCH_PHASE = 1;
        const CLEANUP_PHASE = 2;
        const HANDLER_FRAME = 4;
        const FORCE_UNWIND = 8;
        const END_OF_STACK = 16;
    }
}

/// Cleanup callback stored in the exception header, run by whichever
/// runtime ends up destroying the exception.
pub type UnwindExceptionCleanupFn =
    unsafe extern "C" fn(reason: UnwindReasonCode, exception: *mut UnwindException);

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        const UNWINDER_PRIVATE_DATA_SIZE: usize = 5;
    } else if #[cfg(target_arch = "arm")] {
        const UNWINDER_PRIVATE_DATA_SIZE: usize = 20;
    } else {
        const UNWINDER_PRIVATE_DATA_SIZE: usize = 2;
    }
}

/// `_Unwind_Exception`: the language-agnostic exception header.
#[repr(C, align(16))]
pub struct UnwindException {
    pub exception_class: u64,
    pub exception_cleanup: Option<UnwindExceptionCleanupFn>,
    pub private: [usize; UNWINDER_PRIVATE_DATA_SIZE],
}

impl UnwindException {
    pub const fn new(exception_class: u64) -> Self {
        Self {
            exception_class,
            exception_cleanup: None,
            private: [0; UNWINDER_PRIVATE_DATA_SIZE],
        }
    }
}

/// Opaque `_Unwind_Context`.
#[repr(C)]
pub struct UnwindContext {
    _private: [u8; 0],
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Registers receiving the exception pointer and the selector.
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 1); // RAX, RDX
    } else if #[cfg(target_arch = "x86")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 2); // EAX, EDX
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 1); // R0, R1 / X0, X1
    } else if #[cfg(any(target_arch = "mips", target_arch = "mips64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (4, 5); // A0, A1
    } else if #[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (3, 4); // R3, R4
    } else if #[cfg(any(target_arch = "riscv32", target_arch = "riscv64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (10, 11); // x10, x11
    } else if #[cfg(target_arch = "s390x")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (6, 7); // R6, R7
    } else if #[cfg(target_arch = "loongarch64")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (4, 5); // a0, a1
    } else {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 1);
    }
}

/// The per-frame view the personality routine needs.
pub trait FrameContext {
    /// Start of this frame's LSDA, or null if the frame has none.
    fn language_specific_data(&self) -> *const u8;

    /// An address inside the call instruction that left this frame.
    fn call_site_ip(&self) -> usize;

    /// Start address of the function owning this frame.
    fn region_start(&self) -> usize;

    fn text_rel_base(&self) -> usize;

    fn data_rel_base(&self) -> usize;

    /// Resume execution at `ip` when the context is installed.
    fn set_ip(&mut self, ip: usize);

    fn set_gr(&mut self, index: c_int, value: usize);
}

/// Something that can propagate an exception up the stack.
pub trait Unwinder {
    /// Starts a two-phase unwind. Only returns on failure.
    ///
    /// # Safety
    /// `exception` must be a live exception header.
    unsafe fn raise_exception(&self, exception: *mut UnwindException) -> UnwindReasonCode;

    /// Continues propagating an exception that was caught and rethrown.
    ///
    /// # Safety
    /// `exception` must be a live exception header.
    unsafe fn resume_or_rethrow(&self, exception: *mut UnwindException) -> UnwindReasonCode;
}

extern "C-unwind" {
    fn _Unwind_RaiseException(exception: *mut UnwindException) -> UnwindReasonCode;
    fn _Unwind_Resume_or_Rethrow(exception: *mut UnwindException) -> UnwindReasonCode;
}

extern "C" {
    fn _Unwind_GetLanguageSpecificData(context: *mut UnwindContext) -> *mut c_void;
    fn _Unwind_GetIPInfo(context: *mut UnwindContext, ip_before_insn: *mut c_int) -> usize;
    fn _Unwind_GetRegionStart(context: *mut UnwindContext) -> usize;
    fn _Unwind_GetTextRelBase(context: *mut UnwindContext) -> usize;
    fn _Unwind_GetDataRelBase(context: *mut UnwindContext) -> usize;
    fn _Unwind_SetIP(context: *mut UnwindContext, value: usize);
    fn _Unwind_SetGR(context: *mut UnwindContext, index: c_int, value: usize);
}

/// The platform unwinder.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUnwinder;

impl Unwinder for SystemUnwinder {
    unsafe fn raise_exception(&self, exception: *mut UnwindException) -> UnwindReasonCode {
        _Unwind_RaiseException(exception)
    }

    unsafe fn resume_or_rethrow(&self, exception: *mut UnwindException) -> UnwindReasonCode {
        _Unwind_Resume_or_Rethrow(exception)
    }
}

/// A frame handed to the personality routine by the platform unwinder.
pub struct SystemFrame {
    context: *mut UnwindContext,
}

impl SystemFrame {
    /// # Safety
    /// `context` must be the context passed to the current personality call.
    pub unsafe fn new(context: *mut UnwindContext) -> Self {
        Self { context }
    }
}

impl FrameContext for SystemFrame {
    fn language_specific_data(&self) -> *const u8 {
        unsafe { _Unwind_GetLanguageSpecificData(self.context) as *const u8 }
    }

    fn call_site_ip(&self) -> usize {
        let mut ip_before_insn = 0;
        let ip = unsafe { _Unwind_GetIPInfo(self.context, &mut ip_before_insn) };
        // The return address points past the call; step back into it
        if ip_before_insn == 0 {
            ip.wrapping_sub(1)
        } else {
            ip
        }
    }

    fn region_start(&self) -> usize {
        unsafe { _Unwind_GetRegionStart(self.context) }
    }

    fn text_rel_base(&self) -> usize {
        unsafe { _Unwind_GetTextRelBase(self.context) }
    }

    fn data_rel_base(&self) -> usize {
        unsafe { _Unwind_GetDataRelBase(self.context) }
    }

    fn set_ip(&mut self, ip: usize) {
        unsafe { _Unwind_SetIP(self.context, ip) }
    }

    fn set_gr(&mut self, index: c_int, value: usize) {
        unsafe { _Unwind_SetGR(self.context, index, value) }
    }
}
