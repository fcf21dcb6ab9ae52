//! Per-thread exception handling state.
//!
//! Each thread owns a stack of caught exceptions (linked through the
//! envelopes themselves), an uncaught-exception counter, optional
//! terminate/unexpected hook overrides and the number of emergency buffers it
//! currently holds. Nothing here is shared between threads.

use core::cell::{Cell, RefCell};
use core::ffi::c_uint;
use core::ptr;

use log::debug;

use crate::error::TerminateReason;
use crate::exceptions::Envelope;
use crate::handlers::{terminate_with, Handler};
use crate::memory;
use crate::unwind::{UnwindException, UnwindReasonCode};

/// The ABI-visible part of the thread state, returned by
/// `__cxa_get_globals`.
#[repr(C)]
pub struct EhGlobals {
    /// Innermost caught exception; older ones follow through `Envelope::next`.
    pub caught_exceptions: Cell<*mut Envelope>,
    pub uncaught_exceptions: Cell<c_uint>,
}

impl EhGlobals {
    const fn new() -> Self {
        Self {
            caught_exceptions: Cell::new(ptr::null_mut()),
            uncaught_exceptions: Cell::new(0),
        }
    }

    /// Frees every envelope still on the handler stack, oldest first.
    fn free_caught(&self) {
        let mut chain = Vec::new();
        let mut current = self.caught_exceptions.replace(ptr::null_mut());
        while !current.is_null() {
            chain.push(current);
            current = unsafe { (*current).next };
        }
        if !chain.is_empty() {
            debug!("freeing {} unfinished caught exception(s)", chain.len());
        }
        for envelope in chain.into_iter().rev() {
            unsafe { memory::free_envelope(envelope) };
        }
    }
}

/// A foreign exception inside one of our catch blocks.
#[derive(Debug, Clone, Copy)]
pub struct ForeignCatch {
    pub header: *mut UnwindException,
    /// Innermost native exception when the catch began; the foreign one is
    /// innermost while this is still the head of the handler stack.
    pub native_head: *mut Envelope,
    pub rethrown: bool,
}

impl ForeignCatch {
    /// Destroys the exception through its own runtime's cleanup callback.
    ///
    /// # Safety
    /// `header` must be live and not referenced afterwards.
    pub unsafe fn delete(self) {
        if let Some(cleanup) = (*self.header).exception_cleanup {
            cleanup(UnwindReasonCode::ForeignExceptionCaught, self.header);
        }
    }
}

pub struct ThreadState {
    globals: EhGlobals,
    foreign_caught: RefCell<Vec<ForeignCatch>>,
    terminate_hook: Cell<Option<Handler>>,
    unexpected_hook: Cell<Option<Handler>>,
    emergency_buffers_held: Cell<u32>,
}

impl ThreadState {
    const fn new() -> Self {
        Self {
            globals: EhGlobals::new(),
            foreign_caught: RefCell::new(Vec::new()),
            terminate_hook: Cell::new(None),
            unexpected_hook: Cell::new(None),
            emergency_buffers_held: Cell::new(0),
        }
    }

    pub fn push_foreign(&self, header: *mut UnwindException) {
        self.foreign_caught.borrow_mut().push(ForeignCatch {
            header,
            native_head: self.caught_head(),
            rethrown: false,
        });
    }

    /// The innermost caught exception if it is a foreign one.
    pub fn innermost_foreign(&self) -> Option<ForeignCatch> {
        let foreign = self.foreign_caught.borrow();
        let top = foreign.last()?;
        (top.native_head == self.caught_head()).then_some(*top)
    }

    pub fn mark_foreign_rethrown(&self) {
        if let Some(top) = self.foreign_caught.borrow_mut().last_mut() {
            top.rethrown = true;
        }
    }

    pub fn pop_foreign(&self) -> Option<ForeignCatch> {
        self.foreign_caught.borrow_mut().pop()
    }

    pub fn globals(&self) -> &EhGlobals {
        &self.globals
    }

    pub fn caught_head(&self) -> *mut Envelope {
        self.globals.caught_exceptions.get()
    }

    /// Pushes `envelope` onto the handler stack.
    ///
    /// # Safety
    /// `envelope` must be live and not already on the stack.
    pub unsafe fn push_caught(&self, envelope: *mut Envelope) {
        (*envelope).next = self.globals.caught_exceptions.get();
        self.globals.caught_exceptions.set(envelope);
    }

    /// Pops the innermost caught exception.
    pub fn pop_caught(&self) -> Option<*mut Envelope> {
        let head = self.globals.caught_exceptions.get();
        if head.is_null() {
            return None;
        }
        unsafe {
            self.globals.caught_exceptions.set((*head).next);
            (*head).next = ptr::null_mut();
        }
        Some(head)
    }

    pub fn uncaught(&self) -> c_uint {
        self.globals.uncaught_exceptions.get()
    }

    pub fn increment_uncaught(&self) {
        let count = &self.globals.uncaught_exceptions;
        count.set(count.get().wrapping_add(1));
    }

    pub fn decrement_uncaught(&self) {
        let count = &self.globals.uncaught_exceptions;
        count.set(count.get().saturating_sub(1));
    }

    pub fn terminate_hook(&self) -> Option<Handler> {
        self.terminate_hook.get()
    }

    pub fn set_terminate_hook(&self, hook: Option<Handler>) -> Option<Handler> {
        self.terminate_hook.replace(hook)
    }

    pub fn unexpected_hook(&self) -> Option<Handler> {
        self.unexpected_hook.get()
    }

    pub fn set_unexpected_hook(&self, hook: Option<Handler>) -> Option<Handler> {
        self.unexpected_hook.replace(hook)
    }

    pub fn emergency_buffers_held(&self) -> &Cell<u32> {
        &self.emergency_buffers_held
    }

    /// Frees the handler stack and clears the hook overrides.
    pub fn reset(&self) {
        self.free_foreign();
        self.globals.free_caught();
        self.globals.uncaught_exceptions.set(0);
        self.terminate_hook.set(None);
        self.unexpected_hook.set(None);
    }

    fn free_foreign(&self) {
        let foreign = self.foreign_caught.take();
        for caught in foreign.into_iter().rev().filter(|caught| !caught.rethrown) {
            unsafe { caught.delete() };
        }
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.free_foreign();
        self.globals.free_caught();
    }
}

thread_local! {
    static STATE: ThreadState = const { ThreadState::new() };

    // No destructor, so it stays readable for the whole of thread exit.
    static REVIVED: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
}

/// The live state: the regular one, or the one recreated after it was
/// destroyed.
fn live() -> Option<*const ThreadState> {
    if let Ok(state) = STATE.try_with(|state| state as *const ThreadState) {
        return Some(state);
    }
    REVIVED
        .try_with(Cell::get)
        .ok()
        .filter(|state| !state.is_null())
}

/// Recreates the state for code running after the thread's state was
/// destroyed, such as another thread-local's destructor that throws.
///
/// The revived state is never freed; exceptions still caught in it when the
/// thread finally exits are leaked.
fn revive() -> Option<*const ThreadState> {
    REVIVED
        .try_with(|revived| {
            if revived.get().is_null() {
                debug!("thread state used after teardown; recreating it");
                revived.set(Box::into_raw(Box::new(ThreadState::new())));
            }
            revived.get()
        })
        .ok()
}

/// Runs `f` with the calling thread's state, recreating it if it was
/// already destroyed during thread exit.
pub fn with<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    match live().or_else(revive) {
        // SAFETY: both states live until the thread exits, and only this
        // thread can reach them
        Some(state) => f(unsafe { &*state }),
        None => terminate_with(TerminateReason::ThreadStateUnavailable),
    }
}

/// Like [`with`], but returns `None` instead of recreating a destroyed
/// state.
pub fn try_with<R>(f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    live().map(|state| f(unsafe { &*state }))
}

/// Returns the calling thread's ABI globals record.
///
/// The pointer stays valid until the thread exits.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_get_globals")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_get_globals() -> *mut EhGlobals {
    try_with(|state| state.globals() as *const EhGlobals as *mut EhGlobals)
        .unwrap_or(ptr::null_mut())
}

/// Same as [`cxxrt_get_globals`]; the state is created on first access
/// either way.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_get_globals_fast")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_get_globals_fast() -> *mut EhGlobals {
    cxxrt_get_globals()
}
