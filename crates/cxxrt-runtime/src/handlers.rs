//! Terminate and unexpected hooks.
//!
//! Hooks are process-wide by default. After
//! [`set_use_thread_local_handlers`]`(true)` the setters store per-thread
//! overrides instead. Lookups prefer the calling thread's override whenever
//! one is stored, even after the switch is turned back off.
//! An unset hook means the built-in one, which aborts.

use core::ffi::c_int;
use core::mem;
use core::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use log::error;

use crate::error::TerminateReason;
use crate::thread_state;

/// A terminate or unexpected hook.
pub type Handler = unsafe extern "C-unwind" fn();

static TERMINATE_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static UNEXPECTED_HANDLER: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());
static THREAD_LOCAL_HANDLERS: AtomicBool = AtomicBool::new(false);

unsafe extern "C-unwind" fn default_handler() {
    std::process::abort();
}

fn load(slot: &AtomicPtr<()>) -> Handler {
    let raw = slot.load(Ordering::Acquire);
    if raw.is_null() {
        default_handler
    } else {
        // Only ever stored from a `Handler`
        unsafe { mem::transmute::<*mut (), Handler>(raw) }
    }
}

fn swap(slot: &AtomicPtr<()>, handler: Option<Handler>) -> Handler {
    let raw = handler.map_or(ptr::null_mut(), |handler| handler as *mut ());
    let previous = slot.swap(raw, Ordering::AcqRel);
    if previous.is_null() {
        default_handler
    } else {
        unsafe { mem::transmute::<*mut (), Handler>(previous) }
    }
}

pub fn use_thread_local_handlers() -> bool {
    THREAD_LOCAL_HANDLERS.load(Ordering::Relaxed)
}

/// Switches the hook setters between process-wide and per-thread storage.
pub fn set_use_thread_local_handlers(enabled: bool) {
    THREAD_LOCAL_HANDLERS.store(enabled, Ordering::Relaxed);
}

/// Installs a terminate hook, returning the one it replaces. `None` restores
/// the built-in hook.
pub fn set_terminate(handler: Option<Handler>) -> Handler {
    if use_thread_local_handlers() {
        let previous = thread_state::with(|state| state.set_terminate_hook(handler));
        return previous.unwrap_or_else(|| load(&TERMINATE_HANDLER));
    }
    swap(&TERMINATE_HANDLER, handler)
}

/// Installs an unexpected hook, returning the one it replaces.
pub fn set_unexpected(handler: Option<Handler>) -> Handler {
    if use_thread_local_handlers() {
        let previous = thread_state::with(|state| state.set_unexpected_hook(handler));
        return previous.unwrap_or_else(|| load(&UNEXPECTED_HANDLER));
    }
    swap(&UNEXPECTED_HANDLER, handler)
}

/// The terminate hook in effect for the calling thread.
pub fn terminate_handler() -> Handler {
    if let Some(Some(handler)) = thread_state::try_with(|state| state.terminate_hook()) {
        return handler;
    }
    load(&TERMINATE_HANDLER)
}

/// The unexpected hook in effect for the calling thread.
pub fn unexpected_handler() -> Handler {
    if let Some(Some(handler)) = thread_state::try_with(|state| state.unexpected_hook()) {
        return handler;
    }
    load(&UNEXPECTED_HANDLER)
}

/// Puts both process-wide hooks back to the built-in one.
pub fn restore_defaults() {
    swap(&TERMINATE_HANDLER, None);
    swap(&UNEXPECTED_HANDLER, None);
    set_use_thread_local_handlers(false);
}

/// Runs `handler` as a terminate hook. A hook that returns is followed by
/// an abort.
pub fn terminate_via(handler: Handler) -> ! {
    unsafe { handler() };
    std::process::abort()
}

/// Runs the terminate hook.
pub fn terminate() -> ! {
    terminate_via(terminate_handler())
}

/// Reports `reason` on stderr and terminates.
#[cold]
pub fn terminate_with(reason: TerminateReason) -> ! {
    terminate_with_handler(reason, terminate_handler())
}

/// Reports `reason` on stderr and terminates through `handler`.
#[cold]
pub fn terminate_with_handler(reason: TerminateReason, handler: Handler) -> ! {
    error!("terminating: {reason}");
    eprintln!("terminate called: {reason}");
    terminate_via(handler)
}

/// Runs `handler` as an unexpected hook, terminating if it returns.
pub fn unexpected_via(handler: Handler) -> ! {
    unsafe { handler() };
    terminate_with(TerminateReason::UnexpectedReturned)
}

/// Runs the unexpected hook.
pub fn unexpected() -> ! {
    unexpected_via(unexpected_handler())
}

/// Number of exceptions thrown but not yet caught on the calling thread.
pub fn uncaught_exceptions() -> c_int {
    thread_state::try_with(|state| state.uncaught())
        .map_or(0, |count| c_int::try_from(count).unwrap_or(c_int::MAX))
}

pub fn uncaught_exception() -> bool {
    uncaught_exceptions() != 0
}

/// `std::set_terminate`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt13set_terminatePFvvE")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_set_terminate(handler: Option<Handler>) -> Handler {
    set_terminate(handler)
}

/// `std::set_unexpected`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt14set_unexpectedPFvvE")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_set_unexpected(handler: Option<Handler>) -> Handler {
    set_unexpected(handler)
}

/// `std::terminate`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt9terminatev")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C-unwind" fn cxxrt_terminate() -> ! {
    terminate()
}

/// `std::unexpected`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt10unexpectedv")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C-unwind" fn cxxrt_unexpected() -> ! {
    unexpected()
}

/// `std::uncaught_exception`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt18uncaught_exceptionv")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_uncaught_exception() -> bool {
    uncaught_exception()
}

/// `std::uncaught_exceptions`.
#[cfg_attr(feature = "itanium-abi", export_name = "_ZSt19uncaught_exceptionsv")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_uncaught_exceptions() -> c_int {
    uncaught_exceptions()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    unsafe extern "C-unwind" fn first() {}
    unsafe extern "C-unwind" fn second() {}

    fn same(a: Handler, b: Handler) -> bool {
        a as usize == b as usize
    }

    // Hook storage is process-wide, so every case runs in this one test.
    #[test]
    fn test_hook_registration() {
        // Global hooks
        assert!(same(set_terminate(Some(first)), default_handler));
        assert!(same(terminate_handler(), first));
        assert!(same(set_terminate(Some(second)), first));
        let seen = thread::spawn(|| terminate_handler() as usize).join().unwrap();
        assert_eq!(seen, second as usize);
        assert!(same(set_terminate(None), second));
        assert!(same(terminate_handler(), default_handler));

        assert!(same(set_unexpected(Some(first)), default_handler));
        assert!(same(unexpected_handler(), first));

        // Per-thread overrides shadow the global hook on this thread only
        set_use_thread_local_handlers(true);
        assert!(same(set_unexpected(Some(second)), first));
        assert!(same(unexpected_handler(), second));
        let seen = thread::spawn(|| unexpected_handler() as usize).join().unwrap();
        assert_eq!(seen, first as usize);

        // Turning the switch off leaves this thread's override in force
        set_use_thread_local_handlers(false);
        assert!(same(unexpected_handler(), second));
        assert!(same(terminate_handler(), default_handler));
        thread_state::with(|state| state.set_terminate_hook(Some(first)));
        assert!(same(terminate_handler(), first));
        let seen = thread::spawn(|| terminate_handler() as usize).join().unwrap();
        assert_eq!(seen, default_handler as usize);

        thread_state::with(|state| state.reset());
        restore_defaults();
        assert!(!use_thread_local_handlers());
        assert!(same(unexpected_handler(), default_handler));
        assert!(same(terminate_handler(), default_handler));
    }

    #[test]
    fn test_uncaught_queries_follow_thread_state() {
        assert!(!uncaught_exception());
        thread_state::with(|state| state.increment_uncaught());
        assert_eq!(uncaught_exceptions(), 1);
        assert!(cxxrt_uncaught_exception());
        thread_state::with(|state| state.decrement_uncaught());
        assert_eq!(cxxrt_uncaught_exceptions(), 0);
    }
}
