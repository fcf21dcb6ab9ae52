//! One-time initialization guards for function-local statics.
//!
//! Each guarded static has a 64-bit guard word, zero-initialized by the
//! loader. The first byte (lowest address) is the "initialized" flag, which
//! compiled code tests inline before calling into the runtime; the upper
//! half-word is a spinlock held by the initializing thread.
//!
//! ```text
//! if (guard.first_byte == 0 && cxxrt_guard_acquire(&guard)) {
//!     try { construct(); } catch (...) { cxxrt_guard_abort(&guard); throw; }
//!     cxxrt_guard_release(&guard);
//! }
//! ```

use core::ffi::c_int;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

/// Initialized flag: the first byte of the word in memory order.
const INITIALIZED: u64 = u64::from_ne_bytes([1, 0, 0, 0, 0, 0, 0, 0]);
/// Lock bit, kept clear of the first byte.
const LOCKED: u64 = u64::from_ne_bytes([0, 0, 0, 0, 1, 0, 0, 0]);

/// Outcome of [`GuardWord::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The caller holds the lock and must run the initializer.
    Initialize,
    /// Another thread already completed initialization.
    AlreadyDone,
}

/// A guard word with Uninitialized -> Locked -> Initialized states.
///
/// There is no timeout: if the initializing thread never releases or aborts,
/// every other thread spins forever.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct GuardWord(AtomicU64);

impl GuardWord {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Views a compiler-emitted guard word.
    ///
    /// # Safety
    /// `word` must be valid, 8-byte aligned, and only accessed atomically
    /// for `'a`.
    pub unsafe fn from_ptr<'a>(word: *mut u64) -> &'a GuardWord {
        &*word.cast::<GuardWord>()
    }

    pub fn is_initialized(&self) -> bool {
        self.0.load(Ordering::Acquire) & INITIALIZED != 0
    }

    /// Acquires the lock unless initialization already happened.
    pub fn acquire(&self) -> Acquire {
        loop {
            let current = self.0.load(Ordering::Acquire);
            if current & INITIALIZED != 0 {
                return Acquire::AlreadyDone;
            }
            if current & LOCKED == 0
                && self
                    .0
                    .compare_exchange_weak(
                        current,
                        current | LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return Acquire::Initialize;
            }
            // Held by the initializing thread
            thread::yield_now();
        }
    }

    /// Marks initialization complete and drops the lock.
    pub fn release(&self) {
        self.0.store(INITIALIZED, Ordering::Release);
    }

    /// Drops the lock without marking completion, so a later caller retries.
    pub fn abort(&self) {
        self.0.fetch_and(!LOCKED, Ordering::Release);
    }
}

/// Returns 1 if the caller must run the initializer, 0 if it already ran.
///
/// # Safety
/// `guard` must point to a valid, 8-byte aligned guard word.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_guard_acquire")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_guard_acquire(guard: *mut u64) -> c_int {
    match GuardWord::from_ptr(guard).acquire() {
        Acquire::Initialize => 1,
        Acquire::AlreadyDone => 0,
    }
}

/// Called after the initializer completed.
///
/// # Safety
/// The caller must hold the lock from [`cxxrt_guard_acquire`].
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_guard_release")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_guard_release(guard: *mut u64) {
    GuardWord::from_ptr(guard).release();
}

/// Called when the initializer raised an exception.
///
/// # Safety
/// The caller must hold the lock from [`cxxrt_guard_acquire`].
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_guard_abort")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_guard_abort(guard: *mut u64) {
    GuardWord::from_ptr(guard).abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_acquire_release() {
        let guard = GuardWord::new();

        assert_eq!(guard.acquire(), Acquire::Initialize);
        assert!(!guard.is_initialized());
        guard.release();
        assert!(guard.is_initialized());
        assert_eq!(guard.acquire(), Acquire::AlreadyDone);
        assert_eq!(guard.acquire(), Acquire::AlreadyDone);
    }

    #[test]
    fn test_abort_allows_retry() {
        let guard = GuardWord::new();

        assert_eq!(guard.acquire(), Acquire::Initialize);
        guard.abort();
        assert!(!guard.is_initialized());
        assert_eq!(guard.acquire(), Acquire::Initialize);
        guard.release();
        assert_eq!(guard.acquire(), Acquire::AlreadyDone);
    }

    #[test]
    fn test_first_byte_marks_initialized() {
        let mut word = 0u64;
        unsafe {
            assert_eq!(cxxrt_guard_acquire(&mut word), 1);
            cxxrt_guard_release(&mut word);
            assert_eq!(cxxrt_guard_acquire(&mut word), 0);
        }
        assert_eq!(word.to_ne_bytes()[0], 1);
    }

    #[test]
    fn test_racing_threads_initialize_once() {
        const THREADS: usize = 8;
        let guard = GuardWord::new();
        let initializers = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    barrier.wait();
                    match guard.acquire() {
                        Acquire::Initialize => {
                            initializers.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            guard.release();
                        }
                        Acquire::AlreadyDone => {
                            // Only observable after release
                            assert!(guard.is_initialized());
                            done.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(initializers.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), THREADS - 1);
    }

    #[test]
    fn test_abort_hands_over_to_waiter() {
        let guard = GuardWord::new();
        assert_eq!(guard.acquire(), Acquire::Initialize);

        thread::scope(|s| {
            let waiter = s.spawn(|| guard.acquire());
            thread::sleep(std::time::Duration::from_millis(10));
            guard.abort();
            let outcome = waiter.join().unwrap();
            assert_eq!(outcome, Acquire::Initialize);
            guard.release();
        });

        assert!(guard.is_initialized());
    }
}
