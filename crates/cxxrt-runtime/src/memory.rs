//! Exception envelope allocation.
//!
//! Envelopes come from the C heap. When the heap is exhausted, a small
//! static pool keeps `throw` working: 16 slots of 1 KiB, at most 4 held by
//! any one thread. A thread finding every slot taken waits until another
//! thread frees one.

use core::cell::{Cell, UnsafeCell};
use core::ffi::c_void;
use core::mem;
use core::ptr;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use log::warn;

use crate::error::{AllocError, TerminateReason};
use crate::exceptions::Envelope;
use crate::handlers::terminate_with;
use crate::thread_state;

pub const EMERGENCY_SLOT_SIZE: usize = 1024;
pub const EMERGENCY_SLOTS: usize = 16;
pub const MAX_EMERGENCY_PER_THREAD: u32 = 4;

/// The general-purpose allocator envelopes are taken from.
pub trait HeapAllocator {
    /// Returns `size` zeroed bytes, or null.
    fn allocate_zeroed(&self, size: usize) -> *mut u8;

    /// # Safety
    /// `ptr` must come from [`HeapAllocator::allocate_zeroed`] on this
    /// allocator.
    unsafe fn release(&self, ptr: *mut u8);
}

/// `calloc` / `free`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHeap;

impl HeapAllocator for SystemHeap {
    fn allocate_zeroed(&self, size: usize) -> *mut u8 {
        unsafe { libc::calloc(1, size).cast() }
    }

    unsafe fn release(&self, ptr: *mut u8) {
        libc::free(ptr.cast());
    }
}

#[repr(C, align(16))]
struct Slot(UnsafeCell<[u8; EMERGENCY_SLOT_SIZE]>);

/// Fixed-capacity fallback for when the heap fails.
///
/// Slots are handed out zeroed: they start zeroed and are cleared again on
/// release.
pub struct EmergencyPool {
    slots: [Slot; EMERGENCY_SLOTS],
    in_use: Mutex<[bool; EMERGENCY_SLOTS]>,
    available: Condvar,
}

// Slot contents are only touched by the thread that holds the slot.
unsafe impl Sync for EmergencyPool {}

impl EmergencyPool {
    pub const fn new() -> Self {
        const EMPTY: Slot = Slot(UnsafeCell::new([0; EMERGENCY_SLOT_SIZE]));
        Self {
            slots: [EMPTY; EMERGENCY_SLOTS],
            in_use: Mutex::new([false; EMERGENCY_SLOTS]),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [bool; EMERGENCY_SLOTS]> {
        self.in_use.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        self.slots[index].0.get().cast()
    }

    fn slot_index(&self, ptr: *const u8) -> Option<usize> {
        (0..EMERGENCY_SLOTS).find(|&index| self.slot_ptr(index).cast_const() == ptr)
    }

    /// Takes a slot for a `size`-byte request.
    ///
    /// `held` is the calling thread's slot count. Blocks while every slot is
    /// in use, retrying `heap` each time it wakes, so the returned pointer
    /// may be a heap allocation after all.
    pub fn allocate<H: HeapAllocator>(
        &self,
        size: usize,
        held: &Cell<u32>,
        heap: &H,
    ) -> Result<*mut u8, AllocError> {
        if size > EMERGENCY_SLOT_SIZE {
            return Err(AllocError::ExceedsSlot(size));
        }
        if held.get() >= MAX_EMERGENCY_PER_THREAD {
            return Err(AllocError::ThreadLimit(held.get()));
        }

        let mut in_use = self.lock();
        loop {
            let memory = heap.allocate_zeroed(size);
            if !memory.is_null() {
                return Ok(memory);
            }
            if let Some(index) = in_use.iter().position(|used| !used) {
                in_use[index] = true;
                held.set(held.get() + 1);
                return Ok(self.slot_ptr(index));
            }
            in_use = self
                .available
                .wait(in_use)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether `ptr` is the start of one of this pool's slots.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.slot_index(ptr).is_some()
    }

    /// Returns a slot to the pool and wakes one waiter. Returns `false` if
    /// `ptr` is not a slot of this pool.
    ///
    /// # Safety
    /// The slot must no longer be referenced.
    pub unsafe fn release(&self, ptr: *mut u8, held: Option<&Cell<u32>>) -> bool {
        let Some(index) = self.slot_index(ptr) else {
            return false;
        };
        ptr::write_bytes(ptr, 0, EMERGENCY_SLOT_SIZE);
        self.lock()[index] = false;
        self.available.notify_one();
        if let Some(held) = held {
            held.set(held.get().saturating_sub(1));
        }
        true
    }

    /// Number of slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.lock().iter().filter(|used| **used).count()
    }
}

impl Default for EmergencyPool {
    fn default() -> Self {
        Self::new()
    }
}

pub static EMERGENCY_POOL: EmergencyPool = EmergencyPool::new();

/// Terminates if a destructor unwinds out of envelope cleanup.
struct TerminateOnUnwind;

impl Drop for TerminateOnUnwind {
    fn drop(&mut self) {
        terminate_with(TerminateReason::DestructorUnwound);
    }
}

/// Allocates a zeroed envelope with room for a `payload_size`-byte value.
pub fn allocate_envelope_in<H: HeapAllocator>(
    payload_size: usize,
    pool: &EmergencyPool,
    heap: &H,
) -> Result<*mut Envelope, AllocError> {
    let total = payload_size
        .checked_add(mem::size_of::<Envelope>())
        .ok_or(AllocError::TooLarge(payload_size))?;

    let memory = heap.allocate_zeroed(total);
    if !memory.is_null() {
        return Ok(memory.cast());
    }

    warn!("heap exhausted allocating {total}-byte exception, using emergency pool");
    thread_state::with(|state| pool.allocate(total, state.emergency_buffers_held(), heap))
        .map(|memory| memory.cast())
}

/// Destroys the thrown value and releases the envelope's memory.
///
/// # Safety
/// `envelope` must come from [`allocate_envelope_in`] with the same pool and
/// heap, and must not be used afterwards.
pub unsafe fn free_envelope_in<H: HeapAllocator>(
    envelope: *mut Envelope,
    pool: &EmergencyPool,
    heap: &H,
) {
    if let Some(destructor) = (*envelope).destructor {
        let guard = TerminateOnUnwind;
        destructor(Envelope::payload(envelope));
        mem::forget(guard);
    }

    let memory = envelope.cast::<u8>();
    let pooled = thread_state::try_with(|state| {
        pool.release(memory, Some(state.emergency_buffers_held()))
    })
    .unwrap_or_else(|| pool.release(memory, None));
    if !pooled {
        heap.release(memory);
    }
}

/// [`free_envelope_in`] with the process-wide pool and the C heap.
///
/// # Safety
/// See [`free_envelope_in`].
pub unsafe fn free_envelope(envelope: *mut Envelope) {
    free_envelope_in(envelope, &EMERGENCY_POOL, &SystemHeap);
}

/// Allocates storage for a thrown value and returns its address.
///
/// Terminates if neither the heap nor the emergency pool can satisfy the
/// request.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_allocate_exception")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub extern "C" fn cxxrt_allocate_exception(thrown_size: usize) -> *mut c_void {
    match allocate_envelope_in(thrown_size, &EMERGENCY_POOL, &SystemHeap) {
        Ok(envelope) => unsafe { Envelope::payload(envelope) },
        Err(err) => {
            warn!("exception allocation failed: {err}");
            terminate_with(TerminateReason::OutOfMemory { size: thrown_size })
        }
    }
}

/// Frees a value allocated by [`cxxrt_allocate_exception`].
///
/// # Safety
/// `thrown` must come from [`cxxrt_allocate_exception`] and not have been
/// thrown, or be the payload of an exception no one references any more.
#[cfg_attr(feature = "itanium-abi", export_name = "__cxa_free_exception")]
#[cfg_attr(not(feature = "itanium-abi"), no_mangle)]
pub unsafe extern "C" fn cxxrt_free_exception(thrown: *mut c_void) {
    if thrown.is_null() {
        return;
    }
    free_envelope(Envelope::from_payload(thrown));
}
