//! Tiered completion-cell pool (spec §4.A / §5): thread-local slot, then a
//! small per-core array of speculative CAS slots, then a fresh allocation.
//! The point is to keep the fast path (no contention, no prior cancellation)
//! free of `Box`/`Arc` churn while never blocking on an exhausted pool —
//! falling through to `Box::leak`-free heap allocation is always correct,
//! just slower.

use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::completion::CompletionCell;

/// Per-core speculative slots. 32 is a deliberately small, fixed width —
/// this is a scratch cache, not a sized-to-parallelism pool; misses just
/// fall through to allocation.
const SHARED_SLOTS: usize = 32;

struct SharedPool {
    slots: [AtomicPtr<CompletionCell>; SHARED_SLOTS],
}

impl SharedPool {
    const fn new() -> Self {
        const INIT: AtomicPtr<CompletionCell> = AtomicPtr::new(std::ptr::null_mut());
        Self {
            slots: [INIT; SHARED_SLOTS],
        }
    }

    fn take(&self) -> Option<NonNull<CompletionCell>> {
        for slot in &self.slots {
            let p = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if let Some(nn) = NonNull::new(p) {
                return Some(nn);
            }
        }
        None
    }

    /// Tries to park `cell` in an empty slot; returns it back if every slot
    /// is occupied, so the caller can free it instead.
    fn put(&self, cell: NonNull<CompletionCell>) -> Option<NonNull<CompletionCell>> {
        for slot in &self.slots {
            if slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    cell.as_ptr(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return None;
            }
        }
        Some(cell)
    }
}

static SHARED: SharedPool = SharedPool::new();

thread_local! {
    static LOCAL_SLOT: Cell<*mut CompletionCell> = const { Cell::new(std::ptr::null_mut()) };
}

/// A completion cell rented from the pool. Returns itself to the pool on
/// drop once `consume` has run; the caller is responsible for calling
/// `reset_and_clear` (via `return_to_pool`) before the handle is dropped,
/// since a cell still referenced by a segment slot must outlive its rental.
pub(crate) struct PooledCell {
    ptr: NonNull<CompletionCell>,
}

// Safety: `CompletionCell` is itself `Sync` (all interior mutability is
// CAS-guarded); a `PooledCell` moving to another thread is exactly the
// blocking/async handoff this pool exists to support.
unsafe impl Send for PooledCell {}

impl PooledCell {
    pub(crate) fn rent() -> Self {
        if let Some(ptr) = LOCAL_SLOT.with(|slot| {
            let p = slot.replace(std::ptr::null_mut());
            NonNull::new(p)
        }) {
            tracing::trace!(target: "segsem::pool", tier = "thread_local", "rented completion cell");
            return Self { ptr };
        }
        if let Some(ptr) = SHARED.take() {
            tracing::trace!(target: "segsem::pool", tier = "shared", "rented completion cell");
            return Self { ptr };
        }
        tracing::trace!(target: "segsem::pool", tier = "fresh", "allocated new completion cell");
        let boxed = Box::new(CompletionCell::new());
        Self {
            ptr: NonNull::new(Box::into_raw(boxed))
                .unwrap_or_else(|| crate::error::fail_fast::resource_exhausted("completion cell")),
        }
    }

    pub(crate) fn as_ref(&self) -> &CompletionCell {
        // Safety: a `PooledCell` uniquely owns its pointee until `recycle`
        // or `leak` consumes `self`; no other alias exists.
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn ptr(&self) -> NonNull<CompletionCell> {
        self.ptr
    }

    /// Wraps a cell already shared with a segment slot (i.e. a reference
    /// obtained via a raw pointer published there) back into a rental, for
    /// the consuming side to return it once done.
    ///
    /// Safety: `ptr` must point to a live `CompletionCell` originally
    /// produced by `PooledCell::rent`/`into_raw`, not currently aliased by
    /// another `PooledCell`.
    pub(crate) unsafe fn from_raw(ptr: NonNull<CompletionCell>) -> Self {
        Self { ptr }
    }

    /// Leaks the rental into a raw pointer for publication into a segment
    /// slot. Must be paired with an eventual `from_raw` + `recycle` (or the
    /// process exiting) to avoid leaking memory — acceptable here since
    /// every segment slot that receives a cell also eventually recycles it
    /// on consume or on segment teardown.
    pub(crate) fn into_raw(self) -> NonNull<CompletionCell> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }

    /// Resets the cell and returns it to the pool tiers.
    pub(crate) fn recycle(self) {
        self.as_ref().reset_and_clear();
        let ptr = self.ptr;
        std::mem::forget(self);

        let leftover = LOCAL_SLOT.with(|slot| {
            if slot.get().is_null() {
                slot.set(ptr.as_ptr());
                None
            } else {
                Some(ptr)
            }
        });
        let Some(leftover) = leftover else { return };
        if let Some(unplaced) = SHARED.put(leftover) {
            // Safety: `unplaced` was produced by `Box::into_raw` in `rent`
            // (directly or through a chain of pool round-trips) and is not
            // referenced anywhere else once every tier rejected it.
            drop(unsafe { Box::from_raw(unplaced.as_ptr()) });
        }
    }
}

impl Drop for PooledCell {
    fn drop(&mut self) {
        // A `PooledCell` dropped without an explicit `recycle`/`into_raw`
        // call only happens on an early-return error path before the cell
        // was ever shared; free it directly rather than resetting state
        // nobody else observed.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_then_recycle_then_rent_reuses_memory() {
        let a = PooledCell::rent();
        let addr = a.ptr().as_ptr() as usize;
        a.recycle();
        let b = PooledCell::rent();
        assert_eq!(b.ptr().as_ptr() as usize, addr);
        b.recycle();
    }

    #[test]
    fn into_raw_and_from_raw_round_trip() {
        let a = PooledCell::rent();
        let raw = a.into_raw();
        let b = unsafe { PooledCell::from_raw(raw) };
        b.recycle();
    }
}
