//! The simple segment variant (spec §4.C): 256-cell arrays chained in a
//! singly-linked, append-only list. Cancelled cells are marked but never
//! physically removed — cheap to operate, trades memory for simplicity,
//! appropriate for workloads that don't expect heavy cancellation churn.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use super::{CancelOutcome, CellSlot, ClaimOutcome, ReleaseOutcome};
use crate::completion::CompletionCell;

pub(crate) const CAPACITY: usize = 256;

pub(crate) struct Segment {
    base: u64,
    cells: [CellSlot; CAPACITY],
    next: AtomicPtr<Segment>,
    /// Cells in this segment that reached `CANCELED` before release
    /// reached them (spec §3's per-segment cancellation count).
    /// Incremented by the cancellation handshake, decremented once
    /// release's resume loop passes over the slot (spec §4.E).
    cancelled: AtomicU32,
}

impl Segment {
    fn new(base: u64) -> Box<Self> {
        Box::new(Self {
            base,
            cells: std::array::from_fn(|_| CellSlot::empty()),
            next: AtomicPtr::new(std::ptr::null_mut()),
            cancelled: AtomicU32::new(0),
        })
    }

    pub(crate) fn mark_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::AcqRel);
    }

    /// Release's resume loop calls this once it passes over a cell it
    /// found already `CANCELED`, reconciling this segment's outstanding
    /// cancellation count (spec §4.E's "decrement the cancellation
    /// counter (simple variant)").
    pub(crate) fn reconcile_cancelled(&self) {
        self.cancelled.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The append-only chain plus the list's two independent cursors (spec
/// §3's `enqueueHead`/`dequeueHead`): `enqueue_head` is where the next
/// waiter's lookup starts, `dequeue_head` is where the next release's
/// lookup starts. Each only ever advances forward along `next`; `tail`
/// is purely the shared append point, never a search start, so a
/// release resuming an index behind the current tail no longer
/// underflows trying to compute an offset against a segment ahead of it.
pub(crate) struct SegmentList {
    head: AtomicPtr<Segment>,
    tail: AtomicPtr<Segment>,
    enqueue_head: AtomicPtr<Segment>,
    dequeue_head: AtomicPtr<Segment>,
    enqueue_idx: AtomicU64,
    resume_idx: AtomicU64,
}

// Safety: every `Segment` reachable through `head`/`tail` is either
// exclusively owned by the thread appending it (before publication) or
// shared read-only / through the lock-free `CellSlot` protocol after.
unsafe impl Send for SegmentList {}
unsafe impl Sync for SegmentList {}

impl SegmentList {
    pub(crate) fn new() -> Self {
        let first = Box::into_raw(Segment::new(0));
        Self {
            head: AtomicPtr::new(first),
            tail: AtomicPtr::new(first),
            enqueue_head: AtomicPtr::new(first),
            dequeue_head: AtomicPtr::new(first),
            enqueue_idx: AtomicU64::new(0),
            resume_idx: AtomicU64::new(0),
        }
    }

    /// Reserves the next waiter index and returns the segment + local
    /// offset to install a completion cell into.
    pub(crate) fn enqueue_slot(&self) -> (&Segment, usize) {
        let idx = self.enqueue_idx.fetch_add(1, Ordering::AcqRel);
        self.locate(&self.enqueue_head, idx)
    }

    /// Reserves the next index a release resumes from. Call is only valid
    /// once the counter protocol has already confirmed a waiter is owed a
    /// resume.
    pub(crate) fn resume_slot(&self) -> (&Segment, usize) {
        let idx = self.resume_idx.fetch_add(1, Ordering::AcqRel);
        self.locate(&self.dequeue_head, idx)
    }

    /// Locates the segment containing `idx`, starting from `cursor`'s
    /// current position rather than the list's furthest-created tail —
    /// the two cursors progress independently, so a release resuming an
    /// index well behind the enqueue side's tail must not start its
    /// search there (spec §4.C's `locate(start, id)`).
    fn locate(&self, cursor: &AtomicPtr<Segment>, idx: u64) -> (&Segment, usize) {
        let mut cur = cursor.load(Ordering::Acquire);
        // Two operations on the same side can finish their own
        // `fetch_add` in one order but run `locate` in the other; a
        // slower thread holding a smaller `idx` can find `cursor` has
        // already been advanced past its segment by a faster one. The
        // simple variant never frees a segment, so restarting from the
        // fixed first segment is always safe and always terminates.
        if idx < unsafe { &*cur }.base {
            cur = self.head.load(Ordering::Acquire);
        }
        loop {
            // Safety: every segment published through `head`/`next` lives
            // for the lifetime of the list; the simple variant never
            // frees a segment.
            let seg = unsafe { &*cur };
            if idx >= seg.base && idx < seg.base + CAPACITY as u64 {
                self.advance(cursor, cur);
                return (seg, (idx - seg.base) as usize);
            }
            let next = seg.next.load(Ordering::Acquire);
            if !next.is_null() {
                cur = next;
                continue;
            }
            let new_seg = Box::into_raw(Segment::new(seg.base + CAPACITY as u64));
            match seg.next.compare_exchange(
                std::ptr::null_mut(),
                new_seg,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(target: "segsem::segment", base = seg.base + CAPACITY as u64, "appended simple segment");
                    let _ = self.tail.compare_exchange(
                        cur,
                        new_seg,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    cur = new_seg;
                }
                Err(actual_next) => {
                    tracing::trace!(target: "segsem::segment", "lost the race to append a simple segment");
                    // Safety: `new_seg` was never published anywhere else.
                    drop(unsafe { Box::from_raw(new_seg) });
                    cur = actual_next;
                }
            }
        }
    }

    /// Moves `cursor` forward to `target`, never backward: a slower
    /// racer that located an earlier segment than a cursor already
    /// advanced to must not undo the faster racer's progress.
    fn advance(&self, cursor: &AtomicPtr<Segment>, target: *mut Segment) {
        let target_base = unsafe { &*target }.base;
        let mut cur = cursor.load(Ordering::Acquire);
        loop {
            if cur == target {
                return;
            }
            if unsafe { &*cur }.base >= target_base {
                return;
            }
            match cursor.compare_exchange_weak(cur, target, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Drop for SegmentList {
    fn drop(&mut self) {
        // Safety: `Drop` runs with exclusive access to the whole list.
        let mut curr = *self.head.get_mut();
        while !curr.is_null() {
            let seg = unsafe { Box::from_raw(curr) };
            curr = seg.next.load(Ordering::Relaxed);
        }
    }
}

impl Segment {
    pub(crate) fn claim_for_waiter(
        &self,
        local_idx: usize,
        cell: std::ptr::NonNull<CompletionCell>,
    ) -> ClaimOutcome {
        self.cells[local_idx].try_claim_for_waiter(cell)
    }

    pub(crate) fn claim_for_release(&self, local_idx: usize) -> ReleaseOutcome {
        self.cells[local_idx].try_claim_for_release()
    }

    pub(crate) fn try_cancel(
        &self,
        local_idx: usize,
        expected_cell: std::ptr::NonNull<CompletionCell>,
    ) -> CancelOutcome {
        self.cells[local_idx].try_cancel(expected_cell)
    }
}
