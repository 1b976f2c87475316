//! The removable segment variant (spec §4.C/§4.F): small (16-cell),
//! doubly-linked segments that are physically unlinked and freed once
//! every one of their cells has been individually cancelled. A segment
//! with even one granted cell is never unlinked — spec's testable
//! property #6 reserves removal strictly for fully-cancelled segments,
//! not "every waiter here is done one way or another".
//!
//! Every segment carries one packed `AtomicU32` (spec §3/§4.F): the low
//! 16 bits count cancelled cells, the high 16 bits count outstanding
//! cursor references (bumped when `enqueue_head`/`dequeue_head` advances
//! onto a segment, dropped when it advances past). A segment unlinks
//! only once both halves hit their target in the same packed read —
//! `CAPACITY` cancelled, `0` referencing cursors, not the tail — which is
//! exactly the spec's trigger and nothing more.
//!
//! That packed word decides *when* to unlink; it does not by itself make
//! following a `prev`/`next` pointer into a concurrently-unlinked segment
//! safe, since a bare refcount can't stop a thread from reading a pointer
//! to a segment the instant before it's freed out from under it. That half
//! of the problem — safe traversal of a structure whose nodes really are
//! freed, not just logically retired — is exactly what `crossbeam-epoch`
//! is for, and the same concern the crate's own Michael–Scott-style append
//! (see `simple.rs`) sidesteps only because it never frees anything. Every
//! public entry point here pins one epoch guard for the duration of its
//! traversal; `Atomic<Segment>` cursors are only ever dereferenced through
//! it, and a spent segment is physically freed via `guard.defer_destroy`
//! rather than `Box::from_raw`, so reclamation waits for every guard that
//! could still be looking at it to unpin.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use super::{CancelOutcome, CellSlot, ClaimOutcome, ReleaseOutcome};
use crate::completion::CompletionCell;

pub(crate) const CAPACITY: usize = 16;

const REF_UNIT: u32 = 1 << 16;
const CANCEL_MASK: u32 = 0xFFFF;

fn cancelled_of(state: u32) -> u32 {
    state & CANCEL_MASK
}

fn refs_of(state: u32) -> u32 {
    state >> 16
}

fn fully_spent(state: u32) -> bool {
    cancelled_of(state) as usize >= CAPACITY && refs_of(state) == 0
}

pub(crate) struct Segment {
    base: u64,
    cells: [CellSlot; CAPACITY],
    prev: Atomic<Segment>,
    next: Atomic<Segment>,
    /// Packed spec §3/§4.F reference count — see the module doc.
    state: AtomicU32,
    /// CAS-claimed once, by whichever thread observes `state` go fully
    /// spent first, so exactly one thread ever retires a given segment.
    retiring: AtomicBool,
}

impl Segment {
    fn new(base: u64) -> Self {
        Self {
            base,
            cells: std::array::from_fn(|_| CellSlot::empty()),
            prev: Atomic::null(),
            next: Atomic::null(),
            state: AtomicU32::new(0),
            retiring: AtomicBool::new(false),
        }
    }

    fn claim_for_waiter(&self, local_idx: usize, cell: NonNull<CompletionCell>) -> ClaimOutcome {
        self.cells[local_idx].try_claim_for_waiter(cell)
    }

    fn claim_for_release(&self, local_idx: usize) -> ReleaseOutcome {
        self.cells[local_idx].try_claim_for_release()
    }

    fn try_cancel(&self, local_idx: usize, expected_cell: NonNull<CompletionCell>) -> CancelOutcome {
        self.cells[local_idx].try_cancel(expected_cell)
    }

    fn bump_ref(&self) {
        self.state.fetch_add(REF_UNIT, Ordering::AcqRel);
    }

    /// Returns the packed state *after* the drop, for the caller to feed
    /// straight into the unlink check without a second load.
    fn drop_ref(&self) -> u32 {
        self.state.fetch_sub(REF_UNIT, Ordering::AcqRel) - REF_UNIT
    }

    /// Returns the packed state *after* the increment.
    fn bump_cancelled(&self) -> u32 {
        self.state.fetch_add(1, Ordering::AcqRel) + 1
    }
}

pub(crate) struct SegmentList {
    enqueue_head: Atomic<Segment>,
    dequeue_head: Atomic<Segment>,
    enqueue_idx: AtomicU64,
    resume_idx: AtomicU64,
}

impl SegmentList {
    pub(crate) fn new() -> Self {
        let guard = &epoch::pin();
        let mut first = Segment::new(0);
        // Both cursors start parked here.
        first.state = AtomicU32::new(2 * REF_UNIT);
        let first = Owned::new(first).into_shared(guard);
        Self {
            enqueue_head: Atomic::from(first),
            dequeue_head: Atomic::from(first),
            enqueue_idx: AtomicU64::new(0),
            resume_idx: AtomicU64::new(0),
        }
    }

    /// Reserves the next waiter index, locates its segment, and installs
    /// `cell`.
    pub(crate) fn claim_waiter(
        &self,
        cell: NonNull<CompletionCell>,
    ) -> (ClaimOutcome, NonNull<Segment>, usize) {
        let idx = self.enqueue_idx.fetch_add(1, Ordering::AcqRel);
        let guard = &epoch::pin();
        let seg = match self.locate(guard, &self.enqueue_head, idx) {
            Ok(seg) => seg,
            Err(_) => crate::error::fail_fast::corrupted(
                "enqueue index targets a removed segment",
            ),
        };
        let seg_ref = unsafe { seg.deref() };
        let local = (idx - seg_ref.base) as usize;
        let outcome = seg_ref.claim_for_waiter(local, cell);
        let ptr = NonNull::new(seg.as_raw() as *mut Segment).expect("non-null segment");
        (outcome, ptr, local)
    }

    /// Reserves the next dequeue index and claims it for release,
    /// internally retrying (spec §4.E point 3) if the located segment
    /// was already physically unlinked before release reached it.
    pub(crate) fn resume_release(&self) -> (ReleaseOutcome, NonNull<Segment>, usize) {
        loop {
            let idx = self.resume_idx.fetch_add(1, Ordering::AcqRel);
            let guard = &epoch::pin();
            match self.locate(guard, &self.dequeue_head, idx) {
                Ok(seg) => {
                    let seg_ref = unsafe { seg.deref() };
                    let local = (idx - seg_ref.base) as usize;
                    let outcome = seg_ref.claim_for_release(local);
                    let ptr = NonNull::new(seg.as_raw() as *mut Segment).expect("non-null segment");
                    return (outcome, ptr, local);
                }
                Err(skip_to_base) => {
                    tracing::debug!(target: "segsem::segment", base = skip_to_base, "release skipped an already-unlinked segment range");
                    self.bump_resume_forward(skip_to_base);
                    continue;
                }
            }
        }
    }

    /// Cancels a previously-claimed waiter slot and, if that was the
    /// segment's last uncancelled cell, attempts to unlink it.
    ///
    /// Safety of dereferencing `seg_ptr` here without holding the guard
    /// that originally produced it: this exact cell has not yet reached a
    /// terminal state (the caller still owns `expected_cell`), so
    /// `cancelled` for this segment cannot already be `CAPACITY` — this
    /// cell is what would complete it — meaning the segment cannot have
    /// been unlinked-and-freed before this call runs.
    pub(crate) fn cancel_waiter(
        &self,
        seg_ptr: NonNull<Segment>,
        local_idx: usize,
        expected_cell: NonNull<CompletionCell>,
    ) -> CancelOutcome {
        let seg = unsafe { seg_ptr.as_ref() };
        let outcome = seg.try_cancel(local_idx, expected_cell);
        if matches!(outcome, CancelOutcome::Removed) {
            let new_state = seg.bump_cancelled();
            if fully_spent(new_state) {
                let guard = &epoch::pin();
                let shared: Shared<Segment> = Shared::from(seg_ptr.as_ptr() as *const Segment);
                self.maybe_unlink(guard, shared, new_state);
            }
        }
        outcome
    }

    /// Locates the segment containing `idx` for either cursor, advancing
    /// it forward when `idx` is ahead, or walking `prev` when `idx` is
    /// behind — either because a concurrent call for a later index
    /// already raced the cursor forward past it, or (dequeue side only)
    /// because the segment was already fully cancelled and unlinked.
    /// Dereferencing anything reached through `prev`/`next` here is sound
    /// regardless of concurrent unlinks, since physical reclamation is
    /// deferred until no guard — including this one — can still observe
    /// the node (see the module doc).
    fn locate<'g>(
        &self,
        guard: &'g Guard,
        cursor: &Atomic<Segment>,
        idx: u64,
    ) -> Result<Shared<'g, Segment>, u64> {
        loop {
            let cur = cursor.load(Ordering::Acquire, guard);
            let cur_ref = unsafe { cur.deref() };
            if idx < cur_ref.base {
                return match self.walk_back_to(guard, cur, idx) {
                    Some(seg) => Ok(seg),
                    None => Err(cur_ref.base),
                };
            }
            let target = self.extend_to(guard, cur, idx);
            if target == cur {
                return Ok(target);
            }
            let target_ref = unsafe { target.deref() };
            target_ref.bump_ref();
            match cursor.compare_exchange(cur, target, Ordering::AcqRel, Ordering::Acquire, guard) {
                Ok(_) => {
                    let prev_state = cur_ref.drop_ref();
                    self.maybe_unlink(guard, cur, prev_state);
                    return Ok(target);
                }
                Err(_) => {
                    // Lost the race to advance the cursor; someone else
                    // got there first. Release our speculative ref and
                    // retry from the (now further along) cursor.
                    target_ref.drop_ref();
                }
            }
        }
    }

    /// Walks backward via `prev` from `cur` until finding a segment whose
    /// range covers `idx`, or hits the chain's current start without
    /// finding one (meaning that range was already unlinked).
    fn walk_back_to<'g>(
        &self,
        guard: &'g Guard,
        mut cur: Shared<'g, Segment>,
        idx: u64,
    ) -> Option<Shared<'g, Segment>> {
        loop {
            let seg = unsafe { cur.deref() };
            if idx >= seg.base && idx < seg.base + CAPACITY as u64 {
                return Some(cur);
            }
            let prev = seg.prev.load(Ordering::Acquire, guard);
            if prev.is_null() {
                return None;
            }
            cur = prev;
        }
    }

    /// Walks forward from `cur` via `next`, appending a freshly-CAS-linked
    /// segment when the chain runs out, until a segment covering `idx` is
    /// found. Never moves a cursor; callers do that.
    fn extend_to<'g>(&self, guard: &'g Guard, mut cur: Shared<'g, Segment>, idx: u64) -> Shared<'g, Segment> {
        loop {
            let seg = unsafe { cur.deref() };
            if idx < seg.base + CAPACITY as u64 {
                return cur;
            }
            let next = seg.next.load(Ordering::Acquire, guard);
            if !next.is_null() {
                cur = next;
                continue;
            }
            let mut new_seg = Owned::new(Segment::new(seg.base + CAPACITY as u64));
            // Set before publishing so a concurrent backward walk that
            // reaches this segment through `next` never observes a null
            // `prev`.
            new_seg.prev = Atomic::from(cur);
            match seg.next.compare_exchange(
                Shared::null(),
                new_seg,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            ) {
                Ok(installed) => {
                    tracing::debug!(target: "segsem::segment", base = unsafe { installed.deref() }.base, "appended removable segment");
                    cur = installed;
                }
                Err(e) => {
                    // Someone else appended first; drop our speculative
                    // segment (never published, no epoch deferral needed)
                    // and continue from theirs.
                    drop(e.new);
                    cur = e.current;
                }
            }
        }
    }

    /// Unlinks `seg` if its packed state (already read into `state`) is
    /// fully spent and it isn't the tail. A CAS-claimed `retiring` flag
    /// ensures only the one thread that wins it performs the rewiring and
    /// retirement; a failed neighbour CAS during the rewire means another
    /// concurrent unlink already fixed that pointer up, which is fine to
    /// leave alone.
    fn maybe_unlink<'g>(&self, guard: &'g Guard, seg: Shared<'g, Segment>, state: u32) {
        if !fully_spent(state) {
            return;
        }
        let seg_ref = unsafe { seg.deref() };
        let next = seg_ref.next.load(Ordering::Acquire, guard);
        if next.is_null() {
            return; // still tail, never unlink the tail
        }
        if seg_ref
            .retiring
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let prev = seg_ref.prev.load(Ordering::Acquire, guard);
        let next_ref = unsafe { next.deref() };
        let _ = next_ref
            .prev
            .compare_exchange(seg, prev, Ordering::AcqRel, Ordering::Acquire, guard);
        if let Some(prev_ref) = unsafe { prev.as_ref() } {
            let _ = prev_ref
                .next
                .compare_exchange(seg, next, Ordering::AcqRel, Ordering::Acquire, guard);
        }
        tracing::debug!(target: "segsem::segment", base = seg_ref.base, "unlinked spent removable segment");
        unsafe { guard.defer_destroy(seg) };
    }

    fn bump_resume_forward(&self, at_least: u64) {
        let mut cur = self.resume_idx.load(Ordering::Acquire);
        while cur < at_least {
            match self.resume_idx.compare_exchange_weak(
                cur,
                at_least,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }
}

impl Drop for SegmentList {
    fn drop(&mut self) {
        // Safety: `Drop` runs with exclusive access — nothing else can be
        // pinned against this list — so an unprotected guard is sound for
        // one last walk-and-free.
        let guard = unsafe { epoch::unprotected() };
        let mut start = self.dequeue_head.load(Ordering::Relaxed, guard);
        loop {
            let prev = unsafe { start.deref() }.prev.load(Ordering::Relaxed, guard);
            if prev.is_null() {
                break;
            }
            start = prev;
        }
        let mut cur = start;
        while !cur.is_null() {
            let next = unsafe { cur.deref() }.next.load(Ordering::Relaxed, guard);
            unsafe { drop(cur.into_owned()) };
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PooledCell;

    #[test]
    fn enqueue_past_one_segment_extends_the_chain() {
        let list = SegmentList::new();
        let mut rentals = Vec::new();
        for _ in 0..(CAPACITY + 3) {
            let rental = PooledCell::rent();
            let _ = list.claim_waiter(rental.ptr());
            rentals.push(rental);
        }
        assert_eq!(list.enqueue_idx.load(Ordering::SeqCst), (CAPACITY + 3) as u64);
    }

    #[test]
    fn fully_cancelled_non_tail_segment_is_unlinked() {
        let list = SegmentList::new();
        let mut rentals = Vec::new();
        let mut claims = Vec::new();
        let mut first_segment: Option<NonNull<Segment>> = None;

        for _ in 0..CAPACITY {
            let rental = PooledCell::rent();
            let cell_ptr = rental.ptr();
            let (outcome, seg, idx) = list.claim_waiter(cell_ptr);
            assert!(matches!(outcome, ClaimOutcome::Installed));
            first_segment.get_or_insert(seg);
            claims.push((seg, idx, cell_ptr));
            rentals.push(rental);
        }
        // Force a second segment to exist so the first is no longer tail.
        let extra_rental = PooledCell::rent();
        let (_, extra_seg, _) = list.claim_waiter(extra_rental.ptr());
        assert_ne!(extra_seg, first_segment.unwrap());

        for (seg, idx, cell_ptr) in claims {
            let outcome = list.cancel_waiter(seg, idx, cell_ptr);
            assert!(matches!(outcome, CancelOutcome::Removed));
        }

        let guard = &epoch::pin();
        let enqueue_now = list.enqueue_head.load(Ordering::Acquire, guard);
        let dequeue_now = list.dequeue_head.load(Ordering::Acquire, guard);
        assert_ne!(enqueue_now.as_raw(), first_segment.unwrap().as_ptr() as *const Segment);
        assert_ne!(dequeue_now.as_raw(), first_segment.unwrap().as_ptr() as *const Segment);
    }

    #[test]
    fn release_skips_a_fully_cancelled_and_unlinked_range() {
        let list = SegmentList::new();
        let mut rentals = Vec::new();
        let mut claims = Vec::new();

        for _ in 0..CAPACITY {
            let rental = PooledCell::rent();
            let cell_ptr = rental.ptr();
            let (_, seg, idx) = list.claim_waiter(cell_ptr);
            claims.push((seg, idx, cell_ptr));
            rentals.push(rental);
        }
        // A second segment so the first isn't the tail when unlinked.
        let tail_rental = PooledCell::rent();
        let (_, _, tail_idx) = list.claim_waiter(tail_rental.ptr());

        for (seg, idx, cell_ptr) in claims {
            list.cancel_waiter(seg, idx, cell_ptr);
        }

        // Resume must skip straight over the unlinked first segment and
        // resolve the waiter still queued in the second.
        let (outcome, _, local) = list.resume_release();
        assert!(matches!(outcome, ReleaseOutcome::ResolvedWaiter(_)));
        assert_eq!(local, tail_idx);
    }
}
