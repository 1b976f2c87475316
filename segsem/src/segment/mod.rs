//! Segment & Segment List (spec §4.C/§4.E): the waiter queue is an
//! append-only (simple variant) or append-and-physically-shrink
//! (removable variant) chain of fixed-size cell arrays, each cell
//! addressed by a monotonically increasing global index. This module
//! holds the piece both variants share — the single cell slot and its
//! three-state sentinel protocol — while `simple` and `removable` each
//! implement their own segment shape, since the two diverge enough in
//! their linking and recycling invariants that forcing them through one
//! shared trait added indirection without real reuse (see DESIGN.md).

pub(crate) mod removable;
pub(crate) mod simple;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::completion::CompletionCell;

/// Sentinel written in place of a real `CompletionCell` pointer.
const PERMIT: *mut CompletionCell = 1usize as *mut CompletionCell;
const CANCELED: *mut CompletionCell = 2usize as *mut CompletionCell;

/// One addressable waiter slot (spec's `Cell`, distinct from the
/// Completion Cell it can hold): empty, holding a deposited permit nobody
/// has claimed yet, holding a waiter's completion cell, or marking a
/// waiter that cancelled before release reached it.
pub(crate) struct CellSlot {
    slot: AtomicPtr<CompletionCell>,
}

pub(crate) enum ClaimOutcome {
    /// The waiter's completion cell is now installed; it must register a
    /// continuation and wait.
    Installed,
    /// A permit had already been deposited here by a releaser that arrived
    /// first; the waiter is immediately granted, no registration needed.
    PermitAlreadyDeposited,
}

pub(crate) enum ReleaseOutcome {
    /// The slot was empty; a permit was left behind for a waiter that
    /// hasn't arrived at this index yet.
    DepositedPermit,
    /// A waiter's completion cell was sitting here; take ownership of it
    /// (the caller resolves it to `true` and recycles it).
    ResolvedWaiter(NonNull<CompletionCell>),
    /// This index was cancelled before release reached it; it consumes no
    /// permit and the release loop must keep advancing.
    SkipCancelled,
}

pub(crate) enum CancelOutcome {
    /// The waiter's cell was removed before a releaser could claim it;
    /// the cancellation handshake proceeds (spec §4.F).
    Removed,
    /// A releaser already swapped this slot away (to resolve the waiter or
    /// — impossible for a waiter's own slot — deposit a permit); the
    /// cancellation is a no-op, the waiter has in fact been granted.
    AlreadyClaimed,
}

impl CellSlot {
    pub(crate) const fn empty() -> Self {
        Self {
            slot: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Waiter-side: install `cell` into this slot, unless a permit was
    /// already deposited here first.
    pub(crate) fn try_claim_for_waiter(&self, cell: NonNull<CompletionCell>) -> ClaimOutcome {
        match self.slot.compare_exchange(
            std::ptr::null_mut(),
            cell.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => ClaimOutcome::Installed,
            Err(observed) if observed == PERMIT => ClaimOutcome::PermitAlreadyDeposited,
            Err(_) => crate::error::fail_fast::corrupted("cell slot claimed by two waiters"),
        }
    }

    /// Releaser-side: claim this slot for one unit of release.
    ///
    /// A waiter's cell pointer is retired to the very same `CANCELED`
    /// sentinel a cancellation would write. That is what makes the
    /// release/cancel race in spec §4.F resolvable: whichever side's CAS
    /// reaches the slot first leaves `CANCELED` behind, and the loser —
    /// release or cancel, symmetrically — simply observes a slot it no
    /// longer owns and backs off, rather than the two racing to interpret
    /// a value only one of them wrote.
    pub(crate) fn try_claim_for_release(&self) -> ReleaseOutcome {
        let mut observed = self.slot.load(Ordering::Acquire);
        loop {
            if observed == CANCELED {
                return ReleaseOutcome::SkipCancelled;
            }
            if observed.is_null() {
                match self.slot.compare_exchange_weak(
                    std::ptr::null_mut(),
                    PERMIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return ReleaseOutcome::DepositedPermit,
                    Err(actual) => {
                        observed = actual;
                        continue;
                    }
                }
            }
            // `observed` is a waiter's completion cell pointer.
            match self.slot.compare_exchange_weak(
                observed,
                CANCELED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let cell = NonNull::new(observed)
                        .unwrap_or_else(|| crate::error::fail_fast::corrupted("null waiter cell"));
                    return ReleaseOutcome::ResolvedWaiter(cell);
                }
                Err(actual) => {
                    observed = actual;
                    continue;
                }
            }
        }
    }

    /// Waiter-side cancellation: try to replace this slot's cell pointer
    /// with the `CANCELED` sentinel before a releaser claims it. See
    /// `try_claim_for_release` for why both sides write the same value.
    pub(crate) fn try_cancel(&self, expected_cell: NonNull<CompletionCell>) -> CancelOutcome {
        match self.slot.compare_exchange(
            expected_cell.as_ptr(),
            CANCELED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => CancelOutcome::Removed,
            Err(_) => CancelOutcome::AlreadyClaimed,
        }
    }
}
