//! The Semaphore (spec §4): ties the Permit Counter to one of the two
//! segment-list variants and exposes the blocking, async and
//! try-acquire surfaces over it.

use std::future::Future;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::task::{Context, Poll};

use crate::blocking;
use crate::cancel::CancelSignal;
use crate::completion::{CompletionCell, Continuation};
use crate::counter::PermitCounter;
use crate::error::AcquireError;
use crate::pool::PooledCell;
use crate::segment::{removable, simple, CancelOutcome, ClaimOutcome, ReleaseOutcome};

/// Which segment-list shape backs a `Semaphore`'s waiter queue.
///
/// `Simple` never frees a segment once allocated — cheapest per-operation,
/// unbounded memory if the queue churns through cancellations. `Removable`
/// physically unlinks spent segments, lock-free, at the cost of the extra
/// bookkeeping (a packed reference count plus epoch-based reclamation —
/// see `segment/removable.rs`) that makes freeing a segment while another
/// thread might still be looking at it safe. Pick `Removable` for
/// workloads where most acquires are expected to be cancelled (e.g.
/// speculative fan-out with timeouts); `Simple` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    Simple,
    Removable,
}

/// Construction-time knobs for a [`Semaphore`].
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreConfig {
    pub initial_permits: u32,
    pub variant: Variant,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            initial_permits: 0,
            variant: Variant::default(),
        }
    }
}

enum Queue {
    Simple(simple::SegmentList),
    Removable(removable::SegmentList),
}

/// A pointer to the segment slot a live or just-resolved waiter occupies,
/// kept around only long enough to drive cancellation or ref-release.
#[derive(Clone, Copy)]
enum WaiterSlot {
    Simple(NonNull<simple::Segment>, usize),
    Removable(NonNull<removable::SegmentList>, NonNull<removable::Segment>, usize),
}

// Safety: a `WaiterSlot` is only ever dereferenced through the same
// CAS-gated protocol `CellSlot` already guards; it carries no data a
// second thread could read without first winning that CAS.
unsafe impl Send for WaiterSlot {}

/// Everything a cancellation callback needs, bundled so it can cross into
/// the `Box<dyn FnOnce() + Send>` the `CancelSignal` requires. The raw
/// pointers inside are otherwise `!Send`; bundling and asserting `Send`
/// here (instead of on `WaiterSlot`/`NonNull` individually) keeps the
/// unsafe surface to this one spot.
#[derive(Clone, Copy)]
struct CancelPayload {
    slot: WaiterSlot,
    cell: NonNull<CompletionCell>,
    counter: NonNull<PermitCounter>,
    cancelled_total: NonNull<AtomicU32>,
}

// Safety: see `cancel_waiter` — every field is only ever dereferenced
// after winning the slot CAS that makes doing so sound.
unsafe impl Send for CancelPayload {}

/// Lock-free counting semaphore for workloads that mix blocking threads
/// and async tasks behind the same pool of permits.
///
/// `Semaphore` has no notion of an RAII guard: callers pair `acquire`
/// (or one of its variants) with an explicit [`Semaphore::release`],
/// matching the Core described in spec §4 rather than
/// `tokio::sync::Semaphore`'s `SemaphorePermit`.
pub struct Semaphore {
    counter: PermitCounter,
    queue: Queue,
    /// Monotonic count of waiters cancelled over this semaphore's
    /// lifetime, never decremented. Backs `current_queue`'s approximation
    /// (spec §6) — distinct from each segment's own cancellation count,
    /// which drives unlink/reconciliation bookkeeping instead.
    cancelled_total: AtomicU32,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("current_count", &self.current_count())
            .field("current_queue", &self.current_queue())
            .field(
                "variant",
                &match self.queue {
                    Queue::Simple(_) => Variant::Simple,
                    Queue::Removable(_) => Variant::Removable,
                },
            )
            .finish()
    }
}

impl Semaphore {
    /// Creates a semaphore with `initial_permits` available and the
    /// [`Variant::Simple`] queue.
    pub fn new(initial_permits: u32) -> Self {
        Self::with_config(SemaphoreConfig {
            initial_permits,
            variant: Variant::Simple,
        })
    }

    pub fn with_config(config: SemaphoreConfig) -> Self {
        let queue = match config.variant {
            Variant::Simple => Queue::Simple(simple::SegmentList::new()),
            Variant::Removable => Queue::Removable(removable::SegmentList::new()),
        };
        Self {
            counter: PermitCounter::new(config.initial_permits),
            queue,
            cancelled_total: AtomicU32::new(0),
        }
    }

    /// Approximate number of permits currently available. Quiescent-state
    /// accurate; under concurrent traffic this is a snapshot, per spec §6.
    pub fn current_count(&self) -> u32 {
        self.counter.current_count()
    }

    /// Approximate number of waiters still queued: `max(0, -counter) -
    /// cancelledTotal` (spec §6). Quiescent-state accurate like
    /// `current_count`; a cancellation racing a release can transiently
    /// over- or under-count by one.
    pub fn current_queue(&self) -> u32 {
        let backlog = (-self.counter.raw()).max(0) as u32;
        backlog.saturating_sub(self.cancelled_total.load(Ordering::Acquire))
    }

    /// Grants a permit without ever registering a waiter, succeeding only
    /// if one was immediately available.
    pub fn try_acquire_immediately(&self) -> bool {
        self.counter.try_acquire_immediate()
    }

    /// Blocks the current OS thread until a permit is available. Per spec
    /// §7, the non-cancellable path can never observe `false` — it simply
    /// always returns `true` — so `acquire` is a thin wrapper that asserts
    /// as much rather than duplicating `try_acquire`'s logic.
    pub fn acquire(&self) {
        let granted = self.try_acquire();
        debug_assert!(granted, "uncancellable wait resolved to false");
    }

    /// Blocks the current OS thread until a permit is available. Identical
    /// to [`Semaphore::acquire`] when there is no cancellation source; the
    /// boolean result exists for symmetry with [`Semaphore::try_acquire_cancellable`]
    /// and the suspending `try_*` family (spec §6's `try_acquire`, which
    /// never throws, as distinct from the throwing `acquire`).
    pub fn try_acquire(&self) -> bool {
        match self.acquire_core() {
            AcquireCore::Granted => true,
            AcquireCore::Queued { rental, slot: _ } => {
                let version = rental.as_ref().version();
                let granted = blocking::wait_blocking(rental.as_ref(), version);
                rental.recycle();
                granted
            }
        }
    }

    /// Blocks the current OS thread until either a permit is available or
    /// `cancel` fires first. `acquire_cancellable` is a thin adapter over
    /// [`Semaphore::try_acquire_cancellable`] (spec §9: "Model [cancellation]
    /// as a boolean output ...; the outward-facing throwing API is a thin
    /// adapter on top").
    pub fn acquire_cancellable(&self, cancel: &CancelSignal) -> Result<(), AcquireError> {
        if self.try_acquire_cancellable(cancel) {
            Ok(())
        } else {
            Err(AcquireError::Cancelled)
        }
    }

    /// Blocks the current OS thread until either a permit is available or
    /// `cancel` fires first, surfacing cancellation as `false` rather than
    /// an error (spec §6's non-throwing `try_acquire`).
    pub fn try_acquire_cancellable(&self, cancel: &CancelSignal) -> bool {
        match self.acquire_core() {
            AcquireCore::Granted => true,
            AcquireCore::Queued { rental, slot } => {
                let version = rental.as_ref().version();
                let payload = CancelPayload {
                    slot,
                    cell: rental.ptr(),
                    counter: NonNull::from(&self.counter),
                    cancelled_total: NonNull::from(&self.cancelled_total),
                };
                cancel.register(Box::new(move || {
                    // Safety: the slot CAS inside `cancel_waiter` is the
                    // sole arbiter of whether `payload.cell` is
                    // dereferenced. It only happens if this call wins the
                    // race against a concurrent release — and winning
                    // that race is exactly the condition under which the
                    // waiting thread has *not yet* observed a resolved
                    // cell, so it cannot have recycled it yet either.
                    cancel_waiter(payload);
                }));
                let granted = blocking::wait_blocking(rental.as_ref(), version);
                let _ = slot;
                rental.recycle();
                granted
            }
        }
    }

    /// Returns a future that resolves once a permit is available. A thin
    /// adapter over [`Semaphore::try_acquire_suspending`] (see `acquire`).
    pub fn acquire_suspending(&self) -> Acquire<'_> {
        Acquire(TryAcquire {
            semaphore: self,
            state: AcquireState::Start,
        })
    }

    /// Returns a future that resolves once a permit is available. Identical
    /// to [`Semaphore::acquire_suspending`] absent cancellation; kept
    /// distinct for symmetry with the `try_*` family (spec §6).
    pub fn try_acquire_suspending(&self) -> TryAcquire<'_> {
        TryAcquire {
            semaphore: self,
            state: AcquireState::Start,
        }
    }

    /// Returns a future that resolves once a permit is available, or
    /// resolves to `Err(AcquireError::Cancelled)` if `cancel` fires first.
    /// A thin adapter over [`Semaphore::try_acquire_suspending_cancellable`].
    pub fn acquire_suspending_cancellable<'a>(
        &'a self,
        cancel: &'a CancelSignal,
    ) -> AcquireCancellable<'a> {
        AcquireCancellable(TryAcquireCancellable {
            semaphore: self,
            cancel,
            state: AcquireState::Start,
            registered: false,
        })
    }

    /// Returns a future that resolves once a permit is available, or
    /// resolves to `false` if `cancel` fires first (spec §6's non-throwing
    /// `try_acquire_suspending`).
    pub fn try_acquire_suspending_cancellable<'a>(
        &'a self,
        cancel: &'a CancelSignal,
    ) -> TryAcquireCancellable<'a> {
        TryAcquireCancellable {
            semaphore: self,
            cancel,
            state: AcquireState::Start,
            registered: false,
        }
    }

    /// Releases one permit, resuming the longest-waiting queued acquirer
    /// if one is owed.
    pub fn release(&self) {
        if self.counter.try_increment() {
            return;
        }
        loop {
            let (outcome, slot) = match &self.queue {
                Queue::Simple(list) => {
                    let (seg, idx) = list.resume_slot();
                    let seg_ptr = NonNull::from(seg);
                    (seg.claim_for_release(idx), WaiterSlot::Simple(seg_ptr, idx))
                }
                Queue::Removable(list) => {
                    // `resume_release` already absorbs spec §4.E point 3
                    // internally: if the located segment was already
                    // physically unlinked, it bumps the dequeue index
                    // forward past the removed range and retries.
                    let (outcome, seg_ptr, idx) = list.resume_release();
                    let list_ptr = NonNull::from(list);
                    (outcome, WaiterSlot::Removable(list_ptr, seg_ptr, idx))
                }
            };
            match outcome {
                ReleaseOutcome::DepositedPermit => return,
                ReleaseOutcome::ResolvedWaiter(cell) => {
                    // Safety: the CAS in `claim_for_release` established a
                    // happens-before edge with whoever installed `cell`.
                    unsafe { cell.as_ref() }.resolve(true);
                    return;
                }
                ReleaseOutcome::SkipCancelled => {
                    // A cell already `CANCELED` before release reached it:
                    // the simple variant's segment still needs to
                    // reconcile its per-segment cancellation count (spec
                    // §4.E); the removable variant already accounted for
                    // it in `cancel_waiter`.
                    if let WaiterSlot::Simple(seg, _) = slot {
                        unsafe { seg.as_ref() }.reconcile_cancelled();
                    }
                    continue;
                }
            }
        }
    }

    fn acquire_core(&self) -> AcquireCore {
        if self.counter.try_decrement() {
            return AcquireCore::Granted;
        }
        let rental = PooledCell::rent();
        match &self.queue {
            Queue::Simple(list) => {
                let (seg, idx) = list.enqueue_slot();
                let seg_ptr = NonNull::from(seg);
                match seg.claim_for_waiter(idx, rental.ptr()) {
                    ClaimOutcome::Installed => AcquireCore::Queued {
                        rental,
                        slot: WaiterSlot::Simple(seg_ptr, idx),
                    },
                    ClaimOutcome::PermitAlreadyDeposited => {
                        rental.recycle();
                        AcquireCore::Granted
                    }
                }
            }
            Queue::Removable(list) => {
                let (outcome, seg_ptr, idx) = list.claim_waiter(rental.ptr());
                let list_ptr = NonNull::from(list);
                match outcome {
                    ClaimOutcome::Installed => AcquireCore::Queued {
                        rental,
                        slot: WaiterSlot::Removable(list_ptr, seg_ptr, idx),
                    },
                    ClaimOutcome::PermitAlreadyDeposited => {
                        rental.recycle();
                        AcquireCore::Granted
                    }
                }
            }
        }
    }
}

/// Cancellation-side half of the handshake in spec §4.F, run from the
/// `CancelSignal`'s registered callback — possibly on a thread unrelated
/// to the one waiting. Does not touch `Semaphore` or `PermitCounter`
/// directly except through the raw pointer captured alongside `slot`,
/// since the callback must be `'static` and outlive the borrow an
/// ordinary `&Semaphore` would require.
fn cancel_waiter(payload: CancelPayload) {
    let CancelPayload {
        slot,
        cell: cell_ptr,
        counter,
        cancelled_total,
    } = payload;
    match slot {
        WaiterSlot::Simple(seg, idx) => {
            // Safety: the `Simple` variant never frees a segment once
            // allocated, so `seg` is valid for the program's lifetime.
            let outcome = unsafe { seg.as_ref() }.try_cancel(idx, cell_ptr);
            if matches!(outcome, CancelOutcome::Removed) {
                // Safety: winning the slot CAS above is the only
                // condition under which anyone may dereference
                // `cell_ptr` from the cancelling side, and it rules out
                // a concurrent release having done the same (see
                // `CellSlot::try_claim_for_release`).
                unsafe { cell_ptr.as_ref() }.resolve(false);
                // No counter restitution: the simple variant relies on
                // the release loop's forward permit deposit to make this
                // waiter's reservation whole again (see DESIGN.md). The
                // segment's own cancellation count still needs bumping
                // (spec §3) so release can later reconcile it.
                unsafe { seg.as_ref() }.mark_cancelled();
                unsafe { cancelled_total.as_ref() }.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "segsem::cancel", variant = "simple", "removed waiter before release");
            }
        }
        WaiterSlot::Removable(list, seg, idx) => {
            // Safety: `list` was derived from the live `Semaphore` that
            // enqueued this waiter, which outlives it; `seg` is likewise
            // still live — per `removable::SegmentList::cancel_waiter`'s
            // own safety note, a segment can't be unlinked while this
            // exact cell is still unresolved.
            let outcome = unsafe { list.as_ref() }.cancel_waiter(seg, idx, cell_ptr);
            if matches!(outcome, CancelOutcome::Removed) {
                // Safety: see the `Simple` arm above.
                unsafe { cell_ptr.as_ref() }.resolve(false);
                // The removable variant restores the counter immediately
                // on cancellation rather than relying on a forward permit
                // deposit (see DESIGN.md for why the two variants differ
                // here).
                unsafe { counter.as_ref() }.increment_when_negative();
                unsafe { cancelled_total.as_ref() }.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "segsem::cancel", variant = "removable", "removed waiter before release");
            }
        }
    }
}

enum AcquireCore {
    Granted,
    Queued { rental: PooledCell, slot: WaiterSlot },
}

/// Future returned by [`Semaphore::try_acquire_suspending`]: resolves to
/// `true`. Kept distinct from [`Acquire`] only for API symmetry, since
/// nothing here can produce `false` absent a cancellation source.
pub struct TryAcquire<'a> {
    semaphore: &'a Semaphore,
    state: AcquireState,
}

enum AcquireState {
    Start,
    Waiting { rental: PooledCell, slot: WaiterSlot },
    Done,
}

impl Future for TryAcquire<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = unsafe { self.get_unchecked_mut() };
        loop {
            match std::mem::replace(&mut this.state, AcquireState::Done) {
                AcquireState::Start => match this.semaphore.acquire_core() {
                    AcquireCore::Granted => return Poll::Ready(true),
                    AcquireCore::Queued { rental, slot } => {
                        rental
                            .as_ref()
                            .register(Continuation::Waker(cx.waker().clone()));
                        this.state = AcquireState::Waiting { rental, slot };
                        return Poll::Pending;
                    }
                },
                AcquireState::Waiting { rental, slot } => {
                    if rental.as_ref().peek().is_none() {
                        this.state = AcquireState::Waiting { rental, slot };
                        return Poll::Pending;
                    }
                    let version = rental.as_ref().version();
                    let granted = rental.as_ref().consume(version).unwrap_or_else(|()| {
                        crate::error::fail_fast::corrupted("consume after resolved peek")
                    });
                    let _ = slot;
                    rental.recycle();
                    return Poll::Ready(granted);
                }
                AcquireState::Done => return Poll::Ready(true),
            }
        }
    }
}

/// Future returned by [`Semaphore::acquire_suspending`]. A thin adapter
/// over [`TryAcquire`] that asserts the non-cancellable invariant instead
/// of duplicating its polling logic (spec §9's "thin adapter" guidance).
pub struct Acquire<'a>(TryAcquire<'a>);

impl Future for Acquire<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.0) };
        match inner.poll(cx) {
            Poll::Ready(granted) => {
                debug_assert!(granted, "uncancellable async wait resolved to false");
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Future returned by [`Semaphore::try_acquire_suspending_cancellable`]:
/// resolves to `false` instead of an error if `cancel` fires first (spec
/// §6's non-throwing `try_acquire_suspending`).
pub struct TryAcquireCancellable<'a> {
    semaphore: &'a Semaphore,
    cancel: &'a CancelSignal,
    state: AcquireState,
    registered: bool,
}

impl Future for TryAcquireCancellable<'_> {
    type Output = bool;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        let this = unsafe { self.get_unchecked_mut() };
        loop {
            match std::mem::replace(&mut this.state, AcquireState::Done) {
                AcquireState::Start => match this.semaphore.acquire_core() {
                    AcquireCore::Granted => return Poll::Ready(true),
                    AcquireCore::Queued { rental, slot } => {
                        rental
                            .as_ref()
                            .register(Continuation::Waker(cx.waker().clone()));
                        if !this.registered {
                            this.registered = true;
                            let payload = CancelPayload {
                                slot,
                                cell: rental.ptr(),
                                counter: NonNull::from(&this.semaphore.counter),
                                cancelled_total: NonNull::from(&this.semaphore.cancelled_total),
                            };
                            this.cancel.register(Box::new(move || {
                                // Safety: see `Semaphore::try_acquire_cancellable`.
                                cancel_waiter(payload);
                            }));
                        }
                        this.state = AcquireState::Waiting { rental, slot };
                        return Poll::Pending;
                    }
                },
                AcquireState::Waiting { rental, slot } => {
                    if rental.as_ref().peek().is_none() {
                        this.state = AcquireState::Waiting { rental, slot };
                        return Poll::Pending;
                    }
                    let version = rental.as_ref().version();
                    let granted = rental.as_ref().consume(version).unwrap_or_else(|()| {
                        crate::error::fail_fast::corrupted("consume after resolved peek")
                    });
                    let _ = slot;
                    rental.recycle();
                    return Poll::Ready(granted);
                }
                AcquireState::Done => return Poll::Ready(false),
            }
        }
    }
}

/// Future returned by [`Semaphore::acquire_suspending_cancellable`]. A thin
/// adapter over [`TryAcquireCancellable`] mapping its boolean result onto
/// the throwing `Result` surface (spec §9's "thin adapter" guidance).
pub struct AcquireCancellable<'a>(TryAcquireCancellable<'a>);

impl Future for AcquireCancellable<'_> {
    type Output = Result<(), AcquireError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), AcquireError>> {
        let this = unsafe { self.get_unchecked_mut() };
        let inner = unsafe { Pin::new_unchecked(&mut this.0) };
        match inner.poll(cx) {
            Poll::Ready(true) => Poll::Ready(Ok(())),
            Poll::Ready(false) => Poll::Ready(Err(AcquireError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
