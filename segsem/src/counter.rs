//! The Permit Counter (spec §4.D): a signed atomic integer shared by every
//! acquirer and releaser. Positive means permits on hand; negative
//! approximates the number of outstanding waiters.

use std::sync::atomic::{AtomicI32, Ordering};

pub(crate) struct PermitCounter {
    value: AtomicI32,
}

impl PermitCounter {
    pub(crate) fn new(initial_permits: u32) -> Self {
        Self {
            value: AtomicI32::new(initial_permits as i32),
        }
    }

    /// Unconditionally subtracts one and reports whether the pre-decrement
    /// value was positive (a permit was actually available).
    ///
    /// This always runs, even when it drives the counter negative: a
    /// negative counter *is* the waiter-queue reservation (spec §4.D).
    #[inline]
    pub(crate) fn try_decrement(&self) -> bool {
        self.value.fetch_sub(1, Ordering::AcqRel) > 0
    }

    /// Unconditionally adds one and reports whether the post-increment
    /// value is positive, i.e. no queued waiter needs to be resumed.
    #[inline]
    pub(crate) fn try_increment(&self) -> bool {
        self.value.fetch_add(1, Ordering::AcqRel) + 1 > 0
    }

    /// Restores one unit to the counter, but only while it is still
    /// negative (spec §4.F's `increment_when_negative`, used by the
    /// removable variant's cancellation handler to undo its own
    /// provisional reservation without ever pushing the counter positive
    /// by surprise).
    pub(crate) fn increment_when_negative(&self) {
        let mut curr = self.value.load(Ordering::Acquire);
        while curr < 0 {
            match self.value.compare_exchange_weak(
                curr,
                curr + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => curr = observed,
            }
        }
    }

    /// CAS loop from positive to positive-minus-one; never reserves a
    /// waiter slot. Used only by `try_acquire_immediately`.
    pub(crate) fn try_acquire_immediate(&self) -> bool {
        let mut curr = self.value.load(Ordering::Acquire);
        loop {
            if curr <= 0 {
                return false;
            }
            match self.value.compare_exchange_weak(
                curr,
                curr - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => curr = observed,
            }
        }
    }

    pub(crate) fn raw(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    pub(crate) fn current_count(&self) -> u32 {
        self.raw().max(0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_reports_prior_availability() {
        let c = PermitCounter::new(1);
        assert!(c.try_decrement());
        assert!(!c.try_decrement());
        assert_eq!(c.raw(), -1);
    }

    #[test]
    fn increment_reports_whether_a_waiter_is_owed() {
        let no_waiters = PermitCounter::new(0);
        assert!(no_waiters.try_increment()); // 0 -> 1, no backlog to resume

        let one_waiter = PermitCounter::new(0);
        one_waiter.try_decrement(); // -1: one waiter queued
        assert!(!one_waiter.try_increment()); // -1 -> 0, must resume a waiter
    }

    #[test]
    fn increment_when_negative_stops_at_zero() {
        let c = PermitCounter::new(0);
        c.try_decrement(); // -1
        c.increment_when_negative();
        assert_eq!(c.raw(), 0);
        c.increment_when_negative(); // no-op, already non-negative
        assert_eq!(c.raw(), 0);
    }

    #[test]
    fn try_acquire_immediate_never_goes_negative() {
        let c = PermitCounter::new(1);
        assert!(c.try_acquire_immediate());
        assert!(!c.try_acquire_immediate());
        assert_eq!(c.raw(), 0);
    }
}
