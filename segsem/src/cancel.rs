//! Cancellation signal: the external trigger an acquirer can be given.
//!
//! spec §5 models cancellation as "an external signal associated with the
//! acquire", not as control flow baked into the Core. `CancelSignal` is
//! that signal: a cheap, cloneable handle a caller holds onto and fires
//! independently of the semaphore (a timeout, a `Ctrl-C` handler, a parent
//! future's own cancellation). Firing it before a waiter is granted a
//! permit runs the cancellation handshake in spec §4.F; firing it after is
//! defined as a no-op (spec §5, "Cancellation after a permit has been
//! delivered is a no-op from the semaphore's view").

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const WAITING: u8 = 0;
const FIRED: u8 = 2;

struct Inner {
    state: AtomicU8,
    slot: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// A one-shot cancellation trigger shared between the caller and the
/// waiter it cancels.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<Inner>,
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelSignal {
    /// Creates a signal that has not fired yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(WAITING),
                slot: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Fires the signal. If a waiter has registered a cancellation callback,
    /// it runs inline on the calling thread; per spec §5 a cancellation
    /// handler never suspends, so running it inline here is safe.
    pub fn cancel(&self) {
        if self.inner.state.swap(FIRED, Ordering::AcqRel) != FIRED {
            if let Some(cb) = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                cb();
            }
        }
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == FIRED
    }

    /// Registers `callback` to run the moment `cancel` is called. If the
    /// signal already fired, `callback` runs immediately instead.
    ///
    /// Only the Core calls this (once per waiter); it is not part of the
    /// public API.
    pub(crate) fn register(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut guard = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.state.load(Ordering::Acquire) == FIRED {
            drop(guard);
            callback();
            return;
        }
        *guard = Some(callback);
        drop(guard);
        // Re-check: `cancel` may have run between our load above and the
        // store, and found the slot empty.
        if self.inner.state.load(Ordering::Acquire) == FIRED {
            let mut guard = self.inner.slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = guard.take() {
                drop(guard);
                cb();
            }
        }
    }
}
