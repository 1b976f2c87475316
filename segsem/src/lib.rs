//! A lock-free, segment-based counting semaphore for workloads that mix
//! blocking threads and async tasks behind the same pool of permits.
//!
//! The queue backing a [`Semaphore`] is a chain of fixed-size cell arrays
//! rather than an intrusive linked list of waiters: acquirers and
//! releasers index into the chain by a shared atomic cursor instead of
//! walking or locking a list. Two chain shapes are available through
//! [`Variant`] — `Simple`, which never frees a segment, and `Removable`,
//! which physically unlinks a segment once every one of its cells has
//! been individually cancelled (a segment with even one granted cell is
//! never unlinked).
//!
//! ```
//! use segsem::Semaphore;
//!
//! let sem = Semaphore::new(1);
//! assert!(sem.try_acquire_immediately());
//! assert!(!sem.try_acquire_immediately());
//! sem.release();
//! assert_eq!(sem.current_count(), 1);
//! ```

mod blocking;
mod cancel;
mod completion;
mod counter;
mod error;
mod pool;
mod segment;
mod semaphore;

pub use cancel::CancelSignal;
pub use error::AcquireError;
pub use semaphore::{
    Acquire, AcquireCancellable, Semaphore, SemaphoreConfig, TryAcquire, TryAcquireCancellable,
    Variant,
};
