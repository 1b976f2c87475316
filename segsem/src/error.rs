//! Public error type and the fail-fast path for unrecoverable states.

/// Error returned by the throwing acquire variants.
///
/// The try-variants never construct this; a cancelled try-acquire simply
/// resolves to `false`. See spec §7.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The caller's cancellation signal fired before a permit was granted.
    #[error("acquire cancelled before a permit was granted")]
    Cancelled,
}

/// Corrupted cell states and pool exhaustion are not modeled as `Result`
/// values: spec §7 requires the process to fail fast rather than let a
/// caller observe (and potentially recover from) a state that implies
/// memory corruption elsewhere. `tracing::error!` runs first so the abort
/// leaves a trace in whatever subscriber the host process installed.
pub(crate) mod fail_fast {
    /// A cell held a value outside `{EMPTY, PERMIT, CANCELED, <completion>}`.
    #[cold]
    pub(crate) fn corrupted(context: &str) -> ! {
        tracing::error!(target: "segsem::fail_fast", context, "impossible cell state observed");
        std::process::abort();
    }

    /// Renting a completion cell or segment could not allocate even after
    /// the pool fell back to a fresh allocation.
    #[cold]
    pub(crate) fn resource_exhausted(context: &str) -> ! {
        tracing::error!(target: "segsem::fail_fast", context, "allocation failed while renting a waiter slot");
        std::process::abort();
    }

    /// A completion cell's result byte held a value outside the known
    /// state set — only reachable via memory corruption or a layout bug.
    #[cold]
    pub(crate) fn corrupted_cell_result(observed: u8) -> ! {
        tracing::error!(target: "segsem::fail_fast", observed, "impossible completion cell result state");
        std::process::abort();
    }
}
