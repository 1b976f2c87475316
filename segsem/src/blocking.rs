//! The Blocking Bridge (spec §4.B): lets a synchronous caller wait on a
//! Completion Cell using `std::thread::park`/`unpark` as the pooled OS
//! event spec §4.B calls for. Parking is already allocation-free and
//! reusable per-thread in the standard library, which is why this crate
//! doesn't maintain its own OS-event pool the way the distilled design
//! sketches one — see DESIGN.md for that Open Question's resolution.

use crate::completion::{CompletionCell, Continuation};

/// Parks the current thread until `cell` resolves, then returns its
/// result. Spurious wakeups are tolerated by re-checking the cell's
/// result after every `park()` — the cell's own state is the source of
/// truth, not the unpark signal. `peek` only decides whether to keep
/// waiting; the one authoritative read is the final `consume`, which
/// validates `version` against reuse (spec's `InvalidState`).
pub(crate) fn wait_blocking(cell: &CompletionCell, version: u32) -> bool {
    cell.register(Continuation::Thread(std::thread::current()));
    loop {
        if cell.peek().is_some() {
            return cell
                .consume(version)
                .unwrap_or_else(|()| crate::error::fail_fast::corrupted("consume after resolved peek"));
        }
        std::thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wakes_once_resolved_from_another_thread() {
        let cell = Arc::new(CompletionCell::new());
        let version = cell.version();
        let c2 = cell.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c2.resolve(true);
        });
        assert!(wait_blocking(&cell, version));
        handle.join().unwrap();
    }
}
