//! Bridges POSIX signals into the async world: a dedicated blocking
//! thread receives them (the only async-signal-safe way to act on more
//! than setting a flag) and flips `AtomicBool`s that every connection
//! task's `tokio::select!` can check alongside its latch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGHUP, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;

use crate::slot::SlotTable;

#[derive(Clone, Default)]
pub struct SignalFlags {
    /// Re-read configuration; does not interrupt an in-progress send.
    pub reload_config: Arc<AtomicBool>,
    /// Finish the current batch, then disconnect gracefully (exit 0).
    pub shutdown_requested: Arc<AtomicBool>,
    /// Set by `SIGUSR2`: drain to caught-up, then promote to
    /// `shutdown_requested`. Distinct from `shutdown_requested` itself so a
    /// sender still streaming gets to deliver what it already has queued.
    pub ready_to_stop: Arc<AtomicBool>,
}

/// Spawn the signal-listening thread. `QUIT` is treated as "shared state
/// may already be inconsistent": it calls `std::process::exit(2)`
/// directly from the listener thread rather than attempting an orderly
/// per-connection shutdown. Every other signal wakes every occupied slot's
/// latch via `slot_table.wake_all()`, since a process-wide signal is a
/// process-wide concern, not any one connection's. `USR1` is a bare wake
/// (e.g. to promptly reflect a newly advanced flush pointer) with no flag
/// of its own; `USR2` additionally sets `ready_to_stop`.
pub fn spawn(slot_table: Arc<SlotTable>) -> anyhow::Result<SignalFlags> {
    let flags = SignalFlags::default();
    let mut signals = Signals::new([SIGHUP, SIGTERM, SIGQUIT, SIGUSR1, SIGUSR2])?;

    let flags_for_thread = flags.clone();
    std::thread::Builder::new()
        .name("signal-listener".into())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGQUIT => {
                        // Shared memory / on-disk state may be mid-update;
                        // skip cleanup entirely.
                        std::process::exit(2);
                    }
                    SIGHUP => {
                        flags_for_thread.reload_config.store(true, Ordering::SeqCst);
                        slot_table.wake_all();
                    }
                    SIGTERM => {
                        flags_for_thread
                            .shutdown_requested
                            .store(true, Ordering::SeqCst);
                        slot_table.wake_all();
                    }
                    SIGUSR1 => {
                        slot_table.wake_all();
                    }
                    SIGUSR2 => {
                        flags_for_thread.ready_to_stop.store(true, Ordering::SeqCst);
                        slot_table.wake_all();
                    }
                    _ => {}
                }
            }
        })?;

    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear() {
        let flags = SignalFlags::default();
        assert!(!flags.reload_config.load(Ordering::SeqCst));
        assert!(!flags.shutdown_requested.load(Ordering::SeqCst));
        assert!(!flags.ready_to_stop.load(Ordering::SeqCst));
    }
}
