//! Background maintenance: one sweep pass over every store that ages.
//!
//! Nothing in the hot path evicts; stale usage counters read as zero,
//! expired blocks read as absent, throttle windows reset lazily. The
//! sweeper is the only place stale state is physically removed, plus the
//! driver for scheduled aggregation flushes. One plain thread, stopped
//! through [`SweeperHandle::shutdown`].

use std::{
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use chrono::TimeDelta;

use tollgate_alerts::AlertManager;
use tollgate_entitlements::UsageLedger;
use tollgate_monitor::{BlockRegistry, SecurityEventLog};
use tollgate_types::Clock;

/// What one sweep pass removed or flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Usage counters whose period has ended.
    pub counters: usize,
    /// Resolved security events past retention.
    pub events: usize,
    /// Throttle entries whose window has passed.
    pub throttles: usize,
    /// IP blocks past their horizon.
    pub blocks: usize,
    /// Aggregated summary alerts flushed.
    pub flushed_alerts: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.counters + self.events + self.throttles + self.blocks
    }
}

/// Sweeps the ledger, event log, throttle map and block registry, and
/// flushes due aggregation buffers.
pub struct Sweeper {
    ledger: Arc<UsageLedger>,
    log: Arc<SecurityEventLog>,
    alerts: Arc<AlertManager>,
    blocks: Arc<BlockRegistry>,
    clock: Arc<dyn Clock>,
    event_retention: TimeDelta,
}

impl Sweeper {
    pub fn new(
        ledger: Arc<UsageLedger>,
        log: Arc<SecurityEventLog>,
        alerts: Arc<AlertManager>,
        blocks: Arc<BlockRegistry>,
        clock: Arc<dyn Clock>,
        event_retention: TimeDelta,
    ) -> Self {
        Self {
            ledger,
            log,
            alerts,
            blocks,
            clock,
            event_retention,
        }
    }

    /// Runs one pass at the current clock reading.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let report = SweepReport {
            counters: self.ledger.sweep(now),
            events: self.log.sweep(now, self.event_retention),
            throttles: self.alerts.sweep(now),
            blocks: self.blocks.sweep(now),
            flushed_alerts: self.alerts.flush_due(now).len(),
        };
        if report.total_removed() > 0 || report.flushed_alerts > 0 {
            tracing::debug!(
                counters = report.counters,
                events = report.events,
                throttles = report.throttles,
                blocks = report.blocks,
                flushed_alerts = report.flushed_alerts,
                "sweep completed"
            );
        }
        report
    }

    /// Moves the sweeper onto a background thread that runs one pass every
    /// `interval` until the handle shuts it down.
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        self.sweep();
                    }
                }
            }
            tracing::debug!("sweeper stopped");
        });
        SweeperHandle {
            shutdown_tx,
            handle: Some(handle),
        }
    }
}

/// Handle to a running background sweeper.
///
/// Dropping the handle also stops the thread; `shutdown` does it
/// explicitly and waits for the final pass to finish.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signals the thread and joins it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
