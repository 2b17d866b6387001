//! Heartbeat monitor: ages every session on a fixed interval and evicts
//! the ones that stopped answering.
//!
//! Each sweep, per session:
//!
//! ```text
//! count >= threshold ──▶ unregister, close connection, queue UserLeft
//! otherwise          ──▶ count += 1, send heartbeat{Index: count}
//! ```
//!
//! A `heartbeat` frame from the client sets the count back to 0. With the
//! first sweep firing immediately, a silent client is evicted by the sweep
//! at `interval × threshold`.
//!
//! The monitor runs on its own timer task and edits the registry directly
//! rather than going through the task queue; only the resulting `UserLeft`
//! goes through the queue.

use std::sync::Arc;
use std::time::Duration;

use hallgate_protocol::{Codec, HeartbeatProbe, UserId};
use hallgate_transport::ConnectionSink;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::manager::Hub;
use crate::queue::stopped;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions that were aged and sent a probe.
    pub probed: usize,
    /// Users evicted this sweep.
    pub evicted: Vec<UserId>,
}

/// Drives heartbeat sweeps over a session registry.
pub struct HeartbeatMonitor<K: ConnectionSink, C: Codec> {
    hub: Arc<Hub<K, C>>,
    interval: Duration,
    threshold: u32,
}

impl<K: ConnectionSink, C: Codec> Clone for HeartbeatMonitor<K, C> {
    fn clone(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            interval: self.interval,
            threshold: self.threshold,
        }
    }
}

impl<K: ConnectionSink, C: Codec> HeartbeatMonitor<K, C> {
    pub(crate) fn new(hub: Arc<Hub<K, C>>, interval: Duration, threshold: u32) -> Self {
        Self {
            hub,
            interval,
            threshold,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Runs one sweep over a snapshot of the registry.
    ///
    /// Sessions that log out or get replaced mid-sweep are skipped at
    /// eviction time, so a user is never announced as left twice.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.hub.registry.sessions() {
            let Some(index) = session.try_age(self.threshold) else {
                if self.hub.evict(&session, "heartbeat timeout").await {
                    report.evicted.push(session.user_id());
                }
                continue;
            };

            report.probed += 1;
            if let Err(e) = self
                .hub
                .send(session.connection(), HeartbeatProbe::MSG_ID, &HeartbeatProbe { index })
            {
                // The next sweeps keep aging it until it's evicted.
                tracing::debug!(
                    user_id = %session.user_id(),
                    conn_id = %session.connection(),
                    error = %e,
                    "heartbeat probe not delivered"
                );
            }
        }

        report
    }

    /// Sweeps every `interval` until `shutdown` flips.
    ///
    /// Late ticks are skipped rather than bunched up, so a stalled runtime
    /// doesn't age everyone several times in a row when it recovers.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(
            interval_ms = self.interval.as_millis() as u64,
            threshold = self.threshold,
            "heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.evicted.is_empty() {
                        tracing::info!(
                            evicted = report.evicted.len(),
                            probed = report.probed,
                            "heartbeat sweep evicted idle sessions"
                        );
                    } else {
                        tracing::trace!(probed = report.probed, "heartbeat sweep");
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }

        tracing::debug!("heartbeat monitor stopped");
    }
}
