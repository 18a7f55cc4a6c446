use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::registry::ConnectionRegistry;
use crate::session::{CloseReason, Session};

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub probe_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Which terminal condition ended a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    ProbeFailed,
    IdleTimeout,
    Cancelled,
}

/// Per-session watchdog: pings on a fixed interval and force-closes the
/// session once no application traffic arrives within the idle window.
pub struct HeartbeatMonitor {
    session: Arc<Session>,
    registry: ConnectionRegistry,
    liveness: mpsc::Receiver<Instant>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        session: Arc<Session>,
        registry: ConnectionRegistry,
        liveness: mpsc::Receiver<Instant>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            session,
            registry,
            liveness,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<MonitorExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> MonitorExit {
        let cancel = self.session.cancellation();
        let start = Instant::now();
        let mut probe = interval_at(start + self.config.probe_interval, self.config.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_liveness = start;

        let exit = loop {
            let idle_deadline = last_liveness + self.config.idle_timeout;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break MonitorExit::Cancelled,
                signal = self.liveness.recv() => match signal {
                    Some(at) => last_liveness = last_liveness.max(at),
                    None => break MonitorExit::Cancelled,
                },
                _ = sleep_until(idle_deadline) => {
                    // Signals dropped on a full mailbox still reach `last_active`.
                    let recorded = self.session.last_active();
                    if recorded + self.config.idle_timeout > Instant::now() {
                        last_liveness = last_liveness.max(recorded);
                        continue;
                    }
                    warn!(
                        identity = %self.session.identity(),
                        connection_id = %self.session.connection_id(),
                        idle_secs = self.config.idle_timeout.as_secs(),
                        "no application traffic within idle window; closing"
                    );
                    counter!("beach_signal_idle_timeouts_total", 1);
                    self.terminate(CloseReason::IdleTimeout);
                    break MonitorExit::IdleTimeout;
                }
                _ = probe.tick() => {
                    if let Err(err) = self.session.probe().await {
                        if self.session.is_closed() {
                            break MonitorExit::Cancelled;
                        }
                        warn!(
                            identity = %self.session.identity(),
                            connection_id = %self.session.connection_id(),
                            error = %err,
                            "heartbeat probe failed; closing"
                        );
                        counter!(
                            "beach_signal_probe_failures_total",
                            1,
                            "reason" => err.metric_label()
                        );
                        self.terminate(CloseReason::ProbeFailed);
                        break MonitorExit::ProbeFailed;
                    }
                }
            }
        };

        debug!(
            identity = %self.session.identity(),
            connection_id = %self.session.connection_id(),
            exit = ?exit,
            "heartbeat monitor stopped"
        );
        exit
    }

    fn terminate(&self, reason: CloseReason) {
        self.registry
            .remove(self.session.identity().as_str(), &self.session);
        self.session.close(reason);
    }
}
