use crate::features::resource_sync::service::{CycleOutcome, RefreshMode, RequestGate};
use crate::shared::config::{PollCadence, Settings, SettingsStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Period between background cycles.
pub enum PollInterval {
    Fixed(Duration),
    /// Follows the persisted live-mode flag, switching period as soon as it
    /// changes.
    LiveMode {
        settings: watch::Receiver<Settings>,
        live: Duration,
        normal: Duration,
    },
}

impl PollInterval {
    pub fn detail(settings: &SettingsStore, cadence: PollCadence) -> Self {
        PollInterval::LiveMode {
            settings: settings.subscribe(),
            live: cadence.detail_live,
            normal: cadence.detail_normal,
        }
    }

    pub fn current(&self) -> Duration {
        match self {
            PollInterval::Fixed(period) => *period,
            PollInterval::LiveMode {
                settings,
                live,
                normal,
            } => {
                if settings.borrow().live_mode {
                    *live
                } else {
                    *normal
                }
            }
        }
    }

    /// Resolves when the period may have changed. Never resolves for a fixed
    /// interval or once the settings store is gone.
    async fn changed(&mut self) {
        match self {
            PollInterval::Fixed(_) => std::future::pending::<()>().await,
            PollInterval::LiveMode { settings, .. } => {
                if settings.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

pub struct PollController {
    gate: Arc<RequestGate>,
    interval: PollInterval,
}

impl PollController {
    pub fn new(gate: Arc<RequestGate>, interval: PollInterval) -> Self {
        Self { gate, interval }
    }

    /// Starts the loop: one visible cycle right away, then silent cycles on
    /// every tick until the returned handle is torn down or dropped.
    pub fn spawn(self) -> PollHandle {
        let cancel = CancellationToken::new();
        let gate = Arc::clone(&self.gate);
        let task = tokio::spawn(run_poll_loop(self.gate, self.interval, cancel.clone()));
        PollHandle { cancel, task, gate }
    }
}

async fn run_poll_loop(gate: Arc<RequestGate>, mut interval: PollInterval, cancel: CancellationToken) {
    let scope = gate.scope().label();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        _ = gate.refresh(RefreshMode::Visible) => {}
    }

    let mut period = interval.current();
    let mut ticker = new_ticker(period);
    info!(scope, period_secs = period.as_secs_f64(), "Polling started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.changed() => {
                let next = interval.current();
                if next != period {
                    info!(scope, period_secs = next.as_secs_f64(), "Poll cadence changed");
                    period = next;
                    ticker = new_ticker(period);
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = gate.refresh(RefreshMode::Silent) => outcome,
        };
        if let CycleOutcome::Merged { version, resources } = outcome {
            debug!(scope, version, resources, "Background cycle merged");
        }
    }

    debug!(scope, "Polling stopped");
}

fn new_ticker(period: Duration) -> time::Interval {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Owner of a running poll loop. Dropping it stops the loop.
pub struct PollHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    gate: Arc<RequestGate>,
}

impl PollHandle {
    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// Manual "refresh now". Supersedes whatever the loop has in flight.
    pub async fn refresh_now(&self) -> CycleOutcome {
        self.gate.refresh(RefreshMode::Visible).await
    }

    /// Stops the timer and cancels the outstanding fetch.
    pub fn teardown(&self) {
        self.cancel.cancel();
        self.task.abort();
        self.gate.cancel_in_flight();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}
