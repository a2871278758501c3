//! Cycle triggers.
//!
//! [`Scheduler::run`] waits on the periodic interval, connectivity changes,
//! explicit requests and the next due retry, and runs one engine cycle per
//! trigger. Cycles never overlap; a request arriving mid-cycle is folded
//! into the next one.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::engine::{CycleStatus, SyncEngine};
use crate::storage::KeyValueStore;
use crate::transport::Transport;

/// Lower bound on the retry wait; a retry that is already due but coalesced
/// into a running cycle must not spin
const MIN_RETRY_WAIT: Duration = Duration::from_millis(50);

/// Where the engine is between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Running,
    /// Periodic cycles are skipped until `until` (epoch ms)
    Backoff { until: i64 },
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Interval,
    ConnectivityRegained,
    Manual,
    /// The backoff of a failed operation elapsed
    RetryDue,
}

impl Trigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::ConnectivityRegained => "connectivity",
            Self::Manual => "manual",
            Self::RetryDue => "retry",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub struct Scheduler<S, T> {
    engine: SyncEngine<S, T>,
}

impl<S: KeyValueStore, T: Transport> Scheduler<S, T> {
    pub const fn new(engine: SyncEngine<S, T>) -> Self {
        Self { engine }
    }

    fn interval(&self) -> Option<Interval> {
        let period = self.engine.config().sync_interval()?;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    }

    /// Drive cycles until `shutdown` resolves.
    ///
    /// Cycle errors are logged and do not stop the loop.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = self.interval();
        let mut connectivity = self.engine.connectivity().subscribe();
        let manual = self.engine.manual_trigger();
        tokio::pin!(shutdown);

        tracing::info!(
            "Sync scheduler started (interval: {})",
            self.engine
                .config()
                .sync_interval_ms
                .map_or_else(|| "off".to_string(), |ms| format!("{ms}ms"))
        );

        loop {
            let retry_in = if self.engine.connectivity().is_online() {
                self.engine
                    .next_retry_in()
                    .await
                    .map(|delay| delay.max(MIN_RETRY_WAIT))
            } else {
                None
            };

            let trigger = tokio::select! {
                () = &mut shutdown => break,
                () = next_tick(interval.as_mut()) => Trigger::Interval,
                () = manual.notified() => Trigger::Manual,
                () = sleep_for(retry_in) => Trigger::RetryDue,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*connectivity.borrow_and_update() {
                        continue;
                    }
                    Trigger::ConnectivityRegained
                }
            };

            match self.engine.run_cycle(trigger).await {
                Ok(report) if report.status == CycleStatus::Deferred => {}
                Ok(report) => tracing::debug!("{trigger} cycle finished: {:?}", report.status),
                Err(error) => tracing::warn!("Sync cycle failed: {error}"),
            }
        }

        tracing::info!("Sync scheduler stopped");
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
