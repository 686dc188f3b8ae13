//! Periodic jobs that keep local actors consistent with their leases.

mod lease;
mod nodes;
mod pulser;
mod ripper;

pub use lease::LeaseCron;
pub use nodes::NodesCron;
pub use pulser::PulserCron;
pub use ripper::RipperCron;

use crate::metrics::CRON_TICKS;
use crate::{Result, Shutdown};
use async_trait::async_trait;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

#[async_trait]
pub trait CronJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// One wake-up. Errors end this tick only.
    async fn tick(&self) -> Result<()>;
}

/// A job plus the guard that keeps its ticks from overlapping.
pub struct CronTask {
    job: Arc<dyn CronJob>,
    interval: Duration,
    busy: AtomicBool,
}

impl CronTask {
    pub fn new(job: Arc<dyn CronJob>, interval: Duration) -> Self {
        Self {
            job,
            interval,
            busy: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single tick. Returns `false` without running it when the
    /// previous tick has not finished yet.
    pub async fn run_once(&self) -> bool {
        let name = self.job.name();
        let Some(_busy) = Busy::acquire(&self.busy) else {
            debug!(cron = name, "Previous tick still running, skipping");
            CRON_TICKS.with_label_values(&[name, "skipped"]).inc();
            return false;
        };
        debug!(cron = name, "Cron waking up");
        match self.job.tick().await {
            Ok(()) => CRON_TICKS.with_label_values(&[name, "ok"]).inc(),
            Err(err) => {
                error!(cron = name, error = %err, "Cron tick failed");
                CRON_TICKS.with_label_values(&[name, "error"]).inc();
            }
        }
        true
    }
}

/// Holds a task's busy flag; dropping it, even mid-tick, frees the task.
struct Busy<'a>(&'a AtomicBool);

impl<'a> Busy<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::AcqRel)).then_some(Self(flag))
    }
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives `task` every `task.interval()` until `shutdown` fires.
pub fn spawn_cron(task: Arc<CronTask>, shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(task.interval());
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick of a tokio interval fires immediately
        interval_timer.tick().await;
        debug!(cron = task.name(), interval = ?task.interval(), "New cron job");
        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    task.run_once().await;
                }
                reason = shutdown.wait() => {
                    debug!(cron = task.name(), %reason, "Cron stopped");
                    break;
                }
            }
        }
    })
}

/// Runs `f` for every item concurrently, at most `max_in_flight` at a time
/// when given, and collects every result in completion order.
pub(crate) async fn fan_out<I, T, F, Fut, R>(
    items: I,
    max_in_flight: Option<usize>,
    f: F,
) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    match max_in_flight {
        Some(limit) => {
            stream::iter(items)
                .map(f)
                .buffer_unordered(limit.max(1))
                .collect()
                .await
        }
        None => join_all(items.into_iter().map(f)).await,
    }
}
