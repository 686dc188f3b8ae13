use super::{fan_out, CronJob};
use crate::metrics::ACTOR_PULSE_FAILURES;
use crate::{ActorDirectory, Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Gives every live local actor a chance to run autonomous work.
pub struct PulserCron {
    directory: Arc<dyn ActorDirectory>,
    max_in_flight: Option<usize>,
}

impl PulserCron {
    pub fn new(directory: Arc<dyn ActorDirectory>, max_in_flight: Option<usize>) -> Self {
        Self {
            directory,
            max_in_flight,
        }
    }

    /// Pulses every actor and returns the failures. One failing actor never
    /// stops the others.
    pub async fn pulse_all(&self) -> Vec<(String, Error)> {
        let ids = self.directory.list_local_ids().await;
        let directory = &self.directory;
        let results = fan_out(ids, self.max_in_flight, |id| async move {
            let result = match directory.lookup(&id).await {
                // mid-shutdown or gone: pulsing would race with teardown
                Some(actor) if !actor.is_shutting_down() => actor.pulse().await,
                _ => Ok(()),
            };
            (id, result)
        })
        .await;

        let failures: Vec<(String, Error)> = results
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|err| (id, err)))
            .collect();
        ACTOR_PULSE_FAILURES.inc_by(failures.len() as u64);
        failures
    }
}

#[async_trait]
impl CronJob for PulserCron {
    fn name(&self) -> &'static str {
        "pulser"
    }

    async fn tick(&self) -> Result<()> {
        let failures = self.pulse_all().await;
        if failures.is_empty() {
            debug!("Pulsing done");
        } else {
            debug!(?failures, "Some actors failed to pulse");
        }
        Ok(())
    }
}
