use super::{fan_out, CronJob};
use crate::metrics::ACTORS_EVICTED;
use crate::{ActorDirectory, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Deletes local actors that stopped making progress.
pub struct RipperCron {
    directory: Arc<dyn ActorDirectory>,
    max_in_flight: Option<usize>,
}

impl RipperCron {
    pub fn new(directory: Arc<dyn ActorDirectory>, max_in_flight: Option<usize>) -> Self {
        Self {
            directory,
            max_in_flight,
        }
    }

    /// Reaps deadlocked actors and returns their ids.
    pub async fn reap(&self) -> BTreeSet<String> {
        let mut dead = BTreeSet::new();
        for id in self.directory.list_local_ids().await {
            // already gone (e.g. evicted by the lease cron): nothing to reap
            if let Some(actor) = self.directory.lookup(&id).await {
                if !actor.has_made_progress() {
                    dead.insert(id);
                }
            }
        }

        let directory = &self.directory;
        let results = fan_out(
            dead.iter().cloned(),
            self.max_in_flight,
            |id: String| async move {
                let result = directory.delete(&id).await;
                (id, result)
            },
        )
        .await;
        for (id, result) in results {
            match result {
                Ok(()) => ACTORS_EVICTED.with_label_values(&["no_progress"]).inc(),
                Err(err) => error!(actor_id = %id, error = %err, "Cannot reap actor"),
            }
        }

        if dead.is_empty() {
            debug!("No deadlocked actors");
        } else {
            warn!(ids = ?dead, "Got rid of deadlocked actors");
        }
        dead
    }
}

#[async_trait]
impl CronJob for RipperCron {
    fn name(&self) -> &'static str {
        "ripper"
    }

    async fn tick(&self) -> Result<()> {
        self.reap().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDirectory;

    #[tokio::test]
    async fn reaps_exactly_the_stalled_actors() {
        let directory = FakeDirectory::with_actors(&["ca1", "ca2", "ca3", "ca4"]);
        directory.actor("ca2").unwrap().stall();
        directory.actor("ca4").unwrap().stall();
        let ripper = RipperCron::new(directory.clone(), None);

        let reaped = ripper.reap().await;

        let expected: BTreeSet<String> = ["ca2", "ca4"].iter().map(|id| id.to_string()).collect();
        assert_eq!(reaped, expected);
        assert_eq!(directory.deleted(), vec!["ca2", "ca4"]);
        assert!(directory.actor("ca1").is_some());
        assert!(directory.actor("ca3").is_some());
    }

    #[tokio::test]
    async fn reaps_from_a_spawned_tick() {
        let directory = FakeDirectory::with_actors(&["ca1", "ca2"]);
        directory.actor("ca1").unwrap().stall();
        let ripper = Arc::new(RipperCron::new(directory.clone(), Some(2)));

        let job: Arc<dyn CronJob> = ripper;
        tokio::spawn(async move { job.tick().await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(directory.deleted(), vec!["ca1"]);
    }

    #[tokio::test]
    async fn vanished_actor_is_not_an_error() {
        let directory = FakeDirectory::with_actors(&["ca1"]);
        directory.add_ghost("ghost");
        let ripper = RipperCron::new(directory.clone(), Some(1));

        assert!(ripper.reap().await.is_empty());
        assert!(ripper.tick().await.is_ok());
        assert!(directory.deleted().is_empty());
    }

    #[tokio::test]
    async fn healthy_fleet_is_untouched() {
        let directory = FakeDirectory::with_actors(&["ca1", "ca2"]);
        let ripper = RipperCron::new(directory.clone(), Some(4));

        assert!(ripper.reap().await.is_empty());
        assert_eq!(directory.list_local_ids().await.len(), 2);
    }
}
