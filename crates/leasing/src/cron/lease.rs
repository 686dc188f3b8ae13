use super::CronJob;
use crate::metrics::ACTORS_EVICTED;
use crate::{ActorDirectory, LeaseClient, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Renews the leases of every local actor and drops the actors whose lease
/// is gone.
///
/// When the store cannot be reached nothing else happens: every actor
/// operation re-checks its lease before committing, so a missed renewal cannot
/// leak a stale write.
pub struct LeaseCron {
    lease: Arc<LeaseClient>,
    directory: Arc<dyn ActorDirectory>,
}

impl LeaseCron {
    pub fn new(lease: Arc<LeaseClient>, directory: Arc<dyn ActorDirectory>) -> Self {
        Self { lease, directory }
    }

    /// Renews all local leases, returning the ids whose actors were evicted.
    pub async fn renew_all(&self) -> Result<BTreeSet<String>> {
        let alive = self.directory.list_local_ids().await;
        let gone = self.lease.renew(&alive).await?;
        if gone.is_empty() {
            return Ok(gone);
        }

        warn!(ids = ?gone, "Lost leases, evicting local actors");
        let deletions = futures::future::join_all(gone.iter().map(|id| async move {
            (id, self.directory.delete(id).await)
        }))
        .await;
        for (id, result) in deletions {
            match result {
                Ok(()) => ACTORS_EVICTED.with_label_values(&["lease_lost"]).inc(),
                Err(err) => error!(actor_id = %id, error = %err, "Cannot delete actor"),
            }
        }
        Ok(gone)
    }
}

#[async_trait]
impl CronJob for LeaseCron {
    fn name(&self) -> &'static str {
        "lease"
    }

    async fn tick(&self) -> Result<()> {
        let gone = self.renew_all().await?;
        debug!(evicted = gone.len(), "Leases renewed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDirectory;
    use crate::{Error, InMemoryLeaseStore, LeaseStore, NodeIdentity, NodeToken};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn setup(ids: &[&str]) -> (Arc<InMemoryLeaseStore>, Arc<FakeDirectory>, LeaseCron) {
        let store = Arc::new(InMemoryLeaseStore::new());
        let lease = Arc::new(LeaseClient::new(
            store.clone(),
            NodeIdentity::preset("A".into()),
            TIMEOUT,
        ));
        for id in ids {
            lease.grab(id).await.unwrap();
        }
        let directory = FakeDirectory::with_actors(ids);
        let cron = LeaseCron::new(lease, directory.clone());
        (store, directory, cron)
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_evicts_exactly_that_actor() {
        let (store, directory, cron) = setup(&["ca1", "ca2", "ca3"]).await;

        // ca2 expires locally and is taken by node B
        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;
        store.grab("ca2", &NodeToken::new("B"), TIMEOUT).await.unwrap();
        for id in ["ca1", "ca3"] {
            store.grab(id, &NodeToken::new("A"), TIMEOUT).await.unwrap();
        }

        let gone = cron.renew_all().await.unwrap();

        assert_eq!(gone, BTreeSet::from(["ca2".to_string()]));
        assert_eq!(directory.deleted(), vec!["ca2"]);
        assert!(directory.lookup("ca2").await.is_none());
        assert!(directory.lookup("ca1").await.is_some());
        assert!(directory.lookup("ca3").await.is_some());
    }

    #[tokio::test]
    async fn steady_state_tick_only_extends_leases() {
        let (_, directory, cron) = setup(&["ca1", "ca2"]).await;

        for _ in 0..3 {
            assert!(cron.renew_all().await.unwrap().is_empty());
        }
        assert!(directory.deleted().is_empty());
    }

    #[tokio::test]
    async fn unreachable_store_leaves_actors_alone() {
        let (store, directory, cron) = setup(&["ca1", "ca2"]).await;
        store.set_available(false);

        assert!(matches!(cron.tick().await, Err(Error::StoreUnavailable(_))));
        assert!(directory.deleted().is_empty());
        assert_eq!(directory.list_local_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_delete_does_not_block_the_others() {
        let (_, directory, cron) = setup(&[]).await;
        for id in ["x1", "x2", "x3"] {
            directory.insert(crate::testing::FakeActor::new(id));
        }
        directory.refuse_delete("x2");

        let gone = cron.renew_all().await.unwrap();

        assert_eq!(gone.len(), 3);
        assert_eq!(directory.deleted(), vec!["x1", "x3"]);
    }
}
