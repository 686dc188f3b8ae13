//! In-process lease store.
//!
//! All state sits behind one async mutex, which gives every operation the
//! compare-and-set atomicity the [`LeaseStore`] contract asks for. Expiry uses
//! `tokio::time::Instant`, so a paused test clock drives it.

use crate::store::{BindingTable, GrabOutcome, LeaseStore};
use crate::{Error, NodeToken, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
struct Lease {
    owner: NodeToken,
    expires_at: Instant,
}

impl Lease {
    fn new(owner: NodeToken, timeout: Duration) -> Self {
        Self {
            owner,
            expires_at: Instant::now() + timeout,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct StoreState {
    /// actor id -> lease
    actors: HashMap<String, Lease>,
    /// public node token -> lease owned by a private node token
    nodes: HashMap<NodeToken, Lease>,
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current owner of `id`, if its lease is live.
    pub async fn owner_of(&self, id: &str) -> Option<NodeToken> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .actors
            .get(id)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.owner.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn grab(&self, id: &str, owner: &NodeToken, timeout: Duration) -> Result<GrabOutcome> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if let Some(lease) = state.actors.get(id) {
            if lease.is_live(now) && &lease.owner != owner {
                return Ok(GrabOutcome::Held {
                    owner: lease.owner.clone(),
                });
            }
        }
        trace!(actor_id = %id, %owner, "lease granted");
        state
            .actors
            .insert(id.to_string(), Lease::new(owner.clone(), timeout));
        Ok(GrabOutcome::Granted)
    }

    async fn renew(
        &self,
        ids: &BTreeSet<String>,
        owner: &NodeToken,
        timeout: Duration,
    ) -> Result<BTreeSet<String>> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut failed = BTreeSet::new();
        for id in ids {
            match state.actors.get_mut(id) {
                Some(lease) if lease.is_live(now) && &lease.owner == owner => {
                    lease.expires_at = now + timeout;
                }
                _ => {
                    failed.insert(id.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn grab_node_lease(
        &self,
        pool: &[NodeToken],
        private: &NodeToken,
        timeout: Duration,
    ) -> Result<NodeToken> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        // a binding this node still holds wins over any free one
        let held = pool.iter().find(|public| {
            state
                .nodes
                .get(*public)
                .is_some_and(|lease| lease.is_live(now) && &lease.owner == private)
        });
        let free = held.or_else(|| {
            pool.iter().find(|public| match state.nodes.get(*public) {
                Some(lease) => !lease.is_live(now),
                None => true,
            })
        });
        match free {
            Some(public) => {
                let public = public.clone();
                state
                    .nodes
                    .insert(public.clone(), Lease::new(private.clone(), timeout));
                Ok(public)
            }
            None => Err(Error::NodePoolExhausted(pool.len())),
        }
    }

    async fn renew_node_lease(&self, private: &NodeToken, timeout: Duration) -> Result<()> {
        self.check_available()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let lease = state
            .nodes
            .values_mut()
            .find(|lease| lease.is_live(now) && &lease.owner == private)
            .ok_or_else(|| Error::NodeLeaseLost(private.to_string()))?;
        lease.expires_at = now + timeout;
        Ok(())
    }

    async fn list_nodes(&self, pool: &[NodeToken]) -> Result<BindingTable> {
        self.check_available()?;
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(pool
            .iter()
            .filter_map(|public| {
                state
                    .nodes
                    .get(public)
                    .filter(|lease| lease.is_live(now))
                    .map(|lease| (public.clone(), lease.owner.clone()))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn concurrent_grabs_yield_one_owner() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (n1, n2) = (NodeToken::new("n1"), NodeToken::new("n2"));

        let (a, b) = tokio::join!(
            store.grab("ca1", &n1, TIMEOUT),
            store.grab("ca1", &n2, TIMEOUT)
        );
        let outcomes = [a.unwrap(), b.unwrap()];

        let granted = outcomes.iter().filter(|o| o.is_granted()).count();
        assert_eq!(granted, 1);
        let winner = store.owner_of("ca1").await.unwrap();
        let loser_view = outcomes.iter().find(|o| !o.is_granted()).unwrap();
        assert_eq!(loser_view, &GrabOutcome::Held { owner: winner });
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_renewal_keeps_ownership() {
        let store = InMemoryLeaseStore::new();
        let owner = NodeToken::new("n1");
        store.grab("ca1", &owner, TIMEOUT).await.unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(3)).await;
            let failed = store.renew(&ids(&["ca1"]), &owner, TIMEOUT).await.unwrap();
            assert!(failed.is_empty());
            assert_eq!(store.owner_of("ca1").await, Some(owner.clone()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_grabbable_after_expiry() {
        let store = InMemoryLeaseStore::new();
        let (a, b) = (NodeToken::new("A"), NodeToken::new("B"));

        assert!(store.grab("ca1", &a, TIMEOUT).await.unwrap().is_granted());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(store.renew(&ids(&["ca1"]), &a, TIMEOUT).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.grab("ca1", &b, TIMEOUT).await.unwrap(),
            GrabOutcome::Held { owner: a.clone() }
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.grab("ca1", &b, TIMEOUT).await.unwrap().is_granted());
        assert_eq!(store.owner_of("ca1").await, Some(b));
    }

    #[tokio::test(start_paused = true)]
    async fn renew_reports_lost_and_unknown_ids() {
        let store = InMemoryLeaseStore::new();
        let (a, b) = (NodeToken::new("A"), NodeToken::new("B"));
        store.grab("mine", &a, TIMEOUT).await.unwrap();
        store.grab("theirs", &b, TIMEOUT).await.unwrap();

        let failed = store
            .renew(&ids(&["mine", "theirs", "unknown"]), &a, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(failed, ids(&["theirs", "unknown"]));
    }

    #[tokio::test(start_paused = true)]
    async fn node_leases_bind_pool_entries_in_order() {
        let store = InMemoryLeaseStore::new();
        let pool: Vec<NodeToken> = ["foo.com:3000", "foo.com:3001"]
            .into_iter()
            .map(NodeToken::from)
            .collect();
        let (p1, p2, p3) = (
            NodeToken::new("10.0.0.1:3000"),
            NodeToken::new("10.0.0.2:3000"),
            NodeToken::new("10.0.0.3:3000"),
        );

        assert_eq!(store.grab_node_lease(&pool, &p1, TIMEOUT).await.unwrap(), pool[0]);
        assert_eq!(store.grab_node_lease(&pool, &p2, TIMEOUT).await.unwrap(), pool[1]);
        assert_eq!(
            store.grab_node_lease(&pool, &p3, TIMEOUT).await,
            Err(Error::NodePoolExhausted(2))
        );

        let table = store.list_nodes(&pool).await.unwrap();
        assert_eq!(table.get(&pool[0]), Some(&p1));
        assert_eq!(table.get(&pool[1]), Some(&p2));

        tokio::time::advance(Duration::from_secs(3)).await;
        store.renew_node_lease(&p1, TIMEOUT).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let table = store.list_nodes(&pool).await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(
            store.renew_node_lease(&p2, TIMEOUT).await,
            Err(Error::NodeLeaseLost(p2.to_string()))
        );
        assert_eq!(store.grab_node_lease(&pool, &p3, TIMEOUT).await.unwrap(), pool[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn node_lease_regrab_keeps_the_held_entry() {
        let store = InMemoryLeaseStore::new();
        let pool: Vec<NodeToken> = ["foo.com:3000", "foo.com:3001"]
            .into_iter()
            .map(NodeToken::from)
            .collect();
        let (first, second) = (NodeToken::new("10.0.0.1:3000"), NodeToken::new("10.0.0.2:3000"));
        store.grab_node_lease(&pool, &first, TIMEOUT).await.unwrap();
        store.grab_node_lease(&pool, &second, TIMEOUT).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        store.renew_node_lease(&second, TIMEOUT).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        // pool[0] is free again, but `second` already owns pool[1]
        assert_eq!(
            store.grab_node_lease(&pool, &second, TIMEOUT).await.unwrap(),
            pool[1]
        );
        let table = store.list_nodes(&pool).await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&pool[1]), Some(&second));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryLeaseStore::new();
        store.set_available(false);
        let owner = NodeToken::new("n1");
        assert!(matches!(
            store.grab("ca1", &owner, TIMEOUT).await,
            Err(Error::StoreUnavailable(_))
        ));
        assert!(store.renew(&ids(&["ca1"]), &owner, TIMEOUT).await.is_err());
        assert!(store.list_nodes(&[]).await.is_err());

        store.set_available(true);
        assert!(store.grab("ca1", &owner, TIMEOUT).await.unwrap().is_granted());
    }
}
