use crate::metrics::{LEASE_GRAB_TOTALS, LEASE_RENEW_FAILURES};
use crate::store::{GrabOutcome, LeaseStore};
use crate::{Error, NodeIdentity, NodeToken, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Grants and renews actor leases on behalf of this node.
///
/// Leases are owned by the node's routing token, so the same token that
/// routes a client here is the one other nodes redirect to. Store failures are
/// returned as-is; retrying is up to the caller.
pub struct LeaseClient {
    store: Arc<dyn LeaseStore>,
    identity: NodeIdentity,
    timeout: Duration,
}

impl LeaseClient {
    pub fn new(store: Arc<dyn LeaseStore>, identity: NodeIdentity, timeout: Duration) -> Self {
        debug!(?timeout, "New lease client");
        Self {
            store,
            identity,
            timeout,
        }
    }

    /// How long a lease lasts; renewal periods must stay below it.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn owner(&self) -> Result<&NodeToken> {
        self.identity.get().ok_or(Error::IdentityUnknown)
    }

    /// Tries to become the exclusive owner of `id`.
    pub async fn grab(&self, id: &str) -> Result<GrabOutcome> {
        let owner = self.owner()?;
        let outcome = self.store.grab(id, owner, self.timeout).await;
        let status = match &outcome {
            Ok(GrabOutcome::Granted) => "granted",
            Ok(GrabOutcome::Held { .. }) => "held",
            Err(_) => "error",
        };
        LEASE_GRAB_TOTALS.with_label_values(&[status]).inc();
        outcome
    }

    /// Renews the leases of `ids` and returns the ones that were not renewed.
    pub async fn renew(&self, ids: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let owner = self.owner()?;
        let failed = self.store.renew(ids, owner, self.timeout).await?;
        LEASE_RENEW_FAILURES.inc_by(failed.len() as u64);
        Ok(failed)
    }
}
