//! The external lease service, seen through the operations this crate needs.

use crate::{NodeToken, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Public node token -> private node token, for every live node.
pub type BindingTable = BTreeMap<NodeToken, NodeToken>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabOutcome {
    Granted,
    /// Somebody else holds a live lease.
    Held { owner: NodeToken },
}

impl GrabOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, GrabOutcome::Granted)
    }
}

/// Atomic key leases. Implementations must guarantee that at most one
/// unexpired lease exists per id; no in-process locking substitutes for that.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn grab(&self, id: &str, owner: &NodeToken, timeout: Duration) -> Result<GrabOutcome>;

    /// Extends every lease in `ids` held by `owner` and returns the ids that
    /// could not be extended.
    async fn renew(
        &self,
        ids: &BTreeSet<String>,
        owner: &NodeToken,
        timeout: Duration,
    ) -> Result<BTreeSet<String>>;

    /// Binds `private` to a free public token from `pool` and returns it.
    async fn grab_node_lease(
        &self,
        pool: &[NodeToken],
        private: &NodeToken,
        timeout: Duration,
    ) -> Result<NodeToken>;

    async fn renew_node_lease(&self, private: &NodeToken, timeout: Duration) -> Result<()>;

    async fn list_nodes(&self, pool: &[NodeToken]) -> Result<BindingTable>;
}
