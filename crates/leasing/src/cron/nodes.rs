use super::CronJob;
use crate::{NodeRegistry, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Bookkeeping for the node registry: node lease renewal plus binding refresh.
pub struct NodesCron {
    registry: Arc<NodeRegistry>,
}

impl NodesCron {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CronJob for NodesCron {
    fn name(&self) -> &'static str {
        "nodes"
    }

    async fn tick(&self) -> Result<()> {
        // the registry shuts the node down itself on failure
        self.registry.pulse().await?;
        debug!(version = self.registry.version(), "Nodes pulsing done");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        InMemoryLeaseStore, NodeIdentity, NodePool, NodeRegistryConfig, PublicNodeRange, Shutdown,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn tick_refreshes_and_failure_shuts_down() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let shutdown = Shutdown::new();
        let registry = NodeRegistry::start(
            store.clone(),
            "10.0.0.1:3000".into(),
            &NodeIdentity::new(),
            NodeRegistryConfig {
                lease_timeout: Duration::from_secs(5),
                stealth: false,
                pool: NodePool::expand(&[PublicNodeRange::new("foo.com", 3000, 3001)]),
            },
            shutdown.clone(),
        )
        .await
        .unwrap();
        let registry = Arc::new(registry);
        let cron = NodesCron::new(registry.clone());

        cron.tick().await.unwrap();
        assert_eq!(registry.version(), 1);
        assert!(!shutdown.is_triggered());

        store.set_available(false);
        assert!(cron.tick().await.is_err());
        assert!(shutdown.is_triggered());
    }
}
