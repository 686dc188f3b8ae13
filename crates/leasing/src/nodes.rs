//! Registry of the nodes in the fleet.
//!
//! A node is known by a private token (internal address, cheap to reach from
//! inside the data center) and a public token leased from a finite pool of
//! routable `hostname:port` names. At startup the registry leases a public
//! token for this node; afterwards a cron keeps that lease alive and refreshes
//! the cached public -> private bindings of every live node.

use crate::metrics::{NODE_BINDINGS_KNOWN, NODE_BINDINGS_VERSION};
use crate::store::{BindingTable, LeaseStore};
use crate::{NodeIdentity, NodeToken, Result, Shutdown};
use parking_lot::{Mutex, RwLock};
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A routable hostname together with an inclusive range of ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicNodeRange {
    pub hostname: String,
    pub port_range: (u16, u16),
}

impl PublicNodeRange {
    pub fn new(hostname: impl Into<String>, first_port: u16, last_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port_range: (first_port, last_port),
        }
    }

    pub fn tokens(&self) -> impl Iterator<Item = NodeToken> + '_ {
        let (first, last) = self.port_range;
        (first..=last).map(move |port| NodeToken::from_host_port(&self.hostname, port))
    }
}

/// Every public token this fleet may hand out, in lease order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePool(Vec<NodeToken>);

impl NodePool {
    pub fn expand(ranges: &[PublicNodeRange]) -> Self {
        Self(ranges.iter().flat_map(PublicNodeRange::tokens).collect())
    }

    pub fn from_tokens(tokens: Vec<NodeToken>) -> Self {
        Self(tokens)
    }

    pub fn tokens(&self) -> &[NodeToken] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NodeRegistryConfig {
    pub lease_timeout: Duration,
    /// Skip public registration, e.g. for introspection nodes that must not
    /// receive routed traffic.
    pub stealth: bool,
    pub pool: NodePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeFn = Arc<dyn Fn(u64) + Send + Sync>;
pub type CloseFn = Box<dyn Fn(&str) + Send + Sync>;

struct Listener {
    id: ListenerId,
    on_change: ChangeFn,
    on_close: Option<CloseFn>,
}

struct Bindings {
    version: u64,
    table: BindingTable,
}

pub struct NodeRegistry {
    store: Arc<dyn LeaseStore>,
    config: NodeRegistryConfig,
    private_token: NodeToken,
    public_token: Option<NodeToken>,
    bindings: RwLock<Bindings>,
    listeners: Mutex<Vec<Listener>>,
    next_listener: AtomicU64,
    shutdown: Shutdown,
}

impl NodeRegistry {
    /// Registers this node, leasing a public token unless it runs in stealth
    /// mode. Failing to obtain one is fatal: the node has no identity to serve
    /// traffic under.
    pub async fn start(
        store: Arc<dyn LeaseStore>,
        private_token: NodeToken,
        identity: &NodeIdentity,
        config: NodeRegistryConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let public_token = if config.stealth {
            info!(private = %private_token, "Stealth node, skipping public registration");
            None
        } else {
            let granted = store
                .grab_node_lease(config.pool.tokens(), &private_token, config.lease_timeout)
                .await?;
            let token = identity.assign(granted.clone());
            if token != granted {
                warn!(%granted, in_effect = %token, "Node identity was already assigned");
            }
            info!(public = %granted, private = %private_token, "Registered node");
            Some(granted)
        };

        Ok(Self {
            store,
            config,
            private_token,
            public_token,
            bindings: RwLock::new(Bindings {
                version: 0,
                table: BindingTable::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            shutdown,
        })
    }

    /// The public token leased at startup, `None` for stealth nodes.
    pub fn node_token(&self) -> Option<&NodeToken> {
        self.public_token.as_ref()
    }

    pub fn private_token(&self) -> &NodeToken {
        &self.private_token
    }

    pub fn all_public_tokens(&self) -> &[NodeToken] {
        self.config.pool.tokens()
    }

    pub fn version(&self) -> u64 {
        self.bindings.read().version
    }

    pub fn bindings(&self) -> BindingTable {
        self.bindings.read().table.clone()
    }

    /// Private token of the node currently bound to `public`.
    pub fn private_for(&self, public: &NodeToken) -> Option<NodeToken> {
        self.bindings.read().table.get(public).cloned()
    }

    /// Registers for binding changes (called with the new version) and,
    /// optionally, for the final close notification.
    pub fn on_change<F>(&self, on_change: F, on_close: Option<CloseFn>) -> ListenerId
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Listener {
            id,
            on_change: Arc::new(on_change),
            on_close,
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|listener| listener.id != id);
        listeners.len() != before
    }

    /// Notifies close listeners with `reason` and drops every listener.
    pub fn close(&self, reason: &str) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            if let Some(on_close) = &listener.on_close {
                on_close(reason);
            }
        }
    }

    /// One bookkeeping cycle: renew our node lease, then refresh bindings.
    ///
    /// Any failure shuts the node down; it must not keep serving traffic under
    /// a public identity it may no longer own.
    pub async fn pulse(&self) -> Result<()> {
        let result = async {
            self.renew_node_lease().await?;
            self.refresh_nodes().await
        }
        .await;
        if let Err(err) = &result {
            warn!(error = %err, "Node registry failure, shutting down");
            let reason = format!("node registry: {err}");
            self.close(&reason);
            self.shutdown.trigger(reason);
        }
        result
    }

    async fn renew_node_lease(&self) -> Result<()> {
        if self.public_token.is_none() {
            return Ok(());
        }
        self.store
            .renew_node_lease(&self.private_token, self.config.lease_timeout)
            .await
    }

    async fn refresh_nodes(&self) -> Result<()> {
        let table = self.store.list_nodes(self.config.pool.tokens()).await?;
        let new_version = {
            let mut bindings = self.bindings.write();
            if bindings.table == table {
                None
            } else {
                bindings.table = table;
                bindings.version += 1;
                NODE_BINDINGS_KNOWN.set(bindings.table.len() as i64);
                Some(bindings.version)
            }
        };
        if let Some(version) = new_version {
            debug!(version, "Node bindings changed");
            NODE_BINDINGS_VERSION.set(version as i64);
            // snapshot so listeners may (un)register from inside the callback
            let callbacks: Vec<ChangeFn> = self
                .listeners
                .lock()
                .iter()
                .map(|listener| listener.on_change.clone())
                .collect();
            for callback in callbacks {
                callback(version);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, InMemoryLeaseStore};
    use std::sync::atomic::AtomicUsize;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn config(stealth: bool) -> NodeRegistryConfig {
        NodeRegistryConfig {
            lease_timeout: TIMEOUT,
            stealth,
            pool: NodePool::expand(&[
                PublicNodeRange::new("foo.com", 3000, 3002),
                PublicNodeRange::new("bar.com", 3000, 3000),
            ]),
        }
    }

    async fn start(
        store: &Arc<InMemoryLeaseStore>,
        private: &str,
        stealth: bool,
    ) -> (NodeRegistry, NodeIdentity, Shutdown) {
        let identity = NodeIdentity::new();
        let shutdown = Shutdown::new();
        let registry = NodeRegistry::start(
            store.clone(),
            private.into(),
            &identity,
            config(stealth),
            shutdown.clone(),
        )
        .await
        .unwrap();
        (registry, identity, shutdown)
    }

    #[test]
    fn pool_expands_ranges_in_order() {
        let pool = config(false).pool;
        let names: Vec<&str> = pool.tokens().iter().map(NodeToken::as_str).collect();
        assert_eq!(
            names,
            ["foo.com:3000", "foo.com:3001", "foo.com:3002", "bar.com:3000"]
        );
    }

    #[tokio::test]
    async fn startup_assigns_public_identity() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, identity, _) = start(&store, "10.0.0.1:3000", false).await;

        assert_eq!(registry.node_token().map(NodeToken::as_str), Some("foo.com:3000"));
        assert_eq!(identity.get(), registry.node_token());
        assert_eq!(registry.private_token().as_str(), "10.0.0.1:3000");
    }

    #[tokio::test]
    async fn stealth_node_does_not_register() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, identity, _) = start(&store, "10.0.0.1:3000", true).await;

        assert!(registry.node_token().is_none());
        assert!(!identity.is_known());
        registry.pulse().await.unwrap();
        assert_eq!(registry.version(), 0);
        assert!(registry.bindings().is_empty());
    }

    #[tokio::test]
    async fn startup_fails_when_pool_is_exhausted() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let pool = NodePool::from_tokens(vec!["foo.com:3000".into()]);
        let cfg = NodeRegistryConfig {
            lease_timeout: TIMEOUT,
            stealth: false,
            pool,
        };
        let first = NodeRegistry::start(
            store.clone(),
            "10.0.0.1:1".into(),
            &NodeIdentity::new(),
            cfg.clone(),
            Shutdown::new(),
        )
        .await;
        assert!(first.is_ok());

        let second = NodeRegistry::start(
            store,
            "10.0.0.2:1".into(),
            &NodeIdentity::new(),
            cfg,
            Shutdown::new(),
        )
        .await;
        assert!(matches!(second, Err(Error::NodePoolExhausted(1))));
    }

    #[tokio::test]
    async fn changed_bindings_bump_version_once_and_notify_in_order() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, _, _) = start(&store, "10.0.0.1:3000", false).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let seen = seen.clone();
            registry.on_change(move |version| seen.lock().push((name, version)), None);
        }

        registry.pulse().await.unwrap();
        assert_eq!(registry.version(), 1);
        assert_eq!(*seen.lock(), vec![("first", 1), ("second", 1)]);
        assert_eq!(
            registry.private_for(&"foo.com:3000".into()),
            Some("10.0.0.1:3000".into())
        );

        // unchanged table: no notification
        registry.pulse().await.unwrap();
        assert_eq!(registry.version(), 1);
        assert_eq!(seen.lock().len(), 2);

        // a second node joins
        let (_other, _, _) = start(&store, "10.0.0.2:3000", false).await;
        registry.pulse().await.unwrap();
        assert_eq!(registry.version(), 2);
        assert_eq!(registry.bindings().len(), 2);
        assert_eq!(*seen.lock(), vec![("first", 1), ("second", 1), ("first", 2), ("second", 2)]);
    }

    #[tokio::test]
    async fn removed_listener_is_not_notified() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, _, _) = start(&store, "10.0.0.1:3000", false).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let id = {
            let calls = calls.clone();
            registry.on_change(
                move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
        };

        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        registry.pulse().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn store_failure_shuts_the_node_down() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, _, shutdown) = start(&store, "10.0.0.1:3000", false).await;
        let closed = Arc::new(Mutex::new(None));
        {
            let closed = closed.clone();
            registry.on_change(
                |_| {},
                Some(Box::new(move |reason: &str| {
                    *closed.lock() = Some(reason.to_string())
                })),
            );
        }

        store.set_available(false);
        assert!(registry.pulse().await.is_err());

        assert!(shutdown.is_triggered());
        assert!(closed.lock().as_deref().unwrap().starts_with("node registry"));
        assert!(!registry.remove_listener(ListenerId(0)));
        assert_eq!(registry.version(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_node_lease_stops_before_refresh() {
        let store = Arc::new(InMemoryLeaseStore::new());
        let (registry, _, shutdown) = start(&store, "10.0.0.1:3000", false).await;

        tokio::time::advance(TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(
            registry.pulse().await,
            Err(Error::NodeLeaseLost("10.0.0.1:3000".to_string()))
        );
        assert!(shutdown.is_triggered());
        assert_eq!(registry.version(), 0);
    }
}
