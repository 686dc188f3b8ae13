//! Capabilities this crate consumes from the actor runtime.

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A live, locally hosted actor.
#[async_trait]
pub trait ActorHandle: Send + Sync {
    fn id(&self) -> &str;

    /// `false` when the actor has work pending but completed nothing since the
    /// previous call. Each call starts a new observation window.
    fn has_made_progress(&self) -> bool;

    fn is_shutting_down(&self) -> bool;

    /// Lets the actor do autonomous background work.
    async fn pulse(&self) -> Result<()>;

    async fn deliver(&self, message: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateOptions {
    /// Create the actor when it is not hosted here yet.
    pub allow_create: bool,
}

/// Local map from actor id to live actor.
#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn list_local_ids(&self) -> BTreeSet<String>;

    async fn lookup(&self, id: &str) -> Option<Arc<dyn ActorHandle>>;

    /// Fails with [`crate::Error::NoSuchActor`] when the actor is absent and
    /// creation is not allowed, or [`crate::Error::RemoteOwner`] when another
    /// node holds its lease.
    async fn create_or_fetch(&self, id: &str, opts: CreateOptions)
        -> Result<Arc<dyn ActorHandle>>;

    async fn delete(&self, id: &str) -> Result<()>;
}
