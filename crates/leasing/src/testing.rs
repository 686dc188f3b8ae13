//! Test doubles for the actor runtime and the lease store.

use crate::directory::{ActorDirectory, ActorHandle, CreateOptions};
use crate::store::{BindingTable, GrabOutcome, LeaseStore};
use crate::{Error, NodeToken, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct FakeActor {
    id: String,
    progressing: AtomicBool,
    shutting_down: AtomicBool,
    failing_pulse: AtomicBool,
    pulses: AtomicUsize,
}

impl FakeActor {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            progressing: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            failing_pulse: AtomicBool::new(false),
            pulses: AtomicUsize::new(0),
        })
    }

    pub fn stall(&self) {
        self.progressing.store(false, Ordering::SeqCst);
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn fail_pulses(&self) {
        self.failing_pulse.store(true, Ordering::SeqCst);
    }

    pub fn pulses(&self) -> usize {
        self.pulses.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActorHandle for FakeActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_made_progress(&self) -> bool {
        self.progressing.load(Ordering::SeqCst)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn pulse(&self) -> Result<()> {
        self.pulses.fetch_add(1, Ordering::SeqCst);
        if self.failing_pulse.load(Ordering::SeqCst) {
            return Err(Error::ActorFailure {
                id: self.id.clone(),
                reason: "pulse failed".to_string(),
            });
        }
        Ok(())
    }

    async fn deliver(&self, message: Value) -> Result<Value> {
        Ok(json!({ "actor": self.id, "echo": message }))
    }
}

/// Directory over [`FakeActor`]s with scripted failures.
#[derive(Default)]
pub struct FakeDirectory {
    actors: Mutex<BTreeMap<String, Arc<FakeActor>>>,
    /// Listed by `list_local_ids` but gone by the time they are looked up.
    ghosts: Mutex<BTreeSet<String>>,
    undeletable: Mutex<BTreeSet<String>>,
    deleted: Mutex<Vec<String>>,
}

impl FakeDirectory {
    pub fn with_actors(ids: &[&str]) -> Arc<Self> {
        let directory = Self::default();
        for id in ids {
            directory.insert(FakeActor::new(id));
        }
        Arc::new(directory)
    }

    pub fn insert(&self, actor: Arc<FakeActor>) {
        self.actors.lock().insert(actor.id.clone(), actor);
    }

    pub fn actor(&self, id: &str) -> Option<Arc<FakeActor>> {
        self.actors.lock().get(id).cloned()
    }

    pub fn add_ghost(&self, id: &str) {
        self.ghosts.lock().insert(id.to_string());
    }

    pub fn refuse_delete(&self, id: &str) {
        self.undeletable.lock().insert(id.to_string());
    }

    pub fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().clone();
        deleted.sort();
        deleted
    }
}

#[async_trait]
impl ActorDirectory for FakeDirectory {
    async fn list_local_ids(&self) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = self.actors.lock().keys().cloned().collect();
        ids.extend(self.ghosts.lock().iter().cloned());
        ids
    }

    async fn lookup(&self, id: &str) -> Option<Arc<dyn ActorHandle>> {
        self.actor(id).map(|actor| actor as Arc<dyn ActorHandle>)
    }

    async fn create_or_fetch(
        &self,
        id: &str,
        opts: CreateOptions,
    ) -> Result<Arc<dyn ActorHandle>> {
        if let Some(actor) = self.actor(id) {
            return Ok(actor);
        }
        if !opts.allow_create {
            return Err(Error::NoSuchActor(id.to_string()));
        }
        let actor = FakeActor::new(id);
        self.insert(actor.clone());
        Ok(actor)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if self.undeletable.lock().contains(id) {
            return Err(Error::ActorFailure {
                id: id.to_string(),
                reason: "refused to stop".to_string(),
            });
        }
        self.actors.lock().remove(id);
        self.deleted.lock().push(id.to_string());
        Ok(())
    }
}

/// Wraps a store and counts the calls that reach it.
pub struct CountingStore<S> {
    inner: S,
    calls: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: LeaseStore> LeaseStore for CountingStore<S> {
    async fn grab(&self, id: &str, owner: &NodeToken, timeout: Duration) -> Result<GrabOutcome> {
        self.count();
        self.inner.grab(id, owner, timeout).await
    }

    async fn renew(
        &self,
        ids: &BTreeSet<String>,
        owner: &NodeToken,
        timeout: Duration,
    ) -> Result<BTreeSet<String>> {
        self.count();
        self.inner.renew(ids, owner, timeout).await
    }

    async fn grab_node_lease(
        &self,
        pool: &[NodeToken],
        private: &NodeToken,
        timeout: Duration,
    ) -> Result<NodeToken> {
        self.count();
        self.inner.grab_node_lease(pool, private, timeout).await
    }

    async fn renew_node_lease(&self, private: &NodeToken, timeout: Duration) -> Result<()> {
        self.count();
        self.inner.renew_node_lease(private, timeout).await
    }

    async fn list_nodes(&self, pool: &[NodeToken]) -> Result<BindingTable> {
        self.count();
        self.inner.list_nodes(pool).await
    }
}
