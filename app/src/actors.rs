//! A minimal in-process actor runtime: lease-guarded counters.

use async_trait::async_trait;
use leasing::{
    ActorDirectory, ActorHandle, CreateOptions, Error, GrabOutcome, LeaseClient, Result,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Progress observed at the previous liveness check.
#[derive(Default)]
struct ProgressMark {
    completed: u64,
    busy: bool,
}

struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CounterActor {
    id: String,
    lease: Arc<LeaseClient>,
    value: tokio::sync::Mutex<i64>,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    mark: Mutex<ProgressMark>,
    heartbeats: AtomicU64,
    shutting_down: AtomicBool,
}

impl CounterActor {
    pub fn new(id: &str, lease: Arc<LeaseClient>) -> Self {
        Self {
            id: id.to_string(),
            lease,
            value: tokio::sync::Mutex::new(0),
            in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            mark: Mutex::new(ProgressMark::default()),
            heartbeats: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub async fn increment(&self, by: i64) -> Result<i64> {
        self.ensure_running()?;
        let _in_flight = InFlight::enter(&self.in_flight);
        let mut value = self.value.lock().await;
        let next = value.saturating_add(by);
        self.commit().await?;
        *value = next;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    pub async fn get(&self) -> Result<i64> {
        self.ensure_running()?;
        let _in_flight = InFlight::enter(&self.in_flight);
        let value = *self.value.lock().await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!(actor_id = %self.id, "Actor shutting down");
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown(self.id.clone()));
        }
        Ok(())
    }

    /// Re-validates our lease before a state change takes effect. Routing only
    /// compares tokens, so this is the authoritative ownership check.
    async fn commit(&self) -> Result<()> {
        let ids = BTreeSet::from([self.id.clone()]);
        if self.lease.renew(&ids).await?.is_empty() {
            return Ok(());
        }
        warn!(actor_id = %self.id, "Lease lost at commit, dropping change");
        self.shutdown();
        Err(Error::LeaseLost(self.id.clone()))
    }
}

fn increment_amount(params: Option<&Value>) -> Option<i64> {
    match params {
        None | Some(Value::Null) => Some(1),
        Some(Value::Array(args)) if args.is_empty() => Some(1),
        Some(Value::Array(args)) => args[0].as_i64(),
        Some(other) => other.as_i64(),
    }
}

#[async_trait]
impl ActorHandle for CounterActor {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_made_progress(&self) -> bool {
        let completed = self.completed.load(Ordering::SeqCst);
        let busy = self.in_flight.load(Ordering::SeqCst) > 0;
        let mut mark = self.mark.lock();
        let stuck = busy && mark.busy && completed == mark.completed;
        *mark = ProgressMark { completed, busy };
        !stuck
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn pulse(&self) -> Result<()> {
        self.ensure_running()?;
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deliver(&self, message: Value) -> Result<Value> {
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        match method {
            "increment" => {
                let by = increment_amount(message.get("params")).ok_or_else(|| {
                    Error::ActorFailure {
                        id: self.id.clone(),
                        reason: "increment expects an integer".to_string(),
                    }
                })?;
                Ok(json!(self.increment(by).await?))
            }
            "get" => Ok(json!(self.get().await?)),
            other => Err(Error::ActorFailure {
                id: self.id.clone(),
                reason: format!("unknown method {other:?}"),
            }),
        }
    }
}

/// Local actor directory; an actor is created only after its lease is ours.
pub struct LocalRegistry {
    lease: Arc<LeaseClient>,
    actors: RwLock<HashMap<String, Arc<CounterActor>>>,
}

impl LocalRegistry {
    pub fn new(lease: Arc<LeaseClient>) -> Self {
        Self {
            lease,
            actors: RwLock::new(HashMap::new()),
        }
    }

    pub async fn counter(&self, id: &str) -> Option<Arc<CounterActor>> {
        self.actors.read().await.get(id).cloned()
    }

    async fn live(&self, id: &str) -> Option<Arc<CounterActor>> {
        self.counter(id)
            .await
            .filter(|actor| !actor.is_shutting_down())
    }
}

#[async_trait]
impl ActorDirectory for LocalRegistry {
    async fn list_local_ids(&self) -> BTreeSet<String> {
        self.actors.read().await.keys().cloned().collect()
    }

    async fn lookup(&self, id: &str) -> Option<Arc<dyn ActorHandle>> {
        self.counter(id)
            .await
            .map(|actor| actor as Arc<dyn ActorHandle>)
    }

    async fn create_or_fetch(
        &self,
        id: &str,
        opts: CreateOptions,
    ) -> Result<Arc<dyn ActorHandle>> {
        if let Some(actor) = self.live(id).await {
            return Ok(actor);
        }
        if !opts.allow_create {
            return Err(Error::NoSuchActor(id.to_string()));
        }
        if let GrabOutcome::Held { owner } = self.lease.grab(id).await? {
            return Err(Error::RemoteOwner {
                id: id.to_string(),
                owner,
            });
        }

        let mut actors = self.actors.write().await;
        let actor = match actors.get(id) {
            // raced with another request creating the same actor
            Some(actor) if !actor.is_shutting_down() => actor.clone(),
            _ => {
                info!(actor_id = %id, "Created actor");
                let actor = Arc::new(CounterActor::new(id, self.lease.clone()));
                actors.insert(id.to_string(), actor.clone());
                actor
            }
        };
        Ok(actor)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some(actor) = self.actors.write().await.remove(id) {
            actor.shutdown();
            debug!(actor_id = %id, "Deleted actor");
        }
        Ok(())
    }
}
