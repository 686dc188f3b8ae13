//! Lease-based ownership of actors across a fleet of processes.
//!
//! A lease binds an actor id to the node that hosts it for a bounded amount of
//! time. Nodes keep their leases alive from cron jobs, evict actors whose lease
//! was lost or that stopped making progress, and use a cookie handshake with the
//! front-end router so that requests for an actor keep reaching its owner.

mod cookies;
pub mod cron;
pub mod directory;
pub mod lease;
pub mod memory_store;
pub mod metrics;
pub mod nodes;
mod shutdown;
pub mod store;
mod token;
pub mod uniquifier;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use thiserror::Error;

pub use cookies::{parse_cookie_header, SetCookie};
pub use directory::{ActorDirectory, ActorHandle, CreateOptions};
pub use lease::LeaseClient;
pub use memory_store::InMemoryLeaseStore;
pub use nodes::{ListenerId, NodePool, NodeRegistry, NodeRegistryConfig, PublicNodeRange};
pub use shutdown::Shutdown;
pub use store::{BindingTable, GrabOutcome, LeaseStore};
pub use token::{NodeIdentity, NodeToken, EMULATED_PREFIX};
pub use uniquifier::{Admission, Uniquifier, UniquifierConfig, Verdict};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Lease store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("No free public node among {0} candidates")]
    NodePoolExhausted(usize),
    #[error("Node lease for {0} is lost")]
    NodeLeaseLost(String),
    #[error("Node identity is not known yet")]
    IdentityUnknown,
    #[error("No such actor {0} and creation is not allowed")]
    NoSuchActor(String),
    #[error("Actor {id} is hosted by {owner}")]
    RemoteOwner { id: String, owner: NodeToken },
    #[error("Lease for actor {0} is lost")]
    LeaseLost(String),
    #[error("Actor {id} failed: {reason}")]
    ActorFailure { id: String, reason: String },
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

pub type Result<T> = std::result::Result<T, Error>;
