//! Keeps every actor on a single node behind a cookie-routing load balancer.
//!
//! The router picks a backend at random unless the request carries a routing
//! cookie, which it issues (encrypted, so opaque to us) when a response sets a
//! session cookie. A freshly started node therefore does not know its own
//! routing token. It learns it by answering the first request with a one-time
//! session cookie and a redirect: the client retries, the router routes the
//! retry back here and attaches the routing cookie, and a matching session
//! cookie proves the routing cookie is ours and not left over from some other
//! node. Routers without sticky sessions never attach one; the node then makes
//! up an emulated token and hands it out itself. So does a node that keeps
//! seeing retries bound to other sessions, since those mean the router is not
//! sending our own clients back to us.
//!
//! A token the router did not issue (emulated, preset or taken from the
//! public node pool) is handed to clients in the routing cookie on every
//! grant, so their next request skips the store.
//!
//! Once the token is known, a request whose routing cookie is not ours must
//! grab the actor's lease before it is let through; if another node holds it
//! the client is redirected there. A request that already carries our token is
//! let through without touching the store, since committing actor state
//! re-validates the lease anyway.

use crate::cookies::{parse_cookie_header, SetCookie};
use crate::metrics::DISCOVERY_REDIRECTS;
use crate::store::GrabOutcome;
use crate::token::random_hex;
use crate::{LeaseClient, NodeIdentity, NodeToken};
use serde_derive::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NOT_HERE: &str = "Redirect: Not here";
pub const UNKNOWN_NODE: &str = "Redirect: Don't know my nodeId";
pub const TRY_AGAIN: &str = "Redirect: Try again";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniquifierConfig {
    /// Session cookie the router makes sessions sticky on.
    pub session_cookie: String,
    /// Cookie the router routes by.
    pub routing_cookie: String,
    /// Retries carrying someone else's session to redirect while our token is
    /// unknown, before emulating one. Fresh clients never count.
    pub max_discovery_attempts: u32,
}

impl Default for UniquifierConfig {
    fn default() -> Self {
        Self {
            session_cookie: "JSESSIONID".to_string(),
            routing_cookie: "__VCAP_ID__".to_string(),
            max_discovery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Hand the request to the actor.
    Proceed,
    /// Ask the client to retry, towards `remote_node` when known.
    Redirect {
        message: String,
        remote_node: Option<NodeToken>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub verdict: Verdict,
    pub set_cookies: Vec<SetCookie>,
}

impl Admission {
    fn proceed(set_cookies: Vec<SetCookie>) -> Self {
        Self {
            verdict: Verdict::Proceed,
            set_cookies,
        }
    }

    fn redirect(message: &str, remote_node: Option<NodeToken>, set_cookies: Vec<SetCookie>) -> Self {
        Self {
            verdict: Verdict::Redirect {
                message: message.to_string(),
                remote_node,
            },
            set_cookies,
        }
    }

    pub fn is_proceed(&self) -> bool {
        self.verdict == Verdict::Proceed
    }
}

pub struct Uniquifier {
    identity: NodeIdentity,
    lease: Arc<LeaseClient>,
    config: UniquifierConfig,
    discovery_token: String,
    foreign_retries: AtomicU32,
    router_issued: AtomicBool,
}

impl Uniquifier {
    /// Shares the node identity of `lease`, so a token adopted here becomes
    /// the owner of every lease grabbed afterwards.
    pub fn new(lease: Arc<LeaseClient>, config: UniquifierConfig) -> Self {
        debug!("New uniquifier");
        Self {
            identity: lease.identity().clone(),
            lease,
            config,
            discovery_token: random_hex(16),
            foreign_retries: AtomicU32::new(0),
            router_issued: AtomicBool::new(false),
        }
    }

    pub fn node_token(&self) -> Option<&NodeToken> {
        self.identity.get()
    }

    pub fn config(&self) -> &UniquifierConfig {
        &self.config
    }

    /// Decides whether a request for `actor_id` may be served here.
    pub async fn admit(&self, cookie_header: Option<&str>, actor_id: &str) -> Admission {
        let cookies = cookie_header.map(parse_cookie_header).unwrap_or_default();
        let session = cookies.get(&self.config.session_cookie).map(String::as_str);
        let presented = cookies.get(&self.config.routing_cookie).map(String::as_str);

        match self.identity.get() {
            Some(token) => self.admit_known(token, presented, actor_id, false).await,
            None => self.discover(session, presented, actor_id).await,
        }
    }

    /// Redirects the client towards `owner`, the node that holds the lease.
    pub fn redirect_to_owner(&self, owner: &NodeToken, message: &str) -> Admission {
        DISCOVERY_REDIRECTS.with_label_values(&["remote_owner"]).inc();
        Admission::redirect(
            message,
            Some(owner.clone()),
            vec![SetCookie::new(&self.config.routing_cookie, owner.as_str())],
        )
    }

    async fn discover(
        &self,
        session: Option<&str>,
        presented: Option<&str>,
        actor_id: &str,
    ) -> Admission {
        if session == Some(self.discovery_token.as_str()) {
            // an emulated token was not issued by the router and says nothing about us
            let issued = presented.filter(|token| {
                !token.is_empty() && !NodeToken::new(*token).is_emulated()
            });
            return match issued {
                Some(token) => {
                    let adopted = NodeToken::new(token);
                    let token = self.identity.assign(adopted.clone());
                    if token == adopted {
                        self.router_issued.store(true, Ordering::Release);
                    }
                    info!(node_token = %token, "Discovered node token");
                    self.admit_known(&token, presented, actor_id, true).await
                }
                None => self.emulate(actor_id).await,
            };
        }

        if session.is_some() {
            let retries = self.foreign_retries.fetch_add(1, Ordering::AcqRel) + 1;
            if retries > self.config.max_discovery_attempts {
                return self.emulate(actor_id).await;
            }
        }
        DISCOVERY_REDIRECTS.with_label_values(&["unknown_node"]).inc();
        Admission::redirect(UNKNOWN_NODE, None, vec![self.session_cookie()])
    }

    async fn emulate(&self, actor_id: &str) -> Admission {
        let token = self.identity.assign(NodeToken::emulated());
        info!(node_token = %token, "Emulating router");
        self.admit_known(&token, None, actor_id, true).await
    }

    async fn admit_known(
        &self,
        token: &NodeToken,
        presented: Option<&str>,
        actor_id: &str,
        fresh_token: bool,
    ) -> Admission {
        let ours = presented.is_some_and(|presented| token.matches_presented(presented));
        if ours && !fresh_token {
            return Admission::proceed(Vec::new());
        }

        match self.lease.grab(actor_id).await {
            Ok(GrabOutcome::Granted) => Admission::proceed(self.own_cookies(token)),
            Ok(GrabOutcome::Held { owner }) => self.redirect_to_owner(&owner, NOT_HERE),
            Err(err) => {
                warn!(actor_id = %actor_id, error = %err, "Cannot grab lease");
                DISCOVERY_REDIRECTS.with_label_values(&["store_error"]).inc();
                Admission::redirect(TRY_AGAIN, None, Vec::new())
            }
        }
    }

    fn session_cookie(&self) -> SetCookie {
        SetCookie::new(&self.config.session_cookie, &self.discovery_token)
    }

    fn own_cookies(&self, token: &NodeToken) -> Vec<SetCookie> {
        let mut cookies = vec![self.session_cookie()];
        if !self.router_issued.load(Ordering::Acquire) {
            cookies.push(SetCookie::new(&self.config.routing_cookie, token.as_str()));
        }
        cookies
    }
}
