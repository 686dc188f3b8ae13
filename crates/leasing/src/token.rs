use once_cell::sync::OnceCell;
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Marks routing tokens this process made up because the router never gave it one.
pub const EMULATED_PREFIX: &str = "emulated__";

/// Opaque identifier of a process, e.g. `host:port` or a router-encrypted id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeToken(String);

impl NodeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn from_host_port(host: &str, port: u16) -> Self {
        Self(format!("{host}:{port}"))
    }

    /// A fresh token under [`EMULATED_PREFIX`].
    pub fn emulated() -> Self {
        Self(format!("{EMULATED_PREFIX}{}", random_hex(16)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_emulated(&self) -> bool {
        self.0.starts_with(EMULATED_PREFIX)
    }

    /// Whether a token presented by a client refers to this node.
    ///
    /// Routers may pad the token they hand out, so a presented value matches
    /// when it is a non-empty prefix of ours.
    pub fn matches_presented(&self, presented: &str) -> bool {
        !presented.is_empty() && self.0.starts_with(presented)
    }
}

impl fmt::Display for NodeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for NodeToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The routing token of this process, assigned at most once.
///
/// Cloning shares the cell: the node registry, the discovery protocol and the
/// lease client all observe the same assignment.
#[derive(Debug, Clone, Default)]
pub struct NodeIdentity {
    cell: Arc<OnceCell<NodeToken>>,
}

impl NodeIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn preset(token: NodeToken) -> Self {
        let identity = Self::new();
        identity.assign(token);
        identity
    }

    pub fn get(&self) -> Option<&NodeToken> {
        self.cell.get()
    }

    pub fn is_known(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Assigns `token` unless another assignment won the race, and returns
    /// the token that is now in effect.
    pub fn assign(&self, token: NodeToken) -> NodeToken {
        self.cell.get_or_init(|| token).clone()
    }
}

pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presented_prefix_matches_padded_token() {
        let token = NodeToken::new("a1b2c3d4-padding");
        assert!(token.matches_presented("a1b2c3d4"));
        assert!(token.matches_presented("a1b2c3d4-padding"));
        assert!(!token.matches_presented("ffff"));
        assert!(!token.matches_presented(""));
    }

    #[test]
    fn emulated_tokens_are_marked_and_distinct() {
        let a = NodeToken::emulated();
        let b = NodeToken::emulated();
        assert!(a.is_emulated());
        assert_ne!(a, b);
        assert!(!NodeToken::from_host_port("foo.com", 3000).is_emulated());
    }

    #[test]
    fn first_assignment_wins() {
        let identity = NodeIdentity::new();
        let shared = identity.clone();
        assert!(!identity.is_known());
        assert_eq!(identity.assign("first".into()).as_str(), "first");
        assert_eq!(shared.assign("second".into()).as_str(), "first");
        assert_eq!(shared.get().map(NodeToken::as_str), Some("first"));
    }
}
