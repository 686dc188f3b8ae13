//! Where this node lives: private address and public candidate pool, as seen
//! by the platform it was deployed on.

use crate::config::{ConfigError, PlatformConfig};
use clap::ValueEnum;
use leasing::{NodePool, NodeToken};
use serde_derive::{Deserialize, Serialize};
use tracing::debug;

pub const VCAP_APP_HOST: &str = "VCAP_APP_HOST";
pub const VCAP_APP_PORT: &str = "VCAP_APP_PORT";
pub const CONTAINER_IP: &str = "CONTAINER_IP";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaasKind {
    /// Host and port straight from configuration.
    #[default]
    Local,
    /// Cloud Foundry style router that injects the app address and routes
    /// sticky sessions by cookie.
    #[value(name = "cloudfoundry")]
    #[serde(rename = "cloudfoundry")]
    CloudFoundry,
    /// Orchestrated network where every container gets its own routable address.
    Container,
}

impl PaasKind {
    /// Whether the front-end router issues its own routing tokens, which the
    /// node has to discover rather than take from its public registration.
    pub fn router_assigns_tokens(self) -> bool {
        self == PaasKind::CloudFoundry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnv {
    pub host: String,
    pub port: u16,
    pub pool: NodePool,
}

impl NodeEnv {
    pub fn private_token(&self) -> NodeToken {
        NodeToken::from_host_port(&self.host, self.port)
    }
}

/// Resolves the node environment against the process environment.
pub fn resolve(config: &PlatformConfig) -> Result<NodeEnv, ConfigError> {
    resolve_with(config, |var| std::env::var(var).ok())
}

pub fn resolve_with<F>(config: &PlatformConfig, env: F) -> Result<NodeEnv, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pool = NodePool::expand(&config.public_nodes);
    let node_env = match config.paas {
        PaasKind::Local => NodeEnv {
            host: config.host.clone(),
            port: config.port,
            pool,
        },
        PaasKind::CloudFoundry => {
            let port = match env(VCAP_APP_PORT) {
                Some(port) => parse_port(VCAP_APP_PORT, &port)?,
                None => config.port,
            };
            NodeEnv {
                host: env(VCAP_APP_HOST).unwrap_or_else(|| config.host.clone()),
                port,
                pool,
            }
        }
        PaasKind::Container => {
            let ip = env(CONTAINER_IP).ok_or_else(|| ConfigError::EnvVarError {
                var: CONTAINER_IP.to_string(),
                reason: "not set".to_string(),
            })?;
            let public = NodeToken::from_host_port(&ip, config.port);
            NodeEnv {
                host: ip,
                port: config.port,
                pool: NodePool::from_tokens(vec![public]),
            }
        }
    };
    debug!(paas = ?config.paas, host = %node_env.host, port = node_env.port, candidates = node_env.pool.len(), "Resolved node environment");
    Ok(node_env)
}

fn parse_port(var: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse().map_err(|e| ConfigError::EnvVarError {
        var: var.to_string(),
        reason: format!("{value:?}: {e}"),
    })
}
