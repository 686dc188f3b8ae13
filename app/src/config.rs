//! Layered configuration: defaults, then an optional TOML file, then CLI
//! flags (which clap already merged with the environment).

use crate::paas::PaasKind;
use leasing::{PublicNodeRange, UniquifierConfig};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    #[error("Environment variable error: {var} - {reason}")]
    EnvVarError { var: String, reason: String },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Private host, reachable from inside the data center.
    pub host: String,
    pub port: u16,
    pub paas: PaasKind,
    pub lease_timeout_secs: u64,
    pub stealth: bool,
    pub public_nodes: Vec<PublicNodeRange>,
    /// Presets the routing token, skipping discovery. Debugging only.
    pub node_id: Option<String>,
    pub metrics_port: u16,
    pub crons: CronConfig,
    pub discovery: UniquifierConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3000,
            paas: PaasKind::default(),
            lease_timeout_secs: 5,
            stealth: false,
            public_nodes: Vec::new(),
            node_id: None,
            metrics_port: 9001,
            crons: CronConfig::default(),
            discovery: UniquifierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    pub lease_interval_ms: u64,
    pub nodes_interval_ms: u64,
    pub ripper_interval_ms: u64,
    pub pulser_interval_ms: u64,
    /// Bound on concurrent reaps and pulses; unbounded when unset.
    pub max_in_flight: Option<usize>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            lease_interval_ms: 1000,
            nodes_interval_ms: 1000,
            ripper_interval_ms: 10_000,
            pulser_interval_ms: 1000,
            max_in_flight: None,
        }
    }
}

impl PlatformConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|_| ConfigError::FileNotFound {
                path: path.as_ref().display().to_string(),
            })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

impl Validate for PlatformConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_timeout_secs == 0 {
            return Err(invalid("lease_timeout_secs", "must be positive"));
        }
        self.crons.validate()?;

        let timeout_ms = self.lease_timeout_secs.saturating_mul(1000);
        for (field, interval) in [
            ("crons.lease_interval_ms", self.crons.lease_interval_ms),
            ("crons.nodes_interval_ms", self.crons.nodes_interval_ms),
        ] {
            if interval >= timeout_ms {
                return Err(invalid(
                    field,
                    format!("must be below the lease timeout ({timeout_ms} ms)"),
                ));
            }
        }

        for range in &self.public_nodes {
            let (first, last) = range.port_range;
            if first > last {
                return Err(invalid(
                    "public_nodes",
                    format!("empty port range {first}-{last} for {}", range.hostname),
                ));
            }
        }

        // containers derive their pool from the assigned address
        if !self.stealth && self.public_nodes.is_empty() && self.paas != PaasKind::Container {
            return Err(invalid(
                "public_nodes",
                "a non-stealth node needs public node candidates",
            ));
        }

        if self.discovery.session_cookie.is_empty() || self.discovery.routing_cookie.is_empty() {
            return Err(invalid("discovery", "cookie names cannot be empty"));
        }
        Ok(())
    }
}

impl Validate for CronConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, interval) in [
            ("crons.lease_interval_ms", self.lease_interval_ms),
            ("crons.nodes_interval_ms", self.nodes_interval_ms),
            ("crons.ripper_interval_ms", self.ripper_interval_ms),
            ("crons.pulser_interval_ms", self.pulser_interval_ms),
        ] {
            if interval == 0 {
                return Err(invalid(field, "must be positive"));
            }
        }
        if self.max_in_flight == Some(0) {
            return Err(invalid("crons.max_in_flight", "must be positive when set"));
        }
        Ok(())
    }
}

/// Parses `hostname:first-last` (or `hostname:port`) into a public node range.
pub fn parse_public_node(s: &str) -> Result<PublicNodeRange, String> {
    let (hostname, ports) = s
        .rsplit_once(':')
        .ok_or_else(|| format!("expected hostname:first-last, got {s}"))?;
    if hostname.is_empty() {
        return Err(format!("missing hostname in {s}"));
    }
    let parse_port = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|e| format!("invalid port {p:?} in {s}: {e}"))
    };
    let (first, last) = match ports.split_once('-') {
        Some((first, last)) => (parse_port(first)?, parse_port(last)?),
        None => {
            let port = parse_port(ports)?;
            (port, port)
        }
    };
    if first > last {
        return Err(format!("empty port range in {s}"));
    }
    Ok(PublicNodeRange::new(hostname, first, last))
}
