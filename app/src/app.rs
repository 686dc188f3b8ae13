use crate::actors::LocalRegistry;
use crate::config::{parse_public_node, ConfigError, PlatformConfig, Validate};
use crate::paas::{self, PaasKind};
use crate::rpc::FrontEnd;
use clap::Parser;
use eyre::Result;
use futures::future::join_all;
use futures::pin_mut;
use leasing::cron::{
    spawn_cron, CronTask, LeaseCron, NodesCron, PulserCron, RipperCron,
};
use leasing::{
    ActorDirectory, InMemoryLeaseStore, LeaseClient, LeaseStore, NodeIdentity, NodeRegistry,
    NodeRegistryConfig, PublicNodeRange, Shutdown, Uniquifier,
};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "Lease-based actor hosting node", long_about = None)]
pub struct App {
    /// TOML configuration file; flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "VCAP_APP_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    #[arg(long = "lease-timeout", value_name = "SECONDS")]
    pub lease_timeout: Option<u64>,

    /// Public node candidates as `hostname:first-last`
    #[arg(long = "public-node", value_name = "HOST:PORTS", value_parser = parse_public_node)]
    pub public_nodes: Vec<PublicNodeRange>,

    /// Skip public registration
    #[arg(long)]
    pub stealth: bool,

    #[arg(long, value_enum, env = "PAAS")]
    pub paas: Option<PaasKind>,

    /// Preset routing token, for debugging only
    #[arg(long = "node-id")]
    pub node_id: Option<String>,

    #[arg(long = "max-discovery-attempts")]
    pub max_discovery_attempts: Option<u32>,

    #[arg(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let shutdown = Shutdown::new();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute(shutdown.clone()), shutdown))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = Level::from_str(
            std::env::var("RUST_LOG")
                .unwrap_or("info".to_string())
                .as_str(),
        )
        .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("platform={rust_log_level},leasing={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    /// File values first, then flags and their environment fallbacks.
    pub fn load_config(&self) -> Result<PlatformConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PlatformConfig::load_from_file(path)?,
            None => PlatformConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(lease_timeout) = self.lease_timeout {
            config.lease_timeout_secs = lease_timeout;
        }
        if !self.public_nodes.is_empty() {
            config.public_nodes = self.public_nodes.clone();
        }
        if self.stealth {
            config.stealth = true;
        }
        if let Some(paas) = self.paas {
            config.paas = paas;
        }
        if let Some(node_id) = &self.node_id {
            config.node_id = Some(node_id.clone());
        }
        if let Some(attempts) = self.max_discovery_attempts {
            config.discovery.max_discovery_attempts = attempts;
        }
        if let Some(metrics_port) = self.metrics_port {
            config.metrics_port = metrics_port;
        }

        config.validate()?;
        Ok(config)
    }

    async fn execute(self, shutdown: Shutdown) -> Result<()> {
        let config = self.load_config()?;
        let node_env = paas::resolve(&config)?;
        let timeout = config.lease_timeout();
        info!(?config, "Starting node");

        let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());

        let identity = match &config.node_id {
            Some(node_id) => NodeIdentity::preset(node_id.as_str().into()),
            None => NodeIdentity::new(),
        };
        // cookie routers issue their own tokens, discovered on the first requests
        let registry_identity = if config.paas.router_assigns_tokens() {
            NodeIdentity::new()
        } else {
            identity.clone()
        };

        let registry = NodeRegistry::start(
            store.clone(),
            node_env.private_token(),
            &registry_identity,
            NodeRegistryConfig {
                lease_timeout: timeout,
                stealth: config.stealth,
                pool: node_env.pool.clone(),
            },
            shutdown.clone(),
        )
        .await?;
        let registry = Arc::new(registry);
        registry.on_change(
            |version| debug!(version, "Node bindings changed"),
            Some(Box::new(|reason: &str| info!(reason, "Node bindings closed"))),
        );
        registry.pulse().await?;

        let lease = Arc::new(LeaseClient::new(store, identity, timeout));
        let directory: Arc<dyn ActorDirectory> = Arc::new(LocalRegistry::new(lease.clone()));
        let uniquifier = Arc::new(Uniquifier::new(lease.clone(), config.discovery.clone()));

        let crons = &config.crons;
        let tasks = [
            CronTask::new(
                Arc::new(LeaseCron::new(lease.clone(), directory.clone())),
                Duration::from_millis(crons.lease_interval_ms),
            ),
            CronTask::new(
                Arc::new(NodesCron::new(registry.clone())),
                Duration::from_millis(crons.nodes_interval_ms),
            ),
            CronTask::new(
                Arc::new(RipperCron::new(directory.clone(), crons.max_in_flight)),
                Duration::from_millis(crons.ripper_interval_ms),
            ),
            CronTask::new(
                Arc::new(PulserCron::new(directory.clone(), crons.max_in_flight)),
                Duration::from_millis(crons.pulser_interval_ms),
            ),
        ];
        let mut handles: Vec<_> = tasks
            .into_iter()
            .map(|task| spawn_cron(Arc::new(task), shutdown.clone()))
            .collect();

        let front = Arc::new(FrontEnd {
            uniquifier: uniquifier.clone(),
            directory,
            registry: registry.clone(),
        });
        handles.push(crate::rpc::run_server(front, node_env.port, shutdown.clone())?);
        handles.push(crate::metrics::start_server(
            Some(config.metrics_port),
            shutdown.clone(),
        )?);

        info!(
            private = %node_env.private_token(),
            public = ?registry.node_token(),
            node_token = ?uniquifier.node_token(),
            "Node is up"
        );

        let reason = shutdown.wait().await;
        warn!(%reason, "Shutting down");
        join_all(handles).await;
        Ok(())
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Runs `fut` to completion; a signal only asks it to wind down through
/// `shutdown`.
async fn run_until_ctrl_c<F>(fut: F, shutdown: Shutdown) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
            shutdown.trigger("ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
            shutdown.trigger("SIGTERM");
        },
        res = &mut fut => return res,
    }

    fut.await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> App {
        App::try_parse_from(std::iter::once("platform").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let app = parse(&[
            "--lease-timeout",
            "8",
            "--public-node",
            "foo.com:4000-4003",
            "--public-node",
            "bar.com:5000",
            "--paas",
            "cloudfoundry",
            "--max-discovery-attempts",
            "6",
            "--metrics-port",
            "9100",
        ]);

        let config = app.load_config().unwrap();

        assert_eq!(config.lease_timeout(), Duration::from_secs(8));
        assert_eq!(
            config.public_nodes,
            vec![
                PublicNodeRange::new("foo.com", 4000, 4003),
                PublicNodeRange::new("bar.com", 5000, 5000)
            ]
        );
        assert_eq!(config.paas, PaasKind::CloudFoundry);
        assert_eq!(config.discovery.max_discovery_attempts, 6);
        assert_eq!(config.metrics_port, 9100);
        assert!(!config.stealth);
    }

    #[test]
    fn invalid_combination_is_rejected() {
        // 1s renewals cannot keep a 1s lease alive
        let app = parse(&["--lease-timeout", "1", "--stealth"]);
        assert!(matches!(
            app.load_config(),
            Err(ConfigError::ValidationError { .. })
        ));

        assert!(App::try_parse_from(["platform", "--public-node", "foo.com"]).is_err());
        assert!(App::try_parse_from(["platform", "--paas", "mainframe"]).is_err());
    }

    #[test]
    fn flags_win_over_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("platform.toml");
        std::fs::write(&path, "stealth = true\nlease_timeout_secs = 9\nnode_id = \"from-file\"\n")
            .unwrap();
        let path = path.to_str().unwrap().to_string();

        let config = parse(&["--config", path.as_str(), "--node-id", "from-flag"])
            .load_config()
            .unwrap();

        assert!(config.stealth);
        assert_eq!(config.lease_timeout_secs, 9);
        assert_eq!(config.node_id.as_deref(), Some("from-flag"));
    }

    #[tokio::test]
    async fn signal_free_run_returns_the_future_result() {
        let shutdown = Shutdown::new();
        let result = run_until_ctrl_c(async { Ok(()) }, shutdown.clone()).await;
        assert!(result.is_ok());
        assert!(!shutdown.is_triggered());

        let result = run_until_ctrl_c(async { Err(eyre::eyre!("boom")) }, shutdown).await;
        assert!(result.is_err());
    }
}
