use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tonic::Status;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hello_discovery::config::{Config, DiscoveryConfig, DiscoveryKind};
use hello_discovery::discovery::{
    Address, DiscoveredChannel, DiscoveryBackend, NacosBackend, NacosConfig, ResolverHandle,
    RoundRobin, Target,
};
use hello_discovery::error::Error;
use hello_discovery::reconnect::{DiscoveryChannelFactory, ReconnectController};
use hello_discovery::registrar::Registrar;
use hello_discovery::store::CoordinationStore;

#[derive(Parser)]
#[command(
    name = "hello-discovery",
    version,
    about = "Service registration, watch-based resolution and reconnecting channels",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML config file (environment variables are used when absent)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this server and keep the lease alive until Ctrl-C
    Register {
        /// Service name
        #[arg(short, long)]
        service: Option<String>,

        /// Address to register (defaults to GRPC_SERVER:GRPC_SERVER_PORT)
        #[arg(short, long)]
        address: Option<String>,

        /// Lease TTL in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Resolve a target and log every address set update
    Resolve {
        /// Target such as etcd:///hello-grpc, nacos://hello-grpc or host:port
        target: Option<String>,
    },

    /// Probe a target periodically through the reconnect controller
    Connect {
        /// Target such as etcd:///hello-grpc, nacos://hello-grpc or host:port
        target: Option<String>,

        /// Seconds between probes
        #[arg(short, long, default_value = "3")]
        interval: u64,

        /// Stop after this many probes
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Commands::Register {
            service,
            address,
            ttl,
        } => {
            let service = service.unwrap_or_else(|| config.discovery.service_name.clone());
            let address = match address {
                Some(address) => address.parse::<Address>()?,
                None => config.discovery.server_address(),
            };
            let ttl = ttl.map(Duration::from_secs).unwrap_or(config.discovery.lease_ttl());

            tracing::info!(
                service = %service,
                address = %address,
                ttl_secs = ttl.as_secs(),
                "Starting register command"
            );
            register(&config.discovery, &service, address, ttl).await?;
        }

        Commands::Resolve { target } => {
            let target = resolve_target(target, &config.discovery)?;
            tracing::info!(target = %target, "Starting resolve command");
            resolve(&config.discovery, target).await?;
        }

        Commands::Connect {
            target,
            interval,
            count,
        } => {
            let target = resolve_target(target, &config.discovery)?;
            tracing::info!(
                target = %target,
                interval = %interval,
                count = ?count,
                "Starting connect command"
            );
            connect(&config, target, Duration::from_secs(interval.max(1)), count).await?;
        }
    }

    tracing::info!("hello-discovery completed successfully");
    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("hello_discovery=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hello_discovery=info,warn"))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(())
}

fn resolve_target(target: Option<String>, config: &DiscoveryConfig) -> Result<Target> {
    match target {
        Some(target) => Ok(target.parse()?),
        None => Ok(Target::from_config(config)),
    }
}

#[cfg(feature = "etcd")]
async fn open_store(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationStore>> {
    let store = hello_discovery::store::EtcdStore::connect(&config.endpoints())
        .await
        .map_err(Error::from)
        .with_context(|| format!("Failed to connect to etcd at {}", config.endpoint))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "etcd"))]
async fn open_store(_config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationStore>> {
    Err(Error::config("etcd discovery requires building with the `etcd` feature").into())
}

fn nacos_backend(config: &DiscoveryConfig) -> Result<NacosBackend> {
    let endpoint = config
        .endpoints()
        .into_iter()
        .next()
        .context("No Nacos endpoint configured")?;
    let nacos = NacosConfig::new(endpoint)
        .with_poll_interval(config.nacos_poll_interval())
        .with_timeout(config.connect_timeout());
    Ok(NacosBackend::new(nacos)?)
}

async fn backend_for(target: &Target, config: &DiscoveryConfig) -> Result<Option<DiscoveryBackend>> {
    match target.discovery_kind() {
        Some(DiscoveryKind::Etcd) => Ok(Some(DiscoveryBackend::store(open_store(config).await?))),
        Some(DiscoveryKind::Nacos) => Ok(Some(DiscoveryBackend::Nacos(nacos_backend(config)?))),
        None => Ok(None),
    }
}

async fn register(
    config: &DiscoveryConfig,
    service: &str,
    address: Address,
    ttl: Duration,
) -> Result<()> {
    match config.discovery {
        Some(DiscoveryKind::Etcd) => {
            let store = open_store(config).await?;
            let registrar = Registrar::new(store, config.scheme.clone());
            let registration = registrar.register(service, address, ttl).await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down, releasing registration");
            registrar.release(registration).await?;
        }
        Some(DiscoveryKind::Nacos) => {
            let nacos = nacos_backend(config)?;
            nacos.register_instance(service, &address).await?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down, deregistering instance");
            nacos.deregister_instance(service, &address).await?;
        }
        None => {
            anyhow::bail!("Registration needs GRPC_HELLO_DISCOVERY set to etcd or nacos");
        }
    }

    Ok(())
}

async fn resolve(config: &DiscoveryConfig, target: Target) -> Result<()> {
    let backend = match backend_for(&target, config).await? {
        Some(backend) => backend,
        None => {
            tracing::info!(target = %target, "Static target, nothing to watch");
            return Ok(());
        }
    };

    let resolver = ResolverHandle::start(backend, target.service()).await?;
    let mut updates = resolver.subscribe();

    loop {
        let resolution = updates.borrow_and_update().clone();
        let addresses: Vec<String> = resolution.addresses.iter().map(|a| a.to_string()).collect();
        tracing::info!(
            revision = resolution.revision,
            status = ?resolution.status,
            addresses = ?addresses,
            "Address set"
        );
        if let Some(err) = resolution.error() {
            return Err(err).context("Resolver stopped");
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                resolver.close();
                break;
            }
        }
    }

    Ok(())
}

async fn connect(
    config: &Config,
    target: Target,
    interval: Duration,
    count: Option<u64>,
) -> Result<()> {
    let backend = backend_for(&target, &config.discovery).await?;
    let factory =
        DiscoveryChannelFactory::new(target, backend, config.discovery.connect_timeout());
    let controller = ReconnectController::connect(factory, config.reconnect.clone()).await?;
    let connect_timeout = config.discovery.connect_timeout();

    let mut ticker = tokio::time::interval(interval);
    let mut probes = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        let result = controller
            .call(|channel| probe(channel, connect_timeout))
            .await;

        match result {
            Ok(address) => tracing::info!(address = %address, "Probe succeeded"),
            Err(e @ (Error::ReconnectExhausted { .. } | Error::Closed)) => {
                return Err(e).context("Connection lost");
            }
            Err(e) => tracing::warn!(state = %controller.state(), "Probe failed: {e}"),
        }

        probes += 1;
        if count.is_some_and(|count| probes >= count) {
            break;
        }
    }

    controller.close().await;
    Ok(())
}

async fn probe(
    channel: Arc<DiscoveredChannel>,
    connect_timeout: Duration,
) -> std::result::Result<Address, Status> {
    let (address, _) = channel
        .pick_ready(connect_timeout)
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

    RoundRobin::endpoint(&address, connect_timeout)
        .map_err(|e| Status::invalid_argument(e.to_string()))?
        .connect()
        .await
        .map_err(|e| Status::unavailable(e.to_string()))?;

    Ok(address)
}
