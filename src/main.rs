//! Live aircraft-tracking aggregator CLI.
//!
//! Two modes: `collector` runs the full engine (per-region schedulers plus
//! an in-process push ingress), `standalone-ingress` runs only the push
//! ingress against the shared cache.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use skyfuse::cache::CacheClient;
use skyfuse::config::Config;
use skyfuse::ingress::{self, IngressState};
use skyfuse::registry::{RegistryError, RegistryStore};
use skyfuse::scheduler::RegionScheduler;

#[derive(Parser)]
#[command(name = "skyfuse")]
#[command(about = "Live aircraft-tracking aggregator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML configuration file
    #[arg(short, long, env = "SKYFUSE_CONFIG", default_value = "config/skyfuse.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run region schedulers and the push ingress
    Collector,
    /// Run only the push ingress
    StandaloneIngress,
    /// Re-import the aircraft registry into the cache and exit
    LoadRegistry,
}

/// Startup failures, mapped to process exit codes.
enum Fatal {
    /// Exit 1.
    Config(String),
    /// Exit 2.
    CacheUnreachable(String),
    /// Exit 3.
    Other(String),
}

impl Fatal {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::from(1),
            Self::CacheUnreachable(_) => ExitCode::from(2),
            Self::Other(_) => ExitCode::from(3),
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Config(msg) | Self::CacheUnreachable(msg) | Self::Other(msg) => msg,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("skyfuse: configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Collector => run_collector(config).await,
        Commands::StandaloneIngress => run_standalone_ingress(config).await,
        Commands::LoadRegistry => run_load_registry(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            tracing::error!("{}", fatal.message());
            fatal.exit_code()
        }
    }
}

/// Shutdown channel flipped by Ctrl+C or SIGTERM.
fn spawn_signal_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }

        tracing::info!("Shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

async fn connect_cache(config: &Config) -> Result<CacheClient, Fatal> {
    CacheClient::connect(&config.cache)
        .await
        .map_err(|err| Fatal::CacheUnreachable(format!("cache unreachable at startup: {err}")))
}

fn registry_fatal(err: RegistryError) -> Fatal {
    match err {
        RegistryError::Header(_) => Fatal::Config(format!("registry load failed: {err}")),
        RegistryError::Cache(_) => Fatal::CacheUnreachable(format!("registry import failed: {err}")),
        other => Fatal::Other(format!("registry load failed: {other}")),
    }
}

async fn run_collector(config: Config) -> Result<(), Fatal> {
    tracing::info!("Starting skyfuse collector");
    tracing::info!(
        "Configured regions: {:?}",
        config
            .regions
            .iter()
            .map(|r| r.id.as_str())
            .collect::<Vec<_>>()
    );

    let cache = connect_cache(&config).await?;

    let (registry, _outcome) = RegistryStore::load(&config.registry, cache.clone())
        .await
        .map_err(registry_fatal)?;
    let registry = Arc::new(registry);

    let shutdown = spawn_signal_listener();
    let config = Arc::new(config);

    // The ingress rides along only when some region accepts pushes.
    let ingress_handle = if config.regions.iter().any(|r| r.push_source().is_some()) {
        let state = IngressState {
            config: Arc::clone(&config),
            cache: cache.clone(),
        };
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(err) = ingress::serve(state, shutdown).await {
                tracing::error!("Push ingress failed: {err}");
            }
        }))
    } else {
        None
    };

    let mut scheduler_handles = Vec::new();
    let mut region_stats = Vec::new();
    for region in &config.regions {
        let scheduler = RegionScheduler::from_config(
            region,
            &config.scheduler,
            cache.clone(),
            Arc::clone(&registry),
            shutdown.clone(),
        )
        .map_err(|err| Fatal::Other(format!("region '{}' failed to start: {err}", region.id)))?;

        region_stats.push((region.id.clone(), scheduler.stats()));
        scheduler_handles.push(tokio::spawn(scheduler.run()));
    }

    join_all(scheduler_handles).await;
    if let Some(handle) = ingress_handle {
        let _ = handle.await;
    }

    for (region_id, stats) in region_stats {
        let snapshot = stats.snapshot();
        tracing::info!(
            "Region {region_id} final: cycles={}, aircraft={}, helicopters={}, timeouts={}, errors={}",
            snapshot.cycles,
            snapshot.aircraft_observed,
            snapshot.helicopters_observed,
            snapshot.timeouts,
            snapshot.source_errors
        );
    }

    tracing::info!("skyfuse collector stopped");
    Ok(())
}

async fn run_load_registry(config: Config) -> Result<(), Fatal> {
    let cache = connect_cache(&config).await?;

    let (_, outcome) = RegistryStore::reload(&config.registry, cache)
        .await
        .map_err(registry_fatal)?;
    tracing::info!("Registry load finished: {outcome:?}");
    Ok(())
}

async fn run_standalone_ingress(config: Config) -> Result<(), Fatal> {
    tracing::info!("Starting skyfuse standalone ingress");

    let cache = connect_cache(&config).await?;
    let shutdown = spawn_signal_listener();

    let state = IngressState {
        config: Arc::new(config),
        cache,
    };
    ingress::serve(state, shutdown)
        .await
        .map_err(|err| Fatal::Other(format!("ingress server failed: {err}")))?;

    tracing::info!("skyfuse ingress stopped");
    Ok(())
}
