//! TokenVault CLI - Command line interface for token replication.
//!
//! This tool stores, reads and deletes sealed token records across the
//! configured providers, and runs reconciliation and health probes.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tokenvault_common::{ProviderId, SealedRecord, TokenId};
use tokenvault_replication::{
    BackgroundTasks, ProviderSpec, ReplicationConfig, ReplicationContext, ReplicationCoordinator,
};
use tokenvault_storage::create_default_registry;

#[derive(Parser)]
#[command(name = "tokenvault")]
#[command(about = "TokenVault - Multi-provider token replication")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: <config dir>/tokenvault/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate a sealed record to every provider.
    Put {
        /// JSON file holding the sealed record.
        record: PathBuf,

        /// Merchant the record belongs to.
        #[arg(short, long)]
        merchant: Option<String>,
    },

    /// Read a record, starting at the region's preferred provider.
    Get {
        /// Token identifier.
        token: String,

        /// Region hint (e.g. "us-east-1").
        #[arg(short, long, default_value = "")]
        region: String,
    },

    /// Delete a record from every provider.
    Delete {
        /// Token identifier.
        token: String,
    },

    /// Run one reconciliation pass.
    Reconcile,

    /// Probe every provider's health.
    Probe,

    /// Show health and recent replication jobs.
    Stats,

    /// Run health probes and reconciliation until interrupted.
    Serve,

    /// Write a configuration with three local providers.
    InitConfig {
        /// Directory holding the provider stores.
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Overwrite an existing configuration.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match cli.command {
        Commands::InitConfig { root, force } => cmd_init_config(&config_path, root, force).await,

        Commands::Put { record, merchant } => {
            cmd_put(&config_path, &record, merchant.as_deref()).await
        }

        Commands::Get { token, region } => cmd_get(&config_path, &token, &region).await,

        Commands::Delete { token } => cmd_delete(&config_path, &token).await,

        Commands::Reconcile => cmd_reconcile(&config_path).await,

        Commands::Probe => cmd_probe(&config_path).await,

        Commands::Stats => cmd_stats(&config_path).await,

        Commands::Serve => cmd_serve(&config_path).await,
    }
}

fn default_config_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("Could not determine the user config directory")?;
    Ok(dir.join("tokenvault").join("config.json"))
}

fn default_store_root() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("Could not determine the user data directory")?;
    Ok(dir.join("tokenvault"))
}

async fn open_coordinator(config_path: &Path) -> Result<ReplicationCoordinator> {
    let config = ReplicationConfig::load(config_path)
        .await
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    if config.providers.is_empty() {
        anyhow::bail!("No providers configured in {}", config_path.display());
    }

    ReplicationCoordinator::from_config(config, &create_default_registry())
        .await
        .context("Failed to initialize providers")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Write a three-provider local configuration.
async fn cmd_init_config(config_path: &Path, root: Option<PathBuf>, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let root = match root {
        Some(root) => root,
        None => default_store_root()?,
    };

    let providers = [ProviderId::AWS, ProviderId::AZURE, ProviderId::GCP]
        .into_iter()
        .map(|id| ProviderSpec {
            config: serde_json::json!({ "root": root.join(id.as_str()) }),
            id,
            kind: "local".to_string(),
        })
        .collect();
    let config = ReplicationConfig {
        providers,
        ..Default::default()
    };

    if let Some(parent) = config_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create config directory")?;
    }
    tokio::fs::write(config_path, config.to_json()?)
        .await
        .context("Failed to write config")?;

    println!("Configuration written to {}", config_path.display());
    println!("  Provider stores under: {}", root.display());

    Ok(())
}

fn replication_context(merchant: Option<&str>) -> ReplicationContext {
    match merchant {
        Some(merchant) => ReplicationContext::for_merchant(merchant),
        None => ReplicationContext::default(),
    }
}

/// Replicate a record read from a JSON file.
async fn cmd_put(config_path: &Path, path: &Path, merchant: Option<&str>) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let record: SealedRecord = serde_json::from_str(&json).context("Invalid sealed record")?;

    info!("Replicating token {}", record.token_id);
    let job = coordinator.replicate(record, &replication_context(merchant)).await;

    print_json(&job)?;
    job.ensure_quorum().context("Replication did not reach quorum")?;

    Ok(())
}

/// Read a record and print it.
async fn cmd_get(config_path: &Path, token: &str, region: &str) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let token_id = TokenId::new(token).context("Invalid token id")?;
    let result = coordinator.retrieve(&token_id, region).await;

    let Some(record) = result.record else {
        anyhow::bail!(
            "Token {} not found ({} providers tried)",
            token_id,
            result.attempt_count
        );
    };

    if let Some(provider) = &result.source_provider {
        info!(
            "Read from {} after {} attempt(s)",
            provider, result.attempt_count
        );
    }
    print_json(&record)
}

/// Delete a record everywhere.
async fn cmd_delete(config_path: &Path, token: &str) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let token_id = TokenId::new(token).context("Invalid token id")?;
    let result = coordinator.delete_everywhere(&token_id).await;

    print_json(&result)?;
    if !result.is_fully_deleted() {
        anyhow::bail!(
            "Deleted from {} of {} providers",
            result.success_count,
            result.total_count
        );
    }

    Ok(())
}

async fn cmd_reconcile(config_path: &Path) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let report = coordinator.reconcile().await;
    print_json(&report)?;
    if !report.is_complete() {
        warn!("Reconciliation left gaps; run again once providers recover");
    }
    Ok(())
}

async fn cmd_probe(config_path: &Path) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let results = coordinator.probe_health().await;

    println!("Provider health:");
    for (provider, healthy) in results {
        let state = if healthy { "healthy" } else { "UNHEALTHY" };
        println!("  {}: {}", provider, state);
    }
    println!("Overall: {:?}", coordinator.health().overall_health());

    Ok(())
}

async fn cmd_stats(config_path: &Path) -> Result<()> {
    let coordinator = open_coordinator(config_path).await?;
    let statistics = coordinator.statistics().await;
    let metrics: serde_json::Map<String, serde_json::Value> = coordinator
        .provider_metrics()
        .await
        .into_iter()
        .map(|(provider, metrics)| (provider.to_string(), serde_json::json!(metrics)))
        .collect();

    print_json(&serde_json::json!({
        "statistics": statistics,
        "connectors": metrics,
    }))
}

/// Run the background loops until Ctrl-C.
async fn cmd_serve(config_path: &Path) -> Result<()> {
    let coordinator = Arc::new(open_coordinator(config_path).await?);
    let tasks = BackgroundTasks::spawn(coordinator.clone(), coordinator.config());

    info!(
        "Serving {} providers, press Ctrl-C to stop",
        coordinator.connectors().len()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    tasks.shutdown().await;

    Ok(())
}
