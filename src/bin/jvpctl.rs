use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use jvpstore::{
    Filter, FilterRequest, InMemoryHypervisor, MetadataStore, ResourceClass, StoreConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jvpctl")]
#[command(about = "Maintenance tooling for the JVP metadata store")]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `base_path` from the configuration
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Work from the directory tree only, without contacting the hypervisor
    #[arg(long, global = true)]
    offline: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sweep stale locks and repair damaged or orphaned sidecars
    Repair,
    /// Rebuild the index and print per-class counts
    Rebuild,
    /// List every resource of a class
    List { class: String },
    /// Describe resources with EC2-style filters
    Describe {
        class: String,
        #[arg(long = "id")]
        ids: Vec<String>,
        /// `name=v1,v2`, repeatable
        #[arg(long = "filter")]
        filters: Vec<String>,
    },
    /// Remove stale lock files
    SweepLocks,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_file(path)
            .with_context(|| format!("Failed to load config '{}'", path.display()))?,
        None => StoreConfig::default(),
    }
    .apply_env()
    .without_refresh();
    if let Some(base) = cli.base_path {
        config.base_path = base;
    }

    let store = if cli.offline {
        let hypervisor = InMemoryHypervisor::new();
        MetadataStore::new(config, Arc::new(hypervisor))
    } else {
        MetadataStore::connect(config)
    }
    .context("Failed to open metadata store")?;

    let outcome = run(&store, cli.command).await;
    store.close().await.context("Failed to close metadata store")?;
    outcome
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{}'", level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

async fn run(store: &MetadataStore, command: Command) -> Result<()> {
    match command {
        Command::Repair => {
            let report = store.initialize().await.context("Repair failed")?;
            print_json(&report)
        }
        Command::Rebuild => {
            store.initialize().await.context("Startup failed")?;
            print_json(&store.stats()?)
        }
        Command::List { class } => {
            let class = ResourceClass::parse(&class)?;
            store.initialize().await.context("Startup failed")?;
            describe(store, class, &FilterRequest::new()).await
        }
        Command::Describe {
            class,
            ids,
            filters,
        } => {
            let class = ResourceClass::parse(&class)?;
            let mut request = FilterRequest::new().with_ids(ids);
            for spec in &filters {
                let filter = Filter::parse(spec)
                    .ok_or_else(|| anyhow!("Filter '{}' is not of the form name=v1,v2", spec))?;
                request.filters.push(filter);
            }
            store.initialize().await.context("Startup failed")?;
            describe(store, class, &request).await
        }
        Command::SweepLocks => {
            let removed = store.sweep_locks().context("Lock sweep failed")?;
            print_json(&serde_json::json!({ "stale_locks_removed": removed }))
        }
    }
}

async fn describe(store: &MetadataStore, class: ResourceClass, request: &FilterRequest) -> Result<()> {
    match class {
        ResourceClass::Instance => print_json(&store.describe_instances(request).await?),
        ResourceClass::Volume => print_json(&store.describe_volumes(request).await?),
        ResourceClass::Image => print_json(&store.describe_images(request).await?),
        ResourceClass::Snapshot => print_json(&store.describe_snapshots(request).await?),
        ResourceClass::KeyPair => print_json(&store.describe_key_pairs(request).await?),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", text);
    Ok(())
}
