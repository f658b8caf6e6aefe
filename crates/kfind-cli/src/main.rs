mod discovery_file;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use discovery_file::FileDiscoveryClient;
use kfind_core::{CacheSlot, ConnectionDescriptor, ServerIdentity};
use kfind_finder::{
    DiscoveryBackedValidator, FinderCollaborators, FinderConfig, FinderError, KernelRegistry,
    RegistryChange, RemoteKernelFinder, WatchServerIdentity,
};
use kfind_storage::{CacheStore, MemoryCacheStore, SqliteCacheStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_WATCH_INTERVAL_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "kfind")]
#[command(about = "Remote kernel discovery with a warm cache", long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG is set.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one refresh cycle and print the kernels found
    List {
        #[command(flatten)]
        finder: FinderArgs,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Keep refreshing and print registry changes until Ctrl-C
    Watch {
        #[command(flatten)]
        finder: FinderArgs,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Inspect the persisted cache
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    Show {
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long, env = "KFIND_CACHE_DB")]
        cache_db: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    Clear {
        #[command(flatten)]
        server: ServerArgs,
        #[arg(long, env = "KFIND_CACHE_DB")]
        cache_db: PathBuf,
    },
}

#[derive(Args, Clone)]
struct ServerArgs {
    #[arg(long, env = "KFIND_SERVER_ID")]
    server_id: String,
    #[arg(long, env = "KFIND_BASE_URL")]
    base_url: String,
}

impl ServerArgs {
    fn identity(&self) -> Result<ServerIdentity> {
        ServerIdentity::new(self.server_id.clone(), self.base_url.clone())
            .context("invalid server identity")
    }
}

#[derive(Args, Clone)]
struct FinderArgs {
    #[command(flatten)]
    server: ServerArgs,
    /// JSON file with `kernelspecs`, `kernels` and `sessions` listings
    #[arg(long, env = "KFIND_DISCOVERY_FILE")]
    discovery: PathBuf,
    /// SQLite cache; without it the cache lives in memory for this run
    #[arg(long, env = "KFIND_CACHE_DB")]
    cache_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::List { finder, json } => run_list(finder, json).await,
        Commands::Watch {
            finder,
            interval_secs,
        } => run_watch(finder, interval_secs).await,
        Commands::Cache { action } => match action {
            CacheCommands::Show {
                server,
                cache_db,
                json,
            } => run_cache_show(&server, &cache_db, json).await,
            CacheCommands::Clear { server, cache_db } => run_cache_clear(&server, &cache_db).await,
        },
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("KFIND_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn open_store(cache_db: Option<&Path>) -> Result<Arc<dyn CacheStore>> {
    match cache_db {
        Some(path) => {
            let store = SqliteCacheStore::open(path)
                .with_context(|| format!("failed to open cache {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryCacheStore::new())),
    }
}

fn build_finder(args: &FinderArgs, config: FinderConfig) -> Result<RemoteKernelFinder> {
    let server = args.server.identity()?;
    let discovery = Arc::new(FileDiscoveryClient::new(&args.discovery));
    let collaborators = FinderCollaborators {
        validator: Arc::new(DiscoveryBackedValidator::new(discovery.clone())),
        discovery,
        store: open_store(args.cache_db.as_deref())?,
        identity: Arc::new(WatchServerIdentity::fixed(server)),
    };
    Ok(RemoteKernelFinder::new(
        config,
        Arc::new(KernelRegistry::new()),
        collaborators,
    ))
}

async fn run_list(args: FinderArgs, json: bool) -> Result<()> {
    let config = FinderConfig::from_env().context("invalid finder configuration")?;
    let finder = build_finder(&args, config)?;

    match finder.activate().outcome().await {
        Ok(report) => info!(
            event = "kernel_list_refreshed",
            published = report.published,
            from_cache = report.from_cache,
            failed_sources = report.failed_sources.len(),
            persisted = report.persisted
        ),
        // Whatever the cache supplied is still worth printing.
        Err(err @ FinderError::ServerUnreachable { .. }) => {
            warn!(event = "kernel_list_offline", error = %err)
        }
        Err(err) => {
            finder.dispose().await;
            return Err(err).context("refresh failed");
        }
    }

    let kernels = finder.kernels().await;
    finder.dispose().await;
    print_connections(&kernels, json)
}

async fn run_watch(args: FinderArgs, interval_secs: Option<u64>) -> Result<()> {
    let mut config = FinderConfig::from_env().context("invalid finder configuration")?;
    if let Some(secs) = interval_secs {
        config.refresh_interval = Some(Duration::from_secs(secs.max(1)));
    } else if config.refresh_interval.is_none() {
        config.refresh_interval = Some(Duration::from_secs(DEFAULT_WATCH_INTERVAL_SECS));
    }

    let finder = build_finder(&args, config)?;
    let mut changes = finder.registry().subscribe();
    let first = finder.activate();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(change) => print_change(&finder, &change).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "kernel_watch_lagged", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(first);
    finder.dispose().await;
    Ok(())
}

async fn print_change(finder: &RemoteKernelFinder, change: &RegistryChange) {
    for id in &change.added {
        let name = finder
            .registry()
            .get(id)
            .await
            .map(|descriptor| descriptor.display_name().to_string())
            .unwrap_or_default();
        println!("+ {} {name}", short_id(id));
    }
    for id in &change.updated {
        println!("~ {}", short_id(id));
    }
    for id in &change.removed {
        println!("- {}", short_id(id));
    }
}

async fn run_cache_show(server: &ServerArgs, cache_db: &Path, json: bool) -> Result<()> {
    let config = FinderConfig::from_env().context("invalid finder configuration")?;
    let store = SqliteCacheStore::open(cache_db)
        .with_context(|| format!("failed to open cache {}", cache_db.display()))?;
    let slot = CacheSlot::new(config.cache_key, server.identity()?);

    let Some(snapshot) = store.load(&slot).await.context("failed to load snapshot")? else {
        println!("No cached kernels for {}", slot.server);
        return Ok(());
    };
    if !json {
        if let Some(saved) = store.snapshot_info(&slot)? {
            println!(
                "Snapshot for {} (version {}, {} entries, saved {})",
                slot.server, saved.extension_version, saved.entry_count, saved.updated_at
            );
        }
    }
    print_connections(&snapshot.connections, json)
}

async fn run_cache_clear(server: &ServerArgs, cache_db: &Path) -> Result<()> {
    let config = FinderConfig::from_env().context("invalid finder configuration")?;
    let store = SqliteCacheStore::open(cache_db)
        .with_context(|| format!("failed to open cache {}", cache_db.display()))?;
    let slot = CacheSlot::new(config.cache_key, server.identity()?);

    if store.clear(&slot).await.context("failed to clear snapshot")? {
        println!("Cleared cached kernels for {}", slot.server);
    } else {
        println!("No cached kernels for {}", slot.server);
    }
    Ok(())
}

fn print_connections(connections: &[ConnectionDescriptor], json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(connections)?;
        println!("{out}");
        return Ok(());
    }

    if connections.is_empty() {
        println!("No kernels found");
        return Ok(());
    }
    println!("Found {} kernels:", connections.len());
    for descriptor in connections {
        println!(
            "{:<5} {} {}",
            descriptor.kind().as_str(),
            short_id(descriptor.id()),
            descriptor.display_name()
        );
    }
    Ok(())
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
