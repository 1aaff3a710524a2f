use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use historian::agent::Historian;
use historian::config::{Backend, Config};
use historian::migrate::{Migrator, SchemaMigrator};
use historian::store::clickhouse::{ClickHouseDialect, ClickHouseStore};
use historian::store::memory::{MemoryDialect, MemoryStore};
use historian::store::{Dialect, Probe, Store, TcpProbe};

/// Telemetry history buffer with a durable local cache.
#[derive(Parser)]
#[command(name = "historian", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Connect to the configured store and run a trivial statement.
    Check,
    /// Drop the store schema, including all stored history.
    Destroy,
}

mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("historian {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Some(command @ (Command::Check | Command::Destroy)) => {
                run_command(&cfg, command).await
            }
            _ => run_agent(cfg, &config_path).await,
        }
    })
}

/// Runs a one-shot schema subcommand against the configured store.
async fn run_command(cfg: &Config, command: Command) -> Result<()> {
    match cfg.store.backend {
        Backend::ClickHouse => {
            let store = ClickHouseStore::new(&cfg.store);
            let dialect = Arc::new(ClickHouseDialect::new(&cfg.store.database));
            run_migrator(store, dialect, cfg, command).await
        }
        Backend::Memory => {
            run_migrator(MemoryStore::new(), Arc::new(MemoryDialect), cfg, command).await
        }
    }
}

async fn run_migrator<S: Store>(
    store: S,
    dialect: Arc<dyn Dialect>,
    cfg: &Config,
    command: Command,
) -> Result<()> {
    let store = Arc::new(store);
    let migrator = SchemaMigrator::new(Arc::clone(&store), dialect, cfg.store.borrow_timeout);

    let result = match command {
        Command::Check => migrator.check().await.map(|()| "store connection ok"),
        Command::Destroy => migrator.down().await.map(|()| "store schema dropped"),
        Command::Version => Ok(version::RELEASE),
    };
    store.close().await;

    println!("{}", result?);
    Ok(())
}

async fn run_agent(cfg: Config, config_path: &Path) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        config = %config_path.display(),
        "starting historian",
    );

    match cfg.store.backend {
        Backend::ClickHouse => {
            let store = ClickHouseStore::new(&cfg.store);
            let probe = TcpProbe::new(store.endpoint(), cfg.store.probe_timeout);
            let dialect = Arc::new(ClickHouseDialect::new(&cfg.store.database));
            run(Historian::new(cfg, store, dialect, probe)?).await
        }
        Backend::Memory => {
            tracing::warn!("memory backend selected, stored history is lost on exit");
            let store = MemoryStore::new();
            let probe = store.clone();
            run(Historian::new(cfg, store, Arc::new(MemoryDialect), probe)?).await
        }
    }
}

async fn run<S: Store, P: Probe>(mut historian: Historian<S, P>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    historian.start().await?;

    let _ = shutdown_rx.await;

    historian.stop().await?;

    Ok(())
}
