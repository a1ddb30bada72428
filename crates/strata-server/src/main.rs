//! strata server binary.
//!
//! Reads `config.toml` (or the path given with `--config`), opens the SQLite
//! store and blob directory, resumes interrupted imports, then runs the
//! import workers alongside the HTTP API.
//!
//! # Password hash generation
//!
//! To generate the argon2 PHC string for `auth_password_hash`:
//!
//! ```text
//! cargo run -p strata-server -- hash-password
//! ```

mod config;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use clap::{Parser, Subcommand};
use rand_core::OsRng;
use strata_api::{AppState, AuthConfig};
use strata_importer::{ChannelQueue, FsBlobStore, Pipeline, fixtures::SeedSet};
use strata_store_sqlite::SqliteStore;
use tokio::{net::TcpListener, signal};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use crate::config::ServerConfig;

type ServerPipeline = Pipeline<SqliteStore, ChannelQueue, FsBlobStore>;

#[derive(Parser)]
#[command(author, version, about = "strata statistics pipeline")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
  /// Run the import workers and the HTTP API (the default).
  Serve,
  /// Run one recovery pass, drive the resumed imports to rest and exit.
  Recover,
  /// Print the argon2 hash for a password entered on stdin and exit.
  HashPassword,
  /// Import a seed data set and wait for it to finish.
  Seed {
    /// Load `{name}.csv` and `{name}.meta.csv` from this directory instead
    /// of generating data.
    #[arg(long)]
    dir:  Option<PathBuf>,
    #[arg(long, default_value = "absence")]
    name: String,
    /// Generate this many synthetic rows instead of the absence set.
    #[arg(long, conflicts_with = "dir")]
    rows: Option<u64>,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  match cli.command.unwrap_or(Command::Serve) {
    Command::HashPassword => hash_password(),
    Command::Serve => serve(ServerConfig::load(&cli.config)?).await,
    Command::Recover => recover(ServerConfig::load(&cli.config)?).await,
    Command::Seed { dir, name, rows } => {
      let set = match (dir, rows) {
        (Some(dir), _) => SeedSet::from_dir(&dir, &name)
          .await
          .with_context(|| format!("failed to read seed set {name:?} from {dir:?}"))?,
        (None, Some(rows)) => SeedSet::synthetic(rows),
        (None, None) => SeedSet::absence(),
      };
      seed(ServerConfig::load(&cli.config)?, set).await
    }
  }
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn serve(cfg: ServerConfig) -> anyhow::Result<()> {
  if cfg.auth_password_hash.is_empty() {
    warn!("auth_password_hash is empty; admin endpoints will reject every request");
  }

  let (store, pipeline) = open(&cfg).await?;

  // Workers must not start until stale messages are purged and interrupted
  // imports re-queued.
  let report = pipeline.recovery.run().await.context("startup recovery failed")?;
  info!(purged = report.purged, imports = report.imports.len(), "startup recovery done");
  let pool = pipeline.spawn_workers();

  let state = AppState {
    store,
    pipeline,
    auth: Arc::new(AuthConfig {
      username:      cfg.auth_username.clone(),
      password_hash: cfg.auth_password_hash.clone(),
    }),
    query: cfg.query.clone(),
  };
  let app = strata_api::api_router(state);

  let address = cfg.address();
  info!("Listening on http://{address}");
  let listener = TcpListener::bind(&address)
    .await
    .with_context(|| format!("failed to bind {address}"))?;

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

  info!(workers = pool.len(), "stopping import workers");
  pool.shutdown().await;
  info!("shutdown complete");
  Ok(())
}

async fn recover(cfg: ServerConfig) -> anyhow::Result<()> {
  let (_, pipeline) = open(&cfg).await?;
  let report = pipeline.recovery.run().await.context("recovery failed")?;
  let handled = pipeline.run_until_idle().await.context("resumed imports failed")?;
  info!(messages = handled, "resumed imports drained");
  println!("{}", serde_json::to_string_pretty(&report)?);
  Ok(())
}

async fn seed(cfg: ServerConfig, set: SeedSet) -> anyhow::Result<()> {
  let (_, pipeline) = open(&cfg).await?;
  let record = pipeline
    .coordinator
    .submit(set.submit_request(Uuid::new_v4()))
    .await
    .context("failed to submit seed set")?;
  pipeline.run_until_idle().await.context("seed import failed")?;

  let progress = pipeline.coordinator.status(record.import_id).await?;
  println!("{}", serde_json::to_string_pretty(&progress)?);
  Ok(())
}

fn hash_password() -> anyhow::Result<()> {
  let password = rpassword_or_stdin()?;
  let salt = SaltString::generate(&mut OsRng);
  let hash = Argon2::default()
    .hash_password(password.as_bytes(), &salt)
    .map_err(|e| anyhow::anyhow!("argon2 error: {e}"))?
    .to_string();
  println!("{hash}");
  Ok(())
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

/// Open the store and blob directory and build a warmed pipeline over them.
async fn open(cfg: &ServerConfig) -> anyhow::Result<(Arc<SqliteStore>, Arc<ServerPipeline>)> {
  if let Some(parent) = cfg.store_path.parent()
    && !parent.as_os_str().is_empty()
  {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create {parent:?}"))?;
  }
  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;
  let store = Arc::new(store);

  tokio::fs::create_dir_all(&cfg.blob_root)
    .await
    .with_context(|| format!("failed to create blob root {:?}", cfg.blob_root))?;
  let blobs = Arc::new(FsBlobStore::new(&cfg.blob_root));
  let queue = Arc::new(ChannelQueue::new(cfg.importer.max_delivery_count));

  let pipeline = Pipeline::new(store.clone(), queue, blobs, cfg.importer.clone());
  pipeline.warm().await.context("failed to warm dimension cache")?;
  Ok((store, Arc::new(pipeline)))
}

/// Read a password from stdin.
fn rpassword_or_stdin() -> anyhow::Result<String> {
  use std::io::{self, BufRead, Write};
  let stdin = io::stdin();
  print!("Password: ");
  io::stdout().flush().ok();
  let mut line = String::new();
  stdin.lock().read_line(&mut line)?;
  Ok(
    line
      .trim_end_matches('\n')
      .trim_end_matches('\r')
      .to_string(),
  )
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      warn!(error = %e, "failed to listen for Ctrl+C");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sig) => {
        sig.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => info!("received Ctrl+C, shutting down"),
    _ = terminate => info!("received terminate signal, shutting down"),
  }
}
