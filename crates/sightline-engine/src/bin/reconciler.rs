//! sightline reconciler daemon.
//!
//! Reads `config.toml` (or the path given with `--config`), opens the SQLite
//! identity store, and runs promotion and reaping on their intervals until
//! interrupted.

use std::{
  path::{Path, PathBuf},
  sync::Arc,
  time::Duration,
};

use anyhow::Context as _;
use chrono::Utc;
use clap::Parser;
use sightline_core::{
  Classify as _,
  write_gate::{StaticCapability, WriteCapability},
};
use sightline_engine::{PromotionEngine, Reaper, Reconciler, config::load as load_config};
use sightline_store_sqlite::SqliteStore;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "sightline identity reconciler")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "config.toml")]
  config: PathBuf,

  /// Run one promotion and one reaper pass, print the reports, and exit.
  #[arg(long)]
  once: bool,
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

  let cfg = load_config(&cli.config).context("failed to load configuration")?;
  let store_path = expand_tilde(&cfg.store_path);
  let store = SqliteStore::open(&store_path)
    .await
    .with_context(|| format!("failed to open store at {store_path:?}"))?;
  let store = Arc::new(store);

  let writes: Arc<dyn WriteCapability> = Arc::new(StaticCapability(cfg.writes.enabled));
  let reconciler = Reconciler::new(Arc::clone(&store), Arc::clone(&writes), cfg.batching.clone());
  let promotion = PromotionEngine::new(reconciler, Arc::clone(&writes), cfg.promotion.clone());
  let reaper = Reaper::new(
    Arc::clone(&store),
    writes,
    cfg.reaper.clone(),
    cfg.batching.retry_policy(),
  );

  if cli.once {
    let promoted = promotion
      .run_once(Utc::now())
      .await
      .context("promotion run failed")?;
    let reaped = reaper.run_once().await.context("reaper run failed")?;
    let summary = serde_json::json!({ "promotion": promoted, "reaper": reaped });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    return Ok(());
  }

  let every = |secs: u64| {
    let mut tick = tokio::time::interval(Duration::from_secs(secs.max(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
  };
  let mut promote_tick = every(cfg.promotion.interval_secs);
  let mut reap_tick = every(cfg.reaper.interval_secs);

  let shutdown = tokio::signal::ctrl_c();
  tokio::pin!(shutdown);

  info!(store = ?store_path, "reconciler started");
  loop {
    tokio::select! {
      _ = promote_tick.tick() => {
        if let Err(e) = promotion.run_once(Utc::now()).await {
          error!(error = %e, retryable = e.is_retryable(), "promotion run failed");
        }
      }
      _ = reap_tick.tick() => {
        if let Err(e) = reaper.run_once().await {
          error!(error = %e, retryable = e.is_retryable(), "reaper run failed");
        }
      }
      _ = &mut shutdown => {
        info!("shutting down");
        break;
      }
    }
  }

  Ok(())
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
