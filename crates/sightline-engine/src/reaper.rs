//! Cleanup of low-confidence and long-dead devices.

use std::sync::Arc;

use serde::Serialize;
use sightline_core::{policy::dwell_secs, store::IdentityStore, write_gate::WriteCapability};
use tracing::{debug, info};

use crate::{
  Result,
  config::ReaperConfig,
  retry::{RetryPolicy, with_retry},
};

/// `source` recorded on soft-delete audit rows written by the reaper.
pub const REAPER_SOURCE: &str = "reaper";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
  /// IP-only devices soft-deleted by this run.
  pub soft_deleted:    u64,
  /// Devices hard-deleted by the retention sweep.
  pub purged:          u64,
  pub writes_disabled: bool,
}

pub struct Reaper<S> {
  store:  Arc<S>,
  writes: Arc<dyn WriteCapability>,
  config: ReaperConfig,
  retry:  RetryPolicy,
}

impl<S: IdentityStore> Reaper<S> {
  pub fn new(
    store: Arc<S>,
    writes: Arc<dyn WriteCapability>,
    config: ReaperConfig,
    retry: RetryPolicy,
  ) -> Self {
    Self { store, writes, config, retry }
  }

  pub fn config(&self) -> &ReaperConfig { &self.config }

  /// Soft-delete stale IP-only devices, then purge devices past retention.
  pub async fn run_once(&self) -> Result<ReapReport> {
    let mut report = ReapReport::default();
    if !self.config.enabled {
      debug!("reaper disabled");
      return Ok(report);
    }
    if !self.writes.enabled() {
      report.writes_disabled = true;
      info!(writes_disabled = true, "skipping reaper run");
      return Ok(report);
    }

    let store = &*self.store;
    let ttl = dwell_secs(self.config.ip_only_ttl_secs);
    let stale = with_retry(self.retry, "find_stale_ip_only", move || {
      store.find_stale_ip_only(ttl)
    })
    .await?;
    if !stale.is_empty() {
      debug!(devices = ?stale, "soft-deleting stale ip-only devices");
      report.soft_deleted = with_retry(self.retry, "soft_delete_devices", move || {
        store.soft_delete_devices(stale.clone(), REAPER_SOURCE.to_owned())
      })
      .await?;
    }

    if self.config.retention_secs > 0 {
      let retention = dwell_secs(self.config.retention_secs);
      report.purged = with_retry(self.retry, "purge_stale_devices", move || {
        store.purge_stale_devices(retention)
      })
      .await?;
    }

    info!(
      soft_deleted = report.soft_deleted,
      purged = report.purged,
      "reaper run complete"
    );
    Ok(report)
  }
}
