//! Engine configuration, deserialised from `config.toml` and `SIGHTLINE_*`
//! environment variables.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use sightline_core::{
  batch::{DEFAULT_MAX_BATCH_BYTES, DEFAULT_MAX_BATCH_ROWS},
  policy::{self, EffectivePolicy, PromotionRules},
};

use crate::retry::{DEFAULT_BASE_DELAY, RetryPolicy};

// ─── Sections ────────────────────────────────────────────────────────────────

/// Top-level configuration. Every section has defaults, so an empty file is
/// valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub store_path: PathBuf,
  pub promotion:  PromotionConfig,
  pub batching:   BatchingConfig,
  pub writes:     WritesConfig,
  pub reaper:     ReaperConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      store_path: PathBuf::from("sightline.db"),
      promotion:  PromotionConfig::default(),
      batching:   BatchingConfig::default(),
      writes:     WritesConfig::default(),
      reaper:     ReaperConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
  pub enabled:                bool,
  /// Evaluate and count, but write nothing.
  pub shadow_mode:            bool,
  pub interval_secs:          u64,
  /// Dwell time for sightings outside any subnet with its own override.
  pub min_persistence_secs:   i64,
  /// Whether an IP alone may identify a device outside configured subnets.
  pub default_allow_ip_as_id: bool,
}

impl Default for PromotionConfig {
  fn default() -> Self {
    Self {
      enabled:                true,
      shadow_mode:            false,
      interval_secs:          60,
      min_persistence_secs:   3600,
      default_allow_ip_as_id: false,
    }
  }
}

impl PromotionConfig {
  /// The policy applied to sightings no subnet policy claims.
  pub fn fallback_policy(&self) -> EffectivePolicy {
    EffectivePolicy {
      subnet_id:      None,
      allow_ip_as_id: self.default_allow_ip_as_id,
      dwell:          policy::dwell_secs(self.min_persistence_secs),
      rules:          PromotionRules::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
  pub max_batch_bytes:        usize,
  pub max_batch_rows:         usize,
  /// Upper bound on a single store call, per attempt.
  pub operation_timeout_secs: u64,
  pub max_retry_attempts:     u32,
}

impl Default for BatchingConfig {
  fn default() -> Self {
    Self {
      max_batch_bytes:        DEFAULT_MAX_BATCH_BYTES,
      max_batch_rows:         DEFAULT_MAX_BATCH_ROWS,
      operation_timeout_secs: 30,
      max_retry_attempts:     3,
    }
  }
}

impl BatchingConfig {
  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_retry_attempts.max(1),
      base_delay:   DEFAULT_BASE_DELAY,
      timeout:      std::time::Duration::from_secs(self.operation_timeout_secs.max(1)),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WritesConfig {
  pub enabled: bool,
}

impl Default for WritesConfig {
  fn default() -> Self { Self { enabled: true } }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
  pub enabled:          bool,
  pub interval_secs:    u64,
  /// IP-only devices unseen for this long are soft-deleted.
  pub ip_only_ttl_secs: i64,
  /// Devices unseen for this long are hard-deleted. Zero disables the purge.
  pub retention_secs:   i64,
}

impl Default for ReaperConfig {
  fn default() -> Self {
    Self {
      enabled:          true,
      interval_secs:    3600,
      ip_only_ttl_secs: 24 * 3600,
      retention_secs:   90 * 24 * 3600,
    }
  }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Layer `path` (optional) under `SIGHTLINE_`-prefixed environment variables.
///
/// Nested keys use a double underscore, e.g.
/// `SIGHTLINE_PROMOTION__SHADOW_MODE=true`.
pub fn load(path: &Path) -> Result<EngineConfig, config::ConfigError> {
  config::Config::builder()
    .add_source(config::File::from(path).required(false))
    .add_source(
      config::Environment::with_prefix("SIGHTLINE")
        .prefix_separator("_")
        .separator("__"),
    )
    .build()?
    .try_deserialize()
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::*;

  fn parse(toml: &str) -> EngineConfig {
    config::Config::builder()
      .add_source(config::File::from_str(toml, config::FileFormat::Toml))
      .build()
      .unwrap()
      .try_deserialize()
      .unwrap()
  }

  #[test]
  fn empty_file_uses_defaults() {
    let cfg = parse("");
    assert_eq!(cfg.store_path, PathBuf::from("sightline.db"));
    assert!(cfg.promotion.enabled);
    assert!(!cfg.promotion.default_allow_ip_as_id);
    assert_eq!(cfg.promotion.min_persistence_secs, 3600);
    assert_eq!(cfg.batching.max_retry_attempts, 3);
    assert!(cfg.writes.enabled);
  }

  #[test]
  fn sections_override_defaults() {
    let cfg = parse(
      r#"
        store_path = "/var/lib/sightline/db.sqlite"

        [promotion]
        shadow_mode = true
        min_persistence_secs = 600
        default_allow_ip_as_id = true

        [batching]
        max_batch_rows = 10

        [reaper]
        retention_secs = 0
      "#,
    );
    assert!(cfg.promotion.shadow_mode);
    assert_eq!(cfg.promotion.interval_secs, 60);
    assert_eq!(cfg.batching.max_batch_rows, 10);
    assert_eq!(cfg.reaper.retention_secs, 0);

    let fallback = cfg.promotion.fallback_policy();
    assert!(fallback.allow_ip_as_id);
    assert_eq!(fallback.dwell, Duration::minutes(10));
  }

  #[test]
  fn out_of_range_dwell_saturates() {
    let cfg = parse("[promotion]\nmin_persistence_secs = 9223372036854775807\n");
    assert_eq!(cfg.promotion.fallback_policy().dwell, Duration::MAX);
  }
}
