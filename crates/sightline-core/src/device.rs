//! Canonical devices and the update merge rules.
//!
//! [`merge_update`] is the single place where an observation is folded into a
//! stored device. Storage backends call it per row, so single writes and
//! batches behave identically.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
  Error,
  alias::{self, AliasRecord},
  error::ValidationError,
  identifier::{self, VENDOR_ID_KEYS},
  metadata::{self, DELETION_KEYS, MERGED_INTO_KEY, Metadata},
  sighting::DEFAULT_PARTITION,
};

/// Hop limit for `merged_into` chains.
pub const MAX_MERGE_DEPTH: usize = 8;

pub const DEFAULT_DEVICE_TYPE: &str = "unknown";

// ─── DeviceUpdate ────────────────────────────────────────────────────────────

/// One observation of a device from an ingestion source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
  /// Filled in by identity resolution when the source does not know it.
  pub device_id:    Option<String>,
  pub ip:           String,
  pub source:       String,
  pub agent_id:     Option<String>,
  pub poller_id:    Option<String>,
  pub partition:    String,
  pub timestamp:    DateTime<Utc>,
  pub mac:          Option<String>,
  pub hostname:     Option<String>,
  /// Service identifier of the reporting service, tracked as an alias.
  pub service_id:   Option<String>,
  pub metadata:     Metadata,
  pub is_available: bool,
}

impl DeviceUpdate {
  pub fn new(
    ip: impl Into<String>,
    source: impl Into<String>,
    timestamp: DateTime<Utc>,
  ) -> Self {
    Self {
      device_id: None,
      ip: ip.into(),
      source: source.into(),
      agent_id: None,
      poller_id: None,
      partition: DEFAULT_PARTITION.to_owned(),
      timestamp,
      mac: None,
      hostname: None,
      service_id: None,
      metadata: Metadata::new(),
      is_available: true,
    }
  }

  pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
    self.device_id = Some(device_id.into());
    self
  }

  /// Trimmed device id, if resolved.
  pub fn resolved_id(&self) -> Option<&str> {
    self
      .device_id
      .as_deref()
      .map(str::trim)
      .filter(|id| !id.is_empty())
  }

  /// Trimmed partition, or the default one when blank.
  pub fn partition(&self) -> &str {
    let partition = self.partition.trim();
    if partition.is_empty() { DEFAULT_PARTITION } else { partition }
  }

  /// The IP-derived fallback device id, `"{partition}:{ip}"`.
  pub fn ip_device_id(&self) -> String { format!("{}:{}", self.partition(), self.ip.trim()) }

  /// The id a device with this observation's strong identifiers gets when no
  /// device owns them yet.
  pub fn derived_device_id(&self) -> Option<String> {
    identifier::derived_device_id(self.partition(), &self.strong_identifiers())
  }

  /// Strong identifiers this observation carries.
  pub fn strong_identifiers(&self) -> Vec<(&'static str, String)> {
    identifier::strong_identifiers(self.mac.as_deref(), &self.metadata)
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.resolved_id().is_none() {
      return Err(ValidationError::DeviceIdMissing);
    }
    if self.ip.trim().is_empty() {
      return Err(ValidationError::IpMissing);
    }
    Ok(())
  }
}

// ─── CanonicalDevice ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalDevice {
  pub device_id:         String,
  pub ip:                String,
  pub poller_id:         Option<String>,
  pub agent_id:          Option<String>,
  pub hostname:          Option<String>,
  pub mac:               Option<String>,
  pub discovery_sources: BTreeSet<String>,
  pub is_available:      bool,
  pub first_seen:        DateTime<Utc>,
  pub last_seen:         DateTime<Utc>,
  pub metadata:          Metadata,
  /// Surviving device this one was merged into.
  pub merged_into:       Option<String>,
  pub device_type:       String,
  pub service_type:      Option<String>,
  pub service_status:    Option<String>,
  pub last_heartbeat:    Option<DateTime<Utc>>,
  pub os_info:           Option<String>,
  pub version_info:      Option<String>,
}

impl CanonicalDevice {
  fn empty(device_id: &str, at: DateTime<Utc>) -> Self {
    Self {
      device_id:         device_id.to_owned(),
      ip:                String::new(),
      poller_id:         None,
      agent_id:          None,
      hostname:          None,
      mac:               None,
      discovery_sources: BTreeSet::new(),
      is_available:      false,
      first_seen:        at,
      last_seen:         at,
      metadata:          Metadata::new(),
      merged_into:       None,
      device_type:       DEFAULT_DEVICE_TYPE.to_owned(),
      service_type:      None,
      service_status:    None,
      last_heartbeat:    None,
      os_info:           None,
      version_info:      None,
    }
  }

  pub fn is_deleted(&self) -> bool { metadata::asserts_deletion(&self.metadata) }

  pub fn is_merged(&self) -> bool { self.merged_into.is_some() }

  /// MAC or a vendor asset id.
  pub fn has_strong_identity(&self) -> bool {
    self.mac.as_deref().is_some_and(|m| !m.trim().is_empty())
      || metadata::first_non_empty(&self.metadata, &VENDOR_ID_KEYS).is_some()
  }

  pub fn aliases(&self) -> Option<AliasRecord> {
    AliasRecord::from_metadata(&self.metadata)
  }
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// Result of folding one update into a device.
#[derive(Debug, Clone)]
pub struct MergedDevice {
  pub device:        CanonicalDevice,
  pub created:       bool,
  pub alias_changed: bool,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
  value.map(str::trim).filter(|v| !v.is_empty())
}

/// Preserve-non-empty assignment: blanks never erase; a stale observation
/// only fills gaps.
fn assign(slot: &mut Option<String>, incoming: Option<&str>, fresh: bool) {
  if let Some(value) = non_empty(incoming)
    && (fresh || slot.is_none())
  {
    *slot = Some(value.to_owned());
  }
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value.trim())
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

/// Fold `update` into `existing` (or create the device).
///
/// - `ip`, poller/agent attribution, `hostname` and `mac` are never blanked.
/// - `discovery_sources` is a set union.
/// - Liveness (`is_available`, `last_seen`) follows the newest `timestamp`.
/// - Deletion markers survive only when this update asserts them.
pub fn merge_update(
  existing: Option<&CanonicalDevice>,
  update: &DeviceUpdate,
) -> Result<MergedDevice, ValidationError> {
  update.validate()?;
  let device_id = update.resolved_id().unwrap_or_default();
  let at = update.timestamp;

  let created = existing.is_none();
  let mut device = existing
    .cloned()
    .unwrap_or_else(|| CanonicalDevice::empty(device_id, at));
  let fresh = created || at >= device.last_seen;

  let ip = update.ip.trim();
  if fresh || device.ip.is_empty() {
    device.ip = ip.to_owned();
  }
  assign(&mut device.poller_id, update.poller_id.as_deref(), fresh);
  assign(&mut device.agent_id, update.agent_id.as_deref(), fresh);
  assign(&mut device.hostname, update.hostname.as_deref(), fresh);
  let mac = update.mac.as_deref().and_then(identifier::normalize_mac);
  assign(&mut device.mac, mac.as_deref(), fresh);

  if let Some(source) = non_empty(Some(&update.source)) {
    device.discovery_sources.insert(source.to_owned());
  }

  if fresh {
    device.is_available = update.is_available;
    device.last_seen = at;
  }
  device.first_seen = device.first_seen.min(at);
  if let Some(first) = ["_first_seen", "first_seen"]
    .iter()
    .filter_map(|k| update.metadata.get(*k))
    .find_map(|v| parse_ts(v))
  {
    device.first_seen = device.first_seen.min(first);
  }

  // Metadata: alias keys are derived, the merge pointer is a column.
  let mut incoming = update.metadata.clone();
  incoming.remove(MERGED_INTO_KEY);
  alias::strip(&mut incoming);

  let previous_aliases = device.aliases();
  let mut merged = if fresh {
    metadata::union(&device.metadata, &incoming)
  } else {
    metadata::fill(&device.metadata, &incoming)
  };
  if metadata::asserts_deletion(&update.metadata) {
    for key in DELETION_KEYS {
      if let Some(value) = update.metadata.get(key) {
        merged.insert(key.to_owned(), value.clone());
      }
    }
  } else {
    for key in DELETION_KEYS {
      merged.remove(key);
    }
  }

  let mut alias_changed = false;
  if let Some(record) = AliasRecord::observe(
    previous_aliases.as_ref(),
    update.service_id.as_deref(),
    Some(ip),
    update.metadata.get("collector_ip").map(String::as_str),
    at,
  ) {
    alias_changed = AliasRecord::changed(previous_aliases.as_ref(), &record);
    record.write_into(&mut merged);
  }
  device.metadata = merged;

  let meta = &device.metadata;
  if let Some(kind) = metadata::first_non_empty(meta, &["device_type"]) {
    device.device_type = kind.to_owned();
  }
  assign(
    &mut device.service_type,
    metadata::first_non_empty(meta, &["service_type"]),
    true,
  );
  assign(
    &mut device.service_status,
    metadata::first_non_empty(meta, &["service_status"]),
    true,
  );
  assign(
    &mut device.os_info,
    metadata::first_non_empty(meta, &["os_info", "os_name"]),
    true,
  );
  assign(
    &mut device.version_info,
    metadata::first_non_empty(meta, &["version_info", "version"]),
    true,
  );
  if let Some(beat) = meta.get("last_heartbeat").and_then(|v| parse_ts(v)) {
    device.last_heartbeat = Some(device.last_heartbeat.map_or(beat, |b| b.max(beat)));
  }

  Ok(MergedDevice { device, created, alias_changed })
}

/// Per-device outcome of an applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceChange {
  pub device_id:     String,
  pub created:       bool,
  pub alias_changed: bool,
}

/// Outcome of [`crate::store::IdentityStore::apply_device_updates`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
  pub report:  crate::batch::BatchReport,
  pub changes: Vec<DeviceChange>,
}

impl ApplyReport {
  pub fn created(&self) -> usize { self.changes.iter().filter(|c| c.created).count() }

  /// Devices whose alias record changed, in apply order, deduplicated.
  pub fn alias_changed(&self) -> Vec<&str> {
    let mut seen = HashSet::new();
    self
      .changes
      .iter()
      .filter(|c| c.alias_changed && seen.insert(c.device_id.as_str()))
      .map(|c| c.device_id.as_str())
      .collect()
  }
}

/// Follow `merged_into` pointers from `start` to the surviving device.
///
/// `next` returns the pointer stored for a device, or `None` for a root (or an
/// unknown id). Cycles and chains longer than [`MAX_MERGE_DEPTH`] are errors.
pub fn resolve_merge_chain<E>(
  start: &str,
  mut next: impl FnMut(&str) -> Result<Option<String>, E>,
) -> Result<String, E>
where
  E: From<Error>,
{
  let mut visited = HashSet::new();
  let mut current = start.to_owned();
  visited.insert(current.clone());

  for _ in 0..MAX_MERGE_DEPTH {
    match next(&current)? {
      None => return Ok(current),
      Some(target) => {
        if !visited.insert(target.clone()) {
          return Err(
            Error::MergeCycle { from: current, to: target }.into(),
          );
        }
        current = target;
      }
    }
  }

  Err(
    Error::MergeChainTooDeep {
      device_id: start.to_owned(),
      max_depth: MAX_MERGE_DEPTH,
    }
    .into(),
  )
}
