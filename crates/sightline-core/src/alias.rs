//! Alias records, the per-device history of service ids and IPs.
//!
//! The record lives inside the device's metadata under `_alias_*`,
//! `service_alias:<id>` and `ip_alias:<ip>` keys, so it travels with the
//! device through every merge. Entries are only ever added and their
//! timestamps only move forward.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

pub const LAST_SEEN_AT_KEY: &str = "_alias_last_seen_at";
pub const COLLECTOR_IP_KEY: &str = "_alias_collector_ip";
pub const CURRENT_SERVICE_ID_KEY: &str = "_alias_last_seen_service_id";
pub const CURRENT_IP_KEY: &str = "_alias_last_seen_ip";
pub const SERVICE_ALIAS_PREFIX: &str = "service_alias:";
pub const IP_ALIAS_PREFIX: &str = "ip_alias:";

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AliasKind {
  Service,
  Ip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AliasRecord {
  pub last_seen_at:       Option<DateTime<Utc>>,
  pub collector_ip:       Option<String>,
  pub current_service_id: Option<String>,
  pub current_ip:         Option<String>,
  pub services:           BTreeMap<String, DateTime<Utc>>,
  pub ips:                BTreeMap<String, DateTime<Utc>>,
}

/// One identity value that should resolve back to the owning device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasEntry {
  pub kind:      AliasKind,
  pub value:     String,
  pub last_seen: DateTime<Utc>,
}

fn trimmed(value: Option<&str>) -> Option<String> {
  value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
}

fn parse_ts(value: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(value.trim())
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

fn bump(map: &mut BTreeMap<String, DateTime<Utc>>, key: &str, at: DateTime<Utc>) {
  let entry = map.entry(key.to_owned()).or_insert(at);
  *entry = (*entry).max(at);
}

impl AliasRecord {
  /// Parse the alias keys out of device metadata. `None` when there are none.
  pub fn from_metadata(metadata: &Metadata) -> Option<AliasRecord> {
    let mut record = AliasRecord {
      last_seen_at:       metadata.get(LAST_SEEN_AT_KEY).and_then(|v| parse_ts(v)),
      collector_ip:       trimmed(metadata.get(COLLECTOR_IP_KEY).map(String::as_str)),
      current_service_id: trimmed(
        metadata.get(CURRENT_SERVICE_ID_KEY).map(String::as_str),
      ),
      current_ip:         trimmed(metadata.get(CURRENT_IP_KEY).map(String::as_str)),
      ..Default::default()
    };

    for (key, value) in metadata {
      let (map, alias) = if let Some(alias) = key.strip_prefix(SERVICE_ALIAS_PREFIX) {
        (&mut record.services, alias)
      } else if let Some(alias) = key.strip_prefix(IP_ALIAS_PREFIX) {
        (&mut record.ips, alias)
      } else {
        continue;
      };
      let alias = alias.trim();
      if alias.is_empty() {
        continue;
      }
      if let Some(ts) = parse_ts(value).or(record.last_seen_at) {
        bump(map, alias, ts);
      }
    }

    (!record.is_empty()).then_some(record)
  }

  pub fn is_empty(&self) -> bool {
    self.last_seen_at.is_none()
      && self.collector_ip.is_none()
      && self.current_service_id.is_none()
      && self.current_ip.is_none()
      && self.services.is_empty()
      && self.ips.is_empty()
  }

  /// Replace every alias key in `metadata` with this record's contents.
  pub fn write_into(&self, metadata: &mut Metadata) {
    strip(metadata);
    if let Some(at) = self.last_seen_at {
      metadata.insert(LAST_SEEN_AT_KEY.to_owned(), at.to_rfc3339());
    }
    if let Some(v) = &self.collector_ip {
      metadata.insert(COLLECTOR_IP_KEY.to_owned(), v.clone());
    }
    if let Some(v) = &self.current_service_id {
      metadata.insert(CURRENT_SERVICE_ID_KEY.to_owned(), v.clone());
    }
    if let Some(v) = &self.current_ip {
      metadata.insert(CURRENT_IP_KEY.to_owned(), v.clone());
    }
    for (service, at) in &self.services {
      metadata.insert(format!("{SERVICE_ALIAS_PREFIX}{service}"), at.to_rfc3339());
    }
    for (ip, at) in &self.ips {
      metadata.insert(format!("{IP_ALIAS_PREFIX}{ip}"), at.to_rfc3339());
    }
  }

  /// Fold an observation of `service_id` / `ip` at `at` into `previous`.
  ///
  /// When a current value changes, the old value is kept in its map stamped
  /// with the time it was last in use. An observation older than the record
  /// only contributes history; it never replaces the current values.
  /// Returns `None` when there is nothing to track.
  pub fn observe(
    previous: Option<&AliasRecord>,
    service_id: Option<&str>,
    ip: Option<&str>,
    collector_ip: Option<&str>,
    at: DateTime<Utc>,
  ) -> Option<AliasRecord> {
    let service_id = trimmed(service_id);
    let ip = trimmed(ip);
    if previous.is_none() && service_id.is_none() && ip.is_none() {
      return None;
    }

    let mut record = previous.cloned().unwrap_or_default();
    let last_use = record.last_seen_at.unwrap_or(at);
    let is_current = record.last_seen_at.is_none_or(|seen| at >= seen);

    if let Some(new) = &service_id {
      if is_current {
        if let Some(old) = record.current_service_id.take()
          && old != *new
        {
          bump(&mut record.services, &old, last_use);
        }
        record.current_service_id = Some(new.clone());
      }
      bump(&mut record.services, new, at);
    }

    if let Some(new) = &ip {
      if is_current {
        if let Some(old) = record.current_ip.take()
          && old != *new
        {
          bump(&mut record.ips, &old, last_use);
        }
        record.current_ip = Some(new.clone());
      }
      bump(&mut record.ips, new, at);
    }

    if is_current && let Some(collector) = trimmed(collector_ip) {
      record.collector_ip = Some(collector);
    }

    record.last_seen_at = Some(record.last_seen_at.map_or(at, |seen| seen.max(at)));
    Some(record)
  }

  /// True when `current` introduces anything `previous` did not know.
  pub fn changed(previous: Option<&AliasRecord>, current: &AliasRecord) -> bool {
    let Some(previous) = previous else {
      return !current.is_empty();
    };
    previous.current_service_id != current.current_service_id
      || previous.current_ip != current.current_ip
      || previous.collector_ip != current.collector_ip
      || current.services.keys().any(|k| !previous.services.contains_key(k))
      || current.ips.keys().any(|k| !previous.ips.contains_key(k))
  }

  /// When `value` of `kind` was last used by this device, if ever.
  pub fn last_use_of(&self, kind: AliasKind, value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    let map = match kind {
      AliasKind::Service => &self.services,
      AliasKind::Ip => &self.ips,
    };
    map.get(value).copied()
  }

  /// Every identity value this record can be looked up by.
  pub fn entries(&self) -> Vec<AliasEntry> {
    let services = self.services.iter().map(|(v, at)| AliasEntry {
      kind:      AliasKind::Service,
      value:     v.clone(),
      last_seen: *at,
    });
    let ips = self.ips.iter().map(|(v, at)| AliasEntry {
      kind:      AliasKind::Ip,
      value:     v.clone(),
      last_seen: *at,
    });
    services.chain(ips).collect()
  }

  fn normalized(&self) -> AliasRecord {
    let norm = |map: &BTreeMap<String, DateTime<Utc>>| {
      map
        .iter()
        .map(|(k, v)| (k.trim().to_owned(), *v))
        .collect::<BTreeMap<_, _>>()
    };
    AliasRecord {
      last_seen_at:       self.last_seen_at,
      collector_ip:       trimmed(self.collector_ip.as_deref()),
      current_service_id: trimmed(self.current_service_id.as_deref()),
      current_ip:         trimmed(self.current_ip.as_deref()),
      services:           norm(&self.services),
      ips:                norm(&self.ips),
    }
  }
}

/// Order-insensitive and whitespace-insensitive comparison.
impl PartialEq for AliasRecord {
  fn eq(&self, other: &Self) -> bool {
    let (a, b) = (self.normalized(), other.normalized());
    a.last_seen_at == b.last_seen_at
      && a.collector_ip == b.collector_ip
      && a.current_service_id == b.current_service_id
      && a.current_ip == b.current_ip
      && a.services == b.services
      && a.ips == b.ips
  }
}

impl Eq for AliasRecord {}

/// Remove every alias key from `metadata`.
pub fn strip(metadata: &mut Metadata) {
  metadata.retain(|key, _| {
    !(key == LAST_SEEN_AT_KEY
      || key == COLLECTOR_IP_KEY
      || key == CURRENT_SERVICE_ID_KEY
      || key == CURRENT_IP_KEY
      || key.starts_with(SERVICE_ALIAS_PREFIX)
      || key.starts_with(IP_ALIAS_PREFIX))
  });
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::*;

  #[test]
  fn service_change_keeps_old_id_with_last_use() {
    let t0 = Utc::now();
    let t1 = t0 + Duration::minutes(10);

    let first = AliasRecord::observe(None, Some("svc:S1"), Some("10.0.0.5"), None, t0)
      .unwrap();
    let second =
      AliasRecord::observe(Some(&first), Some("svc:S2"), Some("10.0.0.5"), None, t1)
        .unwrap();

    assert_eq!(second.current_service_id.as_deref(), Some("svc:S2"));
    assert_eq!(second.last_use_of(AliasKind::Service, "svc:S1"), Some(t0));
    assert_eq!(second.last_use_of(AliasKind::Service, "svc:S2"), Some(t1));
    assert_eq!(second.last_seen_at, Some(t1));
    assert!(AliasRecord::changed(Some(&first), &second));
  }

  #[test]
  fn stale_observation_only_adds_history() {
    let t0 = Utc::now();
    let current = AliasRecord::observe(None, None, Some("10.0.0.9"), None, t0).unwrap();
    let stale = AliasRecord::observe(
      Some(&current),
      None,
      Some("10.0.0.1"),
      None,
      t0 - Duration::hours(1),
    )
    .unwrap();

    assert_eq!(stale.current_ip.as_deref(), Some("10.0.0.9"));
    assert_eq!(stale.last_seen_at, Some(t0));
    assert_eq!(
      stale.last_use_of(AliasKind::Ip, "10.0.0.1"),
      Some(t0 - Duration::hours(1))
    );
  }

  #[test]
  fn timestamps_never_move_backwards() {
    let t0 = Utc::now();
    let a = AliasRecord::observe(None, None, Some("10.0.0.1"), None, t0).unwrap();
    let b = AliasRecord::observe(Some(&a), None, Some("10.0.0.2"), None, t0 + Duration::minutes(1))
      .unwrap();
    let c = AliasRecord::observe(Some(&b), None, Some("10.0.0.1"), None, t0 - Duration::days(1))
      .unwrap();
    assert_eq!(c.last_use_of(AliasKind::Ip, "10.0.0.1"), Some(t0));
    assert_eq!(c.last_use_of(AliasKind::Ip, "10.0.0.2"), Some(t0 + Duration::minutes(1)));
  }

  #[test]
  fn metadata_roundtrip_and_strip() {
    let t0 = Utc::now();
    let record = AliasRecord::observe(
      None,
      Some("serviceradar:agent:k8s"),
      Some("10.0.0.8"),
      Some("10.1.0.1"),
      t0,
    )
    .unwrap();

    let mut md = Metadata::new();
    md.insert("vendor".into(), "acme".into());
    record.write_into(&mut md);
    assert_eq!(AliasRecord::from_metadata(&md).as_ref(), Some(&record));

    strip(&mut md);
    assert_eq!(md.len(), 1);
    assert!(AliasRecord::from_metadata(&md).is_none());
  }

  #[test]
  fn equality_ignores_whitespace() {
    let t0 = Utc::now();
    let mut a = AliasRecord::observe(None, Some("svc"), None, None, t0).unwrap();
    let b = a.clone();
    a.current_service_id = Some("  svc ".into());
    a.services = a
      .services
      .into_iter()
      .map(|(k, v)| (format!(" {k}"), v))
      .collect();
    assert_eq!(a, b);
  }
}
