//! Identifiers: typed, confidence-rated values that attribute observations to
//! a device.
//!
//! Identifiers are unique on `(id_type, id_value)`. Writing an existing key
//! merges into the stored row rather than replacing it; see
//! [`Identifier::merge`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  error::ValidationError,
  metadata::{self, Metadata},
};

// ─── Identifier types ────────────────────────────────────────────────────────

pub const ID_TYPE_ARMIS: &str = "armis_device_id";
pub const ID_TYPE_INTEGRATION: &str = "integration_id";
pub const ID_TYPE_NETBOX: &str = "netbox_device_id";
pub const ID_TYPE_MAC: &str = "mac";
pub const ID_TYPE_IP: &str = "ip";

/// Identifier types that prove two observations are the same asset, highest
/// priority first. When they point at different devices the first one wins.
pub const STRONG_ID_TYPES: [&str; 4] =
  [ID_TYPE_ARMIS, ID_TYPE_INTEGRATION, ID_TYPE_NETBOX, ID_TYPE_MAC];

/// Vendor asset ids carried in observation metadata.
pub const VENDOR_ID_KEYS: [&str; 3] = [ID_TYPE_ARMIS, ID_TYPE_INTEGRATION, ID_TYPE_NETBOX];

/// Prefix of device ids derived from strong identifiers.
pub const DERIVED_ID_PREFIX: &str = "sr:";

const DEVICE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5c1e_7a4d_0b3f_4e62_9a1c_d8e2_f047_6b13);

/// Upper-case, trimmed MAC; `None` when blank.
pub fn normalize_mac(mac: &str) -> Option<String> {
  let mac = mac.trim();
  (!mac.is_empty()).then(|| mac.to_ascii_uppercase())
}

/// Strong `(id_type, id_value)` pairs present on an observation, in
/// [`STRONG_ID_TYPES`] order.
pub fn strong_identifiers(
  mac: Option<&str>,
  metadata: &Metadata,
) -> Vec<(&'static str, String)> {
  let mut found = Vec::new();
  for key in VENDOR_ID_KEYS {
    if let Some(value) = metadata::first_non_empty(metadata, &[key]) {
      found.push((key, value.to_owned()));
    }
  }
  let mac = mac
    .and_then(normalize_mac)
    .or_else(|| metadata.get(ID_TYPE_MAC).and_then(|m| normalize_mac(m)));
  if let Some(mac) = mac {
    found.push((ID_TYPE_MAC, mac));
  }
  found
}

/// The stable device id for a set of strong identifiers within `partition`:
/// `sr:` followed by a name-based UUID over the partition and the identifiers
/// in priority order. `None` without strong identifiers.
pub fn derived_device_id(partition: &str, strong: &[(&str, String)]) -> Option<String> {
  if strong.is_empty() {
    return None;
  }
  let mut seed = format!("partition:{partition}:");
  for id_type in STRONG_ID_TYPES {
    for (_, value) in strong.iter().filter(|(t, _)| *t == id_type) {
      seed.push_str(id_type);
      seed.push(':');
      seed.push_str(value);
      seed.push(';');
    }
  }
  let id = Uuid::new_v5(&DEVICE_ID_NAMESPACE, seed.as_bytes());
  Some(format!("{DERIVED_ID_PREFIX}{id}"))
}

// ─── Confidence ──────────────────────────────────────────────────────────────

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Default,
  Serialize,
  Deserialize,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Confidence {
  #[default]
  Weak,
  Medium,
  Strong,
}

// ─── Identifier ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
  pub device_id:  String,
  pub id_type:    String,
  pub id_value:   String,
  pub confidence: Confidence,
  pub source:     String,
  pub first_seen: DateTime<Utc>,
  pub last_seen:  DateTime<Utc>,
  pub verified:   bool,
  pub metadata:   Metadata,
}

impl Identifier {
  /// Merge an incoming write into the stored row for the same key.
  ///
  /// Ownership (`device_id`, `confidence`, `source`) follows the latest write.
  /// The observation window only widens, `verified` is sticky, and metadata is
  /// a shallow union with incoming keys winning.
  pub fn merge(existing: &Identifier, incoming: &Identifier) -> Identifier {
    Identifier {
      device_id:  incoming.device_id.clone(),
      id_type:    existing.id_type.clone(),
      id_value:   existing.id_value.clone(),
      confidence: incoming.confidence,
      source:     incoming.source.clone(),
      first_seen: existing.first_seen.min(incoming.first_seen),
      last_seen:  existing.last_seen.max(incoming.last_seen),
      verified:   existing.verified || incoming.verified,
      metadata:   metadata::union(&existing.metadata, &incoming.metadata),
    }
  }

  pub fn key(&self) -> (&str, &str) { (&self.id_type, &self.id_value) }

  pub fn is_strong(&self) -> bool { self.confidence == Confidence::Strong }
}

// ─── NewIdentifier ───────────────────────────────────────────────────────────

/// Input to [`crate::store::IdentityStore::upsert_identifiers`], before
/// validation.
#[derive(Debug, Clone, Default)]
pub struct NewIdentifier {
  pub device_id:  String,
  pub id_type:    String,
  pub id_value:   String,
  /// Defaults to [`Confidence::Weak`].
  pub confidence: Option<Confidence>,
  pub source:     String,
  pub first_seen: Option<DateTime<Utc>>,
  pub last_seen:  Option<DateTime<Utc>>,
  pub verified:   bool,
  pub metadata:   Metadata,
}

impl NewIdentifier {
  pub fn new(
    device_id: impl Into<String>,
    id_type: impl Into<String>,
    id_value: impl Into<String>,
  ) -> Self {
    Self {
      device_id: device_id.into(),
      id_type: id_type.into(),
      id_value: id_value.into(),
      ..Default::default()
    }
  }

  /// Log-friendly `type=value` label, safe on invalid rows.
  pub fn label(&self) -> String { format!("{}={}", self.id_type, self.id_value) }

  /// Trim and default fields; reject rows that cannot be keyed.
  pub fn validate(self, now: DateTime<Utc>) -> Result<Identifier, ValidationError> {
    let device_id = self.device_id.trim();
    if device_id.is_empty() {
      return Err(ValidationError::DeviceIdMissing);
    }
    let id_type = self.id_type.trim();
    if id_type.is_empty() {
      return Err(ValidationError::IdTypeMissing);
    }
    let id_value = self.id_value.trim();
    if id_value.is_empty() {
      return Err(ValidationError::IdValueMissing);
    }

    let first_seen = self.first_seen.unwrap_or(now);
    let last_seen = self.last_seen.unwrap_or(now).max(first_seen);

    Ok(Identifier {
      device_id: device_id.to_owned(),
      id_type: id_type.to_owned(),
      id_value: id_value.to_owned(),
      confidence: self.confidence.unwrap_or_default(),
      source: self.source.trim().to_owned(),
      first_seen,
      last_seen,
      verified: self.verified,
      metadata: self.metadata,
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::*;

  fn mac_write(source: &str, confidence: Confidence, verified: bool) -> NewIdentifier {
    NewIdentifier {
      confidence: Some(confidence),
      source: source.into(),
      verified,
      ..NewIdentifier::new("sr:dev-1", ID_TYPE_MAC, "AA:BB:CC:DD:EE:FF")
    }
  }

  #[test]
  fn weak_then_strong_takes_strong_and_ors_verified() {
    let now = Utc::now();
    let first = mac_write("sweep", Confidence::Weak, true).validate(now).unwrap();
    let second = mac_write("armis", Confidence::Strong, false)
      .validate(now + Duration::minutes(1))
      .unwrap();

    let merged = Identifier::merge(&first, &second);
    assert_eq!(merged.confidence, Confidence::Strong);
    assert_eq!(merged.source, "armis");
    assert!(merged.verified);
    assert_eq!(merged.first_seen, now);
    assert_eq!(merged.last_seen, now + Duration::minutes(1));
  }

  #[test]
  fn merge_moves_ownership_and_unions_metadata() {
    let now = Utc::now();
    let mut old = mac_write("sweep", Confidence::Weak, false).validate(now).unwrap();
    old.metadata.insert("vendor".into(), "acme".into());
    old.metadata.insert("site".into(), "a".into());

    let mut new = mac_write("snmp", Confidence::Weak, false);
    new.device_id = "sr:dev-2".into();
    new.metadata.insert("site".into(), "b".into());
    let new = new.validate(now - Duration::hours(1)).unwrap();

    let merged = Identifier::merge(&old, &new);
    assert_eq!(merged.device_id, "sr:dev-2");
    assert_eq!(merged.first_seen, now - Duration::hours(1));
    assert_eq!(merged.last_seen, now);
    assert_eq!(merged.metadata.get("vendor").map(String::as_str), Some("acme"));
    assert_eq!(merged.metadata.get("site").map(String::as_str), Some("b"));
  }

  #[test]
  fn validate_rejects_blank_key_parts() {
    let now = Utc::now();
    assert_eq!(
      NewIdentifier::new(" ", "mac", "x").validate(now).unwrap_err(),
      ValidationError::DeviceIdMissing
    );
    assert_eq!(
      NewIdentifier::new("d", "", "x").validate(now).unwrap_err(),
      ValidationError::IdTypeMissing
    );
    assert_eq!(
      NewIdentifier::new("d", "mac", "\t").validate(now).unwrap_err(),
      ValidationError::IdValueMissing
    );

    let ok = NewIdentifier::new(" d ", " mac ", " v ").validate(now).unwrap();
    assert_eq!(ok.confidence, Confidence::Weak);
    assert_eq!(ok.key(), ("mac", "v"));
  }

  #[test]
  fn strong_identifiers_follow_priority() {
    let mut md = Metadata::new();
    md.insert("mac".into(), "11:22:33:44:55:66".into());
    md.insert(ID_TYPE_NETBOX.into(), "nb-1".into());
    md.insert(ID_TYPE_ARMIS.into(), "armis-7".into());
    md.insert(ID_TYPE_INTEGRATION.into(), " ".into());

    let ids = strong_identifiers(Some("aa:bb:cc:dd:ee:ff"), &md);
    assert_eq!(
      ids,
      vec![
        (ID_TYPE_ARMIS, "armis-7".to_owned()),
        (ID_TYPE_NETBOX, "nb-1".to_owned()),
        (ID_TYPE_MAC, "AA:BB:CC:DD:EE:FF".to_owned()),
      ]
    );
  }

  #[test]
  fn derived_id_is_stable_per_partition_and_identity() {
    let mac = |v: &str| vec![(ID_TYPE_MAC, v.to_owned())];
    let a = derived_device_id("default", &mac("AA:AA:AA:AA:AA:AA")).unwrap();
    assert!(a.starts_with(DERIVED_ID_PREFIX));
    assert_eq!(derived_device_id("default", &mac("AA:AA:AA:AA:AA:AA")), Some(a.clone()));
    assert_ne!(derived_device_id("default", &mac("BB:BB:BB:BB:BB:BB")), Some(a.clone()));
    assert_ne!(derived_device_id("lab", &mac("AA:AA:AA:AA:AA:AA")), Some(a));
    assert_eq!(derived_device_id("default", &[]), None);
  }
}
