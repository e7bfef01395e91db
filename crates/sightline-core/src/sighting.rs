//! Sightings: provisional, source-attributed observations of an IP.
//!
//! A sighting is keyed by `(ip, partition, source)`. Repeated observations
//! refresh the same row. Status only ever moves forward:
//! `active → promoted` or `active → expired`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Error, Result,
  error::ValidationError,
  metadata::{self, Metadata},
};

pub const DEFAULT_PARTITION: &str = "default";

// ─── Status ──────────────────────────────────────────────────────────────────

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
pub enum SightingStatus {
  Active,
  Promoted,
  Expired,
}

impl SightingStatus {
  /// Monotonic ordering column; a stored status is never replaced by one with
  /// a lower rank.
  pub fn rank(self) -> i64 {
    match self {
      Self::Active => 0,
      Self::Expired => 1,
      Self::Promoted => 2,
    }
  }

  /// Validate a transition for `sighting_id`.
  ///
  /// Returns `Ok(false)` for a same-status no-op and `Ok(true)` when the
  /// status actually changes.
  pub fn check_transition(
    self,
    sighting_id: Uuid,
    next: SightingStatus,
  ) -> Result<bool> {
    match (self, next) {
      (from, to) if from == to => Ok(false),
      (Self::Active, Self::Promoted | Self::Expired) => Ok(true),
      (from, to) => Err(Error::InvalidTransition { sighting_id, from, to }),
    }
  }
}

// ─── Sighting ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
  pub sighting_id:    Uuid,
  pub partition:      String,
  pub ip:             String,
  pub subnet_id:      Option<String>,
  pub source:         String,
  pub status:         SightingStatus,
  pub first_seen:     DateTime<Utc>,
  pub last_seen:      DateTime<Utc>,
  pub ttl_expires_at: Option<DateTime<Utc>>,
  pub fingerprint_id: Option<String>,
  pub metadata:       Metadata,
}

impl Sighting {
  /// Fold a fresh observation into an existing sighting with the same key.
  ///
  /// The status is left untouched: observations never resurrect an expired
  /// or promoted sighting. A promoted sighting is frozen entirely; an expired
  /// one still records the observation window and metadata.
  pub fn refresh(&self, observation: &NewSighting) -> Sighting {
    let mut next = self.clone();
    if self.status == SightingStatus::Promoted {
      return next;
    }
    next.first_seen = next.first_seen.min(observation.observed_at);
    next.last_seen = next.last_seen.max(observation.observed_at);
    if let Some(subnet) = non_empty(observation.subnet_id.as_deref()) {
      next.subnet_id = Some(subnet);
    }
    if let Some(fp) = non_empty(observation.fingerprint_id.as_deref()) {
      next.fingerprint_id = Some(fp);
    }
    if observation.ttl_expires_at.is_some() {
      next.ttl_expires_at = observation.ttl_expires_at;
    }
    next.metadata = metadata::union(&self.metadata, &observation.metadata);
    next
  }

  pub fn is_active(&self) -> bool { self.status == SightingStatus::Active }

  /// Value of `key` in metadata, trimmed, if non-empty.
  pub fn meta(&self, key: &str) -> Option<&str> {
    metadata::first_non_empty(&self.metadata, &[key])
  }
}

// ─── NewSighting ─────────────────────────────────────────────────────────────

/// Input to [`crate::store::IdentityStore::record_sighting`].
#[derive(Debug, Clone)]
pub struct NewSighting {
  pub partition:      String,
  pub ip:             String,
  pub subnet_id:      Option<String>,
  pub source:         String,
  pub observed_at:    DateTime<Utc>,
  pub ttl_expires_at: Option<DateTime<Utc>>,
  pub fingerprint_id: Option<String>,
  pub metadata:       Metadata,
}

impl NewSighting {
  pub fn new(
    ip: impl Into<String>,
    source: impl Into<String>,
    observed_at: DateTime<Utc>,
  ) -> Self {
    Self {
      partition: DEFAULT_PARTITION.to_owned(),
      ip: ip.into(),
      subnet_id: None,
      source: source.into(),
      observed_at,
      ttl_expires_at: None,
      fingerprint_id: None,
      metadata: Metadata::new(),
    }
  }

  /// Trim fields, default the partition, and reject unusable rows.
  pub fn normalized(mut self) -> Result<Self, ValidationError> {
    self.ip = self.ip.trim().to_owned();
    if self.ip.is_empty() {
      return Err(ValidationError::IpMissing);
    }
    self.source = self.source.trim().to_owned();
    if self.source.is_empty() {
      return Err(ValidationError::SourceMissing);
    }
    self.partition = self.partition.trim().to_owned();
    if self.partition.is_empty() {
      self.partition = DEFAULT_PARTITION.to_owned();
    }
    self.subnet_id = non_empty(self.subnet_id.as_deref());
    self.fingerprint_id = non_empty(self.fingerprint_id.as_deref());
    Ok(self)
  }

  /// Build the first row for a key that has never been seen.
  pub fn into_sighting(self, sighting_id: Uuid) -> Sighting {
    Sighting {
      sighting_id,
      partition: self.partition,
      ip: self.ip,
      subnet_id: self.subnet_id,
      source: self.source,
      status: SightingStatus::Active,
      first_seen: self.observed_at,
      last_seen: self.observed_at,
      ttl_expires_at: self.ttl_expires_at,
      fingerprint_id: self.fingerprint_id,
      metadata: self.metadata,
    }
  }
}

fn non_empty(value: Option<&str>) -> Option<String> {
  value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_owned)
}

// ─── Query ───────────────────────────────────────────────────────────────────

/// Parameters for [`crate::store::IdentityStore::list_sightings`].
#[derive(Debug, Clone, Default)]
pub struct SightingQuery {
  pub partition: Option<String>,
  pub status:    Option<SightingStatus>,
  /// Defaults to 100.
  pub limit:     Option<usize>,
  pub offset:    Option<usize>,
}

// ─── Events ──────────────────────────────────────────────────────────────────

pub const SYSTEM_ACTOR: &str = "system";

/// An append-only audit entry about a sighting's lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SightingEvent {
  pub event_id:    Uuid,
  pub sighting_id: Uuid,
  pub device_id:   Option<String>,
  pub event_type:  String,
  pub actor:       String,
  pub details:     Metadata,
  pub created_at:  DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSightingEvent {
  pub sighting_id: Uuid,
  pub device_id:   Option<String>,
  pub event_type:  String,
  pub actor:       Option<String>,
  pub details:     Metadata,
  pub created_at:  Option<DateTime<Utc>>,
}

impl NewSightingEvent {
  pub fn validate(
    self,
    event_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<SightingEvent, ValidationError> {
    if self.sighting_id.is_nil() {
      return Err(ValidationError::SightingIdMissing);
    }
    let event_type = self.event_type.trim().to_owned();
    if event_type.is_empty() {
      return Err(ValidationError::EventTypeMissing);
    }
    let actor = non_empty(self.actor.as_deref())
      .unwrap_or_else(|| SYSTEM_ACTOR.to_owned());
    Ok(SightingEvent {
      event_id,
      sighting_id: self.sighting_id,
      device_id: non_empty(self.device_id.as_deref()),
      event_type,
      actor,
      details: self.details,
      created_at: self.created_at.unwrap_or(now),
    })
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;

  use super::*;

  #[test]
  fn transitions_only_move_forward() {
    let id = Uuid::new_v4();
    assert!(
      SightingStatus::Active
        .check_transition(id, SightingStatus::Promoted)
        .unwrap()
    );
    assert!(
      SightingStatus::Active
        .check_transition(id, SightingStatus::Expired)
        .unwrap()
    );
    assert!(
      !SightingStatus::Promoted
        .check_transition(id, SightingStatus::Promoted)
        .unwrap()
    );

    let err = SightingStatus::Promoted
      .check_transition(id, SightingStatus::Active)
      .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
    assert!(
      SightingStatus::Expired
        .check_transition(id, SightingStatus::Promoted)
        .is_err()
    );
  }

  #[test]
  fn status_strings_roundtrip() {
    for status in [
      SightingStatus::Active,
      SightingStatus::Promoted,
      SightingStatus::Expired,
    ] {
      let parsed: SightingStatus = status.as_ref().parse().unwrap();
      assert_eq!(parsed, status);
    }
    assert_eq!(SightingStatus::Promoted.to_string(), "promoted");
  }

  #[test]
  fn refresh_widens_window_and_keeps_status() {
    let t0 = Utc::now();
    let mut sighting = NewSighting::new("10.0.0.5", "sweep", t0)
      .into_sighting(Uuid::new_v4());
    sighting.status = SightingStatus::Expired;

    let mut earlier = NewSighting::new("10.0.0.5", "sweep", t0 - Duration::minutes(5));
    earlier.metadata.insert("hostname".into(), "edge".into());
    let refreshed = sighting.refresh(&earlier);
    assert_eq!(refreshed.first_seen, t0 - Duration::minutes(5));
    assert_eq!(refreshed.last_seen, t0);
    assert_eq!(refreshed.status, SightingStatus::Expired);
    assert_eq!(refreshed.meta("hostname"), Some("edge"));
  }

  #[test]
  fn refresh_leaves_promoted_sighting_alone() {
    let t0 = Utc::now();
    let mut sighting = NewSighting::new("10.0.0.5", "sweep", t0)
      .into_sighting(Uuid::new_v4());
    sighting.status = SightingStatus::Promoted;

    let mut later = NewSighting::new("10.0.0.5", "sweep", t0 + Duration::hours(2));
    later.metadata.insert("hostname".into(), "changed".into());
    later.fingerprint_id = Some("fp-9".into());
    assert_eq!(sighting.refresh(&later), sighting);
  }

  #[test]
  fn normalized_rejects_blank_ip_and_defaults_partition() {
    let mut input = NewSighting::new("  ", "sweep", Utc::now());
    assert_eq!(input.clone().normalized().unwrap_err(), ValidationError::IpMissing);

    input.ip = " 10.1.1.1 ".into();
    input.partition = "".into();
    let ok = input.normalized().unwrap();
    assert_eq!(ok.ip, "10.1.1.1");
    assert_eq!(ok.partition, DEFAULT_PARTITION);
  }
}
