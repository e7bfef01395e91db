//! Encoding and decoding helpers between domain types and SQLite columns.
//!
//! Timestamps are stored as fixed-width RFC 3339 strings in UTC with
//! nanosecond precision, so that string order is time order and SQL range
//! predicates work on them. Metadata maps and source sets are compact JSON.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;
use sightline_core::{
  audit::MergeAuditEvent,
  capability::{CapabilityEvent, CapabilitySnapshot},
  device::CanonicalDevice,
  identifier::{Confidence, Identifier},
  metadata::Metadata,
  policy::{Cidr, PromotionRules, SubnetPolicy},
  sighting::{Sighting, SightingEvent, SightingStatus},
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

fn decode_opt_dt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
  s.as_deref().map(decode_dt).transpose()
}

pub fn encode_metadata(md: &Metadata) -> Result<String> { Ok(serde_json::to_string(md)?) }

pub fn decode_metadata(s: &str) -> Result<Metadata> {
  if s.trim().is_empty() {
    return Ok(Metadata::new());
  }
  Ok(serde_json::from_str(s)?)
}

pub fn encode_sources(sources: &BTreeSet<String>) -> Result<String> {
  Ok(serde_json::to_string(sources)?)
}

fn unknown(what: &'static str, value: &str) -> Error {
  sightline_core::Error::UnknownDiscriminant { what, value: value.to_owned() }.into()
}

pub fn decode_status(s: &str) -> Result<SightingStatus> {
  s.parse().map_err(|_| unknown("sighting status", s))
}

pub fn decode_confidence(s: &str) -> Result<Confidence> {
  s.parse().map_err(|_| unknown("confidence", s))
}

// ─── Sightings ───────────────────────────────────────────────────────────────

pub const SIGHTING_COLUMNS: &str = "sighting_id, partition, ip, subnet_id, source, \
   status, first_seen, last_seen, ttl_expires_at, fingerprint_id, metadata";

pub struct RawSighting {
  pub sighting_id:    String,
  pub partition:      String,
  pub ip:             String,
  pub subnet_id:      Option<String>,
  pub source:         String,
  pub status:         String,
  pub first_seen:     String,
  pub last_seen:      String,
  pub ttl_expires_at: Option<String>,
  pub fingerprint_id: Option<String>,
  pub metadata:       String,
}

impl RawSighting {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      sighting_id:    row.get(0)?,
      partition:      row.get(1)?,
      ip:             row.get(2)?,
      subnet_id:      row.get(3)?,
      source:         row.get(4)?,
      status:         row.get(5)?,
      first_seen:     row.get(6)?,
      last_seen:      row.get(7)?,
      ttl_expires_at: row.get(8)?,
      fingerprint_id: row.get(9)?,
      metadata:       row.get(10)?,
    })
  }

  pub fn into_sighting(self) -> Result<Sighting> {
    Ok(Sighting {
      sighting_id:    decode_uuid(&self.sighting_id)?,
      partition:      self.partition,
      ip:             self.ip,
      subnet_id:      self.subnet_id,
      source:         self.source,
      status:         decode_status(&self.status)?,
      first_seen:     decode_dt(&self.first_seen)?,
      last_seen:      decode_dt(&self.last_seen)?,
      ttl_expires_at: decode_opt_dt(self.ttl_expires_at)?,
      fingerprint_id: self.fingerprint_id,
      metadata:       decode_metadata(&self.metadata)?,
    })
  }
}

pub const SIGHTING_EVENT_COLUMNS: &str =
  "event_id, sighting_id, device_id, event_type, actor, details, created_at";

pub struct RawSightingEvent {
  pub event_id:    String,
  pub sighting_id: String,
  pub device_id:   Option<String>,
  pub event_type:  String,
  pub actor:       String,
  pub details:     String,
  pub created_at:  String,
}

impl RawSightingEvent {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:    row.get(0)?,
      sighting_id: row.get(1)?,
      device_id:   row.get(2)?,
      event_type:  row.get(3)?,
      actor:       row.get(4)?,
      details:     row.get(5)?,
      created_at:  row.get(6)?,
    })
  }

  pub fn into_event(self) -> Result<SightingEvent> {
    Ok(SightingEvent {
      event_id:    decode_uuid(&self.event_id)?,
      sighting_id: decode_uuid(&self.sighting_id)?,
      device_id:   self.device_id,
      event_type:  self.event_type,
      actor:       self.actor,
      details:     decode_metadata(&self.details)?,
      created_at:  decode_dt(&self.created_at)?,
    })
  }
}

// ─── Subnet policies ─────────────────────────────────────────────────────────

pub const POLICY_COLUMNS: &str = "subnet_id, cidr, classification, promotion_rules, \
   reaper_profile, allow_ip_as_id, created_at, updated_at";

pub struct RawPolicy {
  pub subnet_id:       String,
  pub cidr:            String,
  pub classification:  String,
  pub promotion_rules: String,
  pub reaper_profile:  String,
  pub allow_ip_as_id:  bool,
  pub created_at:      String,
  pub updated_at:      String,
}

impl RawPolicy {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      subnet_id:       row.get(0)?,
      cidr:            row.get(1)?,
      classification:  row.get(2)?,
      promotion_rules: row.get(3)?,
      reaper_profile:  row.get(4)?,
      allow_ip_as_id:  row.get(5)?,
      created_at:      row.get(6)?,
      updated_at:      row.get(7)?,
    })
  }

  pub fn into_policy(self) -> Result<SubnetPolicy> {
    let cidr: Cidr = self.cidr.parse().map_err(|_| unknown("cidr", &self.cidr))?;
    let promotion_rules: PromotionRules = if self.promotion_rules.trim().is_empty() {
      PromotionRules::default()
    } else {
      serde_json::from_str(&self.promotion_rules)?
    };
    Ok(SubnetPolicy {
      subnet_id: self.subnet_id,
      cidr,
      classification: self.classification,
      promotion_rules,
      reaper_profile: self.reaper_profile,
      allow_ip_as_id: self.allow_ip_as_id,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

// ─── Identifiers ─────────────────────────────────────────────────────────────

pub const IDENTIFIER_COLUMNS: &str = "device_id, id_type, id_value, confidence, source, \
   first_seen, last_seen, verified, metadata";

pub struct RawIdentifier {
  pub device_id:  String,
  pub id_type:    String,
  pub id_value:   String,
  pub confidence: String,
  pub source:     String,
  pub first_seen: String,
  pub last_seen:  String,
  pub verified:   bool,
  pub metadata:   String,
}

impl RawIdentifier {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      device_id:  row.get(0)?,
      id_type:    row.get(1)?,
      id_value:   row.get(2)?,
      confidence: row.get(3)?,
      source:     row.get(4)?,
      first_seen: row.get(5)?,
      last_seen:  row.get(6)?,
      verified:   row.get(7)?,
      metadata:   row.get(8)?,
    })
  }

  pub fn into_identifier(self) -> Result<Identifier> {
    Ok(Identifier {
      device_id:  self.device_id,
      id_type:    self.id_type,
      id_value:   self.id_value,
      confidence: decode_confidence(&self.confidence)?,
      source:     self.source,
      first_seen: decode_dt(&self.first_seen)?,
      last_seen:  decode_dt(&self.last_seen)?,
      verified:   self.verified,
      metadata:   decode_metadata(&self.metadata)?,
    })
  }
}

// ─── Devices ─────────────────────────────────────────────────────────────────

pub const DEVICE_COLUMNS: &str = "device_id, ip, poller_id, agent_id, hostname, mac, \
   discovery_sources, is_available, first_seen, last_seen, metadata, merged_into, \
   device_type, service_type, service_status, last_heartbeat, os_info, version_info";

pub struct RawDevice {
  pub device_id:         String,
  pub ip:                String,
  pub poller_id:         Option<String>,
  pub agent_id:          Option<String>,
  pub hostname:          Option<String>,
  pub mac:               Option<String>,
  pub discovery_sources: String,
  pub is_available:      bool,
  pub first_seen:        String,
  pub last_seen:         String,
  pub metadata:          String,
  pub merged_into:       Option<String>,
  pub device_type:       String,
  pub service_type:      Option<String>,
  pub service_status:    Option<String>,
  pub last_heartbeat:    Option<String>,
  pub os_info:           Option<String>,
  pub version_info:      Option<String>,
}

impl RawDevice {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      device_id:         row.get(0)?,
      ip:                row.get(1)?,
      poller_id:         row.get(2)?,
      agent_id:          row.get(3)?,
      hostname:          row.get(4)?,
      mac:               row.get(5)?,
      discovery_sources: row.get(6)?,
      is_available:      row.get(7)?,
      first_seen:        row.get(8)?,
      last_seen:         row.get(9)?,
      metadata:          row.get(10)?,
      merged_into:       row.get(11)?,
      device_type:       row.get(12)?,
      service_type:      row.get(13)?,
      service_status:    row.get(14)?,
      last_heartbeat:    row.get(15)?,
      os_info:           row.get(16)?,
      version_info:      row.get(17)?,
    })
  }

  pub fn into_device(self) -> Result<CanonicalDevice> {
    let discovery_sources: BTreeSet<String> = if self.discovery_sources.is_empty() {
      BTreeSet::new()
    } else {
      serde_json::from_str(&self.discovery_sources)?
    };
    Ok(CanonicalDevice {
      device_id: self.device_id,
      ip: self.ip,
      poller_id: self.poller_id,
      agent_id: self.agent_id,
      hostname: self.hostname,
      mac: self.mac,
      discovery_sources,
      is_available: self.is_available,
      first_seen: decode_dt(&self.first_seen)?,
      last_seen: decode_dt(&self.last_seen)?,
      metadata: decode_metadata(&self.metadata)?,
      merged_into: self.merged_into,
      device_type: self.device_type,
      service_type: self.service_type,
      service_status: self.service_status,
      last_heartbeat: decode_opt_dt(self.last_heartbeat)?,
      os_info: self.os_info,
      version_info: self.version_info,
    })
  }
}

// ─── Merge audit ─────────────────────────────────────────────────────────────

pub const AUDIT_COLUMNS: &str = "event_id, from_device_id, to_device_id, reason, \
   confidence_score, source, details, created_at";

pub struct RawMergeAudit {
  pub event_id:         String,
  pub from_device_id:   String,
  pub to_device_id:     String,
  pub reason:           String,
  pub confidence_score: Option<f64>,
  pub source:           String,
  pub details:          String,
  pub created_at:       String,
}

impl RawMergeAudit {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:         row.get(0)?,
      from_device_id:   row.get(1)?,
      to_device_id:     row.get(2)?,
      reason:           row.get(3)?,
      confidence_score: row.get(4)?,
      source:           row.get(5)?,
      details:          row.get(6)?,
      created_at:       row.get(7)?,
    })
  }

  pub fn into_event(self) -> Result<MergeAuditEvent> {
    Ok(MergeAuditEvent {
      event_id:         decode_uuid(&self.event_id)?,
      from_device_id:   self.from_device_id,
      to_device_id:     self.to_device_id,
      reason:           self.reason,
      confidence_score: self.confidence_score,
      source:           self.source,
      details:          decode_metadata(&self.details)?,
      created_at:       decode_dt(&self.created_at)?,
    })
  }
}

// ─── Capabilities ────────────────────────────────────────────────────────────

pub const CAPABILITY_EVENT_COLUMNS: &str = "event_id, device_id, capability, service_id, \
   service_type, state, success, failure_reason, recorded_by, checked_at, metadata";

pub struct RawCapabilityEvent {
  pub event_id:       String,
  pub device_id:      String,
  pub capability:     String,
  pub service_id:     String,
  pub service_type:   String,
  pub state:          String,
  pub success:        bool,
  pub failure_reason: Option<String>,
  pub recorded_by:    String,
  pub checked_at:     String,
  pub metadata:       String,
}

impl RawCapabilityEvent {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:       row.get(0)?,
      device_id:      row.get(1)?,
      capability:     row.get(2)?,
      service_id:     row.get(3)?,
      service_type:   row.get(4)?,
      state:          row.get(5)?,
      success:        row.get(6)?,
      failure_reason: row.get(7)?,
      recorded_by:    row.get(8)?,
      checked_at:     row.get(9)?,
      metadata:       row.get(10)?,
    })
  }

  pub fn into_event(self) -> Result<CapabilityEvent> {
    Ok(CapabilityEvent {
      event_id:       decode_uuid(&self.event_id)?,
      device_id:      self.device_id,
      capability:     self.capability,
      service_id:     self.service_id,
      service_type:   self.service_type,
      state:          self.state,
      success:        self.success,
      failure_reason: self.failure_reason,
      recorded_by:    self.recorded_by,
      checked_at:     decode_dt(&self.checked_at)?,
      metadata:       decode_metadata(&self.metadata)?,
    })
  }
}

pub const CAPABILITY_COLUMNS: &str = "device_id, capability, service_id, service_type, \
   state, enabled, failure_reason, recorded_by, last_checked, last_success, \
   last_failure, metadata";

pub struct RawCapability {
  pub device_id:      String,
  pub capability:     String,
  pub service_id:     String,
  pub service_type:   String,
  pub state:          String,
  pub enabled:        bool,
  pub failure_reason: Option<String>,
  pub recorded_by:    String,
  pub last_checked:   String,
  pub last_success:   Option<String>,
  pub last_failure:   Option<String>,
  pub metadata:       String,
}

impl RawCapability {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      device_id:      row.get(0)?,
      capability:     row.get(1)?,
      service_id:     row.get(2)?,
      service_type:   row.get(3)?,
      state:          row.get(4)?,
      enabled:        row.get(5)?,
      failure_reason: row.get(6)?,
      recorded_by:    row.get(7)?,
      last_checked:   row.get(8)?,
      last_success:   row.get(9)?,
      last_failure:   row.get(10)?,
      metadata:       row.get(11)?,
    })
  }

  pub fn into_snapshot(self) -> Result<CapabilitySnapshot> {
    Ok(CapabilitySnapshot {
      device_id:      self.device_id,
      capability:     self.capability,
      service_id:     self.service_id,
      service_type:   self.service_type,
      state:          self.state,
      enabled:        self.enabled,
      failure_reason: self.failure_reason,
      recorded_by:    self.recorded_by,
      last_checked:   decode_dt(&self.last_checked)?,
      last_success:   decode_opt_dt(self.last_success)?,
      last_failure:   decode_opt_dt(self.last_failure)?,
      metadata:       decode_metadata(&self.metadata)?,
    })
  }
}
