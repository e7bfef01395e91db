//! Capability checks: an append-only event log plus a per-key snapshot that
//! is folded from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ValidationError, metadata::Metadata};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEvent {
  pub event_id:       Uuid,
  pub device_id:      String,
  /// Lower-cased, e.g. `"icmp"` or `"snmp"`.
  pub capability:     String,
  /// Empty when the check is not tied to a service.
  pub service_id:     String,
  pub service_type:   String,
  pub state:          String,
  pub success:        bool,
  pub failure_reason: Option<String>,
  pub recorded_by:    String,
  pub checked_at:     DateTime<Utc>,
  pub metadata:       Metadata,
}

#[derive(Debug, Clone, Default)]
pub struct NewCapabilityEvent {
  pub device_id:      String,
  pub capability:     String,
  pub service_id:     String,
  pub service_type:   String,
  pub state:          String,
  pub success:        bool,
  pub failure_reason: Option<String>,
  pub recorded_by:    String,
  pub checked_at:     Option<DateTime<Utc>>,
  pub metadata:       Metadata,
}

impl NewCapabilityEvent {
  pub fn new(
    device_id: impl Into<String>,
    capability: impl Into<String>,
    success: bool,
  ) -> Self {
    Self {
      device_id: device_id.into(),
      capability: capability.into(),
      success,
      ..Default::default()
    }
  }

  pub fn validate(
    self,
    event_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<CapabilityEvent, ValidationError> {
    let device_id = self.device_id.trim().to_owned();
    if device_id.is_empty() {
      return Err(ValidationError::DeviceIdMissing);
    }
    let capability = self.capability.trim().to_ascii_lowercase();
    if capability.is_empty() {
      return Err(ValidationError::CapabilityMissing);
    }
    let state = match self.state.trim() {
      "" if self.success => "ok".to_owned(),
      "" => "failed".to_owned(),
      s => s.to_owned(),
    };
    Ok(CapabilityEvent {
      event_id,
      device_id,
      capability,
      service_id: self.service_id.trim().to_owned(),
      service_type: self.service_type.trim().to_owned(),
      state,
      success: self.success,
      failure_reason: self
        .failure_reason
        .map(|r| r.trim().to_owned())
        .filter(|r| !r.is_empty()),
      recorded_by: self.recorded_by.trim().to_owned(),
      checked_at: self.checked_at.unwrap_or(now),
      metadata: self.metadata,
    })
  }
}

/// Latest known state for `(device_id, capability, service_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
  pub device_id:      String,
  pub capability:     String,
  pub service_id:     String,
  pub service_type:   String,
  pub state:          String,
  pub enabled:        bool,
  pub failure_reason: Option<String>,
  pub recorded_by:    String,
  pub last_checked:   DateTime<Utc>,
  pub last_success:   Option<DateTime<Utc>>,
  pub last_failure:   Option<DateTime<Utc>>,
  pub metadata:       Metadata,
}

fn latest(slot: Option<DateTime<Utc>>, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
  Some(slot.map_or(at, |t| t.max(at)))
}

impl CapabilitySnapshot {
  /// Fold `event` into the snapshot for its key.
  ///
  /// An event older than `last_checked` only contributes to
  /// `last_success`/`last_failure`.
  pub fn fold(existing: Option<&CapabilitySnapshot>, event: &CapabilityEvent) -> Self {
    let mut next = match existing {
      Some(snapshot) if event.checked_at < snapshot.last_checked => snapshot.clone(),
      _ => CapabilitySnapshot {
        device_id:      event.device_id.clone(),
        capability:     event.capability.clone(),
        service_id:     event.service_id.clone(),
        service_type:   event.service_type.clone(),
        state:          event.state.clone(),
        enabled:        event.success,
        failure_reason: event.failure_reason.clone(),
        recorded_by:    event.recorded_by.clone(),
        last_checked:   event.checked_at,
        last_success:   existing.and_then(|s| s.last_success),
        last_failure:   existing.and_then(|s| s.last_failure),
        metadata:       event.metadata.clone(),
      },
    };
    if event.success {
      next.last_success = latest(next.last_success, event.checked_at);
    } else {
      next.last_failure = latest(next.last_failure, event.checked_at);
    }
    next
  }
}
