//! Merge audit records. Append-only; never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ValidationError, metadata::Metadata};

pub const REASON_STRONG_ID_CONFLICT: &str = "strong_identifier_conflict";
pub const REASON_SOFT_DELETE: &str = "soft_delete";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAuditEvent {
  pub event_id:         Uuid,
  pub from_device_id:   String,
  pub to_device_id:     String,
  pub reason:           String,
  pub confidence_score: Option<f64>,
  pub source:           String,
  pub details:          Metadata,
  pub created_at:       DateTime<Utc>,
}

impl MergeAuditEvent {
  /// Whether the event names `device_id` on either side.
  pub fn involves(&self, device_id: &str) -> bool {
    self.from_device_id == device_id || self.to_device_id == device_id
  }
}

/// Input to [`crate::store::IdentityStore::merge_devices`] and
/// [`crate::store::IdentityStore::record_merge_audit`].
#[derive(Debug, Clone, Default)]
pub struct NewMergeAudit {
  pub from_device_id:   String,
  pub to_device_id:     String,
  pub reason:           String,
  pub confidence_score: Option<f64>,
  pub source:           String,
  pub details:          Metadata,
  pub created_at:       Option<DateTime<Utc>>,
}

impl NewMergeAudit {
  pub fn new(
    from_device_id: impl Into<String>,
    to_device_id: impl Into<String>,
    reason: impl Into<String>,
  ) -> Self {
    Self {
      from_device_id: from_device_id.into(),
      to_device_id: to_device_id.into(),
      reason: reason.into(),
      ..Default::default()
    }
  }

  pub fn validate(
    self,
    event_id: Uuid,
    now: DateTime<Utc>,
  ) -> Result<MergeAuditEvent, ValidationError> {
    let from_device_id = self.from_device_id.trim().to_owned();
    let to_device_id = self.to_device_id.trim().to_owned();
    if from_device_id.is_empty() || to_device_id.is_empty() {
      return Err(ValidationError::DeviceIdMissing);
    }
    let reason = self.reason.trim().to_owned();
    if reason.is_empty() {
      return Err(ValidationError::ReasonMissing);
    }
    Ok(MergeAuditEvent {
      event_id,
      from_device_id,
      to_device_id,
      reason,
      confidence_score: self.confidence_score.map(|c| c.clamp(0.0, 1.0)),
      source: self.source.trim().to_owned(),
      details: self.details,
      created_at: self.created_at.unwrap_or(now),
    })
  }
}
