//! Batch outcomes and byte-budgeted batch packing.

use serde::Serialize;

use crate::{
  capability::NewCapabilityEvent,
  device::DeviceUpdate,
  error::ValidationError,
  identifier::NewIdentifier,
  metadata::Metadata,
  sighting::{NewSighting, NewSightingEvent},
};

/// Default byte budget for one batch (~10 MiB).
pub const DEFAULT_MAX_BATCH_BYTES: usize = 10 * (1 << 20);

/// Default row cap for one batch.
pub const DEFAULT_MAX_BATCH_ROWS: usize = 16_384;

/// Per-record overhead added by [`EstimateSize`] implementations.
const BASE_COST: usize = 64;

// ─── Reports ─────────────────────────────────────────────────────────────────

/// One record skipped by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejected {
  /// Position of the record in the submitted batch.
  pub index:  usize,
  /// Log-friendly key of the record, e.g. `mac=AA:BB:..`.
  pub key:    String,
  #[serde(serialize_with = "serialize_reason")]
  pub reason: ValidationError,
}

fn serialize_reason<S: serde::Serializer>(
  reason: &ValidationError,
  serializer: S,
) -> Result<S::Ok, S::Error> {
  serializer.collect_str(reason)
}

/// Outcome of a batch write that committed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
  pub accepted: usize,
  pub rejected: Vec<Rejected>,
}

impl BatchReport {
  pub fn reject(&mut self, index: usize, key: impl Into<String>, reason: ValidationError) {
    self.rejected.push(Rejected { index, key: key.into(), reason });
  }

  /// Fold a report for a sub-batch that started at `offset`.
  pub fn absorb(&mut self, other: BatchReport, offset: usize) {
    self.accepted += other.accepted;
    self.rejected.extend(other.rejected.into_iter().map(|mut r| {
      r.index += offset;
      r
    }));
  }

  pub fn is_clean(&self) -> bool { self.rejected.is_empty() }
}

// ─── Cost estimation ─────────────────────────────────────────────────────────

/// Approximate in-flight footprint of a record in bytes.
pub trait EstimateSize {
  fn estimated_size(&self) -> usize;
}

fn metadata_cost(metadata: &Metadata) -> usize {
  metadata.iter().map(|(k, v)| k.len() + v.len() + 4).sum()
}

fn opt_len(value: &Option<String>) -> usize { value.as_ref().map_or(0, String::len) }

impl EstimateSize for DeviceUpdate {
  fn estimated_size(&self) -> usize {
    BASE_COST
      + opt_len(&self.agent_id)
      + opt_len(&self.poller_id)
      + opt_len(&self.device_id)
      + self.partition.len()
      + self.ip.len()
      + self.source.len()
      + opt_len(&self.mac)
      + opt_len(&self.hostname)
      + opt_len(&self.service_id)
      + metadata_cost(&self.metadata)
  }
}

impl EstimateSize for NewIdentifier {
  fn estimated_size(&self) -> usize {
    BASE_COST
      + self.device_id.len()
      + self.id_type.len()
      + self.id_value.len()
      + self.source.len()
      + metadata_cost(&self.metadata)
  }
}

impl EstimateSize for NewSighting {
  fn estimated_size(&self) -> usize {
    BASE_COST
      + self.partition.len()
      + self.ip.len()
      + self.source.len()
      + opt_len(&self.subnet_id)
      + opt_len(&self.fingerprint_id)
      + metadata_cost(&self.metadata)
  }
}

impl EstimateSize for NewSightingEvent {
  fn estimated_size(&self) -> usize {
    BASE_COST
      + opt_len(&self.device_id)
      + self.event_type.len()
      + opt_len(&self.actor)
      + metadata_cost(&self.details)
  }
}

impl EstimateSize for NewCapabilityEvent {
  fn estimated_size(&self) -> usize {
    BASE_COST
      + self.device_id.len()
      + self.capability.len()
      + self.service_id.len()
      + self.state.len()
      + metadata_cost(&self.metadata)
  }
}

// ─── Packing ─────────────────────────────────────────────────────────────────

/// Greedily pack `items` into consecutive batches of at most `max_bytes`
/// estimated bytes and `max_rows` rows, preserving order.
///
/// An item larger than `max_bytes` on its own gets a batch to itself. Limits
/// of zero are treated as one.
pub fn pack_batches<T: EstimateSize>(
  items: Vec<T>,
  max_bytes: usize,
  max_rows: usize,
) -> Vec<Vec<T>> {
  let max_bytes = max_bytes.max(1);
  let max_rows = max_rows.max(1);

  let mut batches = Vec::new();
  let mut current = Vec::new();
  let mut current_bytes = 0usize;

  for item in items {
    let cost = item.estimated_size();
    if !current.is_empty() && current_bytes + cost > max_bytes {
      batches.push(std::mem::take(&mut current));
      current_bytes = 0;
    }
    current.push(item);
    current_bytes += cost;
    if current.len() >= max_rows {
      batches.push(std::mem::take(&mut current));
      current_bytes = 0;
    }
  }
  if !current.is_empty() {
    batches.push(current);
  }
  batches
}
