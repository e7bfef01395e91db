//! The `IdentityStore` trait.
//!
//! Implemented by storage backends (e.g. `sightline-store-sqlite`). The
//! reconciler and the promotion engine depend on this abstraction, not on a
//! concrete backend.
//!
//! Batch methods validate each record on its own: invalid records are skipped
//! and reported in the returned [`BatchReport`], the rest commit together in
//! one transaction. A backend failure fails the whole batch and nothing from
//! it is visible.

use std::future::Future;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
  alias::AliasKind,
  audit::{MergeAuditEvent, NewMergeAudit},
  batch::BatchReport,
  capability::{CapabilityEvent, CapabilitySnapshot, NewCapabilityEvent},
  device::{ApplyReport, CanonicalDevice, DeviceUpdate},
  error::Classify,
  identifier::{Identifier, NewIdentifier},
  policy::{NewSubnetPolicy, SubnetPolicy},
  sighting::{
    NewSighting, NewSightingEvent, Sighting, SightingEvent, SightingQuery,
    SightingStatus,
  },
};

pub const DEFAULT_SIGHTING_LIMIT: usize = 100;
pub const DEFAULT_EVENT_LIMIT: usize = 50;
pub const DEFAULT_AUDIT_LIMIT: usize = 100;

/// Abstraction over a device identity store backend.
///
/// All methods return `Send` futures so the trait can be shared across tokio
/// tasks.
pub trait IdentityStore: Send + Sync {
  type Error: std::error::Error + Classify + Send + Sync + 'static;

  // ── Sightings ─────────────────────────────────────────────────────────

  /// Insert or refresh the sighting keyed by `(ip, partition, source)`.
  fn record_sighting(
    &self,
    sighting: NewSighting,
  ) -> impl Future<Output = Result<Sighting, Self::Error>> + Send + '_;

  fn record_sightings(
    &self,
    sightings: Vec<NewSighting>,
  ) -> impl Future<Output = Result<BatchReport, Self::Error>> + Send + '_;

  fn get_sighting(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Sighting>, Self::Error>> + Send + '_;

  /// Newest `last_seen` first.
  fn list_sightings(
    &self,
    query: SightingQuery,
  ) -> impl Future<Output = Result<Vec<Sighting>, Self::Error>> + Send + '_;

  fn count_active_sightings(
    &self,
    partition: Option<String>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Move a sighting along `active → promoted | expired`.
  ///
  /// Unknown ids are `NotFound`; any move out of a terminal status is a
  /// `Conflict`.
  fn transition_sighting(
    &self,
    id: Uuid,
    status: SightingStatus,
  ) -> impl Future<Output = Result<Sighting, Self::Error>> + Send + '_;

  /// Active sightings with `first_seen <= cutoff`, oldest first.
  fn select_promotable(
    &self,
    cutoff: DateTime<Utc>,
  ) -> impl Future<Output = Result<Vec<Sighting>, Self::Error>> + Send + '_;

  /// Mark the given sightings promoted. Rows that are no longer active are
  /// left alone; returns the number changed.
  fn mark_promoted(
    &self,
    ids: Vec<Uuid>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Expire active sightings whose TTL has passed.
  fn expire_sightings(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  fn record_sighting_events(
    &self,
    events: Vec<NewSightingEvent>,
  ) -> impl Future<Output = Result<BatchReport, Self::Error>> + Send + '_;

  /// Newest first.
  fn list_sighting_events(
    &self,
    sighting_id: Uuid,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<SightingEvent>, Self::Error>> + Send + '_;

  // ── Subnet policies ───────────────────────────────────────────────────

  fn upsert_subnet_policy(
    &self,
    policy: NewSubnetPolicy,
  ) -> impl Future<Output = Result<SubnetPolicy, Self::Error>> + Send + '_;

  fn get_subnet_policy(
    &self,
    subnet_id: String,
  ) -> impl Future<Output = Result<Option<SubnetPolicy>, Self::Error>> + Send + '_;

  fn list_subnet_policies(
    &self,
  ) -> impl Future<Output = Result<Vec<SubnetPolicy>, Self::Error>> + Send + '_;

  // ── Identifiers ───────────────────────────────────────────────────────

  /// Upsert identifiers, merging into existing rows with the same
  /// `(id_type, id_value)`.
  fn upsert_identifiers(
    &self,
    identifiers: Vec<NewIdentifier>,
  ) -> impl Future<Output = Result<BatchReport, Self::Error>> + Send + '_;

  fn get_identifier(
    &self,
    id_type: String,
    id_value: String,
  ) -> impl Future<Output = Result<Option<Identifier>, Self::Error>> + Send + '_;

  fn list_identifiers(
    &self,
    device_id: String,
  ) -> impl Future<Output = Result<Vec<Identifier>, Self::Error>> + Send + '_;

  // ── Devices ───────────────────────────────────────────────────────────

  /// Fold updates into canonical devices. Updates must carry a device id.
  fn apply_device_updates(
    &self,
    updates: Vec<DeviceUpdate>,
  ) -> impl Future<Output = Result<ApplyReport, Self::Error>> + Send + '_;

  fn get_device(
    &self,
    device_id: String,
  ) -> impl Future<Output = Result<Option<CanonicalDevice>, Self::Error>> + Send + '_;

  /// Follow `merged_into` to the surviving device.
  fn resolve_device(
    &self,
    device_id: String,
  ) -> impl Future<Output = Result<Option<CanonicalDevice>, Self::Error>> + Send + '_;

  /// Live (unmerged) devices currently at `ip`, newest first.
  fn get_devices_by_ip(
    &self,
    ip: String,
  ) -> impl Future<Output = Result<Vec<CanonicalDevice>, Self::Error>> + Send + '_;

  fn list_devices(
    &self,
    limit: usize,
    offset: usize,
  ) -> impl Future<Output = Result<Vec<CanonicalDevice>, Self::Error>> + Send + '_;

  /// The device that last used `value` as a service id or IP alias.
  fn find_device_by_alias(
    &self,
    kind: AliasKind,
    value: String,
  ) -> impl Future<Output = Result<Option<String>, Self::Error>> + Send + '_;

  /// Set `_deleted=true` on each device and audit it. Returns the number of
  /// devices found.
  fn soft_delete_devices(
    &self,
    device_ids: Vec<String>,
    source: String,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Ids of live devices without a strong identifier last seen before
  /// `now - ttl`.
  fn find_stale_ip_only(
    &self,
    ttl: Duration,
  ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + '_;

  /// Hard-delete devices last seen before `now - retention`, along with
  /// their identifiers and alias index rows.
  fn purge_stale_devices(
    &self,
    retention: Duration,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  // ── Merges ────────────────────────────────────────────────────────────

  /// Merge `from_device_id` into the root of `to_device_id` and append the
  /// audit row, atomically.
  fn merge_devices(
    &self,
    merge: NewMergeAudit,
  ) -> impl Future<Output = Result<MergeAuditEvent, Self::Error>> + Send + '_;

  /// Append an audit row without touching devices.
  fn record_merge_audit(
    &self,
    event: NewMergeAudit,
  ) -> impl Future<Output = Result<MergeAuditEvent, Self::Error>> + Send + '_;

  fn list_merge_audit(
    &self,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<MergeAuditEvent>, Self::Error>> + Send + '_;

  /// Events naming `device_id` on either side, newest first.
  fn list_merge_audit_for_device(
    &self,
    device_id: String,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<MergeAuditEvent>, Self::Error>> + Send + '_;

  // ── Capabilities ──────────────────────────────────────────────────────

  /// Append the event and fold it into the capability snapshot.
  fn record_capability_event(
    &self,
    event: NewCapabilityEvent,
  ) -> impl Future<Output = Result<CapabilitySnapshot, Self::Error>> + Send + '_;

  fn list_capability_events(
    &self,
    device_id: String,
    limit: Option<usize>,
  ) -> impl Future<Output = Result<Vec<CapabilityEvent>, Self::Error>> + Send + '_;

  fn list_capabilities(
    &self,
    device_id: String,
  ) -> impl Future<Output = Result<Vec<CapabilitySnapshot>, Self::Error>> + Send + '_;
}
