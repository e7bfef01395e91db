//! [`SqliteStore`], the SQLite implementation of [`IdentityStore`].

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use sightline_core::{
  alias::AliasKind,
  audit::{MergeAuditEvent, NewMergeAudit},
  batch::BatchReport,
  capability::{CapabilityEvent, CapabilitySnapshot, NewCapabilityEvent},
  device::{ApplyReport, CanonicalDevice, DeviceUpdate},
  identifier::{Identifier, NewIdentifier},
  policy::{NewSubnetPolicy, SubnetPolicy},
  sighting::{
    NewSighting, NewSightingEvent, Sighting, SightingEvent, SightingQuery,
    SightingStatus,
  },
  store::{
    DEFAULT_AUDIT_LIMIT, DEFAULT_EVENT_LIMIT, DEFAULT_SIGHTING_LIMIT, IdentityStore,
  },
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    CAPABILITY_COLUMNS, CAPABILITY_EVENT_COLUMNS, IDENTIFIER_COLUMNS, POLICY_COLUMNS,
    RawCapability, RawCapabilityEvent, RawIdentifier, RawPolicy, RawSighting,
    RawSightingEvent, SIGHTING_COLUMNS, SIGHTING_EVENT_COLUMNS, encode_dt, encode_uuid,
  },
  ops,
  schema::SCHEMA,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// An identity store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection handle is shared.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Run `f` against the connection outside an explicit transaction.
  async fn read<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    Ok(self.conn.call(move |conn| f(conn).map_err(Error::into_call)).await?)
  }

  /// Run `f` in one transaction; any error rolls the whole thing back.
  async fn write<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T> + Send + 'static,
  {
    Ok(
      self
        .conn
        .call(move |conn| {
          let tx = conn.transaction()?;
          let out = f(&tx).map_err(Error::into_call)?;
          tx.commit()?;
          Ok(out)
        })
        .await?,
    )
  }
}

fn limit_of(limit: Option<usize>, default: usize) -> i64 {
  limit.unwrap_or(default).max(1) as i64
}

/// `now - age`, or the earliest instant when `age` reaches past it.
fn cutoff_before(age: Duration) -> DateTime<Utc> {
  Utc::now()
    .checked_sub_signed(age)
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ─── IdentityStore impl ──────────────────────────────────────────────────────

impl IdentityStore for SqliteStore {
  type Error = Error;

  // ── Sightings ─────────────────────────────────────────────────────────────

  async fn record_sighting(&self, sighting: NewSighting) -> Result<Sighting> {
    let sighting = sighting.normalized()?;
    self.write(move |conn| ops::upsert_sighting(conn, sighting)).await
  }

  async fn record_sightings(&self, sightings: Vec<NewSighting>) -> Result<BatchReport> {
    if sightings.is_empty() {
      return Ok(BatchReport::default());
    }
    self.write(move |conn| ops::record_sightings(conn, sightings)).await
  }

  async fn get_sighting(&self, id: Uuid) -> Result<Option<Sighting>> {
    self.read(move |conn| ops::load_sighting(conn, id)).await
  }

  async fn list_sightings(&self, query: SightingQuery) -> Result<Vec<Sighting>> {
    let partition = query.partition;
    let status = query.status.map(|s| s.as_ref().to_owned());
    let limit = limit_of(query.limit, DEFAULT_SIGHTING_LIMIT);
    let offset = query.offset.unwrap_or(0) as i64;

    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SIGHTING_COLUMNS} FROM network_sightings
           WHERE (?1 IS NULL OR partition = ?1)
             AND (?2 IS NULL OR status = ?2)
           ORDER BY last_seen DESC, rowid DESC
           LIMIT ?3 OFFSET ?4"
        ))?;
        let raws = stmt
          .query_map(params![partition, status, limit, offset], RawSighting::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSighting::into_sighting).collect()
      })
      .await
  }

  async fn count_active_sightings(&self, partition: Option<String>) -> Result<u64> {
    self
      .read(move |conn| {
        let count: i64 = conn.query_row(
          "SELECT COUNT(*) FROM network_sightings
           WHERE status = 'active' AND (?1 IS NULL OR partition = ?1)",
          params![partition],
          |row| row.get(0),
        )?;
        Ok(count as u64)
      })
      .await
  }

  async fn transition_sighting(&self, id: Uuid, status: SightingStatus) -> Result<Sighting> {
    let result = self
      .write(move |conn| {
        let current =
          ops::load_sighting(conn, id)?.ok_or(sightline_core::Error::SightingNotFound(id))?;
        if current.status.check_transition(id, status)? {
          ops::set_status(conn, id, status)?;
        }
        ops::load_sighting(conn, id)?
          .ok_or_else(|| sightline_core::Error::SightingNotFound(id).into())
      })
      .await;

    if let Err(Error::Core(e @ sightline_core::Error::InvalidTransition { .. })) = &result {
      error!(sighting_id = %id, error = %e, "rejected sighting transition");
    }
    result
  }

  async fn select_promotable(&self, cutoff: DateTime<Utc>) -> Result<Vec<Sighting>> {
    let cutoff = encode_dt(cutoff);
    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SIGHTING_COLUMNS} FROM network_sightings
           WHERE status = 'active' AND first_seen <= ?1
           ORDER BY first_seen ASC, sighting_id ASC"
        ))?;
        let raws = stmt
          .query_map(params![cutoff], RawSighting::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSighting::into_sighting).collect()
      })
      .await
  }

  async fn mark_promoted(&self, ids: Vec<Uuid>) -> Result<u64> {
    if ids.is_empty() {
      return Ok(0);
    }
    self
      .write(move |conn| {
        let mut changed = 0;
        for id in ids {
          if ops::set_status(conn, id, SightingStatus::Promoted)? {
            changed += 1;
          }
        }
        Ok(changed)
      })
      .await
  }

  async fn expire_sightings(&self, now: DateTime<Utc>) -> Result<u64> {
    let now = encode_dt(now);
    self
      .write(move |conn| {
        let changed = conn.execute(
          "UPDATE network_sightings SET status = ?2, status_rank = ?3
           WHERE status = 'active'
             AND ttl_expires_at IS NOT NULL
             AND ttl_expires_at <= ?1",
          params![
            now,
            SightingStatus::Expired.as_ref(),
            SightingStatus::Expired.rank()
          ],
        )?;
        Ok(changed as u64)
      })
      .await
  }

  async fn record_sighting_events(&self, events: Vec<NewSightingEvent>) -> Result<BatchReport> {
    let now = Utc::now();
    let mut report = BatchReport::default();
    let mut valid = Vec::with_capacity(events.len());
    for (index, event) in events.into_iter().enumerate() {
      let key = format!("{}/{}", event.sighting_id, event.event_type);
      match event.validate(Uuid::new_v4(), now) {
        Ok(event) => valid.push(event),
        Err(reason) => {
          warn!(index, event = %key, error = %reason, "skipping invalid sighting event");
          report.reject(index, key, reason);
        }
      }
    }
    if valid.is_empty() {
      return Ok(report);
    }

    report.accepted = valid.len();
    self
      .write(move |conn| {
        for event in &valid {
          ops::insert_sighting_event(conn, event)?;
        }
        Ok(())
      })
      .await?;
    Ok(report)
  }

  async fn list_sighting_events(
    &self,
    sighting_id: Uuid,
    limit: Option<usize>,
  ) -> Result<Vec<SightingEvent>> {
    let id = encode_uuid(sighting_id);
    let limit = limit_of(limit, DEFAULT_EVENT_LIMIT);
    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {SIGHTING_EVENT_COLUMNS} FROM sighting_events
           WHERE sighting_id = ?1
           ORDER BY created_at DESC, rowid DESC
           LIMIT ?2"
        ))?;
        let raws = stmt
          .query_map(params![id, limit], RawSightingEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawSightingEvent::into_event).collect()
      })
      .await
  }

  // ── Subnet policies ───────────────────────────────────────────────────────

  async fn upsert_subnet_policy(&self, policy: NewSubnetPolicy) -> Result<SubnetPolicy> {
    let policy = policy.validate(Utc::now())?;
    self
      .write(move |conn| {
        ops::upsert_policy(conn, &policy)?;
        ops::load_policy(conn, &policy.subnet_id)?
          .ok_or_else(|| rusqlite::Error::QueryReturnedNoRows.into())
      })
      .await
  }

  async fn get_subnet_policy(&self, subnet_id: String) -> Result<Option<SubnetPolicy>> {
    self.read(move |conn| ops::load_policy(conn, subnet_id.trim())).await
  }

  async fn list_subnet_policies(&self) -> Result<Vec<SubnetPolicy>> {
    self
      .read(|conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {POLICY_COLUMNS} FROM subnet_policies ORDER BY subnet_id"
        ))?;
        let raws = stmt
          .query_map([], RawPolicy::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawPolicy::into_policy).collect()
      })
      .await
  }

  // ── Identifiers ───────────────────────────────────────────────────────────

  async fn upsert_identifiers(&self, identifiers: Vec<NewIdentifier>) -> Result<BatchReport> {
    if identifiers.is_empty() {
      return Ok(BatchReport::default());
    }
    let now = Utc::now();
    self
      .write(move |conn| ops::upsert_identifiers(conn, identifiers, now))
      .await
  }

  async fn get_identifier(&self, id_type: String, id_value: String) -> Result<Option<Identifier>> {
    self
      .read(move |conn| ops::load_identifier(conn, id_type.trim(), id_value.trim()))
      .await
  }

  async fn list_identifiers(&self, device_id: String) -> Result<Vec<Identifier>> {
    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {IDENTIFIER_COLUMNS} FROM device_identifiers
           WHERE device_id = ?1
           ORDER BY id_type, id_value"
        ))?;
        let raws = stmt
          .query_map(params![device_id], RawIdentifier::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawIdentifier::into_identifier).collect()
      })
      .await
  }

  // ── Devices ───────────────────────────────────────────────────────────────

  async fn apply_device_updates(&self, updates: Vec<DeviceUpdate>) -> Result<ApplyReport> {
    if updates.is_empty() {
      return Ok(ApplyReport::default());
    }
    self.write(move |conn| ops::apply_device_updates(conn, updates)).await
  }

  async fn get_device(&self, device_id: String) -> Result<Option<CanonicalDevice>> {
    self.read(move |conn| ops::load_device(conn, device_id.trim())).await
  }

  async fn resolve_device(&self, device_id: String) -> Result<Option<CanonicalDevice>> {
    self
      .read(move |conn| {
        let root = ops::merge_root(conn, device_id.trim())?;
        ops::load_device(conn, &root)
      })
      .await
  }

  async fn get_devices_by_ip(&self, ip: String) -> Result<Vec<CanonicalDevice>> {
    self
      .read(move |conn| {
        ops::query_devices(
          conn,
          "WHERE ip = ?1 AND merged_into IS NULL ORDER BY last_seen DESC, device_id ASC",
          params![ip.trim()],
        )
      })
      .await
  }

  async fn list_devices(&self, limit: usize, offset: usize) -> Result<Vec<CanonicalDevice>> {
    let limit = limit.max(1) as i64;
    let offset = offset as i64;
    self
      .read(move |conn| {
        ops::query_devices(
          conn,
          "WHERE merged_into IS NULL
           ORDER BY last_seen DESC, device_id ASC
           LIMIT ?1 OFFSET ?2",
          params![limit, offset],
        )
      })
      .await
  }

  async fn find_device_by_alias(&self, kind: AliasKind, value: String) -> Result<Option<String>> {
    self
      .read(move |conn| ops::find_device_by_alias(conn, kind, &value))
      .await
  }

  async fn soft_delete_devices(&self, device_ids: Vec<String>, source: String) -> Result<u64> {
    if device_ids.is_empty() {
      return Ok(0);
    }
    let now = Utc::now();
    self
      .write(move |conn| ops::soft_delete(conn, &device_ids, &source, now))
      .await
  }

  async fn find_stale_ip_only(&self, ttl: Duration) -> Result<Vec<String>> {
    let cutoff = cutoff_before(ttl);
    self.read(move |conn| ops::find_stale_ip_only(conn, cutoff)).await
  }

  async fn purge_stale_devices(&self, retention: Duration) -> Result<u64> {
    let cutoff = cutoff_before(retention);
    self.write(move |conn| ops::purge_stale(conn, cutoff)).await
  }

  // ── Merges ────────────────────────────────────────────────────────────────

  async fn merge_devices(&self, merge: NewMergeAudit) -> Result<MergeAuditEvent> {
    let event = merge.validate(Uuid::new_v4(), Utc::now())?;
    let (from, to) = (event.from_device_id.clone(), event.to_device_id.clone());
    let result = self.write(move |conn| ops::merge_devices(conn, event)).await;
    if let Err(Error::Core(e)) = &result {
      error!(from = %from, to = %to, error = %e, "rejected device merge");
    }
    result
  }

  async fn record_merge_audit(&self, event: NewMergeAudit) -> Result<MergeAuditEvent> {
    let event = event.validate(Uuid::new_v4(), Utc::now())?;
    self
      .write(move |conn| {
        ops::insert_audit(conn, &event)?;
        Ok(event)
      })
      .await
  }

  async fn list_merge_audit(&self, limit: Option<usize>) -> Result<Vec<MergeAuditEvent>> {
    let limit = limit.unwrap_or(DEFAULT_AUDIT_LIMIT).max(1);
    self.read(move |conn| ops::list_audit(conn, None, limit)).await
  }

  async fn list_merge_audit_for_device(
    &self,
    device_id: String,
    limit: Option<usize>,
  ) -> Result<Vec<MergeAuditEvent>> {
    let limit = limit.unwrap_or(DEFAULT_AUDIT_LIMIT).max(1);
    self
      .read(move |conn| ops::list_audit(conn, Some(device_id.trim()), limit))
      .await
  }

  // ── Capabilities ──────────────────────────────────────────────────────────

  async fn record_capability_event(&self, event: NewCapabilityEvent) -> Result<CapabilitySnapshot> {
    let event = event.validate(Uuid::new_v4(), Utc::now())?;
    self.write(move |conn| ops::record_capability(conn, &event)).await
  }

  async fn list_capability_events(
    &self,
    device_id: String,
    limit: Option<usize>,
  ) -> Result<Vec<CapabilityEvent>> {
    let limit = limit_of(limit, DEFAULT_EVENT_LIMIT);
    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CAPABILITY_EVENT_COLUMNS} FROM capability_events
           WHERE device_id = ?1
           ORDER BY checked_at DESC, rowid DESC
           LIMIT ?2"
        ))?;
        let raws = stmt
          .query_map(params![device_id, limit], RawCapabilityEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawCapabilityEvent::into_event).collect()
      })
      .await
  }

  async fn list_capabilities(&self, device_id: String) -> Result<Vec<CapabilitySnapshot>> {
    self
      .read(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {CAPABILITY_COLUMNS} FROM device_capabilities
           WHERE device_id = ?1
           ORDER BY capability, service_id"
        ))?;
        let raws = stmt
          .query_map(params![device_id], RawCapability::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawCapability::into_snapshot).collect()
      })
      .await
  }
}
