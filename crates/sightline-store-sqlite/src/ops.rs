//! Synchronous row operations run inside a connection closure.
//!
//! Every function takes a `&Connection`; callers pass a `Transaction` (which
//! derefs to one) when a batch must commit atomically. Domain merges happen
//! here in Rust using the pure functions from `sightline-core`; SQL only
//! loads and stores rows.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension as _, params};
use sightline_core::{
  alias::AliasKind,
  audit::{MergeAuditEvent, REASON_SOFT_DELETE},
  batch::BatchReport,
  capability::{CapabilityEvent, CapabilitySnapshot},
  device::{
    self, ApplyReport, CanonicalDevice, DeviceChange, DeviceUpdate, merge_update,
  },
  identifier::{Identifier, NewIdentifier},
  metadata,
  policy::SubnetPolicy,
  sighting::{NewSighting, Sighting, SightingEvent, SightingStatus},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{
    AUDIT_COLUMNS, CAPABILITY_COLUMNS, DEVICE_COLUMNS, IDENTIFIER_COLUMNS,
    POLICY_COLUMNS, RawCapability, RawDevice, RawIdentifier, RawMergeAudit,
    RawPolicy, RawSighting, SIGHTING_COLUMNS, encode_dt, encode_metadata,
    encode_sources, encode_uuid,
  },
};

// ─── Sightings ───────────────────────────────────────────────────────────────

pub fn load_sighting(conn: &Connection, id: Uuid) -> Result<Option<Sighting>> {
  let raw = conn
    .query_row(
      &format!("SELECT {SIGHTING_COLUMNS} FROM network_sightings WHERE sighting_id = ?1"),
      params![encode_uuid(id)],
      RawSighting::from_row,
    )
    .optional()?;
  raw.map(RawSighting::into_sighting).transpose()
}

fn load_sighting_by_key(
  conn: &Connection,
  ip: &str,
  partition: &str,
  source: &str,
) -> Result<Option<Sighting>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {SIGHTING_COLUMNS} FROM network_sightings
         WHERE ip = ?1 AND partition = ?2 AND source = ?3"
      ),
      params![ip, partition, source],
      RawSighting::from_row,
    )
    .optional()?;
  raw.map(RawSighting::into_sighting).transpose()
}

/// Insert or refresh one normalised sighting.
///
/// The UPDATE never touches `status`; only transitions move it.
pub fn upsert_sighting(conn: &Connection, input: NewSighting) -> Result<Sighting> {
  let existing = load_sighting_by_key(conn, &input.ip, &input.partition, &input.source)?;
  let sighting = match existing {
    Some(current) if current.status == SightingStatus::Promoted => current,
    Some(current) => {
      let next = current.refresh(&input);
      conn.execute(
        "UPDATE network_sightings
         SET subnet_id = ?2, first_seen = ?3, last_seen = ?4,
             ttl_expires_at = ?5, fingerprint_id = ?6, metadata = ?7
         WHERE sighting_id = ?1 AND status <> 'promoted'",
        params![
          encode_uuid(next.sighting_id),
          next.subnet_id,
          encode_dt(next.first_seen),
          encode_dt(next.last_seen),
          next.ttl_expires_at.map(encode_dt),
          next.fingerprint_id,
          encode_metadata(&next.metadata)?,
        ],
      )?;
      next
    }
    None => {
      let sighting = input.into_sighting(Uuid::new_v4());
      conn.execute(
        &format!(
          "INSERT INTO network_sightings ({SIGHTING_COLUMNS}, status_rank)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ),
        params![
          encode_uuid(sighting.sighting_id),
          sighting.partition,
          sighting.ip,
          sighting.subnet_id,
          sighting.source,
          sighting.status.as_ref(),
          encode_dt(sighting.first_seen),
          encode_dt(sighting.last_seen),
          sighting.ttl_expires_at.map(encode_dt),
          sighting.fingerprint_id,
          encode_metadata(&sighting.metadata)?,
          sighting.status.rank(),
        ],
      )?;
      sighting
    }
  };
  Ok(sighting)
}

pub fn record_sightings(conn: &Connection, inputs: Vec<NewSighting>) -> Result<BatchReport> {
  let mut report = BatchReport::default();
  for (index, input) in inputs.into_iter().enumerate() {
    let key = format!("{}/{}/{}", input.partition, input.ip, input.source);
    match input.normalized() {
      Ok(input) => {
        upsert_sighting(conn, input)?;
        report.accepted += 1;
      }
      Err(reason) => {
        warn!(index, sighting = %key, error = %reason, "skipping invalid sighting");
        report.reject(index, key, reason);
      }
    }
  }
  Ok(report)
}

/// Conditional status update; `false` when the row had already moved on.
pub fn set_status(conn: &Connection, id: Uuid, status: SightingStatus) -> Result<bool> {
  let changed = conn.execute(
    "UPDATE network_sightings SET status = ?2, status_rank = ?3
     WHERE sighting_id = ?1 AND status = 'active' AND status_rank < ?3",
    params![encode_uuid(id), status.as_ref(), status.rank()],
  )?;
  Ok(changed > 0)
}

pub fn insert_sighting_event(conn: &Connection, event: &SightingEvent) -> Result<()> {
  conn.execute(
    "INSERT INTO sighting_events
       (event_id, sighting_id, device_id, event_type, actor, details, created_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    params![
      encode_uuid(event.event_id),
      encode_uuid(event.sighting_id),
      event.device_id,
      event.event_type,
      event.actor,
      encode_metadata(&event.details)?,
      encode_dt(event.created_at),
    ],
  )?;
  Ok(())
}

// ─── Subnet policies ─────────────────────────────────────────────────────────

pub fn load_policy(conn: &Connection, subnet_id: &str) -> Result<Option<SubnetPolicy>> {
  let raw = conn
    .query_row(
      &format!("SELECT {POLICY_COLUMNS} FROM subnet_policies WHERE subnet_id = ?1"),
      params![subnet_id],
      RawPolicy::from_row,
    )
    .optional()?;
  raw.map(RawPolicy::into_policy).transpose()
}

/// `created_at` survives re-writes of the same subnet.
pub fn upsert_policy(conn: &Connection, policy: &SubnetPolicy) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO subnet_policies ({POLICY_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
       ON CONFLICT (subnet_id) DO UPDATE SET
         cidr            = excluded.cidr,
         classification  = excluded.classification,
         promotion_rules = excluded.promotion_rules,
         reaper_profile  = excluded.reaper_profile,
         allow_ip_as_id  = excluded.allow_ip_as_id,
         updated_at      = excluded.updated_at"
    ),
    params![
      policy.subnet_id,
      policy.cidr.to_string(),
      policy.classification,
      serde_json::to_string(&policy.promotion_rules)?,
      policy.reaper_profile,
      policy.allow_ip_as_id,
      encode_dt(policy.created_at),
      encode_dt(policy.updated_at),
    ],
  )?;
  Ok(())
}

// ─── Identifiers ─────────────────────────────────────────────────────────────

pub fn load_identifier(
  conn: &Connection,
  id_type: &str,
  id_value: &str,
) -> Result<Option<Identifier>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {IDENTIFIER_COLUMNS} FROM device_identifiers
         WHERE id_type = ?1 AND id_value = ?2"
      ),
      params![id_type, id_value],
      RawIdentifier::from_row,
    )
    .optional()?;
  raw.map(RawIdentifier::into_identifier).transpose()
}

fn write_identifier(conn: &Connection, identifier: &Identifier) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO device_identifiers ({IDENTIFIER_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
       ON CONFLICT (id_type, id_value) DO UPDATE SET
         device_id  = excluded.device_id,
         confidence = excluded.confidence,
         source     = excluded.source,
         first_seen = excluded.first_seen,
         last_seen  = excluded.last_seen,
         verified   = excluded.verified,
         metadata   = excluded.metadata"
    ),
    params![
      identifier.device_id,
      identifier.id_type,
      identifier.id_value,
      identifier.confidence.as_ref(),
      identifier.source,
      encode_dt(identifier.first_seen),
      encode_dt(identifier.last_seen),
      identifier.verified,
      encode_metadata(&identifier.metadata)?,
    ],
  )?;
  Ok(())
}

pub fn upsert_identifiers(
  conn: &Connection,
  inputs: Vec<NewIdentifier>,
  now: DateTime<Utc>,
) -> Result<BatchReport> {
  let mut report = BatchReport::default();
  for (index, input) in inputs.into_iter().enumerate() {
    let label = input.label();
    let (id_type, id_value) = (input.id_type.clone(), input.id_value.clone());
    let device_id = input.device_id.clone();
    let incoming = match input.validate(now) {
      Ok(identifier) => identifier,
      Err(reason) => {
        warn!(
          index,
          id_type = %id_type,
          id_value = %id_value,
          device_id = %device_id,
          error = %reason,
          "skipping invalid identifier"
        );
        report.reject(index, label, reason);
        continue;
      }
    };

    let merged = match load_identifier(conn, &incoming.id_type, &incoming.id_value)? {
      Some(existing) => {
        if existing.device_id != incoming.device_id {
          debug!(
            identifier = %label,
            from = %existing.device_id,
            to = %incoming.device_id,
            "identifier changes owner"
          );
        }
        Identifier::merge(&existing, &incoming)
      }
      None => incoming,
    };
    write_identifier(conn, &merged)?;
    report.accepted += 1;
  }
  Ok(report)
}

// ─── Devices ─────────────────────────────────────────────────────────────────

pub fn load_device(conn: &Connection, device_id: &str) -> Result<Option<CanonicalDevice>> {
  let raw = conn
    .query_row(
      &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1"),
      params![device_id],
      RawDevice::from_row,
    )
    .optional()?;
  raw.map(RawDevice::into_device).transpose()
}

pub fn query_devices(
  conn: &Connection,
  where_clause: &str,
  params: impl rusqlite::Params,
) -> Result<Vec<CanonicalDevice>> {
  let mut stmt =
    conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices {where_clause}"))?;
  let raws = stmt
    .query_map(params, RawDevice::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawDevice::into_device).collect()
}

pub fn write_device(conn: &Connection, device: &CanonicalDevice) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT OR REPLACE INTO devices ({DEVICE_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
               ?16, ?17, ?18)"
    ),
    params![
      device.device_id,
      device.ip,
      device.poller_id,
      device.agent_id,
      device.hostname,
      device.mac,
      encode_sources(&device.discovery_sources)?,
      device.is_available,
      encode_dt(device.first_seen),
      encode_dt(device.last_seen),
      encode_metadata(&device.metadata)?,
      device.merged_into,
      device.device_type,
      device.service_type,
      device.service_status,
      device.last_heartbeat.map(encode_dt),
      device.os_info,
      device.version_info,
    ],
  )?;
  Ok(())
}

/// Mirror the device's alias maps into `device_aliases`. Timestamps only move
/// forward.
fn index_aliases(conn: &Connection, device: &CanonicalDevice) -> Result<()> {
  let Some(record) = device.aliases() else {
    return Ok(());
  };
  let mut stmt = conn.prepare_cached(
    "INSERT INTO device_aliases (alias_kind, alias_value, device_id, last_seen)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT (alias_kind, alias_value, device_id) DO UPDATE SET
       last_seen = MAX(device_aliases.last_seen, excluded.last_seen)",
  )?;
  for entry in record.entries() {
    stmt.execute(params![
      entry.kind.as_ref(),
      entry.value,
      device.device_id,
      encode_dt(entry.last_seen),
    ])?;
  }
  Ok(())
}

/// Follow `merged_into` from `device_id` to the surviving device.
pub fn merge_root(conn: &Connection, device_id: &str) -> Result<String> {
  device::resolve_merge_chain::<Error>(device_id, |id| {
    let next: Option<Option<String>> = conn
      .query_row(
        "SELECT merged_into FROM devices WHERE device_id = ?1",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(next.flatten())
  })
}

pub fn apply_device_updates(
  conn: &Connection,
  updates: Vec<DeviceUpdate>,
) -> Result<ApplyReport> {
  let mut out = ApplyReport::default();
  for (index, mut update) in updates.into_iter().enumerate() {
    if let Err(reason) = update.validate() {
      warn!(
        index,
        device_id = update.device_id.as_deref().unwrap_or_default(),
        ip = %update.ip,
        source = %update.source,
        error = %reason,
        "skipping invalid device update"
      );
      out.report.reject(index, update.ip_device_id(), reason);
      continue;
    }

    // Writes addressed to a merged device land on the survivor.
    let requested = update.resolved_id().unwrap_or_default().to_owned();
    let target = merge_root(conn, &requested)?;
    if target != requested {
      debug!(from = %requested, to = %target, "redirecting update to merge root");
      update.device_id = Some(target.clone());
    }

    let existing = load_device(conn, &target)?;
    let merged = merge_update(existing.as_ref(), &update).map_err(Error::from)?;
    write_device(conn, &merged.device)?;
    index_aliases(conn, &merged.device)?;

    out.report.accepted += 1;
    out.changes.push(DeviceChange {
      device_id:     target,
      created:       merged.created,
      alias_changed: merged.alias_changed,
    });
  }
  Ok(out)
}

pub fn find_device_by_alias(
  conn: &Connection,
  kind: AliasKind,
  value: &str,
) -> Result<Option<String>> {
  let device_id: Option<String> = conn
    .query_row(
      "SELECT device_id FROM device_aliases
       WHERE alias_kind = ?1 AND alias_value = ?2
       ORDER BY last_seen DESC, device_id ASC
       LIMIT 1",
      params![kind.as_ref(), value.trim()],
      |row| row.get(0),
    )
    .optional()?;
  device_id.map(|id| merge_root(conn, &id)).transpose()
}

pub fn soft_delete(
  conn: &Connection,
  device_ids: &[String],
  source: &str,
  now: DateTime<Utc>,
) -> Result<u64> {
  let mut deleted = 0;
  for device_id in device_ids {
    let Some(mut device) = load_device(conn, device_id)? else {
      debug!(device_id = %device_id, "soft delete skipped unknown device");
      continue;
    };
    device.metadata.insert("_deleted".to_owned(), "true".to_owned());
    device.is_available = false;
    write_device(conn, &device)?;

    let mut details = metadata::Metadata::new();
    details.insert("ip".to_owned(), device.ip.clone());
    insert_audit(conn, &MergeAuditEvent {
      event_id: Uuid::new_v4(),
      from_device_id: device.device_id.clone(),
      to_device_id: device.device_id.clone(),
      reason: REASON_SOFT_DELETE.to_owned(),
      confidence_score: None,
      source: source.to_owned(),
      details,
      created_at: now,
    })?;
    deleted += 1;
  }
  Ok(deleted)
}

/// Live devices with no strong identity last seen before `cutoff`.
pub fn find_stale_ip_only(conn: &Connection, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
  let candidates = query_devices(
    conn,
    "WHERE merged_into IS NULL
       AND last_seen < ?1
       AND (mac IS NULL OR mac = '')
       AND NOT EXISTS (
         SELECT 1 FROM device_identifiers i
         WHERE i.device_id = devices.device_id
           AND i.id_type IN ('armis_device_id', 'integration_id', 'netbox_device_id', 'mac')
       )
     ORDER BY last_seen ASC, device_id ASC",
    params![encode_dt(cutoff)],
  )?;
  Ok(
    candidates
      .into_iter()
      .filter(|d| !d.has_strong_identity() && !d.is_deleted())
      .map(|d| d.device_id)
      .collect(),
  )
}

/// Hard-delete devices last seen before `cutoff` together with every device
/// merged into them, plus their identifiers, aliases and capability state.
pub fn purge_stale(conn: &Connection, cutoff: DateTime<Utc>) -> Result<u64> {
  let ids: Vec<String> = {
    let mut stmt = conn.prepare(
      "SELECT device_id FROM devices
       WHERE last_seen < ?1
          OR merged_into IN (SELECT device_id FROM devices WHERE last_seen < ?1)",
    )?;
    stmt
      .query_map(params![encode_dt(cutoff)], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };

  for id in &ids {
    conn.execute("DELETE FROM device_identifiers WHERE device_id = ?1", params![id])?;
    conn.execute("DELETE FROM device_aliases WHERE device_id = ?1", params![id])?;
    conn.execute("DELETE FROM device_capabilities WHERE device_id = ?1", params![id])?;
    conn.execute("DELETE FROM devices WHERE device_id = ?1", params![id])?;
  }
  Ok(ids.len() as u64)
}

// ─── Merges ──────────────────────────────────────────────────────────────────

pub fn insert_audit(conn: &Connection, event: &MergeAuditEvent) -> Result<()> {
  conn.execute(
    &format!(
      "INSERT INTO merge_audit ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
    ),
    params![
      encode_uuid(event.event_id),
      event.from_device_id,
      event.to_device_id,
      event.reason,
      event.confidence_score,
      event.source,
      encode_metadata(&event.details)?,
      encode_dt(event.created_at),
    ],
  )?;
  Ok(())
}

pub fn list_audit(
  conn: &Connection,
  device_id: Option<&str>,
  limit: usize,
) -> Result<Vec<MergeAuditEvent>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {AUDIT_COLUMNS} FROM merge_audit
     WHERE ?1 IS NULL OR from_device_id = ?1 OR to_device_id = ?1
     ORDER BY created_at DESC, rowid DESC
     LIMIT ?2"
  ))?;
  let raws = stmt
    .query_map(params![device_id, limit as i64], RawMergeAudit::from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawMergeAudit::into_event).collect()
}

/// Fold `from` into the root of `event.to_device_id` and append the audit
/// row. Returns the event as written, naming the resolved root.
pub fn merge_devices(conn: &Connection, mut event: MergeAuditEvent) -> Result<MergeAuditEvent> {
  let from_id = event.from_device_id.clone();
  if from_id == event.to_device_id {
    return Err(sightline_core::Error::SelfMerge(from_id).into());
  }
  let mut from = load_device(conn, &from_id)?
    .ok_or_else(|| sightline_core::Error::DeviceNotFound(from_id.clone()))?;
  if load_device(conn, &event.to_device_id)?.is_none() {
    return Err(sightline_core::Error::DeviceNotFound(event.to_device_id).into());
  }

  let root_id = merge_root(conn, &event.to_device_id)?;
  if root_id == from_id {
    return Err(
      sightline_core::Error::MergeCycle { from: from_id, to: event.to_device_id }.into(),
    );
  }
  let mut root = load_device(conn, &root_id)?
    .ok_or_else(|| sightline_core::Error::DeviceNotFound(root_id.clone()))?;

  // The survivor absorbs the merged device's history without losing its own.
  root.discovery_sources.extend(from.discovery_sources.iter().cloned());
  root.first_seen = root.first_seen.min(from.first_seen);
  if from.last_seen > root.last_seen {
    root.last_seen = from.last_seen;
    root.is_available = from.is_available;
  }
  for slot in [
    (&mut root.hostname, &from.hostname),
    (&mut root.mac, &from.mac),
    (&mut root.poller_id, &from.poller_id),
    (&mut root.agent_id, &from.agent_id),
  ] {
    if slot.0.is_none() {
      *slot.0 = slot.1.clone();
    }
  }
  let mut absorbed = from.metadata.clone();
  for key in metadata::DELETION_KEYS {
    absorbed.remove(key);
  }
  sightline_core::alias::strip(&mut absorbed);
  root.metadata = metadata::fill(&root.metadata, &absorbed);
  write_device(conn, &root)?;

  conn.execute(
    "UPDATE devices SET merged_into = ?2 WHERE merged_into = ?1",
    params![from_id, root_id],
  )?;
  conn.execute(
    "UPDATE device_identifiers SET device_id = ?2 WHERE device_id = ?1",
    params![from_id, root_id],
  )?;
  from.merged_into = Some(root_id.clone());
  from.is_available = false;
  write_device(conn, &from)?;

  event.to_device_id = root_id;
  insert_audit(conn, &event)?;
  Ok(event)
}

// ─── Capabilities ────────────────────────────────────────────────────────────

fn load_capability(
  conn: &Connection,
  event: &CapabilityEvent,
) -> Result<Option<CapabilitySnapshot>> {
  let raw = conn
    .query_row(
      &format!(
        "SELECT {CAPABILITY_COLUMNS} FROM device_capabilities
         WHERE device_id = ?1 AND capability = ?2 AND service_id = ?3"
      ),
      params![event.device_id, event.capability, event.service_id],
      RawCapability::from_row,
    )
    .optional()?;
  raw.map(RawCapability::into_snapshot).transpose()
}

pub fn record_capability(
  conn: &Connection,
  event: &CapabilityEvent,
) -> Result<CapabilitySnapshot> {
  conn.execute(
    "INSERT INTO capability_events
       (event_id, device_id, capability, service_id, service_type, state, success,
        failure_reason, recorded_by, checked_at, metadata)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    params![
      encode_uuid(event.event_id),
      event.device_id,
      event.capability,
      event.service_id,
      event.service_type,
      event.state,
      event.success,
      event.failure_reason,
      event.recorded_by,
      encode_dt(event.checked_at),
      encode_metadata(&event.metadata)?,
    ],
  )?;

  let existing = load_capability(conn, event)?;
  let snapshot = CapabilitySnapshot::fold(existing.as_ref(), event);
  conn.execute(
    &format!(
      "INSERT OR REPLACE INTO device_capabilities ({CAPABILITY_COLUMNS})
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
    ),
    params![
      snapshot.device_id,
      snapshot.capability,
      snapshot.service_id,
      snapshot.service_type,
      snapshot.state,
      snapshot.enabled,
      snapshot.failure_reason,
      snapshot.recorded_by,
      encode_dt(snapshot.last_checked),
      snapshot.last_success.map(encode_dt),
      snapshot.last_failure.map(encode_dt),
      encode_metadata(&snapshot.metadata)?,
    ],
  )?;
  Ok(snapshot)
}
