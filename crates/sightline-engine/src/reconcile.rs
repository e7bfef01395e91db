//! Ingest path: decide which canonical device each update belongs to, then
//! apply the updates and their identifiers in byte-budgeted batches.
//!
//! Identity resolution order for one update:
//!
//! 1. the explicit device id, unless a strong identifier it carries is owned
//!    by another device, in which case the explicit device is merged into
//!    the owner;
//! 2. the owner of the highest-priority strong identifier (Armis id,
//!    integration id, NetBox id, then MAC);
//! 3. the `sr:` id derived from the update's strong identifiers, when none
//!    of them is owned yet;
//! 4. the device that last used the update's service id;
//! 5. the newest live device currently at the update's IP;
//! 6. the device that last used the IP as an alias;
//! 7. `"{partition}:{ip}"`.
//!
//! Steps 5 and 6 never pick a device whose MAC disagrees with the update's.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use serde::Serialize;
use sightline_core::{
  Classify, ErrorKind, ValidationError,
  alias::AliasKind,
  audit::{MergeAuditEvent, NewMergeAudit, REASON_STRONG_ID_CONFLICT},
  batch::{BatchReport, EstimateSize, pack_batches},
  device::{ApplyReport, CanonicalDevice, DeviceChange, DeviceUpdate},
  identifier::{self, Confidence, ID_TYPE_IP, ID_TYPE_MAC, Identifier, NewIdentifier},
  metadata::Metadata,
  store::IdentityStore,
  write_gate::WriteCapability,
};
use tracing::{debug, info, warn};

use crate::{Result, config::BatchingConfig, retry::with_retry};

/// Audit confidence for a merge forced by a shared MAC.
pub const MAC_CONFLICT_CONFIDENCE: f64 = 0.95;

/// Audit confidence for a merge forced by a shared vendor asset id.
pub const VENDOR_CONFLICT_CONFIDENCE: f64 = 1.0;

// ─── Report ──────────────────────────────────────────────────────────────────

/// Outcome of [`Reconciler::ingest`].
///
/// Indices refer to positions in the submitted update list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
  /// Device each update landed on; `None` when it was rejected or deferred.
  pub device_ids:      Vec<Option<String>>,
  /// Validation outcome of the device updates.
  pub report:          BatchReport,
  /// Updates that failed transport after retries. Safe to resubmit.
  pub retryable:       Vec<usize>,
  pub changes:         Vec<DeviceChange>,
  /// Merges forced by strong identifier conflicts.
  pub merges:          Vec<MergeAuditEvent>,
  pub identifiers:     BatchReport,
  pub writes_disabled: bool,
}

impl IngestReport {
  fn sized(len: usize) -> Self {
    Self { device_ids: vec![None; len], ..Default::default() }
  }

  pub fn landed(&self, index: usize) -> Option<&str> {
    self.device_ids.get(index).and_then(|id| id.as_deref())
  }

  /// Every update landed.
  pub fn is_complete(&self) -> bool {
    !self.writes_disabled && self.retryable.is_empty() && self.report.is_clean()
  }
}

// ─── Pending ─────────────────────────────────────────────────────────────────

/// A resolved update waiting to be applied, tagged with its input position.
#[derive(Debug, Clone)]
struct Pending {
  index:  usize,
  update: DeviceUpdate,
}

impl EstimateSize for Pending {
  fn estimated_size(&self) -> usize { self.update.estimated_size() }
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

pub struct Reconciler<S> {
  store:    Arc<S>,
  writes:   Arc<dyn WriteCapability>,
  batching: BatchingConfig,
}

impl<S> Clone for Reconciler<S> {
  fn clone(&self) -> Self {
    Self {
      store:    Arc::clone(&self.store),
      writes:   Arc::clone(&self.writes),
      batching: self.batching.clone(),
    }
  }
}

impl<S: IdentityStore> Reconciler<S> {
  pub fn new(
    store: Arc<S>,
    writes: Arc<dyn WriteCapability>,
    batching: BatchingConfig,
  ) -> Self {
    Self { store, writes, batching }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn batching(&self) -> &BatchingConfig { &self.batching }

  /// Resolve, apply and index `updates`.
  ///
  /// Updates are processed in `timestamp` order regardless of arrival order.
  /// Validation failures are reported per update; a batch that still fails
  /// transport after retries is reported in `retryable` and the remaining
  /// batches carry on. Any other store failure aborts the call.
  pub async fn ingest(&self, updates: Vec<DeviceUpdate>) -> Result<IngestReport> {
    let mut out = IngestReport::sized(updates.len());
    if updates.is_empty() {
      return Ok(out);
    }
    if !self.writes.enabled() {
      warn!(updates = updates.len(), "writes disabled, deferring device updates");
      out.writes_disabled = true;
      out.retryable = (0..updates.len()).collect();
      return Ok(out);
    }

    let mut ordered: Vec<(usize, DeviceUpdate)> = updates.into_iter().enumerate().collect();
    ordered.sort_by_key(|(_, update)| update.timestamp);

    let mut claims = HashMap::new();
    let mut pending = Vec::with_capacity(ordered.len());
    for (index, mut update) in ordered {
      if update.ip.trim().is_empty() {
        warn!(
          index,
          device_id = update.device_id.as_deref().unwrap_or_default(),
          source = %update.source,
          "skipping device update without ip"
        );
        out.report.reject(index, update.ip_device_id(), ValidationError::IpMissing);
        continue;
      }
      let device_id = self.resolve(&update, &mut claims, &mut out.merges).await?;
      debug!(index, device_id = %device_id, ip = %update.ip, "resolved device update");
      update.device_id = Some(device_id);
      pending.push(Pending { index, update });
    }

    let policy = self.batching.retry_policy();
    let store = &*self.store;
    for batch in pack_batches(
      pending,
      self.batching.max_batch_bytes,
      self.batching.max_batch_rows,
    ) {
      let updates: Vec<DeviceUpdate> = batch.iter().map(|p| p.update.clone()).collect();
      let applied = with_retry(policy, "apply_device_updates", move || {
        store.apply_device_updates(updates.clone())
      })
      .await;
      let applied = match applied {
        Ok(applied) => applied,
        Err(e) if e.is_retryable() => {
          warn!(updates = batch.len(), error = %e, "device batch failed, leaving it for retry");
          out.retryable.extend(batch.iter().map(|p| p.index));
          continue;
        }
        Err(e) => return Err(e),
      };

      let landed = absorb(&mut out, &batch, applied);
      self.write_identifiers(&mut out, &landed).await?;
    }

    out.retryable.sort_unstable();
    out.retryable.dedup();
    info!(
      accepted = out.report.accepted,
      rejected = out.report.rejected.len(),
      retryable = out.retryable.len(),
      merges = out.merges.len(),
      "ingested device updates"
    );
    Ok(out)
  }

  // ── Identity resolution ─────────────────────────────────────────────────

  async fn resolve(
    &self,
    update: &DeviceUpdate,
    claims: &mut HashMap<(&'static str, String), String>,
    merges: &mut Vec<MergeAuditEvent>,
  ) -> Result<String> {
    let strong = update.strong_identifiers();

    let mut owner = None;
    for (id_type, id_value) in &strong {
      if let Some(device_id) = claims.get(&(*id_type, id_value.clone())) {
        owner = Some((*id_type, id_value.clone(), device_id.clone()));
        break;
      }
      if let Some(found) = self.strong_owner(id_type, id_value).await? {
        owner = Some((*id_type, id_value.clone(), self.root_of(found.device_id).await?));
        break;
      }
    }

    let device_id = match (update.resolved_id(), owner) {
      (Some(explicit), Some((id_type, id_value, owner_id))) => {
        let explicit = self.root_of(explicit.to_owned()).await?;
        if explicit != owner_id {
          self
            .merge_conflict(update, &explicit, &owner_id, id_type, &id_value, merges)
            .await?;
        }
        owner_id
      }
      (Some(explicit), None) => explicit.to_owned(),
      (None, Some((_, _, owner_id))) => owner_id,
      (None, None) => match update.derived_device_id() {
        Some(derived) => self.root_of(derived).await?,
        None => self.resolve_weak(update).await?,
      },
    };

    for key in strong {
      claims.insert(key, device_id.clone());
    }
    Ok(device_id)
  }

  async fn strong_owner(&self, id_type: &str, id_value: &str) -> Result<Option<Identifier>> {
    let store = &*self.store;
    let (id_type, id_value) = (id_type.to_owned(), id_value.to_owned());
    let found = with_retry(self.batching.retry_policy(), "get_identifier", move || {
      store.get_identifier(id_type.clone(), id_value.clone())
    })
    .await?;
    Ok(found.filter(Identifier::is_strong))
  }

  /// Surviving device for `device_id`, or `device_id` itself if unknown.
  async fn root_of(&self, device_id: String) -> Result<String> {
    Ok(
      self
        .device(&device_id, true)
        .await?
        .map_or(device_id, |d| d.device_id),
    )
  }

  async fn device(&self, device_id: &str, resolve: bool) -> Result<Option<CanonicalDevice>> {
    let store = &*self.store;
    let id = device_id.to_owned();
    with_retry(self.batching.retry_policy(), "get_device", move || {
      let id = id.clone();
      async move {
        if resolve {
          store.resolve_device(id).await
        } else {
          store.get_device(id).await
        }
      }
    })
    .await
  }

  async fn alias_owner(&self, kind: AliasKind, value: &str) -> Result<Option<CanonicalDevice>> {
    let store = &*self.store;
    let value = value.to_owned();
    let found = with_retry(self.batching.retry_policy(), "find_device_by_alias", move || {
      store.find_device_by_alias(kind, value.clone())
    })
    .await?;
    let Some(device_id) = found else {
      return Ok(None);
    };
    Ok(
      self
        .device(&device_id, false)
        .await?
        .filter(|d| !d.is_deleted()),
    )
  }

  /// Steps 4 to 7: aliases and the IP.
  async fn resolve_weak(&self, update: &DeviceUpdate) -> Result<String> {
    if let Some(service_id) = update.service_id.as_deref().map(str::trim)
      && !service_id.is_empty()
      && let Some(device) = self.alias_owner(AliasKind::Service, service_id).await?
    {
      return Ok(device.device_id);
    }

    let ip = update.ip.trim().to_owned();
    let store = &*self.store;
    let at_ip = {
      let ip = ip.clone();
      with_retry(self.batching.retry_policy(), "get_devices_by_ip", move || {
        store.get_devices_by_ip(ip.clone())
      })
      .await?
    };
    if let Some(device) = at_ip
      .into_iter()
      .find(|d| may_share_ip(d, update))
    {
      return Ok(device.device_id);
    }

    if let Some(device) = self.alias_owner(AliasKind::Ip, &ip).await?
      && may_share_ip(&device, update)
    {
      return Ok(device.device_id);
    }
    Ok(update.ip_device_id())
  }

  async fn merge_conflict(
    &self,
    update: &DeviceUpdate,
    from: &str,
    to: &str,
    id_type: &'static str,
    id_value: &str,
    merges: &mut Vec<MergeAuditEvent>,
  ) -> Result<()> {
    if self.device(from, false).await?.is_none() {
      debug!(from, to, id_type, "explicit device does not exist yet, using identifier owner");
      return Ok(());
    }

    let confidence = if id_type == ID_TYPE_MAC {
      MAC_CONFLICT_CONFIDENCE
    } else {
      VENDOR_CONFLICT_CONFIDENCE
    };
    let mut details = Metadata::new();
    details.insert("id_type".to_owned(), id_type.to_owned());
    details.insert("id_value".to_owned(), id_value.to_owned());
    details.insert("ip".to_owned(), update.ip.trim().to_owned());
    let merge = NewMergeAudit {
      confidence_score: Some(confidence),
      source: update.source.clone(),
      details,
      ..NewMergeAudit::new(from, to, REASON_STRONG_ID_CONFLICT)
    };

    let store = &*self.store;
    let merged = with_retry(self.batching.retry_policy(), "merge_devices", move || {
      store.merge_devices(merge.clone())
    })
    .await;
    match merged {
      Ok(event) => {
        info!(
          from = %event.from_device_id,
          to = %event.to_device_id,
          id_type,
          confidence,
          "merged devices sharing a strong identifier"
        );
        merges.push(event);
        Ok(())
      }
      Err(e) if e.kind() == ErrorKind::Conflict => {
        warn!(from, to, error = %e, "strong identifier merge refused");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  // ── Identifiers ─────────────────────────────────────────────────────────

  async fn write_identifiers(&self, out: &mut IngestReport, landed: &[Pending]) -> Result<()> {
    let identifiers: Vec<NewIdentifier> = landed.iter().flat_map(derive_identifiers).collect();
    if identifiers.is_empty() {
      return Ok(());
    }

    let policy = self.batching.retry_policy();
    let store = &*self.store;
    let mut offset = out.identifiers.accepted + out.identifiers.rejected.len();
    for batch in pack_batches(
      identifiers,
      self.batching.max_batch_bytes,
      self.batching.max_batch_rows,
    ) {
      let len = batch.len();
      let written = with_retry(policy, "upsert_identifiers", move || {
        store.upsert_identifiers(batch.clone())
      })
      .await;
      match written {
        Ok(report) => out.identifiers.absorb(report, offset),
        Err(e) if e.is_retryable() => {
          // The devices landed; resubmitting the updates rewrites the same
          // identifiers.
          warn!(identifiers = len, error = %e, "identifier batch failed, leaving it for retry");
          out.retryable.extend(landed.iter().map(|p| p.index));
        }
        Err(e) => return Err(e),
      }
      offset += len;
    }
    Ok(())
  }
}

/// Fold one applied batch into `out`; returns the updates that landed, with
/// their final device ids.
fn absorb(out: &mut IngestReport, batch: &[Pending], applied: ApplyReport) -> Vec<Pending> {
  let mut rejected = HashSet::new();
  for r in applied.report.rejected {
    let Some(pending) = batch.get(r.index) else {
      continue;
    };
    rejected.insert(r.index);
    out.report.reject(pending.index, r.key, r.reason);
  }
  out.report.accepted += applied.report.accepted;

  let mut landed = Vec::with_capacity(applied.changes.len());
  let accepted = batch
    .iter()
    .enumerate()
    .filter(|(i, _)| !rejected.contains(i))
    .map(|(_, p)| p);
  for (pending, change) in accepted.zip(applied.changes) {
    out.device_ids[pending.index] = Some(change.device_id.clone());
    let mut update = pending.update.clone();
    update.device_id = Some(change.device_id.clone());
    landed.push(Pending { index: pending.index, update });
    out.changes.push(change);
  }
  landed
}

/// Whether an update without an owned identity may land on `device`, a live
/// device found through the update's IP.
fn may_share_ip(device: &CanonicalDevice, update: &DeviceUpdate) -> bool {
  if device.is_deleted() {
    return false;
  }
  // An IP-derived id from another partition is a different device.
  if let Some(partition) = device
    .device_id
    .strip_suffix(update.ip.trim())
    .and_then(|p| p.strip_suffix(':'))
    && partition != update.partition()
  {
    return false;
  }
  let incoming = update.mac.as_deref().and_then(identifier::normalize_mac);
  match (incoming, device.mac.as_deref()) {
    (Some(incoming), Some(existing)) => incoming.eq_ignore_ascii_case(existing),
    _ => true,
  }
}

/// Strong identifiers at strong confidence, and the IP as a weak one.
fn derive_identifiers(pending: &Pending) -> Vec<NewIdentifier> {
  let update = &pending.update;
  let device_id = update.resolved_id().unwrap_or_default();
  let observed = |id_type: &str, value: String, confidence| NewIdentifier {
    confidence: Some(confidence),
    source: update.source.clone(),
    first_seen: Some(update.timestamp),
    last_seen: Some(update.timestamp),
    ..NewIdentifier::new(device_id, id_type, value)
  };

  let mut out: Vec<NewIdentifier> = update
    .strong_identifiers()
    .into_iter()
    .map(|(id_type, value)| observed(id_type, value, Confidence::Strong))
    .collect();
  let mut ip = observed(ID_TYPE_IP, update.ip.trim().to_owned(), Confidence::Weak);
  ip.metadata.insert("partition".to_owned(), update.partition().to_owned());
  out.push(ip);
  out
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;

  fn device(id: &str, mac: Option<&str>) -> CanonicalDevice {
    let update = DeviceUpdate {
      mac: mac.map(str::to_owned),
      ..DeviceUpdate::new("10.0.0.5", "sweep", Utc::now()).with_device_id(id)
    };
    sightline_core::device::merge_update(None, &update)
      .unwrap()
      .device
  }

  #[test]
  fn ip_sharing_respects_partition_and_mac() {
    let update = DeviceUpdate::new("10.0.0.5", "sweep", Utc::now());
    assert!(may_share_ip(&device("default:10.0.0.5", None), &update));
    assert!(may_share_ip(&device("sr:abc", None), &update));
    assert!(!may_share_ip(&device("lab:10.0.0.5", None), &update));

    let with_mac = DeviceUpdate {
      mac: Some("aa:bb:cc:dd:ee:ff".into()),
      ..update.clone()
    };
    assert!(may_share_ip(&device("a", Some("AA:BB:CC:DD:EE:FF")), &with_mac));
    assert!(!may_share_ip(&device("a", Some("11:22:33:44:55:66")), &with_mac));
  }

  #[test]
  fn identifiers_include_weak_ip() {
    let mut update = DeviceUpdate::new(" 10.0.0.5 ", "armis", Utc::now())
      .with_device_id("dev-1");
    update.mac = Some("aa:bb:cc:dd:ee:ff".into());
    update
      .metadata
      .insert("armis_device_id".into(), "armis-9".into());

    let ids = derive_identifiers(&Pending { index: 0, update });
    let keys: Vec<_> = ids
      .iter()
      .map(|i| (i.id_type.as_str(), i.id_value.as_str(), i.confidence))
      .collect();
    assert_eq!(
      keys,
      vec![
        ("armis_device_id", "armis-9", Some(Confidence::Strong)),
        ("mac", "AA:BB:CC:DD:EE:FF", Some(Confidence::Strong)),
        ("ip", "10.0.0.5", Some(Confidence::Weak)),
      ]
    );
    assert!(ids.iter().all(|i| i.device_id == "dev-1"));
  }
}
