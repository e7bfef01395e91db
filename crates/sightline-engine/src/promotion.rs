//! Periodic promotion of dwelt sightings into canonical devices.
//!
//! A run expires sightings past their TTL, selects active sightings old
//! enough for the shortest configured dwell, evaluates each against its
//! subnet policy, ingests the accepted ones as device updates, and finally
//! marks them promoted. The mark happens last: if it fails, the next run
//! selects the same sightings again and re-applying them is a no-op.
//!
//! Sightings that share `(partition, ip)` are folded deterministically: each
//! becomes an update stamped with the group's newest `last_seen`, applied in
//! descending sighting id order so the smallest id is applied last and its
//! attribution wins.

use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sightline_core::{
  device::DeviceUpdate,
  metadata::Metadata,
  policy::{self, IdentityBasis, PolicyTable, PromotionDecision},
  sighting::{NewSightingEvent, Sighting},
  store::IdentityStore,
  write_gate::WriteCapability,
};
use tracing::{debug, info};

use crate::{Result, config::PromotionConfig, reconcile::Reconciler, retry::with_retry};

pub const PROMOTED_EVENT: &str = "promoted";
pub const PROMOTION_ACTOR: &str = "promotion";

/// Counters for one promotion run, logged at `info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
  pub expired:           u64,
  pub candidates:        usize,
  /// Sightings moved to `promoted` by this run.
  pub promoted:          u64,
  pub waiting:           usize,
  pub blocked_by_policy: usize,
  /// Sightings a shadow run would have promoted.
  pub shadow_ready:      usize,
  pub devices_touched:   usize,
  pub writes_disabled:   bool,
}

/// A sighting accepted for promotion.
struct Ready {
  sighting:  Sighting,
  basis:     IdentityBasis,
  subnet_id: Option<String>,
}

pub struct PromotionEngine<S> {
  reconciler: Reconciler<S>,
  writes:     Arc<dyn WriteCapability>,
  config:     PromotionConfig,
}

impl<S: IdentityStore> PromotionEngine<S> {
  pub fn new(
    reconciler: Reconciler<S>,
    writes: Arc<dyn WriteCapability>,
    config: PromotionConfig,
  ) -> Self {
    Self { reconciler, writes, config }
  }

  pub fn config(&self) -> &PromotionConfig { &self.config }

  /// Run one promotion pass as of `now`.
  pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport> {
    let mut report = RunReport::default();
    if !self.config.enabled {
      debug!("promotion disabled");
      return Ok(report);
    }
    let shadow = self.config.shadow_mode;
    if !shadow && !self.writes.enabled() {
      report.writes_disabled = true;
      info!(writes_disabled = true, "skipping promotion run");
      return Ok(report);
    }

    let store = &**self.reconciler.store();
    let retry = self.reconciler.batching().retry_policy();

    if !shadow {
      report.expired =
        with_retry(retry, "expire_sightings", move || store.expire_sightings(now)).await?;
    }

    let policies =
      with_retry(retry, "list_subnet_policies", move || store.list_subnet_policies()).await?;
    let fallback = self.config.fallback_policy();
    let shortest = policies
      .iter()
      .filter_map(|p| p.promotion_rules.min_persistence_secs)
      .map(policy::dwell_secs)
      .chain([fallback.dwell])
      .min()
      .unwrap_or(fallback.dwell);
    let table = PolicyTable::new(policies, fallback);

    // A dwell past the representable range selects nothing.
    let cutoff = now
      .checked_sub_signed(shortest)
      .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let candidates =
      with_retry(retry, "select_promotable", move || store.select_promotable(cutoff)).await?;
    report.candidates = candidates.len();

    let mut ready = Vec::new();
    for sighting in candidates {
      let effective = table.effective_for(&sighting);
      match policy::evaluate(&sighting, &effective, now) {
        PromotionDecision::Promote(basis) => ready.push(Ready {
          sighting,
          basis,
          subnet_id: effective.subnet_id,
        }),
        PromotionDecision::Wait { until } => {
          report.waiting += 1;
          debug!(sighting_id = %sighting.sighting_id, %until, "sighting still dwelling");
        }
        PromotionDecision::Blocked(reason) => {
          report.blocked_by_policy += 1;
          debug!(
            sighting_id = %sighting.sighting_id,
            ip = %sighting.ip,
            %reason,
            "promotion blocked by subnet policy"
          );
        }
      }
    }

    if shadow {
      report.shadow_ready = ready.len();
      log_run(&report, true);
      return Ok(report);
    }
    if ready.is_empty() {
      log_run(&report, false);
      return Ok(report);
    }

    let planned = plan(ready);
    let updates = planned.iter().map(|r| to_update(&r.sighting)).collect();
    let ingest = self.reconciler.ingest(updates).await?;
    if ingest.writes_disabled {
      report.writes_disabled = true;
      log_run(&report, false);
      return Ok(report);
    }

    let mut promoted_ids = Vec::new();
    let mut events = Vec::new();
    let mut devices = BTreeSet::new();
    for (index, r) in planned.iter().enumerate() {
      let Some(device_id) = ingest.landed(index) else {
        continue;
      };
      devices.insert(device_id.to_owned());
      promoted_ids.push(r.sighting.sighting_id);
      events.push(promoted_event(r, device_id, now));
    }
    report.devices_touched = devices.len();

    if !promoted_ids.is_empty() {
      report.promoted = with_retry(retry, "mark_promoted", move || {
        store.mark_promoted(promoted_ids.clone())
      })
      .await?;
      with_retry(retry, "record_sighting_events", move || {
        store.record_sighting_events(events.clone())
      })
      .await?;
    }

    log_run(&report, false);
    Ok(report)
  }
}

fn log_run(report: &RunReport, shadow: bool) {
  info!(
    shadow,
    expired = report.expired,
    candidates = report.candidates,
    promoted = report.promoted,
    waiting = report.waiting,
    blocked_by_policy = report.blocked_by_policy,
    shadow_ready = report.shadow_ready,
    devices_touched = report.devices_touched,
    writes_disabled = report.writes_disabled,
    "promotion run complete"
  );
}

/// Order accepted sightings for ingest.
///
/// Groups by `(partition, ip)`; within a group every member is stamped with
/// the newest `last_seen` and members are ordered by descending sighting id.
fn plan(ready: Vec<Ready>) -> Vec<Ready> {
  let mut groups: BTreeMap<(String, String), Vec<Ready>> = BTreeMap::new();
  for r in ready {
    let key = (r.sighting.partition.clone(), r.sighting.ip.clone());
    groups.entry(key).or_default().push(r);
  }

  let mut out = Vec::new();
  for (_, mut members) in groups {
    let newest = members
      .iter()
      .map(|r| r.sighting.last_seen)
      .max()
      .unwrap_or_else(Utc::now);
    members.sort_by(|a, b| b.sighting.sighting_id.cmp(&a.sighting.sighting_id));
    for mut r in members {
      r.sighting.last_seen = newest;
      out.push(r);
    }
  }
  out
}

fn to_update(sighting: &Sighting) -> DeviceUpdate {
  let meta = |key: &str| sighting.meta(key).map(str::to_owned);
  let mut update = DeviceUpdate::new(&sighting.ip, &sighting.source, sighting.last_seen);
  update.partition = sighting.partition.clone();
  update.hostname = meta("hostname");
  update.mac = meta("mac");
  update.agent_id = meta("agent_id");
  update.poller_id = meta("poller_id");
  update.metadata = sighting.metadata.clone();
  if let Some(fingerprint) = &sighting.fingerprint_id {
    update
      .metadata
      .insert("fingerprint_id".to_owned(), fingerprint.clone());
  }
  if let Some(subnet) = &sighting.subnet_id {
    update.metadata.insert("subnet_id".to_owned(), subnet.clone());
  }
  update
}

fn basis_label(basis: &IdentityBasis) -> &'static str {
  match basis {
    IdentityBasis::Strong { id_type, .. } => *id_type,
    IdentityBasis::IpOnly => "ip",
  }
}

fn promoted_event(r: &Ready, device_id: &str, now: DateTime<Utc>) -> NewSightingEvent {
  let mut details = Metadata::new();
  details.insert("basis".to_owned(), basis_label(&r.basis).to_owned());
  if let Some(subnet) = &r.subnet_id {
    details.insert("subnet_id".to_owned(), subnet.clone());
  }
  NewSightingEvent {
    sighting_id: r.sighting.sighting_id,
    device_id:   Some(device_id.to_owned()),
    event_type:  PROMOTED_EVENT.to_owned(),
    actor:       Some(PROMOTION_ACTOR.to_owned()),
    details,
    created_at:  Some(now),
  }
}

#[cfg(test)]
mod tests {
  use chrono::Duration;
  use sightline_core::sighting::NewSighting;
  use uuid::Uuid;

  use super::*;

  fn ready(ip: &str, source: &str, last_seen: DateTime<Utc>) -> Ready {
    Ready {
      sighting:  NewSighting::new(ip, source, last_seen).into_sighting(Uuid::new_v4()),
      basis:     IdentityBasis::IpOnly,
      subnet_id: None,
    }
  }

  #[test]
  fn plan_puts_smallest_id_last_in_group() {
    let t0 = Utc::now();
    let planned = plan(vec![
      ready("10.0.0.5", "sweep", t0),
      ready("10.0.0.6", "sweep", t0),
      ready("10.0.0.5", "snmp", t0 + Duration::minutes(5)),
    ]);

    let group: Vec<_> = planned.iter().filter(|r| r.sighting.ip == "10.0.0.5").collect();
    assert_eq!(group.len(), 2);
    assert!(group[0].sighting.sighting_id > group[1].sighting.sighting_id);
    assert!(group.iter().all(|r| r.sighting.last_seen == t0 + Duration::minutes(5)));

    let other = planned.iter().find(|r| r.sighting.ip == "10.0.0.6").unwrap();
    assert_eq!(other.sighting.last_seen, t0);
  }

  #[test]
  fn update_carries_sighting_attribution() {
    let mut s = NewSighting::new("10.0.0.5", "sweep", Utc::now()).into_sighting(Uuid::new_v4());
    s.partition = "lab".into();
    s.fingerprint_id = Some("fp-1".into());
    s.metadata.insert("hostname".into(), " edge-1 ".into());

    let update = to_update(&s);
    assert_eq!(update.ip_device_id(), "lab:10.0.0.5");
    assert_eq!(update.hostname.as_deref(), Some("edge-1"));
    assert_eq!(update.metadata.get("fingerprint_id").map(String::as_str), Some("fp-1"));
    assert!(update.device_id.is_none());
  }
}
