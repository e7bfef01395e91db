//! End-to-end tests for the engine against an in-memory SQLite store.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sightline_core::{
  ValidationError,
  alias::AliasKind,
  audit::{REASON_SOFT_DELETE, REASON_STRONG_ID_CONFLICT},
  device::DeviceUpdate,
  identifier::{Confidence, ID_TYPE_MAC, derived_device_id},
  policy::{NewSubnetPolicy, PromotionRules},
  sighting::{NewSighting, SightingQuery, SightingStatus},
  store::IdentityStore,
  write_gate::{StaticCapability, ToggleCapability, WriteCapability},
};
use sightline_store_sqlite::SqliteStore;
use tracing_test::traced_test;

use crate::{
  PromotionEngine, Reaper, Reconciler,
  config::{BatchingConfig, PromotionConfig, ReaperConfig},
  reaper::REAPER_SOURCE,
};

async fn store() -> Arc<SqliteStore> {
  Arc::new(
    SqliteStore::open_in_memory()
      .await
      .expect("in-memory store"),
  )
}

fn open() -> Arc<dyn WriteCapability> { Arc::new(StaticCapability(true)) }

fn reconciler(store: &Arc<SqliteStore>, writes: Arc<dyn WriteCapability>) -> Reconciler<SqliteStore> {
  Reconciler::new(Arc::clone(store), writes, BatchingConfig::default())
}

fn engine(
  store: &Arc<SqliteStore>,
  writes: Arc<dyn WriteCapability>,
  config: PromotionConfig,
) -> PromotionEngine<SqliteStore> {
  PromotionEngine::new(reconciler(store, Arc::clone(&writes)), writes, config)
}

fn allow_ip() -> PromotionConfig {
  PromotionConfig { default_allow_ip_as_id: true, ..Default::default() }
}

async fn sighting_at(
  store: &SqliteStore,
  ip: &str,
  source: &str,
  at: DateTime<Utc>,
) -> sightline_core::sighting::Sighting {
  store
    .record_sighting(NewSighting::new(ip, source, at))
    .await
    .unwrap()
}

// ─── Promotion ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn sighting_promotes_after_dwell() {
  let s = store().await;
  s.upsert_subnet_policy(NewSubnetPolicy {
    allow_ip_as_id: true,
    promotion_rules: PromotionRules {
      min_persistence_secs: Some(3600),
      ..Default::default()
    },
    ..NewSubnetPolicy::new("office", "10.0.0.0/24")
  })
  .await
  .unwrap();

  let t0 = Utc::now() - Duration::hours(2);
  let sighting = sighting_at(&s, "10.0.0.5", "sweep", t0).await;
  let now = t0 + Duration::hours(2);

  let selected = s.select_promotable(now - Duration::hours(1)).await.unwrap();
  assert!(selected.iter().any(|c| c.sighting_id == sighting.sighting_id));

  let report = engine(&s, open(), PromotionConfig::default())
    .run_once(now)
    .await
    .unwrap();
  assert_eq!(report.candidates, 1);
  assert_eq!(report.promoted, 1);
  assert_eq!(report.devices_touched, 1);
  assert_eq!(report.blocked_by_policy, 0);

  let active = s
    .list_sightings(SightingQuery {
      status: Some(SightingStatus::Active),
      ..Default::default()
    })
    .await
    .unwrap();
  assert!(active.is_empty());
  let fetched = s.get_sighting(sighting.sighting_id).await.unwrap().unwrap();
  assert_eq!(fetched.status, SightingStatus::Promoted);

  let device = s
    .get_device("default:10.0.0.5".into())
    .await
    .unwrap()
    .unwrap();
  assert!(device.discovery_sources.contains("sweep"));
  assert_eq!(device.last_seen, t0);

  let events = s
    .list_sighting_events(sighting.sighting_id, None)
    .await
    .unwrap();
  assert_eq!(events.len(), 1);
  assert_eq!(events[0].event_type, "promoted");
  assert_eq!(events[0].device_id.as_deref(), Some("default:10.0.0.5"));
  assert_eq!(events[0].details.get("subnet_id").map(String::as_str), Some("office"));
}

#[tokio::test]
async fn promotion_is_idempotent() {
  let s = store().await;
  let t0 = Utc::now() - Duration::hours(2);
  let sighting = sighting_at(&s, "10.0.0.6", "sweep", t0).await;
  let engine = engine(&s, open(), allow_ip());

  let first = engine.run_once(Utc::now()).await.unwrap();
  let second = engine.run_once(Utc::now()).await.unwrap();
  assert_eq!(first.promoted, 1);
  assert_eq!(second.candidates, 0);
  assert_eq!(second.promoted, 0);

  assert_eq!(s.list_devices(10, 0).await.unwrap().len(), 1);
  let events = s
    .list_sighting_events(sighting.sighting_id, None)
    .await
    .unwrap();
  assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn rerun_after_unmarked_promotion_is_a_no_op_merge() {
  let s = store().await;
  let t0 = Utc::now() - Duration::hours(2);
  sighting_at(&s, "10.0.0.7", "sweep", t0).await;

  // A previous run wrote the device but never marked the sighting.
  reconciler(&s, open())
    .ingest(vec![DeviceUpdate::new("10.0.0.7", "sweep", t0)])
    .await
    .unwrap();
  let before = s
    .get_device("default:10.0.0.7".into())
    .await
    .unwrap()
    .unwrap();

  let report = engine(&s, open(), allow_ip())
    .run_once(Utc::now())
    .await
    .unwrap();
  assert_eq!(report.promoted, 1);
  assert_eq!(report.devices_touched, 1);

  let after = s
    .get_device("default:10.0.0.7".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(after, before);
  assert_eq!(s.list_devices(10, 0).await.unwrap().len(), 1);
  assert_eq!(s.count_active_sightings(None).await.unwrap(), 0);
}

#[tokio::test]
async fn disabled_writes_defer_everything() {
  let s = store().await;
  sighting_at(&s, "10.0.0.8", "sweep", Utc::now() - Duration::hours(2)).await;

  let gate = ToggleCapability::new(false);
  let writes: Arc<dyn WriteCapability> = Arc::new(gate.clone());
  let engine = engine(&s, Arc::clone(&writes), allow_ip());

  let report = engine.run_once(Utc::now()).await.unwrap();
  assert!(report.writes_disabled);
  assert_eq!(report.promoted, 0);
  assert_eq!(s.count_active_sightings(None).await.unwrap(), 1);
  assert!(s.list_devices(10, 0).await.unwrap().is_empty());

  let ingest = reconciler(&s, writes)
    .ingest(vec![DeviceUpdate::new("10.0.0.8", "sweep", Utc::now())])
    .await
    .unwrap();
  assert!(ingest.writes_disabled);
  assert_eq!(ingest.retryable, vec![0]);
  assert!(!ingest.is_complete());

  gate.set(true);
  let report = engine.run_once(Utc::now()).await.unwrap();
  assert!(!report.writes_disabled);
  assert_eq!(report.promoted, 1);
}

#[tokio::test]
async fn ip_only_needs_policy_but_strong_identity_does_not() {
  let s = store().await;
  let t0 = Utc::now() - Duration::hours(2);
  let bare = sighting_at(&s, "10.1.0.5", "sweep", t0).await;

  let mut with_mac = NewSighting::new("10.1.0.6", "sweep", t0);
  with_mac
    .metadata
    .insert("mac".into(), "aa:bb:cc:dd:ee:01".into());
  let with_mac = s.record_sighting(with_mac).await.unwrap();

  let report = engine(&s, open(), PromotionConfig::default())
    .run_once(Utc::now())
    .await
    .unwrap();
  assert_eq!(report.candidates, 2);
  assert_eq!(report.blocked_by_policy, 1);
  assert_eq!(report.promoted, 1);

  let still = s.get_sighting(bare.sighting_id).await.unwrap().unwrap();
  assert_eq!(still.status, SightingStatus::Active);

  let mac = s
    .get_identifier("mac".into(), "AA:BB:CC:DD:EE:01".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(mac.confidence, Confidence::Strong);
  let expected = derived_device_id("default", &[(ID_TYPE_MAC, "AA:BB:CC:DD:EE:01".to_owned())]);
  assert_eq!(Some(mac.device_id), expected);
  assert!(
    s.get_device("default:10.1.0.6".into())
      .await
      .unwrap()
      .is_none()
  );

  let events = s
    .list_sighting_events(with_mac.sighting_id, None)
    .await
    .unwrap();
  assert_eq!(events[0].details.get("basis").map(String::as_str), Some("mac"));
}

#[tokio::test]
async fn young_sightings_wait() {
  let s = store().await;
  sighting_at(&s, "10.0.0.10", "sweep", Utc::now() - Duration::minutes(90)).await;
  s.upsert_subnet_policy(NewSubnetPolicy {
    allow_ip_as_id: true,
    promotion_rules: PromotionRules {
      min_persistence_secs: Some(4 * 3600),
      ..Default::default()
    },
    ..NewSubnetPolicy::new("slow", "10.0.0.0/24")
  })
  .await
  .unwrap();

  let report = engine(&s, open(), allow_ip())
    .run_once(Utc::now())
    .await
    .unwrap();
  assert_eq!(report.candidates, 1);
  assert_eq!(report.waiting, 1);
  assert_eq!(report.promoted, 0);
}

#[tokio::test]
async fn shadow_mode_counts_without_writing() {
  let s = store().await;
  sighting_at(&s, "10.0.0.11", "sweep", Utc::now() - Duration::hours(2)).await;

  let config = PromotionConfig { shadow_mode: true, ..allow_ip() };
  let report = engine(&s, Arc::new(StaticCapability(false)), config)
    .run_once(Utc::now())
    .await
    .unwrap();
  assert_eq!(report.shadow_ready, 1);
  assert_eq!(report.promoted, 0);
  assert!(!report.writes_disabled);
  assert_eq!(s.count_active_sightings(None).await.unwrap(), 1);
  assert!(s.list_devices(10, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn same_ip_sightings_fold_with_smallest_id_winning() {
  let s = store().await;
  let t0 = Utc::now() - Duration::hours(2);

  let mut ids = Vec::new();
  for (source, hostname) in [("sweep", "alpha"), ("snmp", "beta")] {
    let mut sighting = NewSighting::new("10.0.0.9", source, t0);
    sighting.metadata.insert("hostname".into(), hostname.into());
    let recorded = s.record_sighting(sighting).await.unwrap();
    ids.push((recorded.sighting_id, hostname));
  }
  ids.sort();
  let winner = ids[0].1;

  let report = engine(&s, open(), allow_ip())
    .run_once(Utc::now())
    .await
    .unwrap();
  assert_eq!(report.promoted, 2);
  assert_eq!(report.devices_touched, 1);

  let device = s
    .get_device("default:10.0.0.9".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(device.hostname.as_deref(), Some(winner));
  assert_eq!(
    device.discovery_sources.iter().collect::<Vec<_>>(),
    vec!["snmp", "sweep"]
  );
}

// ─── Ingest ──────────────────────────────────────────────────────────────────

#[tokio::test]
#[traced_test]
async fn ingest_orders_by_timestamp_and_reports_by_input_position() {
  let s = store().await;
  let t0 = Utc::now() - Duration::minutes(10);

  let mut late = DeviceUpdate::new("10.0.2.1", "snmp", t0 + Duration::minutes(1))
    .with_device_id("dev-x");
  late.hostname = Some("new-name".into());
  let mut early = DeviceUpdate::new("10.0.2.1", "sweep", t0).with_device_id("dev-x");
  early.hostname = Some("old-name".into());
  let blank = DeviceUpdate::new(" ", "sweep", t0);

  let report = reconciler(&s, open())
    .ingest(vec![late, blank, early])
    .await
    .unwrap();
  assert_eq!(report.report.accepted, 2);
  assert_eq!(report.report.rejected.len(), 1);
  assert_eq!(report.report.rejected[0].index, 1);
  assert_eq!(report.report.rejected[0].reason, ValidationError::IpMissing);
  assert_eq!(report.landed(0), Some("dev-x"));
  assert_eq!(report.landed(1), None);
  assert_eq!(report.landed(2), Some("dev-x"));
  assert!(logs_contain("skipping device update without ip"));

  let device = s.get_device("dev-x".into()).await.unwrap().unwrap();
  assert_eq!(device.hostname.as_deref(), Some("new-name"));
  assert_eq!(device.last_seen, t0 + Duration::minutes(1));
  assert_eq!(device.discovery_sources.len(), 2);

  let ip = s
    .get_identifier("ip".into(), "10.0.2.1".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(ip.confidence, Confidence::Weak);
  assert_eq!(ip.device_id, "dev-x");
}

#[tokio::test]
async fn service_alias_keeps_identity_across_churn() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  let mut first = DeviceUpdate::new("10.0.0.8", "agent", t0).with_device_id("sr:host-1");
  first.service_id = Some("S1".into());
  let mut second = DeviceUpdate::new("10.0.0.8", "agent", t0 + Duration::minutes(1))
    .with_device_id("sr:host-1");
  second.service_id = Some("S2".into());
  r.ingest(vec![second, first]).await.unwrap();

  let device = s.get_device("sr:host-1".into()).await.unwrap().unwrap();
  let aliases = device.aliases().unwrap();
  assert_eq!(aliases.current_service_id.as_deref(), Some("S2"));
  assert_eq!(aliases.last_use_of(AliasKind::Service, "S1"), Some(t0));

  // An anonymous report from the old service id at a new address.
  let mut stray = DeviceUpdate::new("10.0.0.99", "agent", t0 + Duration::minutes(2));
  stray.service_id = Some("S1".into());
  let report = r.ingest(vec![stray]).await.unwrap();
  assert_eq!(report.landed(0), Some("sr:host-1"));
  assert!(
    s.get_device("default:10.0.0.99".into())
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn anonymous_update_joins_live_device_at_ip() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  r.ingest(vec![DeviceUpdate::new("10.0.4.1", "armis", t0).with_device_id("sr:printer")])
    .await
    .unwrap();
  let report = r
    .ingest(vec![DeviceUpdate::new("10.0.4.1", "sweep", t0 + Duration::minutes(1))])
    .await
    .unwrap();
  assert_eq!(report.landed(0), Some("sr:printer"));

  let device = s.get_device("sr:printer".into()).await.unwrap().unwrap();
  assert!(device.discovery_sources.contains("sweep"));
}

#[tokio::test]
async fn shared_mac_merges_explicit_device_into_owner() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  let mut a = DeviceUpdate::new("10.0.1.1", "armis", t0).with_device_id("dev-a");
  a.mac = Some("aa:bb:cc:00:00:01".into());
  r.ingest(vec![a]).await.unwrap();
  r.ingest(vec![DeviceUpdate::new("10.0.1.2", "sweep", t0).with_device_id("dev-b")])
    .await
    .unwrap();

  let mut b = DeviceUpdate::new("10.0.1.2", "sweep", t0 + Duration::minutes(1))
    .with_device_id("dev-b");
  b.mac = Some("AA:BB:CC:00:00:01".into());
  let report = r.ingest(vec![b]).await.unwrap();

  assert_eq!(report.landed(0), Some("dev-a"));
  assert_eq!(report.merges.len(), 1);
  let merge = &report.merges[0];
  assert_eq!(merge.from_device_id, "dev-b");
  assert_eq!(merge.to_device_id, "dev-a");
  assert_eq!(merge.reason, REASON_STRONG_ID_CONFLICT);
  assert_eq!(merge.confidence_score, Some(0.95));

  let b = s.get_device("dev-b".into()).await.unwrap().unwrap();
  assert_eq!(b.merged_into.as_deref(), Some("dev-a"));
  let root = s.resolve_device("dev-b".into()).await.unwrap().unwrap();
  assert_eq!(root.device_id, "dev-a");
  assert!(root.discovery_sources.contains("sweep"));

  let audit = s
    .list_merge_audit_for_device("dev-b".into(), None)
    .await
    .unwrap();
  assert_eq!(audit.len(), 1);
}

#[tokio::test]
async fn different_macs_at_a_reused_ip_stay_apart() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);
  let at = |ip: &str, mac: &str, minutes: i64| {
    let mut update = DeviceUpdate::new(ip, "sweep", t0 + Duration::minutes(minutes));
    update.mac = Some(mac.into());
    update
  };

  let first = r.ingest(vec![at("10.0.0.5", "aa:aa:aa:aa:aa:aa", 0)]).await.unwrap();
  let moved = r.ingest(vec![at("10.0.0.9", "aa:aa:aa:aa:aa:aa", 1)]).await.unwrap();
  let other = r.ingest(vec![at("10.0.0.5", "bb:bb:bb:bb:bb:bb", 2)]).await.unwrap();

  let a = first.landed(0).unwrap().to_owned();
  assert!(a.starts_with("sr:"));
  assert_eq!(moved.landed(0), Some(a.as_str()));
  let b = other.landed(0).unwrap();
  assert_ne!(b, a);
  assert!(other.merges.is_empty());

  let a = s.get_device(a).await.unwrap().unwrap();
  assert_eq!(a.mac.as_deref(), Some("AA:AA:AA:AA:AA:AA"));
  assert_eq!(a.ip, "10.0.0.9");
  let b = s.get_device(b.to_owned()).await.unwrap().unwrap();
  assert_eq!(b.mac.as_deref(), Some("BB:BB:BB:BB:BB:BB"));
  assert!(
    s.get_device("default:10.0.0.5".into())
      .await
      .unwrap()
      .is_none()
  );
}

#[tokio::test]
async fn old_ip_alias_serves_anonymous_but_not_other_macs() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  // A device known by explicit id moves away from 10.0.0.20.
  let mut first = DeviceUpdate::new("10.0.0.20", "agent", t0).with_device_id("sr:cam");
  first.mac = Some("cc:cc:cc:cc:cc:cc".into());
  let mut moved = DeviceUpdate::new("10.0.0.21", "agent", t0 + Duration::minutes(1))
    .with_device_id("sr:cam");
  moved.mac = Some("cc:cc:cc:cc:cc:cc".into());
  r.ingest(vec![first, moved]).await.unwrap();

  // An anonymous report at the old address still follows the IP alias.
  let anonymous = r
    .ingest(vec![DeviceUpdate::new("10.0.0.20", "sweep", t0 + Duration::minutes(2))])
    .await
    .unwrap();
  assert_eq!(anonymous.landed(0), Some("sr:cam"));

  // A different MAC at the old address is its own device.
  let mut stranger = DeviceUpdate::new("10.0.0.20", "sweep", t0 + Duration::minutes(3));
  stranger.mac = Some("dd:dd:dd:dd:dd:dd".into());
  let stranger = r.ingest(vec![stranger]).await.unwrap();
  assert_ne!(stranger.landed(0), Some("sr:cam"));
  let cam = s.get_device("sr:cam".into()).await.unwrap().unwrap();
  assert_eq!(cam.mac.as_deref(), Some("CC:CC:CC:CC:CC:CC"));
}

#[tokio::test]
async fn vendor_id_owner_outranks_mac_owner() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  let mut by_mac = DeviceUpdate::new("10.0.7.1", "sweep", t0).with_device_id("dev-mac");
  by_mac.mac = Some("ee:ee:ee:ee:ee:01".into());
  let mut by_armis = DeviceUpdate::new("10.0.7.2", "armis", t0).with_device_id("dev-armis");
  by_armis
    .metadata
    .insert("armis_device_id".into(), "armis-77".into());
  r.ingest(vec![by_mac, by_armis]).await.unwrap();

  let mut both = DeviceUpdate::new("10.0.7.3", "armis", t0 + Duration::minutes(1));
  both.mac = Some("EE:EE:EE:EE:EE:01".into());
  both
    .metadata
    .insert("armis_device_id".into(), "armis-77".into());
  let report = r.ingest(vec![both]).await.unwrap();
  assert_eq!(report.landed(0), Some("dev-armis"));

  let mut by_netbox = DeviceUpdate::new("10.0.7.4", "netbox", t0).with_device_id("dev-nb");
  by_netbox
    .metadata
    .insert("netbox_device_id".into(), "nb-4".into());
  let mut by_integration = DeviceUpdate::new("10.0.7.5", "crm", t0).with_device_id("dev-int");
  by_integration
    .metadata
    .insert("integration_id".into(), "crm-4".into());
  r.ingest(vec![by_netbox, by_integration]).await.unwrap();

  let mut both = DeviceUpdate::new("10.0.7.6", "crm", t0 + Duration::minutes(2));
  both
    .metadata
    .insert("netbox_device_id".into(), "nb-4".into());
  both
    .metadata
    .insert("integration_id".into(), "crm-4".into());
  let report = r.ingest(vec![both]).await.unwrap();
  assert_eq!(report.landed(0), Some("dev-int"));
  let owner = s
    .get_identifier("integration_id".into(), "crm-4".into())
    .await
    .unwrap()
    .unwrap();
  assert_eq!(owner.confidence, Confidence::Strong);
}

#[tokio::test]
async fn unknown_explicit_id_defers_to_identifier_owner() {
  let s = store().await;
  let r = reconciler(&s, open());
  let t0 = Utc::now() - Duration::minutes(10);

  let mut a = DeviceUpdate::new("10.0.5.1", "netbox", t0).with_device_id("dev-a");
  a.metadata
    .insert("netbox_device_id".into(), "nb-42".into());
  let mut b = DeviceUpdate::new("10.0.5.2", "netbox", t0 + Duration::minutes(1))
    .with_device_id("dev-new");
  b.metadata
    .insert("netbox_device_id".into(), "nb-42".into());

  // Both in one call: the second sees the first's claim before it commits.
  let report = r.ingest(vec![a, b]).await.unwrap();
  assert_eq!(report.landed(1), Some("dev-a"));
  assert!(report.merges.is_empty());
  assert!(s.get_device("dev-new".into()).await.unwrap().is_none());
}

// ─── Reaper ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reaper_soft_deletes_stale_ip_only_then_purges() {
  let s = store().await;
  let r = reconciler(&s, open());
  let old = Utc::now() - Duration::days(3);

  let mut with_mac = DeviceUpdate::new("10.0.3.2", "sweep", old);
  with_mac.mac = Some("aa:aa:aa:aa:aa:02".into());
  r.ingest(vec![
    DeviceUpdate::new("10.0.3.1", "sweep", old),
    with_mac,
    DeviceUpdate::new("10.0.3.3", "sweep", Utc::now()),
  ])
  .await
  .unwrap();

  let config = ReaperConfig {
    ip_only_ttl_secs: 24 * 3600,
    retention_secs: 0,
    ..Default::default()
  };
  let reaper = Reaper::new(
    Arc::clone(&s),
    open(),
    config.clone(),
    BatchingConfig::default().retry_policy(),
  );

  let report = reaper.run_once().await.unwrap();
  assert_eq!(report.soft_deleted, 1);
  assert_eq!(report.purged, 0);

  let stale = s
    .get_device("default:10.0.3.1".into())
    .await
    .unwrap()
    .unwrap();
  assert!(stale.is_deleted());
  let audit = s
    .list_merge_audit_for_device("default:10.0.3.1".into(), None)
    .await
    .unwrap();
  assert_eq!(audit[0].reason, REASON_SOFT_DELETE);
  assert_eq!(audit[0].source, REAPER_SOURCE);

  // Already deleted devices are not picked again.
  assert_eq!(reaper.run_once().await.unwrap().soft_deleted, 0);

  let purge = Reaper::new(
    Arc::clone(&s),
    open(),
    ReaperConfig { retention_secs: 2 * 24 * 3600, ..config },
    BatchingConfig::default().retry_policy(),
  );
  assert_eq!(purge.run_once().await.unwrap().purged, 2);
  let left: Vec<_> = s
    .list_devices(10, 0)
    .await
    .unwrap()
    .into_iter()
    .map(|d| d.device_id)
    .collect();
  assert_eq!(left, vec!["default:10.0.3.3".to_owned()]);

  let gated = Reaper::new(
    Arc::clone(&s),
    Arc::new(StaticCapability(false)),
    ReaperConfig::default(),
    BatchingConfig::default().retry_policy(),
  );
  assert!(gated.run_once().await.unwrap().writes_disabled);
}

#[tokio::test]
async fn fresh_evidence_revives_soft_deleted_device() {
  let s = store().await;
  let r = reconciler(&s, open());
  r.ingest(vec![DeviceUpdate::new("10.0.6.1", "sweep", Utc::now() - Duration::days(2))])
    .await
    .unwrap();
  s.soft_delete_devices(vec!["default:10.0.6.1".into()], REAPER_SOURCE.into())
    .await
    .unwrap();

  let report = r
    .ingest(vec![
      DeviceUpdate::new("10.0.6.1", "sweep", Utc::now()).with_device_id("default:10.0.6.1"),
    ])
    .await
    .unwrap();
  assert!(report.is_complete());
  let device = s
    .get_device("default:10.0.6.1".into())
    .await
    .unwrap()
    .unwrap();
  assert!(!device.is_deleted());
  assert!(device.is_available);
}
