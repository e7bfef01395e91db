//! Subnet policies and the promotion decision.
//!
//! Policies are written by operators and only read here. A sighting is matched
//! to a policy by its `subnet_id`, or failing that by the longest CIDR prefix
//! containing its IP.

use std::{fmt, net::IpAddr, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ValidationError, identifier, sighting::Sighting};

// ─── Rules ───────────────────────────────────────────────────────────────────

/// The recognised keys of a policy's `promotion_rules` JSON object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionRules {
  /// Dwell time override; sightings younger than this wait.
  pub min_persistence_secs: Option<i64>,
  pub require_hostname:     bool,
  pub require_fingerprint:  bool,
}

// ─── SubnetPolicy ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetPolicy {
  pub subnet_id:       String,
  pub cidr:            Cidr,
  pub classification:  String,
  pub promotion_rules: PromotionRules,
  pub reaper_profile:  String,
  pub allow_ip_as_id:  bool,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

/// Input to [`crate::store::IdentityStore::upsert_subnet_policy`].
#[derive(Debug, Clone)]
pub struct NewSubnetPolicy {
  pub subnet_id:       String,
  pub cidr:            String,
  pub classification:  String,
  pub promotion_rules: PromotionRules,
  pub reaper_profile:  String,
  pub allow_ip_as_id:  bool,
}

impl NewSubnetPolicy {
  pub fn new(subnet_id: impl Into<String>, cidr: impl Into<String>) -> Self {
    Self {
      subnet_id:       subnet_id.into(),
      cidr:            cidr.into(),
      classification:  String::new(),
      promotion_rules: PromotionRules::default(),
      reaper_profile:  "default".to_owned(),
      allow_ip_as_id:  false,
    }
  }

  pub fn validate(self, now: DateTime<Utc>) -> Result<SubnetPolicy, ValidationError> {
    let subnet_id = self.subnet_id.trim().to_owned();
    if subnet_id.is_empty() {
      return Err(ValidationError::SubnetIdMissing);
    }
    Ok(SubnetPolicy {
      subnet_id,
      cidr: self.cidr.parse()?,
      classification: self.classification,
      promotion_rules: self.promotion_rules,
      reaper_profile: self.reaper_profile,
      allow_ip_as_id: self.allow_ip_as_id,
      created_at: now,
      updated_at: now,
    })
  }
}

// ─── Cidr ────────────────────────────────────────────────────────────────────

/// An IPv4 or IPv6 network in `addr/prefix` notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
  network: IpAddr,
  prefix:  u8,
}

impl Cidr {
  pub fn prefix(&self) -> u8 { self.prefix }

  pub fn contains(&self, ip: IpAddr) -> bool {
    match (self.network, ip) {
      (IpAddr::V4(net), IpAddr::V4(addr)) => {
        let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
        u32::from(net) & mask == u32::from(addr) & mask
      }
      (IpAddr::V6(net), IpAddr::V6(addr)) => {
        let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
        u128::from(net) & mask == u128::from(addr) & mask
      }
      _ => false,
    }
  }
}

impl FromStr for Cidr {
  type Err = ValidationError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || ValidationError::InvalidCidr(s.to_owned());
    let s = s.trim();
    let (addr, prefix) = match s.split_once('/') {
      Some((addr, prefix)) => (addr, Some(prefix)),
      None => (s, None),
    };
    let network: IpAddr = addr.parse().map_err(|_| invalid())?;
    let max = if network.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
      Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
      None => max,
    };
    if prefix > max {
      return Err(invalid());
    }
    Ok(Self { network, prefix })
  }
}

impl TryFrom<String> for Cidr {
  type Error = ValidationError;

  fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<Cidr> for String {
  fn from(c: Cidr) -> Self { c.to_string() }
}

impl fmt::Display for Cidr {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.network, self.prefix)
  }
}

// ─── Effective policy ────────────────────────────────────────────────────────

/// The rules that apply to one sighting after lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
  /// `None` when the configured default applies.
  pub subnet_id:      Option<String>,
  pub allow_ip_as_id: bool,
  pub dwell:          Duration,
  pub rules:          PromotionRules,
}

/// Snapshot of all subnet policies plus the configured fallback.
#[derive(Debug, Clone)]
pub struct PolicyTable {
  policies: Vec<SubnetPolicy>,
  fallback: EffectivePolicy,
}

impl PolicyTable {
  pub fn new(mut policies: Vec<SubnetPolicy>, fallback: EffectivePolicy) -> Self {
    // Longest prefix first so the first CIDR hit is the most specific.
    policies.sort_by(|a, b| {
      b.cidr
        .prefix()
        .cmp(&a.cidr.prefix())
        .then_with(|| a.subnet_id.cmp(&b.subnet_id))
    });
    Self { policies, fallback }
  }

  pub fn len(&self) -> usize { self.policies.len() }

  pub fn is_empty(&self) -> bool { self.policies.is_empty() }

  pub fn lookup(&self, sighting: &Sighting) -> Option<&SubnetPolicy> {
    if let Some(subnet_id) = sighting.subnet_id.as_deref()
      && let Some(p) = self.policies.iter().find(|p| p.subnet_id == subnet_id)
    {
      return Some(p);
    }
    let ip: IpAddr = sighting.ip.parse().ok()?;
    self.policies.iter().find(|p| p.cidr.contains(ip))
  }

  pub fn effective_for(&self, sighting: &Sighting) -> EffectivePolicy {
    match self.lookup(sighting) {
      Some(p) => EffectivePolicy {
        subnet_id:      Some(p.subnet_id.clone()),
        allow_ip_as_id: p.allow_ip_as_id,
        dwell:          p
          .promotion_rules
          .min_persistence_secs
          .map(dwell_secs)
          .unwrap_or(self.fallback.dwell),
        rules:          p.promotion_rules.clone(),
      },
      None => self.fallback.clone(),
    }
  }
}

/// A dwell of `secs` seconds. Negative values count as zero; values past
/// chrono's range saturate, and such a dwell never elapses.
pub fn dwell_secs(secs: i64) -> Duration {
  Duration::try_seconds(secs.max(0)).unwrap_or(Duration::MAX)
}

// ─── Decision ────────────────────────────────────────────────────────────────

/// What a promoted sighting's identity rests on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityBasis {
  Strong { id_type: &'static str, id_value: String },
  IpOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BlockReason {
  IpNotAllowedAsId,
  HostnameRequired,
  FingerprintRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionDecision {
  Promote(IdentityBasis),
  /// The subnet's dwell time has not elapsed yet.
  Wait { until: DateTime<Utc> },
  Blocked(BlockReason),
}

/// Decide whether `sighting` may become a canonical device at `now`.
pub fn evaluate(
  sighting: &Sighting,
  policy: &EffectivePolicy,
  now: DateTime<Utc>,
) -> PromotionDecision {
  let Some(until) = sighting.first_seen.checked_add_signed(policy.dwell) else {
    return PromotionDecision::Wait { until: DateTime::<Utc>::MAX_UTC };
  };
  if until > now {
    return PromotionDecision::Wait { until };
  }
  if policy.rules.require_hostname && sighting.meta("hostname").is_none() {
    return PromotionDecision::Blocked(BlockReason::HostnameRequired);
  }
  if policy.rules.require_fingerprint
    && sighting
      .fingerprint_id
      .as_deref()
      .is_none_or(|f| f.trim().is_empty())
  {
    return PromotionDecision::Blocked(BlockReason::FingerprintRequired);
  }

  if let Some((id_type, id_value)) =
    identifier::strong_identifiers(None, &sighting.metadata)
      .into_iter()
      .next()
  {
    return PromotionDecision::Promote(IdentityBasis::Strong { id_type, id_value });
  }

  if policy.allow_ip_as_id {
    PromotionDecision::Promote(IdentityBasis::IpOnly)
  } else {
    PromotionDecision::Blocked(BlockReason::IpNotAllowedAsId)
  }
}
