//! Error types for `sightline-core`.
//!
//! Every error in the workspace classifies into an [`ErrorKind`] so callers
//! can decide whether to retry, reprocess, or report a bug.

use thiserror::Error;
use uuid::Uuid;

use crate::sighting::SightingStatus;

/// The broad failure class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// A single record was malformed; skip it and carry on.
  Validation,
  /// The backend could not be reached or a batch failed to commit. Retryable.
  Transport,
  /// An illegal state change was requested. Indicates a caller bug.
  Conflict,
  /// The addressed sighting or device does not exist.
  NotFound,
  /// Stored data could not be decoded.
  Decode,
}

impl ErrorKind {
  pub fn is_retryable(self) -> bool { matches!(self, Self::Transport) }
}

/// Implemented by every error type that crosses a crate boundary.
pub trait Classify {
  fn kind(&self) -> ErrorKind;

  fn is_retryable(&self) -> bool { self.kind().is_retryable() }
}

/// Why a single record was rejected from a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("device_id missing")]
  DeviceIdMissing,

  #[error("id_type missing")]
  IdTypeMissing,

  #[error("id_value missing")]
  IdValueMissing,

  #[error("ip missing")]
  IpMissing,

  #[error("source missing")]
  SourceMissing,

  #[error("sighting_id missing")]
  SightingIdMissing,

  #[error("event_type missing")]
  EventTypeMissing,

  #[error("reason missing")]
  ReasonMissing,

  #[error("capability missing")]
  CapabilityMissing,

  #[error("subnet_id missing")]
  SubnetIdMissing,

  #[error("invalid cidr: {0:?}")]
  InvalidCidr(String),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("validation failed: {0}")]
  Validation(#[from] ValidationError),

  #[error("sighting not found: {0}")]
  SightingNotFound(Uuid),

  #[error("device not found: {0}")]
  DeviceNotFound(String),

  #[error("sighting {sighting_id} cannot move from {from} to {to}")]
  InvalidTransition {
    sighting_id: Uuid,
    from:        SightingStatus,
    to:          SightingStatus,
  },

  #[error("cannot merge device {0} into itself")]
  SelfMerge(String),

  #[error("merging {from} into {to} would create a cycle")]
  MergeCycle { from: String, to: String },

  #[error("merge chain starting at {device_id} exceeds {max_depth} hops")]
  MergeChainTooDeep { device_id: String, max_depth: usize },

  #[error("unknown {what} discriminant: {value:?}")]
  UnknownDiscriminant { what: &'static str, value: String },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Validation(_) => ErrorKind::Validation,
      Self::SightingNotFound(_) | Self::DeviceNotFound(_) => ErrorKind::NotFound,
      Self::InvalidTransition { .. }
      | Self::SelfMerge(_)
      | Self::MergeCycle { .. }
      | Self::MergeChainTooDeep { .. } => ErrorKind::Conflict,
      Self::UnknownDiscriminant { .. } | Self::Serialization(_) => {
        ErrorKind::Decode
      }
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
