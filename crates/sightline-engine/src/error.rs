//! Error types for `sightline-engine`.

use sightline_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  /// A store call failed; `kind` is the store error's classification.
  #[error("store error: {source}")]
  Store {
    kind:   ErrorKind,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  #[error("{operation} did not finish within {after:?}")]
  DeadlineExceeded {
    operation: &'static str,
    after:     std::time::Duration,
  },

  #[error(transparent)]
  Core(#[from] sightline_core::Error),
}

impl Error {
  pub(crate) fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Classify + Send + Sync + 'static,
  {
    Self::Store { kind: e.kind(), source: Box::new(e) }
  }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Store { kind, .. } => *kind,
      Self::DeadlineExceeded { .. } => ErrorKind::Transport,
      Self::Core(e) => e.kind(),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
