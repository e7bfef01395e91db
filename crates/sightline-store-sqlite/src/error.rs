//! Error type for `sightline-store-sqlite`.

use sightline_core::{Classify, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] sightline_core::Error),

  #[error("database error: {0}")]
  Database(tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),
}

impl From<tokio_rusqlite::Error> for Error {
  /// Unwraps errors raised inside a connection closure back into this type.
  fn from(e: tokio_rusqlite::Error) -> Self {
    match e {
      tokio_rusqlite::Error::Other(inner) => match inner.downcast::<Error>() {
        Ok(err) => *err,
        Err(other) => Self::Database(tokio_rusqlite::Error::Other(other)),
      },
      e => Self::Database(e),
    }
  }
}

impl From<rusqlite::Error> for Error {
  fn from(e: rusqlite::Error) -> Self { Self::Database(tokio_rusqlite::Error::Rusqlite(e)) }
}

impl From<sightline_core::ValidationError> for Error {
  fn from(e: sightline_core::ValidationError) -> Self { Self::Core(e.into()) }
}

impl Error {
  /// Box for transport through a `tokio_rusqlite` closure.
  pub(crate) fn into_call(self) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(self))
  }
}

impl Classify for Error {
  fn kind(&self) -> ErrorKind {
    match self {
      Self::Core(e) => e.kind(),
      Self::Database(_) => ErrorKind::Transport,
      Self::Json(_) | Self::Uuid(_) | Self::DateParse(_) => ErrorKind::Decode,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
