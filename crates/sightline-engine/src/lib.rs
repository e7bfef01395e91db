//! The sightline reconciliation engine.
//!
//! - [`Reconciler`] folds raw device updates into canonical devices,
//!   resolving which device each update belongs to.
//! - [`PromotionEngine`] turns sightings that have dwelt long enough into
//!   device updates and marks them promoted.
//! - [`Reaper`] soft-deletes stale IP-only devices and purges old rows.
//!
//! All three work against any [`sightline_core::store::IdentityStore`].

pub mod config;
pub mod error;
pub mod promotion;
pub mod reaper;
pub mod reconcile;
pub mod retry;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use promotion::{PromotionEngine, RunReport};
pub use reaper::{ReapReport, Reaper};
pub use reconcile::{IngestReport, Reconciler};

#[cfg(test)]
mod tests;
