//! Whether writes to the identity store are currently allowed.
//!
//! The engine is handed a [`WriteCapability`] instead of reading a global
//! flag, so a test can flip it mid-run.

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

pub trait WriteCapability: Send + Sync {
  fn enabled(&self) -> bool;
}

/// Fixed at construction, typically from configuration.
#[derive(Debug, Clone, Copy)]
pub struct StaticCapability(pub bool);

impl WriteCapability for StaticCapability {
  fn enabled(&self) -> bool { self.0 }
}

/// Shared toggle; clones observe the same flag.
#[derive(Debug, Clone)]
pub struct ToggleCapability(Arc<AtomicBool>);

impl ToggleCapability {
  pub fn new(enabled: bool) -> Self { Self(Arc::new(AtomicBool::new(enabled))) }

  pub fn set(&self, enabled: bool) { self.0.store(enabled, Ordering::SeqCst); }
}

impl WriteCapability for ToggleCapability {
  fn enabled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

impl<T: WriteCapability + ?Sized> WriteCapability for Arc<T> {
  fn enabled(&self) -> bool { (**self).enabled() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn toggle_is_shared_between_clones() {
    let gate = ToggleCapability::new(true);
    let handle = gate.clone();
    handle.set(false);
    assert!(!gate.enabled());
    assert!(StaticCapability(true).enabled());
  }
}
