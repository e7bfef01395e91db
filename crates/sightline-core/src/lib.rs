//! Core types and trait definitions for sightline, the device identity
//! reconciler.
//!
//! This crate holds the pure merge rules and the promotion decision. It has
//! no database or runtime dependencies; backends implement
//! [`store::IdentityStore`].

// Native `async fn` in traits; the returned futures are spelled out as `Send`.
#![allow(async_fn_in_trait)]

pub mod alias;
pub mod audit;
pub mod batch;
pub mod capability;
pub mod device;
pub mod error;
pub mod identifier;
pub mod metadata;
pub mod policy;
pub mod sighting;
pub mod store;
pub mod write_gate;

pub use error::{Classify, Error, ErrorKind, Result, ValidationError};
