//! objsync-core - Core library for objsync
//!
//! Commit-log based change tracking that lets partners (ActiveSync devices,
//! mailboxes, other systems) pull changes incrementally from a shared entity
//! store, plus the device state machine their protocols resume from.

pub mod config;
pub mod db;
pub mod device;
pub mod diff;
pub mod entity;
pub mod error;
pub mod ledger;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{CommitId, StreamKey};
