//! Runtime configuration for the sync engine.
//!
//! Values come from the environment (`OBJSYNC_*`) with defaults suitable for
//! an ActiveSync style deployment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

/// Rows fetched per export pass. Bounds the blast radius of a failed acknowledgement.
pub const DEFAULT_EXPORT_BATCH_SIZE: usize = 250;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Serialization strategy for device state blobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateCodecKind {
    #[default]
    Json,
    Cbor,
}

impl FromStr for StateCodecKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(Error::InvalidInput(format!(
                "unknown state codec '{other}' (expected json or cbor)"
            ))),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Database file; `None` means in-memory
    pub database_path: Option<PathBuf>,
    /// Maximum rows returned by one export pass
    pub export_batch_size: usize,
    /// How long a writer waits on a locked database before giving up
    pub busy_timeout: Duration,
    /// Whether export passes reconcile stale records
    pub stale_check: bool,
    /// Device state serialization
    pub state_codec: StateCodecKind,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            export_batch_size: DEFAULT_EXPORT_BATCH_SIZE,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            stale_check: true,
            state_codec: StateCodecKind::Json,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `OBJSYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let read = |name: &str| normalize_text_option(lookup(name));

        let database_path = read("OBJSYNC_DB_PATH").map(PathBuf::from);

        let export_batch_size = match read("OBJSYNC_EXPORT_BATCH_SIZE") {
            Some(raw) => parse_number::<usize>("OBJSYNC_EXPORT_BATCH_SIZE", &raw)?,
            None => defaults.export_batch_size,
        };
        if export_batch_size == 0 {
            return Err(Error::InvalidInput(
                "OBJSYNC_EXPORT_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }

        let busy_timeout = match read("OBJSYNC_BUSY_TIMEOUT_MS") {
            Some(raw) => {
                Duration::from_millis(parse_number::<u64>("OBJSYNC_BUSY_TIMEOUT_MS", &raw)?)
            }
            None => defaults.busy_timeout,
        };

        let stale_check = match read("OBJSYNC_STALE_CHECK") {
            Some(raw) => parse_flag("OBJSYNC_STALE_CHECK", &raw)?,
            None => defaults.stale_check,
        };

        let state_codec = match read("OBJSYNC_STATE_CODEC") {
            Some(raw) => raw.parse()?,
            None => defaults.state_codec,
        };

        Ok(Self {
            database_path,
            export_batch_size,
            busy_timeout,
            stale_check,
            state_codec,
        })
    }

    /// Override the database path
    #[must_use]
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Override the export batch size
    #[must_use]
    pub const fn with_export_batch_size(mut self, size: usize) -> Self {
        self.export_batch_size = size;
        self
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::InvalidInput(format!("{name} must be a non-negative integer")))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidInput(format!("{name} must be a boolean"))),
    }
}
