use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] objsync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Partner not found: {0}")]
    PartnerNotFound(String),
    #[error("Collection not found: {0}")]
    CollectionNotFound(i64),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
