//! Pluggable serialization of device state blobs
//!
//! The state machine never looks inside a blob; the codec decides how a
//! protocol layer's value becomes bytes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StateCodecKind;
use crate::error::{Error, Result};

/// Turns state values into bytes and back
pub trait StateCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON via `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl StateCodec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// CBOR via `ciborium`
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

impl StateCodec for CborCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        ciborium::from_reader(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

/// Codec chosen at runtime from `SyncConfig::state_codec`
#[derive(Debug, Clone, Copy)]
pub enum ConfiguredCodec {
    Json(JsonCodec),
    Cbor(CborCodec),
}

impl From<StateCodecKind> for ConfiguredCodec {
    fn from(kind: StateCodecKind) -> Self {
        match kind {
            StateCodecKind::Json => Self::Json(JsonCodec),
            StateCodecKind::Cbor => Self::Cbor(CborCodec),
        }
    }
}

impl StateCodec for ConfiguredCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json(codec) => codec.encode(value),
            Self::Cbor(codec) => codec.encode(value),
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json(codec) => codec.decode(bytes),
            Self::Cbor(codec) => codec.decode(bytes),
        }
    }
}
