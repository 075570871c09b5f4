//! Versioned, tagged encoding of [`ExecutionState`].
//!
//! The encoded form is the JSON of
//! `{"format": "pipewright.checkpoint", "schema_version": N, "state": {...}}`.
//! Every object in it comes from a struct or a `BTreeMap`, so encoding is
//! deterministic and encode -> decode -> encode is byte-identical. A SHA-256
//! digest of the encoded string is stored next to it and checked on decode.

use pipewright_types::checkpoint::ExecutionState;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Format tag carried by every encoded state.
pub const CHECKPOINT_FORMAT: &str = "pipewright.checkpoint";

/// Current schema version.
///
/// - 1: initial layout.
/// - 2: adds `consumed` to the execution state.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("state digest mismatch (stored {stored}, computed {computed})")]
    DigestMismatch { stored: String, computed: String },

    #[error("unknown checkpoint format '{0}'")]
    UnknownFormat(String),

    #[error("unsupported schema version {found} (newest known is {SCHEMA_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("malformed checkpoint state: {0}")]
    Malformed(String),
}

/// Encoded state plus the metadata stored beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedState {
    pub body: String,
    pub digest: String,
    pub schema_version: u32,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format: &'static str,
    schema_version: u32,
    state: &'a ExecutionState,
}

#[derive(Deserialize)]
struct RawEnvelope {
    format: String,
    schema_version: u32,
    state: serde_json::Value,
}

/// Hex SHA-256 of the encoded body.
pub fn digest(body: &str) -> String {
    format!("{:x}", Sha256::digest(body.as_bytes()))
}

pub fn encode(state: &ExecutionState) -> Result<EncodedState, CodecError> {
    let envelope = EnvelopeRef {
        format: CHECKPOINT_FORMAT,
        schema_version: SCHEMA_VERSION,
        state,
    };
    let body = serde_json::to_string(&envelope).map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(EncodedState {
        digest: digest(&body),
        body,
        schema_version: SCHEMA_VERSION,
    })
}

/// Verify and decode an encoded state, upgrading older schema versions.
pub fn decode(body: &str, stored_digest: &str) -> Result<ExecutionState, CodecError> {
    let computed = digest(body);
    if computed != stored_digest {
        return Err(CodecError::DigestMismatch {
            stored: stored_digest.to_string(),
            computed,
        });
    }

    let envelope: RawEnvelope = serde_json::from_str(body).map_err(|e| CodecError::Malformed(e.to_string()))?;
    if envelope.format != CHECKPOINT_FORMAT {
        return Err(CodecError::UnknownFormat(envelope.format));
    }
    if envelope.schema_version == 0 || envelope.schema_version > SCHEMA_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: envelope.schema_version,
        });
    }

    let state = upgrade(envelope.schema_version, envelope.state)?;
    serde_json::from_value(state).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Bring a state object from `version` up to [`SCHEMA_VERSION`].
fn upgrade(version: u32, mut state: serde_json::Value) -> Result<serde_json::Value, CodecError> {
    let object = state
        .as_object_mut()
        .ok_or_else(|| CodecError::Malformed("state is not an object".to_string()))?;

    if version < 2 {
        object
            .entry("consumed")
            .or_insert_with(|| serde_json::Value::from(0.0));
    }

    Ok(state)
}
