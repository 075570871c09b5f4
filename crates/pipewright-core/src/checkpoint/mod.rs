//! Checkpoint encoding and the checkpoint manager.

pub mod codec;
pub mod manager;

pub use codec::{CodecError, EncodedState, SCHEMA_VERSION};
pub use manager::{CheckpointDraft, CheckpointError, CheckpointManager, decode_record};
