//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (pipewright-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! Every read and write is scoped by tenant. Implementations must refuse to
//! hand a record owned by one tenant to a caller acting for another; they
//! report [`RepositoryError::TenantIsolation`] instead.

pub mod checkpoint;
pub mod instance;
pub mod memory;
pub mod tenant;

pub use checkpoint::{CheckpointStore, CheckpointWrite, Supersede};
pub use instance::InstanceRepository;
pub use pipewright_types::error::RepositoryError;
pub use tenant::TenantRepository;

/// Everything the engine needs from a storage backend.
pub trait EngineStore:
    CheckpointStore + InstanceRepository + TenantRepository + Send + Sync + 'static
{
}

impl<T> EngineStore for T where
    T: CheckpointStore + InstanceRepository + TenantRepository + Send + Sync + 'static
{
}
