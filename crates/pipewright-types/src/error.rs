use thiserror::Error;

/// Errors from repository operations (used by trait definitions in pipewright-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    /// The record exists but belongs to another tenant. Carries no record data.
    #[error("tenant '{caller}' may not access {resource} owned by tenant '{owner}'")]
    TenantIsolation {
        caller: String,
        owner: String,
        resource: String,
    },

    /// Optimistic-concurrency failure: the write did not reference the
    /// currently Active checkpoint.
    #[error("stale checkpoint write: expected active {expected}, found {actual}")]
    StaleWrite { expected: String, actual: String },
}
