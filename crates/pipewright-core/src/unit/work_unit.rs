//! The `WorkUnit` capability.
//!
//! A work unit wraps one call to an external collaborator (a model call, an
//! API call). Variants are independent types implementing this trait and are
//! looked up by name in a [`super::UnitRegistry`].

use std::time::Duration;

use pipewright_types::tenant::TenantId;
use serde::{Deserialize, Serialize};

/// One invocation of a work unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitRequest {
    pub tenant_id: TenantId,
    pub unit: String,
    pub input: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Per-attempt deadline enforced by the executor.
    #[serde(skip)]
    pub timeout: Duration,
}

/// Successful result of a work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutput {
    pub output: serde_json::Value,
    /// Resources the call consumed, when the unit can tell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<f64>,
}

impl UnitOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self { output, usage: None }
    }

    pub fn with_usage(mut self, usage: f64) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Typed failure of a work unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{failure_kind}: {message}")]
pub struct UnitFailure {
    pub failure_kind: String,
    pub message: String,
    /// Transient failures (network, timeout, overload) are retried.
    #[serde(default)]
    pub retryable: bool,
}

impl UnitFailure {
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure_kind: kind.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure_kind: kind.into(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Capability interface for anything the engine can invoke.
///
/// Uses RPITIT (Rust 2024 native async traits). Not object-safe on its own;
/// use [`super::BoxWorkUnit`] for dynamic dispatch.
pub trait WorkUnit: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        request: &UnitRequest,
    ) -> impl std::future::Future<Output = Result<UnitOutput, UnitFailure>> + Send;
}
