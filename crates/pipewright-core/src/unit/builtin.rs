//! Built-in work units.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::work_unit::{UnitFailure, UnitOutput, UnitRequest, WorkUnit};

/// Returns its input unchanged.
#[derive(Debug, Clone)]
pub struct EchoUnit {
    name: String,
}

impl EchoUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl WorkUnit for EchoUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, request: &UnitRequest) -> Result<UnitOutput, UnitFailure> {
        Ok(UnitOutput::new(request.input.clone()))
    }
}

type BoxedCall = Pin<Box<dyn Future<Output = Result<UnitOutput, UnitFailure>> + Send>>;

/// Work unit backed by an async closure.
///
/// ```ignore
/// let unit = FnUnit::new("upper", |req| async move {
///     Ok(UnitOutput::new(req.input))
/// });
/// ```
#[derive(Clone)]
pub struct FnUnit {
    name: String,
    call: Arc<dyn Fn(UnitRequest) -> BoxedCall + Send + Sync>,
}

impl FnUnit {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UnitRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitOutput, UnitFailure>> + Send + 'static,
    {
        Self {
            name: name.into(),
            call: Arc::new(move |req| Box::pin(f(req))),
        }
    }
}

impl std::fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUnit").field("name", &self.name).finish()
    }
}

impl WorkUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, request: &UnitRequest) -> impl Future<Output = Result<UnitOutput, UnitFailure>> + Send {
        (self.call)(request.clone())
    }
}
