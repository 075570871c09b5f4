//! BoxWorkUnit -- object-safe dynamic dispatch wrapper for WorkUnit.
//!
//! 1. `WorkUnitDyn` is the object-safe twin of `WorkUnit` with boxed futures
//! 2. Every `T: WorkUnit` gets `WorkUnitDyn` through a blanket impl
//! 3. `BoxWorkUnit` wraps `Box<dyn WorkUnitDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use super::work_unit::{UnitFailure, UnitOutput, UnitRequest, WorkUnit};

/// Object-safe version of [`WorkUnit`] with boxed futures.
pub trait WorkUnitDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        request: &'a UnitRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UnitOutput, UnitFailure>> + Send + 'a>>;
}

impl<T: WorkUnit> WorkUnitDyn for T {
    fn name(&self) -> &str {
        WorkUnit::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        request: &'a UnitRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UnitOutput, UnitFailure>> + Send + 'a>> {
        Box::pin(self.execute(request))
    }
}

/// Type-erased work unit for runtime selection by name.
pub struct BoxWorkUnit {
    inner: Box<dyn WorkUnitDyn>,
}

impl BoxWorkUnit {
    pub fn new<T: WorkUnit + 'static>(unit: T) -> Self {
        Self { inner: Box::new(unit) }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(&self, request: &UnitRequest) -> Result<UnitOutput, UnitFailure> {
        self.inner.execute_boxed(request).await
    }
}

impl std::fmt::Debug for BoxWorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxWorkUnit").field("name", &self.name()).finish()
    }
}
