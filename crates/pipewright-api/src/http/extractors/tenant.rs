//! Tenant extractor.
//!
//! Every workflow route acts for the tenant named in the `X-Tenant-Id`
//! header. The header is trusted; scoping is enforced by the engine.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use pipewright_types::tenant::TenantId;

use crate::http::error::AppError;
use crate::state::AppState;

pub const TENANT_HEADER: &str = "x-tenant-id";

/// The calling tenant.
#[derive(Debug, Clone)]
pub struct Tenant(pub TenantId);

impl FromRequestParts<AppState> for Tenant {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| AppError::BadRequest("missing X-Tenant-Id header".to_string()))?
            .to_str()
            .map_err(|_| AppError::BadRequest("invalid X-Tenant-Id header encoding".to_string()))?;
        TenantId::new(raw.trim()).map(Tenant).map_err(AppError::BadRequest)
    }
}
