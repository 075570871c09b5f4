//! Tenant handler: the caller's budget and effective settings.

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use pipewright_core::repository::TenantRepository;
use pipewright_types::config::TenantConfig;
use pipewright_types::tenant::Tenant as TenantRecord;
use serde::Serialize;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::tenant::Tenant;
use crate::http::response::ApiResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TenantView {
    #[serde(flatten)]
    pub tenant: TenantRecord,
    pub config: TenantConfig,
}

/// GET /api/v1/tenant
pub async fn get_tenant(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
) -> Result<Json<ApiResponse<TenantView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let config = state.orchestrator.directory().config_for(&tenant);
    let record = state
        .orchestrator
        .store()
        .ensure_tenant(&tenant, config.resource_budget)
        .await?;

    Ok(Json(ApiResponse::success(
        TenantView {
            tenant: record,
            config: config.as_ref().clone(),
        },
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}
