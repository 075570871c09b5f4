//! Workflow handlers for the REST API.
//!
//! Starting a workflow admits it synchronously and runs it in the
//! background; the response is `202 Accepted` with the admitted instance.
//! Every other endpoint completes before responding.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router};
use axum::routing::{get, post};
use pipewright_types::workflow::{ResumeEvent, WorkflowId, WorkflowInstance, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::http::error::AppError;
use crate::http::extractors::tenant::Tenant;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request bodies and query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartWorkflowRequest {
    pub workflow_id: String,
    #[serde(default = "empty_object")]
    pub input: Value,
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    #[serde(rename = "type")]
    pub resume_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Reusing an id makes redelivery a no-op.
    #[serde(default)]
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WorkflowView {
    #[serde(flatten)]
    pub instance: WorkflowInstance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspension: Option<pipewright_types::checkpoint::Suspension>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Mounted at `/api/v1` by the main router.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/workflows", post(start_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/events", post(deliver_event))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/checkpoints", get(list_checkpoints))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/workflows
pub async fn start_workflow(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Json(body): Json<StartWorkflowRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WorkflowInstance>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = parse_workflow_id(body.workflow_id)?;
    let instance = state.orchestrator.admit(&tenant, workflow, body.input).await?;

    let orchestrator = Arc::clone(&state.orchestrator);
    let (bg_tenant, bg_workflow) = (tenant.clone(), instance.id.clone());
    tokio::spawn(async move {
        match orchestrator.run(&bg_tenant, &bg_workflow).await {
            Ok(report) => tracing::info!(
                tenant = %bg_tenant,
                workflow = %bg_workflow,
                status = %report.instance.status,
                "background run settled"
            ),
            Err(e) => tracing::warn!(
                tenant = %bg_tenant,
                workflow = %bg_workflow,
                error = %e,
                "background run stopped"
            ),
        }
    });

    let href = format!("/api/v1/workflows/{}", instance.id);
    let response = ApiResponse::success(instance, request_id, start.elapsed().as_millis() as u64)
        .with_link("self", &href)
        .with_link("checkpoints", &format!("{href}/checkpoints"));
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /api/v1/workflows
pub async fn list_workflows(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowInstance>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let status = query
        .status
        .as_deref()
        .map(str::parse::<WorkflowStatus>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let instances = state.orchestrator.list(&tenant, status).await?;

    Ok(Json(ApiResponse::success(
        instances,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// GET /api/v1/workflows/{id}
pub async fn get_workflow(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowView>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = parse_workflow_id(id)?;
    let instance = state.orchestrator.status(&tenant, &workflow).await?;
    let suspension = if matches!(instance.status, WorkflowStatus::Suspended | WorkflowStatus::Escalated) {
        state
            .orchestrator
            .guard(&tenant)
            .await?
            .load_active(&workflow)
            .await?
            .and_then(|checkpoint| checkpoint.state.suspension)
    } else {
        None
    };

    let href = format!("/api/v1/workflows/{workflow}");
    Ok(Json(
        ApiResponse::success(
            WorkflowView { instance, suspension },
            request_id,
            start.elapsed().as_millis() as u64,
        )
        .with_link("self", &href)
        .with_link("events", &format!("{href}/events")),
    ))
}

/// POST /api/v1/workflows/{id}/events
pub async fn deliver_event(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
    Json(body): Json<ResumeRequest>,
) -> Result<Json<ApiResponse<pipewright_core::orchestrator::WorkflowReport>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = parse_workflow_id(id)?;
    let mut event = ResumeEvent::new(workflow, body.resume_type, body.payload);
    if let Some(event_id) = body.event_id {
        event.id = event_id;
    }
    let report = state.orchestrator.handle_event(&tenant, event).await?;

    Ok(Json(ApiResponse::success(
        report,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// POST /api/v1/workflows/{id}/cancel
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WorkflowInstance>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = parse_workflow_id(id)?;
    let instance = state.orchestrator.cancel(&tenant, &workflow).await?;

    Ok(Json(ApiResponse::success(
        instance,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

/// GET /api/v1/workflows/{id}/checkpoints
pub async fn list_checkpoints(
    State(state): State<AppState>,
    Tenant(tenant): Tenant,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Vec<pipewright_types::checkpoint::CheckpointRecord>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let workflow = parse_workflow_id(id)?;
    let records = state.orchestrator.checkpoints(&tenant, &workflow).await?;

    Ok(Json(ApiResponse::success(
        records,
        request_id,
        start.elapsed().as_millis() as u64,
    )))
}

fn parse_workflow_id(raw: String) -> Result<WorkflowId, AppError> {
    WorkflowId::new(raw).map_err(AppError::BadRequest)
}
