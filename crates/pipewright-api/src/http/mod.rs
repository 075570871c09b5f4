//! HTTP/REST API layer for Pipewright.
//!
//! Axum-based REST API at `/api/v1/` with tenant scoping from the
//! `X-Tenant-Id` header and the envelope response format.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
