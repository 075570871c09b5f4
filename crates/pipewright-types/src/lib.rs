//! Shared domain types for Pipewright.
//!
//! Tenants, workflow instances, graph definitions, checkpoints, fan-out tasks,
//! quality evaluations, engine events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod quality;
pub mod task;
pub mod tenant;
pub mod workflow;
