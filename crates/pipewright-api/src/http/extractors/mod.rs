//! Custom axum extractors.

pub mod tenant;
