//! Infrastructure layer for Pipewright.
//!
//! Implements the storage ports defined in `pipewright-core` on SQLite, and
//! provides the adapters the binary wires together at startup: the TOML
//! configuration loader, graph-file discovery and HTTP work units.

pub mod config;
pub mod graphs;
pub mod sqlite;
pub mod unit;
