//! Orchestration engine for Pipewright.
//!
//! Storage is reached only through the repository traits in [`repository`];
//! `pipewright-infra` provides the SQLite implementation and
//! [`repository::memory::InMemoryStore`] the reference one.
//!
//! Layering, top-down: [`orchestrator`] -> [`graph`] -> ([`unit`] |
//! [`fanout`] -> [`quality`]) -> [`checkpoint`], with [`guard`] interposed on
//! every store and work-unit call.

pub mod checkpoint;
pub mod error;
pub mod event;
pub mod fanout;
pub mod graph;
pub mod guard;
pub mod orchestrator;
pub mod quality;
pub mod repository;
pub mod unit;
