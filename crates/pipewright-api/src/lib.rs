//! Application layer for Pipewright: the `pwr` CLI and the REST API share
//! one [`state::AppState`].

pub mod cli;
pub mod http;
pub mod state;
