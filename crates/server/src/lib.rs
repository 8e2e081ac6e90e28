//! Elara orchestrator server library.
//!
//! Exposes the building blocks (config, state, error handling, the
//! orchestration service, routes) so integration tests and the binary
//! entrypoint can both use them.

pub mod auth;
pub mod background;
pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod service;
pub mod state;
