//! HTTP server for Glimmr data exports.
//!
//! Wires the `glimmr-export` pipeline to PostgreSQL datasets, an optional
//! Redis progress store and the axum routes under `/analytics/export`.

pub mod config;
pub mod error;
pub mod export;
pub mod observability;
pub mod server;
pub mod storage;

pub use error::ApiError;
pub use server::{AppState, GlimmrServer, ServerBuilder, build_app};
