//! # Lexa Common Library
//!
//! Shared code for the Lexa services including:
//! - Error types
//! - Configuration loading (root folder, TOML config file)
//! - Database initialization and schema
//! - Job status/kind contract shared by every invocation
//! - Event types (LexaEvent) and the broadcast event bus
//! - SSE helpers
//! - Text helpers (key normalization, context hashing)

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod sse;
pub mod text;

pub use error::{Error, Result};
