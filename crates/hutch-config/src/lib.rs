//! # Hutch Config
//!
//! Configuration management for the Hutch work queue.
//! Supports layered configuration from files and environment variables,
//! broker URL parsing and fail-fast validation.

mod app_config;
mod broker_url;
mod error;
mod loader;
mod validation;

pub use app_config::*;
pub use broker_url::*;
pub use error::*;
pub use loader::*;
pub use validation::*;
