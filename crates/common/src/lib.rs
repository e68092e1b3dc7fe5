//! Common utilities and types for Model Depot
//!
//! This crate provides shared functionality used across the workspace,
//! including the error taxonomy, the artifact and worker data models, and
//! small formatting helpers.

pub mod error;
pub mod models;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
