//! Tidepool Common - Shared types and utilities
//!
//! This crate provides the store/version data model, the error taxonomy,
//! and configuration used across all Tidepool components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
