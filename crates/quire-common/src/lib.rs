//! Quire Common - Shared types and utilities
//!
//! This crate provides the document types, error definitions, and
//! configuration used across all Quire components.

pub mod config;
pub mod error;
pub mod types;

pub use config::QuireConfig;
pub use error::{Error, Result};
pub use types::*;
