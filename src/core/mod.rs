//! Core system types and foundations
//!
//! This module contains the fundamental building blocks of the roomcast
//! control plane: configuration and error handling.

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::Config;
pub use error::{Error, Result};
