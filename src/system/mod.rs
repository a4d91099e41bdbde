//! System-level monitoring and diagnostics

pub mod metrics;
