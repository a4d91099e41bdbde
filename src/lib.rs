//! Roomcast - Cluster Coordination for Live-Chat Fan-Out
//!
//! Roomcast is the control plane for a horizontally scaled danmaku (live
//! chat) delivery fleet. It keeps a weighted consistent-hash ring of live
//! instances, classifies rooms into traffic tiers from viewer counts, shapes
//! per-room broker topology (shared resources for quiet rooms, dedicated
//! sharded queues for hot ones), and assigns queue consumers by ring
//! ownership. It never touches message payloads; producers and consumers use
//! the names it coordinates.
#![warn(missing_docs)]

// Configure global allocator for maximum performance
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Core foundational modules
pub mod core;

// External boundaries
pub mod broker;
pub mod store;

// Main functional modules
pub mod cluster;
pub mod consumer;
pub mod coord;
pub mod node;
pub mod system;
pub mod topology;

// Re-export commonly used items for convenience
pub use self::core::{Config, Error, Result};
pub use node::WorkerNode;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the control plane's tracing and metrics
pub fn init() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Initializing {} v{}", NAME, VERSION);

    // Initialize metrics registry
    system::metrics::init_registry();

    Ok(())
}
