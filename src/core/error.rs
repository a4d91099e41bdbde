//! Error types and handling for roomcast
//!
//! This module defines all error types used throughout the control plane.
//! Per the propagation policy, public reconciliation entry points catch and
//! log these internally; they surface only where a caller can act on them.

use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the roomcast control plane
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Coordination store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Message broker errors
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal system errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors from std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus metrics errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Coordination store errors
///
/// Transient transport failures land here; callers abort the current
/// operation and retry on the next scheduled tick, never in a loop.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection failed or lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// An atomic script/operation failed server-side
    #[error("Atomic operation failed: {0}")]
    Atomic(String),

    /// Stored value could not be parsed
    #[error("Malformed value at {key}: {value}")]
    Malformed {
        /// Key holding the bad value
        key: String,
        /// The raw value as stored
        value: String,
    },

    /// Pub/sub topic is gone or the subscriber lagged past recovery
    #[error("Subscription error: {0}")]
    Subscription(String),
}

/// Message broker errors
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection failed or lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Exchange or queue declaration failed
    #[error("Declare failed for {name}: {reason}")]
    Declare {
        /// Resource name being declared
        name: String,
        /// Broker-reported reason
        reason: String,
    },

    /// Binding or unbinding failed
    #[error("Bind failed for queue {queue}: {reason}")]
    Bind {
        /// Queue involved in the binding
        queue: String,
        /// Broker-reported reason
        reason: String,
    },

    /// Consumer registration failed
    #[error("Consumer error on {queue}: {reason}")]
    Consumer {
        /// Queue the consumer is attached to
        queue: String,
        /// Broker-reported reason
        reason: String,
    },
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a cluster error
    pub fn cluster(msg: impl Into<String>) -> Self {
        Error::Cluster(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
