//! Message broker boundary
//!
//! The control plane manages AMQP topology only: it declares and removes
//! exchanges, queues, and bindings, and starts or cancels consumers. It never
//! publishes or consumes payload bytes itself; producers and consumers use
//! the names it hands out.

pub mod memory;

pub use memory::MemoryBroker;

use crate::core::error::BrokerError;
use async_trait::async_trait;
use std::time::Duration;

/// Result alias for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Exchange routing semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern-matched routing keys; used for the shared cold exchange
    Topic,
    /// Exact routing keys; used for dedicated per-room exchanges
    Direct,
}

/// Declaration arguments for a queue
#[derive(Debug, Clone)]
pub struct QueueArgs {
    /// Survive broker restarts
    pub durable: bool,
    /// Bound queue length; oldest messages are dropped at overflow
    pub max_length: u32,
    /// Per-message TTL
    pub message_ttl: Duration,
}

/// Administrative interface to an AMQP-compatible broker
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    /// Declare an exchange (idempotent)
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()>;

    /// Delete an exchange
    async fn delete_exchange(&self, name: &str) -> BrokerResult<()>;

    /// Declare a queue (idempotent)
    async fn declare_queue(&self, name: &str, args: &QueueArgs) -> BrokerResult<()>;

    /// Delete a queue
    async fn delete_queue(&self, name: &str) -> BrokerResult<()>;

    /// Bind a queue to an exchange with a routing key
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()>;

    /// Remove a queue binding
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()>;

    /// Start (or refresh) this instance's consumer on a queue
    async fn ensure_consumer(&self, queue: &str) -> BrokerResult<()>;

    /// Cancel this instance's consumer on a queue
    async fn cancel_consumer(&self, queue: &str) -> BrokerResult<()>;
}
