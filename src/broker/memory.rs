//! In-process broker admin
//!
//! Records declared topology in concurrent maps so tests can assert which
//! exchanges, queues, bindings, and consumers exist after reconciliation.

use crate::broker::{BrokerAdmin, BrokerResult, ExchangeKind, QueueArgs};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::time::Duration;

/// In-memory implementation of [`BrokerAdmin`]
pub struct MemoryBroker {
    exchanges: DashMap<String, ExchangeKind>,
    queues: DashMap<String, QueueArgs>,
    /// (queue, exchange, routing key)
    bindings: DashSet<(String, String, String)>,
    consumers: DashSet<String>,
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            bindings: DashSet::new(),
            consumers: DashSet::new(),
        }
    }

    /// Whether an exchange has been declared
    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.contains_key(name)
    }

    /// Whether a queue has been declared
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Whether a binding exists
    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.bindings
            .contains(&(queue.to_string(), exchange.to_string(), routing_key.to_string()))
    }

    /// Queues this broker currently has active consumers on
    pub fn consumed_queues(&self) -> HashSet<String> {
        self.consumers.iter().map(|q| q.clone()).collect()
    }

    /// Number of declared queues
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdmin for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        self.exchanges.insert(name.to_string(), kind);
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.exchanges.remove(name);
        self.bindings.retain(|(_, e, _)| e != name);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArgs) -> BrokerResult<()> {
        self.queues.insert(name.to_string(), args.clone());
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<()> {
        self.queues.remove(name);
        self.bindings.retain(|(q, _, _)| q != name);
        self.consumers.remove(name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        self.bindings.insert((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.bindings.remove(&(
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn ensure_consumer(&self, queue: &str) -> BrokerResult<()> {
        self.consumers.insert(queue.to_string());
        Ok(())
    }

    async fn cancel_consumer(&self, queue: &str) -> BrokerResult<()> {
        self.consumers.remove(queue);
        Ok(())
    }
}

/// Default queue arguments for tests
pub fn test_queue_args() -> QueueArgs {
    QueueArgs {
        durable: true,
        max_length: 1_000,
        message_ttl: Duration::from_secs(60),
    }
}
