//! The seam between the bus client and a concrete broker.
//!
//! A wire-level client (Kafka or otherwise) plugs in by implementing
//! [`Transport`] and [`Connection`]. The built-in [`memory::MemoryBroker`]
//! keeps everything inside the process.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{ConfigError, TransportError},
    identity::ConnectorIdentity,
};

pub mod memory;

pub use memory::MemoryBroker;

pub const MEMORY_SCHEME: &str = "memory://";

/// One record as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub address: String,
    pub offset: u64,
    pub payload: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the single connection a plugin process uses.
    async fn connect(
        &self,
        identity: &ConnectorIdentity,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// A live connection owned by one bus client.
#[async_trait]
pub trait Connection: Send {
    /// Starts tracking `addresses`, resuming from the group's committed position.
    async fn subscribe(&mut self, addresses: &[String]) -> Result<(), TransportError>;

    /// Returns ready records from `addresses`, waiting at most `max_wait` when
    /// none are available. Records of one address come back in log order.
    async fn fetch(
        &mut self,
        addresses: &[String],
        max_wait: Duration,
    ) -> Result<Vec<Record>, TransportError>;

    /// Moves the read position of a subscribed `address` so the next `fetch`
    /// starts at `offset`.
    async fn seek(&mut self, address: &str, offset: u64) -> Result<(), TransportError>;

    async fn send(&mut self, address: &str, payload: String) -> Result<(), TransportError>;

    /// Makes the positions handed out by `fetch` durable for the group.
    async fn commit(&mut self) -> Result<(), TransportError>;

    async fn heartbeat(&mut self) -> Result<(), TransportError>;

    /// Releases the connection. Uncommitted positions are dropped.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Picks the transport for a bootstrap address.
pub fn transport_for(bootstrap_url: &str) -> Result<Arc<dyn Transport>, ConfigError> {
    if bootstrap_url.starts_with(MEMORY_SCHEME) {
        Ok(Arc::new(MemoryBroker::named(bootstrap_url)))
    } else {
        Err(ConfigError::UnsupportedBus(bootstrap_url.to_string()))
    }
}
