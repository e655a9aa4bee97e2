//! Shared runtime for f4sten plugins.
//!
//! Every plugin talks to the bus through a [`bus::BusClient`]. The client
//! wraps each payload in an [`envelope::Envelope`], routes it onto one of the
//! three [`lane::Lane`]s of a topic, and turns failing callbacks into
//! ERROR-lane records instead of crashing the worker loop.
//!
//! ```ignore
//! use f4sten_core::{bus::BusClient, lane::Lane};
//!
//! bus.subscribe::<serde_json::Value, serde_json::Value, _>("fasten.in", |msg, lane, outbox| {
//!     outbox.publish_derived(msg, &msg.payload(), "fasten.out", lane)?;
//!     Ok(())
//! })?;
//! loop {
//!     if bus.poll().await? > 0 {
//!         bus.commit().await?;
//!     }
//! }
//! ```

pub mod args;
pub mod bus;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod lane;
pub mod transport;

pub use args::{ArgBundle, ArgsBinder, BindError, ParsedArgs};
pub use bus::{BusClient, Outbox};
pub use envelope::{Envelope, ErrorInfo, Failure, Provenance};
pub use error::{BusError, ConfigError, TransportError};
pub use identity::{BusArgs, ConnectorIdentity};
pub use lane::{Lane, lane_of};
pub use transport::{MemoryBroker, Transport, transport_for};
