//! Shared protocol types and broker abstraction for qrpc.
//!
//! qrpc forwards work from a lightweight front-end to a scalable pool of
//! worker consumers through a message broker, with no direct network path
//! between the two. This crate holds everything both sides need:
//!
//! - the wire [`envelope`] codec (JSON values plus a base64 wrapper for
//!   opaque byte payloads),
//! - the structured [`reply::Reply`] every caller ultimately receives,
//! - the [`queue::QueueDescriptor`] carrying the admission-control
//!   arguments (bounded length, TTL, reject-on-overflow),
//! - the [`broker`] trait seam with an AMQP implementation (`lapin`) and
//!   an in-process implementation used by the test suite,
//! - the reconnecting [`connection::BrokerConnection`] supervisor.

pub mod broker;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod queue;
pub mod reply;

pub use broker::{
    AmqpBroker, Broker, BrokerChannel, BrokerSession, Delivery, MemoryBroker, PublishOutcome,
};
pub use connection::{BrokerConnection, ConnectionState, ReconnectConfig};
pub use envelope::{Body, Envelope};
pub use error::{QrpcError, Result};
pub use queue::QueueDescriptor;
pub use reply::Reply;
