//! The broker seam.
//!
//! qrpc is not a message broker; it consumes one through these traits.
//! [`AmqpBroker`] is the deployment implementation (RabbitMQ via `lapin`);
//! [`MemoryBroker`] is an in-process implementation with identical
//! admission semantics, used by the test suite and local runs.
//!
//! Each consumer owns its own channel onto a shared session; channels are
//! never shared across consumers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::queue::QueueDescriptor;

pub mod amqp;
pub mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Result of a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// Nacked by admission control (queue at max length).
    Rejected,
}

/// One message handed to a consumer, to be acknowledged by tag.
#[derive(Debug)]
pub struct Delivery {
    pub envelope: Envelope,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// A dialable broker endpoint.
///
/// `connect` must distinguish transient dial failures (returned as
/// retryable connection errors) from fatal auth/protocol failures
/// ([`crate::QrpcError::Fatal`]), which abort reconnection.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BrokerSession>>;
}

/// A live transport session. Replaced wholesale on reconnect.
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;
    fn is_open(&self) -> bool;
    async fn close(&self);
}

/// One channel onto a session: the unit of queue declaration, publishing,
/// consuming, and acknowledgment.
#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declares a queue idempotently and returns its (possibly
    /// broker-generated) name. Redeclaring with different admission
    /// arguments is an error.
    async fn declare_queue(&self, desc: &QueueDescriptor) -> Result<String>;

    /// Caps unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, prefetch: u16) -> Result<()>;

    /// Publishes with confirms; `Rejected` means admission control nacked.
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<PublishOutcome>;

    /// Starts consuming; the receiver ends when the channel or session
    /// dies. With `no_ack` the broker forgets messages on delivery.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<mpsc::UnboundedReceiver<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn close(&self);
}
