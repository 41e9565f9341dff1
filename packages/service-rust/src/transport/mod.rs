//! Transport port: the narrow message-broker interface the RPC layer consumes.
//!
//! The port mirrors the subset of AMQP 0-9-1 the protocol needs: queue and
//! exchange declaration, QoS prefetch, publish with message properties,
//! consume, acknowledgment, and close. Implementations must be safe for
//! concurrent use because one channel is shared by every running handler.
//!
//! [`MemoryBroker`] is the in-process implementation. With the `amqp`
//! feature, `amqp::AmqpBroker` reaches a real broker.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpChannel, DEFAULT_BROKER_URL};
pub use memory::{MemoryBroker, MemoryChannel};

/// Name of the default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Per-message properties carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl MessageProperties {
    /// Properties with only the content type set.
    #[must_use]
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Self::default()
        }
    }

    /// Sets the token a reply must echo.
    #[must_use]
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the queue replies go to.
    #[must_use]
    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

/// A message handed to a consumer.
///
/// `delivery_tag` is scoped to the channel that delivered the message and is
/// what [`Transport::ack`] uses to identify it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// Receiving end of a consumer registration.
pub type DeliveryStream = mpsc::Receiver<Delivery>;

// ---------------------------------------------------------------------------
// Declaration options
// ---------------------------------------------------------------------------

/// Queue declaration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Queue name; empty asks the broker to assign one.
    pub name: String,
    pub durable: bool,
    /// Only the declaring channel may consume; deleted when it closes.
    pub exclusive: bool,
    /// Deleted when the declaring channel closes.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// A shared, non-durable queue with a well-known name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// A broker-named queue private to the declaring channel.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues bound with a routing key equal to the message's.
    Direct,
    /// Routes every message to every bound queue.
    Fanout,
}

/// Consumer registration parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are handed out.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    /// Acknowledged on hand-out.
    #[must_use]
    pub fn auto_ack() -> Self {
        Self { auto_ack: true }
    }

    /// Held until [`Transport::ack`].
    #[must_use]
    pub fn manual_ack() -> Self {
        Self { auto_ack: false }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Broker-level failures surfaced by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("transport i/o error: {0}")]
    Io(String),
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// A broker channel.
///
/// All methods take `&self`; implementations serialize access internally so a
/// single `Arc<dyn Transport>` can be shared across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares a queue and returns its (possibly broker-assigned) name.
    async fn declare_queue(&self, options: QueueOptions) -> Result<String, TransportError>;

    /// Declares an exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError>;

    /// Binds a queue to an exchange.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Caps unacknowledged deliveries per consumer; 0 means unlimited.
    ///
    /// Applies to consumers registered after the call.
    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Publishes a message. An empty `exchange` routes by queue name.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), TransportError>;

    /// Registers a consumer on `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    /// Acknowledges a delivery received on this channel.
    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError>;

    /// Closes the channel. Unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_queue_options() {
        let opts = QueueOptions::exclusive();
        assert!(opts.name.is_empty());
        assert!(opts.exclusive);
        assert!(opts.auto_delete);
        assert!(!opts.durable);
    }

    #[test]
    fn named_queue_is_shared_and_transient() {
        let opts = QueueOptions::named("billing");
        assert_eq!(opts.name, "billing");
        assert!(!opts.exclusive);
        assert!(!opts.durable);
        assert!(!opts.auto_delete);
    }

    #[test]
    fn properties_builder() {
        let props = MessageProperties::with_content_type("application/json")
            .correlation_id("abc")
            .reply_to("amq.gen-1");
        assert_eq!(props.content_type.as_deref(), Some("application/json"));
        assert_eq!(props.correlation_id.as_deref(), Some("abc"));
        assert_eq!(props.reply_to.as_deref(), Some("amq.gen-1"));
    }
}
