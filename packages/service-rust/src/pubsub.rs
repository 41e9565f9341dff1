//! Broadcast over durable fanout exchanges.
//!
//! Every [`Subscriber`] gets its own broker-named queue bound to the
//! exchange, so each one sees every message emitted after it connected.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::transport::{
    ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, MessageProperties, QueueOptions,
    Transport, TransportError,
};

/// Content type used by plain-text broadcasts.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

async fn declare_fanout(
    transport: &dyn Transport,
    exchange: &str,
) -> Result<(), TransportError> {
    transport
        .declare_exchange(exchange, ExchangeKind::Fanout, true)
        .await
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Emits messages to every subscriber of an exchange.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    exchange: String,
}

impl Publisher {
    /// Declares the fanout exchange.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the exchange cannot be declared.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        exchange: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let exchange = exchange.into();
        declare_fanout(transport.as_ref(), &exchange).await?;
        Ok(Self {
            transport,
            exchange,
        })
    }

    /// Fanout exchange this publisher emits to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// # Errors
    ///
    /// Returns `TransportError` if publishing fails.
    pub async fn emit(
        &self,
        content_type: &str,
        data: impl Into<Bytes>,
    ) -> Result<(), TransportError> {
        self.transport
            .publish(
                &self.exchange,
                "",
                MessageProperties::with_content_type(content_type),
                data.into(),
            )
            .await
    }

    /// # Errors
    ///
    /// Returns `TransportError` if the channel fails to close.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Receives every message emitted on an exchange.
pub struct Subscriber {
    transport: Arc<dyn Transport>,
    exchange: String,
    queue: String,
    /// Consumer shared by `receive_once` calls, registered on first use.
    stream: Mutex<Option<DeliveryStream>>,
}

impl Subscriber {
    /// Declares the exchange and binds a private queue to it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if any declaration or the binding fails.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        exchange: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let exchange = exchange.into();
        declare_fanout(transport.as_ref(), &exchange).await?;
        let queue = transport.declare_queue(QueueOptions::exclusive()).await?;
        transport.bind_queue(&queue, &exchange, "").await?;
        debug!(exchange = %exchange, queue = %queue, "subscriber bound");
        Ok(Self {
            transport,
            exchange,
            queue,
            stream: Mutex::new(None),
        })
    }

    /// Fanout exchange the subscriber is bound to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Broker-named queue bound to the exchange.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Takes the message stream, registering a consumer if needed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the consumer cannot be registered.
    pub async fn receive(&self) -> Result<DeliveryStream, TransportError> {
        if let Some(stream) = self.stream.lock().await.take() {
            return Ok(stream);
        }
        self.consume().await
    }

    /// Waits for the next message. `None` once the channel has closed.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the consumer cannot be registered.
    pub async fn receive_once(&self) -> Result<Option<Delivery>, TransportError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            *guard = Some(self.consume().await?);
        }
        match guard.as_mut() {
            Some(stream) => Ok(stream.recv().await),
            None => Ok(None),
        }
    }

    /// Forwards messages to `out` until the stream or `out` closes.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the consumer cannot be registered.
    pub async fn forward(&self, out: mpsc::Sender<Delivery>) -> Result<(), TransportError> {
        let mut stream = self.receive().await?;
        while let Some(delivery) = stream.recv().await {
            if out.send(delivery).await.is_err() {
                break;
            }
        }
        debug!(exchange = %self.exchange, "subscriber forwarding stopped");
        Ok(())
    }

    /// Closes the channel; the private queue is deleted with it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the channel fails to close.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.close().await
    }

    async fn consume(&self) -> Result<DeliveryStream, TransportError> {
        self.transport
            .consume(&self.queue, ConsumeOptions::auto_ack())
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::MemoryBroker;

    async fn next(subscriber: &Subscriber) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), subscriber.receive_once())
            .await
            .expect("message should arrive")
            .unwrap()
            .expect("stream open")
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_message() {
        let broker = MemoryBroker::new();
        let first = Subscriber::connect(Arc::new(broker.connect()), "events")
            .await
            .unwrap();
        let second = Subscriber::connect(Arc::new(broker.connect()), "events")
            .await
            .unwrap();
        assert_ne!(first.queue(), second.queue());

        let publisher = Publisher::connect(Arc::new(broker.connect()), "events")
            .await
            .unwrap();
        publisher.emit(CONTENT_TYPE_TEXT, "hello").await.unwrap();
        publisher.emit(CONTENT_TYPE_TEXT, "again").await.unwrap();

        for subscriber in [&first, &second] {
            let message = next(subscriber).await;
            assert_eq!(message.body, Bytes::from_static(b"hello"));
            assert_eq!(message.properties.content_type.as_deref(), Some(CONTENT_TYPE_TEXT));
            assert_eq!(next(subscriber).await.body, Bytes::from_static(b"again"));
        }
    }

    #[tokio::test]
    async fn forward_relays_until_output_closes() {
        let broker = MemoryBroker::new();
        let subscriber = Arc::new(
            Subscriber::connect(Arc::new(broker.connect()), "ticks")
                .await
                .unwrap(),
        );
        let publisher = Publisher::connect(Arc::new(broker.connect()), "ticks")
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let forwarder = tokio::spawn({
            let subscriber = Arc::clone(&subscriber);
            async move { subscriber.forward(tx).await }
        });

        publisher.emit(CONTENT_TYPE_TEXT, "1").await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body, Bytes::from_static(b"1"));

        drop(rx);
        publisher.emit(CONTENT_TYPE_TEXT, "2").await.unwrap();
        forwarder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_deletes_private_queue() {
        let broker = MemoryBroker::new();
        let subscriber = Subscriber::connect(Arc::new(broker.connect()), "gone")
            .await
            .unwrap();
        let queue = subscriber.queue().to_string();
        assert!(broker.has_queue(&queue));
        assert!(broker.has_exchange("gone"));

        subscriber.close().await.unwrap();
        assert!(!broker.has_queue(&queue));
    }

    #[tokio::test]
    async fn publisher_rejects_conflicting_exchange() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel
            .declare_exchange("mixed", ExchangeKind::Direct, true)
            .await
            .unwrap();
        let err = Publisher::connect(Arc::new(broker.connect()), "mixed")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }
}
