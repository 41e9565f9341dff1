//! In-process broker implementing the [`Transport`] port.
//!
//! Models the AMQP behaviour the RPC layer relies on: default-exchange routing
//! by queue name, fanout and direct exchanges, exclusive broker-named queues,
//! per-consumer prefetch windows held until ack, competing consumers on one
//! queue, and requeue-on-close of unacknowledged deliveries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{
    ConsumeOptions, Delivery, DeliveryStream, ExchangeKind, MessageProperties, QueueOptions,
    Transport, TransportError, DEFAULT_EXCHANGE,
};

/// Buffer between a queue pump and its consumer.
const CONSUMER_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Broker state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: MessageProperties,
    body: Bytes,
}

impl QueuedMessage {
    fn into_delivery(self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            properties: self.properties,
            body: self.body,
        }
    }

    fn from_delivery(delivery: Delivery) -> Self {
        Self {
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.body,
        }
    }
}

type QueueReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedMessage>>>;

struct QueueState {
    durable: bool,
    exclusive_owner: Option<u64>,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: QueueReceiver,
}

struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
    /// `(queue, routing_key)` pairs.
    bindings: RwLock<HashSet<(String, String)>>,
}

#[derive(Default)]
struct BrokerState {
    queues: DashMap<String, Arc<QueueState>>,
    exchanges: DashMap<String, Arc<ExchangeState>>,
    next_channel_id: AtomicU64,
}

impl BrokerState {
    /// Appends a message to a queue. Returns `false` if the queue is gone.
    fn enqueue(&self, queue: &str, message: QueuedMessage) -> bool {
        match self.queues.get(queue) {
            Some(state) => state.tx.send(message).is_ok(),
            None => false,
        }
    }

    fn delete_queue(&self, name: &str) {
        self.queues.remove(name);
        for exchange in self.exchanges.iter() {
            exchange.bindings.write().retain(|(queue, _)| queue != name);
        }
        debug!(queue = name, "queue deleted");
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

/// Shared in-process broker. Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// An empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel on the broker.
    #[must_use]
    pub fn connect(&self) -> MemoryChannel {
        let id = self.state.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        MemoryChannel {
            id,
            broker: Arc::clone(&self.state),
            prefetch: AtomicU16::new(0),
            next_tag: Arc::new(AtomicU64::new(1)),
            unacked: Arc::new(DashMap::new()),
            consumers: Mutex::new(Vec::new()),
            owned_queues: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a queue named `name` exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Whether an exchange named `name` exists.
    #[must_use]
    pub fn has_exchange(&self, name: &str) -> bool {
        self.state.exchanges.contains_key(name)
    }
}

// ---------------------------------------------------------------------------
// MemoryChannel
// ---------------------------------------------------------------------------

struct Unacked {
    queue: String,
    message: QueuedMessage,
    _permit: Option<OwnedSemaphorePermit>,
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    broker: Arc<BrokerState>,
    prefetch: AtomicU16,
    next_tag: Arc<AtomicU64>,
    unacked: Arc<DashMap<u64, Unacked>>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    owned_queues: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::ChannelClosed)
        } else {
            Ok(())
        }
    }

    /// Number of deliveries handed out and not yet acknowledged.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    /// Stops consumers, requeues unacked deliveries in tag order, and deletes
    /// queues this channel owns.
    fn teardown(&self) {
        for handle in self.consumers.lock().drain(..) {
            handle.abort();
        }

        let mut tags: Vec<u64> = self.unacked.iter().map(|entry| *entry.key()).collect();
        tags.sort_unstable();
        for tag in tags {
            if let Some((_, entry)) = self.unacked.remove(&tag) {
                let mut message = entry.message;
                message.redelivered = true;
                if !self.broker.enqueue(&entry.queue, message) {
                    trace!(queue = %entry.queue, tag, "requeue target gone, dropping delivery");
                }
            }
        }

        for queue in self.owned_queues.lock().drain(..) {
            self.broker.delete_queue(&queue);
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.teardown();
        }
    }
}

#[async_trait]
impl Transport for MemoryChannel {
    async fn declare_queue(&self, options: QueueOptions) -> Result<String, TransportError> {
        self.ensure_open()?;
        let name = if options.name.is_empty() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            options.name.clone()
        };

        if let Some(existing) = self.broker.queues.get(&name) {
            if existing.exclusive_owner.is_some_and(|owner| owner != self.id) {
                return Err(TransportError::ResourceLocked(name));
            }
            if existing.durable != options.durable {
                return Err(TransportError::PreconditionFailed(format!(
                    "queue {name} redeclared with different durability"
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = QueueState {
            durable: options.durable,
            exclusive_owner: options.exclusive.then_some(self.id),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        };
        self.broker.queues.insert(name.clone(), Arc::new(state));
        if options.exclusive || options.auto_delete {
            self.owned_queues.lock().push(name.clone());
        }
        debug!(queue = %name, exclusive = options.exclusive, "queue declared");
        Ok(name)
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if name.is_empty() {
            return Err(TransportError::PreconditionFailed(
                "the default exchange cannot be redeclared".to_string(),
            ));
        }
        if let Some(existing) = self.broker.exchanges.get(name) {
            if existing.kind != kind || existing.durable != durable {
                return Err(TransportError::PreconditionFailed(format!(
                    "exchange {name} redeclared with different type or durability"
                )));
            }
            return Ok(());
        }
        self.broker.exchanges.insert(
            name.to_string(),
            Arc::new(ExchangeState {
                kind,
                durable,
                bindings: RwLock::new(HashSet::new()),
            }),
        );
        debug!(exchange = name, ?kind, "exchange declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        if !self.broker.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue {queue}")));
        }
        let exchange_state = self
            .broker
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::NotFound(format!("exchange {exchange}")))?;
        exchange_state
            .bindings
            .write()
            .insert((queue.to_string(), routing_key.to_string()));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Bytes,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let message = QueuedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            properties,
            body,
        };

        if exchange == DEFAULT_EXCHANGE {
            if !self.broker.enqueue(routing_key, message) {
                trace!(routing_key, "no queue for routing key, message dropped");
            }
            return Ok(());
        }

        let exchange_state = self
            .broker
            .exchanges
            .get(exchange)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TransportError::NotFound(format!("exchange {exchange}")))?;
        let targets: Vec<String> = exchange_state
            .bindings
            .read()
            .iter()
            .filter(|(_, key)| exchange_state.kind == ExchangeKind::Fanout || key == routing_key)
            .map(|(queue, _)| queue.clone())
            .collect();
        for queue in targets {
            self.broker.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.ensure_open()?;
        let rx = {
            let state = self
                .broker
                .queues
                .get(queue)
                .ok_or_else(|| TransportError::NotFound(format!("queue {queue}")))?;
            if state.exclusive_owner.is_some_and(|owner| owner != self.id) {
                return Err(TransportError::ResourceLocked(queue.to_string()));
            }
            Arc::clone(&state.rx)
        };

        let prefetch = self.prefetch.load(Ordering::Relaxed);
        let window = (!options.auto_ack && prefetch > 0)
            .then(|| Arc::new(Semaphore::new(usize::from(prefetch))));
        let (out, stream) = mpsc::channel(CONSUMER_CHANNEL_CAPACITY);

        let pump = QueuePump {
            queue: queue.to_string(),
            rx,
            out,
            broker: Arc::clone(&self.broker),
            next_tag: Arc::clone(&self.next_tag),
            unacked: Arc::clone(&self.unacked),
            window,
            track_unacked: !options.auto_ack,
        };
        let handle = tokio::spawn(pump.run());
        self.consumers.lock().push(handle);
        debug!(queue, auto_ack = options.auto_ack, prefetch, "consumer registered");
        Ok(stream)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), TransportError> {
        self.ensure_open()?;
        match self.unacked.remove(&delivery.delivery_tag) {
            Some(_) => Ok(()),
            None => Err(TransportError::PreconditionFailed(format!(
                "unknown delivery tag {}",
                delivery.delivery_tag
            ))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.teardown();
        debug!(channel = self.id, "channel closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueuePump
// ---------------------------------------------------------------------------

/// Moves messages from a queue to one consumer, honouring the prefetch window.
struct QueuePump {
    queue: String,
    rx: QueueReceiver,
    out: mpsc::Sender<Delivery>,
    broker: Arc<BrokerState>,
    next_tag: Arc<AtomicU64>,
    unacked: Arc<DashMap<u64, Unacked>>,
    window: Option<Arc<Semaphore>>,
    track_unacked: bool,
}

impl QueuePump {
    async fn run(self) {
        loop {
            let permit = match &self.window {
                Some(window) => tokio::select! {
                    permit = Arc::clone(window).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    () = self.out.closed() => break,
                },
                None => None,
            };

            let message = tokio::select! {
                message = async { self.rx.lock().await.recv().await } => message,
                () = self.out.closed() => None,
            };
            let Some(message) = message else { break };

            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            if self.track_unacked {
                self.unacked.insert(
                    tag,
                    Unacked {
                        queue: self.queue.clone(),
                        message: message.clone(),
                        _permit: permit,
                    },
                );
            }

            if let Err(mpsc::error::SendError(delivery)) =
                self.out.send(message.into_delivery(tag)).await
            {
                self.unacked.remove(&tag);
                let mut message = QueuedMessage::from_delivery(delivery);
                message.redelivered = true;
                self.broker.enqueue(&self.queue, message);
                break;
            }
        }
        trace!(queue = %self.queue, "queue pump stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn body(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    async fn recv(stream: &mut DeliveryStream) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("delivery should arrive")
            .expect("stream should be open")
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel.declare_queue(QueueOptions::named("orders")).await.unwrap();
        let mut stream = channel
            .consume("orders", ConsumeOptions::auto_ack())
            .await
            .unwrap();

        let props = MessageProperties::with_content_type("text/plain").correlation_id("c-1");
        channel
            .publish(DEFAULT_EXCHANGE, "orders", props.clone(), body("hi"))
            .await
            .unwrap();

        let delivery = recv(&mut stream).await;
        assert_eq!(delivery.body, body("hi"));
        assert_eq!(delivery.properties, props);
        assert!(!delivery.redelivered);
    }

    #[tokio::test]
    async fn publish_to_missing_queue_is_dropped() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel
            .publish(DEFAULT_EXCHANGE, "nowhere", MessageProperties::default(), body("x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_to_undeclared_exchange_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        let err = channel
            .publish("events", "", MessageProperties::default(), body("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn exclusive_queue_is_broker_named_and_locked() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();

        let name = owner.declare_queue(QueueOptions::exclusive()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let err = other
            .consume(&name, ConsumeOptions::auto_ack())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ResourceLocked(_)));

        owner.close().await.unwrap();
        assert!(!broker.has_queue(&name));
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel
            .declare_exchange("news", ExchangeKind::Fanout, true)
            .await
            .unwrap();
        let a = channel.declare_queue(QueueOptions::exclusive()).await.unwrap();
        let b = channel.declare_queue(QueueOptions::exclusive()).await.unwrap();
        channel.bind_queue(&a, "news", "").await.unwrap();
        channel.bind_queue(&b, "news", "").await.unwrap();
        let mut sa = channel.consume(&a, ConsumeOptions::auto_ack()).await.unwrap();
        let mut sb = channel.consume(&b, ConsumeOptions::auto_ack()).await.unwrap();

        channel
            .publish("news", "", MessageProperties::default(), body("Hello"))
            .await
            .unwrap();

        assert_eq!(recv(&mut sa).await.body, body("Hello"));
        assert_eq!(recv(&mut sb).await.body, body("Hello"));
    }

    #[tokio::test]
    async fn direct_exchange_matches_routing_key() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel
            .declare_exchange("logs", ExchangeKind::Direct, false)
            .await
            .unwrap();
        let q = channel.declare_queue(QueueOptions::exclusive()).await.unwrap();
        channel.bind_queue(&q, "logs", "error").await.unwrap();
        let mut stream = channel.consume(&q, ConsumeOptions::auto_ack()).await.unwrap();

        channel
            .publish("logs", "info", MessageProperties::default(), body("skip"))
            .await
            .unwrap();
        channel
            .publish("logs", "error", MessageProperties::default(), body("keep"))
            .await
            .unwrap();

        assert_eq!(recv(&mut stream).await.body, body("keep"));
    }

    #[tokio::test]
    async fn redeclaring_exchange_with_other_kind_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel
            .declare_exchange("x", ExchangeKind::Fanout, true)
            .await
            .unwrap();
        let err = channel
            .declare_exchange("x", ExchangeKind::Direct, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn prefetch_window_holds_until_ack() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel.declare_queue(QueueOptions::named("work")).await.unwrap();
        channel.set_prefetch(1).await.unwrap();
        let mut stream = channel
            .consume("work", ConsumeOptions::manual_ack())
            .await
            .unwrap();

        for text in ["one", "two"] {
            channel
                .publish(DEFAULT_EXCHANGE, "work", MessageProperties::default(), body(text))
                .await
                .unwrap();
        }

        let first = recv(&mut stream).await;
        assert_eq!(first.body, body("one"));
        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.recv()).await;
        assert!(blocked.is_err(), "second delivery must wait for ack");

        channel.ack(&first).await.unwrap();
        assert_eq!(recv(&mut stream).await.body, body("two"));
    }

    #[tokio::test]
    async fn ack_of_unknown_tag_fails() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        let delivery = Delivery {
            delivery_tag: 99,
            exchange: String::new(),
            routing_key: "q".to_string(),
            redelivered: false,
            properties: MessageProperties::default(),
            body: Bytes::new(),
        };
        let err = channel.ack(&delivery).await.unwrap_err();
        assert!(matches!(err, TransportError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn close_requeues_unacked_deliveries() {
        let broker = MemoryBroker::new();
        let first = broker.connect();
        first.declare_queue(QueueOptions::named("jobs")).await.unwrap();
        let mut stream = first
            .consume("jobs", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        first
            .publish(DEFAULT_EXCHANGE, "jobs", MessageProperties::default(), body("job"))
            .await
            .unwrap();
        let delivery = recv(&mut stream).await;
        assert!(!delivery.redelivered);
        assert_eq!(first.unacked_count(), 1);

        first.close().await.unwrap();
        assert!(stream.recv().await.is_none());

        let second = broker.connect();
        let mut stream = second
            .consume("jobs", ConsumeOptions::manual_ack())
            .await
            .unwrap();
        let again = recv(&mut stream).await;
        assert_eq!(again.body, body("job"));
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        let err = channel
            .publish(DEFAULT_EXCHANGE, "q", MessageProperties::default(), body("x"))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed);
    }

    #[tokio::test]
    async fn competing_consumers_share_a_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.connect();
        channel.declare_queue(QueueOptions::named("shared")).await.unwrap();
        let mut a = channel.consume("shared", ConsumeOptions::auto_ack()).await.unwrap();
        let mut b = channel.consume("shared", ConsumeOptions::auto_ack()).await.unwrap();

        for i in 0..4 {
            channel
                .publish(
                    DEFAULT_EXCHANGE,
                    "shared",
                    MessageProperties::default(),
                    body(&i.to_string()),
                )
                .await
                .unwrap();
        }

        let mut received = 0;
        while received < 4 {
            tokio::select! {
                Some(_) = a.recv() => received += 1,
                Some(_) = b.recv() => received += 1,
            }
        }
        assert_eq!(received, 4);
    }
}
