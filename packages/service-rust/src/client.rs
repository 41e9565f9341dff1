//! RPC client: publishes commands to a service queue and collects replies.
//!
//! Every client owns one exclusive reply queue. A single reader task consumes
//! it and hands each reply to the waiter registered under the reply's
//! correlation token, so concurrent requests on one client never see each
//! other's replies. A waiter is registered before its request is published;
//! a reply that still finds no waiter (the caller timed out, or never asked)
//! is parked for a short TTL and then dropped. Tokens sent but never awaited
//! are swept by the reader once `reply_timeout` has passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use switchyard_core::{
    encode_command, encode_request, CorrelationId, ErrorResponse, ProtocolError, Response,
    CONTENT_TYPE_JSON,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::logging::RequestLogger;
use crate::transport::{
    ConsumeOptions, DeliveryStream, MessageProperties, QueueOptions, Transport, TransportError,
    DEFAULT_EXCHANGE,
};

/// Context reported by the client's request logger.
pub const CLIENT_CONTEXT: &str = "RPC client";

/// Floor for the sweep period; `reply_timeout` may be configured as zero.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Errors returned by [`RpcClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no reply for {token} within {timeout_ms}ms")]
    Timeout {
        token: CorrelationId,
        timeout_ms: u64,
    },
    #[error("token {0} was not sent by this client")]
    UnknownToken(CorrelationId),
    #[error("client is closed")]
    Closed,
    /// The service answered with an error envelope.
    #[error("{}: {}", .0.context, .0.error)]
    Remote(ErrorResponse),
    #[error("failed to decode reply: {0}")]
    Decode(serde_json::Error),
}

// ---------------------------------------------------------------------------
// ReplyRegistry
// ---------------------------------------------------------------------------

/// Waiters and parked replies keyed by correlation token.
struct ReplyRegistry {
    /// Sending halves, taken by the reader task when the reply arrives.
    waiters: DashMap<CorrelationId, oneshot::Sender<Bytes>>,
    /// Receiving halves with their registration time, taken by `await_response`.
    receivers: DashMap<CorrelationId, (Instant, oneshot::Receiver<Bytes>)>,
    unmatched: DashMap<CorrelationId, (Instant, Bytes)>,
    reply_timeout: Duration,
    unmatched_ttl: Duration,
}

impl ReplyRegistry {
    fn new(config: &ClientConfig) -> Self {
        Self {
            waiters: DashMap::new(),
            receivers: DashMap::new(),
            unmatched: DashMap::new(),
            reply_timeout: config.reply_timeout,
            unmatched_ttl: config.unmatched_reply_ttl,
        }
    }

    fn register(&self, token: &CorrelationId) {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(token.clone(), tx);
        self.receivers.insert(token.clone(), (Instant::now(), rx));
    }

    fn forget(&self, token: &CorrelationId) {
        self.waiters.remove(token);
        self.receivers.remove(token);
    }

    fn deliver(&self, token: CorrelationId, body: Bytes) {
        if let Some((_, waiter)) = self.waiters.remove(&token) {
            if waiter.send(body).is_err() {
                trace!(%token, "waiter gone before its reply arrived");
            }
            return;
        }

        self.prune_unmatched();
        debug!(%token, "reply without a waiter, parking it");
        self.unmatched.insert(token, (Instant::now(), body));
    }

    fn take_unmatched(&self, token: &CorrelationId) -> Option<Bytes> {
        self.prune_unmatched();
        self.unmatched.remove(token).map(|(_, (_, body))| body)
    }

    fn prune_unmatched(&self) {
        let ttl = self.unmatched_ttl;
        self.unmatched
            .retain(|_, (received, _)| received.elapsed() < ttl);
    }

    /// Drops tokens nobody started awaiting within `reply_timeout`.
    ///
    /// Tokens being awaited are no longer in `receivers`; their waiter is
    /// released by `await_response` itself.
    fn prune_abandoned(&self) {
        let ttl = self.reply_timeout;
        let mut expired = Vec::new();
        self.receivers.retain(|token, (registered, _)| {
            let keep = registered.elapsed() < ttl;
            if !keep {
                expired.push(token.clone());
            }
            keep
        });
        for token in &expired {
            self.waiters.remove(token);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept tokens that were never awaited");
        }
        self.prune_unmatched();
    }

    /// Wakes every waiter with "stream closed".
    fn close(&self) {
        self.waiters.clear();
    }
}

// ---------------------------------------------------------------------------
// RpcClient
// ---------------------------------------------------------------------------

/// Removes a token's waiter when the awaiting future finishes or is dropped.
struct ReleaseWaiter<'a> {
    registry: &'a ReplyRegistry,
    token: &'a CorrelationId,
}

impl Drop for ReleaseWaiter<'_> {
    fn drop(&mut self) {
        self.registry.waiters.remove(self.token);
    }
}

/// Request/response client over a [`Transport`] channel.
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    reply_to: String,
    registry: Arc<ReplyRegistry>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
    logger: Arc<dyn RequestLogger>,
    closed: AtomicBool,
}

impl RpcClient {
    /// Declares the reply queue and starts the reader task.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if the reply queue cannot be declared
    /// or consumed.
    pub async fn open(
        transport: Arc<dyn Transport>,
        config: ClientConfig,
        logger: Arc<dyn RequestLogger>,
    ) -> Result<Self, ClientError> {
        let reply_to = transport.declare_queue(QueueOptions::exclusive()).await?;
        let stream = transport
            .consume(&reply_to, ConsumeOptions::auto_ack())
            .await?;

        let registry = Arc::new(ReplyRegistry::new(&config));
        let reader = tokio::spawn(read_replies(stream, Arc::clone(&registry)));
        debug!(reply_to = %reply_to, "rpc client opened");

        Ok(Self {
            transport,
            reply_to,
            registry,
            reader: Mutex::new(Some(reader)),
            config,
            logger,
            closed: AtomicBool::new(false),
        })
    }

    /// Name of the reply queue stamped on every request.
    #[must_use]
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Tokens sent and not yet answered or abandoned.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.registry.waiters.len()
    }

    /// Publishes an encoded request to `service`'s queue.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Closed` after [`close`](Self::close) and
    /// `ClientError::Transport` if publishing fails.
    pub async fn send(
        &self,
        service: &str,
        token: &CorrelationId,
        body: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }

        self.registry.register(token);
        let properties = MessageProperties::with_content_type(CONTENT_TYPE_JSON)
            .correlation_id(token.as_str())
            .reply_to(self.reply_to.as_str());

        if let Err(err) = self
            .transport
            .publish(DEFAULT_EXCHANGE, service, properties, body.into())
            .await
        {
            self.registry.forget(token);
            self.logger.error(CLIENT_CONTEXT, &err);
            return Err(err.into());
        }
        trace!(service, %token, "request published");
        Ok(())
    }

    /// Waits for the reply to `token`.
    ///
    /// Returns `Ok(None)` if the reply stream closed before the reply came.
    /// Dropping the returned future abandons the token.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Timeout` once `reply_timeout` elapses (the token
    /// is abandoned) and `ClientError::UnknownToken` for a token this client
    /// is not waiting on.
    pub async fn await_response(
        &self,
        token: &CorrelationId,
    ) -> Result<Option<Bytes>, ClientError> {
        if let Some(body) = self.registry.take_unmatched(token) {
            return Ok(Some(body));
        }
        let Some((_, (_, receiver))) = self.registry.receivers.remove(token) else {
            return Err(ClientError::UnknownToken(token.clone()));
        };
        let _release = ReleaseWaiter {
            registry: &self.registry,
            token,
        };

        match tokio::time::timeout(self.config.reply_timeout, receiver).await {
            Ok(Ok(body)) => Ok(Some(body)),
            Ok(Err(_closed)) => Ok(None),
            Err(_elapsed) => Err(ClientError::Timeout {
                token: token.clone(),
                timeout_ms: u64::try_from(self.config.reply_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    /// Sends `command` without arguments and waits for the raw reply body.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send) and [`await_response`](Self::await_response);
    /// a closed reply stream is reported as `ClientError::Closed`.
    pub async fn call(&self, service: &str, command: &str) -> Result<Bytes, ClientError> {
        let (token, body) = encode_command(command)?;
        self.roundtrip(service, command, &token, body).await
    }

    /// Sends `command` with `arguments` merged into the request object.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus `ClientError::Protocol` for arguments
    /// that are not a JSON object.
    pub async fn call_with<A: Serialize + ?Sized>(
        &self,
        service: &str,
        command: &str,
        arguments: &A,
    ) -> Result<Bytes, ClientError> {
        let (token, body) = encode_request(command, arguments)?;
        self.roundtrip(service, command, &token, body).await
    }

    /// Like [`call_with`](Self::call_with), decoding the reply as `T`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Remote` when the service answered with an error
    /// envelope and `ClientError::Decode` when the reply is not a `T`.
    pub async fn call_json<T, A>(
        &self,
        service: &str,
        command: &str,
        arguments: &A,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        A: Serialize + ?Sized,
    {
        let body = self.call_with(service, command, arguments).await?;
        match Response::from_body(body.to_vec()) {
            Response::Error(envelope) => Err(ClientError::Remote(envelope)),
            Response::Success(body) => serde_json::from_slice(&body).map_err(ClientError::Decode),
        }
    }

    async fn roundtrip(
        &self,
        service: &str,
        command: &str,
        token: &CorrelationId,
        body: Vec<u8>,
    ) -> Result<Bytes, ClientError> {
        self.logger.request(command, Some(token.as_str()));
        self.send(service, token, body).await?;
        self.await_response(token).await?.ok_or(ClientError::Closed)
    }

    /// Stops the reader and closes the channel. Later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Transport` if closing the channel fails.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.registry.close();
        self.transport.close().await?;
        debug!(reply_to = %self.reply_to, "rpc client closed");
        Ok(())
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

async fn read_replies(mut stream: DeliveryStream, registry: Arc<ReplyRegistry>) {
    let period = registry.reply_timeout.max(MIN_SWEEP_PERIOD);
    let mut sweep = tokio::time::interval_at(Instant::now() + period, period);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            delivery = stream.recv() => {
                let Some(delivery) = delivery else { break };
                let Some(token) = delivery.properties.correlation_id else {
                    trace!("reply without correlation id, dropping");
                    continue;
                };
                registry.deliver(CorrelationId::from(token), delivery.body);
            }
            _ = sweep.tick() => registry.prune_abandoned(),
        }
    }
    debug!("reply stream ended");
    registry.close();
}
