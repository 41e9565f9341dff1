//! Tower layers applied to every handler in a [`HandlerTable`](super::HandlerTable).
//!
//! - [`TimeoutLayer`]: bounds a single handler invocation
//! - [`TracingLayer`]: records command name, duration and outcome in a span

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::command::{Command, HandlerError, Reply};

type ReplyFuture = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send>>;

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Fails handlers that run longer than a fixed duration with
/// `HandlerError::Timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    /// Fails calls that run longer than `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            timeout: self.timeout,
        }
    }
}

/// Service produced by [`TimeoutLayer`].
#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    timeout: Duration,
}

impl<S> Service<Command> for TimeoutService<S>
where
    S: Service<Command, Response = Reply, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = HandlerError;
    type Future = ReplyFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, command: Command) -> Self::Future {
        let timeout = self.timeout;
        let fut = self.inner.call(command);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(HandlerError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// TracingLayer
// ---------------------------------------------------------------------------

/// Instruments each handler call with a `command` span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLayer;

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService { inner }
    }
}

/// Service produced by [`TracingLayer`].
#[derive(Debug, Clone)]
pub struct TracingService<S> {
    inner: S,
}

impl<S> Service<Command> for TracingService<S>
where
    S: Service<Command, Response = Reply, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = HandlerError;
    type Future = ReplyFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, command: Command) -> Self::Future {
        let span = info_span!(
            "command",
            name = %command.name,
            correlation_id = command
                .correlation_id
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(command);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(HandlerError::Timeout { .. }) => "timeout",
                    Err(_) => "error",
                };
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "command complete");

                result
            }
            .instrument(span),
        )
    }
}
