//! The dispatch loop: consume the input queue, route, reply, acknowledge.

use std::future::Future;
use std::sync::Arc;

use switchyard_core::{CorrelationId, ErrorResponse, DISPATCHER_CONTEXT};
use tower::{Service, ServiceExt};
use tracing::{debug, warn};

use super::command::{CommandParser, HandlerError, JsonCommandParser};
use super::responder::Responder;
use super::table::{HandlerFuture, HandlerTable};
use crate::config::DispatcherConfig;
use crate::logging::RequestLogger;
use crate::shutdown::ShutdownController;
use crate::transport::{ConsumeOptions, Delivery, Transport, TransportError};

/// Consumes one queue and answers every delivery on it.
///
/// Each delivery runs in its own task, so a slow handler does not block the
/// loop; the broker's prefetch window bounds how many run at once.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    queue: String,
    handlers: HandlerTable,
    parser: Arc<dyn CommandParser>,
    responder: Responder,
    logger: Arc<dyn RequestLogger>,
    shutdown: Arc<ShutdownController>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// A dispatcher consuming `queue` and routing through `handlers`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: impl Into<String>,
        handlers: HandlerTable,
        logger: Arc<dyn RequestLogger>,
    ) -> Self {
        Self {
            responder: Responder::new(Arc::clone(&transport), Arc::clone(&logger)),
            transport,
            queue: queue.into(),
            handlers,
            parser: Arc::new(JsonCommandParser),
            logger,
            shutdown: Arc::new(ShutdownController::new()),
            config: DispatcherConfig::default(),
        }
    }

    /// Replaces the request parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn CommandParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replaces prefetch, timeout and drain settings.
    #[must_use]
    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an externally owned controller, e.g. to trigger shutdown from elsewhere.
    #[must_use]
    pub fn with_shutdown_controller(mut self, shutdown: Arc<ShutdownController>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle for stopping the loop from outside.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Runs until `shutdown` resolves, the controller is triggered, or the
    /// consumer stream ends; then waits up to `drain_timeout` for running
    /// handlers.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the consumer cannot be registered.
    pub async fn run(
        mut self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), TransportError> {
        let mut deliveries = self
            .transport
            .consume(&self.queue, ConsumeOptions::manual_ack())
            .await?;
        self.shutdown.set_ready();
        self.logger.event("Awaiting RPC requests");

        tokio::pin!(shutdown);
        let triggered = self.shutdown.wait_for_shutdown();
        tokio::pin!(triggered);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                () = &mut triggered => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.handle(delivery).await,
                    None => {
                        warn!(queue = %self.queue, "consumer stream ended");
                        break;
                    }
                },
            }
        }

        self.shutdown.trigger_shutdown();
        drop(deliveries);
        if !self.shutdown.wait_for_drain(self.config.drain_timeout).await {
            warn!(
                in_flight = self.shutdown.in_flight_count(),
                "drain timeout expired with handlers still running"
            );
        }
        Ok(())
    }

    async fn handle(&mut self, delivery: Delivery) {
        let guard = self.shutdown.in_flight_guard();
        let responder = self.responder.clone();

        let command = match self.parser.parse(&delivery) {
            Ok(command) => command,
            Err(err) => {
                self.logger.error(DISPATCHER_CONTEXT, &err);
                let response = ErrorResponse::new(err.to_string(), DISPATCHER_CONTEXT);
                tokio::spawn(async move {
                    let _guard = guard;
                    responder.reply_error(&delivery, &response).await;
                });
                return;
            }
        };

        self.logger.request(
            &command.name,
            command.correlation_id.as_ref().map(CorrelationId::as_str),
        );
        let handler: HandlerFuture = match self.handlers.ready().await {
            Ok(handlers) => handlers.call(command),
            Err(err) => Box::pin(async move { Err(err) }),
        };

        let logger = Arc::clone(&self.logger);
        tokio::spawn(async move {
            let _guard = guard;
            // A panicking handler becomes an error reply instead of a lost request.
            let result = match tokio::spawn(handler).await {
                Ok(result) => result,
                Err(join_err) => {
                    debug!(error = %join_err, "handler task failed");
                    Err(HandlerError::failed("handler panicked", DISPATCHER_CONTEXT))
                }
            };
            match result {
                Ok(reply) => {
                    responder.reply(&delivery, reply.into_body()).await;
                }
                Err(err) => {
                    logger.error(err.context(), &err);
                    responder.reply_error(&delivery, &err.to_response()).await;
                }
            }
        });
    }
}
