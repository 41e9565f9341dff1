//! Service host: owns the input queue and runs the dispatcher over it.

use std::future::Future;
use std::sync::Arc;

use switchyard_core::ServiceInfo;
use tower::Service;

use crate::config::ServiceConfig;
use crate::dispatch::{
    Command, CommandParser, Dispatcher, HandlerError, HandlerTable, JsonCommandParser, Reply,
    TimeoutLayer, TracingLayer,
};
use crate::logging::{RequestLogger, TracingRequestLogger};
use crate::shutdown::{shutdown_signal, ShutdownController};
use crate::transport::{QueueOptions, Transport, TransportError};

/// Errors from hosting a service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// `ping` and `info`, answered by every service.
#[must_use]
pub fn default_handlers(info: Arc<ServiceInfo>) -> HandlerTable {
    HandlerTable::new()
        .with_fn("ping", |_cmd: Command| async { Ok(Reply::Empty) })
        .with_fn("info", move |_cmd: Command| {
            let info = Arc::clone(&info);
            async move { Reply::json(&*info) }
        })
}

/// A service consuming the queue named after it.
pub struct Microservice {
    transport: Arc<dyn Transport>,
    config: ServiceConfig,
    info: Arc<ServiceInfo>,
    handlers: HandlerTable,
    parser: Arc<dyn CommandParser>,
    logger: Arc<dyn RequestLogger>,
    shutdown: Arc<ShutdownController>,
}

impl Microservice {
    /// Declares the service queue and applies the prefetch window.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Setup` naming the step that failed.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: ServiceConfig,
        info: ServiceInfo,
    ) -> Result<Self, ServiceError> {
        transport
            .declare_queue(QueueOptions::named(config.name.clone()))
            .await
            .map_err(|source| ServiceError::Setup {
                step: "declare service queue",
                source,
            })?;
        transport
            .set_prefetch(config.prefetch_count)
            .await
            .map_err(|source| ServiceError::Setup {
                step: "set prefetch",
                source,
            })?;

        let info = Arc::new(info);
        Ok(Self {
            handlers: default_handlers(Arc::clone(&info)),
            logger: TracingRequestLogger::shared(config.name.clone()),
            transport,
            config,
            info,
            parser: Arc::new(JsonCommandParser),
            shutdown: Arc::new(ShutdownController::new()),
        })
    }

    /// Registers a handler, replacing any earlier one with the same name.
    #[must_use]
    pub fn with_handler<S>(mut self, name: impl Into<String>, service: S) -> Self
    where
        S: Service<Command, Response = Reply, Error = HandlerError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.handlers.register(name, service);
        self
    }

    /// Registers an async function as a handler.
    #[must_use]
    pub fn with_handler_fn<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(Command) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.handlers.register_fn(name, handler);
        self
    }

    /// Replaces the request parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn CommandParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Replaces the request logger.
    #[must_use]
    pub fn with_logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Service name; also its input queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Identity returned by `info`.
    #[must_use]
    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<&str> {
        self.handlers.commands()
    }

    /// Handle for triggering shutdown and reading lifecycle state.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Dispatches until `shutdown` resolves, then cleans up.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Transport` if consuming the input queue fails.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<(), ServiceError> {
        let dispatch_config = self.config.dispatcher.clone();
        let handlers = self
            .handlers
            .layered(&TimeoutLayer::new(dispatch_config.handler_timeout))
            .layered(&TracingLayer);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.transport),
            self.config.name.clone(),
            handlers,
            Arc::clone(&self.logger),
        )
        .with_parser(Arc::clone(&self.parser))
        .with_config(dispatch_config)
        .with_shutdown_controller(Arc::clone(&self.shutdown));

        let result = dispatcher.run(shutdown).await;
        let cleanup = cleanup(self.transport.as_ref(), self.logger.as_ref()).await;
        result?;
        cleanup
    }

    /// [`serve`](Self::serve) until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`serve`](Self::serve).
    pub async fn run_until_signal(self) -> Result<(), ServiceError> {
        self.serve(shutdown_signal()).await
    }
}

/// Closes the channel; unacknowledged deliveries go back to the queue.
async fn cleanup(
    transport: &dyn Transport,
    logger: &dyn RequestLogger,
) -> Result<(), ServiceError> {
    if let Err(err) = transport.close().await {
        logger.error("Service cleanup", &err);
        return Err(err.into());
    }
    logger.event("stopped");
    Ok(())
}
