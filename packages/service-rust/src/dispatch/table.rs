//! Handler table: routes a [`Command`] to the handler registered under its name.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{service_fn, Layer, Service};

use super::command::{Command, HandlerError, Reply};

/// Future returned by every handler once erased.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, HandlerError>> + Send>>;

/// A type-erased handler service.
pub type BoxedHandler = Box<
    dyn Service<Command, Response = Reply, Error = HandlerError, Future = HandlerFuture> + Send,
>;

// ---------------------------------------------------------------------------
// HandlerTable
// ---------------------------------------------------------------------------

/// Maps command names to handlers.
///
/// Commands with no registered handler resolve to
/// `HandlerError::UnknownCommand`. Registering a name twice replaces the
/// earlier handler.
pub struct HandlerTable {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a `tower::Service` under `name`.
    pub fn register<S>(&mut self, name: impl Into<String>, service: S)
    where
        S: Service<Command, Response = Reply, Error = HandlerError> + Send + 'static,
        S::Future: Send + 'static,
    {
        self.handlers
            .insert(name.into(), Box::new(HandlerWrapper(service)));
    }

    /// Registers an async function under `name`.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: FnMut(Command) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.register(name, service_fn(handler));
    }

    /// Builder form of [`register_fn`](Self::register_fn).
    #[must_use]
    pub fn with_fn<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: FnMut(Command) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.register_fn(name, handler);
        self
    }

    /// Wraps every registered handler in `layer`.
    #[must_use]
    pub fn layered<L>(self, layer: &L) -> Self
    where
        L: Layer<BoxedHandler>,
        L::Service: Service<Command, Response = Reply, Error = HandlerError> + Send + 'static,
        <L::Service as Service<Command>>::Future: Send + 'static,
    {
        let handlers = self
            .handlers
            .into_iter()
            .map(|(name, handler)| {
                let wrapped: BoxedHandler = Box::new(HandlerWrapper(layer.layer(handler)));
                (name, wrapped)
            })
            .collect();
        Self { handlers }
    }

    /// Moves every handler from `other` into this table, replacing duplicates.
    pub fn merge(&mut self, other: HandlerTable) {
        self.handlers.extend(other.handlers);
    }

    /// Whether `name` has a handler.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered command names, sorted.
    #[must_use]
    pub fn commands(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no command is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Command> for HandlerTable {
    type Response = Reply;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        for handler in self.handlers.values_mut() {
            match handler.poll_ready(cx) {
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, command: Command) -> Self::Future {
        match self.handlers.get_mut(&command.name) {
            Some(handler) => handler.call(command),
            None => Box::pin(async move { Err(HandlerError::UnknownCommand(command.name)) }),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerWrapper
// ---------------------------------------------------------------------------

/// Erases a concrete handler's future type.
struct HandlerWrapper<S>(S);

impl<S> Service<Command> for HandlerWrapper<S>
where
    S: Service<Command, Response = Reply, Error = HandlerError> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = HandlerError;
    type Future = HandlerFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.0.poll_ready(cx)
    }

    fn call(&mut self, command: Command) -> Self::Future {
        Box::pin(self.0.call(command))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    fn echo_table() -> HandlerTable {
        HandlerTable::new()
            .with_fn("echo", |cmd: Command| async move { Ok(Reply::Json(cmd.arguments)) })
            .with_fn("empty", |_cmd: Command| async { Ok(Reply::Empty) })
    }

    #[tokio::test]
    async fn routes_by_command_name() {
        let mut table = echo_table();
        let cmd = Command::new("echo").with_arguments(json!({"x": 1}));
        let reply = table.ready().await.unwrap().call(cmd).await.unwrap();
        assert_eq!(reply, Reply::Json(json!({"x": 1})));

        let reply = table.oneshot(Command::new("empty")).await.unwrap();
        assert_eq!(reply, Reply::Empty);
    }

    #[tokio::test]
    async fn unknown_command_is_reported_by_name() {
        let table = echo_table();
        let err = table.oneshot(Command::new("nope")).await.unwrap_err();
        assert!(matches!(err, HandlerError::UnknownCommand(name) if name == "nope"));
    }

    #[tokio::test]
    async fn later_registration_replaces_earlier() {
        let mut table = echo_table();
        table.register_fn("empty", |_cmd: Command| async {
            Ok(Reply::Raw(bytes::Bytes::from_static(b"v2")))
        });
        assert_eq!(table.len(), 2);
        let reply = table.oneshot(Command::new("empty")).await.unwrap();
        assert_eq!(reply.into_body(), bytes::Bytes::from_static(b"v2"));
    }

    #[test]
    fn lists_sorted_commands() {
        let mut table = echo_table();
        let mut extra = HandlerTable::new();
        extra.register_fn("alpha", |_cmd: Command| async { Ok(Reply::Empty) });
        table.merge(extra);
        assert_eq!(table.commands(), vec!["alpha", "echo", "empty"]);
        assert!(table.contains("alpha"));
        assert!(!HandlerTable::default().contains("alpha"));
        assert!(HandlerTable::default().is_empty());
    }
}
