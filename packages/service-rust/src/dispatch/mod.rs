//! Command dispatch: parse requests, route them to handlers, publish replies.
//!
//! - [`command`]: parsed commands, replies, handler errors, the parser seam
//! - [`table`]: name-to-handler routing as a `tower::Service`
//! - [`middleware`]: timeout and tracing layers applied to every handler
//! - [`responder`]: reply-then-ack publication
//! - [`dispatcher`]: the consume loop with in-flight tracking and drain

pub mod command;
pub mod dispatcher;
pub mod middleware;
pub mod responder;
pub mod table;

pub use command::{Command, CommandParser, HandlerError, JsonCommandParser, ParseError, Reply};
pub use dispatcher::Dispatcher;
pub use middleware::{TimeoutLayer, TracingLayer};
pub use responder::{ReplyOutcome, Responder, REPLY_CONTEXT};
pub use table::{BoxedHandler, HandlerFuture, HandlerTable};
