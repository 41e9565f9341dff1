//! Switchyard service: request/response RPC over a message broker.
//!
//! A service consumes the queue named after it and answers `{"cmd": ...}`
//! requests on the requester's reply queue, echoing the request's correlation
//! token. [`RpcClient`] is the requester side, [`Microservice`] the responder
//! side, [`WebPoller`] a rate-limited fetcher for external resources, and
//! [`Publisher`]/[`Subscriber`] a fanout broadcast pair.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod poller;
pub mod pubsub;
pub mod service;
pub mod shutdown;
pub mod transport;

pub use client::{ClientError, RpcClient};
pub use config::{ClientConfig, DispatcherConfig, PollerConfig, ServiceConfig};
pub use dispatch::{Command, Dispatcher, HandlerError, HandlerTable, Reply};
pub use logging::{RequestLogger, TracingRequestLogger};
pub use poller::{FetchError, FetchedResource, HttpFetcher, ResourceFetcher, WebPoller};
pub use pubsub::{Publisher, Subscriber};
pub use service::{Microservice, ServiceError};
pub use shutdown::{shutdown_signal, LifecycleState, ShutdownController};
#[cfg(feature = "amqp")]
pub use transport::AmqpBroker;
pub use transport::{MemoryBroker, Transport, TransportError};
