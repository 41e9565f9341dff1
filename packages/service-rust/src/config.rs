//! Configuration types for services, clients, and pollers.

use std::time::Duration;

/// Configuration of a service hosting a command dispatcher.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name; also the name of the input queue.
    pub name: String,
    /// Unacknowledged deliveries the broker may push before waiting for acks.
    pub prefetch_count: u16,
    pub dispatcher: DispatcherConfig,
}

impl ServiceConfig {
    /// Default configuration for the service called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            prefetch_count: 1,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Dispatch loop settings.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
    /// Grace period for running handlers once shutdown starts.
    pub drain_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// RPC client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long `await_response` waits before abandoning a token.
    pub reply_timeout: Duration,
    /// How long a reply with no registered waiter is kept before it is dropped.
    pub unmatched_reply_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(30),
            unmatched_reply_ttl: Duration::from_secs(5),
        }
    }
}

/// Single-flight poller settings.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Timer period; at most one fetch starts per tick.
    pub interval: Duration,
    /// Per-fetch timeout applied by the HTTP fetcher.
    pub request_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_config_defaults() {
        let config = ServiceConfig::new("billing");
        assert_eq!(config.name, "billing");
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.dispatcher.handler_timeout, Duration::from_secs(30));
        assert_eq!(config.dispatcher.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.reply_timeout, Duration::from_secs(30));
        assert_eq!(config.unmatched_reply_ttl, Duration::from_secs(5));
    }

    #[test]
    fn poller_config_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(1));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
