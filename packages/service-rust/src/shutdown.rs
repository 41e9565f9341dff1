//! Service shutdown: lifecycle state, in-flight handler tracking, OS signals.
//!
//! The dispatch loop takes an [`InFlightGuard`] for every delivery it hands
//! to a handler. On shutdown the loop stops pulling deliveries and waits a
//! bounded grace period for the guards to drop before the service closes its
//! channel.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};
use tracing::{error, info};

/// Where a service is in its life.
///
/// Moves forward only: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Declaring queues; not yet consuming.
    Starting,
    /// Consuming its input queue.
    Ready,
    /// Stopped consuming; handlers may still be running.
    Draining,
    /// Every handler finished.
    Stopped,
}

/// Counter shared between the controller and its guards.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

/// Coordinates shutdown between the dispatch loop and running handlers.
#[derive(Debug)]
pub struct ShutdownController {
    triggered: watch::Sender<bool>,
    state: ArcSwap<LifecycleState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            triggered: watch::Sender::new(false),
            state: ArcSwap::from_pointee(LifecycleState::Starting),
            in_flight: Arc::default(),
        }
    }

    /// Marks the service as consuming.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
    }

    /// Moves to `Draining` and wakes every [`wait_for_shutdown`](Self::wait_for_shutdown).
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        self.triggered.send_replace(true);
    }

    /// Resolves once shutdown has been triggered, immediately if it already was.
    pub fn wait_for_shutdown(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut triggered = self.triggered.subscribe();
        async move {
            // Err means the controller is gone, which ends the wait too.
            let _ = triggered.wait_for(|fired| *fired).await;
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Counts a running handler until the guard drops, unwinding included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Handlers currently holding a guard.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every guard to drop.
    ///
    /// On success the state becomes `Stopped` and `true` is returned. On
    /// timeout the state stays `Draining` and `false` is returned.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.in_flight.drained.notified();
                tokio::pin!(notified);
                // Register before checking so a guard dropped in between still wakes us.
                notified.as_mut().enable();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };

        if tokio::time::timeout(timeout, drained).await.is_err() {
            return false;
        }
        self.state.store(Arc::new(LifecycleState::Stopped));
        true
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks one running handler; see [`ShutdownController::in_flight_guard`].
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

/// Resolves on SIGINT or (on unix) SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
