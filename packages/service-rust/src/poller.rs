//! Single-flight poller: rate-limited, one-at-a-time fetches of external resources.
//!
//! Callers enqueue requests; a background loop wakes once per interval and, if
//! a request is waiting, performs exactly one fetch and hands the result back
//! to that caller. While a request is pending or in flight, later callers wait
//! their turn in arrival order, so the remote side never sees two requests at
//! once and never more than one per interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::PollerConfig;

/// Shortest tick period; shorter intervals, zero included, are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A resource to fetch.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub target: String,
    pub method: Method,
    pub headers: HeaderMap,
}

impl ResourceRequest {
    /// A request with no headers.
    #[must_use]
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method,
            headers: HeaderMap::new(),
        }
    }

    /// Replaces the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// A fetched resource. The status is not interpreted.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Why a fetch produced no resource.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no connectivity: {0}")]
    NoConnectivity(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to decode resource: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("poller stopped")]
    Stopped,
}

// ---------------------------------------------------------------------------
// ResourceFetcher
// ---------------------------------------------------------------------------

/// Performs one fetch. The poller never calls it concurrently.
#[async_trait]
pub trait ResourceFetcher: Send + Sync + 'static {
    /// # Errors
    ///
    /// Returns `FetchError` when the resource could not be retrieved.
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource, FetchError>;
}

/// [`ResourceFetcher`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a client with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidRequest` if the HTTP client cannot be built.
    pub fn new(request_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an already configured client.
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceFetcher for HttpFetcher {
    async fn fetch(&self, request: &ResourceRequest) -> Result<FetchedResource, FetchError> {
        let url = reqwest::Url::parse(&request.target)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.target)))?;
        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    FetchError::InvalidRequest(e.to_string())
                } else {
                    FetchError::NoConnectivity(e.to_string())
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::NoConnectivity(e.to_string()))?;
        Ok(FetchedResource {
            status,
            headers,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// WebPoller
// ---------------------------------------------------------------------------

type FetchResult = Result<FetchedResource, FetchError>;

struct PendingRequest {
    request: ResourceRequest,
    completion: oneshot::Sender<FetchResult>,
    /// The single slot, released once the completion is delivered.
    permit: OwnedSemaphorePermit,
}

/// Completion handle for one enqueued request.
#[derive(Debug)]
pub struct PendingFetch {
    rx: oneshot::Receiver<FetchResult>,
}

impl PendingFetch {
    /// Waits for the fetch to run.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or `FetchError::Stopped` if the poller stopped
    /// before running it.
    pub async fn wait(self) -> FetchResult {
        self.rx.await.unwrap_or(Err(FetchError::Stopped))
    }
}

/// Serializes fetches through one slot and a timer.
pub struct WebPoller {
    slot: Arc<Semaphore>,
    pending_tx: mpsc::Sender<PendingRequest>,
    interval_tx: watch::Sender<Duration>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WebPoller {
    /// Spawns the tick loop. The first tick fires one `interval` after start.
    ///
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    #[must_use]
    pub fn start<F: ResourceFetcher>(fetcher: F, interval: Duration) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(1);
        let (interval_tx, interval_rx) = watch::channel(interval);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(run_loop(fetcher, pending_rx, interval_rx, shutdown_rx));

        Self {
            slot: Arc::new(Semaphore::new(1)),
            pending_tx,
            interval_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Starts a poller backed by [`HttpFetcher`].
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidRequest` if the HTTP client cannot be built.
    pub fn with_http(config: &PollerConfig) -> Result<Self, FetchError> {
        Ok(Self::start(
            HttpFetcher::new(config.request_timeout)?,
            config.interval,
        ))
    }

    /// Changes the period; the next tick is one new period from now.
    ///
    /// Intervals below [`MIN_INTERVAL`] are raised to it.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_tx.send_replace(interval);
    }

    /// Current spacing between fetch starts.
    #[must_use]
    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Waits for the slot, then queues `request` for the next tick.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Stopped` if the poller has stopped.
    pub async fn enqueue(&self, request: ResourceRequest) -> Result<PendingFetch, FetchError> {
        let permit = Arc::clone(&self.slot)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Stopped)?;
        debug!(resource = %request.target, method = %request.method, "fetch enqueued");

        let (completion, rx) = oneshot::channel();
        self.pending_tx
            .send(PendingRequest {
                request,
                completion,
                permit,
            })
            .await
            .map_err(|_| FetchError::Stopped)?;
        Ok(PendingFetch { rx })
    }

    /// Enqueues `request` and waits for its result.
    ///
    /// # Errors
    ///
    /// See [`enqueue`](Self::enqueue) and [`PendingFetch::wait`].
    pub async fn fetch(&self, request: ResourceRequest) -> FetchResult {
        self.enqueue(request).await?.wait().await
    }

    /// `GET` the target.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn get(&self, target: &str, headers: HeaderMap) -> FetchResult {
        self.fetch(ResourceRequest::new(Method::GET, target).with_headers(headers))
            .await
    }

    /// `HEAD` the target.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn head(&self, target: &str, headers: HeaderMap) -> FetchResult {
        self.fetch(ResourceRequest::new(Method::HEAD, target).with_headers(headers))
            .await
    }

    /// `GET` the target and return its body.
    ///
    /// # Errors
    ///
    /// See [`fetch`](Self::fetch).
    pub async fn load(&self, target: &str, headers: HeaderMap) -> Result<Bytes, FetchError> {
        self.get(target, headers).await.map(|resource| resource.body)
    }

    /// `GET` the target and decode its body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Decode` when the body is not a `T`, otherwise see
    /// [`fetch`](Self::fetch).
    pub async fn decode_json<T: DeserializeOwned>(
        &self,
        target: &str,
        headers: HeaderMap,
    ) -> Result<T, FetchError> {
        let body = self.load(target, headers).await?;
        serde_json::from_slice(&body).map_err(|e| {
            warn!(resource = target, error = %e, "resource is not valid JSON");
            FetchError::Decode(e)
        })
    }

    /// Stops the loop. Waiting and queued callers receive `FetchError::Stopped`.
    pub async fn stop(&self) {
        self.slot.close();
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "poller loop terminated abnormally");
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    if period < MIN_INTERVAL {
        warn!(?period, min = ?MIN_INTERVAL, "poll interval too short, raising it");
    }
    let period = period.max(MIN_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_loop<F: ResourceFetcher>(
    fetcher: F,
    mut pending_rx: mpsc::Receiver<PendingRequest>,
    mut interval_rx: watch::Receiver<Duration>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut tick = ticker(*interval_rx.borrow_and_update());

    loop {
        tokio::select! {
            _ = tick.tick() => match pending_rx.try_recv() {
                Ok(pending) => {
                    let PendingRequest { request, completion, permit } = pending;
                    let result = fetcher.fetch(&request).await;
                    if let Err(err) = &result {
                        debug!(resource = %request.target, error = %err, "fetch failed");
                    }
                    if completion.send(result).is_err() {
                        debug!(resource = %request.target, "caller gave up before completion");
                    }
                    drop(permit);
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            },
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                tick = ticker(*interval_rx.borrow_and_update());
            }
            _ = &mut shutdown_rx => break,
        }
    }

    pending_rx.close();
    while let Ok(pending) = pending_rx.try_recv() {
        let _ = pending.completion.send(Err(FetchError::Stopped));
    }
    debug!("poller stopped");
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use serde::Deserialize;

    use super::*;

    /// Records when each fetch starts; answers with the target as the body.
    #[derive(Clone, Default)]
    struct StubFetcher {
        starts: Arc<Mutex<Vec<(Instant, String)>>>,
        delay: Duration,
    }

    #[async_trait]
    impl ResourceFetcher for StubFetcher {
        async fn fetch(&self, request: &ResourceRequest) -> FetchResult {
            self.starts
                .lock()
                .push((Instant::now(), request.target.clone()));
            tokio::time::sleep(self.delay).await;
            if request.target == "offline" {
                return Err(FetchError::NoConnectivity("unreachable".to_string()));
            }
            Ok(FetchedResource {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::from(request.target.clone()),
            })
        }
    }

    const T: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn first_fetch_waits_one_interval() {
        let fetcher = StubFetcher::default();
        let poller = WebPoller::start(fetcher.clone(), T);
        let started = Instant::now();

        let body = poller.load("a", HeaderMap::new()).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"a"));
        let starts = fetcher.starts.lock().clone();
        assert_eq!(starts.len(), 1);
        assert!(starts[0].0 - started >= T);
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_are_spaced_by_the_interval() {
        let fetcher = StubFetcher::default();
        let poller = Arc::new(WebPoller::start(fetcher.clone(), T));

        let mut callers = Vec::new();
        for target in ["one", "two", "three", "four"] {
            let poller = Arc::clone(&poller);
            callers.push(tokio::spawn(async move {
                poller.load(target, HeaderMap::new()).await.map(|b| (target, b))
            }));
            tokio::task::yield_now().await;
        }
        for caller in callers {
            let (target, body) = caller.await.unwrap().unwrap();
            assert_eq!(body, Bytes::from(target));
        }

        let starts = fetcher.starts.lock().clone();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= T);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn callers_are_served_in_arrival_order() {
        let fetcher = StubFetcher::default();
        let poller = Arc::new(WebPoller::start(fetcher.clone(), T));

        let mut callers = Vec::new();
        for target in ["a", "b", "c"] {
            let poller = Arc::clone(&poller);
            callers.push(tokio::spawn(async move {
                poller.load(target, HeaderMap::new()).await
            }));
            tokio::task::yield_now().await;
        }
        for caller in callers {
            caller.await.unwrap().unwrap();
        }

        let order: Vec<String> = fetcher.starts.lock().iter().map(|(_, t)| t.clone()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_ticks_fetch_nothing() {
        let fetcher = StubFetcher::default();
        let _poller = WebPoller::start(fetcher.clone(), T);
        tokio::time::sleep(T * 5).await;
        assert!(fetcher.starts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fetch_delays_the_next_one() {
        let fetcher = StubFetcher {
            delay: T * 3,
            ..StubFetcher::default()
        };
        let poller = Arc::new(WebPoller::start(fetcher.clone(), T));

        let first = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.load("slow-1", HeaderMap::new()).await }
        });
        tokio::task::yield_now().await;
        let second = tokio::spawn({
            let poller = Arc::clone(&poller);
            async move { poller.load("slow-2", HeaderMap::new()).await }
        });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let starts = fetcher.starts.lock().clone();
        assert!(starts[1].0 - starts[0].0 >= T * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn set_interval_applies_to_next_tick() {
        let fetcher = StubFetcher::default();
        let poller = WebPoller::start(fetcher.clone(), Duration::from_secs(60));
        poller.set_interval(T);
        assert_eq!(poller.interval(), T);

        let started = Instant::now();
        poller.load("fast", HeaderMap::new()).await.unwrap();
        assert!(Instant::now() - started < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_is_raised_to_the_minimum() {
        let fetcher = StubFetcher::default();
        let poller = WebPoller::start(fetcher.clone(), Duration::ZERO);
        assert_eq!(poller.load("first", HeaderMap::new()).await.unwrap(), "first");

        poller.set_interval(Duration::from_millis(10));
        poller.set_interval(Duration::ZERO);
        assert_eq!(poller.load("second", HeaderMap::new()).await.unwrap(), "second");

        let starts = fetcher.starts.lock().clone();
        assert_eq!(starts.len(), 2);
        assert!(starts[1].0 - starts[0].0 >= MIN_INTERVAL);
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_reach_the_caller() {
        let poller = WebPoller::start(StubFetcher::default(), T);
        let err = poller.load("offline", HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::NoConnectivity(_)));
        assert!(err.to_string().starts_with("no connectivity"));
    }

    #[tokio::test(start_paused = true)]
    async fn decode_json_reports_bad_payloads() {
        let poller = WebPoller::start(StubFetcher::default(), T);
        let err = poller
            .decode_json::<serde_json::Value>("not json", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_fails_queued_and_later_callers() {
        let fetcher = StubFetcher::default();
        let poller = WebPoller::start(fetcher.clone(), Duration::from_secs(60));

        let pending = poller
            .enqueue(ResourceRequest::new(Method::GET, "queued"))
            .await
            .unwrap();
        poller.stop().await;

        assert!(matches!(pending.wait().await, Err(FetchError::Stopped)));
        assert!(matches!(
            poller.enqueue(ResourceRequest::new(Method::GET, "late")).await,
            Err(FetchError::Stopped)
        ));
        assert!(fetcher.starts.lock().is_empty());
    }

    // -- HTTP fetcher against a local server --

    #[derive(Debug, Deserialize, PartialEq)]
    struct Status {
        ok: bool,
    }

    async fn serve_http() -> SocketAddr {
        let app = axum::Router::new()
            .route("/status", axum::routing::get(|| async { r#"{"ok":true}"# }))
            .route(
                "/echo-header",
                axum::routing::get(|headers: http::HeaderMap| async move {
                    headers
                        .get("x-caller-tag")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn http_fetcher_decodes_json() {
        let addr = serve_http().await;
        let poller = WebPoller::start(
            HttpFetcher::new(Duration::from_secs(5)).unwrap(),
            Duration::from_millis(10),
        );

        let status: Status = poller
            .decode_json(&format!("http://{addr}/status"), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(status, Status { ok: true });

        let head = poller
            .head(&format!("http://{addr}/status"), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert!(head.body.is_empty());
    }

    #[tokio::test]
    async fn http_fetcher_sends_headers() {
        let addr = serve_http().await;
        let poller = WebPoller::start(
            HttpFetcher::new(Duration::from_secs(5)).unwrap(),
            Duration::from_millis(10),
        );
        let mut headers = HeaderMap::new();
        headers.insert("x-caller-tag", http::HeaderValue::from_static("hello"));

        let body = poller
            .load(&format!("http://{addr}/echo-header"), headers)
            .await
            .unwrap();
        assert_eq!(body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn http_fetcher_reports_unreachable_hosts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let poller = WebPoller::start(
            HttpFetcher::new(Duration::from_secs(5)).unwrap(),
            Duration::from_millis(10),
        );
        let err = poller
            .load(&format!("http://{addr}/"), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoConnectivity(_)));
    }

    #[tokio::test]
    async fn http_fetcher_rejects_invalid_targets() {
        let poller = WebPoller::start(
            HttpFetcher::new(Duration::from_secs(5)).unwrap(),
            Duration::from_millis(10),
        );
        let err = poller.load("not a url", HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidRequest(_)));
    }
}
