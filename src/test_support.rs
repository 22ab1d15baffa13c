//! In-memory connector used by unit tests.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use bytes::Bytes;
use http_body::Frame;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ErrorPolicyConfig;
use crate::error::ForwardError;
use crate::health::policy::ErrorPolicy;
use crate::load_balancer::backend::BackendTarget;
use crate::load_balancer::pool::{ConnectionPool, PoolSettings};
use crate::net::upstream::{Connector, UpstreamConnection};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
pub(crate) type Handler =
    Arc<dyn Fn(usize, Request<Body>) -> BoxFuture<Result<Response<Body>, ForwardError>> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub connection: usize,
    pub target: String,
}

struct FakeState {
    failing: AtomicBool,
    failing_targets: Mutex<Vec<String>>,
    stale_on_ready: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    next_id: AtomicUsize,
    handler: Mutex<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Connector whose connections answer through a closure.
#[derive(Clone)]
pub(crate) struct FakeConnector {
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub(crate) fn new() -> Self {
        let handler: Handler = Arc::new(|id, _req| {
            Box::pin(async move {
                Ok(Response::builder()
                    .header("x-fake-connection", id.to_string())
                    .body(Body::from("ok"))
                    .expect("static response"))
            })
        });
        Self {
            state: Arc::new(FakeState {
                failing: AtomicBool::new(false),
                failing_targets: Mutex::new(Vec::new()),
                stale_on_ready: AtomicBool::new(false),
                connect_delay: Mutex::new(None),
                connects: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
                handler: Mutex::new(handler),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn with_handler<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(usize, Request<Body>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Body>, ForwardError>> + Send + 'static,
    {
        *self.state.handler.lock() = Arc::new(move |id, req| Box::pin(handler(id, req)));
        self
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    /// Refuse connections to one `host:port`.
    pub(crate) fn fail_target(&self, authority: &str) {
        self.state.failing_targets.lock().push(authority.to_string());
    }

    /// Make the next `ready()` on any connection fail once.
    pub(crate) fn set_stale_on_ready(&self) {
        self.state.stale_on_ready.store(true, Ordering::SeqCst);
    }

    /// Every connect sleeps this long before it succeeds or fails.
    pub(crate) fn delay_connects(&self, delay: Duration) {
        *self.state.connect_delay.lock() = Some(delay);
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self, target: &BackendTarget) -> io::Result<FakeConnection> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let authority = target.authority();
        let refused = self.state.failing_targets.lock().contains(&authority);
        if refused || self.state.failing.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        Ok(FakeConnection {
            id: self.state.next_id.fetch_add(1, Ordering::SeqCst),
            open: true,
            target: authority,
            state: self.state.clone(),
        })
    }
}

pub(crate) struct FakeConnection {
    pub(crate) id: usize,
    open: bool,
    target: String,
    state: Arc<FakeState>,
}

impl FakeConnection {
    pub(crate) fn close(&mut self) {
        self.open = false;
    }
}

#[async_trait]
impl UpstreamConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn ready(&mut self) -> Result<(), ForwardError> {
        if self.state.stale_on_ready.swap(false, Ordering::SeqCst) {
            self.open = false;
        }
        if self.open {
            Ok(())
        } else {
            Err(ForwardError::Io(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )))
        }
    }

    async fn send_request(&mut self, request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        self.state.requests.lock().push(RecordedRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            connection: self.id,
            target: self.target.clone(),
        });
        let handler = self.state.handler.lock().clone();
        handler(self.id, request).await
    }
}

pub(crate) fn error_policy(error_threshold: u32, problem_server_retry_secs: u64) -> ErrorPolicy {
    ErrorPolicy::new(
        "http://fake",
        &ErrorPolicyConfig {
            problem_server_retry_secs,
            error_threshold,
            success_threshold: 1,
            error_interval_secs: 60,
        },
    )
}

pub(crate) fn pool(connector: &FakeConnector, settings: PoolSettings) -> ConnectionPool<FakeConnector> {
    pool_for("http://fake:80", connector, settings, error_policy(1, 10))
}

pub(crate) fn pool_for(
    uri: &str,
    connector: &FakeConnector,
    settings: PoolSettings,
    errors: ErrorPolicy,
) -> ConnectionPool<FakeConnector> {
    let target = Arc::new(BackendTarget::parse(uri).expect("valid test uri"));
    ConnectionPool::new(target, Arc::new(connector.clone()), settings, errors, 1)
}

/// A streamed body of `data` followed by a single trailer.
pub(crate) fn body_with_trailer(data: &'static str, name: &'static str, value: &'static str) -> Body {
    let mut trailers = HeaderMap::new();
    trailers.insert(name, HeaderValue::from_static(value));
    let frames: Vec<Result<Frame<Bytes>, io::Error>> = vec![
        Ok(Frame::data(Bytes::from_static(data.as_bytes()))),
        Ok(Frame::trailers(trailers)),
    ];
    Body::new(http_body_util::StreamBody::new(futures_util::stream::iter(frames)))
}

/// Let spawned tasks on the current-thread runtime catch up.
pub(crate) async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub(crate) fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
