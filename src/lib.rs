//! # Logbook
//!
//! An Axum middleware that logs every HTTP request and response as a structured text
//! record, with a correlation id, timing, headers and, on request, the body, without
//! changing what the application or the client sees.
//!
//! ## Features
//!
//! - **Deferred capture decisions**: whether a body is buffered is decided at the first
//!   body access, so capture policy can be set after the middleware saw the request
//! - **Transparent streams**: response bodies are teed frame by frame while they stream to
//!   the client; stream errors reach the host unchanged
//! - **Form-aware**: form bodies can be read raw, rebuilt from parsed parameters, or skipped
//! - **Background processing**: formatting and writing happen off the request path
//! - **Extensible**: custom [`Sink`]s and [`HttpLogFormatter`]s
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::post, Router};
//! use logbook::{LogbookConfig, LogbookLayer, LoggingSink};
//! use tower::ServiceBuilder;
//!
//! async fn echo(body: String) -> String {
//!     body
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     tracing_subscriber::fmt::init();
//!
//!     let layer = LogbookLayer::new(LogbookConfig::default(), LoggingSink::new());
//!     let app = Router::new()
//!         .route("/echo", post(echo))
//!         .layer(ServiceBuilder::new().layer(layer));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! A request to `/echo` then produces two `INFO` events:
//!
//! ```text
//! Incoming Request: 65f1a2b300000001
//! Remote: unknown
//! POST http://localhost:3000/echo HTTP/1.1
//! content-type: text/plain
//!
//! hello
//! ```
//!
//! ```text
//! Outgoing Response: 65f1a2b300000001
//! Duration: 2 ms
//! HTTP/1.1 200 OK
//! content-type: text/plain; charset=utf-8
//!
//! hello
//! ```
//!
//! ## Custom Sinks
//!
//! Implement the [`Sink`] trait to ship captured exchanges elsewhere:
//!
//! ```rust
//! use logbook::{Correlation, Precorrelation, RequestData, ResponseData, Sink};
//!
//! #[derive(Debug)]
//! struct SlowRequestSink;
//!
//! impl Sink for SlowRequestSink {
//!     async fn write(&self, _precorrelation: Precorrelation, _request: RequestData) {}
//!
//!     async fn write_both(&self, correlation: Correlation, request: RequestData, response: ResponseData) {
//!         if correlation.duration().as_millis() > 1000 {
//!             println!("SLOW: {} {} -> {}", request.method, request.path, response.status);
//!         }
//!     }
//! }
//! ```

use axum::{extract::Request, response::Response};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::SystemTime,
};
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{debug, error, instrument, warn};

pub mod capture;
pub mod composite_sink;
pub mod config;
pub mod formatter;
pub mod logging_sink;
pub mod request;
pub mod response;
pub mod tee;
pub mod types;

pub use capture::{CaptureState, Phase, StateCell};
pub use composite_sink::CompositeSink;
pub use config::{ConfigError, FormRequestMode, LogbookConfig};
pub use formatter::{DefaultHttpLogFormatter, HttpLogFormatter};
pub use logging_sink::LoggingSink;
pub use request::{FormParameters, RemoteRequest};
pub use response::LocalResponse;
pub use tee::{Capture, CaptureError, Tee};
pub use types::{Correlation, Headers, Origin, Precorrelation, RequestData, ResponseData};

use types::BackgroundTask;

/// Global atomic counter for correlation IDs and process start timestamp
static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(1);
static PROCESS_START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

/// Generate a unique correlation ID combining process start time and counter
fn generate_correlation_id() -> String {
    let start_time = *PROCESS_START_TIME.get_or_init(|| {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });

    let counter = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);

    // High 32 bits: process start timestamp, Low 32 bits: counter
    format!("{:016x}", (start_time << 32) | (counter & 0xFFFFFFFF))
}

/// Destination for captured exchanges.
///
/// The middleware calls [`write`](Sink::write) once the request has been captured and
/// [`write_both`](Sink::write_both) once the response body finished streaming. Both run on
/// a background task, in that order per exchange.
///
/// # Examples
///
/// ```rust
/// use logbook::{Correlation, Precorrelation, RequestData, ResponseData, Sink};
/// use tracing::info;
///
/// #[derive(Debug)]
/// struct StatusSink;
///
/// impl Sink for StatusSink {
///     async fn write(&self, precorrelation: Precorrelation, request: RequestData) {
///         info!("{} {} {}", precorrelation.id(), request.method, request.path);
///     }
///
///     async fn write_both(&self, correlation: Correlation, _request: RequestData, response: ResponseData) {
///         info!("{} {} in {}ms", correlation.id(), response.status, correlation.duration().as_millis());
///     }
/// }
/// ```
pub trait Sink: Send + Sync + 'static {
    /// Write a captured request.
    ///
    /// Called once per exchange, as soon as the request body has been captured or the
    /// capture policy decided not to buffer it. Not called when reading the body failed.
    ///
    /// # Arguments
    ///
    /// * `precorrelation` - The correlation id and the time the exchange started
    /// * `request` - Request metadata, headers, and the captured body (empty when not captured)
    fn write(
        &self,
        precorrelation: Precorrelation,
        request: RequestData,
    ) -> impl std::future::Future<Output = ()> + Send;

    /// Write a finished exchange.
    ///
    /// Called after the response body has been fully written to the client, so the
    /// correlation carries the full duration. The request is passed again so sinks that
    /// log whole exchanges need no state of their own. Not called when the response body
    /// stream failed.
    ///
    /// A panic in either method is caught and logged; the record is lost but the
    /// middleware keeps delivering later records.
    ///
    /// # Arguments
    ///
    /// * `correlation` - The correlation id with start and end time
    /// * `request` - The same request snapshot given to [`write`](Sink::write)
    /// * `response` - Status, headers, and the captured body (empty when not captured)
    fn write_both(
        &self,
        correlation: Correlation,
        request: RequestData,
        response: ResponseData,
    ) -> impl std::future::Future<Output = ()> + Send;
}

/// Tower layer for the logging middleware.
///
/// The layer spawns a background task that feeds captured exchanges to the provided
/// [`Sink`], so it must be created inside a Tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use logbook::{LogbookConfig, LogbookLayer, LoggingSink};
/// use axum::{routing::get, Router};
/// use tower::ServiceBuilder;
///
/// # async fn hello() -> &'static str { "Hello" }
/// # #[tokio::main]
/// # async fn main() {
/// let layer = LogbookLayer::new(LogbookConfig::default(), LoggingSink::new());
///
/// let app = Router::new()
///     .route("/hello", get(hello))
///     .layer(ServiceBuilder::new().layer(layer));
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
/// axum::serve(listener, app).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct LogbookLayer {
    config: LogbookConfig,
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

impl LogbookLayer {
    pub fn new<S: Sink>(config: LogbookConfig, sink: S) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BackgroundTask>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                composite_sink::deliver_isolated(std::any::type_name::<S>(), &sink, task).await;
            }
        });

        Self { config, tx }
    }
}

impl<S> Layer<S> for LogbookLayer {
    type Service = LogbookService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LogbookService {
            inner,
            config: self.config.clone(),
            tx: self.tx.clone(),
        }
    }
}

/// Tower service implementation for the logging middleware.
///
/// Wraps each request in a [`RemoteRequest`] and each response in a [`LocalResponse`],
/// applies the configured capture policy, and hands snapshots to the background task.
///
/// Users typically don't interact with this type directly - it's created by [`LogbookLayer`].
#[derive(Clone)]
pub struct LogbookService<S> {
    inner: S,
    config: LogbookConfig,
    tx: mpsc::UnboundedSender<BackgroundTask>,
}

impl<S> Service<Request> for LogbookService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        let precorrelation = Precorrelation::new(generate_correlation_id(), SystemTime::now());
        debug!(correlation_id = %precorrelation.id(), "Starting request processing");

        let config = self.config.clone();
        let tx = self.tx.clone();

        // The request body may be read before the inner service runs, so take the service
        // that was polled ready and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let remote = RemoteRequest::new(&parts, body, config.form_request_mode);
            if config.capture_request_body {
                remote.with_body();
            } else {
                remote.without_body();
            }

            let request_data = match remote.data().await {
                Ok(data) => {
                    debug!(
                        correlation_id = %precorrelation.id(),
                        body_size = data.body.len(),
                        "Request captured"
                    );
                    if tx
                        .send(BackgroundTask::Request {
                            precorrelation: precorrelation.clone(),
                            request: data.clone(),
                        })
                        .is_err()
                    {
                        error!(
                            correlation_id = %precorrelation.id(),
                            "Failed to send request data to background task"
                        );
                    }
                    Some(data)
                }
                Err(e) => {
                    warn!(
                        correlation_id = %precorrelation.id(),
                        error = %e,
                        "Error capturing request body, exchange not logged"
                    );
                    None
                }
            };

            let request = Request::from_parts(parts, remote.take_body().await);

            debug!("Awaiting inner service response");
            let response = inner.call(request).await?;
            debug!("Inner service response received");

            let (parts, body) = response.into_parts();
            let local = Arc::new(LocalResponse::new(&parts, body));
            if config.capture_response_body {
                local.with_body();
            } else {
                local.without_body();
            }
            let body = local.take_body();

            if let Some(request_data) = request_data {
                // Outlives the handler: waits for the body to finish streaming to the client.
                tokio::spawn(async move {
                    if let Err(e) = local.finished().await {
                        error!(
                            correlation_id = %precorrelation.id(),
                            error = %e,
                            "Error capturing response body"
                        );
                        return;
                    }

                    let correlation = precorrelation.correlate(SystemTime::now());
                    let response_data = local.data();
                    debug!(
                        correlation_id = %correlation.id(),
                        body_size = response_data.body.len(),
                        "Response captured"
                    );

                    if tx
                        .send(BackgroundTask::Response {
                            correlation,
                            request: request_data,
                            response: response_data,
                        })
                        .is_err()
                    {
                        error!("Failed to send response data to background task");
                    }
                });
            }

            Ok(Response::from_parts(parts, body))
        })
    }
}
