use axum::{
    body::Body,
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Router,
};
use bytes::Bytes;
use logbook::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

/// Custom sink that keeps a summary of every exchange in memory for demonstration
#[derive(Debug, Clone, Default)]
struct StatsSink {
    exchanges: Arc<Mutex<Vec<ExchangeSummary>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExchangeSummary {
    correlation_id: String,
    method: String,
    path: String,
    request_body: String,
    response_status: Option<u16>,
    response_body: Option<String>,
    duration_ms: Option<u64>,
}

impl StatsSink {
    fn snapshot(&self) -> Vec<ExchangeSummary> {
        self.exchanges.lock().unwrap().clone()
    }
}

impl Sink for StatsSink {
    async fn write(&self, precorrelation: Precorrelation, request: RequestData) {
        let (request_body, _) = request.charset().decode_without_bom_handling(&request.body);
        self.exchanges.lock().unwrap().push(ExchangeSummary {
            correlation_id: precorrelation.id().to_string(),
            method: request.method.to_string(),
            path: request.path.clone(),
            request_body: request_body.into_owned(),
            response_status: None,
            response_body: None,
            duration_ms: None,
        });
    }

    async fn write_both(&self, correlation: Correlation, _request: RequestData, response: ResponseData) {
        let mut exchanges = self.exchanges.lock().unwrap();
        if let Some(summary) = exchanges
            .iter_mut()
            .find(|s| s.correlation_id == correlation.id())
        {
            let (body, _) = response.charset().decode_without_bom_handling(&response.body);
            summary.response_status = Some(response.status);
            summary.response_body = Some(body.into_owned());
            summary.duration_ms = Some(correlation.duration().as_millis() as u64);
        }
    }
}

// Handlers for our demo server
async fn hello_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(100)).await; // Simulate some work
    "Hello, World!"
}

async fn echo_handler(body: Bytes) -> impl IntoResponse {
    format!("Echo: {}", String::from_utf8_lossy(&body))
}

async fn login_handler(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
    format!("Welcome, {}", form.get("user").cloned().unwrap_or_default())
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            sleep(Duration::from_millis(200)).await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn latin1_handler() -> impl IntoResponse {
    Response::builder()
        .header("content-type", "text/plain; charset=ISO-8859-1")
        .body(Body::from(&b"caf\xe9 cr\xe8me\n"[..]))
        .unwrap()
}

async fn stats_handler(stats: StatsSink) -> impl IntoResponse {
    let exchanges = stats.snapshot();
    axum::Json(serde_json::json!({
        "total_exchanges": exchanges.len(),
        "completed_exchanges": exchanges.iter().filter(|e| e.response_status.is_some()).count(),
        "exchanges": exchanges
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    info!("Starting logbook demo server");

    // LOGBOOK_CAPTURE_REQUEST_BODY, LOGBOOK_CAPTURE_RESPONSE_BODY, LOGBOOK_FORM_REQUEST
    let config = LogbookConfig::from_env()?;
    info!(?config, "Loaded logbook configuration");

    // Formatted text goes to tracing, summaries to the /stats endpoint
    let stats = StatsSink::default();
    let sink = CompositeSink::new()
        .with(LoggingSink::new())
        .with(stats.clone());

    let app = Router::new()
        .route("/hello", get(hello_handler))
        .route("/echo", post(echo_handler))
        .route("/login", post(login_handler))
        .route("/streaming", get(streaming_handler))
        .route("/latin1", get(latin1_handler))
        .route("/stats", get(move || stats_handler(stats.clone())))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(LogbookLayer::new(config, sink))
                .into_inner(),
        );

    info!("Demo server endpoints:");
    info!("  GET  /hello      - Simple greeting");
    info!("  POST /echo       - Echo request body");
    info!("  POST /login      - Form submission");
    info!("  GET  /streaming  - Streaming response");
    info!("  GET  /latin1     - ISO-8859-1 body, decoded in the log");
    info!("  GET  /stats      - View captured exchanges");
    info!("");
    info!("Try these commands:");
    info!("  curl http://localhost:3000/hello");
    info!("  curl -X POST -d 'Hello from client' http://localhost:3000/echo");
    info!("  curl -X POST -d 'user=alice&password=secret' http://localhost:3000/login");
    info!("  curl http://localhost:3000/streaming");
    info!("  curl http://localhost:3000/stats");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Demo server listening on http://localhost:3000");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
