//! Prometheus metrics definitions and HTTP server

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder, TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Total number of reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "dex_operator_reconciliations_total",
        "Total number of reconciliations",
        &["kind"]
    ).unwrap();

    /// Total number of failed reconciliations by reason code
    pub static ref RECONCILIATION_ERRORS: CounterVec = register_counter_vec!(
        "dex_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
        &["kind", "reason"]
    ).unwrap();

    /// Reconciliation duration histogram
    pub static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "dex_operator_reconcile_duration_seconds",
        "Duration of reconciliations in seconds",
        &["kind"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();

    /// mTLS bundles written, by action (created, renewed)
    pub static ref CERTIFICATE_ROTATIONS: CounterVec = register_counter_vec!(
        "dex_operator_mtls_certificate_rotations_total",
        "Number of gRPC mTLS bundles created or renewed",
        &["action"]
    ).unwrap();

    /// Watch events dropped by the event filters, by source
    pub static ref FILTERED_EVENTS: CounterVec = register_counter_vec!(
        "dex_operator_filtered_events_total",
        "Number of watch events suppressed before reconciliation",
        &["source"]
    ).unwrap();

    /// Currently managed resources
    pub static ref MANAGED_RESOURCES: GaugeVec = register_gauge_vec!(
        "dex_operator_managed_resources",
        "Number of managed resources by kind",
        &["kind"]
    ).unwrap();

    /// Operator health (1 = healthy, 0 = unhealthy)
    pub static ref OPERATOR_HEALTH: prometheus::Gauge = prometheus::register_gauge!(
        "dex_operator_health",
        "Operator health status (1 = healthy, 0 = unhealthy)"
    ).unwrap();
}

static READY: AtomicBool = AtomicBool::new(false);

/// Mark the operator ready once its controller is running
pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
    OPERATOR_HEALTH.set(if ready { 1.0 } else { 0.0 });
}

/// Start the metrics HTTP server
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!("Error serving connection: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(route(req.uri().path()))
}

fn route(path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => metrics_response(),
        "/healthz" | "/health" => text_response(StatusCode::OK, "ok"),
        "/readyz" | "/ready" if READY.load(Ordering::SeqCst) => {
            text_response(StatusCode::OK, "ok")
        }
        "/readyz" | "/ready" => text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn metrics_response() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    response
}
