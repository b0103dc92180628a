//! Prometheus metrics describing the agent itself
//!
//! These are self-observability metrics (how many flows were classified, how
//! many probes are attached, how many spans went out), not the telemetry the
//! agent produces for the workloads it watches.
//!
//! ```text
//! GET http://<metrics_listen>/metrics ──► serve() ──► gather_text()
//! ```

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Flow Classification Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Flows run through the destination filter.
    ///
    /// Labels:
    /// - verdict: "traced" or "skipped"
    pub static ref FLOWS_CLASSIFIED: CounterVec = register_counter_vec!(
        "flowtrace_flows_classified_total",
        "Flows classified by the destination filter",
        &["verdict"]
    ).expect("failed to register FLOWS_CLASSIFIED metric");

    /// Observed destinations added to the whitelist because the actual
    /// destination behind them was internal.
    pub static ref WHITELIST_LEARNED: Counter = register_counter!(
        "flowtrace_whitelist_learned_total",
        "Destinations learned into the whitelist"
    ).expect("failed to register WHITELIST_LEARNED metric");

    /// Current number of whitelisted prefixes (configured + learned).
    pub static ref WHITELIST_SIZE: Gauge = register_gauge!(
        "flowtrace_whitelist_prefixes",
        "Number of prefixes in the destination whitelist"
    ).expect("failed to register WHITELIST_SIZE metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Process Instrumentation Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Processes with a live instrumentation task.
    pub static ref TRACKED_PROCESSES: Gauge = register_gauge!(
        "flowtrace_tracked_processes",
        "Number of processes currently tracked"
    ).expect("failed to register TRACKED_PROCESSES metric");

    /// Backoff waits while an executable link was not yet resolvable.
    pub static ref EXECUTABLE_RETRIES: Counter = register_counter!(
        "flowtrace_executable_resolution_retries_total",
        "Retries while waiting for a process executable to resolve"
    ).expect("failed to register EXECUTABLE_RETRIES metric");

    /// Probe handles attached, by probe kind.
    ///
    /// Labels:
    /// - kind: "python_thread_lock", "openssl", "go_tls"
    pub static ref PROBES_ATTACHED: CounterVec = register_counter_vec!(
        "flowtrace_probes_attached_total",
        "Probe handles attached to processes",
        &["kind"]
    ).expect("failed to register PROBES_ATTACHED metric");

    /// Probe attach/detach failures.
    ///
    /// Labels:
    /// - kind: probe kind
    /// - op: "attach" or "detach"
    pub static ref PROBE_ERRORS: CounterVec = register_counter_vec!(
        "flowtrace_probe_errors_total",
        "Probe attach or detach failures",
        &["kind", "op"]
    ).expect("failed to register PROBE_ERRORS metric");

    /// Managed-runtime monitors started.
    pub static ref RUNTIME_MONITORS: CounterVec = register_counter_vec!(
        "flowtrace_runtime_monitors_started_total",
        "Runtime-specific monitors started",
        &["runtime"]
    ).expect("failed to register RUNTIME_MONITORS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Span Export Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Spans handed to the exporter, by protocol.
    pub static ref SPANS_EMITTED: CounterVec = register_counter_vec!(
        "flowtrace_spans_emitted_total",
        "Spans synthesized from protocol events",
        &["protocol"]
    ).expect("failed to register SPANS_EMITTED metric");
}

/// Initialize metrics with default values.
///
/// Called during startup to ensure metrics exist in the registry.
pub fn init() {
    TRACKED_PROCESSES.set(0.0);
    WHITELIST_SIZE.set(0.0);
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

async fn handle(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() == Method::GET && req.uri().path() == "/metrics" {
        let mut response = Response::new(Full::new(Bytes::from(gather_text())));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        );
        return Ok(response);
    }
    let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
    *response.status_mut() = StatusCode::NOT_FOUND;
    Ok(response)
}

/// Bind the scrape endpoint.
pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Serve `GET /metrics` until the token is cancelled.
pub async fn serve(listener: TcpListener, token: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "metrics endpoint listening");
    }
    loop {
        let (stream, peer) = tokio::select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept metrics connection");
                    continue;
                }
            },
        };
        tokio::spawn(async move {
            let conn =
                http1::Builder::new().serve_connection(TokioIo::new(stream), service_fn(handle));
            if let Err(e) = conn.await {
                debug!(%peer, error = %e, "metrics connection error");
            }
        });
    }
}
