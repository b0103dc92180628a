//! Span exporters
//!
//! Every container gets its own tracer provider (the resource differs per
//! container), but they all ship spans through one exporter connection.
//! `SharedExporter` is the handle each provider's processor owns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Request, Response, Uri};
use opentelemetry::trace::TraceError;
use opentelemetry_http::{HttpClient, HttpError};
use opentelemetry_otlp::{SpanExporterBuilder, WithExportConfig};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use reqwest::Url;

use super::TelemetryError;

/// Cloneable handle to a single underlying `SpanExporter`.
#[derive(Clone)]
pub struct SharedExporter {
    inner: Arc<Mutex<Box<dyn SpanExporter>>>,
}

impl SharedExporter {
    pub fn new<E: SpanExporter + 'static>(exporter: E) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(exporter))),
        }
    }
}

impl fmt::Debug for SharedExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedExporter").finish_non_exhaustive()
    }
}

impl SpanExporter for SharedExporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        match self.inner.lock() {
            Ok(mut exporter) => exporter.export(batch),
            Err(_) => Box::pin(async { Err(TraceError::from("span exporter lock poisoned")) }),
        }
    }

    // Providers are dropped per container; the connection outlives them.
    fn shutdown(&mut self) {}

    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        match self.inner.lock() {
            Ok(mut exporter) => exporter.force_flush(),
            Err(_) => Box::pin(async { Err(TraceError::from("span exporter lock poisoned")) }),
        }
    }
}

/// Where and how spans are shipped.
#[derive(Debug, Clone, Default)]
pub struct TracesConfig {
    /// OTLP/HTTP collector URL. `None` disables tracing.
    pub endpoint: Option<String>,
    pub insecure_skip_verify: bool,
    /// Extra request headers (authentication).
    pub headers: HashMap<String, String>,
}

/// Validate a collector URL. An empty path becomes `/`.
pub fn parse_endpoint(endpoint: &str) -> Result<Url, TelemetryError> {
    let mut url = Url::parse(endpoint)
        .map_err(|e| TelemetryError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(TelemetryError::InvalidEndpoint(format!(
                "{}: unsupported scheme {}",
                endpoint, other
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TelemetryError::InvalidEndpoint(format!("{}: missing host", endpoint)));
    }
    if url.path().is_empty() {
        url.set_path("/");
    }
    Ok(url)
}

/// HTTP client that sends every request to one collector URL.
///
/// The OTLP/HTTP builder appends `/v1/traces` to its endpoint. The
/// configured URL is where spans go, so the request URI is replaced.
#[derive(Debug)]
pub struct CollectorClient {
    client: reqwest::Client,
    endpoint: Uri,
}

impl CollectorClient {
    pub fn new(client: reqwest::Client, endpoint: &Url) -> Result<Self, TelemetryError> {
        let endpoint = endpoint
            .as_str()
            .parse::<Uri>()
            .map_err(|e| TelemetryError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }
}

#[async_trait]
impl HttpClient for CollectorClient {
    async fn send(&self, mut request: Request<Vec<u8>>) -> Result<Response<Bytes>, HttpError> {
        *request.uri_mut() = self.endpoint.clone();
        HttpClient::send(&self.client, request).await
    }
}

/// Build the OTLP/HTTP span exporter for a collector endpoint.
///
/// Spans are posted to `endpoint` exactly as given.
pub fn otlp_http_exporter(
    endpoint: &Url,
    config: &TracesConfig,
) -> Result<opentelemetry_otlp::SpanExporter, TelemetryError> {
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(config.insecure_skip_verify)
        .build()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))?;
    let client = CollectorClient::new(client, endpoint)?;

    let builder = opentelemetry_otlp::new_exporter()
        .http()
        .with_endpoint(endpoint.as_str().trim_end_matches('/'))
        .with_headers(config.headers.clone())
        .with_http_client(client);

    SpanExporterBuilder::from(builder)
        .build_span_exporter()
        .map_err(|e| TelemetryError::Exporter(e.to_string()))
}
