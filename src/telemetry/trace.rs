//! Per-container tracers and per-destination traces
//!
//! Protocol parsers only learn about an exchange once the response arrives,
//! so every span is back-dated: it ends now and starts `duration` earlier.
//! Spans are always client spans with no parent.

use std::time::{Duration, SystemTime};

use opentelemetry::trace::{Span as _, SpanKind, Status as SpanStatus, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{self as sdktrace, TracerProvider};
use tracing::warn;

use super::l7::Status;
use super::span::{self, SpanRecord};
use crate::metrics::SPANS_EMITTED;
use crate::net::HostPort;

/// Tracer bound to one container's resource.
#[derive(Debug, Clone)]
pub enum Tracer {
    Disabled,
    Enabled {
        provider: TracerProvider,
        tracer: sdktrace::Tracer,
    },
}

impl Tracer {
    pub(crate) fn enabled(provider: TracerProvider, tracer: sdktrace::Tracer) -> Self {
        Tracer::Enabled { provider, tracer }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Tracer::Enabled { .. })
    }

    /// Trace for all exchanges with one destination.
    pub fn new_trace(&self, destination: &HostPort) -> Trace {
        match self {
            Tracer::Disabled => Trace::Disabled,
            Tracer::Enabled { provider, tracer } => Trace::Enabled {
                // the sdk tracer only holds a weak reference to its provider
                _provider: provider.clone(),
                tracer: tracer.clone(),
                destination: destination.clone(),
                peer: span::peer_attributes(destination),
            },
        }
    }

    /// Push buffered spans to the exporter. Failures are logged.
    pub fn force_flush(&self) {
        if let Tracer::Enabled { provider, .. } = self {
            for result in provider.force_flush() {
                if let Err(e) = result {
                    warn!(error = %e, "failed to flush spans");
                }
            }
        }
    }
}

/// Span emitter for one destination. `Disabled` ignores every event.
#[derive(Debug, Clone)]
pub enum Trace {
    Disabled,
    Enabled {
        _provider: TracerProvider,
        tracer: sdktrace::Tracer,
        destination: HostPort,
        peer: Vec<KeyValue>,
    },
}

impl Trace {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Trace::Enabled { .. })
    }

    pub fn destination(&self) -> Option<&HostPort> {
        match self {
            Trace::Disabled => None,
            Trace::Enabled { destination, .. } => Some(destination),
        }
    }

    fn emit(&self, record: Option<SpanRecord>, duration: Duration) {
        let (tracer, peer) = match self {
            Trace::Disabled => return,
            Trace::Enabled { tracer, peer, .. } => (tracer, peer),
        };
        let record = match record {
            Some(r) => r,
            None => return,
        };
        let end = SystemTime::now();
        let start = end.checked_sub(duration).unwrap_or(end);

        let mut attributes = record.attributes;
        attributes.extend(peer.iter().cloned());

        let mut span = tracer
            .span_builder(record.name)
            .with_kind(SpanKind::Client)
            .with_start_time(start)
            .with_attributes(attributes)
            .start_with_context(tracer, &Context::new());
        if record.error {
            span.set_status(SpanStatus::error(""));
        }
        span.end_with_timestamp(end);
        SPANS_EMITTED.with_label_values(&[record.protocol]).inc();
    }

    /// No-op when `method` is empty. Errors on status >= 400.
    pub fn http_request(&self, method: &str, path: &str, status: Status, duration: Duration) {
        if let Some(destination) = self.destination() {
            self.emit(span::http_request(destination, method, path, status), duration);
        }
    }

    /// Missing method, path or scheme are replaced with placeholders.
    /// Errors on status > 400.
    pub fn http2_request(
        &self,
        method: &str,
        path: &str,
        scheme: &str,
        status: Status,
        duration: Duration,
    ) {
        if let Some(destination) = self.destination() {
            self.emit(
                Some(span::http2_request(destination, method, path, scheme, status)),
                duration,
            );
        }
    }

    pub fn postgres_query(&self, query: &str, error: bool, duration: Duration) {
        self.emit(span::postgres_query(query, error), duration);
    }

    pub fn mysql_query(&self, query: &str, error: bool, duration: Duration) {
        self.emit(span::mysql_query(query, error), duration);
    }

    pub fn mongo_query(&self, query: &str, error: bool, duration: Duration) {
        self.emit(span::mongo_query(query, error), duration);
    }

    pub fn memcached_query(&self, cmd: &str, items: &[String], error: bool, duration: Duration) {
        self.emit(span::memcached_query(cmd, items, error), duration);
    }

    pub fn redis_query(&self, cmd: &str, args: &str, error: bool, duration: Duration) {
        self.emit(span::redis_query(cmd, args, error), duration);
    }

    pub fn clickhouse_query(&self, query: &str, error: bool, duration: Duration) {
        self.emit(span::clickhouse_query(query, error), duration);
    }

    pub fn zookeeper_request(&self, op: &str, args: &str, status: Status, duration: Duration) {
        self.emit(span::zookeeper_request(op, args, status), duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tracer_is_inert() {
        let tracer = Tracer::Disabled;
        let trace = tracer.new_trace(&HostPort::with_empty_ip("db", 5432));
        assert!(!trace.is_enabled());
        assert!(trace.destination().is_none());
        trace.postgres_query("SELECT 1", true, Duration::from_millis(3));
        trace.http2_request("", "", "", Status(500), Duration::ZERO);
        tracer.force_flush();
    }
}
