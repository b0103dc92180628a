//! Flow routing: protocol events to per-container traces
//!
//! ```text
//! (container, dst, actual dst, fqdn) + L7Event
//!        │
//!        ▼
//! DestinationFilter::should_be_skipped ── skip ──► dropped
//!        │ trace
//!        ▼
//! DestinationKey::new ──► traces[(container, key)]
//!                               │ miss
//!                               ▼
//!                  tracers[container] ──► Tracer::new_trace(destination)
//!        │
//!        ▼
//!   Trace::<protocol>(…)
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::net::{port_should_be_skipped, DestinationFilter, DestinationKey, PortFilter};
use crate::telemetry::{Status, Trace, Tracer, TracerRegistry};

/// An observed connection and the container that owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub container_id: String,
    pub dst: SocketAddr,
    /// Destination after NAT/proxy resolution; equal to `dst` when unknown.
    pub actual_dst: SocketAddr,
    /// Name the destination was resolved from, if any.
    pub fqdn: String,
}

/// A parsed request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum L7Event {
    Http {
        method: String,
        path: String,
        status: Status,
        duration: Duration,
    },
    Http2 {
        method: String,
        path: String,
        scheme: String,
        status: Status,
        duration: Duration,
    },
    Postgres {
        query: String,
        error: bool,
        duration: Duration,
    },
    Mysql {
        query: String,
        error: bool,
        duration: Duration,
    },
    Mongo {
        query: String,
        error: bool,
        duration: Duration,
    },
    Memcached {
        cmd: String,
        items: Vec<String>,
        error: bool,
        duration: Duration,
    },
    Redis {
        cmd: String,
        args: String,
        error: bool,
        duration: Duration,
    },
    ClickHouse {
        query: String,
        error: bool,
        duration: Duration,
    },
    Zookeeper {
        op: String,
        args: String,
        status: Status,
        duration: Duration,
    },
}

impl L7Event {
    pub fn protocol(&self) -> &'static str {
        match self {
            L7Event::Http { .. } => "http",
            L7Event::Http2 { .. } => "http2",
            L7Event::Postgres { .. } => "postgres",
            L7Event::Mysql { .. } => "mysql",
            L7Event::Mongo { .. } => "mongo",
            L7Event::Memcached { .. } => "memcached",
            L7Event::Redis { .. } => "redis",
            L7Event::ClickHouse { .. } => "clickhouse",
            L7Event::Zookeeper { .. } => "zookeeper",
        }
    }

    /// Emit this event on a trace.
    pub fn emit(&self, trace: &Trace) {
        match self {
            L7Event::Http {
                method,
                path,
                status,
                duration,
            } => trace.http_request(method, path, *status, *duration),
            L7Event::Http2 {
                method,
                path,
                scheme,
                status,
                duration,
            } => trace.http2_request(method, path, scheme, *status, *duration),
            L7Event::Postgres {
                query,
                error,
                duration,
            } => trace.postgres_query(query, *error, *duration),
            L7Event::Mysql {
                query,
                error,
                duration,
            } => trace.mysql_query(query, *error, *duration),
            L7Event::Mongo {
                query,
                error,
                duration,
            } => trace.mongo_query(query, *error, *duration),
            L7Event::Memcached {
                cmd,
                items,
                error,
                duration,
            } => trace.memcached_query(cmd, items, *error, *duration),
            L7Event::Redis {
                cmd,
                args,
                error,
                duration,
            } => trace.redis_query(cmd, args, *error, *duration),
            L7Event::ClickHouse {
                query,
                error,
                duration,
            } => trace.clickhouse_query(query, *error, *duration),
            L7Event::Zookeeper {
                op,
                args,
                status,
                duration,
            } => trace.zookeeper_request(op, args, *status, *duration),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Routes protocol events of observed connections to the right trace.
pub struct FlowRouter {
    filter: Arc<DestinationFilter>,
    ports: Option<PortFilter>,
    registry: TracerRegistry,
    // lock order: traces, then tracers
    traces: Mutex<HashMap<(String, DestinationKey), Trace>>,
    tracers: Mutex<HashMap<String, Tracer>>,
}

impl FlowRouter {
    pub fn new(
        filter: Arc<DestinationFilter>,
        ports: Option<PortFilter>,
        registry: TracerRegistry,
    ) -> Self {
        Self {
            filter,
            ports,
            registry,
            traces: Mutex::new(HashMap::new()),
            tracers: Mutex::new(HashMap::new()),
        }
    }

    pub fn filter(&self) -> &DestinationFilter {
        &self.filter
    }

    /// Listening sockets on an ephemeral port are client-side leftovers, not
    /// services.
    pub fn is_ephemeral_listen_port(&self, port: u16) -> bool {
        port_should_be_skipped(self.ports.as_ref(), port)
    }

    /// Trace for a connection, or None if its destination is not traced.
    pub fn trace(&self, conn: &Connection) -> Option<Trace> {
        if self.filter.should_be_skipped(conn.dst.ip(), conn.actual_dst.ip()) {
            return None;
        }
        let key = DestinationKey::new(conn.dst, conn.actual_dst, &conn.fqdn);
        let mut traces = lock(&self.traces);
        if let Some(trace) = traces.get(&(conn.container_id.clone(), key.clone())) {
            return Some(trace.clone());
        }
        let trace = self.tracer(&conn.container_id).new_trace(key.destination());
        debug!(container = %conn.container_id, destination = %key, "new trace");
        traces.insert((conn.container_id.clone(), key), trace.clone());
        Some(trace)
    }

    /// Emit an event for a connection. Returns false if the destination was
    /// filtered out.
    pub fn record(&self, conn: &Connection, event: &L7Event) -> bool {
        match self.trace(conn) {
            Some(trace) => {
                event.emit(&trace);
                true
            }
            None => false,
        }
    }

    fn tracer(&self, container_id: &str) -> Tracer {
        lock(&self.tracers)
            .entry(container_id.to_string())
            .or_insert_with(|| self.registry.container_tracer(container_id))
            .clone()
    }

    /// Drop everything held for a container that went away, flushing its
    /// pending spans first.
    pub fn forget_container(&self, container_id: &str) {
        let mut traces = lock(&self.traces);
        traces.retain(|(id, _), _| id != container_id);
        if let Some(tracer) = lock(&self.tracers).remove(container_id) {
            tracer.force_flush();
        }
    }

    pub fn containers(&self) -> usize {
        lock(&self.tracers).len()
    }

    pub fn traces(&self) -> usize {
        lock(&self.traces).len()
    }

    /// Flush every container tracer.
    pub fn flush(&self) {
        let tracers: Vec<Tracer> = lock(&self.tracers).values().cloned().collect();
        for tracer in tracers {
            tracer.force_flush();
        }
    }
}
