//! Protocol event → span shaping
//!
//! Each builder turns one parsed protocol exchange into a `SpanRecord`, or
//! `None` when the event lacks the field that names the span. Builders are
//! pure; timing and export happen in `Trace`.
//!
//! | protocol   | span name  | error when            | db.system  |
//! |------------|------------|-----------------------|------------|
//! | http       | method     | status >= 400         |            |
//! | http2      | method     | status > 400          |            |
//! | postgres   | "query"    | reported              | postgresql |
//! | mysql      | "query"    | reported              | mysql      |
//! | mongo      | "query"    | reported              | mongodb    |
//! | memcached  | command    | reported              | memcached  |
//! | redis      | command    | reported              | redis      |
//! | clickhouse | "query"    | reported              | clickhouse |
//! | zookeeper  | operation  | status name != "ok"   | zookeeper  |

use opentelemetry::{Array, KeyValue, StringValue, Value};

use super::l7::Status;
use crate::net::HostPort;

pub const HTTP_URL: &str = "http.url";
pub const HTTP_METHOD: &str = "http.method";
pub const HTTP_STATUS_CODE: &str = "http.status_code";
pub const DB_SYSTEM: &str = "db.system";
pub const DB_STATEMENT: &str = "db.statement";
pub const DB_OPERATION: &str = "db.operation";
pub const DB_MEMCACHED_ITEM: &str = "db.memcached.item";
pub const ZOOKEEPER_STATUS_CODE: &str = "zookeeper.status_code";
pub const NET_PEER_NAME: &str = "net.peer.name";
pub const NET_PEER_PORT: &str = "net.peer.port";

/// A span ready to be started: name, error flag and protocol attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanRecord {
    /// Metric label of the protocol that produced the span
    pub protocol: &'static str,
    pub name: String,
    pub error: bool,
    pub attributes: Vec<KeyValue>,
}

impl SpanRecord {
    fn new(protocol: &'static str, name: &str, error: bool, attributes: Vec<KeyValue>) -> Self {
        Self {
            protocol,
            name: name.to_string(),
            error,
            attributes,
        }
    }

    /// Value of an attribute, if set.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }
}

/// Peer attributes shared by every span of a destination.
pub fn peer_attributes(destination: &HostPort) -> Vec<KeyValue> {
    vec![
        KeyValue::new(NET_PEER_NAME, destination.host()),
        KeyValue::new(NET_PEER_PORT, i64::from(destination.port())),
    ]
}

fn statement(op: &str, args: &str) -> String {
    if args.is_empty() {
        op.to_string()
    } else {
        format!("{} {}", op, args)
    }
}

fn http_attributes(url: String, method: &str, status: Status) -> Vec<KeyValue> {
    vec![
        KeyValue::new(HTTP_URL, url),
        KeyValue::new(HTTP_METHOD, method.to_string()),
        KeyValue::new(HTTP_STATUS_CODE, i64::from(status.code())),
    ]
}

pub fn http_request(
    destination: &HostPort,
    method: &str,
    path: &str,
    status: Status,
) -> Option<SpanRecord> {
    if method.is_empty() {
        return None;
    }
    let url = format!("http://{}{}", destination, path);
    Some(SpanRecord::new(
        "http",
        method,
        status.code() >= 400,
        http_attributes(url, method, status),
    ))
}

/// HTTP/2 streams often lose the pseudo-headers, so missing fields fall back
/// to placeholders instead of dropping the span.
pub fn http2_request(
    destination: &HostPort,
    method: &str,
    path: &str,
    scheme: &str,
    status: Status,
) -> SpanRecord {
    let method = if method.is_empty() { "unknown" } else { method };
    let path = if path.is_empty() { "/unknown" } else { path };
    let scheme = if scheme.is_empty() { "unknown" } else { scheme };
    let url = format!("{}://{}{}", scheme, destination, path);
    SpanRecord::new(
        "http2",
        method,
        status.code() > 400,
        http_attributes(url, method, status),
    )
}

fn sql_query(
    protocol: &'static str,
    system: &'static str,
    query: &str,
    error: bool,
) -> Option<SpanRecord> {
    if query.is_empty() {
        return None;
    }
    Some(SpanRecord::new(
        protocol,
        "query",
        error,
        vec![
            KeyValue::new(DB_SYSTEM, system),
            KeyValue::new(DB_STATEMENT, query.to_string()),
        ],
    ))
}

pub fn postgres_query(query: &str, error: bool) -> Option<SpanRecord> {
    sql_query("postgres", "postgresql", query, error)
}

pub fn mysql_query(query: &str, error: bool) -> Option<SpanRecord> {
    sql_query("mysql", "mysql", query, error)
}

pub fn mongo_query(query: &str, error: bool) -> Option<SpanRecord> {
    sql_query("mongo", "mongodb", query, error)
}

pub fn clickhouse_query(query: &str, error: bool) -> Option<SpanRecord> {
    sql_query("clickhouse", "clickhouse", query, error)
}

/// One key is recorded as a string, several as a string array.
pub fn memcached_query(cmd: &str, items: &[String], error: bool) -> Option<SpanRecord> {
    if cmd.is_empty() {
        return None;
    }
    let mut attributes = vec![
        KeyValue::new(DB_SYSTEM, "memcached"),
        KeyValue::new(DB_OPERATION, cmd.to_string()),
    ];
    match items {
        [] => {}
        [item] => attributes.push(KeyValue::new(DB_MEMCACHED_ITEM, item.clone())),
        many => {
            let values: Vec<StringValue> = many.iter().cloned().map(StringValue::from).collect();
            attributes.push(KeyValue::new(
                DB_MEMCACHED_ITEM,
                Value::Array(Array::String(values)),
            ));
        }
    }
    Some(SpanRecord::new("memcached", cmd, error, attributes))
}

pub fn redis_query(cmd: &str, args: &str, error: bool) -> Option<SpanRecord> {
    if cmd.is_empty() {
        return None;
    }
    Some(SpanRecord::new(
        "redis",
        cmd,
        error,
        vec![
            KeyValue::new(DB_SYSTEM, "redis"),
            KeyValue::new(DB_OPERATION, cmd.to_string()),
            KeyValue::new(DB_STATEMENT, statement(cmd, args)),
        ],
    ))
}

pub fn zookeeper_request(op: &str, args: &str, status: Status) -> Option<SpanRecord> {
    if op.is_empty() {
        return None;
    }
    Some(SpanRecord::new(
        "zookeeper",
        op,
        status.zookeeper() != "ok",
        vec![
            KeyValue::new(DB_SYSTEM, "zookeeper"),
            KeyValue::new(DB_OPERATION, op.to_string()),
            KeyValue::new(DB_STATEMENT, statement(op, args)),
            KeyValue::new(ZOOKEEPER_STATUS_CODE, i64::from(status.code())),
        ],
    ))
}
