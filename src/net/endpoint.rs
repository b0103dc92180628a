//! Destination identity
//!
//! `HostPort` and `DestinationKey` are used as map keys and as metric/span
//! label values, so they are kept low-cardinality: wildcard object-storage
//! endpoints collapse to their FQDN and DNS names are grouped by
//! [`normalize_fqdn`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref AWS_S3_FQDN: Regex =
        Regex::new(r".+s3.*.amazonaws.com").expect("valid s3 fqdn regex");
}

/// Reverse-DNS lookups are grouped under this single name.
pub const REVERSE_DNS_GROUP: &str = "IP.in-addr.arpa";

/// Appended when a DNS search-path expansion is cut at a public suffix.
pub const SEARCH_PATH_SUFFIX: &str = ".search_path_suffix";

const PUBLIC_SUFFIXES: &[&str] = &["com", "net", "org", "io"];

/// An endpoint: either an IP and port, or a hostname and port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HostPort {
    host: String,
    ip: Option<IpAddr>,
    port: u16,
}

impl HostPort {
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self {
            host: String::new(),
            ip: Some(addr.ip()),
            port: addr.port(),
        }
    }

    /// Hostname endpoint with no IP attached.
    pub fn with_empty_ip(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            ip: None,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    /// The IP as text when known, otherwise the hostname.
    pub fn host(&self) -> String {
        match self.ip {
            Some(ip) => ip.to_string(),
            None => self.host.clone(),
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        Self::from_socket_addr(addr)
    }
}

/// `host:port`, `[v6]:port`, or empty when the port is zero.
impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            return Ok(());
        }
        match self.ip {
            Some(IpAddr::V6(v6)) => write!(f, "[{}]:{}", v6, self.port),
            Some(IpAddr::V4(v4)) => write!(f, "{}:{}", v4, self.port),
            None if self.host.contains(':') => write!(f, "[{}]:{}", self.host, self.port),
            None => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

/// Logical traffic target: the observed destination plus the actual one behind
/// it (after NAT/proxy resolution), when observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    destination: HostPort,
    actual_destination: HostPort,
}

impl DestinationKey {
    pub fn new(dst: SocketAddr, actual_dst: SocketAddr, fqdn: &str) -> Self {
        if AWS_S3_FQDN.is_match(fqdn) {
            // wildcard storage endpoints fan out over many backend IPs
            return Self {
                destination: HostPort::with_empty_ip(fqdn, dst.port()),
                actual_destination: HostPort::default(),
            };
        }
        Self {
            destination: HostPort::from_socket_addr(dst),
            actual_destination: HostPort::from_socket_addr(actual_dst),
        }
    }

    pub fn destination(&self) -> &HostPort {
        &self.destination
    }

    pub fn actual_destination(&self) -> &HostPort {
        &self.actual_destination
    }

    /// The actual destination, or the observed one if the actual was never seen.
    pub fn actual_destination_if_known(&self) -> &HostPort {
        if self.actual_destination.port() != 0 {
            &self.actual_destination
        } else {
            &self.destination
        }
    }

    pub fn destination_label_value(&self) -> String {
        self.destination.to_string()
    }

    pub fn actual_destination_label_value(&self) -> String {
        self.actual_destination.to_string()
    }
}

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.destination, self.actual_destination)
    }
}

/// Collapse high-cardinality DNS names into stable group keys.
///
/// - any PTR lookup → `IP.in-addr.arpa`
/// - `ip-10-0-0-1.ec2.internal` → `IP.ec2.internal`
/// - `google.com.default.svc.cluster.local` → `google.com.search_path_suffix`
pub fn normalize_fqdn(fqdn: &str, query_type: &str) -> String {
    if query_type == "TypePTR" {
        return REVERSE_DNS_GROUP.to_string();
    }
    if fqdn.starts_with("ip-") {
        if let Some(idx) = fqdn.find('.') {
            let rest = &fqdn[idx + 1..];
            if let Some(suffix) = rest.strip_prefix("ec2") {
                return format!("IP.ec2{}", suffix);
            }
        }
    }
    let mut offset = 0;
    for (i, label) in fqdn.split('.').enumerate() {
        let end = offset + label.len();
        // only a label followed by another dot counts as a suffix boundary
        if i > 0 && end < fqdn.len() && PUBLIC_SUFFIXES.contains(&label) {
            return format!("{}{}", &fqdn[..end], SEARCH_PATH_SUFFIX);
        }
        offset = end + 1;
    }
    fqdn.to_string()
}
