//! Flow filtering: which destinations are worth instrumenting
//!
//! ```text
//!   observed dst ──► link-local? ───────────────────────────► SKIP
//!                    private / loopback? ───────────────────► TRACE
//!                    in whitelist? ─────────────────────────► TRACE
//!   actual dst ───►  private / loopback / in whitelist? ────► TRACE + learn dst/32
//!                    otherwise ─────────────────────────────► SKIP
//! ```
//!
//! Egress through a NAT gateway or sidecar proxy makes the observed address an
//! intermediate hop. When the actual destination behind it turns out to be
//! internal, the observed address is learned so the next flow to it matches
//! the whitelist directly.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::RwLock;

use tracing::{debug, info};

use super::address::{is_internal, is_link_local_unicast};
use super::prefix::{IpPrefix, PrefixError};
use crate::metrics::{FLOWS_CLASSIFIED, WHITELIST_LEARNED, WHITELIST_SIZE};

/// Error type for filter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A whitelist entry is not a valid CIDR prefix
    InvalidNetwork(String, PrefixError),
    /// Port range is malformed or inverted
    InvalidPortRange(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::InvalidNetwork(net, e) => write!(f, "invalid network {}: {}", net, e),
            FilterError::InvalidPortRange(r) => write!(f, "invalid port range: {}", r),
        }
    }
}

impl std::error::Error for FilterError {}

/// Whitelist of external networks plus the self-learning classification policy.
///
/// Shared by reference between all classification call sites; the whitelist is
/// append-only and guarded by an `RwLock`, so racing flows learning the same
/// address are harmless.
#[derive(Debug, Default)]
pub struct DestinationFilter {
    whitelist: RwLock<HashMap<String, IpPrefix>>,
}

impl DestinationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from configured CIDR strings. Empty entries are ignored.
    pub fn from_prefixes<S: AsRef<str>>(prefixes: &[S]) -> Result<Self, FilterError> {
        let filter = Self::new();
        for raw in prefixes {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            let prefix: IpPrefix = raw
                .parse()
                .map_err(|e| FilterError::InvalidNetwork(raw.to_string(), e))?;
            filter.whitelist_prefix(prefix);
        }
        info!(networks = ?filter.prefixes(), "whitelisted public networks");
        Ok(filter)
    }

    /// Add a prefix. Re-adding an existing prefix is a no-op.
    pub fn whitelist_prefix(&self, prefix: IpPrefix) -> bool {
        let key = prefix.to_string();
        if self.read_whitelist(|w| w.contains_key(&key)) {
            return false;
        }
        let mut whitelist = match self.whitelist.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if whitelist.contains_key(&key) {
            return false;
        }
        whitelist.insert(key, prefix);
        WHITELIST_SIZE.set(whitelist.len() as f64);
        true
    }

    /// Whitelist a single address (/32 or /128).
    pub fn whitelist_ip(&self, ip: IpAddr) -> bool {
        self.whitelist_prefix(IpPrefix::single(ip))
    }

    /// True if any whitelisted prefix contains `ip`.
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.read_whitelist(|w| w.values().any(|p| p.contains(ip)))
    }

    pub fn len(&self) -> usize {
        self.read_whitelist(|w| w.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical strings of all whitelisted prefixes, sorted.
    pub fn prefixes(&self) -> Vec<String> {
        let mut out = self.read_whitelist(|w| w.keys().cloned().collect::<Vec<_>>());
        out.sort();
        out
    }

    /// Decide whether a flow to `dst` (really reaching `actual_dst`) should be
    /// left uninstrumented.
    pub fn should_be_skipped(&self, dst: IpAddr, actual_dst: IpAddr) -> bool {
        let skip = self.classify(dst, actual_dst);
        FLOWS_CLASSIFIED
            .with_label_values(&[if skip { "skipped" } else { "traced" }])
            .inc();
        skip
    }

    fn classify(&self, dst: IpAddr, actual_dst: IpAddr) -> bool {
        if is_link_local_unicast(dst) {
            return true;
        }
        if is_internal(dst) {
            return false;
        }
        if self.contains(dst) {
            return false;
        }
        if is_internal(actual_dst) || self.contains(actual_dst) {
            if self.whitelist_ip(dst) {
                WHITELIST_LEARNED.inc();
                debug!(%dst, %actual_dst, "learned whitelisted destination");
            }
            return false;
        }
        true
    }

    fn read_whitelist<T>(&self, f: impl FnOnce(&HashMap<String, IpPrefix>) -> T) -> T {
        match self.whitelist.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

/// Inclusive range of ports that are never instrumented (ephemeral ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortFilter {
    from: u16,
    to: u16,
}

impl PortFilter {
    pub fn new(from: u16, to: u16) -> Result<Self, FilterError> {
        if from > to {
            return Err(FilterError::InvalidPortRange(format!("{}-{}", from, to)));
        }
        Ok(Self { from, to })
    }

    /// Parse `"<from>-<to>"`.
    pub fn parse(range: &str) -> Result<Self, FilterError> {
        let invalid = || FilterError::InvalidPortRange(range.to_string());
        let parts: Vec<&str> = range.trim().split('-').collect();
        if parts.len() != 2 {
            return Err(invalid());
        }
        let from: u16 = parts[0].trim().parse().map_err(|_| invalid())?;
        let to: u16 = parts[1].trim().parse().map_err(|_| invalid())?;
        if from > to {
            return Err(invalid());
        }
        Ok(Self { from, to })
    }

    /// Parse an optional range setting; unset or empty means no filter.
    pub fn from_setting(range: Option<&str>) -> Result<Option<Self>, FilterError> {
        match range {
            Some(r) if !r.trim().is_empty() => Self::parse(r).map(Some),
            _ => Ok(None),
        }
    }

    pub fn should_be_skipped(&self, port: u16) -> bool {
        port >= self.from && port <= self.to
    }

    pub fn from(&self) -> u16 {
        self.from
    }

    pub fn to(&self) -> u16 {
        self.to
    }
}

/// An unset filter never skips.
pub fn port_should_be_skipped(filter: Option<&PortFilter>, port: u16) -> bool {
    filter.map_or(false, |f| f.should_be_skipped(port))
}
