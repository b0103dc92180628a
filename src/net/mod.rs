//! Network flow classification
//!
//! Everything that decides whether an observed connection is worth tracing and
//! how its destination is named:
//!
//! - `address` - private / loopback / link-local classification
//! - `prefix` - CIDR prefixes used by the whitelist
//! - `filter` - `DestinationFilter` (self-learning whitelist) and `PortFilter`
//! - `endpoint` - `HostPort`, `DestinationKey` and FQDN normalization

pub mod address;
pub mod endpoint;
pub mod filter;
pub mod prefix;

pub use address::{is_internal, is_ip_private, is_link_local_unicast, is_loopback};
pub use endpoint::{normalize_fqdn, DestinationKey, HostPort};
pub use filter::{port_should_be_skipped, DestinationFilter, FilterError, PortFilter};
pub use prefix::{IpPrefix, PrefixError};
