//! Address classification
//!
//! Decides which address ranges count as "ours" (private networks, CGNAT,
//! loopback) and which are never worth tracing (link-local).

use std::net::IpAddr;

/// Returns true for RFC 1918 ranges, the CGNAT shared range 100.64.0.0/10
/// and IPv6 unique local addresses (fc00::/7).
pub fn is_ip_private(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => {
            if v4.is_private() {
                return true;
            }
            let octets = v4.octets();
            octets[0] == 100 && octets[1] & 0xc0 == 64
        }
        IpAddr::V6(v6) => v6.segments()[0] & 0xfe00 == 0xfc00,
    }
}

/// 169.254.0.0/16 and fe80::/10
pub fn is_link_local_unicast(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => v6.segments()[0] & 0xffc0 == 0xfe80,
    }
}

pub fn is_loopback(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}

/// Private or loopback: traffic that stays inside the host or cluster.
pub fn is_internal(ip: IpAddr) -> bool {
    is_ip_private(ip) || is_loopback(ip)
}
