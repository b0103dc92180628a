//! CIDR prefixes for the destination whitelist

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A network prefix such as `10.0.0.0/8` or `2001:db8::/32`.
///
/// The stored address is always masked to the prefix length, so two spellings
/// of the same network (`10.1.2.3/8`, `10.0.0.0/8`) compare and render equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    base: IpAddr,
    bits: u8,
}

/// Error type for prefix parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixError {
    /// The address part is not a valid IPv4/IPv6 address
    InvalidAddress(String),
    /// The length is missing, not a number, or too long for the family
    InvalidLength(String),
}

impl fmt::Display for PrefixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefixError::InvalidAddress(s) => write!(f, "invalid prefix address: {}", s),
            PrefixError::InvalidLength(s) => write!(f, "invalid prefix length: {}", s),
        }
    }
}

impl std::error::Error for PrefixError {}

impl IpPrefix {
    /// Build a prefix, masking host bits. Returns None if `bits` exceeds the
    /// address width.
    pub fn new(ip: IpAddr, bits: u8) -> Option<Self> {
        let base = match ip {
            IpAddr::V4(v4) => {
                if bits > 32 {
                    return None;
                }
                IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(bits)))
            }
            IpAddr::V6(v6) => {
                if bits > 128 {
                    return None;
                }
                IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(bits)))
            }
        };
        Some(Self { base, bits })
    }

    /// Prefix covering exactly one address (/32 or /128).
    pub fn single(ip: IpAddr) -> Self {
        let ip = ip.to_canonical();
        let bits = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self { base: ip, bits }
    }

    pub fn addr(&self) -> IpAddr {
        self.base
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Check if an address falls inside this prefix. Families never match
    /// each other; IPv4-mapped IPv6 addresses are compared as IPv4.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.base, ip.to_canonical()) {
            (IpAddr::V4(base), IpAddr::V4(test)) => {
                u32::from(test) & v4_mask(self.bits) == u32::from(base)
            }
            (IpAddr::V6(base), IpAddr::V6(test)) => {
                u128::from(test) & v6_mask(self.bits) == u128::from(base)
            }
            _ => false,
        }
    }
}

fn v4_mask(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(bits))
    }
}

fn v6_mask(bits: u8) -> u128 {
    if bits == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(bits))
    }
}

impl FromStr for IpPrefix {
    type Err = PrefixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| PrefixError::InvalidLength(s.to_string()))?;
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| PrefixError::InvalidAddress(s.to_string()))?;
        let bits: u8 = len
            .parse()
            .map_err(|_| PrefixError::InvalidLength(s.to_string()))?;
        IpPrefix::new(ip, bits).ok_or_else(|| PrefixError::InvalidLength(s.to_string()))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.bits)
    }
}
