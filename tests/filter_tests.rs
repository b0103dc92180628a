//! Integration tests for destination classification and endpoint identity

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread;

use flowtrace::net::{normalize_fqdn, port_should_be_skipped, IpPrefix};
use flowtrace::{DestinationFilter, DestinationKey, HostPort, PortFilter};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Test that private and loopback destinations are traced whatever the actual hop
#[test]
fn test_internal_destinations_always_traced() {
    let filter = DestinationFilter::new();
    for dst in ["10.1.2.3", "172.16.0.1", "192.168.100.1", "127.0.0.53", "fd00::1", "::1"] {
        for actual in ["8.8.8.8", "10.0.0.1", "169.254.169.254"] {
            assert!(!filter.should_be_skipped(ip(dst), ip(actual)), "{} via {}", dst, actual);
        }
    }
}

/// Test that link-local destinations are never traced, even when whitelisted
#[test]
fn test_link_local_always_skipped() {
    let filter = DestinationFilter::from_prefixes(&["169.254.0.0/16"]).unwrap();
    assert!(filter.should_be_skipped(ip("169.254.169.254"), ip("10.0.0.1")));
    assert!(filter.should_be_skipped(ip("fe80::1"), ip("fe80::1")));
}

/// Test that a public destination reached through a private hop is learned
#[test]
fn test_self_learning_persists() {
    let filter = DestinationFilter::new();
    let public = ip("203.0.113.7");
    assert!(filter.should_be_skipped(public, public));
    assert!(!filter.should_be_skipped(public, ip("10.2.3.4")));
    // learned: traced from now on whatever the actual hop
    assert!(!filter.should_be_skipped(public, public));
    assert!(!filter.should_be_skipped(public, ip("8.8.4.4")));
    assert_eq!(filter.prefixes(), vec!["203.0.113.7/32".to_string()]);
    assert!(filter.should_be_skipped(ip("203.0.113.8"), ip("203.0.113.8")));
}

/// Test that a public hop inside a configured network teaches the destination
#[test]
fn test_whitelisted_actual_destination() {
    let filter = DestinationFilter::from_prefixes(&["198.51.100.0/24", " "]).unwrap();
    assert_eq!(filter.len(), 1);
    assert!(!filter.should_be_skipped(ip("198.51.100.20"), ip("198.51.100.20")));
    assert!(!filter.should_be_skipped(ip("192.0.2.1"), ip("198.51.100.20")));
    assert!(filter.contains(ip("192.0.2.1")));
}

/// Test that whitelisting is idempotent and tolerates concurrent learners
#[test]
fn test_concurrent_learning() {
    let filter = Arc::new(DestinationFilter::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let filter = Arc::clone(&filter);
            thread::spawn(move || {
                for _ in 0..50 {
                    assert!(!filter.should_be_skipped(ip("192.0.2.44"), ip("10.0.0.1")));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(filter.len(), 1);
    assert!(!filter.whitelist_prefix(IpPrefix::single(ip("192.0.2.44"))));
}

/// Test that invalid configured networks are rejected
#[test]
fn test_invalid_network_rejected() {
    assert!(DestinationFilter::from_prefixes(&["10.0.0.0/33"]).is_err());
    assert!(DestinationFilter::from_prefixes(&["not-a-network"]).is_err());
}

/// Test the ephemeral port range bounds
#[test]
fn test_port_filter_bounds() {
    let filter = PortFilter::parse("1000-2000").unwrap();
    assert!(!filter.should_be_skipped(999));
    assert!(filter.should_be_skipped(1000));
    assert!(filter.should_be_skipped(1500));
    assert!(filter.should_be_skipped(2000));
    assert!(!filter.should_be_skipped(2001));

    assert!(!port_should_be_skipped(None, 1500));
    assert!(port_should_be_skipped(Some(&filter), 1500));

    assert!(PortFilter::parse("2000-1000").is_err());
    assert!(PortFilter::parse("1000").is_err());
    assert!(PortFilter::parse("a-b").is_err());
    assert_eq!(PortFilter::from_setting(Some("")).unwrap(), None);
    assert_eq!(PortFilter::from_setting(None).unwrap(), None);
}

/// Test DNS name grouping
#[test]
fn test_fqdn_grouping() {
    assert_eq!(normalize_fqdn("7.0.0.10.in-addr.arpa", "TypePTR"), "IP.in-addr.arpa");
    assert_eq!(normalize_fqdn("ip-10-0-0-1.ec2.internal", "TypeA"), "IP.ec2.internal");
    assert_eq!(
        normalize_fqdn("google.com.default.svc.cluster.local", "TypeA"),
        "google.com.search_path_suffix"
    );
    assert_eq!(
        normalize_fqdn("api.github.io.svc.cluster.local", "TypeAAAA"),
        "api.github.io.search_path_suffix"
    );
    assert_eq!(normalize_fqdn("foo.bar.example.com", "TypeA"), "foo.bar.example.com");
    assert_eq!(normalize_fqdn("redis.default.svc", "TypeA"), "redis.default.svc");
}

/// Test that object-storage endpoints collapse onto their name
#[test]
fn test_s3_destinations_collapse() {
    let bucket = "media.s3.amazonaws.com";
    let a = DestinationKey::new(addr("52.216.1.1:443"), addr("52.216.1.1:443"), bucket);
    let b = DestinationKey::new(addr("52.217.9.9:443"), addr("52.217.9.9:443"), bucket);
    assert_eq!(a, b);
    assert_eq!(a.destination(), &HostPort::with_empty_ip("media.s3.amazonaws.com", 443));
}

/// Test that a zero port renders as an empty label
#[test]
fn test_zero_port_label() {
    assert_eq!(HostPort::with_empty_ip("db.internal", 0).to_string(), "");
    let key = DestinationKey::new(addr("10.0.0.1:5432"), addr("0.0.0.0:0"), "");
    assert_eq!(key.actual_destination_label_value(), "");
    assert_eq!(key.destination_label_value(), "10.0.0.1:5432");
}
