//! Connection admission: per-source rate limiting and the global session cap.
//!
//! Both structures are the only state shared across concurrent shell
//! sessions. Each guards itself with the narrowest exclusion it can:
//! the bucket table is sharded, the session cap is a counting semaphore.

pub mod gate;
pub mod rate_limit;

use std::net::{IpAddr, SocketAddr};

use sha2::{Digest, Sha256};

pub use gate::{AdmissionError, AdmissionGate, AdmissionPermit};
pub use rate_limit::{Denial, RateLimitConfig, RateLimiter, RateLimiterStats};

/// Key used for addresses that cannot be parsed.
///
/// Unparseable sources share one bucket so they are throttled together
/// instead of slipping past the limiter.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Normalized identity of a connection source (IP only, no port).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKey {
    Ip(IpAddr),
    Unknown,
}

impl SourceKey {
    /// Normalize a socket address: strip the port, collapse IPv4-mapped IPv6.
    pub fn from_socket(addr: SocketAddr) -> Self {
        Self::from_ip(addr.ip())
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => SourceKey::Ip(IpAddr::V4(v4)),
                None => SourceKey::Ip(IpAddr::V6(v6)),
            },
            v4 => SourceKey::Ip(v4),
        }
    }

    /// Parse `ip`, `ip:port` or `[v6]:port`.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Self::from_socket(addr);
        }
        let bare = raw.trim_start_matches('[').trim_end_matches(']');
        match bare.parse::<IpAddr>() {
            Ok(ip) => Self::from_ip(ip),
            Err(_) => SourceKey::Unknown,
        }
    }

    /// 12-character uppercase hex fingerprint shown to the observer.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        digest[..6].iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl std::fmt::Display for SourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceKey::Ip(ip) => write!(f, "{ip}"),
            SourceKey::Unknown => f.write_str(UNKNOWN_SOURCE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_port() {
        assert_eq!(SourceKey::parse("10.0.0.7:5555"), SourceKey::parse("10.0.0.7"));
        assert_eq!(SourceKey::parse("[::1]:22").to_string(), "::1");
    }

    #[test]
    fn collapses_ipv4_mapped_ipv6() {
        let mapped = SourceKey::parse("[::ffff:192.0.2.10]:4000");
        assert_eq!(mapped, SourceKey::parse("192.0.2.10"));
        assert_eq!(mapped.to_string(), "192.0.2.10");
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(SourceKey::parse("not-an-address"), SourceKey::Unknown);
        assert_eq!(SourceKey::parse(""), SourceKey::Unknown);
    }

    #[test]
    fn fingerprint_is_twelve_uppercase_hex() {
        let fp = SourceKey::parse("203.0.113.9:1234").fingerprint();
        assert_eq!(fp.len(), 12);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(fp, SourceKey::parse("[::ffff:203.0.113.9]:80").fingerprint());
    }
}
