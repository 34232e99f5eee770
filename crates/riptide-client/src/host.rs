//! Host and port pairs as they appear in seed lists and cluster configs.

use std::fmt;
use std::net::Ipv6Addr;

/// A hostname (or address literal) plus port.
///
/// IPv6 literals are canonicalized to their full lowercase form at
/// construction, so `::1` and `0:0:0:0:0:0:0:1` compare equal and the
/// comparison ignores hex case. Names are never resolved: `localhost`
/// and `127.0.0.1` are distinct values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    host: String,
    port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        let host = canonicalize_host(&host);
        Self { host, port }
    }

    /// Parses `host:port`, `[v6]:port` or a bare IPv6-with-port form
    /// where the last colon separates the port.
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest.split_once("]:")?;
            return Some(Self::new(host, port.parse().ok()?));
        }
        let (host, port) = s.rsplit_once(':')?;
        Some(Self::new(host, port.parse().ok()?))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Renders `host:port`, bracket-wrapping IPv6 literals.
    pub fn format(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

fn canonicalize_host(host: &str) -> String {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<Ipv6Addr>() {
        Ok(addr) => {
            let s = addr.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
                s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]
            )
        }
        Err(_) => bare.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv6_literals_are_canonicalized() {
        assert_eq!(HostAndPort::new("::1", 0).host(), "0:0:0:0:0:0:0:1");
        assert_eq!(HostAndPort::new("::A", 0).host(), "0:0:0:0:0:0:0:a");
    }

    #[test]
    fn test_equals_uses_canonical_host() {
        assert_eq!(
            HostAndPort::new("0:0:0:0:0:0:0:1", 0),
            HostAndPort::new("::1", 0)
        );
        assert_eq!(
            HostAndPort::new("0:0:0:0:0:0:0:a", 0),
            HostAndPort::new("::A", 0)
        );
    }

    #[test]
    fn test_equals_uses_unresolved_names() {
        assert_ne!(
            HostAndPort::new("localhost", 0),
            HostAndPort::new("127.0.0.1", 0)
        );
        assert_ne!(HostAndPort::new("localhost", 0), HostAndPort::new("::1", 0));
    }

    #[test]
    fn test_format() {
        assert_eq!(HostAndPort::new("127.0.0.1", 12345).format(), "127.0.0.1:12345");
        assert_eq!(
            HostAndPort::new("0:0:0:0:0:0:0:1", 12345).format(),
            "[0:0:0:0:0:0:0:1]:12345"
        );
        assert_eq!(
            HostAndPort::new("example.com", 12345).format(),
            "example.com:12345"
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            HostAndPort::parse("10.0.0.1:11210"),
            Some(HostAndPort::new("10.0.0.1", 11210))
        );
        assert_eq!(
            HostAndPort::parse("[::1]:11210"),
            Some(HostAndPort::new("::1", 11210))
        );
        assert_eq!(HostAndPort::parse("no-port"), None);
    }
}
