//! Client socket filters
//!
//! Filters look like `inet:10.0.0.0/8:143` (mask and port optional) or
//! `unix:/var/run/mailstore*` (a glob over the socket path).

use ipnet::Ipv4Net;
use regex::Regex;
use std::net::Ipv4Addr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InetFilter {
    addr: Ipv4Addr,
    mask: u8,
    port: u16,
}

impl InetFilter {
    fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("inet:")?;
        let (addr, port) = match rest.split_once(':') {
            Some((addr, port)) => (addr, port.parse().ok()?),
            None => (rest, 0),
        };
        let (addr, mask) = match addr.split_once('/') {
            Some((addr, mask)) if !mask.is_empty() => (addr, mask.parse().ok()?),
            Some((addr, _)) => (addr, 32),
            None => (addr, 32),
        };
        if mask > 32 {
            return None;
        }
        Some(Self {
            addr: addr.parse().ok()?,
            mask,
            port,
        })
    }
}

/// How well `test` matches the filter `base`: 0 for no match, otherwise
/// the prefix length of the matching network (32 for exact or wildcard
/// matches, 1 for a unix socket glob match).
pub fn sock_score(base: &str, test: &str) -> u8 {
    if let Some(pattern) = base.strip_prefix("unix:") {
        let path = test.strip_prefix("unix:").unwrap_or(test);
        return u8::from(glob_match(pattern, path));
    }
    if !base.starts_with("inet:") {
        return 0;
    }
    if test.is_empty() {
        return 32;
    }

    let (Some(base), Some(test)) = (InetFilter::parse(base), InetFilter::parse(test)) else {
        return 0;
    };

    if test.port > 0 && base.port != test.port {
        return 0;
    }
    if base.mask == 0 || test.mask == 0 {
        return 32;
    }

    let (Ok(base_net), Ok(test_net)) = (
        Ipv4Net::new(base.addr, base.mask),
        Ipv4Net::new(test.addr, test.mask),
    ) else {
        return 0;
    };
    if base_net.trunc().contains(&test_net) {
        base.mask
    } else {
        0
    }
}

/// Whether a client socket may connect. With no filters everyone may; a
/// deny match refuses; otherwise a configured allow filter must match.
pub fn sock_compare(client: &str, allow: &str, deny: &str) -> bool {
    let result = if allow.is_empty() && deny.is_empty() {
        true
    } else if !deny.is_empty() && sock_score(deny, client) > 0 {
        false
    } else if !allow.is_empty() {
        sock_score(allow, client) > 0
    } else {
        true
    };
    debug!(client = %client, allow = %allow, deny = %deny, result, "Socket filter");
    result
}

fn glob_match(pattern: &str, path: &str) -> bool {
    let expr = regex::escape(pattern).replace(r"\*", ".*").replace(r"\?", ".");
    Regex::new(&format!("^{}$", expr))
        .map(|re| re.is_match(path))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sock_score() {
        assert_eq!(sock_score("inet:10.1.1.1:110", ""), 32);
        assert_eq!(sock_score("inet:10.1.1.1/16:110", "inet:11.1.1.1:110"), 0);
        assert_eq!(sock_score("inet:10.1.1.1/8:110", "inet:10.1.1.1:110"), 8);
        assert_eq!(sock_score("inet:10.1.1.1/16:110", "inet:10.1.1.1:110"), 16);
        assert_eq!(sock_score("inet:10.1.1.1/32:110", "inet:10.1.1.1:110"), 32);
        assert_eq!(sock_score("inet:10.0.0.6:143", "inet:10.0.0.6:110"), 0);
        assert_eq!(sock_score("inet:10.1.1.1:110", "inet:0.0.0.0/0:110"), 32);
        assert_eq!(sock_score("inet:0.0.0.0/0:110", "inet:10.1.1.1:110"), 32);
        assert_eq!(sock_score("tcp:10.1.1.1:110", "inet:10.1.1.1:110"), 0);
    }

    #[test]
    fn test_sock_compare() {
        let cases = [
            (false, "inet:127.0.0.1:143", "inet:127.0.0.1:143", "inet:127.0.0.1:143"),
            (false, "inet:127.0.0.1:110", "inet:127.0.0.1:143", ""),
            (false, "inet:127.0.0.1:143", "inet:127.0.0.2:143", ""),
            (false, "inet:127.0.0.1:143", "", "inet:0.0.0.0/0:143"),
            (true, "inet:127.0.0.1:143", "", "inet:0.0.0.0/0:110"),
            (false, "inet:127.0.0.1:143", "inet:0.0.0.0/0:110", "inet:0.0.0.0/0:143"),
            (true, "inet:127.0.0.1:143", "inet:0.0.0.0/0:143", ""),
            (true, "inet:127.0.0.1:143", "inet:0.0.0.0/0:143", "inet:0.0.0.0/0:110"),
            (false, "inet:10.0.0.6:143", "inet:10.0.0.6:110", ""),
            (true, "inet:127.0.0.1:143", "inet:127.0.0.1:143", ""),
            (true, "inet:127.0.0.1:143", "inet:127.0.0.1/8:143", ""),
            (true, "inet:127.0.0.1:143", "inet:127.0.0.0/8:143", "inet:10.0.0.0/8"),
            (true, "inet:127.0.0.3:143", "inet:127.0.0.0/8:143", "inet:127.0.0.1/32"),
            (true, "unix:/var/run/mailstore-imapd.sock", "unix:/var/run/mailstore-imapd.sock", ""),
            (true, "unix:/var/run/mailstore-imapd.sock", "unix:/var/run/mailstore*", ""),
            (false, "unix:/var/run/mailstore-imapd.sock", "unix:/var/lib/mailstore-imapd.sock", ""),
        ];
        for (expected, client, allow, deny) in cases {
            assert_eq!(
                sock_compare(client, allow, deny),
                expected,
                "client {} allow {} deny {}",
                client,
                allow,
                deny
            );
        }
    }

    #[test]
    fn test_unparseable_filters_never_match() {
        assert_eq!(sock_score("inet:not-an-ip:143", "inet:127.0.0.1:143"), 0);
        assert_eq!(sock_score("inet:10.0.0.0/40:143", "inet:10.0.0.1:143"), 0);
        assert!(!sock_compare("inet:[::1]:143", "inet:127.0.0.1:143", ""));
    }
}
