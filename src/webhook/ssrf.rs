use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::error::WebhookError;

/// Blocked IPv4 ranges: loopback, RFC-1918, link-local, CGN, benchmarking,
/// documentation, multicast and reserved space.
const BLOCKED_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 0, 0, 0), 24),
    (Ipv4Addr::new(192, 0, 2, 0), 24),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(198, 18, 0, 0), 15),
    (Ipv4Addr::new(198, 51, 100, 0), 24),
    (Ipv4Addr::new(203, 0, 113, 0), 24),
    (Ipv4Addr::new(224, 0, 0, 0), 4),
    (Ipv4Addr::new(240, 0, 0, 0), 4),
    (Ipv4Addr::new(255, 255, 255, 255), 32),
];

fn in_cidr4(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

pub fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    BLOCKED_V4
        .iter()
        .any(|(network, prefix)| in_cidr4(ip, *network, *prefix))
}

pub fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    // IPv4-mapped addresses inherit the v4 verdict
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let segments = ip.segments();
    // fc00::/7 unique-local
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 link-local
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    false
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_hostname(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == "localhost"
        || host == "metadata"
        || host.starts_with("metadata.")
        || host == "kubernetes"
        || host.starts_with("kubernetes.")
}

/// Validates a webhook destination before any request is issued. Only
/// http/https pass; literal IPs are checked directly and hostnames are
/// resolved (A and AAAA) with every resolved address required to be public.
pub async fn validate_webhook_url(raw: &str) -> Result<Url, WebhookError> {
    let url = Url::parse(raw).map_err(|e| WebhookError::BlockedUrl(format!("invalid url: {e}")))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(WebhookError::BlockedUrl(format!(
                "scheme '{other}' not allowed"
            )))
        }
    }

    let host = url
        .host()
        .ok_or_else(|| WebhookError::BlockedUrl("url has no host".to_string()))?;

    match host {
        url::Host::Ipv4(ip) => {
            if is_blocked_ipv4(ip) {
                return Err(WebhookError::BlockedUrl(format!(
                    "address {ip} is in a blocked range"
                )));
            }
        }
        url::Host::Ipv6(ip) => {
            if is_blocked_ipv6(ip) {
                return Err(WebhookError::BlockedUrl(format!(
                    "address {ip} is in a blocked range"
                )));
            }
        }
        url::Host::Domain(name) => {
            if is_blocked_hostname(name) {
                return Err(WebhookError::BlockedUrl(format!(
                    "hostname '{name}' is blocked"
                )));
            }
            let port = url.port_or_known_default().unwrap_or(443);
            let resolved = tokio::net::lookup_host((name, port))
                .await
                .map_err(|e| WebhookError::BlockedUrl(format!("dns resolution failed: {e}")))?;

            let mut saw_any = false;
            for addr in resolved {
                saw_any = true;
                if is_blocked_ip(addr.ip()) {
                    return Err(WebhookError::BlockedUrl(format!(
                        "hostname '{name}' resolves to blocked address {}",
                        addr.ip()
                    )));
                }
            }
            if !saw_any {
                return Err(WebhookError::BlockedUrl(format!(
                    "hostname '{name}' resolved to no addresses"
                )));
            }
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_spec_range_is_blocked() {
        for ip in [
            "0.1.2.3",
            "10.1.2.3",
            "100.64.0.1",
            "100.127.255.255",
            "127.0.0.1",
            "169.254.169.254",
            "172.16.0.1",
            "172.31.255.255",
            "192.0.0.10",
            "192.0.2.1",
            "192.168.1.1",
            "198.18.0.1",
            "198.19.255.255",
            "198.51.100.20",
            "203.0.113.7",
            "224.0.0.1",
            "240.0.0.1",
            "255.255.255.255",
        ] {
            assert!(
                is_blocked_ipv4(ip.parse().unwrap()),
                "{ip} should be blocked"
            );
        }
    }

    #[test]
    fn test_public_v4_passes() {
        for ip in ["1.1.1.1", "8.8.8.8", "100.63.255.255", "172.32.0.1", "198.20.0.1"] {
            assert!(!is_blocked_ipv4(ip.parse().unwrap()), "{ip} should pass");
        }
    }

    #[test]
    fn test_v6_ranges() {
        assert!(is_blocked_ipv6("::1".parse().unwrap()));
        assert!(is_blocked_ipv6("fc00::1".parse().unwrap()));
        assert!(is_blocked_ipv6("fdff::1".parse().unwrap()));
        assert!(is_blocked_ipv6("fe80::1".parse().unwrap()));
        // v4-mapped loopback
        assert!(is_blocked_ipv6("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_blocked_ipv6("::ffff:10.0.0.1".parse().unwrap()));
        assert!(!is_blocked_ipv6("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_scheme_and_hostname_gates() {
        assert!(validate_webhook_url("ftp://example.com/x").await.is_err());
        assert!(validate_webhook_url("http://localhost/hook").await.is_err());
        assert!(validate_webhook_url("https://metadata.google.internal/x")
            .await
            .is_err());
        assert!(validate_webhook_url("https://kubernetes.default.svc/x")
            .await
            .is_err());
        assert!(validate_webhook_url("not a url").await.is_err());
    }

    #[tokio::test]
    async fn test_literal_metadata_ip_is_blocked() {
        let err = validate_webhook_url("http://169.254.169.254/latest/meta-data/")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("blocked"));
    }

    #[tokio::test]
    async fn test_literal_public_ip_passes() {
        assert!(validate_webhook_url("https://1.1.1.1/hook").await.is_ok());
    }
}
