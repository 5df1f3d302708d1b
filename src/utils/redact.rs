use regex::Regex;
use std::sync::OnceLock;

static EMAIL_RE: OnceLock<Regex> = OnceLock::new();
static IPV4_RE: OnceLock<Regex> = OnceLock::new();
static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn email_re() -> &'static Regex {
    EMAIL_RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("email regex")
    })
}

fn ipv4_re() -> &'static Regex {
    IPV4_RE.get_or_init(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 regex"))
}

fn token_re() -> &'static Regex {
    // Long opaque secrets: bearer-like tokens and 24+ char base64/hex runs.
    TOKEN_RE.get_or_init(|| {
        Regex::new(r"(?i)(bearer\s+\S+|[A-Za-z0-9+/_\-]{24,}={0,2})").expect("token regex")
    })
}

/// Scrubs recipient addresses, IPs and credentials out of error text before
/// it is persisted to `last_error` or shipped in a webhook payload.
pub fn redact_error(message: &str) -> String {
    let redacted = email_re().replace_all(message, "<redacted-email>");
    let redacted = ipv4_re().replace_all(&redacted, "<redacted-ip>");
    let redacted = token_re().replace_all(&redacted, "<redacted-token>");
    redacted.into_owned()
}

/// Zeroes the host part of an IP for tracking events when the operator has
/// enabled IP anonymization (v4: last octet, v6: last 80 bits).
pub fn anonymize_ip(ip: &str) -> String {
    if let Ok(v4) = ip.parse::<std::net::Ipv4Addr>() {
        let o = v4.octets();
        return std::net::Ipv4Addr::new(o[0], o[1], o[2], 0).to_string();
    }
    if let Ok(v6) = ip.parse::<std::net::Ipv6Addr>() {
        let s = v6.segments();
        return std::net::Ipv6Addr::new(s[0], s[1], s[2], 0, 0, 0, 0, 0).to_string();
    }
    ip.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacts_addresses_and_ips() {
        let input = "550 mailbox unavailable for bob@example.com from 203.0.113.9";
        let out = redact_error(input);
        assert!(!out.contains("bob@example.com"));
        assert!(!out.contains("203.0.113.9"));
        assert!(out.contains("550 mailbox unavailable"));
    }

    #[test]
    fn test_redacts_bearer_tokens() {
        let out = redact_error("auth failed: Bearer sk-live-abcdef123456");
        assert!(!out.contains("sk-live"));
    }

    #[test]
    fn test_plain_messages_survive() {
        let msg = "connection refused";
        assert_eq!(redact_error(msg), msg);
    }

    #[test]
    fn test_anonymize_ip() {
        assert_eq!(anonymize_ip("203.0.113.77"), "203.0.113.0");
        assert_eq!(anonymize_ip("not-an-ip"), "not-an-ip");
        assert!(anonymize_ip("2001:db8::1").starts_with("2001:db8:"));
        assert!(anonymize_ip("2001:db8::1").ends_with("::"));
    }
}
