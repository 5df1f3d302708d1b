use regex::Regex;
use std::sync::OnceLock;

pub const MAX_RECIPIENTS_PER_FIELD: usize = 50;
pub const MAX_SUBJECT_LEN: usize = 998;
pub const MAX_HTML_BYTES: usize = 5 * 1024 * 1024;
pub const MAX_TEXT_BYTES: usize = 1024 * 1024;
pub const MAX_BATCH_ENTRIES: usize = 10_000;
pub const MAX_ADDRESS_LEN: usize = 254;
pub const MAX_LOCAL_PART_LEN: usize = 64;

static QUEUE_NAME_RE: OnceLock<Regex> = OnceLock::new();
static SCRIPT_TAG_RE: OnceLock<Regex> = OnceLock::new();
static EVENT_HANDLER_RE: OnceLock<Regex> = OnceLock::new();
static JS_URL_RE: OnceLock<Regex> = OnceLock::new();

fn queue_name_re() -> &'static Regex {
    QUEUE_NAME_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,63}$").expect("queue name regex"))
}

/// Pragmatic RFC-5322 address check: length caps, a single `@`, no dot
/// runs or edge dots in the local part, and LDH domain labels with a dot.
pub fn validate_email_address(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("address is empty".to_string());
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(format!("address exceeds {MAX_ADDRESS_LEN} characters"));
    }

    let Some((local, domain)) = address.rsplit_once('@') else {
        return Err("address is missing '@'".to_string());
    };

    if local.is_empty() {
        return Err("local part is empty".to_string());
    }
    if local.len() > MAX_LOCAL_PART_LEN {
        return Err(format!("local part exceeds {MAX_LOCAL_PART_LEN} characters"));
    }
    if local.starts_with('.') || local.ends_with('.') {
        return Err("local part starts or ends with a dot".to_string());
    }
    if local.contains("..") {
        return Err("local part contains consecutive dots".to_string());
    }
    if !local.chars().all(|c| {
        c.is_ascii_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c)
    }) {
        return Err("local part contains invalid characters".to_string());
    }

    if domain.is_empty() {
        return Err("domain is empty".to_string());
    }
    if !domain.contains('.') {
        return Err("domain has no dot".to_string());
    }
    for label in domain.split('.') {
        if label.is_empty() {
            return Err("domain contains an empty label".to_string());
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err("domain label starts or ends with a hyphen".to_string());
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err("domain contains invalid characters".to_string());
        }
    }

    Ok(())
}

pub fn validate_queue_name(name: &str) -> Result<(), String> {
    if queue_name_re().is_match(name) {
        Ok(())
    } else {
        Err("queue name must be lowercase alphanumeric with hyphens, max 64 chars".to_string())
    }
}

/// Rejects html that would execute in a mail client that renders it: script
/// tags, inline event handlers, javascript: urls.
pub fn validate_html_safety(html: &str) -> Result<(), String> {
    let script = SCRIPT_TAG_RE.get_or_init(|| Regex::new(r"(?i)<\s*script").expect("script regex"));
    let handler = EVENT_HANDLER_RE
        .get_or_init(|| Regex::new(r#"(?i)\son\w+\s*="#).expect("event handler regex"));
    let js_url = JS_URL_RE.get_or_init(|| Regex::new(r"(?i)javascript\s*:").expect("js url regex"));

    if script.is_match(html) {
        return Err("html body contains a <script> tag".to_string());
    }
    if handler.is_match(html) {
        return Err("html body contains an inline event handler".to_string());
    }
    if js_url.is_match(html) {
        return Err("html body contains a javascript: url".to_string());
    }
    Ok(())
}

pub fn validate_subject(subject: &str) -> Result<(), String> {
    if subject.trim().is_empty() {
        return Err("subject is empty".to_string());
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(format!("subject exceeds {MAX_SUBJECT_LEN} characters"));
    }
    Ok(())
}

pub fn validate_bodies(html: Option<&str>, text: Option<&str>) -> Result<(), String> {
    let html_present = html.map(|h| !h.is_empty()).unwrap_or(false);
    let text_present = text.map(|t| !t.is_empty()).unwrap_or(false);
    if !html_present && !text_present {
        return Err("either html or text body is required".to_string());
    }
    if let Some(html) = html {
        if html.len() > MAX_HTML_BYTES {
            return Err(format!("html body exceeds {MAX_HTML_BYTES} bytes"));
        }
    }
    if let Some(text) = text {
        if text.len() > MAX_TEXT_BYTES {
            return Err(format!("text body exceeds {MAX_TEXT_BYTES} bytes"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_addresses() {
        for addr in [
            "a@x.io",
            "first.last@example.com",
            "user+tag@sub.domain.org",
            "o'brien@irish.ie",
            "x_y-z@a-b.co",
        ] {
            assert!(validate_email_address(addr).is_ok(), "{addr} should pass");
        }
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        for addr in [
            "",
            "no-at-sign",
            "@x.io",
            "a@",
            "a@nodot",
            ".leading@x.io",
            "trailing.@x.io",
            "dou..ble@x.io",
            "a@-x.io",
            "a@x-.io",
            "a@x..io",
            "spa ce@x.io",
        ] {
            assert!(validate_email_address(addr).is_err(), "{addr} should fail");
        }
    }

    #[test]
    fn test_rejects_overlong_parts() {
        let long_local = format!("{}@x.io", "a".repeat(65));
        assert!(validate_email_address(&long_local).is_err());

        let long_total = format!("a@{}.io", "x".repeat(260));
        assert!(validate_email_address(&long_total).is_err());
    }

    #[test]
    fn test_queue_names() {
        assert!(validate_queue_name("transactional").is_ok());
        assert!(validate_queue_name("marketing-2").is_ok());
        assert!(validate_queue_name("Transactional").is_err());
        assert!(validate_queue_name("with space").is_err());
        assert!(validate_queue_name("").is_err());
        assert!(validate_queue_name(&"q".repeat(65)).is_err());
    }

    #[test]
    fn test_html_safety_catches_script_vectors() {
        assert!(validate_html_safety("<p>hello</p>").is_ok());
        assert!(validate_html_safety("<SCRIPT>alert(1)</SCRIPT>").is_err());
        assert!(validate_html_safety("< script >x</script>").is_err());
        assert!(validate_html_safety(r#"<img src=x onerror="evil()">"#).is_err());
        assert!(validate_html_safety(r#"<a href="javascript:evil()">x</a>"#).is_err());
        // "on" inside a word is not a handler
        assert!(validate_html_safety("<p>keep an ongoing conversation=fine</p>").is_ok());
    }

    #[test]
    fn test_body_requirements() {
        assert!(validate_bodies(None, None).is_err());
        assert!(validate_bodies(Some(""), Some("")).is_err());
        assert!(validate_bodies(Some("<p>x</p>"), None).is_ok());
        assert!(validate_bodies(None, Some("x")).is_ok());
    }

    #[test]
    fn test_subject_limits() {
        assert!(validate_subject("hi").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("   ").is_err());
        assert!(validate_subject(&"s".repeat(999)).is_err());
    }
}
