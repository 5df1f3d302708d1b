use regex::{Captures, Regex};
use std::sync::OnceLock;

static TOKEN_RE: OnceLock<Regex> = OnceLock::new();

fn token_re() -> &'static Regex {
    // {{ path.to.key | 'fallback' }}, fallback optional
    TOKEN_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*(?:\|\s*'([^']*)')?\s*\}\}")
            .expect("personalization token regex")
    })
}

/// Substitutes `{{ path | 'default' }}` tokens against the personalization
/// map. A missing path uses the literal default when one is supplied and
/// otherwise leaves the token untouched, so downstream templating mistakes
/// stay visible in the delivered mail instead of silently vanishing.
pub fn apply(template: &str, values: &serde_json::Value) -> String {
    token_re()
        .replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            match resolve(values, path) {
                Some(value) => coerce(value),
                None => match caps.get(2) {
                    Some(default) => default.as_str().to_string(),
                    None => caps[0].to_string(),
                },
            }
        })
        .into_owned()
}

fn resolve<'a>(values: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = values;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    if current.is_null() {
        None
    } else {
        Some(current)
    }
}

fn coerce(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_simple_substitution() {
        let values = json!({"name": "Ada"});
        assert_eq!(apply("Hello {{name}}!", &values), "Hello Ada!");
        assert_eq!(apply("Hello {{ name }}!", &values), "Hello Ada!");
    }

    #[test]
    fn test_nested_paths() {
        let values = json!({"user": {"address": {"city": "Zurich"}}});
        assert_eq!(
            apply("Ships to {{user.address.city}}", &values),
            "Ships to Zurich"
        );
    }

    #[test]
    fn test_default_applies_on_missing_key() {
        let values = json!({});
        assert_eq!(
            apply("Hi {{ name | 'there' }}!", &values),
            "Hi there!"
        );
        assert_eq!(apply("{{ missing | '' }}", &values), "");
    }

    #[test]
    fn test_missing_key_without_default_keeps_token() {
        let values = json!({"name": "Ada"});
        assert_eq!(apply("{{nope}} {{name}}", &values), "{{nope}} Ada");
    }

    #[test]
    fn test_non_string_values_are_stringified() {
        let values = json!({"count": 3, "active": true});
        assert_eq!(
            apply("{{count}} items, active={{active}}", &values),
            "3 items, active=true"
        );
    }

    #[test]
    fn test_null_counts_as_missing() {
        let values = json!({"name": null});
        assert_eq!(apply("{{ name | 'fallback' }}", &values), "fallback");
        assert_eq!(apply("{{name}}", &values), "{{name}}");
    }

    #[test]
    fn test_untokenized_text_is_untouched() {
        let values = json!({});
        let text = "no tokens here, {not one} {{ malformed";
        assert_eq!(apply(text, &values), text);
    }
}
