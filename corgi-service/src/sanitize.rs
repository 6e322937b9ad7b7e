//! Input sanitization for the interaction pipeline
//!
//! Free-text fields are rejected outright on: null bytes, control characters
//! other than tab, over-long strings (measured before normalization), classic
//! SQL-injection signatures, and strings that would collide with action-type
//! tokens after whitespace/case normalization. Context objects are walked for
//! depth and for prototype-pollution and admin-scope keys.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::InteractionAction;

/// Keys rejected anywhere inside a context object
const DENIED_KEYS: &[&str] = &[
    "__proto__",
    "constructor",
    "prototype",
    "admin",
    "admin_scope",
    "role",
];

static SQL_SIGNATURES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\bunion\b.+\bselect\b",
        r"(?i)\b(select|insert|update|delete|drop|alter)\b.+\b(from|into|table)\b",
        r"(?i)'\s*or\s+'?\d*'?\s*=\s*'?\d*",
        r"(?i);\s*(drop|delete|truncate)\b",
        r"--\s*$",
        r"/\*.*\*/",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static pattern"))
    .collect()
});

/// Validate one free-text field. `max_len` applies to the raw input.
pub fn check_text(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::validation(field, "null byte"));
    }
    if value.chars().any(|c| c.is_control() && c != '\t') {
        return Err(Error::validation(field, "control character"));
    }
    if value.len() > max_len {
        return Err(Error::validation(field, "exceeds maximum length"));
    }
    if SQL_SIGNATURES.iter().any(|re| re.is_match(value)) {
        return Err(Error::validation(field, "disallowed pattern"));
    }

    // Whitespace/case-normalized collision with an action token would make
    // downstream logs ambiguous about what was an action and what was text.
    let normalized = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_ascii_lowercase();
    if InteractionAction::parse(&normalized).is_some() {
        return Err(Error::validation(field, "collides with an action token"));
    }

    Ok(())
}

/// Validate an interaction context object: must be a JSON object, nested no
/// deeper than `max_depth`, with no denied keys and every string leaf passing
/// [`check_text`].
pub fn check_context(context: &Value, max_depth: usize, max_text_len: usize) -> Result<()> {
    if !context.is_object() {
        return Err(Error::validation("context", "must be an object"));
    }
    walk(context, 1, max_depth, max_text_len)
}

// Depth counts object/array nesting only; scalar leaves sit inside their
// container's level rather than adding one of their own.
fn walk(value: &Value, depth: usize, max_depth: usize, max_text_len: usize) -> Result<()> {
    match value {
        Value::Object(map) => {
            if depth > max_depth {
                return Err(Error::validation("context", "exceeds maximum depth"));
            }
            for (key, nested) in map {
                if DENIED_KEYS.iter().any(|d| key.eq_ignore_ascii_case(d)) {
                    return Err(Error::validation("context", "denied key"));
                }
                check_text("context", key, max_text_len)?;
                walk(nested, depth + 1, max_depth, max_text_len)?;
            }
        }
        Value::Array(items) => {
            if depth > max_depth {
                return Err(Error::validation("context", "exceeds maximum depth"));
            }
            for nested in items {
                walk(nested, depth + 1, max_depth, max_text_len)?;
            }
        }
        Value::String(s) => check_text("context", s, max_text_len)?,
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_null_bytes_and_control_chars() {
        assert!(check_text("f", "hello\0world", 100).is_err());
        assert!(check_text("f", "hello\x07", 100).is_err());
        assert!(check_text("f", "line\nbreak", 100).is_err());
        assert!(check_text("f", "tab\tok", 100).is_ok());
    }

    #[test]
    fn rejects_overlong_before_normalization() {
        let long = "a".repeat(101);
        assert!(check_text("f", &long, 100).is_err());
        assert!(check_text("f", &"a".repeat(100), 100).is_ok());
    }

    #[test]
    fn rejects_sql_signatures() {
        for payload in [
            "1' OR '1'='1",
            "x UNION SELECT token FROM tokens",
            "; DROP TABLE posts",
            "select secret from mappings",
        ] {
            assert!(check_text("f", payload, 1000).is_err(), "allowed: {payload}");
        }
        assert!(check_text("f", "I selected a nice hat today", 1000).is_ok());
    }

    #[test]
    fn rejects_action_token_collisions() {
        assert!(check_text("f", "  Favorite ", 100).is_err());
        assert!(check_text("f", "MORE LIKE THIS", 100).is_err());
        assert!(check_text("f", "share", 100).is_err());
        assert!(check_text("f", "my favorite hat", 100).is_ok());
    }

    #[test]
    fn context_must_be_object_and_shallow() {
        assert!(check_context(&json!("string"), 4, 100).is_err());
        assert!(check_context(&json!(["a"]), 4, 100).is_err());
        assert!(check_context(&json!({"a": {"b": {"c": {"d": 1}}}}), 4, 100).is_ok());
        assert!(check_context(&json!({"a": {"b": {"c": {"d": {"e": 1}}}}}), 4, 100).is_err());
    }

    #[test]
    fn context_denies_pollution_and_admin_keys() {
        for key in ["__proto__", "constructor", "prototype", "ADMIN", "role"] {
            let ctx = json!({ key: 1 });
            assert!(check_context(&ctx, 4, 100).is_err(), "allowed key: {key}");
        }
        let nested = json!({"outer": {"__proto__": {}}});
        assert!(check_context(&nested, 4, 100).is_err());
    }

    #[test]
    fn context_string_leaves_are_screened() {
        let ctx = json!({"note": "1' OR '1'='1"});
        assert!(check_context(&ctx, 4, 100).is_err());
        let ctx = json!({"note": "saw this on my timeline"});
        assert!(check_context(&ctx, 4, 100).is_ok());
    }
}
