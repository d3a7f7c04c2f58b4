//! Deterministic PII redaction for telemetry.
//!
//! Phone numbers, email addresses and free-text argument values are
//! replaced by a stable hash tag before any event is emitted. The same
//! input always redacts to the same tag, so redacted values remain
//! correlatable across events without exposing the original.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Argument keys whose string values are always treated as free text.
const SENSITIVE_KEYS: &[&str] = &[
    "text", "message", "notes", "comment", "name", "client_name", "email", "client_email",
    "phone", "client_phone", "address",
];

/// Cap on the rendered argument summary.
const SUMMARY_MAX_CHARS: usize = 256;

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 7+ digits allowing separators, optionally prefixed with +.
    RE.get_or_init(|| Regex::new(r"\+?\d[\d\s().-]{5,}\d").unwrap())
}

/// Stable 12-hex-char tag for a redacted value.
pub fn hash_tag(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    format!("redacted:{}", &hex::encode(digest)[..12])
}

/// Replace emails and phone-like digit runs in free text.
pub fn redact_text(input: &str) -> String {
    let pass = email_re().replace_all(input, |caps: &regex::Captures<'_>| hash_tag(&caps[0]));
    phone_re()
        .replace_all(&pass, |caps: &regex::Captures<'_>| hash_tag(&caps[0]))
        .into_owned()
}

/// Render a bounded, redacted one-line summary of tool arguments.
///
/// With `redact` off (dev environments) values pass through untouched,
/// but the length bound still applies.
pub fn summarize_args(args: &Value, redact: bool) -> String {
    let rendered = match args {
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(key, value)| {
                    let shown = if redact {
                        redact_value(key, value)
                    } else {
                        value.to_string()
                    };
                    format!("{key}={shown}")
                })
                .collect();
            parts.join(" ")
        }
        other => {
            if redact {
                redact_text(&other.to_string())
            } else {
                other.to_string()
            }
        }
    };

    if rendered.chars().count() > SUMMARY_MAX_CHARS {
        rendered.chars().take(SUMMARY_MAX_CHARS).collect()
    } else {
        rendered
    }
}

fn redact_value(key: &str, value: &Value) -> String {
    match value {
        Value::String(s) => {
            if SENSITIVE_KEYS.contains(&key) {
                hash_tag(s)
            } else {
                redact_text(s)
            }
        }
        Value::Object(_) | Value::Array(_) => {
            // Nested structures collapse to a tag; keys stay visible at
            // the top level only.
            hash_tag(&value.to_string())
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emails_are_hashed() {
        let out = redact_text("contact ana.garcia@example.com please");
        assert!(!out.contains("ana.garcia"));
        assert!(!out.contains("@example.com"));
        assert!(out.contains("redacted:"));
    }

    #[test]
    fn phone_numbers_are_hashed() {
        for input in ["call +54 11 4321-5678", "tel: 1143215678"] {
            let out = redact_text(input);
            assert!(!out.contains("4321"), "digits survived in {out:?}");
            assert!(out.contains("redacted:"));
        }
    }

    #[test]
    fn redaction_is_deterministic() {
        assert_eq!(redact_text("a@b.com x"), redact_text("a@b.com x"));
        assert_eq!(hash_tag("+5411432156"), hash_tag("+5411432156"));
    }

    #[test]
    fn sensitive_keys_fully_hashed() {
        let args = json!({"client_name": "Ana García", "service": "Corte"});
        let summary = summarize_args(&args, true);
        assert!(!summary.contains("Ana"));
        assert!(summary.contains("service=Corte"));
    }

    #[test]
    fn summary_is_bounded() {
        let args = json!({"notes": "x".repeat(10_000)});
        let summary = summarize_args(&args, false);
        assert!(summary.chars().count() <= 256);
    }

    #[test]
    fn short_numbers_survive() {
        // Quantities and times are not phone numbers.
        let out = redact_text("2 personas a las 15:00");
        assert_eq!(out, "2 personas a las 15:00");
    }
}
