//! Property tests for the pipeline's universal invariants: router
//! determinism, redaction coverage, and the reply length bound.

use proptest::prelude::*;
use serde_json::json;

use orq_domain::redact::{redact_text, summarize_args};
use orq_domain::state::NextAction;
use orq_domain::turn::{Reply, Tone, MAX_REPLY_CHARS};
use orq_pipeline::{CanaryRouter, Route};

proptest! {
    #[test]
    fn router_is_deterministic_per_conversation(
        conversation_id in "[a-zA-Z0-9:_-]{1,40}",
        percent in 0u8..=100,
        staged in any::<bool>(),
    ) {
        let router = CanaryRouter::new(staged, percent);
        let first = router.route("ws1", &conversation_id, "r1");
        for _ in 0..5 {
            prop_assert_eq!(router.route("ws-other", &conversation_id, "r2"), first);
        }
        if !staged {
            prop_assert_eq!(first, Route::Legacy);
        }
    }

    #[test]
    fn buckets_respect_percent_threshold(
        conversation_id in "[a-zA-Z0-9:_-]{1,40}",
        percent in 1u8..=100,
    ) {
        let router = CanaryRouter::new(true, percent);
        let bucket = CanaryRouter::bucket(&conversation_id);
        let expected = if bucket < percent { Route::Staged } else { Route::Legacy };
        prop_assert_eq!(router.route("ws1", &conversation_id, "r1"), expected);
    }

    #[test]
    fn emails_never_survive_redaction(
        local in "[a-z][a-z0-9.]{0,12}",
        domain in "[a-z]{2,10}",
    ) {
        let text = format!("escribime a {local}@{domain}.com porfa");
        let out = redact_text(&text);
        let needle = format!("{}@{}", local, domain);
        prop_assert!(!out.contains(&needle));
        prop_assert!(out.contains("redacted:"));
    }

    #[test]
    fn phone_numbers_never_survive_redaction(digits in "[0-9]{8,13}") {
        let text = format!("mi tel es +{digits}");
        let out = redact_text(&text);
        prop_assert!(!out.contains(&digits));
    }

    #[test]
    fn sensitive_arg_values_are_hashed(name in "[g-zG-Zñ][a-zñáéíóú ]{0,29}") {
        // First char is outside the hex alphabet, so the name cannot
        // appear inside the redaction tag by coincidence.
        let summary = summarize_args(&json!({"client_name": name.clone()}), true);
        prop_assert!(!summary.contains(&name));
        prop_assert!(summary.contains("client_name="));
    }

    #[test]
    fn replies_never_exceed_the_length_bound(text in ".{0,2000}") {
        let reply = Reply::new(text, Tone::Neutral, NextAction::Answer);
        prop_assert!(reply.text.chars().count() <= MAX_REPLY_CHARS);
    }
}
