//! Legacy single-model path.
//!
//! One model call turns the utterance and visible slots straight into
//! reply text: no tools, no state mutation. The canary keeps a share of
//! conversations here, and the staged path falls back here on internal
//! errors.

use std::sync::Arc;

use serde_json::{json, Value};

use orq_domain::state::NextAction;
use orq_domain::turn::{Reply, Tone, TurnSnapshot};
use orq_models::{GenerateRequest, SchemaClient};
use orq_tenancy::TenantContext;

const CANNED_REPLY_ES: &str =
    "Gracias por tu mensaje. En breve te respondemos, ¿hay algo más que quieras contarnos?";
const CANNED_REPLY_EN: &str =
    "Thanks for your message. We'll get back to you shortly — anything else you'd like to add?";

pub struct LegacyResponder {
    client: Arc<SchemaClient>,
}

impl LegacyResponder {
    pub fn new(client: Arc<SchemaClient>) -> Self {
        Self { client }
    }

    /// Produce a reply without touching tools or state. Never fails.
    pub async fn respond(&self, snapshot: &TurnSnapshot, tenant: &TenantContext) -> Reply {
        let visible = snapshot.state.visible_slots();
        let result = self
            .client
            .generate_json(&GenerateRequest {
                prompt: format!(
                    "You are the assistant for a {lang}-speaking business. \
                     Reply briefly (under 480 characters) to the customer.\n\
                     Known slots: {slots}.\n\
                     Message: {text:?}",
                    lang = tenant.config().language,
                    slots = serde_json::to_string(&visible).unwrap_or_default(),
                    text = snapshot.text,
                ),
                json_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string", "maxLength": 480 } },
                    "required": ["text"]
                }),
                temperature: 0.3,
                max_tokens: 256,
            })
            .await;

        let text = result
            .ok()
            .and_then(|v| v.get("text").and_then(Value::as_str).map(str::to_owned))
            .unwrap_or_else(|| {
                if tenant.config().language == "en" {
                    CANNED_REPLY_EN.to_owned()
                } else {
                    CANNED_REPLY_ES.to_owned()
                }
            });

        Reply::new(text, Tone::Friendly, NextAction::Answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use orq_domain::config::TenantConfig;
    use orq_domain::state::DialogueState;
    use orq_models::ScriptedRuntime;

    fn snapshot() -> TurnSnapshot {
        TurnSnapshot {
            workspace_id: "ws1".into(),
            conversation_id: "c1".into(),
            channel: "whatsapp".into(),
            text: "hola".into(),
            state: DialogueState::default(),
            now: Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap(),
            request_id: "r1".into(),
        }
    }

    #[tokio::test]
    async fn model_text_is_used_when_valid() {
        let runtime = Arc::new(ScriptedRuntime::with_outputs(vec![serde_json::json!({
            "text": "¡Hola! ¿Cómo estás?"
        })]));
        let responder = LegacyResponder::new(Arc::new(SchemaClient::new(runtime)));
        let reply = responder
            .respond(&snapshot(), &TenantContext::new(TenantConfig::bare("ws1")))
            .await;
        assert_eq!(reply.text, "¡Hola! ¿Cómo estás?");
    }

    #[tokio::test]
    async fn model_failure_yields_canned_reply() {
        let responder =
            LegacyResponder::new(Arc::new(SchemaClient::new(Arc::new(ScriptedRuntime::new()))));
        let reply = responder
            .respond(&snapshot(), &TenantContext::new(TenantConfig::bare("ws1")))
            .await;
        assert_eq!(reply.text, CANNED_REPLY_ES);
        assert!(!reply.text.is_empty());
    }
}
