//! Response generator — templates first, model only for rephrasing.
//!
//! Templates are pure data keyed by the turn's state fingerprint; the
//! model is a narrow optional hop that can only rewrite an
//! already-chosen template, so the template path survives any model
//! failure. Replies are capped at 480 characters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};

use orq_domain::state::{DialogueState, IntentLabel, NextAction, SlotValue};
use orq_domain::tools;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{Observation, Plan, Reply, ResultKind, Tone, TurnSnapshot};
use orq_models::{GenerateRequest, SchemaClient};
use orq_tenancy::TenantContext;

pub struct ResponseGenerator {
    client: Arc<SchemaClient>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Template table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One reply template. `{name}` placeholders are substituted from the
/// working state.
struct Template {
    key: &'static str,
    body_es: &'static str,
    body_en: &'static str,
    tone: Tone,
    next: NextAction,
    quick_replies: &'static [&'static str],
}

const TEMPLATES: &[Template] = &[
    Template {
        key: "greeting",
        body_es: "¡Hola! ¿En qué te puedo ayudar?",
        body_en: "Hi! How can I help you?",
        tone: Tone::Friendly,
        next: NextAction::SlotFill,
        quick_replies: &["Reservar turno", "Precios", "Horarios"],
    },
    Template {
        key: "booking_confirmed",
        body_es: "¡Listo! Tu turno de {service} quedó confirmado para el {date} a las {time}. Tu código es {booking_id}.",
        body_en: "Done! Your {service} appointment is confirmed for {date} at {time}. Your code is {booking_id}.",
        tone: Tone::Friendly,
        next: NextAction::Answer,
        quick_replies: &[],
    },
    Template {
        key: "cancelled",
        body_es: "Tu reserva fue cancelada. ¿Querés agendar otro turno?",
        body_en: "Your booking was cancelled. Would you like to book another appointment?",
        tone: Tone::Neutral,
        next: NextAction::SlotFill,
        quick_replies: &["Reservar turno"],
    },
    Template {
        key: "missing_slot",
        body_es: "{question}",
        body_en: "{question}",
        tone: Tone::Friendly,
        next: NextAction::SlotFill,
        quick_replies: &[],
    },
    Template {
        key: "validation_error",
        body_es: "No pudimos completar la operación: {error}. ¿Querés intentar con otro horario?",
        body_en: "We couldn't complete that: {error}. Want to try a different time?",
        tone: Tone::Apologetic,
        next: NextAction::SlotFill,
        quick_replies: &[],
    },
    Template {
        key: "service_unavailable",
        body_es: "Estamos teniendo demoras para procesar tu pedido. ¿Querés que te contactemos nosotros?",
        body_en: "We're running behind processing your request. Want us to reach out to you?",
        tone: Tone::Apologetic,
        next: NextAction::AskHuman,
        quick_replies: &["Sí, contáctenme"],
    },
    Template {
        key: "availability",
        body_es: "Tenemos estos horarios disponibles: {times}. ¿Cuál te queda mejor?",
        body_en: "These times are available: {times}. Which works best?",
        tone: Tone::Friendly,
        next: NextAction::SlotFill,
        quick_replies: &[],
    },
    Template {
        key: "prices",
        body_es: "Estos son nuestros servicios: {services}.",
        body_en: "These are our services: {services}.",
        tone: Tone::Neutral,
        next: NextAction::Answer,
        quick_replies: &["Reservar turno"],
    },
    Template {
        key: "hours",
        body_es: "Nuestros horarios de atención: {hours}.",
        body_en: "Our opening hours: {hours}.",
        tone: Tone::Neutral,
        next: NextAction::Answer,
        quick_replies: &[],
    },
    Template {
        key: "human",
        body_es: "Te paso con una persona del equipo, ¡un segundo!",
        body_en: "Let me hand you over to a teammate, one second!",
        tone: Tone::Friendly,
        next: NextAction::AskHuman,
        quick_replies: &[],
    },
    Template {
        key: "fallback",
        body_es: "¿Me contás un poco más así te puedo ayudar mejor?",
        body_en: "Could you tell me a bit more so I can help?",
        tone: Tone::Neutral,
        next: NextAction::SlotFill,
        quick_replies: &[],
    },
];

fn template(key: &str) -> &'static Template {
    TEMPLATES
        .iter()
        .find(|t| t.key == key)
        .unwrap_or_else(|| TEMPLATES.last().expect("fallback template exists"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl ResponseGenerator {
    pub fn new(client: Arc<SchemaClient>) -> Self {
        Self { client }
    }

    pub async fn respond(
        &self,
        snapshot: &TurnSnapshot,
        intent: IntentLabel,
        plan: &Plan,
        observations: &[Observation],
        state: &DialogueState,
        low_confidence: bool,
        tenant: &TenantContext,
    ) -> Reply {
        let started = std::time::Instant::now();

        let key = classify(intent, plan, observations, state);
        let tpl = template(key);
        let vars = build_vars(plan, state, tenant);

        let body = if tenant.config().language == "en" {
            tpl.body_en
        } else {
            tpl.body_es
        };
        let mut text = render(body, &vars);
        if low_confidence && key != "greeting" {
            let softener = if tenant.config().language == "en" {
                "If I understood correctly: "
            } else {
                "Si entendí bien: "
            };
            text = format!("{softener}{text}");
        }

        let mut model_fallback = false;
        if tenant.config().features.rephrase_with_model {
            if let Some(rephrased) = self.rephrase(&text, tenant).await {
                text = rephrased;
                model_fallback = true;
            }
        }

        let reply = Reply::new(text, tpl.tone, tpl.next)
            .with_quick_replies(tpl.quick_replies.iter().map(|s| s.to_string()).collect());

        TraceEvent::ReplyComposed {
            workspace: snapshot.workspace_id.clone(),
            template: Some(key.to_owned()),
            model_fallback,
            chars: reply.text.chars().count(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();

        reply
    }

    /// Ask the model to rewrite the template output. Any failure keeps
    /// the template text.
    async fn rephrase(&self, text: &str, tenant: &TenantContext) -> Option<String> {
        let out = self
            .client
            .generate_json(&GenerateRequest {
                prompt: format!(
                    "Rewrite this {lang} chat reply in the same meaning and tone, \
                     under 480 characters: {text:?}",
                    lang = tenant.config().language,
                ),
                json_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string", "maxLength": 480 } },
                    "required": ["text"]
                }),
                temperature: 0.4,
                max_tokens: 256,
            })
            .await
            .ok()?;
        out.get("text").and_then(Value::as_str).map(str::to_owned)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pick the template key from the turn's intent, plan and effects.
fn classify(
    intent: IntentLabel,
    plan: &Plan,
    observations: &[Observation],
    state: &DialogueState,
) -> &'static str {
    let succeeded = |tool: &str| {
        observations
            .iter()
            .any(|o| o.tool_name == tool && o.is_success())
    };
    let disrupted = observations.iter().any(|o| {
        matches!(o.kind, ResultKind::CircuitOpen | ResultKind::Timeout)
    });

    if intent == IntentLabel::Greeting {
        return "greeting";
    }
    if intent == IntentLabel::Human {
        return "human";
    }
    if succeeded(tools::BOOK_APPOINTMENT) {
        return "booking_confirmed";
    }
    if succeeded(tools::CANCEL_APPOINTMENT) {
        return "cancelled";
    }
    if !plan.missing_slots.is_empty() {
        return "missing_slot";
    }
    if state.has_slot("_validation_errors") {
        return "validation_error";
    }
    if disrupted {
        return "service_unavailable";
    }
    if succeeded(tools::CHECK_AVAILABILITY) || succeeded(tools::GET_AVAILABILITY) {
        return "availability";
    }
    if succeeded(tools::GET_SERVICES) {
        return "prices";
    }
    if succeeded(tools::GET_BUSINESS_HOURS) {
        return "hours";
    }
    "fallback"
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rendering
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_vars(
    plan: &Plan,
    state: &DialogueState,
    tenant: &TenantContext,
) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    let text_slot = |name: &str| state.slot_text(name).map(str::to_owned);

    if let Some(v) = text_slot("service_type") {
        vars.insert("service", v);
    }
    if let Some(v) = text_slot("confirmed_date").or_else(|| text_slot("preferred_date")) {
        vars.insert("date", v);
    }
    if let Some(v) = text_slot("confirmed_time").or_else(|| text_slot("preferred_time")) {
        vars.insert("time", v);
    }
    if let Some(v) = text_slot("booking_id") {
        vars.insert("booking_id", v);
    }

    if let Some(slot) = plan.missing_slots.first() {
        vars.insert(
            "question",
            slot_question(slot, &tenant.config().language),
        );
    }

    if let Some(SlotValue::List(errors)) = state.slot("_validation_errors") {
        if let Some(SlotValue::Text(last)) = errors.last() {
            vars.insert("error", last.clone());
        }
    }

    if let Some(SlotValue::List(times)) = state.slot("_available_times") {
        let joined: Vec<&str> = times
            .iter()
            .filter_map(|t| t.as_text())
            .take(6)
            .collect();
        vars.insert("times", joined.join(", "));
    }

    let services: Vec<String> = tenant
        .config()
        .catalogs
        .services
        .iter()
        .map(|s| format!("{} (${:.0})", s.name, s.price))
        .collect();
    if !services.is_empty() {
        vars.insert("services", services.join(", "));
    } else if let Some(SlotValue::List(names)) = state.slot("_available_services") {
        let joined: Vec<&str> = names.iter().filter_map(|n| n.as_text()).collect();
        vars.insert("services", joined.join(", "));
    }

    let hours: Vec<String> = tenant
        .config()
        .catalogs
        .hours
        .iter()
        .map(|h| format!("{} {}-{}", h.day, h.open, h.close))
        .collect();
    if !hours.is_empty() {
        vars.insert("hours", hours.join(", "));
    }

    vars
}

fn slot_question(slot: &str, language: &str) -> String {
    let es = match slot {
        "service_type" => "¿Qué servicio querés reservar?",
        "preferred_date" => "¿Para qué día lo querés?",
        "preferred_time" => "¿A qué hora te queda bien?",
        "booking_id" => "¿Me pasás el código de tu reserva?",
        other => return format!("¿Me pasás {other}?"),
    };
    let en = match slot {
        "service_type" => "Which service would you like to book?",
        "preferred_date" => "Which day works for you?",
        "preferred_time" => "What time works for you?",
        "booking_id" => "Could you share your booking code?",
        other => return format!("Could you share {other}?"),
    };
    if language == "en" { en.to_owned() } else { es.to_owned() }
}

/// Substitute `{name}` placeholders; unknown placeholders render as an
/// empty string.
fn render(body: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = body.to_owned();
    for (name, value) in vars {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    // Drop any placeholder that had no value.
    while let (Some(open), Some(close)) = (out.find('{'), out.find('}')) {
        if close < open {
            break;
        }
        out.replace_range(open..=close, "");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use orq_domain::config::{ServiceEntry, TenantConfig};
    use orq_models::ScriptedRuntime;

    fn tenant() -> TenantContext {
        let mut config = TenantConfig::bare("ws1");
        config.catalogs.services.push(ServiceEntry {
            name: "Corte".into(),
            price: 15.0,
            duration_min: 30,
        });
        TenantContext::new(config)
    }

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

    fn generator() -> ResponseGenerator {
        ResponseGenerator::new(Arc::new(SchemaClient::new(Arc::new(ScriptedRuntime::new()))))
    }

    #[tokio::test]
    async fn greeting_uses_template_with_quick_replies() {
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Greeting,
                &Plan::empty(),
                &[],
                &DialogueState::default(),
                false,
                &tenant(),
            )
            .await;
        assert!(!reply.text.is_empty());
        assert!(!reply.quick_replies.is_empty());
        assert_eq!(reply.suggested_next, NextAction::SlotFill);
    }

    #[tokio::test]
    async fn booking_confirmation_interpolates_slots() {
        let mut state = DialogueState::default();
        state.set_slot("service_type", "Corte");
        state.set_slot("confirmed_date", "2025-10-16");
        state.set_slot("confirmed_time", "15:00");
        state.set_slot("booking_id", "b-42");

        let obs = Observation::success(tools::BOOK_APPOINTMENT, json!({}), 10, 1);
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Book,
                &Plan::empty(),
                &[obs],
                &state,
                false,
                &tenant(),
            )
            .await;

        assert!(reply.text.contains("2025-10-16"));
        assert!(reply.text.contains("15:00"));
        assert!(reply.text.contains("b-42"));
        assert_eq!(reply.suggested_next, NextAction::Answer);
    }

    #[tokio::test]
    async fn missing_slot_asks_the_right_question() {
        let plan = Plan::missing(vec!["service_type".into()]);
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Book,
                &plan,
                &[],
                &DialogueState::default(),
                false,
                &tenant(),
            )
            .await;
        assert!(reply.text.contains("servicio"));
        assert_eq!(reply.suggested_next, NextAction::SlotFill);
    }

    #[tokio::test]
    async fn circuit_disruption_offers_human_contact() {
        let obs = Observation::circuit_open(tools::BOOK_APPOINTMENT);
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Book,
                &Plan::empty(),
                &[obs],
                &DialogueState::default(),
                false,
                &tenant(),
            )
            .await;
        assert_eq!(reply.suggested_next, NextAction::AskHuman);
        assert_eq!(reply.tone, Tone::Apologetic);
    }

    #[tokio::test]
    async fn low_confidence_softens_phrasing() {
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Query,
                &Plan::empty(),
                &[],
                &DialogueState::default(),
                true,
                &tenant(),
            )
            .await;
        assert!(reply.text.starts_with("Si entendí bien"));
    }

    #[tokio::test]
    async fn reply_never_exceeds_480_chars() {
        let mut state = DialogueState::default();
        state.set_slot("service_type", "x".repeat(600));
        let obs = Observation::success(tools::BOOK_APPOINTMENT, json!({}), 10, 1);
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Book,
                &Plan::empty(),
                &[obs],
                &state,
                false,
                &tenant(),
            )
            .await;
        assert!(reply.text.chars().count() <= 480);
    }

    #[tokio::test]
    async fn rephrase_failure_keeps_template_text() {
        let mut config = TenantConfig::bare("ws1");
        config.features.rephrase_with_model = true;
        let tenant = TenantContext::new(config);

        // Scripted runtime with no outputs: the rephrase hop fails.
        let reply = generator()
            .respond(
                &snapshot(),
                IntentLabel::Greeting,
                &Plan::empty(),
                &[],
                &DialogueState::default(),
                false,
                &tenant,
            )
            .await;
        assert!(!reply.text.is_empty());
    }

    #[test]
    fn render_substitutes_and_drops_unknown() {
        let mut vars = BTreeMap::new();
        vars.insert("date", "2025-10-16".to_owned());
        let out = render("El {date} a las {time}", &vars);
        assert_eq!(out, "El 2025-10-16 a las ");
    }

    #[test]
    fn classification_priorities() {
        let booked = Observation::success(tools::BOOK_APPOINTMENT, json!({}), 1, 1);
        assert_eq!(
            classify(IntentLabel::Book, &Plan::empty(), &[booked], &DialogueState::default()),
            "booking_confirmed"
        );

        let plan = Plan::missing(vec!["preferred_date".into()]);
        assert_eq!(
            classify(IntentLabel::Book, &plan, &[], &DialogueState::default()),
            "missing_slot"
        );

        assert_eq!(
            classify(IntentLabel::Other, &Plan::empty(), &[], &DialogueState::default()),
            "fallback"
        );
    }
}
