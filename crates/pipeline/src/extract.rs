//! Extractor — intent classification and slot extraction.
//!
//! Model-first with a deterministic keyword/regex fallback, so the
//! stage always yields a result. Dates and times are normalized to
//! ISO-8601 in the tenant's timezone against the snapshot's `now`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use chrono_tz::Tz;
use serde_json::{json, Value};

use orq_domain::state::{IntentLabel, SlotValue};
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{Extraction, TurnSnapshot};
use orq_models::{GenerateRequest, SchemaClient};
use orq_tenancy::TenantContext;

pub struct Extractor {
    client: Arc<SchemaClient>,
}

impl Extractor {
    pub fn new(client: Arc<SchemaClient>) -> Self {
        Self { client }
    }

    /// Classify the utterance and extract slots. Never fails: model
    /// schema violations fall back to the keyword heuristic. Returns
    /// `(extraction, used_heuristic)`.
    pub async fn extract(
        &self,
        snapshot: &TurnSnapshot,
        tenant: &TenantContext,
    ) -> (Extraction, bool) {
        let started = std::time::Instant::now();
        let tz = tenant_tz(tenant);
        let today = snapshot.now.with_timezone(&tz).date_naive();

        let (mut extraction, heuristic) = match self
            .client
            .generate_json(&GenerateRequest {
                prompt: build_prompt(snapshot, tenant, today),
                json_schema: extraction_schema(),
                temperature: 0.0,
                max_tokens: 256,
            })
            .await
        {
            Ok(value) => (parse_extraction(&value), false),
            Err(e) => {
                tracing::debug!(error = %e, "model extraction failed, using heuristic");
                (heuristic_extract(&snapshot.text, tenant), true)
            }
        };

        normalize_slots(&mut extraction.slots, today);

        TraceEvent::ExtractionDone {
            workspace: snapshot.workspace_id.clone(),
            intent: extraction.intent.as_str().to_owned(),
            confidence: extraction.confidence,
            slot_count: extraction.slots.len(),
            heuristic,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();

        (extraction, heuristic)
    }
}

fn tenant_tz(tenant: &TenantContext) -> Tz {
    tenant
        .config()
        .timezone
        .parse()
        .unwrap_or(chrono_tz::UTC)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn extraction_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "intent": {
                "type": "string",
                "enum": [
                    "greeting", "book", "reschedule", "cancel", "query",
                    "prices", "hours", "location", "complaint", "human", "other"
                ]
            },
            "slots": { "type": "object" },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        },
        "required": ["intent", "slots", "confidence"]
    })
}

fn build_prompt(snapshot: &TurnSnapshot, tenant: &TenantContext, today: NaiveDate) -> String {
    let config = tenant.config();
    let services: Vec<&str> = config
        .catalogs
        .services
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    let slot_names: Vec<&String> = config.slot_schema.keys().collect();
    let prior = snapshot.state.visible_slots();

    format!(
        "Classify the user message and extract slots as JSON.\n\
         Language: {lang}. Today is {today} ({tz}).\n\
         Known services: {services:?}.\n\
         Slot schema: {slot_names:?}.\n\
         Prior slots: {prior}.\n\
         Channel: {channel}.\n\
         Dates must be ISO-8601 (YYYY-MM-DD); times HH:MM (24h); resolve \
         relative expressions against today.\n\
         Message: {text:?}",
        lang = config.language,
        today = today,
        tz = config.timezone,
        services = services,
        slot_names = slot_names,
        prior = serde_json::to_string(&prior).unwrap_or_default(),
        channel = snapshot.channel,
        text = snapshot.text,
    )
}

fn parse_extraction(value: &Value) -> Extraction {
    let intent = value
        .get("intent")
        .and_then(Value::as_str)
        .map(IntentLabel::parse_label)
        .unwrap_or(IntentLabel::Other);

    let mut slots = BTreeMap::new();
    if let Some(map) = value.get("slots").and_then(Value::as_object) {
        for (name, raw) in map {
            if let Some(slot) = SlotValue::from_json(raw) {
                slots.insert(name.clone(), slot);
            }
        }
    }

    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    Extraction {
        intent,
        slots,
        confidence,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heuristic fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const CANCEL_CUES: &[&str] = &["cancelar", "cancelo", "cancel", "anular"];
const BOOK_CUES: &[&str] = &[
    "turno", "reserva", "reservar", "cita", "agendar", "book", "appointment", "quiero",
    "necesito",
];
const PRICE_CUES: &[&str] = &["precio", "cuánto sale", "cuanto sale", "cuánto cuesta", "price"];
const HOURS_CUES: &[&str] = &["horario", "a qué hora", "abren", "cierran", "hours", "open"];
const LOCATION_CUES: &[&str] = &["dónde", "donde queda", "dirección", "direccion", "address"];
const HUMAN_CUES: &[&str] = &["humano", "persona real", "agente", "operador", "human"];
const GREETING_CUES: &[&str] = &[
    "hola", "buenos días", "buenos dias", "buenas tardes", "buenas noches", "buen día",
    "buen dia", "hello", "hi ", "hey",
];

/// Keyword/regex extraction used when the model fails twice.
pub fn heuristic_extract(text: &str, tenant: &TenantContext) -> Extraction {
    let lowered = text.to_lowercase();
    let contains = |cues: &[&str]| cues.iter().any(|cue| lowered.contains(cue));

    let (intent, confidence) = if contains(CANCEL_CUES) {
        (IntentLabel::Cancel, 0.7)
    } else if contains(BOOK_CUES) {
        (IntentLabel::Book, 0.7)
    } else if contains(PRICE_CUES) {
        (IntentLabel::Prices, 0.7)
    } else if contains(HOURS_CUES) {
        (IntentLabel::Hours, 0.7)
    } else if contains(LOCATION_CUES) {
        (IntentLabel::Location, 0.7)
    } else if contains(HUMAN_CUES) {
        (IntentLabel::Human, 0.7)
    } else if contains(GREETING_CUES) {
        (IntentLabel::Greeting, 0.9)
    } else {
        (IntentLabel::Other, 0.5)
    };

    let mut slots = BTreeMap::new();

    // Service mention from the tenant catalog.
    for service in &tenant.config().catalogs.services {
        if lowered.contains(&service.name.to_lowercase()) {
            slots.insert("service_type".to_owned(), SlotValue::Text(service.name.clone()));
            break;
        }
    }

    if let Some(date) = scrape_date_expression(&lowered) {
        slots.insert("preferred_date".to_owned(), SlotValue::Text(date));
    }
    if let Some(time) = scrape_time_expression(&lowered) {
        slots.insert("preferred_time".to_owned(), SlotValue::Text(time));
    }

    Extraction {
        intent,
        slots,
        confidence,
    }
}

/// Pull a raw date expression out of free text (normalized later).
fn scrape_date_expression(lowered: &str) -> Option<String> {
    for cue in ["pasado mañana", "pasado manana", "mañana", "manana", "tomorrow", "hoy", "today"] {
        if lowered.contains(cue) {
            return Some(cue.to_owned());
        }
    }
    let re = date_re();
    re.find(lowered).map(|m| m.as_str().to_owned())
}

fn scrape_time_expression(lowered: &str) -> Option<String> {
    if let Some(caps) = clock_re().captures(lowered) {
        return Some(caps[0].trim().to_owned());
    }
    if let Some(caps) = a_las_re().captures(lowered) {
        return Some(caps[1].to_owned());
    }
    None
}

fn date_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\b(\d{1,2})/(\d{1,2})(?:/(\d{2,4}))?\b").unwrap())
}

fn clock_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm|hs)\b|\b(\d{1,2}):(\d{2})\b")
            .unwrap()
    })
}

fn a_las_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"a las (\d{1,2})\b").unwrap())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Normalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Normalize `*date`/`*time` text slots in place. Values that cannot be
/// interpreted are left untouched.
pub fn normalize_slots(slots: &mut BTreeMap<String, SlotValue>, today: NaiveDate) {
    for (name, value) in slots.iter_mut() {
        let SlotValue::Text(raw) = value else { continue };
        if name.ends_with("date") {
            if let Some(normalized) = normalize_date(raw, today) {
                *value = SlotValue::Text(normalized);
            }
        } else if name.ends_with("time") {
            if let Some(normalized) = normalize_time(raw) {
                *value = SlotValue::Text(normalized);
            }
        }
    }
}

/// Resolve a date expression to `YYYY-MM-DD` relative to `today`.
pub fn normalize_date(raw: &str, today: NaiveDate) -> Option<String> {
    let lowered = raw.trim().to_lowercase();

    if iso_date_re().is_match(&lowered) {
        return Some(lowered);
    }

    let offset = match lowered.as_str() {
        "hoy" | "today" => Some(0),
        "mañana" | "manana" | "tomorrow" => Some(1),
        "pasado mañana" | "pasado manana" => Some(2),
        _ => None,
    };
    if let Some(days) = offset {
        return Some((today + chrono::Days::new(days)).format("%Y-%m-%d").to_string());
    }

    let caps = date_re().captures(&lowered)?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = match caps.get(3) {
        Some(m) => {
            let y: i32 = m.as_str().parse().ok()?;
            if y < 100 { y + 2000 } else { y }
        }
        None => today.year(),
    };
    let mut date = NaiveDate::from_ymd_opt(year, month, day)?;
    // A day/month with no year that already passed means next year.
    if caps.get(3).is_none() && date < today {
        date = NaiveDate::from_ymd_opt(year + 1, month, day)?;
    }
    Some(date.format("%Y-%m-%d").to_string())
}

/// Resolve a time expression to `HH:MM` (24h). Hours 1–8 without an
/// am/pm marker are read as afternoon, matching walk-in booking usage.
pub fn normalize_time(raw: &str) -> Option<String> {
    let caps = time_norm_re().captures(raw.trim())?;
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(0))?;
    let marker = caps.get(3).map(|m| m.as_str().to_lowercase());

    match marker.as_deref() {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        Some(_) | None => {
            if marker.is_none() && (1..=8).contains(&hour) {
                hour += 12;
            }
        }
    }

    if hour > 23 || minute > 59 {
        return None;
    }
    Some(format!("{hour:02}:{minute:02}"))
}

fn iso_date_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap())
}

fn time_norm_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)^(\d{1,2})(?::(\d{2}))?\s*(am|pm|hs)?$").unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use orq_domain::config::{ServiceEntry, TenantConfig};

    fn tenant() -> TenantContext {
        let mut config = TenantConfig::bare("ws1");
        config.catalogs.services.push(ServiceEntry {
            name: "Corte".into(),
            price: 15.0,
            duration_min: 30,
        });
        config.catalogs.services.push(ServiceEntry {
            name: "Color".into(),
            price: 40.0,
            duration_min: 60,
        });
        TenantContext::new(config)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 15).unwrap()
    }

    #[test]
    fn heuristic_greeting() {
        let out = heuristic_extract("Hola, buenos días", &tenant());
        assert_eq!(out.intent, IntentLabel::Greeting);
        assert!(out.confidence >= 0.9);
    }

    #[test]
    fn heuristic_booking_with_service_date_time() {
        let out = heuristic_extract("Quiero corte mañana a las 3pm", &tenant());
        assert_eq!(out.intent, IntentLabel::Book);
        assert_eq!(
            out.slots.get("service_type"),
            Some(&SlotValue::Text("Corte".into()))
        );
        assert_eq!(
            out.slots.get("preferred_date"),
            Some(&SlotValue::Text("mañana".into()))
        );
        assert_eq!(
            out.slots.get("preferred_time"),
            Some(&SlotValue::Text("3pm".into()))
        );
    }

    #[test]
    fn heuristic_cancel_beats_book() {
        let out = heuristic_extract("quiero cancelar el turno", &tenant());
        assert_eq!(out.intent, IntentLabel::Cancel);
    }

    #[test]
    fn heuristic_unknown_is_other_at_half_confidence() {
        let out = heuristic_extract("asdf qwerty", &tenant());
        assert_eq!(out.intent, IntentLabel::Other);
        assert_eq!(out.confidence, 0.5);
    }

    #[test]
    fn date_normalization_relative() {
        assert_eq!(normalize_date("hoy", today()).unwrap(), "2025-10-15");
        assert_eq!(normalize_date("mañana", today()).unwrap(), "2025-10-16");
        assert_eq!(normalize_date("tomorrow", today()).unwrap(), "2025-10-16");
        assert_eq!(
            normalize_date("pasado mañana", today()).unwrap(),
            "2025-10-17"
        );
    }

    #[test]
    fn date_normalization_numeric() {
        assert_eq!(normalize_date("20/10", today()).unwrap(), "2025-10-20");
        assert_eq!(normalize_date("20/10/2026", today()).unwrap(), "2026-10-20");
        // Already-passed day/month rolls to next year.
        assert_eq!(normalize_date("3/1", today()).unwrap(), "2026-01-03");
        // ISO passes through.
        assert_eq!(
            normalize_date("2025-12-01", today()).unwrap(),
            "2025-12-01"
        );
        assert_eq!(normalize_date("whenever", today()), None);
    }

    #[test]
    fn time_normalization() {
        assert_eq!(normalize_time("3pm").unwrap(), "15:00");
        assert_eq!(normalize_time("3:30 pm").unwrap(), "15:30");
        assert_eq!(normalize_time("15:00").unwrap(), "15:00");
        assert_eq!(normalize_time("12am").unwrap(), "00:00");
        assert_eq!(normalize_time("18hs").unwrap(), "18:00");
        // Afternoon assumption for bare small hours.
        assert_eq!(normalize_time("3").unwrap(), "15:00");
        assert_eq!(normalize_time("11").unwrap(), "11:00");
        assert_eq!(normalize_time("99:00"), None);
    }

    #[test]
    fn normalize_slots_rewrites_date_and_time_keys() {
        let mut slots = BTreeMap::new();
        slots.insert("preferred_date".into(), SlotValue::Text("mañana".into()));
        slots.insert("preferred_time".into(), SlotValue::Text("3pm".into()));
        slots.insert("service_type".into(), SlotValue::Text("Corte".into()));
        normalize_slots(&mut slots, today());

        assert_eq!(
            slots.get("preferred_date"),
            Some(&SlotValue::Text("2025-10-16".into()))
        );
        assert_eq!(
            slots.get("preferred_time"),
            Some(&SlotValue::Text("15:00".into()))
        );
        assert_eq!(
            slots.get("service_type"),
            Some(&SlotValue::Text("Corte".into()))
        );
    }

    #[test]
    fn parse_extraction_tolerates_sloppy_model_output() {
        let value = serde_json::json!({
            "intent": "BOOK",
            "slots": {"service_type": "Corte", "ignored": null},
            "confidence": 1.7
        });
        let out = parse_extraction(&value);
        assert_eq!(out.intent, IntentLabel::Book);
        assert_eq!(out.confidence, 1.0);
        assert!(!out.slots.contains_key("ignored"));
    }
}
