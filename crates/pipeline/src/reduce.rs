//! State reducer — pure projection of observations into the next
//! dialogue state.
//!
//! `reduce` never mutates its input; the orchestrator commits the
//! returned value. Known tools project payload fields into typed
//! slots; `_`-prefixed slots are derived and stay out of tenant
//! exports.

use std::collections::BTreeSet;

use serde_json::Value;

use orq_domain::state::{DialogueState, NextAction, SlotValue};
use orq_domain::tools;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{Observation, ResultKind};

/// Attempts at which a repeatedly-failing conversation is handed to a
/// human.
const GIVE_UP_ATTEMPTS: u32 = 3;

#[derive(Default)]
pub struct StateReducer;

impl StateReducer {
    pub fn new() -> Self {
        Self
    }

    /// Fold observations into a new state. `critical_tools` decides
    /// which failures surface as validation errors.
    pub fn reduce(
        &self,
        state: &DialogueState,
        observations: &[Observation],
        critical_tools: &BTreeSet<String>,
    ) -> DialogueState {
        let started = std::time::Instant::now();
        let mut next = state.clone();

        for obs in observations {
            next.push_observation(obs.clone());
            match obs.kind {
                ResultKind::Success | ResultKind::Duplicate => {
                    project_success(&mut next, obs);
                }
                ResultKind::Failure => {
                    if critical_tools.contains(&obs.tool_name) {
                        let message = failure_message(obs);
                        push_list_slot(&mut next, "_validation_errors", message);
                        next.attempts = next.attempts.saturating_add(1);
                        if next.attempts >= GIVE_UP_ATTEMPTS {
                            next.next_action = NextAction::AskHuman;
                        }
                    }
                }
                ResultKind::Timeout | ResultKind::CircuitOpen => {
                    push_list_slot(
                        &mut next,
                        "_notices",
                        format!("{} no está disponible en este momento", obs.tool_name),
                    );
                }
                ResultKind::DeniedByPolicy => {
                    let reason = obs.payload["reason"]
                        .as_str()
                        .unwrap_or("acción no permitida")
                        .to_owned();
                    push_list_slot(&mut next, "_notices", reason);
                }
            }
        }

        TraceEvent::StateReduced {
            slots_written: next.slots.len(),
            history_len: next.history.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();

        next
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-tool projections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn project_success(state: &mut DialogueState, obs: &Observation) {
    match obs.tool_name.as_str() {
        tools::BOOK_APPOINTMENT => {
            copy_text(state, &obs.payload, "booking_id", "booking_id");
            copy_text(state, &obs.payload, "confirmation_code", "confirmation_code");
            copy_text(state, &obs.payload, "date", "confirmed_date");
            copy_text(state, &obs.payload, "confirmed_date", "confirmed_date");
            copy_text(state, &obs.payload, "time", "confirmed_time");
            copy_text(state, &obs.payload, "confirmed_time", "confirmed_time");
            state.remove_slot("_validation_errors");
            state.attempts = 0;
            state.next_action = NextAction::Answer;
        }
        tools::GET_SERVICES => {
            if let Some(services) = obs.payload.get("services").and_then(Value::as_array) {
                let names: Vec<SlotValue> = services
                    .iter()
                    .filter_map(|s| match s {
                        Value::String(name) => Some(SlotValue::Text(name.clone())),
                        Value::Object(map) => map
                            .get("name")
                            .and_then(Value::as_str)
                            .map(|n| SlotValue::Text(n.to_owned())),
                        _ => None,
                    })
                    .collect();
                state.set_slot("_available_services", SlotValue::List(names));

                let prices: std::collections::BTreeMap<String, SlotValue> = services
                    .iter()
                    .filter_map(Value::as_object)
                    .filter_map(|map| {
                        let name = map.get("name")?.as_str()?;
                        let price = map.get("price")?.as_f64()?;
                        Some((name.to_owned(), SlotValue::Number(price)))
                    })
                    .collect();
                if !prices.is_empty() {
                    state.set_slot("_service_prices", SlotValue::Object(prices));
                }
            }
        }
        tools::GET_AVAILABILITY | tools::CHECK_AVAILABILITY => {
            let times = obs
                .payload
                .get("available_times")
                .or_else(|| obs.payload.get("slots"))
                .and_then(Value::as_array);
            if let Some(times) = times {
                let list: Vec<SlotValue> = times
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|t| SlotValue::Text(t.to_owned()))
                    .collect();
                if let Some(first) = list.first() {
                    state.set_slot("_next_available", first.clone());
                }
                state.set_slot("_available_times", SlotValue::List(list));
            }
        }
        tools::GET_BUSINESS_HOURS => {
            if let Some(hours) = SlotValue::from_json(
                obs.payload.get("hours").unwrap_or(&obs.payload),
            ) {
                state.set_slot("_business_hours", hours);
            }
        }
        tools::CANCEL_APPOINTMENT => {
            for slot in ["booking_id", "confirmation_code", "confirmed_date", "confirmed_time"] {
                state.remove_slot(slot);
            }
            state.set_slot("_cancelled", true);
            state.next_action = NextAction::Answer;
        }
        _ => {
            // Unknown tools leave slots untouched; the observation is
            // already in history.
        }
    }
}

fn copy_text(state: &mut DialogueState, payload: &Value, from: &str, to: &str) {
    if let Some(text) = payload.get(from).and_then(Value::as_str) {
        state.set_slot(to, text);
    }
}

fn push_list_slot(state: &mut DialogueState, name: &str, entry: String) {
    let mut items = match state.remove_slot(name) {
        Some(SlotValue::List(items)) => items,
        _ => Vec::new(),
    };
    items.push(SlotValue::Text(entry));
    state.set_slot(name, SlotValue::List(items));
}

fn failure_message(obs: &Observation) -> String {
    let detail = obs.payload["error"].as_str().unwrap_or("error desconocido");
    match obs.status_code {
        Some(code) => format!("{} falló ({code}): {detail}", obs.tool_name),
        None => format!("{} falló: {detail}", obs.tool_name),
    }
}
