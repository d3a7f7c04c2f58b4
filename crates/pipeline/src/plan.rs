//! Planner — choose at most three tool calls for the turn.
//!
//! The model proposes; deterministic guards dispose: missing required
//! slots short-circuit to a slot-fill plan, non-whitelisted tools are
//! dropped, the turn's workspace id is injected into every action's
//! args, and anything past three actions is truncated. A fallback table
//! keyed by `(intent, populated slots)` covers model failure.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Map, Value};

use orq_domain::state::{IntentLabel, SlotValue};
use orq_domain::tools;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{Extraction, Plan, PlannedAction, TurnSnapshot, MAX_PLAN_ACTIONS};
use orq_models::{GenerateRequest, SchemaClient};
use orq_tenancy::TenantContext;

pub struct Planner {
    client: Arc<SchemaClient>,
}

impl Planner {
    pub fn new(client: Arc<SchemaClient>) -> Self {
        Self { client }
    }

    /// Produce the turn's plan. Returns `(plan, used_fallback)`.
    pub async fn plan(
        &self,
        snapshot: &TurnSnapshot,
        extraction: &Extraction,
        tenant: &TenantContext,
    ) -> (Plan, bool) {
        let started = std::time::Instant::now();

        // Working slot view: conversation state overlaid with this
        // turn's extraction.
        let mut slots = snapshot.state.slots.clone();
        slots.extend(extraction.slots.clone());

        let (plan, fallback) = self
            .plan_inner(snapshot, extraction, tenant, &slots)
            .await;

        TraceEvent::PlanBuilt {
            workspace: snapshot.workspace_id.clone(),
            action_count: plan.actions.len(),
            missing_slots: plan.missing_slots.len(),
            fallback,
            duration_ms: started.elapsed().as_millis() as u64,
        }
        .emit();

        (plan, fallback)
    }

    async fn plan_inner(
        &self,
        snapshot: &TurnSnapshot,
        extraction: &Extraction,
        tenant: &TenantContext,
        slots: &BTreeMap<String, SlotValue>,
    ) -> (Plan, bool) {
        // Missing required slots: no tools this turn, ask for them.
        let missing: Vec<String> = tenant
            .required_slots(extraction.intent)
            .iter()
            .filter(|name| !slots.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return (Plan::missing(missing), false);
        }

        // Conversational intents never plan tools.
        if matches!(
            extraction.intent,
            IntentLabel::Greeting | IntentLabel::Human | IntentLabel::Complaint | IntentLabel::Other
        ) {
            return (Plan::empty(), false);
        }

        match self
            .client
            .generate_json(&GenerateRequest {
                prompt: build_prompt(snapshot, extraction, tenant, slots),
                json_schema: plan_schema(),
                temperature: 0.0,
                max_tokens: 384,
            })
            .await
        {
            Ok(value) => {
                let plan = sanitize_plan(parse_plan(&value), &snapshot.workspace_id, tenant);
                (plan, false)
            }
            Err(e) => {
                tracing::debug!(error = %e, "model planning failed, using fallback table");
                let plan = sanitize_plan(
                    fallback_plan(extraction.intent, slots),
                    &snapshot.workspace_id,
                    tenant,
                );
                (plan, true)
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model path
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn plan_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "tool_name": { "type": "string" },
                        "args": { "type": "object" }
                    },
                    "required": ["tool_name", "args"]
                }
            },
            "needs_confirmation": { "type": "boolean" }
        },
        "required": ["actions"]
    })
}

fn build_prompt(
    snapshot: &TurnSnapshot,
    extraction: &Extraction,
    tenant: &TenantContext,
    slots: &BTreeMap<String, SlotValue>,
) -> String {
    let whitelist: Vec<&String> = tenant.config().tools.keys().collect();
    format!(
        "Plan at most {max} tool calls for this turn as JSON.\n\
         Allowed tools: {whitelist:?}.\n\
         Intent: {intent}. Slots: {slots}.\n\
         Message: {text:?}.\n\
         Only plan tools that move the conversation forward; an empty \
         list is valid.",
        max = MAX_PLAN_ACTIONS,
        whitelist = whitelist,
        intent = extraction.intent.as_str(),
        slots = serde_json::to_string(slots).unwrap_or_default(),
        text = snapshot.text,
    )
}

fn parse_plan(value: &Value) -> Plan {
    let actions = value
        .get("actions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let tool_name = item.get("tool_name")?.as_str()?.to_owned();
                    let args = item.get("args").cloned().unwrap_or_else(|| json!({}));
                    Some(PlannedAction { tool_name, args })
                })
                .collect()
        })
        .unwrap_or_default();

    Plan {
        actions,
        needs_confirmation: value
            .get("needs_confirmation")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        missing_slots: Vec::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guards
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whitelist filter, three-action cap, workspace-id injection.
fn sanitize_plan(mut plan: Plan, workspace_id: &str, tenant: &TenantContext) -> Plan {
    plan.actions.retain(|action| {
        let permitted = tenant.permits_tool(&action.tool_name);
        if !permitted {
            tracing::warn!(tool = %action.tool_name, "dropping non-whitelisted planned tool");
        }
        permitted
    });
    plan.actions.truncate(MAX_PLAN_ACTIONS);

    for action in &mut plan.actions {
        let mut args = match action.args.take() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        args.insert(
            "workspace_id".to_owned(),
            Value::String(workspace_id.to_owned()),
        );
        action.args = Value::Object(args);
    }

    plan
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fallback table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Deterministic plan keyed by `(intent, populated slot set)`.
fn fallback_plan(intent: IntentLabel, slots: &BTreeMap<String, SlotValue>) -> Plan {
    let text = |name: &str| slots.get(name).and_then(|v| v.as_text()).map(str::to_owned);

    match intent {
        IntentLabel::Book | IntentLabel::Reschedule => {
            let (Some(service), Some(date), Some(time)) = (
                text("service_type"),
                text("preferred_date"),
                text("preferred_time"),
            ) else {
                return Plan::empty();
            };
            Plan {
                actions: vec![
                    PlannedAction {
                        tool_name: tools::CHECK_AVAILABILITY.to_owned(),
                        args: json!({
                            "service_type": service,
                            "date": date,
                            "time": time,
                        }),
                    },
                    PlannedAction {
                        tool_name: tools::BOOK_APPOINTMENT.to_owned(),
                        args: json!({
                            "service_type": service,
                            "date": date,
                            "time": time,
                        }),
                    },
                ],
                needs_confirmation: false,
                missing_slots: Vec::new(),
            }
        }
        IntentLabel::Cancel => match text("booking_id") {
            Some(booking_id) => Plan {
                actions: vec![PlannedAction {
                    tool_name: tools::CANCEL_APPOINTMENT.to_owned(),
                    args: json!({ "booking_id": booking_id }),
                }],
                needs_confirmation: true,
                missing_slots: Vec::new(),
            },
            None => Plan::missing(vec!["booking_id".to_owned()]),
        },
        IntentLabel::Prices | IntentLabel::Query => Plan {
            actions: vec![PlannedAction {
                tool_name: tools::GET_SERVICES.to_owned(),
                args: json!({}),
            }],
            needs_confirmation: false,
            missing_slots: Vec::new(),
        },
        IntentLabel::Hours => Plan {
            actions: vec![PlannedAction {
                tool_name: tools::GET_BUSINESS_HOURS.to_owned(),
                args: json!({}),
            }],
            needs_confirmation: false,
            missing_slots: Vec::new(),
        },
        _ => Plan::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orq_domain::config::{TenantConfig, ToolPolicy};

    fn tenant() -> TenantContext {
        let mut config = TenantConfig::bare("ws1");
        for tool in [
            tools::CHECK_AVAILABILITY,
            tools::BOOK_APPOINTMENT,
            tools::GET_SERVICES,
            tools::GET_BUSINESS_HOURS,
            tools::CANCEL_APPOINTMENT,
        ] {
            config.tools.insert(tool.to_owned(), ToolPolicy::default());
        }
        TenantContext::new(config)
    }

    fn slots(pairs: &[(&str, &str)]) -> BTreeMap<String, SlotValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), SlotValue::Text(v.to_string())))
            .collect()
    }

    #[test]
    fn sanitize_drops_unknown_tools_and_caps_at_three() {
        let plan = Plan {
            actions: (0..5)
                .map(|i| PlannedAction {
                    tool_name: if i == 1 {
                        "rm_rf".to_owned()
                    } else {
                        tools::GET_SERVICES.to_owned()
                    },
                    args: json!({}),
                })
                .collect(),
            needs_confirmation: false,
            missing_slots: Vec::new(),
        };

        let out = sanitize_plan(plan, "ws1", &tenant());
        assert_eq!(out.actions.len(), MAX_PLAN_ACTIONS);
        assert!(out.actions.iter().all(|a| a.tool_name == tools::GET_SERVICES));
    }

    #[test]
    fn sanitize_overwrites_workspace_id() {
        let plan = Plan {
            actions: vec![PlannedAction {
                tool_name: tools::BOOK_APPOINTMENT.to_owned(),
                args: json!({"workspace_id": "evil-ws", "date": "2025-10-16"}),
            }],
            needs_confirmation: false,
            missing_slots: Vec::new(),
        };

        let out = sanitize_plan(plan, "ws1", &tenant());
        assert_eq!(out.actions[0].args["workspace_id"], "ws1");
        assert_eq!(out.actions[0].args["date"], "2025-10-16");
    }

    #[test]
    fn sanitize_turns_non_object_args_into_object() {
        let plan = Plan {
            actions: vec![PlannedAction {
                tool_name: tools::GET_SERVICES.to_owned(),
                args: json!("garbage"),
            }],
            needs_confirmation: false,
            missing_slots: Vec::new(),
        };
        let out = sanitize_plan(plan, "ws1", &tenant());
        assert_eq!(out.actions[0].args["workspace_id"], "ws1");
    }

    #[test]
    fn fallback_full_booking_plans_check_then_book() {
        let plan = fallback_plan(
            IntentLabel::Book,
            &slots(&[
                ("service_type", "Corte"),
                ("preferred_date", "2025-10-16"),
                ("preferred_time", "15:00"),
            ]),
        );
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].tool_name, tools::CHECK_AVAILABILITY);
        assert_eq!(plan.actions[1].tool_name, tools::BOOK_APPOINTMENT);
        assert_eq!(plan.actions[1].args["date"], "2025-10-16");
    }

    #[test]
    fn fallback_incomplete_booking_is_empty() {
        let plan = fallback_plan(IntentLabel::Book, &slots(&[("service_type", "Corte")]));
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn fallback_prices_fetches_services() {
        let plan = fallback_plan(IntentLabel::Prices, &slots(&[]));
        assert_eq!(plan.actions[0].tool_name, tools::GET_SERVICES);
    }

    #[test]
    fn fallback_cancel_requires_booking_id() {
        let plan = fallback_plan(IntentLabel::Cancel, &slots(&[]));
        assert!(plan.actions.is_empty());
        assert_eq!(plan.missing_slots, vec!["booking_id".to_string()]);

        let plan = fallback_plan(IntentLabel::Cancel, &slots(&[("booking_id", "b-1")]));
        assert_eq!(plan.actions[0].tool_name, tools::CANCEL_APPOINTMENT);
        assert!(plan.needs_confirmation);
    }

    #[test]
    fn parse_plan_tolerates_missing_fields() {
        let plan = parse_plan(&json!({"actions": [{"tool_name": "get_services"}]}));
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].args, json!({}));

        let plan = parse_plan(&json!({}));
        assert!(plan.actions.is_empty());
    }
}
