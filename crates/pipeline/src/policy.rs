//! Policy engine — deterministic validation of planned tool calls.
//!
//! Checks run in a fixed order: tool permitted → args present and
//! typed → rate limit → tenant constraints → redundancy. A call is
//! redundant when its fingerprint already succeeded in this
//! conversation's recent observation history, or appears twice in the
//! same plan. Denials become `DENIED_BY_POLICY` observations; they are
//! never retried within the turn. The broker's idempotency cache is a
//! separate mechanism: it replays repeats this history cannot see
//! (another conversation in the workspace, evicted history entries)
//! as `DUPLICATE` without re-invoking the tool.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use orq_domain::config::ArgKind;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{
    fingerprint, Observation, Plan, PlannedAction, ResultKind, TurnSnapshot,
};
use orq_tenancy::TenantContext;

/// One rejected action: the action as planned (for tool-call
/// summaries) plus the denial observation the reducer consumes.
pub struct Denial {
    pub action: PlannedAction,
    pub observation: Observation,
}

/// The filtered plan plus the denials to feed the reducer.
pub struct PolicyOutcome {
    pub plan: Plan,
    pub denials: Vec<Denial>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Rate limiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

/// Token bucket per `(workspace, tool)`, refilled at the tool's
/// configured per-minute rate.
struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, workspace_id: &str, tool_name: &str, max_per_minute: u32) -> bool {
        if max_per_minute == 0 {
            return true;
        }
        let capacity = max_per_minute as f64;
        let rate_per_sec = capacity / 60.0;
        let now = Instant::now();

        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((workspace_id.to_owned(), tool_name.to_owned()))
            .or_insert(Bucket {
                tokens: capacity,
                refilled_at: now,
            });

        let elapsed = now.saturating_duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(capacity);
        bucket.refilled_at = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct PolicyEngine {
    limiter: RateLimiter,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            limiter: RateLimiter::new(),
        }
    }

    /// Filter the plan against tenant policy.
    pub fn apply(&self, snapshot: &TurnSnapshot, plan: Plan, tenant: &TenantContext) -> PolicyOutcome {
        let mut kept = Vec::new();
        let mut denials = Vec::new();
        let mut seen = BTreeSet::new();

        for action in plan.actions {
            match self.check_action(snapshot, &action.tool_name, &action.args, tenant, &mut seen) {
                Ok(()) => kept.push(action),
                Err(reason) => {
                    TraceEvent::PolicyDenial {
                        workspace: snapshot.workspace_id.clone(),
                        tool: action.tool_name.clone(),
                        reason: reason.clone(),
                    }
                    .emit();
                    denials.push(Denial {
                        observation: Observation::denied(&action.tool_name, reason),
                        action,
                    });
                }
            }
        }

        PolicyOutcome {
            plan: Plan {
                actions: kept,
                needs_confirmation: plan.needs_confirmation,
                missing_slots: plan.missing_slots,
            },
            denials,
        }
    }

    fn check_action(
        &self,
        snapshot: &TurnSnapshot,
        tool_name: &str,
        args: &Value,
        tenant: &TenantContext,
        seen: &mut BTreeSet<String>,
    ) -> Result<(), String> {
        // 1. Tool permitted for this tenant.
        let Some(policy) = tenant.tool(tool_name) else {
            return Err(format!("tool '{tool_name}' is not permitted for this workspace"));
        };

        // 2. Args present and correctly typed.
        for (arg_name, spec) in &policy.args {
            match args.get(arg_name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(format!("missing required arg '{arg_name}'"));
                }
                None | Some(Value::Null) => {}
                Some(value) => {
                    if !arg_matches(spec.kind, value) {
                        return Err(format!("arg '{arg_name}' has the wrong type"));
                    }
                }
            }
        }

        // 3. Per-tool rate limit.
        if !self.limiter.allow(
            &snapshot.workspace_id,
            tool_name,
            policy.rate_limit.max_per_minute,
        ) {
            return Err(format!("rate limit exceeded for '{tool_name}'"));
        }

        // 4. Tenant constraints on arg values.
        if let Some(date) = args
            .get("date")
            .or_else(|| args.get("preferred_date"))
            .and_then(Value::as_str)
        {
            check_booking_window(date, snapshot, tenant)?;
        }

        // 5. Redundancy: a fingerprint that already succeeded in this
        // conversation's recent history, or that appears twice in the
        // same plan, is not dispatched again.
        let fp = fingerprint(&snapshot.workspace_id, tool_name, args);
        let already_succeeded = snapshot.state.history.iter().any(|obs| {
            obs.kind == ResultKind::Success && obs.request_id.as_deref() == Some(fp.as_str())
        });
        if already_succeeded {
            return Err(format!(
                "'{tool_name}' already succeeded with these arguments"
            ));
        }
        if !seen.insert(fp) {
            return Err(format!(
                "'{tool_name}' appears twice in the plan with identical arguments"
            ));
        }

        Ok(())
    }
}

fn arg_matches(kind: ArgKind, value: &Value) -> bool {
    matches!(
        (kind, value),
        (ArgKind::Text, Value::String(_))
            | (ArgKind::Number, Value::Number(_))
            | (ArgKind::Flag, Value::Bool(_))
            | (ArgKind::List, Value::Array(_))
            | (ArgKind::Object, Value::Object(_))
    )
}

/// Booking dates must be today or later, and within the tenant's
/// allowed window.
fn check_booking_window(
    date: &str,
    snapshot: &TurnSnapshot,
    tenant: &TenantContext,
) -> Result<(), String> {
    let Ok(date) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
        return Err(format!("date '{date}' is not ISO-8601"));
    };
    let tz: Tz = tenant.config().timezone.parse().unwrap_or(chrono_tz::UTC);
    let today = snapshot.now.with_timezone(&tz).date_naive();

    if date < today {
        return Err(format!("date {date} is in the past"));
    }
    let horizon = today + chrono::Days::new(tenant.config().max_days_ahead as u64);
    if date > horizon {
        return Err(format!(
            "date {date} is beyond the {}-day booking window",
            tenant.config().max_days_ahead
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use orq_domain::config::{ArgSpec, RateLimitPolicy, TenantConfig, ToolPolicy};
    use orq_domain::state::DialogueState;
    use orq_domain::tools;
    use orq_domain::turn::{PlannedAction, ResultKind};

    fn tenant() -> TenantContext {
        let mut config = TenantConfig::bare("ws1");
        let mut book = ToolPolicy::default();
        book.args.insert(
            "date".into(),
            ArgSpec {
                kind: ArgKind::Text,
                required: true,
            },
        );
        book.args.insert(
            "service_type".into(),
            ArgSpec {
                kind: ArgKind::Text,
                required: true,
            },
        );
        config.tools.insert(tools::BOOK_APPOINTMENT.into(), book);
        config
            .tools
            .insert(tools::GET_SERVICES.into(), ToolPolicy::default());
        config.max_days_ahead = 30;
        TenantContext::new(config)
    }

    fn snapshot() -> TurnSnapshot {
        TurnSnapshot {
            workspace_id: "ws1".into(),
            conversation_id: "c1".into(),
            channel: "whatsapp".into(),
            text: "quiero un turno".into(),
            state: DialogueState::default(),
            now: Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap(),
            request_id: "r1".into(),
        }
    }

    fn plan_with(actions: Vec<PlannedAction>) -> Plan {
        Plan {
            actions,
            needs_confirmation: false,
            missing_slots: Vec::new(),
        }
    }

    fn book_action(date: &str) -> PlannedAction {
        PlannedAction {
            tool_name: tools::BOOK_APPOINTMENT.into(),
            args: json!({
                "workspace_id": "ws1",
                "service_type": "Corte",
                "date": date,
            }),
        }
    }

    #[test]
    fn permitted_valid_action_passes() {
        let engine = PolicyEngine::new();
        let out = engine.apply(&snapshot(), plan_with(vec![book_action("2025-10-16")]), &tenant());
        assert_eq!(out.plan.actions.len(), 1);
        assert!(out.denials.is_empty());
    }

    #[test]
    fn unknown_tool_is_denied() {
        let engine = PolicyEngine::new();
        let out = engine.apply(
            &snapshot(),
            plan_with(vec![PlannedAction {
                tool_name: "transfer_funds".into(),
                args: json!({}),
            }]),
            &tenant(),
        );
        assert!(out.plan.actions.is_empty());
        assert_eq!(out.denials.len(), 1);
        assert_eq!(out.denials[0].observation.kind, ResultKind::DeniedByPolicy);
        assert_eq!(out.denials[0].action.tool_name, "transfer_funds");
    }

    #[test]
    fn missing_required_arg_is_denied() {
        let engine = PolicyEngine::new();
        let out = engine.apply(
            &snapshot(),
            plan_with(vec![PlannedAction {
                tool_name: tools::BOOK_APPOINTMENT.into(),
                args: json!({"date": "2025-10-16"}),
            }]),
            &tenant(),
        );
        assert!(out.plan.actions.is_empty());
        assert!(out.denials[0].observation.payload["reason"]
            .as_str()
            .unwrap()
            .contains("service_type"));
    }

    #[test]
    fn wrongly_typed_arg_is_denied() {
        let engine = PolicyEngine::new();
        let out = engine.apply(
            &snapshot(),
            plan_with(vec![PlannedAction {
                tool_name: tools::BOOK_APPOINTMENT.into(),
                args: json!({"date": 20251016, "service_type": "Corte"}),
            }]),
            &tenant(),
        );
        assert!(out.plan.actions.is_empty());
    }

    #[test]
    fn past_and_far_future_dates_are_denied() {
        let engine = PolicyEngine::new();
        for date in ["2025-10-14", "2026-06-01"] {
            let out = engine.apply(&snapshot(), plan_with(vec![book_action(date)]), &tenant());
            assert!(out.plan.actions.is_empty(), "date {date} should be denied");
        }
    }

    #[test]
    fn duplicate_action_within_plan_is_denied() {
        let engine = PolicyEngine::new();
        let out = engine.apply(
            &snapshot(),
            plan_with(vec![book_action("2025-10-16"), book_action("2025-10-16")]),
            &tenant(),
        );
        assert_eq!(out.plan.actions.len(), 1);
        assert_eq!(out.denials.len(), 1);
        assert!(out.denials[0].observation.payload["reason"]
            .as_str()
            .unwrap()
            .contains("appears twice"));

        // Same tool with different args is fine.
        let out = engine.apply(
            &snapshot(),
            plan_with(vec![book_action("2025-10-16"), book_action("2025-10-17")]),
            &tenant(),
        );
        assert_eq!(out.plan.actions.len(), 2);
        assert!(out.denials.is_empty());
    }

    #[test]
    fn prior_turn_success_is_denied() {
        let engine = PolicyEngine::new();
        let action = book_action("2025-10-16");
        let fp = fingerprint("ws1", tools::BOOK_APPOINTMENT, &action.args);

        // The previous turn's booking succeeded with these arguments.
        let mut snap = snapshot();
        snap.state.push_observation(
            Observation::success(tools::BOOK_APPOINTMENT, json!({"booking_id": "b-1"}), 10, 1)
                .with_request_id(fp),
        );

        let out = engine.apply(&snap, plan_with(vec![action]), &tenant());
        assert!(out.plan.actions.is_empty());
        assert!(out.denials[0].observation.payload["reason"]
            .as_str()
            .unwrap()
            .contains("already succeeded"));

        // A failed prior attempt does not block a retry in a new turn.
        let retry = book_action("2025-10-17");
        let retry_fp = fingerprint("ws1", tools::BOOK_APPOINTMENT, &retry.args);
        let mut snap = snapshot();
        snap.state.push_observation(
            Observation::failure(tools::BOOK_APPOINTMENT, json!({"error": "full"}), Some(409), 10, 1)
                .with_request_id(retry_fp),
        );
        let out = engine.apply(&snap, plan_with(vec![retry]), &tenant());
        assert_eq!(out.plan.actions.len(), 1);
        assert!(out.denials.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_denies_burst_and_recovers() {
        let mut config = TenantConfig::bare("ws1");
        let mut tool = ToolPolicy::default();
        tool.rate_limit = RateLimitPolicy { max_per_minute: 2 };
        config.tools.insert(tools::GET_SERVICES.into(), tool);
        let tenant = TenantContext::new(config);

        let engine = PolicyEngine::new();
        let action = || PlannedAction {
            tool_name: tools::GET_SERVICES.into(),
            args: json!({"workspace_id": "ws1"}),
        };

        for _ in 0..2 {
            let out = engine.apply(&snapshot(), plan_with(vec![action()]), &tenant);
            assert_eq!(out.plan.actions.len(), 1);
        }
        let out = engine.apply(&snapshot(), plan_with(vec![action()]), &tenant);
        assert!(out.plan.actions.is_empty());

        // Tokens refill with time.
        tokio::time::advance(std::time::Duration::from_secs(31)).await;
        let out = engine.apply(&snapshot(), plan_with(vec![action()]), &tenant);
        assert_eq!(out.plan.actions.len(), 1);
    }
}
