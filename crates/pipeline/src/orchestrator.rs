//! Pipeline orchestrator — sequences the stages for one turn.
//!
//! Owns the turn snapshot, holds the conversation lock from state load
//! to patch commit, threads the deadline into every suspension point,
//! and guarantees the caller always receives a well-formed envelope
//! with non-empty assistant text. Internal staged-path errors fall back
//! to the legacy path for the turn.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;

use orq_broker::{Deadline, ToolBroker};
use orq_domain::config::EnvConfig;
use orq_domain::redact::summarize_args;
use orq_domain::state::{diff_states, DialogueState, SlotValue};
use orq_domain::tools;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{
    fingerprint, Observation, Reply, ResultKind, ToolCall, TurnSnapshot,
};
use orq_domain::{Error, Result};
use orq_models::{ModelRuntime, SchemaClient};
use orq_tenancy::{
    ConversationLockMap, HistoryEntry, OutboxEvent, StateStore, TenantContext, TenantDirectory,
};

use crate::envelope::{
    AssistantMessage, ToolCallSummary, TurnRequest, TurnResponse, TurnTelemetry,
};
use crate::extract::Extractor;
use crate::legacy::LegacyResponder;
use crate::plan::Planner;
use crate::policy::PolicyEngine;
use crate::reduce::StateReducer;
use crate::respond::ResponseGenerator;
use crate::router::{CanaryRouter, Route};

const DEGRADED_REPLY_ES: &str = "Estamos teniendo demoras, ¿querés que te contactemos?";
const DEGRADED_REPLY_EN: &str = "We're running behind — want us to contact you?";

pub struct Pipeline {
    env: EnvConfig,
    router: CanaryRouter,
    extractor: Extractor,
    planner: Planner,
    policy: PolicyEngine,
    reducer: StateReducer,
    responder: ResponseGenerator,
    legacy: LegacyResponder,
    broker: Arc<ToolBroker>,
    directory: Arc<TenantDirectory>,
    store: Arc<dyn StateStore>,
    locks: ConversationLockMap,
}

/// Everything a successful staged run produces before commit.
struct StagedOutcome {
    reply: Reply,
    observations: Vec<Observation>,
    tool_calls: Vec<ToolCallSummary>,
    working_state: DialogueState,
    intent: String,
    confidence: f64,
    t_extract_ms: u64,
    t_plan_ms: u64,
    t_policy_ms: u64,
    t_broker_ms: u64,
    t_reduce_ms: u64,
    t_nlg_ms: u64,
}

impl Pipeline {
    pub fn new(
        env: EnvConfig,
        runtime: Arc<dyn ModelRuntime>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let client = Arc::new(SchemaClient::new(runtime));
        Self {
            router: CanaryRouter::from_env(&env),
            extractor: Extractor::new(client.clone()),
            planner: Planner::new(client.clone()),
            policy: PolicyEngine::new(),
            reducer: StateReducer::new(),
            responder: ResponseGenerator::new(client.clone()),
            legacy: LegacyResponder::new(client),
            broker: Arc::new(ToolBroker::new(&env)),
            directory: Arc::new(TenantDirectory::new(store.clone())),
            store,
            locks: ConversationLockMap::new(),
            env,
        }
    }

    /// The broker, for registering in-process tools and admin surfaces.
    pub fn broker(&self) -> &Arc<ToolBroker> {
        &self.broker
    }

    pub fn directory(&self) -> &Arc<TenantDirectory> {
        &self.directory
    }

    /// Handle one inbound turn. Always yields a well-formed response
    /// with non-empty assistant text.
    pub async fn handle_turn(&self, request: TurnRequest) -> TurnResponse {
        let total_start = Instant::now();
        let route = self
            .router
            .route(&request.workspace_id, &request.conversation_id, &request.request_id);

        match self.run_turn(&request, route, total_start).await {
            Ok(response) => response,
            Err(error) => {
                let correlation = uuid::Uuid::new_v4();
                tracing::error!(
                    error = %error,
                    correlation = %correlation,
                    workspace = %request.workspace_id,
                    "turn failed, returning safe reply"
                );
                self.safe_error_response(&request, &error, route, total_start)
            }
        }
    }

    async fn run_turn(
        &self,
        request: &TurnRequest,
        route: Route,
        total_start: Instant,
    ) -> Result<TurnResponse> {
        // Serialize turns per conversation from load to commit.
        let _turn_lock = self
            .locks
            .acquire(&request.workspace_id, &request.conversation_id)
            .await
            .map_err(|_| Error::Internal("conversation lock closed".into()))?;

        let tenant = self.directory.get(&request.workspace_id).await?;
        tenant.ensure_workspace(&request.workspace_id)?;

        let record = self
            .store
            .load_or_create_conversation(
                &request.workspace_id,
                &request.conversation_id,
                &request.channel,
            )
            .await?;

        let snapshot = self.build_snapshot(request, record.state);
        let deadline = Deadline::after_ms(self.env.turn_deadline_ms);

        match route {
            Route::Legacy => Ok(self
                .legacy_turn(&snapshot, &tenant, route, false, total_start)
                .await),
            Route::Staged => {
                let staged = tokio::time::timeout(
                    deadline.remaining(),
                    self.staged_turn(&snapshot, &tenant, deadline),
                )
                .await;

                match staged {
                    Ok(Ok(outcome)) => {
                        Ok(self
                            .commit_and_respond(&snapshot, &tenant, outcome, route, total_start)
                            .await)
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(
                            error = %error,
                            "staged path failed, falling back to legacy for this turn"
                        );
                        Ok(self
                            .legacy_turn(&snapshot, &tenant, route, true, total_start)
                            .await)
                    }
                    Err(_) => Ok(self.degraded_response(&snapshot, &tenant, route, total_start)),
                }
            }
        }
    }

    fn build_snapshot(&self, request: &TurnRequest, mut state: DialogueState) -> TurnSnapshot {
        // Seed slots the caller knows but the store has not seen.
        for (name, value) in &request.slots {
            if !state.slots.contains_key(name) {
                if let Some(slot) = SlotValue::from_json(value) {
                    state.slots.insert(name.clone(), slot);
                }
            }
        }

        TurnSnapshot {
            workspace_id: request.workspace_id.clone(),
            conversation_id: request.conversation_id.clone(),
            channel: request.channel.clone(),
            text: request.user_message.text.clone(),
            state,
            now: request.context.now.unwrap_or_else(Utc::now),
            request_id: request.request_id.clone(),
        }
    }

    // ── Staged path ────────────────────────────────────────────────

    async fn staged_turn(
        &self,
        snapshot: &TurnSnapshot,
        tenant: &Arc<TenantContext>,
        deadline: Deadline,
    ) -> Result<StagedOutcome> {
        let stage_start = Instant::now();
        let (extraction, _heuristic) = self.extractor.extract(snapshot, tenant).await;
        let t_extract_ms = ms_since(stage_start);
        let low_confidence = extraction.confidence < tenant.config().confidence_threshold;

        // Working state: snapshot overlaid with this turn's extraction.
        let mut working = snapshot.state.clone();
        working
            .slots
            .extend(extraction.slots.iter().map(|(k, v)| (k.clone(), v.clone())));
        working.intent = extraction.intent;

        let stage_start = Instant::now();
        let (plan, _fallback) = self.planner.plan(snapshot, &extraction, tenant).await;
        let t_plan_ms = ms_since(stage_start);

        let stage_start = Instant::now();
        let outcome = self.policy.apply(snapshot, plan, tenant);
        let t_policy_ms = ms_since(stage_start);
        let plan = outcome.plan;

        let critical: BTreeSet<String> = tenant
            .config()
            .tools
            .iter()
            .filter(|(_, policy)| policy.critical)
            .map(|(name, _)| name.clone())
            .collect();

        let mut observations: Vec<Observation> = Vec::new();
        let mut tool_calls: Vec<ToolCallSummary> = Vec::new();
        let mut t_broker_ms = 0;
        let mut t_reduce_ms = 0;

        if !outcome.denials.is_empty() {
            let denial_obs: Vec<Observation> = outcome
                .denials
                .iter()
                .map(|d| d.observation.clone())
                .collect();
            let stage_start = Instant::now();
            working = self.reducer.reduce(&working, &denial_obs, &critical);
            t_reduce_ms += ms_since(stage_start);
            for denial in &outcome.denials {
                tool_calls.push(ToolCallSummary {
                    tool_name: denial.action.tool_name.clone(),
                    result_kind: denial.observation.kind.as_str().to_owned(),
                    args_summary: summarize_args(&denial.action.args, self.env.redact_logs),
                    latency_ms: 0,
                });
            }
            observations.extend(denial_obs);
        }

        // Load shedding: with the broker-wide cap exhausted and the
        // tenant opted in, skip dispatch and answer as unavailable.
        let shed = tenant.config().features.shed_to_human
            && !plan.actions.is_empty()
            && self.broker.at_capacity();

        // Sequential dispatch in plan order; each observation reduces
        // into the working state before the next call runs.
        for action in &plan.actions {
            if shed {
                let obs = Observation::timeout(&action.tool_name, 0, 0);
                tool_calls.push(ToolCallSummary {
                    tool_name: action.tool_name.clone(),
                    result_kind: obs.kind.as_str().to_owned(),
                    args_summary: summarize_args(&action.args, self.env.redact_logs),
                    latency_ms: 0,
                });
                working = self.reducer.reduce(&working, std::slice::from_ref(&obs), &critical);
                observations.push(obs);
                continue;
            }
            let policy = tenant
                .tool(&action.tool_name)
                .ok_or_else(|| Error::Internal(format!("policy vanished for '{}'", action.tool_name)))?;
            let request_id =
                fingerprint(&snapshot.workspace_id, &action.tool_name, &action.args);
            let call = ToolCall {
                tool_name: action.tool_name.clone(),
                args: action.args.clone(),
                request_id: request_id.clone(),
                retry_safe: policy.retry.retry_safe,
                timeout_ms: policy.timeout_ms,
                max_retries: policy.retry.max_retries,
                idempotency_key: Some(request_id),
            };

            let stage_start = Instant::now();
            let obs = self
                .broker
                .dispatch(&snapshot.workspace_id, &call, policy, deadline)
                .await;
            t_broker_ms += ms_since(stage_start);

            if obs.kind == ResultKind::Success {
                if let Some(key) = &call.idempotency_key {
                    let _ = self
                        .store
                        .record_action_execution(&snapshot.workspace_id, key, &obs.payload)
                        .await;
                }
            }

            tool_calls.push(ToolCallSummary {
                tool_name: call.tool_name.clone(),
                result_kind: obs.kind.as_str().to_owned(),
                args_summary: summarize_args(&call.args, self.env.redact_logs),
                latency_ms: obs.latency_ms,
            });

            let stage_start = Instant::now();
            working = self.reducer.reduce(&working, std::slice::from_ref(&obs), &critical);
            t_reduce_ms += ms_since(stage_start);
            observations.push(obs);
        }

        let stage_start = Instant::now();
        let reply = self
            .responder
            .respond(
                snapshot,
                extraction.intent,
                &plan,
                &observations,
                &working,
                low_confidence,
                tenant,
            )
            .await;
        let t_nlg_ms = ms_since(stage_start);

        Ok(StagedOutcome {
            reply,
            observations,
            tool_calls,
            working_state: working,
            intent: extraction.intent.as_str().to_owned(),
            confidence: extraction.confidence,
            t_extract_ms,
            t_plan_ms,
            t_policy_ms,
            t_broker_ms,
            t_reduce_ms,
            t_nlg_ms,
        })
    }

    async fn commit_and_respond(
        &self,
        snapshot: &TurnSnapshot,
        tenant: &Arc<TenantContext>,
        outcome: StagedOutcome,
        route: Route,
        total_start: Instant,
    ) -> TurnResponse {
        let mut patch = diff_states(
            &snapshot.state,
            &outcome.working_state,
            tenant.exported_ephemeral(),
        );

        // Catalog-backed caches go stale when bookings change.
        for obs in &outcome.observations {
            let booking_changed = obs.is_success()
                && matches!(
                    obs.tool_name.as_str(),
                    tools::BOOK_APPOINTMENT | tools::CANCEL_APPOINTMENT
                );
            if booking_changed {
                patch
                    .cache_invalidation_keys
                    .push(format!("availability:{}", snapshot.workspace_id));
            }
        }
        patch.cache_invalidation_keys.dedup();

        if !patch.is_empty() {
            let entry = HistoryEntry {
                event: "turn".to_owned(),
                prior_state: snapshot.state.clone(),
                next_state: outcome.working_state.clone(),
                at: Utc::now(),
            };
            if let Err(error) = self
                .store
                .commit_turn(
                    &snapshot.workspace_id,
                    &snapshot.conversation_id,
                    &patch,
                    entry,
                )
                .await
            {
                tracing::error!(error = %error, "state commit failed; reply still served");
            }
        }

        for obs in &outcome.observations {
            if obs.tool_name == tools::BOOK_APPOINTMENT && obs.kind == ResultKind::Success {
                let _ = self
                    .store
                    .push_outbox(OutboxEvent {
                        workspace_id: snapshot.workspace_id.clone(),
                        conversation_id: snapshot.conversation_id.clone(),
                        kind: "booking_confirmed".to_owned(),
                        payload: obs.payload.clone(),
                        at: Utc::now(),
                    })
                    .await;
            }
        }

        let telemetry = TurnTelemetry {
            route: route.as_str().to_owned(),
            intent: outcome.intent,
            confidence: outcome.confidence,
            t_extract_ms: outcome.t_extract_ms,
            t_plan_ms: outcome.t_plan_ms,
            t_policy_ms: outcome.t_policy_ms,
            t_broker_ms: outcome.t_broker_ms,
            t_reduce_ms: outcome.t_reduce_ms,
            t_nlg_ms: outcome.t_nlg_ms,
            total_ms: ms_since(total_start),
            fallback: false,
            degraded: false,
        };
        self.emit_turn_completed(&snapshot.workspace_id, &telemetry);

        TurnResponse {
            assistant: AssistantMessage {
                text: outcome.reply.text,
                suggested_replies: outcome.reply.quick_replies,
            },
            tool_calls: outcome.tool_calls,
            patch,
            telemetry,
        }
    }

    // ── Legacy / degraded paths ────────────────────────────────────

    async fn legacy_turn(
        &self,
        snapshot: &TurnSnapshot,
        tenant: &Arc<TenantContext>,
        route: Route,
        fallback: bool,
        total_start: Instant,
    ) -> TurnResponse {
        let reply = self.legacy.respond(snapshot, tenant).await;

        let telemetry = TurnTelemetry {
            // After a fallback the turn was actually served by legacy.
            route: if fallback {
                Route::Legacy.as_str().to_owned()
            } else {
                route.as_str().to_owned()
            },
            intent: snapshot.state.intent.as_str().to_owned(),
            confidence: 0.0,
            total_ms: ms_since(total_start),
            fallback,
            ..TurnTelemetry::default()
        };
        self.emit_turn_completed(&snapshot.workspace_id, &telemetry);

        TurnResponse {
            assistant: AssistantMessage {
                text: reply.text,
                suggested_replies: reply.quick_replies,
            },
            tool_calls: Vec::new(),
            patch: Default::default(),
            telemetry,
        }
    }

    fn degraded_response(
        &self,
        snapshot: &TurnSnapshot,
        tenant: &Arc<TenantContext>,
        route: Route,
        total_start: Instant,
    ) -> TurnResponse {
        let text = if tenant.config().language == "en" {
            DEGRADED_REPLY_EN
        } else {
            DEGRADED_REPLY_ES
        };

        let telemetry = TurnTelemetry {
            route: route.as_str().to_owned(),
            intent: snapshot.state.intent.as_str().to_owned(),
            confidence: 0.0,
            total_ms: ms_since(total_start),
            fallback: false,
            degraded: true,
            ..TurnTelemetry::default()
        };
        self.emit_turn_completed(&snapshot.workspace_id, &telemetry);

        TurnResponse {
            assistant: AssistantMessage {
                text: text.to_owned(),
                suggested_replies: vec!["Sí, contáctenme".to_owned()],
            },
            tool_calls: Vec::new(),
            patch: Default::default(),
            telemetry,
        }
    }

    fn safe_error_response(
        &self,
        request: &TurnRequest,
        error: &Error,
        route: Route,
        total_start: Instant,
    ) -> TurnResponse {
        let degraded = matches!(error, Error::DeadlineExceeded);
        let telemetry = TurnTelemetry {
            route: route.as_str().to_owned(),
            intent: "other".to_owned(),
            confidence: 0.0,
            total_ms: ms_since(total_start),
            fallback: false,
            degraded,
            ..TurnTelemetry::default()
        };
        self.emit_turn_completed(&request.workspace_id, &telemetry);

        TurnResponse {
            assistant: AssistantMessage {
                text: DEGRADED_REPLY_ES.to_owned(),
                suggested_replies: Vec::new(),
            },
            tool_calls: Vec::new(),
            patch: Default::default(),
            telemetry,
        }
    }

    fn emit_turn_completed(&self, workspace_id: &str, telemetry: &TurnTelemetry) {
        TraceEvent::TurnCompleted {
            workspace: workspace_id.to_owned(),
            route: telemetry.route.clone(),
            intent: telemetry.intent.clone(),
            confidence: telemetry.confidence,
            t_extract_ms: telemetry.t_extract_ms,
            t_plan_ms: telemetry.t_plan_ms,
            t_policy_ms: telemetry.t_policy_ms,
            t_broker_ms: telemetry.t_broker_ms,
            t_reduce_ms: telemetry.t_reduce_ms,
            t_nlg_ms: telemetry.t_nlg_ms,
            total_ms: telemetry.total_ms,
            fallback: telemetry.fallback,
            degraded: telemetry.degraded,
        }
        .emit();
    }
}

fn ms_since(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
