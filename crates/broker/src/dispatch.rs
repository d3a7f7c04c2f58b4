//! The broker dispatch loop.
//!
//! Order of gates for every call: idempotency cache → circuit breaker →
//! concurrency permits → body guardrail → attempt loop (timeout, retry
//! classification, backoff). Exactly one observation comes out; no tool
//! error escapes as `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Instant};

use orq_domain::config::{EnvConfig, RetryPolicy, ToolPolicy, ToolTransportKind};
use orq_domain::redact::summarize_args;
use orq_domain::trace::TraceEvent;
use orq_domain::turn::{Observation, ToolCall};

use crate::breaker::{Admission, CircuitBreaker};
use crate::cache::IdempotencyCache;
use crate::deadline::Deadline;
use crate::transport::{
    HttpToolTransport, LocalToolTransport, ToolRequest, ToolTransport, TransportError,
};

/// Small additive jitter on top of the exponential term.
const EXTRA_JITTER_MS: u64 = 25;

pub struct ToolBroker {
    http: Arc<HttpToolTransport>,
    local: Arc<LocalToolTransport>,
    cache: IdempotencyCache,
    breaker: CircuitBreaker,
    /// Broker-wide in-flight cap.
    global: Arc<Semaphore>,
    /// Per-tool permits, created lazily with the tool's configured
    /// concurrency. A concurrency change requires a process restart.
    tool_semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    redact_logs: bool,
}

impl ToolBroker {
    pub fn new(env: &EnvConfig) -> Self {
        Self {
            http: Arc::new(HttpToolTransport::new()),
            local: Arc::new(LocalToolTransport::new()),
            cache: IdempotencyCache::new(Duration::from_millis(env.idempotency_ttl_ms)),
            breaker: CircuitBreaker::new(),
            global: Arc::new(Semaphore::new(env.broker_inflight_cap)),
            tool_semaphores: Mutex::new(HashMap::new()),
            redact_logs: env.redact_logs,
        }
    }

    /// Registry for in-process tools.
    pub fn local_tools(&self) -> &LocalToolTransport {
        &self.local
    }

    /// Whether the broker-wide in-flight cap is currently exhausted.
    /// Callers configured to shed load can skip dispatch entirely.
    pub fn at_capacity(&self) -> bool {
        self.global.available_permits() == 0
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &IdempotencyCache {
        &self.cache
    }

    /// Execute one validated tool call, producing exactly one
    /// observation.
    pub async fn dispatch(
        &self,
        workspace_id: &str,
        call: &ToolCall,
        policy: &ToolPolicy,
        deadline: Deadline,
    ) -> Observation {
        // ── Idempotency cache ────────────────────────────────────────
        if let Some((cached, age_ms)) = self.cache.get(workspace_id, &call.request_id) {
            TraceEvent::IdempotentReplay {
                workspace: workspace_id.to_owned(),
                tool: call.tool_name.clone(),
                age_ms,
            }
            .emit();
            return Observation::duplicate(&call.tool_name, cached.payload)
                .with_request_id(call.request_id.clone());
        }

        // ── Circuit breaker ──────────────────────────────────────────
        match self.breaker.check(workspace_id, &call.tool_name, &policy.breaker) {
            Admission::ShortCircuit => {
                return Observation::circuit_open(&call.tool_name)
                    .with_request_id(call.request_id.clone());
            }
            Admission::Admit | Admission::AdmitProbe => {}
        }

        // ── Request body guardrail ───────────────────────────────────
        let request_bytes = call.args.to_string().len();
        if request_bytes > policy.max_body_bytes {
            let obs = Observation::failure(
                &call.tool_name,
                json!({"error": format!(
                    "request body {request_bytes} bytes exceeds cap {}",
                    policy.max_body_bytes
                )}),
                Some(413),
                0,
                0,
            )
            .with_request_id(call.request_id.clone());
            self.attempt_event(workspace_id, call, obs.kind.as_str(), Some(413), 0, 0);
            return obs;
        }

        // ── Concurrency permits, bounded by the turn deadline ────────
        let wait_start = Instant::now();
        let _global_permit =
            match timeout(deadline.remaining(), self.global.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => return self.permit_timeout(workspace_id, call, wait_start),
            };
        let tool_sem = self.tool_semaphore(&call.tool_name, policy.concurrency);
        let _tool_permit = match timeout(deadline.remaining(), tool_sem.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => return self.permit_timeout(workspace_id, call, wait_start),
        };

        // ── Attempt loop ─────────────────────────────────────────────
        self.run_attempts(workspace_id, call, policy, deadline).await
    }

    async fn run_attempts(
        &self,
        workspace_id: &str,
        call: &ToolCall,
        policy: &ToolPolicy,
        deadline: Deadline,
    ) -> Observation {
        let transport: &dyn ToolTransport = match policy.transport {
            ToolTransportKind::Http => self.http.as_ref(),
            ToolTransportKind::Local => self.local.as_ref(),
        };
        let req = ToolRequest {
            workspace_id,
            tool_name: &call.tool_name,
            args: &call.args,
            retry_safe: call.retry_safe,
            policy,
        };

        let dispatch_start = Instant::now();
        let max_attempts = call.max_retries.saturating_add(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if deadline.expired() {
                let obs = Observation::timeout(&call.tool_name, elapsed_ms(dispatch_start), attempt - 1)
                    .with_request_id(call.request_id.clone());
                self.record_failure_outcome(workspace_id, call, policy);
                return obs;
            }

            let attempt_budget =
                Duration::from_millis(call.timeout_ms).min(deadline.remaining());
            let attempt_start = Instant::now();
            let outcome = timeout(attempt_budget, transport.invoke(&req)).await;
            let latency_ms = elapsed_ms(attempt_start);

            match outcome {
                Ok(Ok(payload)) => {
                    let response_bytes = payload.to_string().len();
                    if response_bytes > policy.max_body_bytes {
                        let obs = Observation::failure(
                            &call.tool_name,
                            json!({"error": format!(
                                "response body {response_bytes} bytes exceeds cap {}",
                                policy.max_body_bytes
                            )}),
                            Some(413),
                            elapsed_ms(dispatch_start),
                            attempt,
                        )
                        .with_request_id(call.request_id.clone());
                        self.attempt_event(
                            workspace_id,
                            call,
                            "FAILURE",
                            Some(413),
                            attempt,
                            latency_ms,
                        );
                        return obs;
                    }

                    self.attempt_event(workspace_id, call, "SUCCESS", None, attempt, latency_ms);
                    self.breaker.record_success(workspace_id, &call.tool_name);
                    let obs = Observation::success(
                        &call.tool_name,
                        payload,
                        elapsed_ms(dispatch_start),
                        attempt,
                    )
                    .with_request_id(call.request_id.clone());
                    self.cache.put(workspace_id, &call.request_id, obs.clone());
                    return obs;
                }

                Ok(Err(TransportError::Transient {
                    status,
                    retry_after,
                    message,
                })) => {
                    self.attempt_event(workspace_id, call, "FAILURE", status, attempt, latency_ms);
                    if self
                        .backoff_or_give_up(call, policy, attempt, max_attempts, retry_after, deadline)
                        .await
                    {
                        continue;
                    }
                    self.record_failure_outcome(workspace_id, call, policy);
                    return Observation::failure(
                        &call.tool_name,
                        json!({"error": message}),
                        status,
                        elapsed_ms(dispatch_start),
                        attempt,
                    )
                    .with_request_id(call.request_id.clone());
                }

                Ok(Err(TransportError::Permanent { status, message })) => {
                    self.attempt_event(workspace_id, call, "FAILURE", status, attempt, latency_ms);
                    return Observation::failure(
                        &call.tool_name,
                        json!({"error": message}),
                        status,
                        elapsed_ms(dispatch_start),
                        attempt,
                    )
                    .with_request_id(call.request_id.clone());
                }

                Err(_) => {
                    // Attempt hit its wall-clock budget.
                    self.attempt_event(workspace_id, call, "TIMEOUT", None, attempt, latency_ms);
                    if self
                        .backoff_or_give_up(call, policy, attempt, max_attempts, None, deadline)
                        .await
                    {
                        continue;
                    }
                    self.record_failure_outcome(workspace_id, call, policy);
                    return Observation::timeout(
                        &call.tool_name,
                        elapsed_ms(dispatch_start),
                        attempt,
                    )
                    .with_request_id(call.request_id.clone());
                }
            }
        }
    }

    /// Sleep the backoff delay and return `true` to retry, or `false`
    /// when retries are exhausted, unsafe, or the deadline cannot fit
    /// another attempt.
    async fn backoff_or_give_up(
        &self,
        call: &ToolCall,
        policy: &ToolPolicy,
        attempt: u32,
        max_attempts: u32,
        retry_after: Option<Duration>,
        deadline: Deadline,
    ) -> bool {
        if !call.retry_safe || attempt >= max_attempts {
            return false;
        }
        let delay = retry_after
            .unwrap_or_else(|| compute_backoff(&policy.retry, attempt, &mut rand::thread_rng()));
        if delay >= deadline.remaining() {
            return false;
        }
        tokio::time::sleep(delay).await;
        true
    }

    fn record_failure_outcome(&self, workspace_id: &str, call: &ToolCall, policy: &ToolPolicy) {
        self.breaker
            .record_failure(workspace_id, &call.tool_name, &policy.breaker);
    }

    fn permit_timeout(
        &self,
        workspace_id: &str,
        call: &ToolCall,
        wait_start: Instant,
    ) -> Observation {
        let waited = elapsed_ms(wait_start);
        self.attempt_event(workspace_id, call, "TIMEOUT", None, 0, waited);
        Observation::timeout(&call.tool_name, waited, 0).with_request_id(call.request_id.clone())
    }

    fn tool_semaphore(&self, tool_name: &str, permits: usize) -> Arc<Semaphore> {
        let mut semaphores = self.tool_semaphores.lock();
        semaphores
            .entry(tool_name.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1))))
            .clone()
    }

    fn attempt_event(
        &self,
        workspace_id: &str,
        call: &ToolCall,
        result_kind: &str,
        status_code: Option<u16>,
        attempt: u32,
        latency_ms: u64,
    ) {
        TraceEvent::ToolAttempt {
            workspace: workspace_id.to_owned(),
            tool: call.tool_name.clone(),
            result_kind: result_kind.to_owned(),
            status_code,
            attempt,
            latency_ms,
            args_summary: summarize_args(&call.args, self.redact_logs),
        }
        .emit();
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Full-jitter exponential backoff:
/// `uniform(0, base * factor^(attempt-1)) + uniform(0, 25ms)`, with the
/// exponential term capped at the configured ceiling.
pub fn compute_backoff(retry: &RetryPolicy, attempt: u32, rng: &mut impl Rng) -> Duration {
    let exp = (retry.base_backoff_ms as f64)
        * retry.backoff_factor.powi(attempt.saturating_sub(1) as i32);
    let ceiling = exp.min(retry.max_backoff_ms as f64).max(0.0);
    let uniform = rng.gen_range(0.0..=ceiling);
    let jitter = rng.gen_range(0..=EXTRA_JITTER_MS);
    Duration::from_millis(uniform as u64 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn retry() -> RetryPolicy {
        RetryPolicy {
            retry_safe: true,
            max_retries: 3,
            base_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 1000,
        }
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let policy = retry();
        for attempt in 1..=6 {
            for _ in 0..50 {
                let delay = compute_backoff(&policy, attempt, &mut rng);
                let exp_cap = (200.0f64 * 2.0f64.powi(attempt as i32 - 1)).min(1000.0);
                assert!(
                    delay <= Duration::from_millis(exp_cap as u64 + EXTRA_JITTER_MS),
                    "attempt {attempt}: {delay:?} above cap"
                );
            }
        }
    }

    #[test]
    fn backoff_grows_with_attempts_on_average() {
        let mut rng = StdRng::seed_from_u64(42);
        let policy = retry();
        let avg = |attempt: u32, rng: &mut StdRng| -> f64 {
            (0..200)
                .map(|_| compute_backoff(&policy, attempt, rng).as_millis() as f64)
                .sum::<f64>()
                / 200.0
        };
        let first = avg(1, &mut rng);
        let third = avg(3, &mut rng);
        assert!(third > first, "expected growth, got {first} vs {third}");
    }
}
