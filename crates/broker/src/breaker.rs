//! Per-(workspace, tool) circuit breaker.
//!
//! Failure timestamps are kept in a sliding window; crossing the
//! threshold opens the circuit, a cooldown later one probe is admitted
//! in half-open state, and its outcome decides between closing (window
//! cleared) and re-opening (cooldown restarts).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use orq_domain::config::BreakerPolicy;
use orq_domain::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; call proceeds normally.
    Admit,
    /// Cooldown elapsed; this call is the half-open probe.
    AdmitProbe,
    /// Circuit open; short-circuit with `CIRCUIT_OPEN`.
    ShortCircuit,
}

#[derive(Debug)]
struct Entry {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    /// Set by the admin force-half-open operation; admits the next
    /// call as a probe regardless of cooldown.
    force_probe: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            force_probe: false,
        }
    }

    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(oldest) = self.failures.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-wide breaker table, keyed by `(workspace_id, tool_name)`.
/// Mutated only by the broker (plus the admin force-half-open hook).
pub struct CircuitBreaker {
    table: Mutex<HashMap<(String, String), Entry>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether a call for this key may proceed.
    pub fn check(&self, workspace_id: &str, tool_name: &str, policy: &BreakerPolicy) -> Admission {
        let mut table = self.table.lock();
        let entry = table
            .entry((workspace_id.to_owned(), tool_name.to_owned()))
            .or_insert_with(Entry::new);

        match entry.state {
            BreakerState::Closed => Admission::Admit,
            BreakerState::HalfOpen => {
                // A probe is already in flight; keep short-circuiting
                // until its outcome is recorded.
                Admission::ShortCircuit
            }
            BreakerState::Open => {
                let cooldown = Duration::from_secs(policy.cooldown_secs);
                let elapsed = entry
                    .opened_at
                    .map(|at| Instant::now().saturating_duration_since(at))
                    .unwrap_or_default();
                if elapsed >= cooldown || entry.force_probe {
                    entry.force_probe = false;
                    transition(entry, BreakerState::HalfOpen, workspace_id, tool_name);
                    Admission::AdmitProbe
                } else {
                    Admission::ShortCircuit
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit and clears the
    /// failure window.
    pub fn record_success(&self, workspace_id: &str, tool_name: &str) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&(workspace_id.to_owned(), tool_name.to_owned())) {
            if entry.state != BreakerState::Closed {
                transition(entry, BreakerState::Closed, workspace_id, tool_name);
            }
            entry.failures.clear();
            entry.opened_at = None;
        }
    }

    /// Record a failed call (one per final failed observation).
    pub fn record_failure(&self, workspace_id: &str, tool_name: &str, policy: &BreakerPolicy) {
        let now = Instant::now();
        let mut table = self.table.lock();
        let entry = table
            .entry((workspace_id.to_owned(), tool_name.to_owned()))
            .or_insert_with(Entry::new);

        match entry.state {
            BreakerState::HalfOpen => {
                // Probe failed: back to open, cooldown restarts.
                entry.opened_at = Some(now);
                transition(entry, BreakerState::Open, workspace_id, tool_name);
            }
            BreakerState::Closed => {
                entry.failures.push_back(now);
                entry.prune(Duration::from_secs(policy.window_secs), now);
                if entry.failures.len() as u32 >= policy.failure_threshold {
                    entry.opened_at = Some(now);
                    transition(entry, BreakerState::Open, workspace_id, tool_name);
                }
            }
            BreakerState::Open => {
                // Late failure while already open; nothing to do.
            }
        }
    }

    /// Admin operation: admit the next call as a probe immediately,
    /// without waiting out the cooldown. No-op on a closed circuit.
    pub fn force_half_open(&self, workspace_id: &str, tool_name: &str) {
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&(workspace_id.to_owned(), tool_name.to_owned())) {
            if entry.state == BreakerState::Open {
                entry.force_probe = true;
            }
        }
    }

    /// Current state for a key (for admin surfaces and tests).
    pub fn state(&self, workspace_id: &str, tool_name: &str) -> BreakerState {
        self.table
            .lock()
            .get(&(workspace_id.to_owned(), tool_name.to_owned()))
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }
}

fn transition(entry: &mut Entry, to: BreakerState, workspace_id: &str, tool_name: &str) {
    let from = entry.state;
    entry.state = to;
    TraceEvent::BreakerTransition {
        workspace: workspace_id.to_owned(),
        tool: tool_name.to_owned(),
        from: from.as_str().to_owned(),
        to: to.as_str().to_owned(),
    }
    .emit();
}
