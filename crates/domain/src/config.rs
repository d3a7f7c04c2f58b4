//! Configuration surface.
//!
//! [`EnvConfig`] covers environment-level flags read once at startup.
//! Everything else is per-tenant and lives in the state store; the
//! tenancy crate caches it as [`TenantConfig`] values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::SlotValue;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide flags, read from `ORQ_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    #[serde(default = "d_true")]
    pub staged_enabled: bool,
    /// Percentage of conversations routed to the staged pipeline.
    /// `0` with `staged_enabled` means 100% staged (documented on the
    /// canary router).
    #[serde(default)]
    pub canary_percent: u8,
    #[serde(default = "d_2000")]
    pub turn_deadline_ms: u64,
    /// Broker-wide cap on simultaneously in-flight tool calls.
    #[serde(default = "d_64")]
    pub broker_inflight_cap: usize,
    #[serde(default = "d_5000")]
    pub default_tool_timeout_ms: u64,
    #[serde(default = "d_2")]
    pub default_max_retries: u32,
    #[serde(default = "d_true")]
    pub redact_logs: bool,
    #[serde(default = "d_model_endpoint")]
    pub model_endpoint: String,
    #[serde(default)]
    pub model_api_key: Option<String>,
    /// TTL for the broker's idempotency cache.
    #[serde(default = "d_300_000")]
    pub idempotency_ttl_ms: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            staged_enabled: true,
            canary_percent: 0,
            turn_deadline_ms: 2000,
            broker_inflight_cap: 64,
            default_tool_timeout_ms: 5000,
            default_max_retries: 2,
            redact_logs: true,
            model_endpoint: d_model_endpoint(),
            model_api_key: None,
            idempotency_ttl_ms: 300_000,
        }
    }
}

impl EnvConfig {
    /// Read `ORQ_*` variables, falling back to defaults for anything
    /// unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_bool("ORQ_STAGED_ENABLED") {
            cfg.staged_enabled = v;
        }
        if let Some(v) = env_parse::<u8>("ORQ_CANARY_PERCENT") {
            cfg.canary_percent = v.min(100);
        }
        if let Some(v) = env_parse("ORQ_TURN_DEADLINE_MS") {
            cfg.turn_deadline_ms = v;
        }
        if let Some(v) = env_parse("ORQ_BROKER_INFLIGHT_CAP") {
            cfg.broker_inflight_cap = v;
        }
        if let Some(v) = env_parse("ORQ_DEFAULT_TOOL_TIMEOUT_MS") {
            cfg.default_tool_timeout_ms = v;
        }
        if let Some(v) = env_parse("ORQ_DEFAULT_MAX_RETRIES") {
            cfg.default_max_retries = v;
        }
        if let Some(v) = env_bool("ORQ_REDACT_LOGS") {
            cfg.redact_logs = v;
        }
        if let Ok(v) = std::env::var("ORQ_MODEL_ENDPOINT") {
            cfg.model_endpoint = v;
        }
        if let Ok(v) = std::env::var("ORQ_MODEL_API_KEY") {
            cfg.model_api_key = Some(v);
        }
        if let Some(v) = env_parse("ORQ_IDEMPOTENCY_TTL_MS") {
            cfg.idempotency_ttl_ms = v;
        }
        cfg
    }
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-tool policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "d_true")]
    pub retry_safe: bool,
    #[serde(default = "d_2")]
    pub max_retries: u32,
    #[serde(default = "d_200")]
    pub base_backoff_ms: u64,
    #[serde(default = "d_factor")]
    pub backoff_factor: f64,
    #[serde(default = "d_5000")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_safe: true,
            max_retries: 2,
            base_backoff_ms: 200,
            backoff_factor: 2.0,
            max_backoff_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerPolicy {
    /// Sliding window over which failures are counted.
    #[serde(default = "d_60")]
    pub window_secs: u64,
    #[serde(default = "d_5")]
    pub failure_threshold: u32,
    #[serde(default = "d_30")]
    pub cooldown_secs: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            window_secs: 60,
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default = "d_30_u32")]
    pub max_per_minute: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self { max_per_minute: 30 }
    }
}

/// How the broker reaches a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolTransportKind {
    Http,
    #[default]
    Local,
}

/// Credential injected into HTTP tool requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolCredential {
    Bearer { token: String },
    ApiKey { header: String, key: String },
}

/// Expected argument type, checked by the policy engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Text,
    Number,
    Flag,
    List,
    Object,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSpec {
    pub kind: ArgKind,
    #[serde(default)]
    pub required: bool,
}

/// Everything the broker and policy engine need to know about one tool.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    #[serde(default)]
    pub transport: ToolTransportKind,
    /// Endpoint URL for HTTP tools; ignored for local tools.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub credential: Option<ToolCredential>,
    #[serde(default = "d_5000")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub breaker: BreakerPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    /// Simultaneous in-flight calls allowed for this tool.
    #[serde(default = "d_4")]
    pub concurrency: usize,
    #[serde(default = "d_256_kib")]
    pub max_body_bytes: usize,
    /// Failures of critical tools surface as `_validation_errors`.
    #[serde(default)]
    pub critical: bool,
    /// Argument names the policy engine validates.
    #[serde(default)]
    pub args: BTreeMap<String, ArgSpec>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tenant config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Slot value type declared in a tenant's slot schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Text,
    Number,
    Flag,
    List,
    Object,
}

impl SlotKind {
    pub fn matches(&self, value: &SlotValue) -> bool {
        matches!(
            (self, value),
            (SlotKind::Text, SlotValue::Text(_))
                | (SlotKind::Number, SlotValue::Number(_))
                | (SlotKind::Flag, SlotValue::Flag(_))
                | (SlotKind::List, SlotValue::List(_))
                | (SlotKind::Object, SlotValue::Object(_))
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeatureFlags {
    /// Allow the response generator to call the model for rephrasing.
    #[serde(default)]
    pub rephrase_with_model: bool,
    /// Shed load to an ASK_HUMAN reply when the broker-wide cap is hit.
    #[serde(default)]
    pub shed_to_human: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "d_30")]
    pub duration_min: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoursEntry {
    /// Day of week, `mon`..`sun`.
    pub day: String,
    pub open: String,
    pub close: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MenuEntry {
    pub name: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub category: Option<String>,
}

/// Per-tenant business catalogs, read-only to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Catalogs {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub staff: Vec<String>,
    #[serde(default)]
    pub hours: Vec<HoursEntry>,
    #[serde(default)]
    pub menu: Vec<MenuEntry>,
}

/// The full per-workspace configuration the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub workspace_id: String,
    /// IANA timezone name, e.g. `America/Argentina/Buenos_Aires`.
    #[serde(default = "d_timezone")]
    pub timezone: String,
    #[serde(default = "d_language")]
    pub language: String,
    /// Tool whitelist: only names present here may be planned.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolPolicy>,
    #[serde(default)]
    pub slot_schema: BTreeMap<String, SlotKind>,
    /// Required slots per intent label (keys are intent `as_str` values).
    #[serde(default)]
    pub required_slots: BTreeMap<String, Vec<String>>,
    /// `_`-prefixed slots the tenant wants exported despite being derived.
    #[serde(default)]
    pub exported_ephemeral: Vec<String>,
    /// Booking dates must fall within this many days from now.
    #[serde(default = "d_90_u32")]
    pub max_days_ahead: u32,
    #[serde(default = "d_confidence")]
    pub confidence_threshold: f64,
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default)]
    pub catalogs: Catalogs,
}

impl TenantConfig {
    /// A minimal config for a workspace with nothing provisioned.
    pub fn bare(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            timezone: d_timezone(),
            language: d_language(),
            tools: BTreeMap::new(),
            slot_schema: BTreeMap::new(),
            required_slots: BTreeMap::new(),
            exported_ephemeral: Vec::new(),
            max_days_ahead: 90,
            confidence_threshold: 0.7,
            features: FeatureFlags::default(),
            catalogs: Catalogs::default(),
        }
    }

    pub fn tool(&self, name: &str) -> Option<&ToolPolicy> {
        self.tools.get(name)
    }

    pub fn permits_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }
}

// ── serde default helpers ──────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_2() -> u32 {
    2
}
fn d_4() -> usize {
    4
}
fn d_5() -> u32 {
    5
}
fn d_30() -> u64 {
    30
}
fn d_30_u32() -> u32 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_64() -> usize {
    64
}
fn d_90_u32() -> u32 {
    90
}
fn d_200() -> u64 {
    200
}
fn d_2000() -> u64 {
    2000
}
fn d_5000() -> u64 {
    5000
}
fn d_300_000() -> u64 {
    300_000
}
fn d_256_kib() -> usize {
    256 * 1024
}
fn d_factor() -> f64 {
    2.0
}
fn d_confidence() -> f64 {
    0.7
}
fn d_timezone() -> String {
    "America/Argentina/Buenos_Aires".into()
}
fn d_language() -> String {
    "es".into()
}
fn d_model_endpoint() -> String {
    "http://127.0.0.1:8089/v1/generate".into()
}
