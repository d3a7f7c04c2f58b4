//! Dialogue state — the only mutable per-conversation object.
//!
//! The state is a typed slot map plus fixed scalar control fields. It is
//! mutated exclusively by the state reducer (which returns a new value
//! rather than mutating in place); the orchestrator commits the diff.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::turn::Observation;

/// Maximum number of tool observations retained in state history.
pub const HISTORY_CAP: usize = 8;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slot values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A typed slot value. The wire form is untagged JSON, so `true`,
/// `3.5`, `"Corte"`, arrays and objects all round-trip naturally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotValue {
    Flag(bool),
    Number(f64),
    Text(String),
    List(Vec<SlotValue>),
    Object(BTreeMap<String, SlotValue>),
}

impl SlotValue {
    /// Convert a JSON value into a slot value. `null` has no slot
    /// representation and returns `None`.
    pub fn from_json(value: &Value) -> Option<SlotValue> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(SlotValue::Flag(*b)),
            Value::Number(n) => n.as_f64().map(SlotValue::Number),
            Value::String(s) => Some(SlotValue::Text(s.clone())),
            Value::Array(items) => Some(SlotValue::List(
                items.iter().filter_map(SlotValue::from_json).collect(),
            )),
            Value::Object(map) => Some(SlotValue::Object(
                map.iter()
                    .filter_map(|(k, v)| SlotValue::from_json(v).map(|sv| (k.clone(), sv)))
                    .collect(),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SlotValue::Flag(b) => Value::Bool(*b),
            SlotValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            SlotValue::Text(s) => Value::String(s.clone()),
            SlotValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            SlotValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SlotValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            SlotValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SlotValue::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for SlotValue {
    fn from(s: &str) -> Self {
        SlotValue::Text(s.to_owned())
    }
}

impl From<String> for SlotValue {
    fn from(s: String) -> Self {
        SlotValue::Text(s)
    }
}

impl From<f64> for SlotValue {
    fn from(n: f64) -> Self {
        SlotValue::Number(n)
    }
}

impl From<bool> for SlotValue {
    fn from(b: bool) -> Self {
        SlotValue::Flag(b)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Control enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What the orchestrator should do next for this conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NextAction {
    #[default]
    Greet,
    SlotFill,
    RetrieveContext,
    ExecuteAction,
    Answer,
    AskHuman,
}

/// Closed intent vocabulary shared by the extractor, planner and
/// response templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IntentLabel {
    Greeting,
    Book,
    Reschedule,
    Cancel,
    Query,
    Prices,
    Hours,
    Location,
    Complaint,
    Human,
    #[default]
    Other,
}

impl IntentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentLabel::Greeting => "greeting",
            IntentLabel::Book => "book",
            IntentLabel::Reschedule => "reschedule",
            IntentLabel::Cancel => "cancel",
            IntentLabel::Query => "query",
            IntentLabel::Prices => "prices",
            IntentLabel::Hours => "hours",
            IntentLabel::Location => "location",
            IntentLabel::Complaint => "complaint",
            IntentLabel::Human => "human",
            IntentLabel::Other => "other",
        }
    }

    /// Parse a label emitted by a model. Unknown labels collapse to
    /// [`IntentLabel::Other`] so the pipeline always has a valid intent.
    pub fn parse_label(s: &str) -> IntentLabel {
        match s.trim().to_ascii_lowercase().as_str() {
            "greeting" | "greet" | "saludo" => IntentLabel::Greeting,
            "book" | "booking" | "reserva" | "turno" => IntentLabel::Book,
            "reschedule" => IntentLabel::Reschedule,
            "cancel" | "cancelacion" => IntentLabel::Cancel,
            "query" | "question" | "consulta" => IntentLabel::Query,
            "prices" | "price" | "precios" => IntentLabel::Prices,
            "hours" | "horarios" => IntentLabel::Hours,
            "location" | "ubicacion" => IntentLabel::Location,
            "complaint" | "reclamo" => IntentLabel::Complaint,
            "human" | "agent" | "humano" => IntentLabel::Human,
            _ => IntentLabel::Other,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DialogueState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-conversation dialogue state.
///
/// Slot names prefixed with `_` are derived/ephemeral: they are kept for
/// the duration of a conversation but excluded from tenant-visible
/// exports unless the tenant's slot schema lists them explicitly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DialogueState {
    #[serde(default)]
    pub slots: BTreeMap<String, SlotValue>,
    #[serde(default)]
    pub intent: IntentLabel,
    #[serde(default)]
    pub next_action: NextAction,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default)]
    pub history: VecDeque<Observation>,
}

impl DialogueState {
    pub fn slot(&self, name: &str) -> Option<&SlotValue> {
        self.slots.get(name)
    }

    pub fn slot_text(&self, name: &str) -> Option<&str> {
        self.slots.get(name).and_then(|v| v.as_text())
    }

    pub fn set_slot(&mut self, name: impl Into<String>, value: impl Into<SlotValue>) {
        self.slots.insert(name.into(), value.into());
    }

    pub fn remove_slot(&mut self, name: &str) -> Option<SlotValue> {
        self.slots.remove(name)
    }

    pub fn has_slot(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    /// Slots visible to the tenant: everything not `_`-prefixed.
    pub fn visible_slots(&self) -> BTreeMap<String, SlotValue> {
        self.slots
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Append an observation, evicting the oldest entry past the cap.
    pub fn push_observation(&mut self, obs: Observation) {
        self.history.push_back(obs);
        while self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StatePatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The diff between the snapshot's state and the post-turn working state.
///
/// This is what the caller receives and what the state store commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatePatch {
    #[serde(default)]
    pub slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub slots_to_remove: Vec<String>,
    #[serde(default)]
    pub cache_invalidation_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<NextAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
}

impl StatePatch {
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
            && self.slots_to_remove.is_empty()
            && self.cache_invalidation_keys.is_empty()
            && self.intent.is_none()
            && self.next_action.is_none()
            && self.attempts.is_none()
            && self.objective.is_none()
    }
}

/// Compute the patch that turns `before` into `after`.
///
/// `_`-prefixed slots are excluded from the exported slot map unless
/// named in `exported_ephemeral`; removals are reported for any slot
/// that was exportable in `before` and is gone in `after`.
pub fn diff_states(
    before: &DialogueState,
    after: &DialogueState,
    exported_ephemeral: &BTreeSet<String>,
) -> StatePatch {
    let exportable = |name: &str| !name.starts_with('_') || exported_ephemeral.contains(name);

    let mut patch = StatePatch::default();

    for (name, value) in &after.slots {
        if !exportable(name) {
            continue;
        }
        if before.slots.get(name) != Some(value) {
            patch.slots.insert(name.clone(), value.to_json());
        }
    }

    for name in before.slots.keys() {
        if exportable(name) && !after.slots.contains_key(name) {
            patch.slots_to_remove.push(name.clone());
        }
    }

    if before.intent != after.intent {
        patch.intent = Some(after.intent);
    }
    if before.next_action != after.next_action {
        patch.next_action = Some(after.next_action);
    }
    if before.attempts != after.attempts {
        patch.attempts = Some(after.attempts);
    }
    if before.objective != after.objective {
        patch.objective = after.objective.clone();
    }

    patch
}

/// Apply a patch in place. Used by state stores when committing a turn.
pub fn apply_patch(state: &mut DialogueState, patch: &StatePatch) {
    for (name, value) in &patch.slots {
        if let Some(sv) = SlotValue::from_json(value) {
            state.slots.insert(name.clone(), sv);
        }
    }
    for name in &patch.slots_to_remove {
        state.slots.remove(name);
    }
    if let Some(intent) = patch.intent {
        state.intent = intent;
    }
    if let Some(next_action) = patch.next_action {
        state.next_action = next_action;
    }
    if let Some(attempts) = patch.attempts {
        state.attempts = attempts;
    }
    if patch.objective.is_some() {
        state.objective = patch.objective.clone();
    }
}
