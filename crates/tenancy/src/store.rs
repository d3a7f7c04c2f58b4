//! The state-store boundary.
//!
//! The production collaborator is a relational store; the orchestrator
//! only depends on this trait. [`MemoryStateStore`] is the in-process
//! implementation used in tests and single-node embeddings.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use orq_domain::config::TenantConfig;
use orq_domain::state::{apply_patch, DialogueState, StatePatch};
use orq_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A conversation row: identity plus its current dialogue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub workspace_id: String,
    pub conversation_id: String,
    pub channel: String,
    pub state: DialogueState,
    pub updated_at: DateTime<Utc>,
}

/// One append-only state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    pub prior_state: DialogueState,
    pub next_state: DialogueState,
    pub at: DateTime<Utc>,
}

/// A side-effect event for downstream delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub workspace_id: String,
    pub conversation_id: String,
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence operations the orchestrator requires of its store.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Load a conversation, creating an empty one on first contact.
    async fn load_or_create_conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        channel: &str,
    ) -> Result<ConversationRecord>;

    /// Atomically apply a state patch and append the history entry.
    ///
    /// The patch is the tenant-visible diff; the conversation's bounded
    /// observation history is carried over from `entry.next_state` so
    /// later turns can see which calls already succeeded.
    async fn commit_turn(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        patch: &StatePatch,
        entry: HistoryEntry,
    ) -> Result<()>;

    /// Load the per-workspace configuration and catalogs.
    async fn load_tenant_config(&self, workspace_id: &str) -> Result<TenantConfig>;

    /// Record an action execution under `(workspace, idempotency_key)`.
    /// Returns `false` when the key was already recorded (at-least-once
    /// replay), `true` when this call inserted it.
    async fn record_action_execution(
        &self,
        workspace_id: &str,
        idempotency_key: &str,
        payload: &Value,
    ) -> Result<bool>;

    /// Queue a side-effect event for downstream delivery.
    async fn push_outbox(&self, event: OutboxEvent) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryStateStore {
    conversations: RwLock<HashMap<(String, String), ConversationRecord>>,
    history: RwLock<Vec<(String, String, HistoryEntry)>>,
    tenants: RwLock<HashMap<String, TenantConfig>>,
    executions: RwLock<HashSet<(String, String)>>,
    outbox: RwLock<Vec<OutboxEvent>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision or replace a workspace's configuration.
    pub fn upsert_tenant(&self, config: TenantConfig) {
        self.tenants
            .write()
            .insert(config.workspace_id.clone(), config);
    }

    /// History entries for one conversation, oldest first.
    pub fn history_for(&self, workspace_id: &str, conversation_id: &str) -> Vec<HistoryEntry> {
        self.history
            .read()
            .iter()
            .filter(|(ws, conv, _)| ws == workspace_id && conv == conversation_id)
            .map(|(_, _, entry)| entry.clone())
            .collect()
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.outbox.read().clone()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn load_or_create_conversation(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        channel: &str,
    ) -> Result<ConversationRecord> {
        let key = (workspace_id.to_owned(), conversation_id.to_owned());
        {
            let conversations = self.conversations.read();
            if let Some(record) = conversations.get(&key) {
                return Ok(record.clone());
            }
        }

        let record = ConversationRecord {
            workspace_id: workspace_id.to_owned(),
            conversation_id: conversation_id.to_owned(),
            channel: channel.to_owned(),
            state: DialogueState::default(),
            updated_at: Utc::now(),
        };
        self.conversations.write().insert(key, record.clone());
        Ok(record)
    }

    async fn commit_turn(
        &self,
        workspace_id: &str,
        conversation_id: &str,
        patch: &StatePatch,
        entry: HistoryEntry,
    ) -> Result<()> {
        let key = (workspace_id.to_owned(), conversation_id.to_owned());
        let mut conversations = self.conversations.write();
        let record = conversations
            .get_mut(&key)
            .ok_or_else(|| Error::ConversationNotFound(conversation_id.to_owned()))?;
        apply_patch(&mut record.state, patch);
        record.state.history = entry.next_state.history.clone();
        record.updated_at = entry.at;
        drop(conversations);

        self.history.write().push((
            workspace_id.to_owned(),
            conversation_id.to_owned(),
            entry,
        ));
        Ok(())
    }

    async fn load_tenant_config(&self, workspace_id: &str) -> Result<TenantConfig> {
        self.tenants
            .read()
            .get(workspace_id)
            .cloned()
            .ok_or_else(|| Error::WorkspaceNotFound(workspace_id.to_owned()))
    }

    async fn record_action_execution(
        &self,
        workspace_id: &str,
        idempotency_key: &str,
        _payload: &Value,
    ) -> Result<bool> {
        let inserted = self
            .executions
            .write()
            .insert((workspace_id.to_owned(), idempotency_key.to_owned()));
        Ok(inserted)
    }

    async fn push_outbox(&self, event: OutboxEvent) -> Result<()> {
        self.outbox.write().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    use orq_domain::state::diff_states;

    #[tokio::test]
    async fn conversation_created_on_first_load() {
        let store = MemoryStateStore::new();
        let record = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap();
        assert!(record.state.slots.is_empty());

        // Second load returns the same conversation.
        let again = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap();
        assert_eq!(again.conversation_id, record.conversation_id);
    }

    #[tokio::test]
    async fn commit_applies_patch_and_appends_history() {
        let store = MemoryStateStore::new();
        let before = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap()
            .state;

        let mut after = before.clone();
        after.set_slot("service_type", "Corte");
        let patch = diff_states(&before, &after, &BTreeSet::new());

        store
            .commit_turn(
                "ws1",
                "c1",
                &patch,
                HistoryEntry {
                    event: "turn".into(),
                    prior_state: before,
                    next_state: after,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let record = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap();
        assert_eq!(record.state.slot_text("service_type"), Some("Corte"));
        assert_eq!(store.history_for("ws1", "c1").len(), 1);
    }

    #[tokio::test]
    async fn commit_carries_observation_history() {
        use orq_domain::turn::Observation;

        let store = MemoryStateStore::new();
        let before = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap()
            .state;

        let mut after = before.clone();
        after.set_slot("booking_id", "b-1");
        after.push_observation(
            Observation::success("book_appointment", json!({"booking_id": "b-1"}), 20, 1)
                .with_request_id("fp-1"),
        );
        let patch = diff_states(&before, &after, &BTreeSet::new());

        store
            .commit_turn(
                "ws1",
                "c1",
                &patch,
                HistoryEntry {
                    event: "turn".into(),
                    prior_state: before,
                    next_state: after,
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let record = store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap();
        assert_eq!(record.state.history.len(), 1);
        assert_eq!(
            record.state.history[0].request_id.as_deref(),
            Some("fp-1")
        );
    }

    #[tokio::test]
    async fn conversations_are_workspace_scoped() {
        let store = MemoryStateStore::new();
        store
            .load_or_create_conversation("ws1", "c1", "whatsapp")
            .await
            .unwrap();

        // Same conversation id under another workspace is a distinct row.
        let other = store
            .load_or_create_conversation("ws2", "c1", "whatsapp")
            .await
            .unwrap();
        assert!(other.state.slots.is_empty());
        assert_eq!(other.workspace_id, "ws2");
    }

    #[tokio::test]
    async fn action_execution_unique_per_key() {
        let store = MemoryStateStore::new();
        assert!(store
            .record_action_execution("ws1", "idem-1", &json!({}))
            .await
            .unwrap());
        assert!(!store
            .record_action_execution("ws1", "idem-1", &json!({}))
            .await
            .unwrap());
        // Same key in another workspace is independent.
        assert!(store
            .record_action_execution("ws2", "idem-1", &json!({}))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_tenant_config_errors() {
        let store = MemoryStateStore::new();
        let err = store.load_tenant_config("ghost").await.unwrap_err();
        assert!(matches!(err, Error::WorkspaceNotFound(_)));
    }
}
