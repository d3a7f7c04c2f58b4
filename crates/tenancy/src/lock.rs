//! Per-conversation concurrency control.
//!
//! State transitions are serialized per conversation: the orchestrator
//! holds the conversation's lock from state load to patch commit, so
//! two turns for the same conversation can never interleave and lose
//! updates. Turns for different conversations run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Manages per-conversation run locks.
///
/// Each `(workspace, conversation)` pair maps to a `Semaphore(1)`.
/// Holding the permit grants exclusive access for one turn; it
/// auto-releases on drop.
pub struct ConversationLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for ConversationLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the turn lock for a conversation, waiting for any
    /// in-flight turn to finish first.
    pub async fn acquire(
        &self,
        workspace_id: &str,
        conversation_id: &str,
    ) -> Result<OwnedSemaphorePermit, ConversationClosed> {
        let key = format!("{workspace_id}:{conversation_id}");
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.acquire_owned().await.map_err(|_| ConversationClosed)
    }

    /// Number of tracked conversations (for monitoring).
    pub fn conversation_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop lock entries no one is currently holding.
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

/// The lock map was shut down while a caller waited.
#[derive(Debug)]
pub struct ConversationClosed;

impl std::fmt::Display for ConversationClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conversation lock closed")
    }
}

impl std::error::Error for ConversationClosed {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_turns_same_conversation() {
        let map = ConversationLockMap::new();
        let permit1 = map.acquire("ws1", "c1").await.unwrap();
        drop(permit1);
        let permit2 = map.acquire("ws1", "c1").await.unwrap();
        drop(permit2);
    }

    #[tokio::test]
    async fn different_conversations_lock_independently() {
        let map = Arc::new(ConversationLockMap::new());
        let p1 = map.acquire("ws1", "c1").await.unwrap();
        let p2 = map.acquire("ws1", "c2").await.unwrap();
        let p3 = map.acquire("ws2", "c1").await.unwrap();
        assert_eq!(map.conversation_count(), 3);
        drop(p1);
        drop(p2);
        drop(p3);
    }

    #[tokio::test]
    async fn second_turn_waits_for_first() {
        let map = Arc::new(ConversationLockMap::new());
        let map2 = map.clone();

        let p1 = map.acquire("ws1", "c1").await.unwrap();

        let waiter = tokio::spawn(async move {
            let _p2 = map2.acquire("ws1", "c1").await.unwrap();
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        assert_eq!(waiter.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = ConversationLockMap::new();
        let permit = map.acquire("ws1", "held").await.unwrap();
        let released = map.acquire("ws1", "released").await.unwrap();
        drop(released);

        map.prune_idle();
        assert_eq!(map.conversation_count(), 1);
        drop(permit);
    }
}
