//! Read-mostly tenant configuration cache.
//!
//! The pipeline holds `Arc<TenantContext>` handles; refreshes go
//! through a single writer path and take effect on the next `get`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use orq_domain::config::{TenantConfig, ToolPolicy};
use orq_domain::state::IntentLabel;
use orq_domain::trace::TraceEvent;
use orq_domain::{Error, Result};

use crate::store::StateStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TenantContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-only per-workspace handle exposed to the pipeline.
#[derive(Debug)]
pub struct TenantContext {
    config: TenantConfig,
    exported_ephemeral: BTreeSet<String>,
}

impl TenantContext {
    pub fn new(config: TenantConfig) -> Self {
        let exported_ephemeral = config.exported_ephemeral.iter().cloned().collect();
        Self {
            config,
            exported_ephemeral,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.config.workspace_id
    }

    pub fn config(&self) -> &TenantConfig {
        &self.config
    }

    pub fn tool(&self, name: &str) -> Option<&ToolPolicy> {
        self.config.tool(name)
    }

    pub fn permits_tool(&self, name: &str) -> bool {
        self.config.permits_tool(name)
    }

    /// Slots the intent cannot proceed without.
    pub fn required_slots(&self, intent: IntentLabel) -> &[String] {
        self.config
            .required_slots
            .get(intent.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `_`-prefixed slots the tenant schema explicitly exports.
    pub fn exported_ephemeral(&self) -> &BTreeSet<String> {
        &self.exported_ephemeral
    }

    /// Reject any access keyed by a different workspace. Emits a
    /// security-class trace event on violation.
    pub fn ensure_workspace(&self, workspace_id: &str) -> Result<()> {
        if workspace_id == self.config.workspace_id {
            return Ok(());
        }
        TraceEvent::TenantViolation {
            expected: self.config.workspace_id.clone(),
            got: workspace_id.to_owned(),
        }
        .emit();
        Err(Error::TenantMismatch {
            expected: self.config.workspace_id.clone(),
            got: workspace_id.to_owned(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TenantDirectory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Caches tenant contexts by workspace id.
pub struct TenantDirectory {
    store: Arc<dyn StateStore>,
    cache: RwLock<HashMap<String, Arc<TenantContext>>>,
}

impl TenantDirectory {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached context for a workspace, loading it on first access.
    pub async fn get(&self, workspace_id: &str) -> Result<Arc<TenantContext>> {
        {
            let cache = self.cache.read();
            if let Some(ctx) = cache.get(workspace_id) {
                return Ok(ctx.clone());
            }
        }
        self.refresh(workspace_id).await
    }

    /// Reload one workspace's configuration from the store.
    pub async fn refresh(&self, workspace_id: &str) -> Result<Arc<TenantContext>> {
        let config = self.store.load_tenant_config(workspace_id).await?;
        if config.workspace_id != workspace_id {
            TraceEvent::TenantViolation {
                expected: workspace_id.to_owned(),
                got: config.workspace_id.clone(),
            }
            .emit();
            return Err(Error::TenantMismatch {
                expected: workspace_id.to_owned(),
                got: config.workspace_id,
            });
        }
        let ctx = Arc::new(TenantContext::new(config));
        self.cache
            .write()
            .insert(workspace_id.to_owned(), ctx.clone());
        Ok(ctx)
    }

    /// Reload every cached workspace. Workspaces that fail to load are
    /// dropped from the cache so the next `get` retries.
    pub async fn refresh_all(&self) -> usize {
        let workspace_ids: Vec<String> = self.cache.read().keys().cloned().collect();
        let mut refreshed = 0;
        for workspace_id in workspace_ids {
            match self.refresh(&workspace_id).await {
                Ok(_) => refreshed += 1,
                Err(e) => {
                    tracing::warn!(workspace = %workspace_id, error = %e, "tenant refresh failed, evicting");
                    self.cache.write().remove(&workspace_id);
                }
            }
        }
        TraceEvent::ConfigRefreshed {
            workspaces: refreshed,
        }
        .emit();
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use orq_domain::config::SlotKind;

    fn store_with(workspace_id: &str) -> Arc<MemoryStateStore> {
        let store = Arc::new(MemoryStateStore::new());
        let mut config = TenantConfig::bare(workspace_id);
        config
            .slot_schema
            .insert("service_type".into(), SlotKind::Text);
        config.exported_ephemeral.push("_available_times".into());
        store.upsert_tenant(config);
        store
    }

    #[tokio::test]
    async fn get_caches_and_refresh_replaces() {
        let store = store_with("ws1");
        let directory = TenantDirectory::new(store.clone());

        let ctx = directory.get("ws1").await.unwrap();
        assert_eq!(ctx.workspace_id(), "ws1");

        // Mutate the stored config; the cache still serves the old one.
        let mut updated = TenantConfig::bare("ws1");
        updated.max_days_ahead = 7;
        store.upsert_tenant(updated);
        let cached = directory.get("ws1").await.unwrap();
        assert_eq!(cached.config().max_days_ahead, 90);

        // The refresh path picks up the write.
        let fresh = directory.refresh("ws1").await.unwrap();
        assert_eq!(fresh.config().max_days_ahead, 7);
    }

    #[tokio::test]
    async fn unknown_workspace_is_an_error() {
        let directory = TenantDirectory::new(Arc::new(MemoryStateStore::new()));
        let err = directory.get("ghost").await.unwrap_err();
        assert!(matches!(err, Error::WorkspaceNotFound(_)));
    }

    #[tokio::test]
    async fn cross_workspace_access_is_rejected() {
        let store = store_with("ws1");
        let directory = TenantDirectory::new(store);
        let ctx = directory.get("ws1").await.unwrap();

        assert!(ctx.ensure_workspace("ws1").is_ok());
        let err = ctx.ensure_workspace("ws2").unwrap_err();
        assert!(matches!(err, Error::TenantMismatch { .. }));
    }

    #[tokio::test]
    async fn exported_ephemeral_comes_from_config() {
        let store = store_with("ws1");
        let directory = TenantDirectory::new(store);
        let ctx = directory.get("ws1").await.unwrap();
        assert!(ctx.exported_ephemeral().contains("_available_times"));
    }

    #[tokio::test]
    async fn refresh_all_counts_live_workspaces() {
        let store = store_with("ws1");
        let directory = TenantDirectory::new(store);
        directory.get("ws1").await.unwrap();
        assert_eq!(directory.refresh_all().await, 1);
    }
}
