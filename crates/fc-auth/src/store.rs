use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::Result;
use crate::identity::TokenCacheEntry;

/// Trait for persisting per-identity token bundles, keyed by the stable
/// hash from [`crate::identity::identity_key`].
///
/// Alongside the main bundle, a key may own sub-caches for intermediate
/// tokens (`user`, `device`, `title`, `msal`, `xbl`); `invalidate` clears
/// the bundle and all sub-caches together.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Last stored bundle, if present and parseable. Absence and parse
    /// failure both come back as `None`; neither is a hard error.
    async fn load(&self, identity_key: &str) -> Option<TokenCacheEntry>;

    /// Persist a bundle atomically.
    async fn save(&self, identity_key: &str, entry: &TokenCacheEntry) -> Result<()>;

    /// Remove every cache entry for this key, sub-caches included.
    /// Missing files are tolerated.
    async fn invalidate(&self, identity_key: &str) -> Result<()>;

    /// Cache an intermediate token under `kind`. Best effort.
    async fn save_sub(&self, identity_key: &str, kind: &str, value: &serde_json::Value);

    /// Load an intermediate token cached under `kind`.
    async fn load_sub(&self, identity_key: &str, kind: &str) -> Option<serde_json::Value>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryTokenStore {
    entries: Arc<RwLock<HashMap<String, TokenCacheEntry>>>,
    subs: Arc<RwLock<HashMap<(String, String), serde_json::Value>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self, identity_key: &str) -> Option<TokenCacheEntry> {
        self.entries.read().ok()?.get(identity_key).cloned()
    }

    async fn save(&self, identity_key: &str, entry: &TokenCacheEntry) -> Result<()> {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(identity_key.to_string(), entry.clone());
        }
        Ok(())
    }

    async fn invalidate(&self, identity_key: &str) -> Result<()> {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(identity_key);
        }
        if let Ok(mut subs) = self.subs.write() {
            subs.retain(|(key, _), _| key != identity_key);
        }
        Ok(())
    }

    async fn save_sub(&self, identity_key: &str, kind: &str, value: &serde_json::Value) {
        if let Ok(mut subs) = self.subs.write() {
            subs.insert(
                (identity_key.to_string(), kind.to_string()),
                value.clone(),
            );
        }
    }

    async fn load_sub(&self, identity_key: &str, kind: &str) -> Option<serde_json::Value> {
        self.subs
            .read()
            .ok()?
            .get(&(identity_key.to_string(), kind.to_string()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AuthTitle;

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryTokenStore::new();
        let entry = TokenCacheEntry::new("a@x.test", AuthTitle::default());

        store.save("key1", &entry).await.unwrap();
        assert_eq!(store.load("key1").await, Some(entry));

        store.invalidate("key1").await.unwrap();
        assert!(store.load("key1").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_clears_sub_caches_too() {
        let store = MemoryTokenStore::new();
        let entry = TokenCacheEntry::new("a@x.test", AuthTitle::default());
        store.save("key1", &entry).await.unwrap();
        store
            .save_sub("key1", "user", &serde_json::json!({"Token": "u"}))
            .await;

        store.invalidate("key1").await.unwrap();
        assert!(store.load_sub("key1", "user").await.is_none());
    }

    #[tokio::test]
    async fn invalidating_missing_key_is_fine() {
        let store = MemoryTokenStore::new();
        store.invalidate("nothing-here").await.unwrap();
    }
}
