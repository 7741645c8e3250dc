// ABOUTME: Channel-to-agent binding registry with atomic JSON file persistence
// ABOUTME: Enforces (channel_type, channel_id) uniqueness and hides disabled bindings from lookup

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Declaration that messages arriving on a channel instance route to the bot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Binding {
    pub id: String,
    pub channel_type: String,
    pub channel_id: String,
    pub org_id: String,
    /// Optional pinned agent ID (legacy multi-agent shim; the single live
    /// agent is authoritative regardless)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub enabled: bool,
    /// Free-form adapter settings
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Binding {
    pub fn new(
        channel_type: impl Into<String>,
        channel_id: impl Into<String>,
        org_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_type: channel_type.into(),
            channel_id: channel_id.into(),
            org_id: org_id.into(),
            agent_id: None,
            enabled: true,
            settings: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Binding>,
    /// (channel_type, channel_id) -> binding id
    by_channel: HashMap<(String, String), String>,
}

/// Authoritative registry of channel bindings. All reads go through the
/// in-memory maps; mutations trigger a fire-and-forget background save.
pub struct BindingStore {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
}

impl BindingStore {
    /// In-memory store without persistence.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: None,
        }
    }

    /// Store persisted to `<dir>/bindings.json`.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: Some(dir.as_ref().join("bindings.json")),
        }
    }

    /// Load bindings from the configured file. A missing file is non-fatal.
    pub fn load(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("Failed to read bindings file"),
        };
        let bindings: Vec<Binding> =
            serde_json::from_str(&content).context("Failed to parse bindings file")?;

        let mut inner = self.inner.write().expect("bindings lock poisoned");
        inner.by_id.clear();
        inner.by_channel.clear();
        for b in bindings {
            inner.by_channel.insert(
                (b.channel_type.clone(), b.channel_id.clone()),
                b.id.clone(),
            );
            inner.by_id.insert(b.id.clone(), b);
        }
        Ok(())
    }

    /// Add a binding. Rejects a second binding for the same
    /// (channel_type, channel_id) pair.
    pub fn add(&self, binding: Binding) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("bindings lock poisoned");
            let key = (binding.channel_type.clone(), binding.channel_id.clone());
            if inner.by_channel.contains_key(&key) {
                bail!(
                    "binding already exists for {}:{}",
                    binding.channel_type,
                    binding.channel_id
                );
            }
            inner.by_channel.insert(key, binding.id.clone());
            inner.by_id.insert(binding.id.clone(), binding);
        }
        self.save_async();
        Ok(())
    }

    /// Remove a binding by ID.
    pub fn remove(&self, id: &str) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("bindings lock poisoned");
            let Some(binding) = inner.by_id.remove(id) else {
                bail!("binding not found: {}", id);
            };
            inner
                .by_channel
                .remove(&(binding.channel_type, binding.channel_id));
        }
        self.save_async();
        Ok(())
    }

    /// Update a binding. Preserves created_at, refreshes updated_at, and
    /// re-keys the channel index if the channel moved.
    pub fn update(&self, mut binding: Binding) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("bindings lock poisoned");
            let Some(existing) = inner.by_id.get(&binding.id).cloned() else {
                bail!("binding not found: {}", binding.id);
            };
            let new_key = (binding.channel_type.clone(), binding.channel_id.clone());
            let old_key = (existing.channel_type.clone(), existing.channel_id.clone());
            if new_key != old_key {
                if let Some(other) = inner.by_channel.get(&new_key) {
                    if other != &binding.id {
                        bail!(
                            "binding already exists for {}:{}",
                            binding.channel_type,
                            binding.channel_id
                        );
                    }
                }
                inner.by_channel.remove(&old_key);
                inner.by_channel.insert(new_key, binding.id.clone());
            }
            binding.created_at = existing.created_at;
            binding.updated_at = Utc::now();
            inner.by_id.insert(binding.id.clone(), binding);
        }
        self.save_async();
        Ok(())
    }

    /// Get a binding by ID, enabled or not.
    pub fn get(&self, id: &str) -> Option<Binding> {
        let inner = self.inner.read().expect("bindings lock poisoned");
        inner.by_id.get(id).cloned()
    }

    /// Get the binding for a channel. Returns only enabled bindings.
    pub fn get_by_channel(&self, channel_type: &str, channel_id: &str) -> Option<Binding> {
        let inner = self.inner.read().expect("bindings lock poisoned");
        let id = inner
            .by_channel
            .get(&(channel_type.to_string(), channel_id.to_string()))?;
        inner.by_id.get(id).filter(|b| b.enabled).cloned()
    }

    pub fn list_by_org(&self, org_id: &str) -> Vec<Binding> {
        let inner = self.inner.read().expect("bindings lock poisoned");
        inner
            .by_id
            .values()
            .filter(|b| b.org_id == org_id)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<Binding> {
        let inner = self.inner.read().expect("bindings lock poisoned");
        inner.by_id.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        let inner = self.inner.read().expect("bindings lock poisoned");
        inner.by_id.len()
    }

    /// Snapshot the store and write it in the background: serialize to a temp
    /// file, then atomically rename over the target. Last writer wins.
    fn save_async(&self) {
        let Some(ref path) = self.path else {
            return;
        };
        let path = path.clone();
        let snapshot = self.list_all();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_bindings_file(&path, &snapshot) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to persist bindings");
            }
        });
    }
}

impl Default for BindingStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_bindings_file(path: &Path, bindings: &[Binding]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create bindings directory")?;
    }
    let json = serde_json::to_string_pretty(bindings).context("Failed to serialize bindings")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).context("Failed to write temp bindings file")?;
    std::fs::rename(&tmp, path).context("Failed to rename bindings file into place")?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let store = BindingStore::new();
        let binding = Binding::new("telegram", "12345", "org-a");
        let id = binding.id.clone();
        store.add(binding).unwrap();

        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.channel_type, "telegram");
        assert_eq!(fetched.channel_id, "12345");
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let store = BindingStore::new();
        store.add(Binding::new("telegram", "12345", "org-a")).unwrap();
        let err = store
            .add(Binding::new("telegram", "12345", "org-b"))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_same_channel_id_different_type_allowed() {
        let store = BindingStore::new();
        store.add(Binding::new("telegram", "12345", "org-a")).unwrap();
        store.add(Binding::new("discord", "12345", "org-a")).unwrap();
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_disabled_hidden_from_channel_lookup() {
        let store = BindingStore::new();
        let mut binding = Binding::new("slack", "C99", "org-a");
        binding.enabled = false;
        let id = binding.id.clone();
        store.add(binding).unwrap();

        assert!(store.get(&id).is_some());
        assert!(store.get_by_channel("slack", "C99").is_none());
    }

    #[test]
    fn test_get_by_channel_enabled() {
        let store = BindingStore::new();
        store.add(Binding::new("discord", "555", "org-a")).unwrap();
        let found = store.get_by_channel("discord", "555").unwrap();
        assert_eq!(found.org_id, "org-a");
        assert!(store.get_by_channel("discord", "556").is_none());
    }

    #[test]
    fn test_remove() {
        let store = BindingStore::new();
        let binding = Binding::new("telegram", "1", "org-a");
        let id = binding.id.clone();
        store.add(binding).unwrap();
        store.remove(&id).unwrap();

        assert_eq!(store.count(), 0);
        assert!(store.get_by_channel("telegram", "1").is_none());
        // Channel key is freed for reuse
        store.add(Binding::new("telegram", "1", "org-b")).unwrap();
    }

    #[test]
    fn test_remove_missing() {
        let store = BindingStore::new();
        assert!(store.remove("nope").is_err());
    }

    #[test]
    fn test_update_preserves_created_at_and_rekeys() {
        let store = BindingStore::new();
        let binding = Binding::new("telegram", "1", "org-a");
        let id = binding.id.clone();
        let created = binding.created_at;
        store.add(binding).unwrap();

        let mut updated = store.get(&id).unwrap();
        updated.channel_id = "2".to_string();
        updated.created_at = Utc::now(); // must be ignored
        store.update(updated).unwrap();

        let fetched = store.get(&id).unwrap();
        assert_eq!(fetched.created_at, created);
        assert!(fetched.updated_at >= created);
        assert!(store.get_by_channel("telegram", "1").is_none());
        assert!(store.get_by_channel("telegram", "2").is_some());
    }

    #[test]
    fn test_update_rejects_channel_collision() {
        let store = BindingStore::new();
        store.add(Binding::new("telegram", "1", "org-a")).unwrap();
        let other = Binding::new("telegram", "2", "org-a");
        let other_id = other.id.clone();
        store.add(other).unwrap();

        let mut moved = store.get(&other_id).unwrap();
        moved.channel_id = "1".to_string();
        assert!(store.update(moved).is_err());
    }

    #[test]
    fn test_list_by_org() {
        let store = BindingStore::new();
        store.add(Binding::new("telegram", "1", "org-a")).unwrap();
        store.add(Binding::new("telegram", "2", "org-b")).unwrap();
        store.add(Binding::new("slack", "C1", "org-a")).unwrap();

        assert_eq!(store.list_by_org("org-a").len(), 2);
        assert_eq!(store.list_by_org("org-b").len(), 1);
        assert_eq!(store.list_by_org("org-c").len(), 0);
    }

    #[test]
    fn test_load_missing_file_non_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = BindingStore::with_dir(dir.path());
        store.load().unwrap();
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let binding = Binding::new("telegram", "12345", "org-a");
        {
            let store = BindingStore::with_dir(dir.path());
            store.add(binding.clone()).unwrap();
            // Background writer is fire-and-forget; give it a moment
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        let reloaded = BindingStore::with_dir(dir.path());
        reloaded.load().unwrap();
        assert_eq!(reloaded.count(), 1);
        let fetched = reloaded.get_by_channel("telegram", "12345").unwrap();
        assert_eq!(fetched.id, binding.id);
        assert_eq!(fetched.org_id, "org-a");
    }
}
