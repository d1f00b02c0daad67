//! Scoped persistent key/value store.
//!
//! Every graph scope owns one JSON document on disk, loaded once per session
//! and kept in memory. Nodes store their state in a section named after their
//! fullname. The in-memory map is authoritative; documents are only written
//! back when they differ from the snapshot taken at load time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::engine::TaskGroup;
use crate::error::Result;

/// Registry of every cache scope opened during a session.
#[derive(Default)]
pub struct Cache {
    scopes: Mutex<HashMap<Utf8PathBuf, Arc<CacheScope>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the scope backed by `path`, loading it on first access.
    ///
    /// A missing or unreadable document starts out empty rather than failing,
    /// the worst outcome of a corrupted cache is a full rebuild.
    pub fn scope(&self, path: impl AsRef<Utf8Path>) -> Arc<CacheScope> {
        let path = path.as_ref();
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);

        scopes
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(CacheScope::load(path)))
            .clone()
    }

    pub fn scopes(&self) -> Vec<Arc<CacheScope>> {
        self.scopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Writes every scope whose content changed since it was loaded or last
    /// saved. Returns the number of documents written.
    pub async fn save_all_dirty(&self) -> Result<usize> {
        let mut group = TaskGroup::new("saving caches");

        for scope in self.scopes().into_iter().filter(|s| s.is_dirty()) {
            group.spawn(async move {
                tokio::task::spawn_blocking(move || scope.save())
                    .await
                    .map_err(std::io::Error::other)??;
                Ok(())
            });
        }

        Ok(group.join().await?.len())
    }
}

/// One persisted document: a map of sections, each a map of keys to JSON
/// values.
pub struct CacheScope {
    path: Utf8PathBuf,
    data: Mutex<Map<String, Value>>,
    snapshot: Mutex<String>,
}

impl CacheScope {
    fn load(path: &Utf8Path) -> Self {
        let data = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Map<String, Value>>(&text).ok())
            .unwrap_or_default();

        if data.is_empty() {
            tracing::debug!("cache {path} is empty");
        }

        let snapshot = Value::Object(data.clone()).to_string();

        Self {
            path: path.to_owned(),
            data: Mutex::new(data),
            snapshot: Mutex::new(snapshot),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads `key` of `section`, `None` when absent or of a different shape.
    pub fn get<T: DeserializeOwned>(&self, section: &str, key: &str) -> Option<T> {
        let data = self.lock();
        let value = data.get(section)?.as_object()?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set<T: Serialize>(&self, section: &str, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut data = self.lock();

        let entry = data
            .entry(section.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(map) = entry {
            map.insert(key.to_string(), value);
        }
        Ok(())
    }

    pub fn remove(&self, section: &str, key: &str) {
        let mut data = self.lock();
        if let Some(Value::Object(map)) = data.get_mut(section) {
            map.remove(key);
        }
    }

    pub fn remove_section(&self, section: &str) {
        self.lock().remove(section);
    }

    pub fn is_dirty(&self) -> bool {
        let current = Value::Object(self.lock().clone()).to_string();
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) != current
    }

    /// Writes the document and makes it the new clean snapshot.
    pub fn save(&self) -> Result<()> {
        let data = Value::Object(self.lock().clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&data)?)?;

        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = data.to_string();
        tracing::debug!("saved cache {}", self.path);
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_scope_is_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new();
        let a = cache.scope(temp_path(&dir, "a.json"));
        let b = cache.scope(temp_path(&dir, "a.json"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dirty_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let scope = Cache::new().scope(temp_path(&dir, "s.json"));
        assert!(!scope.is_dirty());

        scope.set("node", "fingerprint", &"abc").unwrap();
        assert!(scope.is_dirty());

        scope.save().unwrap();
        assert!(!scope.is_dirty());

        // Setting the same value again is not a change.
        scope.set("node", "fingerprint", &"abc").unwrap();
        assert!(!scope.is_dirty());
    }

    #[test]
    fn test_persisted_between_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "nested/cache.json");

        let scope = Cache::new().scope(&path);
        scope.set("lib", "deps", &vec!["a.h", "b.h"]).unwrap();
        scope.save().unwrap();

        let reloaded = Cache::new().scope(&path);
        let deps: Vec<String> = reloaded.get("lib", "deps").unwrap();
        assert_eq!(deps, vec!["a.h", "b.h"]);
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_corrupted_document_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_path(&dir, "broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let scope = Cache::new().scope(&path);
        assert_eq!(scope.get::<String>("x", "y"), None);
    }

    #[test]
    fn test_remove() {
        let dir = tempfile::tempdir().unwrap();
        let scope = Cache::new().scope(temp_path(&dir, "r.json"));
        scope.set("n", "a", &1).unwrap();
        scope.set("n", "b", &2).unwrap();
        scope.remove("n", "a");
        assert_eq!(scope.get::<i32>("n", "a"), None);
        assert_eq!(scope.get::<i32>("n", "b"), Some(2));
        scope.remove_section("n");
        assert_eq!(scope.get::<i32>("n", "b"), None);
    }

    #[tokio::test]
    async fn test_save_all_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new();
        cache.scope(temp_path(&dir, "clean.json"));
        cache
            .scope(temp_path(&dir, "dirty.json"))
            .set("n", "k", &true)
            .unwrap();

        assert_eq!(cache.save_all_dirty().await.unwrap(), 1);
        assert!(dir.path().join("dirty.json").exists());
        assert!(!dir.path().join("clean.json").exists());
        assert_eq!(cache.save_all_dirty().await.unwrap(), 0);
    }
}
