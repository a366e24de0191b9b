//! crates/page_forge_core/src/cache.rs
//!
//! Crash/reload recovery for a generation session.
//!
//! Snapshots are JSON documents held in a `SessionStore` under a key derived from
//! an explicit `CacheKey`. Loading never fails: a missing or corrupt entry simply
//! means there is no cached state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{
    GenerationResult, ItemKey, Outline, RecordId, SessionState, Stage, TaskId, TaskProgress,
};
use crate::ports::{PortError, PortResult, SessionStore};

pub const STORAGE_KEY_PREFIX: &str = "generator-state";

/// Which cache entry a session reads and writes.
///
/// Sessions without a backend record are cached as a draft; callers pick the
/// variant explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Draft,
    Record(RecordId),
}

impl CacheKey {
    pub fn storage_key(&self) -> String {
        match self {
            Self::Draft => format!("{STORAGE_KEY_PREFIX}-draft"),
            Self::Record(id) => format!("{STORAGE_KEY_PREFIX}-{id}"),
        }
    }
}

impl From<RecordId> for CacheKey {
    fn from(id: RecordId) -> Self {
        Self::Record(id)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

//=========================================================================================
// Snapshot format
//=========================================================================================

/// The serializable subset of a `SessionState`. Attachments are never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub outline: Outline,
    #[serde(default)]
    pub progress: TaskProgress,
    /// Results in page order.
    #[serde(default)]
    pub images: Vec<GenerationResult>,
    /// Page keys in the order the server last received them.
    #[serde(default)]
    pub dispatch: Vec<ItemKey>,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub record_id: Option<RecordId>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl PersistedSession {
    pub fn capture(state: &SessionState) -> Self {
        let images = state
            .outline
            .pages
            .iter()
            .filter_map(|page| state.images.get(&page.key).cloned())
            .collect();

        Self {
            stage: state.stage,
            topic: state.topic.clone(),
            outline: state.outline.clone(),
            progress: state.progress.clone(),
            images,
            dispatch: state.dispatch.clone(),
            task_id: state.task_id.clone(),
            record_id: state.record_id.clone(),
            saved_at: Some(Utc::now()),
        }
    }

    /// Rebuilds a session. An image whose key matches no page is re-attached to
    /// the page at its recorded position when that page has no image yet;
    /// otherwise it is dropped. The dispatch order follows re-attached images to
    /// their new keys.
    pub fn into_state(self) -> SessionState {
        let mut outline = self.outline;
        outline.reindex();

        let page_keys: HashSet<ItemKey> = outline.pages.iter().map(|p| p.key).collect();
        let mut state = SessionState {
            stage: self.stage,
            topic: self.topic,
            progress: self.progress,
            task_id: self.task_id,
            record_id: self.record_id,
            ..SessionState::default()
        };

        let mut rekeyed = HashMap::new();
        let mut orphans = Vec::new();
        for image in self.images {
            if page_keys.contains(&image.key) {
                state.images.insert(image.key, image);
            } else {
                orphans.push(image);
            }
        }
        for mut image in orphans {
            match outline.pages.get(image.position) {
                Some(page) if !state.images.contains_key(&page.key) => {
                    rekeyed.insert(image.key, page.key);
                    image.key = page.key;
                    state.images.insert(page.key, image);
                }
                _ => debug!(position = image.position, "Dropping cached image with no page"),
            }
        }

        for page in &outline.pages {
            if let Some(image) = state.images.get_mut(&page.key) {
                image.position = page.position;
            }
        }
        state.dispatch = self
            .dispatch
            .into_iter()
            .map(|key| rekeyed.get(&key).copied().unwrap_or(key))
            .collect();

        let total = state.progress.total;
        state.progress.set_counts(state.progress.completed, total);
        state.outline = outline;
        state
    }
}

//=========================================================================================
// The cache
//=========================================================================================

#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn SessionStore>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Reads the snapshot stored under `key`, if there is a usable one.
    pub fn load(&self, key: &CacheKey) -> Option<PersistedSession> {
        let storage_key = key.storage_key();
        let raw = match self.store.read(&storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Failed to read cached session state");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => {
                info!(key = %storage_key, "Loaded cached session state");
                Some(snapshot)
            }
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Ignoring corrupt cached session state");
                None
            }
        }
    }

    pub fn save(&self, key: &CacheKey, state: &SessionState) -> PortResult<()> {
        let snapshot = PersistedSession::capture(state);
        let json =
            serde_json::to_string(&snapshot).map_err(|e| PortError::Unexpected(e.to_string()))?;
        self.store.write(&key.storage_key(), &json)?;
        debug!(key = %key, "Cached session state");
        Ok(())
    }

    pub fn evict(&self, key: &CacheKey) -> PortResult<()> {
        self.store.remove(&key.storage_key())?;
        info!(key = %key, "Cleared cached session state");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{ImageStatus, PageKind, WorkItem};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store for core tests.
    #[derive(Default)]
    pub(crate) struct MapStore {
        pub(crate) entries: Mutex<HashMap<String, String>>,
    }

    impl SessionStore for MapStore {
        fn read(&self, key: &str) -> PortResult<Option<String>> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        fn write(&self, key: &str, value: &str) -> PortResult<()> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        fn remove(&self, key: &str) -> PortResult<()> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn two_page_state() -> SessionState {
        let mut outline = Outline {
            pages: vec![
                WorkItem::new(PageKind::Cover, "cover"),
                WorkItem::new(PageKind::Content, "body"),
            ],
            ..Outline::default()
        };
        outline.reindex();
        outline.sync_raw();

        let mut images = HashMap::new();
        for page in &outline.pages {
            images.insert(page.key, GenerationResult::pending(page.key, page.position));
        }
        let dispatch = outline.pages.iter().rev().map(|p| p.key).collect();

        SessionState {
            stage: Stage::Generating,
            topic: "topic".into(),
            outline,
            images,
            dispatch,
            record_id: Some(RecordId::new("r1")),
            ..SessionState::default()
        }
    }

    #[test]
    fn keys_are_prefixed_and_explicit() {
        assert_eq!(CacheKey::Draft.storage_key(), "generator-state-draft");
        assert_eq!(
            CacheKey::from(RecordId::new("abc")).storage_key(),
            "generator-state-abc"
        );
    }

    #[test]
    fn save_then_load_restores_pages_and_images() {
        let store = Arc::new(MapStore::default());
        let cache = SessionCache::new(store.clone());
        let key = CacheKey::Record(RecordId::new("r1"));
        let state = two_page_state();

        cache.save(&key, &state).unwrap();
        let restored = cache.load(&key).unwrap().into_state();

        assert_eq!(restored.outline.pages, state.outline.pages);
        assert_eq!(restored.images, state.images);
        assert_eq!(restored.dispatch, state.dispatch);
        assert_eq!(restored.record_id, state.record_id);
        assert!(restored.attachments.is_empty());
    }

    #[test]
    fn missing_and_corrupt_entries_load_as_none() {
        let store = Arc::new(MapStore::default());
        let cache = SessionCache::new(store.clone());
        assert!(cache.load(&CacheKey::Draft).is_none());

        store.write("generator-state-draft", "{ not json").unwrap();
        assert!(cache.load(&CacheKey::Draft).is_none());
    }

    #[test]
    fn images_without_matching_keys_reattach_by_position() {
        let json = r#"{
            "stage": "result",
            "outline": {"raw": "", "pages": [
                {"index": 0, "type": "cover", "content": "a"},
                {"index": 1, "type": "content", "content": "b"}
            ]},
            "progress": {"current": 1, "total": 2, "status": "done"},
            "images": [{"index": 1, "url": "/b.png", "status": "done"}]
        }"#;
        let snapshot: PersistedSession = serde_json::from_str(json).unwrap();
        let state = snapshot.into_state();

        let second = &state.outline.pages[1];
        let image = &state.images[&second.key];
        assert_eq!(image.status, ImageStatus::Done);
        assert_eq!(image.locator, "/b.png");
        assert_eq!(state.images.len(), 1);
    }

    #[test]
    fn dispatch_order_follows_reattached_images() {
        let stale = ItemKey::new();
        let json = format!(
            r#"{{
            "outline": {{"raw": "", "pages": [
                {{"index": 0, "type": "cover", "content": "a"}}
            ]}},
            "images": [{{"key": "{stale}", "index": 0, "url": "", "status": "generating"}}],
            "dispatch": ["{stale}"]
        }}"#
        );
        let snapshot: PersistedSession = serde_json::from_str(&json).unwrap();
        let state = snapshot.into_state();

        let page = &state.outline.pages[0];
        assert_eq!(state.dispatch, vec![page.key]);
        assert_eq!(state.images[&page.key].key, page.key);
    }

    #[test]
    fn evict_removes_the_entry() {
        let store = Arc::new(MapStore::default());
        let cache = SessionCache::new(store.clone());
        cache.save(&CacheKey::Draft, &two_page_state()).unwrap();
        cache.evict(&CacheKey::Draft).unwrap();
        assert!(store.entries.lock().unwrap().is_empty());
    }
}
