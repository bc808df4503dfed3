//! Stale markers and the cursor-based marker store contract.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use reckon_core::StreamId;

use crate::error::StoreError;

/// Composite key of a stale marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleMarkerKey {
    pub stream_id: StreamId,
    pub kind: String,
}

impl core::fmt::Display for StaleMarkerKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.kind)
    }
}

/// Signals that derived state for `(stream_id, kind)` is out of date.
///
/// The row carries no payload; its existence is the signal. It is deleted only
/// after the action it stands for was applied or found to be a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleMarker {
    pub stream_id: StreamId,
    pub kind: String,
    pub created: DateTime<Utc>,
}

impl StaleMarker {
    pub fn new(stream_id: StreamId, kind: impl Into<String>) -> Self {
        Self {
            stream_id,
            kind: kind.into(),
            created: Utc::now(),
        }
    }

    pub fn key(&self) -> StaleMarkerKey {
        StaleMarkerKey {
            stream_id: self.stream_id,
            kind: self.kind.clone(),
        }
    }
}

/// Source of stale markers, read through locking cursors.
pub trait StaleMarkerStore: Send + Sync {
    /// Lock up to `limit` markers of `kind`, oldest first, skipping markers locked
    /// by other cursors and markers of the streams in `skip`. The cursor is one
    /// transaction.
    fn open_cursor(
        &self,
        kind: &str,
        limit: usize,
        skip: &[StreamId],
    ) -> Result<Box<dyn MarkerCursor>, StoreError>;
}

impl<T: StaleMarkerStore + ?Sized> StaleMarkerStore for Arc<T> {
    fn open_cursor(
        &self,
        kind: &str,
        limit: usize,
        skip: &[StreamId],
    ) -> Result<Box<dyn MarkerCursor>, StoreError> {
        (**self).open_cursor(kind, limit, skip)
    }
}

/// A locked batch of markers. Dropping it without `commit` rolls back: deletions
/// are discarded and the markers become visible again.
pub trait MarkerCursor: Send {
    fn markers(&self) -> &[StaleMarker];

    /// Delete a marker held by this cursor; takes effect on commit.
    fn delete(&mut self, key: &StaleMarkerKey) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    markers: BTreeMap<StaleMarkerKey, StaleMarker>,
    locked: HashSet<StaleMarkerKey>,
    /// Locked keys marked again while a cursor held them.
    remarked: HashSet<StaleMarkerKey>,
}

/// In-memory marker store for tests/dev.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStaleMarkerStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStaleMarkerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Record that `(stream_id, kind)` is stale.
    ///
    /// Marking a key that an open cursor holds keeps it alive past that cursor's
    /// delete, so an update arriving mid-publish is not lost.
    pub fn mark(&self, stream_id: StreamId, kind: &str) {
        let marker = StaleMarker::new(stream_id, kind);
        let key = marker.key();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.locked.contains(&key) {
            inner.remarked.insert(key.clone());
        }
        inner.markers.entry(key).or_insert(marker);
    }

    pub fn insert(&self, marker: StaleMarker) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.markers.insert(marker.key(), marker);
    }

    pub fn contains(&self, key: &StaleMarkerKey) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .markers
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .markers
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn locked_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locked
            .len()
    }
}

impl StaleMarkerStore for InMemoryStaleMarkerStore {
    fn open_cursor(
        &self,
        kind: &str,
        limit: usize,
        skip: &[StreamId],
    ) -> Result<Box<dyn MarkerCursor>, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let mut batch: Vec<StaleMarker> = inner
            .markers
            .values()
            .filter(|m| {
                m.kind == kind && !skip.contains(&m.stream_id) && !inner.locked.contains(&m.key())
            })
            .cloned()
            .collect();
        batch.sort_by(|a, b| (a.created, a.stream_id).cmp(&(b.created, b.stream_id)));
        batch.truncate(limit);

        for marker in &batch {
            inner.locked.insert(marker.key());
        }

        Ok(Box::new(InMemoryCursor {
            inner: Arc::clone(&self.inner),
            markers: batch,
            deletes: Vec::new(),
        }))
    }
}

struct InMemoryCursor {
    inner: Arc<Mutex<Inner>>,
    markers: Vec<StaleMarker>,
    deletes: Vec<StaleMarkerKey>,
}

impl InMemoryCursor {
    fn unlock(&mut self, inner: &mut Inner) {
        for marker in self.markers.drain(..) {
            let key = marker.key();
            inner.locked.remove(&key);
            inner.remarked.remove(&key);
        }
    }
}

impl MarkerCursor for InMemoryCursor {
    fn markers(&self) -> &[StaleMarker] {
        &self.markers
    }

    fn delete(&mut self, key: &StaleMarkerKey) -> Result<(), StoreError> {
        if !self.markers.iter().any(|m| &m.key() == key) {
            return Err(StoreError::storage(format!("marker {key} is not held by this cursor")));
        }
        self.deletes.push(key.clone());
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let shared = Arc::clone(&self.inner);
        let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
        for key in std::mem::take(&mut self.deletes) {
            if !inner.remarked.contains(&key) {
                inner.markers.remove(&key);
            }
        }
        self.unlock(&mut inner);
        Ok(())
    }
}

impl Drop for InMemoryCursor {
    fn drop(&mut self) {
        if self.markers.is_empty() {
            return;
        }
        let shared = Arc::clone(&self.inner);
        let mut inner = shared.lock().unwrap_or_else(PoisonError::into_inner);
        self.unlock(&mut inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_locks_markers_of_one_kind() {
        let store = InMemoryStaleMarkerStore::new();
        let a = StreamId::new();
        let b = StreamId::new();
        store.mark(a, "flux");
        store.mark(b, "flux");
        store.mark(a, "hourly");

        let first = store.open_cursor("flux", 1, &[]).unwrap();
        assert_eq!(first.markers().len(), 1);
        let second = store.open_cursor("flux", 10, &[]).unwrap();
        assert_eq!(second.markers().len(), 1);
        assert_ne!(first.markers()[0].stream_id, second.markers()[0].stream_id);

        let third = store.open_cursor("flux", 10, &[]).unwrap();
        assert!(third.markers().is_empty());
        assert_eq!(store.locked_count(), 2);
    }

    #[test]
    fn deletes_apply_only_on_commit() {
        let store = InMemoryStaleMarkerStore::new();
        let stream = StreamId::new();
        store.mark(stream, "flux");
        let key = StaleMarkerKey {
            stream_id: stream,
            kind: "flux".to_string(),
        };

        {
            let mut cursor = store.open_cursor("flux", 1, &[]).unwrap();
            cursor.delete(&key).unwrap();
        }
        assert!(store.contains(&key));
        assert_eq!(store.locked_count(), 0);

        let mut cursor = store.open_cursor("flux", 1, &[]).unwrap();
        cursor.delete(&key).unwrap();
        cursor.commit().unwrap();
        assert!(store.is_empty());
        assert_eq!(store.locked_count(), 0);
    }

    #[test]
    fn skipped_streams_are_not_returned() {
        let store = InMemoryStaleMarkerStore::new();
        let a = StreamId::new();
        let b = StreamId::new();
        store.mark(a, "flux");
        store.mark(b, "flux");

        let cursor = store.open_cursor("flux", 10, &[a]).unwrap();
        assert_eq!(cursor.markers().len(), 1);
        assert_eq!(cursor.markers()[0].stream_id, b);
    }

    #[test]
    fn cannot_delete_markers_held_elsewhere() {
        let store = InMemoryStaleMarkerStore::new();
        let stream = StreamId::new();
        store.mark(stream, "flux");

        let mut cursor = store.open_cursor("flux", 1, &[]).unwrap();
        let other = StaleMarkerKey {
            stream_id: StreamId::new(),
            kind: "flux".to_string(),
        };
        assert!(cursor.delete(&other).is_err());
    }

    #[test]
    fn marking_a_locked_key_survives_the_cursor_delete() {
        let store = InMemoryStaleMarkerStore::new();
        let stream = StreamId::new();
        store.mark(stream, "flux");

        let mut cursor = store.open_cursor("flux", 1, &[]).unwrap();
        let key = cursor.markers()[0].key();
        store.mark(stream, "flux");
        cursor.delete(&key).unwrap();
        cursor.commit().unwrap();

        assert!(store.contains(&key));
    }
}
