//! Identity cache for document states.
//!
//! Every document a read or write produces goes through
//! [`DocumentCache::get_cached_document`], so two lookups for the same id and
//! revision hand out the same `Arc` while anyone still holds it. The cache
//! itself only keeps `Weak` references; when the last strong reference goes
//! away the document's `Drop` records its key in a graveyard that the next
//! cache operation sweeps, removing the entry (and the per-id bucket once it
//! is empty).

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use crate::change_event::{BulkSubscription, EventBulk};
use crate::document::{self, DocumentData};
use crate::error::{Error, Result};
use crate::revision;

/// Shared handle to a cached document state.
pub type RxDocument = Arc<CachedDocument>;

type Graveyard = Mutex<Vec<(String, u64)>>;

/// Immutable snapshot of one document revision.
#[derive(Debug)]
pub struct CachedDocument {
    id: String,
    revision_height: u64,
    data: DocumentData,
    graveyard: Weak<Graveyard>,
}

impl CachedDocument {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn revision(&self) -> &str {
        document::revision(&self.data).unwrap_or_default()
    }

    pub fn revision_height(&self) -> u64 {
        self.revision_height
    }

    pub fn data(&self) -> &DocumentData {
        &self.data
    }

    /// Field access with dot notation.
    pub fn get(&self, path: &str) -> Option<&Value> {
        document::get_field(&self.data, path)
    }

    pub fn is_deleted(&self) -> bool {
        document::is_deleted(&self.data)
    }
}

impl Drop for CachedDocument {
    fn drop(&mut self) {
        if let Some(graveyard) = self.graveyard.upgrade() {
            graveyard
                .lock()
                .push((std::mem::take(&mut self.id), self.revision_height));
        }
    }
}

struct CacheItem {
    by_revision: HashMap<u64, Weak<CachedDocument>>,
    /// Newest state seen for this id. `None` after the change stream lagged.
    latest: Option<DocumentData>,
}

pub struct DocumentCache {
    primary_path: String,
    items: Mutex<HashMap<String, CacheItem>>,
    graveyard: Arc<Graveyard>,
    changes: Option<BulkSubscription>,
}

impl DocumentCache {
    /// `changes` feeds "latest state" updates; pass `None` for a cache that
    /// only learns from lookups.
    pub fn new(primary_path: &str, changes: Option<broadcast::Receiver<Arc<EventBulk>>>) -> Self {
        Self {
            primary_path: primary_path.to_string(),
            items: Mutex::new(HashMap::new()),
            graveyard: Arc::new(Mutex::new(Vec::new())),
            changes: changes.map(BulkSubscription::new),
        }
    }

    fn document_id<'a>(&self, data: &'a DocumentData) -> Result<Cow<'a, str>> {
        match document::get_field(data, &self.primary_path) {
            Some(Value::String(s)) if !s.is_empty() => Ok(Cow::Borrowed(s.as_str())),
            Some(Value::Number(n)) => Ok(Cow::Owned(n.to_string())),
            _ => Err(Error::MissingPrimaryKey {
                path: self.primary_path.clone(),
            }),
        }
    }

    /// Return the live object for this id and revision, creating it if no
    /// strong reference to one exists anymore.
    pub fn get_cached_document(&self, data: &DocumentData) -> Result<RxDocument> {
        self.process_pending();
        let id = self.document_id(data)?;
        let height = revision::revision_height(data)?;

        let mut items = self.items.lock();
        if let Some(doc) = items
            .get(id.as_ref())
            .and_then(|item| item.by_revision.get(&height))
            .and_then(Weak::upgrade)
        {
            return Ok(doc);
        }

        let doc = Arc::new(CachedDocument {
            id: id.to_string(),
            revision_height: height,
            data: data.clone(),
            graveyard: Arc::downgrade(&self.graveyard),
        });
        let item = items.entry(id.into_owned()).or_insert_with(|| CacheItem {
            by_revision: HashMap::new(),
            latest: None,
        });
        item.by_revision.insert(height, Arc::downgrade(&doc));
        Self::offer_latest(item, data);
        Ok(doc)
    }

    /// Same as [`get_cached_document`](Self::get_cached_document) for a batch.
    pub fn get_cached_documents(&self, docs: &[DocumentData]) -> Result<Vec<RxDocument>> {
        docs.iter().map(|d| self.get_cached_document(d)).collect()
    }

    pub fn get_latest_document_data(&self, id: &str) -> Result<DocumentData> {
        self.get_latest_document_data_if_exists(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn get_latest_document_data_if_exists(&self, id: &str) -> Option<DocumentData> {
        self.process_pending();
        self.items.lock().get(id).and_then(|item| item.latest.clone())
    }

    /// Number of ids with at least one live cached revision.
    pub fn len(&self) -> usize {
        self.process_pending();
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop following the change stream.
    pub fn close(&self) {
        if let Some(changes) = &self.changes {
            changes.close();
        }
    }

    fn offer_latest(item: &mut CacheItem, data: &DocumentData) {
        let newer = match &item.latest {
            None => true,
            Some(current) => {
                revision::revision_height(data).unwrap_or(0)
                    >= revision::revision_height(current).unwrap_or(0)
            }
        };
        if newer {
            item.latest = Some(data.clone());
        }
    }

    /// Sweep finalized entries and apply change events received so far.
    fn process_pending(&self) {
        let dead = std::mem::take(&mut *self.graveyard.lock());
        let drained = self.changes.as_ref().map(BulkSubscription::drain);
        if dead.is_empty() && drained.as_ref().is_none_or(|d| d.bulks.is_empty() && d.lagged == 0) {
            return;
        }

        let mut items = self.items.lock();
        for (id, height) in dead {
            let Some(item) = items.get_mut(&id) else {
                continue;
            };
            // the slot may have been refilled since the drop
            if item
                .by_revision
                .get(&height)
                .is_some_and(|w| w.strong_count() == 0)
            {
                item.by_revision.remove(&height);
            }
            if item.by_revision.is_empty() {
                items.remove(&id);
            }
        }

        let Some(drained) = drained else {
            return;
        };
        if drained.lagged > 0 {
            warn!(lagged = drained.lagged, "document cache missed change events, dropping latest states");
            for item in items.values_mut() {
                item.latest = None;
            }
        }
        for bulk in drained.bulks.iter().filter(|b| !b.is_local) {
            for event in &bulk.events {
                if let (Some(item), Some(data)) = (items.get_mut(&event.document_id), event.latest_data()) {
                    Self::offer_latest(item, data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::{ChangeEvent, PreviousDocument, event_bulk_id};
    use serde_json::json;

    fn doc(id: &str, rev: &str, name: &str) -> Value {
        json!({"id": id, "_rev": rev, "name": name, "_deleted": false})
    }

    #[test]
    fn same_revision_returns_same_object() {
        let cache = DocumentCache::new("id", None);
        let a = cache.get_cached_document(&doc("a", "1-x", "A")).unwrap();
        let b = cache.get_cached_document(&doc("a", "1-x", "A")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.get_cached_document(&doc("a", "2-y", "B")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.revision_height(), 2);
    }

    #[test]
    fn dropped_documents_are_evicted() {
        let cache = DocumentCache::new("id", None);
        let a = cache.get_cached_document(&doc("a", "1-x", "A")).unwrap();
        assert_eq!(cache.len(), 1);
        drop(a);
        assert_eq!(cache.len(), 0);

        let again = cache.get_cached_document(&doc("a", "1-x", "A")).unwrap();
        assert_eq!(again.data(), &doc("a", "1-x", "A"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bucket_survives_while_any_revision_is_alive() {
        let cache = DocumentCache::new("id", None);
        let v1 = cache.get_cached_document(&doc("a", "1-x", "A")).unwrap();
        let v2 = cache.get_cached_document(&doc("a", "2-y", "B")).unwrap();
        drop(v1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_latest_document_data("a").unwrap()["name"], "B");
        drop(v2);
        assert!(cache.is_empty());
        assert!(matches!(cache.get_latest_document_data("a"), Err(Error::NotFound(_))));
    }

    #[test]
    fn change_events_update_latest_state() {
        let (tx, rx) = broadcast::channel(8);
        let cache = DocumentCache::new("id", Some(rx));
        let v1 = doc("a", "1-x", "A");
        let _held = cache.get_cached_document(&v1).unwrap();

        let v2 = doc("a", "2-y", "B");
        tx.send(Arc::new(EventBulk {
            id: event_bulk_id(),
            collection: "users".into(),
            events: vec![
                ChangeEvent::update("a", v2.clone(), PreviousDocument::Known(v1)),
                ChangeEvent::insert("unknown", doc("unknown", "1-z", "Z")),
            ],
            checkpoint: json!(null),
            context: "test".into(),
            start_time: 0,
            end_time: 0,
            is_local: false,
        }))
        .unwrap();

        assert_eq!(cache.get_latest_document_data("a").unwrap(), v2);
        assert!(cache.get_latest_document_data_if_exists("unknown").is_none());
    }

    #[test]
    fn rejects_documents_without_key_or_revision() {
        let cache = DocumentCache::new("id", None);
        assert!(matches!(
            cache.get_cached_document(&json!({"_rev": "1-x"})),
            Err(Error::MissingPrimaryKey { .. })
        ));
        assert!(matches!(
            cache.get_cached_document(&json!({"id": "a", "_rev": "bogus"})),
            Err(Error::InvalidRevision(_))
        ));
    }
}
