use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::change_event::EventBulk;
use crate::config::CollectionOptions;
use crate::conflict::{ConflictHandler, ConflictResolutionTaskSolution, DefaultConflictHandler};
use crate::doc_cache::{DocumentCache, RxDocument};
use crate::document::{self, DELETED_FIELD, DocumentData};
use crate::error::{Error, Result};
use crate::event_buffer::ChangeEventBuffer;
use crate::idle_queue::IdleQueue;
use crate::query::MangoQuery;
use crate::rx_query::{QueryOp, RxQuery};
use crate::storage::{BulkWriteRow, StorageInstance, WriteError, WriteErrorStatus};
use crate::update::{self, UpdateSpec};
use crate::write_queue::{IncrementalWriteQueue, Modifier, NoHooks, WriteHooks};

const CONFLICT_CONTEXT: &str = "conflict-resolution";

/// Strategies a collection is built with.
#[derive(Clone)]
pub struct CollectionHandlers {
    pub hooks: Arc<dyn WriteHooks>,
    pub conflict_handler: Arc<dyn ConflictHandler>,
}

impl Default for CollectionHandlers {
    fn default() -> Self {
        Self {
            hooks: Arc::new(NoHooks),
            conflict_handler: Arc::new(DefaultConflictHandler),
        }
    }
}

/// Per-row outcome of [`Collection::bulk_insert`].
#[derive(Debug, Clone, Default)]
pub struct BulkInsertResult {
    pub success: Vec<RxDocument>,
    pub error: Vec<WriteError>,
}

pub(crate) struct CollectionInner {
    name: String,
    primary_path: String,
    storage: Arc<dyn StorageInstance>,
    idle: Arc<IdleQueue>,
    cache: DocumentCache,
    buffer: ChangeEventBuffer,
    write_queue: IncrementalWriteQueue,
    event_reduce: bool,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    conflict_task: Mutex<Option<JoinHandle<()>>>,
}

/// A collection of documents sharing one storage instance.
///
/// Cheap to clone; all clones share the same cache, event buffer and write
/// queue.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// `storage` is expected to be the write-coordinated instance.
    pub(crate) fn open(
        name: &str,
        options: &CollectionOptions,
        storage: Arc<dyn StorageInstance>,
        idle: Arc<IdleQueue>,
        event_reduce: bool,
        event_buffer_size: usize,
        handlers: CollectionHandlers,
    ) -> Self {
        let changes = storage.change_stream();
        let (closed_tx, _) = watch::channel(false);
        let inner = Arc::new(CollectionInner {
            name: name.to_string(),
            primary_path: options.primary_key.clone(),
            cache: DocumentCache::new(&options.primary_key, Some(changes.resubscribe())),
            buffer: ChangeEventBuffer::new(&changes, event_buffer_size),
            write_queue: IncrementalWriteQueue::new(Arc::clone(&storage), &options.primary_key, handlers.hooks),
            storage,
            idle,
            event_reduce,
            closed: AtomicBool::new(false),
            closed_tx,
            conflict_task: Mutex::new(None),
        });
        let task = spawn_conflict_resolver(&inner, handlers.conflict_handler);
        *inner.conflict_task.lock() = Some(task);
        info!(collection = %name, primary_key = %options.primary_key, "collection opened");
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn primary_path(&self) -> &str {
        &self.inner.primary_path
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(format!("collection '{}'", self.inner.name)));
        }
        Ok(())
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageInstance> {
        &self.inner.storage
    }

    pub(crate) fn buffer(&self) -> &ChangeEventBuffer {
        &self.inner.buffer
    }

    pub(crate) fn event_reduce(&self) -> bool {
        self.inner.event_reduce
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.inner.cache
    }

    /// Change event bulks of this collection, starting now.
    pub fn event_bulks(&self) -> broadcast::Receiver<Arc<EventBulk>> {
        self.inner.storage.change_stream()
    }

    // -----------------------------------------------------------------------
    // Direct writes
    // -----------------------------------------------------------------------

    fn new_document(&self, mut data: DocumentData) -> Result<DocumentData> {
        document::require_primary_key(&data, &self.inner.primary_path)?;
        document::fill_defaults(&mut data)?;
        Ok(data)
    }

    pub async fn insert(&self, data: DocumentData) -> Result<RxDocument> {
        let mut result = self.bulk_insert(vec![data]).await?;
        if let Some(err) = result.error.first() {
            return Err(Error::from_write_error(err));
        }
        result
            .success
            .pop()
            .ok_or_else(|| Error::Storage("insert returned no document".into()))
    }

    /// Insert many documents in one storage write. Row failures are
    /// reported per document; malformed input fails the whole call.
    pub async fn bulk_insert(&self, docs: Vec<DocumentData>) -> Result<BulkInsertResult> {
        self.ensure_open()?;
        let rows = docs
            .into_iter()
            .map(|d| {
                Ok(BulkWriteRow {
                    previous: None,
                    document: self.new_document(d)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if rows.is_empty() {
            return Ok(BulkInsertResult::default());
        }
        let response = self.inner.storage.bulk_write(rows, "bulk-insert").await?;
        Ok(BulkInsertResult {
            success: self.inner.cache.get_cached_documents(&response.success)?,
            error: response.error,
        })
    }

    /// Insert, or overwrite the stored state if the id already exists.
    pub async fn upsert(&self, data: DocumentData) -> Result<RxDocument> {
        self.ensure_open()?;
        let data = self.new_document(data)?;
        let response = self
            .inner
            .storage
            .bulk_write(vec![BulkWriteRow { previous: None, document: data.clone() }], "upsert")
            .await?;
        if let Some(written) = response.success.first() {
            return self.inner.cache.get_cached_document(written);
        }
        let err = response
            .error
            .first()
            .ok_or_else(|| Error::Storage("upsert returned no result".into()))?;
        match &err.document_in_db {
            Some(in_db) if err.status == WriteErrorStatus::Conflict => {
                let replacement = document::strip_meta(&data);
                let modifier: Modifier = Arc::new(move |current: DocumentData| {
                    let mut next = replacement.clone();
                    if let (Some(obj), Some(cur)) = (next.as_object_mut(), current.as_object()) {
                        for field in [document::REV_FIELD, document::META_FIELD, document::ATTACHMENTS_FIELD] {
                            if let Some(v) = cur.get(field) {
                                obj.insert(field.to_string(), v.clone());
                            }
                        }
                    }
                    Ok(next)
                });
                let written = self.inner.write_queue.add_write(in_db.clone(), modifier).await?;
                self.inner.cache.get_cached_document(&written)
            }
            _ => Err(Error::from_write_error(err)),
        }
    }

    /// Delete the document directly. A stale state surfaces as
    /// [`Error::Conflict`] carrying the stored document.
    pub async fn remove(&self, doc: &RxDocument) -> Result<RxDocument> {
        self.ensure_open()?;
        let mut tombstone = doc.data().clone();
        document::as_object_mut(&mut tombstone)?.insert(DELETED_FIELD.to_string(), json!(true));
        let response = self
            .inner
            .storage
            .bulk_write(
                vec![BulkWriteRow {
                    previous: Some(doc.data().clone()),
                    document: tombstone,
                }],
                "remove",
            )
            .await?;
        if let Some(err) = response.error.first() {
            return Err(Error::from_write_error(err));
        }
        let written = response
            .success
            .first()
            .ok_or_else(|| Error::Storage("remove returned no document".into()))?;
        self.inner.cache.get_cached_document(written)
    }

    // -----------------------------------------------------------------------
    // Incremental writes
    // -----------------------------------------------------------------------

    /// Apply `modifier` on top of the newest state of `doc`, retrying on
    /// conflicts. Concurrent calls for the same document share one write.
    pub async fn incremental_modify<F>(&self, doc: &RxDocument, modifier: F) -> Result<RxDocument>
    where
        F: Fn(DocumentData) -> Result<DocumentData> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let written = self
            .inner
            .write_queue
            .add_write(doc.data().clone(), Arc::new(modifier))
            .await?;
        self.inner.cache.get_cached_document(&written)
    }

    /// Replace the given top-level fields. The primary key and reserved
    /// fields cannot be patched.
    pub async fn incremental_patch(&self, doc: &RxDocument, patch: Value) -> Result<RxDocument> {
        let patch = match patch {
            Value::Object(map) => map,
            _ => return Err(Error::NotAnObject),
        };
        for key in patch.keys() {
            update::check_path(key, &self.inner.primary_path)?;
        }
        self.incremental_modify(doc, move |mut data| {
            update::apply_patch(&mut data, &patch)?;
            Ok(data)
        })
        .await
    }

    /// Apply mongo-style update operators (`$set`, `$inc`, ..).
    pub async fn incremental_update(&self, doc: &RxDocument, update: &Value) -> Result<RxDocument> {
        let spec = UpdateSpec::parse(update, &self.inner.primary_path)?;
        self.incremental_modify(doc, move |mut data| {
            spec.apply(&mut data)?;
            Ok(data)
        })
        .await
    }

    pub async fn incremental_remove(&self, doc: &RxDocument) -> Result<RxDocument> {
        self.incremental_modify(doc, |mut data| {
            document::as_object_mut(&mut data)?.insert(DELETED_FIELD.to_string(), json!(true));
            Ok(data)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Documents by primary key; deleted and unknown ids are left out.
    /// States already known to the cache are served without a storage call.
    pub async fn find_by_ids(&self, ids: &[String]) -> Result<HashMap<String, RxDocument>> {
        self.ensure_open()?;
        let mut found = HashMap::with_capacity(ids.len());
        let mut must_query = Vec::new();
        for id in ids {
            match self.inner.cache.get_latest_document_data_if_exists(id) {
                Some(data) if document::is_deleted(&data) => {}
                Some(data) => {
                    found.insert(id.clone(), self.inner.cache.get_cached_document(&data)?);
                }
                None => must_query.push(id.clone()),
            }
        }
        if !must_query.is_empty() {
            let docs = self.inner.storage.find_documents_by_id(&must_query, false).await?;
            for data in docs {
                let doc = self.inner.cache.get_cached_document(&data)?;
                found.insert(doc.id().to_string(), doc);
            }
        }
        Ok(found)
    }

    pub fn find(&self, query: MangoQuery) -> Result<RxQuery> {
        RxQuery::new(self.clone(), QueryOp::Find, query)
    }

    pub fn find_one(&self, query: MangoQuery) -> Result<RxQuery> {
        RxQuery::new(self.clone(), QueryOp::FindOne, query)
    }

    pub fn count(&self, query: MangoQuery) -> Result<RxQuery> {
        RxQuery::new(self.clone(), QueryOp::Count, query)
    }

    /// Purge tombstones older than `min_deleted_time_ms`.
    pub async fn cleanup(&self, min_deleted_time_ms: f64) -> Result<bool> {
        self.ensure_open()?;
        self.inner.storage.cleanup(min_deleted_time_ms).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop all subscriptions, wait for pending storage calls, close storage.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.inner.closed_tx.send(true);
        if let Some(task) = self.inner.conflict_task.lock().take() {
            task.abort();
        }
        self.inner.buffer.close();
        self.inner.cache.close();
        self.inner.idle.request_idle().await;
        self.inner.storage.close().await?;
        info!(collection = %self.inner.name, "collection closed");
        Ok(())
    }

    /// Close the collection and delete its stored data.
    pub async fn remove_collection(&self) -> Result<()> {
        self.close().await?;
        self.inner.storage.remove().await
    }
}

fn spawn_conflict_resolver(inner: &Arc<CollectionInner>, handler: Arc<dyn ConflictHandler>) -> JoinHandle<()> {
    let mut tasks = inner.storage.conflict_resolution_tasks();
    let storage = Arc::clone(&inner.storage);
    let name = inner.name.clone();
    tokio::spawn(async move {
        loop {
            let task = match tasks.recv().await {
                Ok(task) => task,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(collection = %name, skipped = n, "conflict resolution tasks lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            debug!(collection = %name, task = %task.id, "resolving conflict");
            let output = match handler.resolve(&task.input, CONFLICT_CONTEXT).await {
                Ok(output) => output,
                Err(err) => {
                    warn!(collection = %name, task = %task.id, error = %err, "conflict handler failed");
                    continue;
                }
            };
            let solution = ConflictResolutionTaskSolution { id: task.id, output };
            if let Err(err) = storage.resolve_conflict_resolution_task(solution).await {
                warn!(collection = %name, error = %err, "could not submit conflict resolution");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseOptions;
    use crate::database::Database;
    use crate::memory::MemoryStorage;

    async fn users() -> (Database, Collection) {
        let db = Database::create(Arc::new(MemoryStorage::new()), DatabaseOptions::new("test")).unwrap();
        let users = db.add_collection("users", CollectionOptions::default()).await.unwrap();
        (db, users)
    }

    #[tokio::test]
    async fn patch_rejects_key_and_reserved_fields() {
        let (_db, users) = users().await;
        let doc = users.insert(json!({"id": "a", "name": "x"})).await.unwrap();
        for patch in [
            json!({"id": "b"}),
            json!({"_rev": "9-zzz"}),
            json!({"_meta": {}}),
            json!({"_deleted": true}),
            json!({"_attachments": {}}),
        ] {
            let err = users.incremental_patch(&doc, patch.clone()).await.unwrap_err();
            assert!(matches!(err, Error::InvalidQuery(_)), "{patch}");
        }
        assert!(matches!(
            users.incremental_patch(&doc, json!(["name"])).await,
            Err(Error::NotAnObject)
        ));

        let patched = users.incremental_patch(&doc, json!({"name": "y"})).await.unwrap();
        assert_eq!(patched.get("name"), Some(&json!("y")));
        assert_eq!(patched.revision_height(), 2);
        assert!(!patched.is_deleted());
    }

    #[tokio::test]
    async fn find_by_ids_skips_deleted_and_unknown() {
        let (_db, users) = users().await;
        let a = users.insert(json!({"id": "a"})).await.unwrap();
        users.insert(json!({"id": "b"})).await.unwrap();
        users.incremental_remove(&a).await.unwrap();

        let found = users
            .find_by_ids(&["a".to_string(), "b".to_string(), "zzz".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("b"));
    }
}
