//! In-process storage engine.
//!
//! Keeps every collection in a `BTreeMap` keyed by primary key, enforces
//! optimistic concurrency on `_rev`, keeps deletions as tombstones and emits
//! one [`EventBulk`] per accepted write. Instances opened with the same
//! database and collection name share their data and change stream, which is
//! how several database handles observe each other's writes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::change_event::{ChangeEvent, EventBulk, event_bulk_id};
use crate::conflict::{
    ConflictHandlerInput, ConflictHandlerOutput, ConflictResolutionTask, ConflictResolutionTaskSolution,
};
use crate::document::{self, ATTACHMENTS_FIELD, DocumentData};
use crate::error::{Error, Result};
use crate::query::PreparedQuery;
use crate::revision;
use crate::storage::{
    BulkWriteResponse, BulkWriteRow, Storage, StorageInstance, StorageInstanceParams, WriteError,
    WriteErrorStatus,
};

/// Returns a validation message when a document must be rejected.
pub type Validator = Arc<dyn Fn(&DocumentData) -> Option<String> + Send + Sync>;

const CONFLICT_TASK_CAPACITY: usize = 64;

struct SharedCollection {
    docs: Mutex<BTreeMap<String, DocumentData>>,
    changes: broadcast::Sender<Arc<EventBulk>>,
    conflict_tasks: broadcast::Sender<ConflictResolutionTask>,
    pending_conflicts: Mutex<HashMap<String, oneshot::Sender<ConflictHandlerOutput>>>,
    next_task_id: Mutex<u64>,
}

/// Storage factory backed by process memory.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    collections: Arc<Mutex<HashMap<(String, String), Arc<SharedCollection>>>>,
    validator: Option<Validator>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes for which `validator` returns a message (status 422).
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Open an instance directly, without going through a database.
    pub fn open(&self, params: StorageInstanceParams) -> MemoryStorageInstance {
        let key = (params.database_name.clone(), params.collection_name.clone());
        let shared = {
            let mut cols = self.collections.lock();
            Arc::clone(cols.entry(key).or_insert_with(|| {
                let (changes, _) = broadcast::channel(params.change_stream_capacity.max(1));
                let (conflict_tasks, _) = broadcast::channel(CONFLICT_TASK_CAPACITY);
                Arc::new(SharedCollection {
                    docs: Mutex::new(BTreeMap::new()),
                    changes,
                    conflict_tasks,
                    pending_conflicts: Mutex::new(HashMap::new()),
                    next_task_id: Mutex::new(0),
                })
            }))
        };
        MemoryStorageInstance {
            params,
            shared,
            validator: self.validator.clone(),
            closed: Mutex::new(false),
            collections: Arc::clone(&self.collections),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_storage_instance(&self, params: StorageInstanceParams) -> Result<Arc<dyn StorageInstance>> {
        Ok(Arc::new(self.open(params)))
    }
}

pub struct MemoryStorageInstance {
    params: StorageInstanceParams,
    shared: Arc<SharedCollection>,
    validator: Option<Validator>,
    closed: Mutex<bool>,
    collections: Arc<Mutex<HashMap<(String, String), Arc<SharedCollection>>>>,
}

impl MemoryStorageInstance {
    fn ensure_open(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::Closed(format!("storage instance '{}'", self.params.collection_name)));
        }
        Ok(())
    }

    /// Ask the core to decide a conflict. Resolves once the core answers
    /// through `resolve_conflict_resolution_task`.
    pub fn request_conflict_resolution(&self, input: ConflictHandlerInput) -> oneshot::Receiver<ConflictHandlerOutput> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut next = self.shared.next_task_id.lock();
            *next += 1;
            next.to_string()
        };
        self.shared.pending_conflicts.lock().insert(id.clone(), tx);
        let _ = self.shared.conflict_tasks.send(ConflictResolutionTask { id, input });
        rx
    }

    /// Snapshot of every stored row, tombstones included.
    pub fn all_documents(&self) -> Vec<DocumentData> {
        self.shared.docs.lock().values().cloned().collect()
    }

    fn check_row(&self, row: &BulkWriteRow, id: &str, current: Option<&DocumentData>) -> Option<WriteError> {
        let fail = |status, document_in_db: Option<&DocumentData>, message: Option<String>| WriteError {
            status,
            document_id: id.to_string(),
            write_row: row.clone(),
            document_in_db: document_in_db.cloned(),
            message,
        };

        if let Some(current) = current {
            let expected = row.previous.as_ref().and_then(document::revision);
            if expected.is_none() || expected != document::revision(current) {
                return Some(fail(WriteErrorStatus::Conflict, Some(current), None));
            }
        }
        if let Some(validator) = &self.validator {
            if let Some(message) = validator(&row.document) {
                return Some(fail(WriteErrorStatus::Validation, current, Some(message)));
            }
        }
        if let Some(attachments) = row.document.get(ATTACHMENTS_FIELD).and_then(Value::as_object) {
            for (name, attachment) in attachments {
                let is_stub = attachment.get("stub").and_then(Value::as_bool).unwrap_or(false);
                let known = current
                    .and_then(|c| c.get(ATTACHMENTS_FIELD))
                    .and_then(|a| a.get(name))
                    .is_some();
                if is_stub && !known {
                    return Some(fail(
                        WriteErrorStatus::AttachmentMissing,
                        current,
                        Some(format!("attachment '{name}' is a stub without stored data")),
                    ));
                }
            }
        }
        None
    }
}

#[async_trait]
impl StorageInstance for MemoryStorageInstance {
    fn collection_name(&self) -> &str {
        &self.params.collection_name
    }

    fn primary_path(&self) -> &str {
        &self.params.primary_path
    }

    async fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse> {
        self.ensure_open()?;
        let start_time = revision::now_millis();
        let mut response = BulkWriteResponse::default();
        let mut events = Vec::new();

        let rows = rows
            .into_iter()
            .map(|row| Ok((document::require_primary_key(&row.document, &self.params.primary_path)?, row)))
            .collect::<Result<Vec<_>>>()?;

        let bulk = {
            let mut docs = self.shared.docs.lock();
            for (id, row) in rows {
                let current = docs.get(&id);
                if let Some(err) = self.check_row(&row, &id, current) {
                    response.error.push(err);
                    continue;
                }
                events.push(ChangeEvent::from_write(&id, current, &row.document));
                docs.insert(id, row.document.clone());
                response.success.push(row.document);
            }

            if events.is_empty() {
                None
            } else {
                let last = response.success.last();
                let checkpoint = json!({
                    "id": last.and_then(|d| document::primary_key(d, &self.params.primary_path)),
                    "lwt": last.and_then(document::last_write_time),
                });
                // emitted under the lock so bulks reach subscribers in write order
                let bulk = Arc::new(EventBulk {
                    id: event_bulk_id(),
                    collection: self.params.collection_name.clone(),
                    events,
                    checkpoint,
                    context: context.to_string(),
                    start_time,
                    end_time: revision::now_millis(),
                    is_local: false,
                });
                let _ = self.shared.changes.send(Arc::clone(&bulk));
                Some(bulk)
            }
        };

        if let Some(bulk) = bulk {
            debug!(
                collection = %self.params.collection_name,
                events = bulk.events.len(),
                errors = response.error.len(),
                "memory bulk write"
            );
        }
        Ok(response)
    }

    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        self.ensure_open()?;
        let docs = self.shared.docs.lock();
        Ok(query.run(docs.values()))
    }

    async fn count(&self, query: &PreparedQuery) -> Result<usize> {
        self.ensure_open()?;
        let docs = self.shared.docs.lock();
        Ok(docs.values().filter(|d| query.matches(d)).count())
    }

    async fn find_documents_by_id(&self, ids: &[String], with_deleted: bool) -> Result<Vec<DocumentData>> {
        self.ensure_open()?;
        let docs = self.shared.docs.lock();
        Ok(ids
            .iter()
            .filter_map(|id| docs.get(id))
            .filter(|d| with_deleted || !document::is_deleted(d))
            .cloned()
            .collect())
    }

    fn change_stream(&self) -> broadcast::Receiver<Arc<EventBulk>> {
        self.shared.changes.subscribe()
    }

    fn conflict_resolution_tasks(&self) -> broadcast::Receiver<ConflictResolutionTask> {
        self.shared.conflict_tasks.subscribe()
    }

    async fn resolve_conflict_resolution_task(&self, solution: ConflictResolutionTaskSolution) -> Result<()> {
        if let Some(tx) = self.shared.pending_conflicts.lock().remove(&solution.id) {
            let _ = tx.send(solution.output);
        }
        Ok(())
    }

    async fn cleanup(&self, min_deleted_time_ms: f64) -> Result<bool> {
        self.ensure_open()?;
        let cutoff = revision::now_lwt() - min_deleted_time_ms;
        let mut docs = self.shared.docs.lock();
        docs.retain(|_, d| {
            !(document::is_deleted(d) && document::last_write_time(d).is_some_and(|lwt| lwt < cutoff))
        });
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.shared.docs.lock().clear();
        self.collections.lock().remove(&(
            self.params.database_name.clone(),
            self.params.collection_name.clone(),
        ));
        self.close().await
    }
}
