//! Coalescing queue for read-modify-write updates.
//!
//! Writers hand in the state they last saw plus a modifier. All modifiers
//! queued for the same document are folded into one storage row per cycle,
//! starting from the newest of the supplied states. Conflicts are retried
//! against the state storage reports, so callers never see a 409 here.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::document::{self, ATTACHMENTS_FIELD, DELETED_FIELD, DocumentData, META_FIELD, REV_FIELD};
use crate::error::{Error, Result};
use crate::revision;
use crate::storage::{BulkWriteRow, StorageInstance, WriteErrorStatus};

/// Maps the current document state to the next one. May run more than once
/// for the same write when a conflict forces a retry.
pub type Modifier = Arc<dyn Fn(DocumentData) -> Result<DocumentData> + Send + Sync>;

const WRITE_CONTEXT: &str = "incremental-write";

/// Hooks around every row the queue writes.
#[async_trait]
pub trait WriteHooks: Send + Sync {
    /// Runs after all modifiers of a document, before the storage write.
    /// A failure rejects every writer queued for that document.
    async fn pre_write(&self, _new_data: &mut DocumentData, _old_data: &DocumentData) -> Result<()> {
        Ok(())
    }

    async fn post_write(&self, _written: &DocumentData) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl WriteHooks for NoHooks {}

struct WriteEntry {
    last_known: DocumentData,
    modifier: Modifier,
    result: oneshot::Sender<Result<DocumentData>>,
}

impl WriteEntry {
    fn settle(self, result: Result<DocumentData>) {
        // the caller may have stopped waiting
        let _ = self.result.send(result);
    }
}

#[derive(Default)]
struct QueueState {
    queue: HashMap<String, Vec<WriteEntry>>,
    is_running: bool,
}

struct QueueInner {
    storage: Arc<dyn StorageInstance>,
    primary_path: String,
    hooks: Arc<dyn WriteHooks>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct IncrementalWriteQueue {
    inner: Arc<QueueInner>,
}

impl IncrementalWriteQueue {
    pub fn new(storage: Arc<dyn StorageInstance>, primary_path: &str, hooks: Arc<dyn WriteHooks>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                storage,
                primary_path: primary_path.to_string(),
                hooks,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queue `modifier` for the document `last_known` identifies and wait
    /// for the state that ends up written.
    pub async fn add_write(&self, last_known: DocumentData, modifier: Modifier) -> Result<DocumentData> {
        let id = document::require_primary_key(&last_known, &self.inner.primary_path)?;
        revision::revision_height(&last_known)?;

        let (tx, rx) = oneshot::channel();
        let start = {
            let mut state = self.inner.state.lock();
            state.queue.entry(id).or_default().push(WriteEntry {
                last_known,
                modifier,
                result: tx,
            });
            !std::mem::replace(&mut state.is_running, true)
        };
        if start {
            tokio::spawn(Arc::clone(&self.inner).run());
        }
        rx.await
            .map_err(|_| Error::Closed("incremental write queue".to_string()))?
    }

    /// Number of documents with queued writes.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

/// Owned by the cycle loop. Clears `is_running` however the loop ends, and
/// hands over to a new loop when entries are still queued.
struct RunningGuard(Arc<QueueInner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        if state.queue.is_empty() {
            state.is_running = false;
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(state);
                if std::thread::panicking() {
                    warn!("incremental write cycle panicked, restarting");
                }
                handle.spawn(Arc::clone(&self.0).run());
            }
            Err(_) => state.is_running = false,
        }
    }
}

impl QueueInner {
    async fn run(self: Arc<Self>) {
        let _running = RunningGuard(Arc::clone(&self));
        loop {
            let batch = {
                let mut state = self.state.lock();
                if state.queue.is_empty() {
                    return;
                }
                std::mem::take(&mut state.queue)
            };
            self.process(batch).await;
        }
    }

    async fn process(&self, batch: HashMap<String, Vec<WriteEntry>>) {
        let mut rows = Vec::with_capacity(batch.len());
        let mut waiting: HashMap<String, Vec<WriteEntry>> = HashMap::with_capacity(batch.len());

        for (id, entries) in batch {
            let Some((row, entries)) = self.build_row(&id, entries).await else {
                continue;
            };
            rows.push(row);
            waiting.insert(id, entries);
        }
        if rows.is_empty() {
            return;
        }

        debug!(rows = rows.len(), "incremental write cycle");
        let response = match self.storage.bulk_write(rows, WRITE_CONTEXT).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "incremental bulk write failed");
                for entry in waiting.into_values().flatten() {
                    entry.settle(Err(err.clone()));
                }
                return;
            }
        };

        for written in response.success {
            let Some(id) = document::primary_key(&written, &self.primary_path) else {
                continue;
            };
            let Some(entries) = waiting.remove(&id) else {
                continue;
            };
            let result = self.hooks.post_write(&written).await.map(|_| written);
            for entry in entries {
                entry.settle(result.clone());
            }
        }

        let mut retry = Vec::new();
        for err in response.error {
            let Some(entries) = waiting.remove(&err.document_id) else {
                continue;
            };
            match &err.document_in_db {
                Some(in_db) if err.status == WriteErrorStatus::Conflict => {
                    debug!(document_id = %err.document_id, "incremental write conflict, retrying");
                    let entries = entries
                        .into_iter()
                        .map(|mut e| {
                            e.last_known = in_db.clone();
                            e
                        })
                        .collect::<Vec<_>>();
                    retry.push((err.document_id.clone(), entries));
                }
                _ => {
                    let failure = Error::from_write_error(&err);
                    warn!(error = %failure, "incremental write rejected");
                    for entry in entries {
                        entry.settle(Err(failure.clone()));
                    }
                }
            }
        }

        if !retry.is_empty() {
            let mut state = self.state.lock();
            for (id, mut entries) in retry {
                // retried entries keep their place ahead of newer arrivals
                if let Some(newer) = state.queue.remove(&id) {
                    entries.extend(newer);
                }
                state.queue.insert(id, entries);
            }
        }

        for (id, entries) in waiting {
            let failure = Error::Storage(format!("bulk write returned no result for '{id}'"));
            for entry in entries {
                entry.settle(Err(failure.clone()));
            }
        }
    }

    /// Fold one document's modifiers into a write row. Entries whose
    /// modifier failed are rejected here and left out.
    async fn build_row(&self, id: &str, entries: Vec<WriteEntry>) -> Option<(BulkWriteRow, Vec<WriteEntry>)> {
        let base = entries
            .iter()
            .map(|e| &e.last_known)
            .max_by_key(|d| revision::revision_height(d).unwrap_or(0))?
            .clone();

        let mut current = base.clone();
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let modified = panic::catch_unwind(AssertUnwindSafe(|| (entry.modifier)(current.clone())))
                .unwrap_or_else(|_| Err(Error::Modifier(format!("modifier for '{id}' panicked"))));
            match modified.and_then(|next| keep_reserved(next, &base)) {
                Ok(next) => {
                    current = next;
                    kept.push(entry);
                }
                Err(err) => entry.settle(Err(err)),
            }
        }
        if kept.is_empty() {
            return None;
        }

        if let Err(err) = self.hooks.pre_write(&mut current, &base).await {
            let failure = match err {
                Error::PreWrite { .. } => err,
                other => Error::PreWrite {
                    document_id: id.to_string(),
                    message: other.to_string(),
                },
            };
            for entry in kept {
                entry.settle(Err(failure.clone()));
            }
            return None;
        }

        Some((
            BulkWriteRow {
                previous: Some(base),
                document: current,
            },
            kept,
        ))
    }
}

/// Modifiers work on user data; reserved fields they drop are carried over.
fn keep_reserved(mut next: DocumentData, base: &DocumentData) -> Result<DocumentData> {
    let obj = document::as_object_mut(&mut next)?;
    for field in [REV_FIELD, META_FIELD, ATTACHMENTS_FIELD, DELETED_FIELD] {
        if !obj.contains_key(field) {
            if let Some(value) = base.get(field) {
                obj.insert(field.to_string(), value.clone());
            }
        }
    }
    Ok(next)
}
