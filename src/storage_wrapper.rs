//! Write coordinator in front of a storage instance.
//!
//! Every row gets a fresh `_rev` derived from the database token and the
//! previous revision, and a new `_meta.lwt`. Inserts that collide with a
//! tombstone are retried as updates of that tombstone. All calls are tracked
//! by the database's [`IdleQueue`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use tracing::debug;

use crate::change_event::EventBulk;
use crate::conflict::{ConflictResolutionTask, ConflictResolutionTaskSolution};
use crate::document::{self, ATTACHMENTS_FIELD, DELETED_FIELD, DocumentData, META_FIELD, REV_FIELD};
use crate::error::{Error, Result};
use crate::idle_queue::IdleQueue;
use crate::query::PreparedQuery;
use crate::revision;
use crate::storage::{BulkWriteResponse, BulkWriteRow, StorageInstance, WriteError, WriteErrorStatus};

pub struct WrappedStorage {
    inner: Arc<dyn StorageInstance>,
    token: String,
    idle: Arc<IdleQueue>,
    dev_mode: bool,
}

impl WrappedStorage {
    pub fn new(inner: Arc<dyn StorageInstance>, token: &str, idle: Arc<IdleQueue>, dev_mode: bool) -> Self {
        Self {
            inner,
            token: token.to_string(),
            idle,
            dev_mode,
        }
    }

    pub fn inner(&self) -> &Arc<dyn StorageInstance> {
        &self.inner
    }

    /// Stamp revision and write time onto a row.
    fn prepare_row(&self, row: BulkWriteRow) -> Result<BulkWriteRow> {
        let BulkWriteRow { previous, mut document } = row;
        let primary_path = self.inner.primary_path();
        if self.dev_mode {
            self.check_row(previous.as_ref(), &document, primary_path)?;
        } else {
            document::require_primary_key(&document, primary_path)?;
        }

        let rev = revision::create_revision(&self.token, previous.as_ref())?;
        let obj = document::as_object_mut(&mut document)?;

        // fields set by the new state win, the rest of the previous meta stays
        let mut meta = previous
            .as_ref()
            .and_then(|p| p.get(META_FIELD))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(Value::Object(new_meta)) = obj.get(META_FIELD) {
            meta.extend(new_meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        meta.insert("lwt".to_string(), json!(revision::now_lwt()));
        obj.insert(META_FIELD.to_string(), Value::Object(meta));

        obj.entry(DELETED_FIELD).or_insert(Value::Bool(false));
        obj.entry(ATTACHMENTS_FIELD)
            .or_insert_with(|| Value::Object(Map::new()));
        obj.insert(REV_FIELD.to_string(), Value::String(rev));

        Ok(BulkWriteRow { previous, document })
    }

    /// Development checks: stable primary key and growing revision height.
    fn check_row(&self, previous: Option<&DocumentData>, document: &DocumentData, primary_path: &str) -> Result<()> {
        let id = document::require_primary_key(document, primary_path)?;
        let Some(previous) = previous else {
            return Ok(());
        };
        let previous_id = document::require_primary_key(previous, primary_path)?;
        if previous_id != id {
            return Err(Error::PrimaryKeyChanged {
                previous: previous_id,
                current: id,
            });
        }
        let previous_height = revision::revision_height(previous)?;
        // a revision the caller set itself must not go backwards
        if let Some(rev) = document::revision(document) {
            if Some(rev) != document::revision(previous) {
                let height = revision::parse_revision(rev)?.0;
                if height <= previous_height {
                    return Err(Error::RevisionNotIncreasing {
                        document_id: id,
                        previous: previous_height,
                        current: height,
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_rows(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse> {
        let prepared = rows
            .into_iter()
            .map(|row| self.prepare_row(row))
            .collect::<Result<Vec<_>>>()?;
        let mut response = self.inner.bulk_write(prepared, context).await?;

        let (reinserts, errors): (Vec<WriteError>, Vec<WriteError>) =
            response.error.into_iter().partition(is_tombstone_reinsert);
        response.error = errors;
        if reinserts.is_empty() {
            return Ok(response);
        }

        debug!(rows = reinserts.len(), "re-inserting over tombstones");
        let retry = reinserts
            .into_iter()
            .map(|err| {
                let mut document = err.write_row.document;
                if let Some(obj) = document.as_object_mut() {
                    obj.remove(REV_FIELD);
                }
                self.prepare_row(BulkWriteRow {
                    previous: err.document_in_db,
                    document,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let second = self.inner.bulk_write(retry, context).await?;
        response.success.extend(second.success);
        response.error.extend(second.error);
        Ok(response)
    }
}

/// A 409 for a row written as new while storage holds a deleted state.
fn is_tombstone_reinsert(err: &WriteError) -> bool {
    err.status == WriteErrorStatus::Conflict
        && err.write_row.previous.is_none()
        && !document::is_deleted(&err.write_row.document)
        && err.document_in_db.as_ref().is_some_and(document::is_deleted)
}

#[async_trait]
impl StorageInstance for WrappedStorage {
    fn collection_name(&self) -> &str {
        self.inner.collection_name()
    }

    fn primary_path(&self) -> &str {
        self.inner.primary_path()
    }

    async fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse> {
        self.idle.wrap_call(self.write_rows(rows, context)).await
    }

    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        self.idle.wrap_call(self.inner.query(query)).await
    }

    async fn count(&self, query: &PreparedQuery) -> Result<usize> {
        self.idle.wrap_call(self.inner.count(query)).await
    }

    async fn find_documents_by_id(&self, ids: &[String], with_deleted: bool) -> Result<Vec<DocumentData>> {
        self.idle
            .wrap_call(self.inner.find_documents_by_id(ids, with_deleted))
            .await
    }

    fn change_stream(&self) -> broadcast::Receiver<Arc<EventBulk>> {
        self.inner.change_stream()
    }

    fn conflict_resolution_tasks(&self) -> broadcast::Receiver<ConflictResolutionTask> {
        self.inner.conflict_resolution_tasks()
    }

    async fn resolve_conflict_resolution_task(&self, solution: ConflictResolutionTaskSolution) -> Result<()> {
        self.idle
            .wrap_call(self.inner.resolve_conflict_resolution_task(solution))
            .await
    }

    async fn cleanup(&self, min_deleted_time_ms: f64) -> Result<bool> {
        self.idle.wrap_call(self.inner.cleanup(min_deleted_time_ms)).await
    }

    async fn close(&self) -> Result<()> {
        self.idle.wrap_call(self.inner.close()).await
    }

    async fn remove(&self) -> Result<()> {
        self.idle.wrap_call(self.inner.remove()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::storage::StorageInstanceParams;

    fn setup(dev_mode: bool) -> WrappedStorage {
        let params = StorageInstanceParams {
            database_name: "db".into(),
            collection_name: "users".into(),
            primary_path: "id".into(),
            database_token: "tok".into(),
            multi_instance: false,
            change_stream_capacity: 16,
        };
        WrappedStorage::new(Arc::new(MemoryStorage::new().open(params)), "tok", IdleQueue::new(), dev_mode)
    }

    fn row(previous: Option<Value>, document: Value) -> BulkWriteRow {
        BulkWriteRow { previous, document }
    }

    #[tokio::test]
    async fn stamps_revision_and_write_time() {
        let storage = setup(true);
        let res = storage
            .bulk_write(vec![row(None, json!({"id": "a", "name": "x"}))], "test")
            .await
            .unwrap();
        let v1 = &res.success[0];
        assert_eq!(revision::revision_height(v1).unwrap(), 1);
        assert_eq!(v1["_deleted"], false);
        assert!(document::last_write_time(v1).is_some());

        let mut next = v1.clone();
        next["name"] = json!("y");
        let res = storage.bulk_write(vec![row(Some(v1.clone()), next)], "test").await.unwrap();
        let v2 = &res.success[0];
        assert_eq!(revision::revision_height(v2).unwrap(), 2);
        assert!(document::last_write_time(v2) > document::last_write_time(v1));
    }

    #[tokio::test]
    async fn merges_meta_with_previous_state() {
        let storage = setup(true);
        let v1 = storage
            .bulk_write(vec![row(None, json!({"id": "a", "_meta": {"origin": "peer", "lwt": 1.0}}))], "test")
            .await
            .unwrap()
            .success
            .remove(0);
        let update = json!({"id": "a", "_meta": {"synced": true}});
        let v2 = storage
            .bulk_write(vec![row(Some(v1), update)], "test")
            .await
            .unwrap()
            .success
            .remove(0);
        assert_eq!(v2["_meta"]["origin"], "peer");
        assert_eq!(v2["_meta"]["synced"], true);
        assert!(v2["_meta"]["lwt"].as_f64().unwrap() > 1.0);
    }

    #[tokio::test]
    async fn reinsert_over_tombstone_becomes_update() {
        let storage = setup(true);
        let v1 = storage
            .bulk_write(vec![row(None, json!({"id": "a", "name": "x"}))], "test")
            .await
            .unwrap()
            .success
            .remove(0);
        let mut gone = v1.clone();
        gone["_deleted"] = json!(true);
        storage.bulk_write(vec![row(Some(v1), gone)], "test").await.unwrap();

        let res = storage
            .bulk_write(vec![row(None, json!({"id": "a", "name": "again"}))], "test")
            .await
            .unwrap();
        assert!(res.error.is_empty());
        assert_eq!(res.success[0]["name"], "again");
        assert_eq!(revision::revision_height(&res.success[0]).unwrap(), 3);
    }

    #[tokio::test]
    async fn insert_over_live_document_still_conflicts() {
        let storage = setup(true);
        storage
            .bulk_write(vec![row(None, json!({"id": "a"}))], "test")
            .await
            .unwrap();
        let res = storage
            .bulk_write(vec![row(None, json!({"id": "a"}))], "test")
            .await
            .unwrap();
        assert_eq!(res.error.len(), 1);
        assert!(Error::from_write_error(&res.error[0]).is_conflict());
    }

    #[tokio::test]
    async fn dev_mode_checks() {
        let storage = setup(true);
        let v1 = storage
            .bulk_write(vec![row(None, json!({"id": "a"}))], "test")
            .await
            .unwrap()
            .success
            .remove(0);

        let moved = json!({"id": "b", "_rev": v1["_rev"].clone()});
        let err = storage.bulk_write(vec![row(Some(v1.clone()), moved)], "test").await.unwrap_err();
        assert!(matches!(err, Error::PrimaryKeyChanged { .. }));

        let stale = json!({"id": "a", "_rev": "1-zzz"});
        let err = storage.bulk_write(vec![row(Some(v1), stale)], "test").await.unwrap_err();
        assert!(matches!(err, Error::RevisionNotIncreasing { .. }));

        let err = storage.bulk_write(vec![row(None, json!({"name": "x"}))], "test").await.unwrap_err();
        assert!(matches!(err, Error::MissingPrimaryKey { .. }));
    }
}
