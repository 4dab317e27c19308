//! Boundary to the storage engine.
//!
//! The engine owns durability, indexing and query execution. The core only
//! relies on the operations below; [`crate::memory`] provides an in-process
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::change_event::EventBulk;
use crate::conflict::{ConflictResolutionTask, ConflictResolutionTaskSolution};
use crate::document::DocumentData;
use crate::error::Result;
use crate::query::PreparedQuery;

/// One row of a bulk write. `previous` is the state the writer based its
/// change on; `None` means "insert".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkWriteRow {
    pub previous: Option<DocumentData>,
    pub document: DocumentData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriteErrorStatus {
    Conflict,
    Validation,
    AttachmentMissing,
}

impl WriteErrorStatus {
    pub fn code(self) -> u16 {
        match self {
            WriteErrorStatus::Conflict => 409,
            WriteErrorStatus::Validation => 422,
            WriteErrorStatus::AttachmentMissing => 510,
        }
    }
}

/// Per-row failure reported by `bulk_write`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteError {
    pub status: WriteErrorStatus,
    pub document_id: String,
    pub write_row: BulkWriteRow,
    /// Current stored state; always set for conflicts on existing documents.
    pub document_in_db: Option<DocumentData>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkWriteResponse {
    pub success: Vec<DocumentData>,
    pub error: Vec<WriteError>,
}

/// Parameters for opening one collection's storage instance.
#[derive(Debug, Clone)]
pub struct StorageInstanceParams {
    pub database_name: String,
    pub collection_name: String,
    pub primary_path: String,
    pub database_token: String,
    pub multi_instance: bool,
    /// Capacity of the change-stream broadcast channel.
    pub change_stream_capacity: usize,
}

/// One collection's view of the storage engine.
#[async_trait]
pub trait StorageInstance: Send + Sync {
    fn collection_name(&self) -> &str;

    fn primary_path(&self) -> &str;

    async fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse>;

    /// Matching, non-deleted documents in query order with skip/limit applied.
    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>>;

    async fn count(&self, query: &PreparedQuery) -> Result<usize>;

    async fn find_documents_by_id(&self, ids: &[String], with_deleted: bool) -> Result<Vec<DocumentData>>;

    /// Ordered bulks of change events, one per accepted write.
    fn change_stream(&self) -> broadcast::Receiver<Arc<EventBulk>>;

    fn conflict_resolution_tasks(&self) -> broadcast::Receiver<ConflictResolutionTask>;

    async fn resolve_conflict_resolution_task(&self, solution: ConflictResolutionTaskSolution) -> Result<()>;

    /// Purge tombstones older than `min_deleted_time_ms`. Returns true when
    /// nothing is left to clean.
    async fn cleanup(&self, min_deleted_time_ms: f64) -> Result<bool>;

    async fn close(&self) -> Result<()>;

    /// Delete all data of this instance and close it.
    async fn remove(&self) -> Result<()>;
}

/// Factory for storage instances.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    async fn create_storage_instance(&self, params: StorageInstanceParams) -> Result<Arc<dyn StorageInstance>>;
}
