use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::document::{self, DocumentData};

/// Type of mutation that triggered the change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

/// What the emitter knows about the state before the change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PreviousDocument {
    /// The document did not exist.
    None,
    Known(DocumentData),
    /// A prior state existed but the emitter did not carry it.
    Unknown,
}

impl PreviousDocument {
    pub fn as_known(&self) -> Option<&DocumentData> {
        match self {
            PreviousDocument::Known(data) => Some(data),
            _ => None,
        }
    }
}

/// One document state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub document_id: String,
    pub operation: OperationType,
    /// State after the change; for deletes this is the tombstone.
    pub document_data: Option<DocumentData>,
    pub previous_document_data: PreviousDocument,
}

impl ChangeEvent {
    pub fn insert(document_id: &str, data: DocumentData) -> Self {
        Self {
            document_id: document_id.to_string(),
            operation: OperationType::Insert,
            document_data: Some(data),
            previous_document_data: PreviousDocument::None,
        }
    }

    pub fn update(document_id: &str, data: DocumentData, previous: PreviousDocument) -> Self {
        Self {
            document_id: document_id.to_string(),
            operation: OperationType::Update,
            document_data: Some(data),
            previous_document_data: previous,
        }
    }

    pub fn delete(document_id: &str, tombstone: Option<DocumentData>, previous: DocumentData) -> Self {
        Self {
            document_id: document_id.to_string(),
            operation: OperationType::Delete,
            document_data: tombstone,
            previous_document_data: PreviousDocument::Known(previous),
        }
    }

    /// Build the event a write from `previous` to `document` produces.
    pub fn from_write(document_id: &str, previous: Option<&DocumentData>, document: &DocumentData) -> Self {
        let previous_deleted = previous.is_none_or(document::is_deleted);
        match (previous_deleted, document::is_deleted(document)) {
            (true, false) => ChangeEvent {
                document_id: document_id.to_string(),
                operation: OperationType::Insert,
                document_data: Some(document.clone()),
                previous_document_data: previous
                    .cloned()
                    .map(PreviousDocument::Known)
                    .unwrap_or(PreviousDocument::None),
            },
            (false, false) => ChangeEvent::update(
                document_id,
                document.clone(),
                previous.cloned().map(PreviousDocument::Known).unwrap_or(PreviousDocument::Unknown),
            ),
            (_, true) => ChangeEvent {
                document_id: document_id.to_string(),
                operation: OperationType::Delete,
                document_data: Some(document.clone()),
                previous_document_data: previous
                    .cloned()
                    .map(PreviousDocument::Known)
                    .unwrap_or(PreviousDocument::None),
            },
        }
    }

    /// Resulting state, falling back to the previous one for deletes
    /// that carry no tombstone.
    pub fn latest_data(&self) -> Option<&DocumentData> {
        self.document_data
            .as_ref()
            .or_else(|| self.previous_document_data.as_known())
    }

    fn dedup_key(&self) -> (String, Option<String>, Option<String>) {
        let new_rev = self
            .document_data
            .as_ref()
            .and_then(document::revision)
            .map(str::to_string);
        let prev_rev = self
            .previous_document_data
            .as_known()
            .and_then(document::revision)
            .map(str::to_string);
        (self.document_id.clone(), new_rev, prev_rev)
    }
}

/// A batch of change events produced by one storage write.
#[derive(Debug, Clone, Serialize)]
pub struct EventBulk {
    pub id: String,
    pub collection: String,
    pub events: Vec<ChangeEvent>,
    pub checkpoint: Value,
    pub context: String,
    pub start_time: i64,
    pub end_time: i64,
    /// Bulk concerns instance-local documents that are never replicated;
    /// query buffers ignore these.
    pub is_local: bool,
}

/// Random id for a new event bulk.
pub fn event_bulk_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}

/// Flatten bulks into one ordered event list, dropping repeats of the
/// same `(document id, new revision, previous revision)` transition.
pub fn flatten_events<'a, I>(bulks: I) -> Vec<ChangeEvent>
where
    I: IntoIterator<Item = &'a EventBulk>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for bulk in bulks {
        for event in &bulk.events {
            if seen.insert(event.dedup_key()) {
                out.push(event.clone());
            }
        }
    }
    out
}

/// Everything taken off a subscription in one drain.
#[derive(Debug, Default)]
pub struct Drained {
    pub bulks: Vec<Arc<EventBulk>>,
    /// Number of bulks the channel overwrote before we could read them.
    pub lagged: u64,
}

/// Non-blocking handle on a storage change stream. Drained synchronously by
/// its owner; dropped on close, which unsubscribes from the channel.
pub struct BulkSubscription {
    rx: Mutex<Option<broadcast::Receiver<Arc<EventBulk>>>>,
}

impl BulkSubscription {
    pub fn new(rx: broadcast::Receiver<Arc<EventBulk>>) -> Self {
        Self {
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn drain(&self) -> Drained {
        let mut drained = Drained::default();
        let mut guard = self.rx.lock();
        let Some(rx) = guard.as_mut() else {
            return drained;
        };
        loop {
            match rx.try_recv() {
                Ok(bulk) => drained.bulks.push(bulk),
                Err(TryRecvError::Lagged(n)) => drained.lagged += n,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => {
                    *guard = None;
                    break;
                }
            }
        }
        drained
    }

    pub fn close(&self) {
        self.rx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.rx.lock().is_none()
    }
}
