pub mod change_event;
pub mod collection;
pub mod config;
pub mod conflict;
pub mod database;
pub mod doc_cache;
pub mod document;
pub mod error;
pub mod event_buffer;
pub mod event_reduce;
pub mod idle_queue;
pub mod memory;
pub mod query;
pub mod revision;
pub mod rx_query;
pub mod storage;
pub mod storage_wrapper;
pub mod update;
pub mod value;
pub mod write_queue;

pub use change_event::{ChangeEvent, EventBulk, OperationType, PreviousDocument};
pub use collection::{BulkInsertResult, Collection, CollectionHandlers};
pub use config::{CollectionOptions, DatabaseOptions};
pub use conflict::{ConflictHandler, ConflictHandlerInput, ConflictHandlerOutput, DefaultConflictHandler};
pub use database::Database;
pub use doc_cache::{CachedDocument, DocumentCache, RxDocument};
pub use document::DocumentData;
pub use error::{Error, Result};
pub use event_buffer::ChangeEventBuffer;
pub use memory::MemoryStorage;
pub use query::{MangoQuery, SortOrder};
pub use rx_query::{QueryOp, QueryResult, RxQuery};
pub use storage::{Storage, StorageInstance};
pub use write_queue::{Modifier, WriteHooks};
