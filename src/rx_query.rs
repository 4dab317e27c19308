//! Live queries.
//!
//! An [`RxQuery`] remembers its last result together with the event-buffer
//! position that result reflects. Executing it again first tries to
//! reconcile the result from the events since that position and only asks
//! storage when reconciliation is impossible.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast::error::RecvError, broadcast::error::TryRecvError, watch};
use tracing::{debug, warn};

use crate::collection::Collection;
use crate::doc_cache::RxDocument;
use crate::document::{self, DocumentData};
use crate::error::{Error, Result};
use crate::event_reduce::{QueryParams, ReduceResult, calculate_new_count, calculate_new_results};
use crate::query::{MangoQuery, PreparedQuery};

/// Full-query attempts before a result is kept without a buffer position.
const MAX_STABLE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Find,
    FindOne,
    Count,
}

#[derive(Debug, Clone)]
pub enum QueryResult {
    Documents(Vec<RxDocument>),
    Document(Option<RxDocument>),
    Count(usize),
}

impl QueryResult {
    /// Documents of a find or find-one result; empty for counts.
    pub fn documents(&self) -> Vec<RxDocument> {
        match self {
            QueryResult::Documents(docs) => docs.clone(),
            QueryResult::Document(doc) => doc.iter().cloned().collect(),
            QueryResult::Count(_) => Vec::new(),
        }
    }

    pub fn document(&self) -> Option<&RxDocument> {
        match self {
            QueryResult::Documents(docs) => docs.first(),
            QueryResult::Document(doc) => doc.as_ref(),
            QueryResult::Count(_) => None,
        }
    }

    /// Number of results, or the count of a count query.
    pub fn count(&self) -> usize {
        match self {
            QueryResult::Documents(docs) => docs.len(),
            QueryResult::Document(doc) => usize::from(doc.is_some()),
            QueryResult::Count(n) => *n,
        }
    }
}

/// Results are equal when they hold the same documents at the same revisions.
impl PartialEq for QueryResult {
    fn eq(&self, other: &Self) -> bool {
        let same_docs = |a: &[RxDocument], b: &[RxDocument]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id() == y.id() && x.revision() == y.revision())
        };
        match (self, other) {
            (QueryResult::Documents(a), QueryResult::Documents(b)) => same_docs(a, b),
            (QueryResult::Document(a), QueryResult::Document(b)) => {
                same_docs(a.as_slice(), b.as_slice())
            }
            (QueryResult::Count(a), QueryResult::Count(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Clone)]
struct Snapshot {
    docs: Vec<DocumentData>,
    count: usize,
    /// Buffer position the snapshot reflects; `None` forces a requery.
    pointer: Option<u64>,
}

struct QueryInner {
    collection: Collection,
    op: QueryOp,
    params: QueryParams,
    state: Mutex<Option<Snapshot>>,
    exec_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct RxQuery {
    inner: Arc<QueryInner>,
}

impl RxQuery {
    pub(crate) fn new(collection: Collection, op: QueryOp, query: MangoQuery) -> Result<Self> {
        let query = match op {
            QueryOp::Find => query,
            QueryOp::FindOne => query.limit(1),
            QueryOp::Count => {
                if query.skip > 0 || query.limit.is_some() {
                    return Err(Error::InvalidQuery("count queries take no skip or limit".into()));
                }
                query
            }
        };
        let prepared = Arc::new(PreparedQuery::new(collection.primary_path(), query)?);
        Ok(Self {
            inner: Arc::new(QueryInner {
                collection,
                op,
                params: QueryParams::new(prepared),
                state: Mutex::new(None),
                exec_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn op(&self) -> QueryOp {
        self.inner.op
    }

    pub fn params(&self) -> &QueryParams {
        &self.inner.params
    }

    pub async fn exec(&self) -> Result<QueryResult> {
        Ok(self.exec_tracked().await?.0)
    }

    /// Execute and report whether the result differs from the previous one.
    async fn exec_tracked(&self) -> Result<(QueryResult, bool)> {
        let _running = self.inner.exec_lock.lock().await;
        let collection = &self.inner.collection;
        if collection.is_closed() {
            return Err(Error::Closed(format!("collection '{}'", collection.name())));
        }

        let previous = self.inner.state.lock().clone();
        let reduced = previous
            .as_ref()
            .and_then(|snapshot| self.reconcile(snapshot));
        let (snapshot, changed) = match reduced {
            Some(reduced) => reduced,
            None => {
                let snapshot = self.run_full_query().await?;
                let changed = previous.as_ref().is_none_or(|p| !self.same_result(p, &snapshot));
                (snapshot, changed)
            }
        };

        let result = self.to_result(&snapshot)?;
        *self.inner.state.lock() = Some(snapshot);
        Ok((result, changed))
    }

    /// Try to bring `snapshot` up to date from buffered events.
    fn reconcile(&self, snapshot: &Snapshot) -> Option<(Snapshot, bool)> {
        let collection = &self.inner.collection;
        let pointer = snapshot.pointer?;
        let Some(events) = collection.buffer().get_from(pointer) else {
            debug!(pointer, "query pointer evicted from event buffer");
            return None;
        };
        if events.is_empty() {
            return Some((snapshot.clone(), false));
        }
        let pointer = Some(pointer + events.len() as u64);
        let params = &self.inner.params;

        if self.inner.op == QueryOp::Count {
            let count = calculate_new_count(params, snapshot.count, &events, collection.event_reduce())?;
            return Some((
                Snapshot {
                    docs: Vec::new(),
                    count,
                    pointer,
                },
                count != snapshot.count,
            ));
        }
        match calculate_new_results(params, &snapshot.docs, &events, collection.event_reduce()) {
            ReduceResult::Computed { changed, new_results } => Some((
                Snapshot {
                    count: new_results.len(),
                    docs: new_results,
                    pointer,
                },
                changed,
            )),
            ReduceResult::RunFullQueryAgain => None,
        }
    }

    /// Query storage. The snapshot only gets a buffer position when no event
    /// arrived while storage was being read, so it reflects exactly the
    /// events up to that position.
    async fn run_full_query(&self) -> Result<Snapshot> {
        let collection = &self.inner.collection;
        let storage = collection.storage();
        let prepared = self.inner.params.query();

        let mut attempt = 1;
        loop {
            let before = collection.buffer().get_counter();
            let (docs, count) = if self.inner.op == QueryOp::Count {
                (Vec::new(), storage.count(prepared).await?)
            } else {
                let docs = storage.query(prepared).await?;
                let count = docs.len();
                (docs, count)
            };
            let after = collection.buffer().get_counter();
            if before == after {
                return Ok(Snapshot {
                    docs,
                    count,
                    pointer: Some(before),
                });
            }
            if attempt == MAX_STABLE_ATTEMPTS {
                debug!(attempts = attempt, "writes kept racing the query, result not pinned");
                return Ok(Snapshot {
                    docs,
                    count,
                    pointer: None,
                });
            }
            attempt += 1;
        }
    }

    fn same_result(&self, a: &Snapshot, b: &Snapshot) -> bool {
        if self.inner.op == QueryOp::Count {
            return a.count == b.count;
        }
        let primary = &self.inner.params.primary_key;
        a.docs.len() == b.docs.len()
            && a.docs.iter().zip(&b.docs).all(|(x, y)| {
                document::get_field(x, primary) == document::get_field(y, primary)
                    && document::revision(x) == document::revision(y)
            })
    }

    fn to_result(&self, snapshot: &Snapshot) -> Result<QueryResult> {
        let cache = self.inner.collection.cache();
        Ok(match self.inner.op {
            QueryOp::Find => QueryResult::Documents(cache.get_cached_documents(&snapshot.docs)?),
            QueryOp::FindOne => QueryResult::Document(
                snapshot
                    .docs
                    .first()
                    .map(|d| cache.get_cached_document(d))
                    .transpose()?,
            ),
            QueryOp::Count => QueryResult::Count(snapshot.count),
        })
    }

    /// Follow the query. The receiver holds the current result and sees a
    /// new one whenever a change alters it. The background task stops when
    /// every receiver is dropped or the collection closes.
    pub async fn watch(&self) -> Result<watch::Receiver<QueryResult>> {
        let collection = &self.inner.collection;
        let mut events = collection.event_bulks();
        let mut closed = collection.closed_signal();
        let initial = self.exec().await?;
        let (tx, rx) = watch::channel(initial);

        let query = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = closed.changed() => break,
                    received = events.recv() => match received {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
                tokio::task::yield_now().await;
                // one execution covers every bulk that arrived meanwhile
                while !matches!(events.try_recv(), Err(TryRecvError::Empty | TryRecvError::Closed)) {}

                // a direct exec may already have advanced the query state
                match query.exec().await {
                    Ok(result) => {
                        tx.send_if_modified(|current| {
                            if *current == result {
                                return false;
                            }
                            *current = result;
                            true
                        });
                    }
                    Err(Error::Closed(_)) => break,
                    Err(err) => warn!(error = %err, "live query update failed"),
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionOptions, DatabaseOptions};
    use crate::database::Database;
    use crate::memory::MemoryStorage;
    use crate::query::SortOrder;
    use serde_json::json;
    use std::time::Duration;

    async fn users(event_reduce: bool) -> (Database, Collection) {
        let mut options = DatabaseOptions::new("test");
        options.event_reduce = event_reduce;
        let db = Database::create(Arc::new(MemoryStorage::new()), options).unwrap();
        let users = db.add_collection("users", CollectionOptions::default()).await.unwrap();
        (db, users)
    }

    fn ids(result: &QueryResult) -> Vec<String> {
        result.documents().iter().map(|d| d.id().to_string()).collect()
    }

    fn by_age() -> MangoQuery {
        MangoQuery::new(json!({"age": {"$gte": 18}})).sort_by("age", SortOrder::Asc)
    }

    #[tokio::test]
    async fn reexec_reconciles_from_events() {
        let (_db, users) = users(true).await;
        users.insert(json!({"id": "a", "age": 20})).await.unwrap();
        users.insert(json!({"id": "b", "age": 30})).await.unwrap();
        let query = users.find(by_age()).unwrap();
        assert_eq!(ids(&query.exec().await.unwrap()), vec!["a", "b"]);

        users.insert(json!({"id": "c", "age": 25})).await.unwrap();
        users.insert(json!({"id": "kid", "age": 5})).await.unwrap();
        let (result, changed) = query.exec_tracked().await.unwrap();
        assert!(changed);
        assert_eq!(ids(&result), vec!["a", "c", "b"]);

        let (_, changed) = query.exec_tracked().await.unwrap();
        assert!(!changed);
    }

    #[tokio::test]
    async fn results_share_cached_documents() {
        let (_db, users) = users(true).await;
        let inserted = users.insert(json!({"id": "a", "age": 20})).await.unwrap();
        let found = users.find_one(by_age()).unwrap().exec().await.unwrap();
        assert!(Arc::ptr_eq(&inserted, found.document().unwrap()));
    }

    #[tokio::test]
    async fn disabled_reduce_still_tracks_changes() {
        let (_db, users) = users(false).await;
        let query = users.find(by_age().limit(1)).unwrap();
        assert!(query.exec().await.unwrap().documents().is_empty());
        users.insert(json!({"id": "a", "age": 40})).await.unwrap();
        users.insert(json!({"id": "b", "age": 20})).await.unwrap();
        let (result, changed) = query.exec_tracked().await.unwrap();
        assert!(changed);
        assert_eq!(ids(&result), vec!["b"]);
    }

    #[tokio::test]
    async fn count_follows_matching_writes() {
        let (_db, users) = users(true).await;
        let count = users.count(MangoQuery::new(json!({"age": {"$gte": 18}}))).unwrap();
        assert_eq!(count.exec().await.unwrap().count(), 0);

        let a = users.insert(json!({"id": "a", "age": 20})).await.unwrap();
        users.insert(json!({"id": "b", "age": 3})).await.unwrap();
        assert_eq!(count.exec().await.unwrap().count(), 1);

        users.incremental_remove(&a).await.unwrap();
        assert_eq!(count.exec().await.unwrap().count(), 0);

        assert!(matches!(
            users.count(MangoQuery::default().limit(3)),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn evicted_pointer_falls_back_to_storage() {
        let mut options = DatabaseOptions::new("test");
        options.event_buffer_size = 2;
        let db = Database::create(Arc::new(MemoryStorage::new()), options).unwrap();
        let users = db.add_collection("users", CollectionOptions::default()).await.unwrap();
        let query = users.find(by_age()).unwrap();
        query.exec().await.unwrap();
        for i in 0..5 {
            users.insert(json!({"id": format!("u{i}"), "age": 20 + i})).await.unwrap();
        }
        let result = query.exec().await.unwrap();
        assert_eq!(ids(&result), vec!["u0", "u1", "u2", "u3", "u4"]);
    }

    #[tokio::test]
    async fn watch_emits_changed_results() {
        let (_db, users) = users(true).await;
        let query = users.find(by_age()).unwrap();
        let mut rx = query.watch().await.unwrap();
        assert!(rx.borrow().documents().is_empty());

        let a = users.insert(json!({"id": "a", "age": 20})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert_eq!(ids(&rx.borrow_and_update()), vec!["a"]);

        users.incremental_patch(&a, json!({"age": 10})).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap().unwrap();
        assert!(rx.borrow_and_update().documents().is_empty());
    }

    #[tokio::test]
    async fn watch_ends_when_collection_closes() {
        let (_db, users) = users(true).await;
        let mut rx = users.find(by_age()).unwrap().watch().await.unwrap();
        users.close().await.unwrap();
        let ended = tokio::time::timeout(Duration::from_secs(5), rx.changed()).await.unwrap();
        assert!(ended.is_err());
        assert!(matches!(
            users.find(by_age()).unwrap().exec().await,
            Err(Error::Closed(_))
        ));
    }
}
