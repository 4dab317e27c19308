//! Bounded history of a collection's change events.
//!
//! Every buffered event gets an absolute position. Live queries remember the
//! position their results reflect and ask for everything after it; once the
//! buffer has evicted part of that range they must requery.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::change_event::{BulkSubscription, ChangeEvent, EventBulk, flatten_events};

pub const DEFAULT_BUFFER_SIZE: usize = 100;

struct BufferState {
    events: VecDeque<ChangeEvent>,
    /// Position of the newest event ever appended.
    counter: u64,
    closed: bool,
}

struct BufferInner {
    limit: usize,
    subscription: BulkSubscription,
    state: Mutex<BufferState>,
}

impl BufferInner {
    /// Append everything the change stream delivered since the last flush.
    fn flush(&self) {
        // the state lock is held while draining so appends keep stream order
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        let drained = self.subscription.drain();
        if drained.lagged > 0 {
            warn!(
                lagged = drained.lagged,
                counter = state.counter,
                "change event buffer lagged, discarding history"
            );
            // skip a position so that every pointer handed out so far is stale
            state.events.clear();
            state.counter += 1;
        }
        let events = flatten_events(drained.bulks.iter().filter(|b| !b.is_local).map(Arc::as_ref));
        let appended = events.len();
        for event in events {
            state.counter += 1;
            state.events.push_back(event);
        }
        if appended == 0 {
            return;
        }
        let overflow = state.events.len().saturating_sub(self.limit);
        state.events.drain(..overflow);
        debug!(appended, counter = state.counter, evicted = overflow, "change event buffer flush");
    }
}

pub struct ChangeEventBuffer {
    inner: Arc<BufferInner>,
    wake_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeEventBuffer {
    /// Follow `source` from its current tail, keeping at most `limit` events.
    ///
    /// Inside a tokio runtime a background task appends new bulks on the next
    /// scheduler tick, so bursts of writes are folded into one pass. Reads
    /// never depend on it: every accessor flushes first.
    pub fn new(source: &broadcast::Receiver<Arc<EventBulk>>, limit: usize) -> Self {
        let inner = Arc::new(BufferInner {
            limit,
            subscription: BulkSubscription::new(source.resubscribe()),
            state: Mutex::new(BufferState {
                events: VecDeque::with_capacity(limit.min(1024)),
                counter: 0,
                closed: false,
            }),
        });

        let wake_task = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak = Arc::downgrade(&inner);
            let mut wake = source.resubscribe();
            handle.spawn(async move {
                loop {
                    match wake.recv().await {
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    }
                    tokio::task::yield_now().await;
                    // everything that arrived in the meantime is covered by one flush
                    while !matches!(wake.try_recv(), Err(TryRecvError::Empty | TryRecvError::Closed)) {}
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    inner.flush();
                }
            })
        });

        Self {
            inner,
            wake_task: Mutex::new(wake_task),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Position of the newest buffered event; 0 before the first one.
    pub fn get_counter(&self) -> u64 {
        self.inner.flush();
        self.inner.state.lock().counter
    }

    /// Retained events, oldest first.
    pub fn get_buffer(&self) -> Vec<ChangeEvent> {
        self.inner.flush();
        self.inner.state.lock().events.iter().cloned().collect()
    }

    /// Offset of the event at `pointer` in the retained buffer, or `None`
    /// when that event was already evicted or does not exist yet.
    pub fn get_array_index_by_pointer(&self, pointer: u64) -> Option<usize> {
        self.inner.flush();
        let state = self.inner.state.lock();
        Self::index_of(&state, pointer)
    }

    fn index_of(state: &BufferState, pointer: u64) -> Option<usize> {
        if pointer > state.counter {
            return None;
        }
        let oldest = state.counter + 1 - state.events.len() as u64;
        pointer.checked_sub(oldest).map(|i| i as usize)
    }

    /// All events positioned after `pointer`, or `None` when some of them
    /// are no longer retained.
    pub fn get_from(&self, pointer: u64) -> Option<Vec<ChangeEvent>> {
        self.inner.flush();
        let state = self.inner.state.lock();
        if pointer >= state.counter {
            return Some(Vec::new());
        }
        let start = Self::index_of(&state, pointer + 1)?;
        Some(state.events.range(start..).cloned().collect())
    }

    /// Unsubscribe from the change stream and drop anything not yet appended.
    pub fn close(&self) {
        if let Some(task) = self.wake_task.lock().take() {
            task.abort();
        }
        self.inner.state.lock().closed = true;
        self.inner.subscription.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl Drop for ChangeEventBuffer {
    fn drop(&mut self) {
        if let Some(task) = self.wake_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_event::event_bulk_id;
    use serde_json::json;

    fn bulk(ids: &[&str], is_local: bool) -> Arc<EventBulk> {
        Arc::new(EventBulk {
            id: event_bulk_id(),
            collection: "users".into(),
            events: ids
                .iter()
                .map(|id| ChangeEvent::insert(id, json!({"id": id, "_rev": "1-a"})))
                .collect(),
            checkpoint: json!(null),
            context: "test".into(),
            start_time: 0,
            end_time: 0,
            is_local,
        })
    }

    fn ids(events: &[ChangeEvent]) -> Vec<&str> {
        events.iter().map(|e| e.document_id.as_str()).collect()
    }

    #[test]
    fn counts_and_reads_from_pointer() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        assert_eq!(buffer.get_counter(), 0);
        assert_eq!(buffer.get_from(0), Some(vec![]));

        tx.send(bulk(&["a", "b"], false)).unwrap();
        tx.send(bulk(&["c"], false)).unwrap();
        assert_eq!(buffer.get_counter(), 3);
        assert_eq!(ids(&buffer.get_from(0).unwrap()), vec!["a", "b", "c"]);
        assert_eq!(ids(&buffer.get_from(2).unwrap()), vec!["c"]);
        assert_eq!(buffer.get_from(3), Some(vec![]));
        assert_eq!(buffer.get_array_index_by_pointer(1), Some(0));
        assert_eq!(buffer.get_array_index_by_pointer(3), Some(2));
        assert_eq!(buffer.get_array_index_by_pointer(4), None);
    }

    #[test]
    fn redelivered_events_are_buffered_once() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        let first = bulk(&["a", "b"], false);
        tx.send(Arc::clone(&first)).unwrap();
        tx.send(first).unwrap();
        tx.send(bulk(&["c"], false)).unwrap();
        assert_eq!(ids(&buffer.get_buffer()), vec!["a", "b", "c"]);
        assert_eq!(buffer.get_counter(), 3);
    }

    #[test]
    fn evicts_oldest_beyond_limit() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 3);
        tx.send(bulk(&["a", "b", "c", "d", "e"], false)).unwrap();

        assert_eq!(ids(&buffer.get_buffer()), vec!["c", "d", "e"]);
        assert_eq!(buffer.get_counter(), 5);
        assert_eq!(buffer.get_array_index_by_pointer(2), None);
        assert_eq!(buffer.get_from(1), None);
        // events after position 2 are exactly the retained ones
        assert_eq!(ids(&buffer.get_from(2).unwrap()), vec!["c", "d", "e"]);
    }

    #[test]
    fn skips_local_bulks() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        tx.send(bulk(&["local"], true)).unwrap();
        tx.send(bulk(&["a"], false)).unwrap();
        assert_eq!(ids(&buffer.get_buffer()), vec!["a"]);
    }

    #[test]
    fn lag_invalidates_old_pointers() {
        let (tx, rx) = broadcast::channel(2);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        tx.send(bulk(&["a"], false)).unwrap();
        let pointer = buffer.get_counter();

        for id in ["b", "c", "d", "e"] {
            tx.send(bulk(&[id], false)).unwrap();
        }
        assert_eq!(buffer.get_from(pointer), None);
        let now = buffer.get_counter();
        assert_eq!(buffer.get_from(now), Some(vec![]));
    }

    #[test]
    fn closed_buffer_ignores_new_bulks() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        tx.send(bulk(&["a"], false)).unwrap();
        assert_eq!(buffer.get_counter(), 1);
        buffer.close();
        let _ = tx.send(bulk(&["b"], false));
        assert!(buffer.is_closed());
        assert_eq!(buffer.get_counter(), 1);
    }

    #[tokio::test]
    async fn background_task_appends_without_reads() {
        let (tx, rx) = broadcast::channel(16);
        let buffer = ChangeEventBuffer::new(&rx, 10);
        tx.send(bulk(&["a"], false)).unwrap();
        tx.send(bulk(&["b"], false)).unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(buffer.inner.state.lock().counter, 2);
        assert_eq!(buffer.get_counter(), 2);
    }
}
