//! Incremental query reconciliation.
//!
//! Given the last result of a query and the change events since, compute the
//! new result without asking the storage engine, or report that this cannot
//! be done safely.
//!
//! The reconciler tracks a contiguous slice of the full sorted match set: the
//! documents it knows, the absolute index of the first one, and whether the
//! slice reaches the end of the set. Every event is applied to that slice and
//! the final window (`skip`, `limit`) is cut from it. Whenever a step would
//! depend on a document outside the slice, the whole batch falls back to a
//! full requery.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::change_event::{ChangeEvent, PreviousDocument};
use crate::document::{self, DocumentData};
use crate::query::PreparedQuery;

/// Execution parameters derived once per query.
#[derive(Debug, Clone)]
pub struct QueryParams {
    pub primary_key: String,
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort_fields: Vec<String>,
    query: Arc<PreparedQuery>,
}

impl QueryParams {
    pub fn new(query: Arc<PreparedQuery>) -> Self {
        Self {
            primary_key: query.primary_path.clone(),
            skip: query.query.skip,
            limit: query.query.limit,
            sort_fields: query
                .comparator()
                .fields()
                .iter()
                .map(|(field, _)| field.clone())
                .collect(),
            query,
        }
    }

    pub fn query(&self) -> &PreparedQuery {
        &self.query
    }

    pub fn matches(&self, doc: &DocumentData) -> bool {
        self.query.matches(doc)
    }

    pub fn compare(&self, a: &DocumentData, b: &DocumentData) -> Ordering {
        self.query.comparator().compare(a, b)
    }

    fn id_of<'a>(&self, doc: &'a DocumentData) -> Option<&'a serde_json::Value> {
        document::get_field(doc, &self.primary_key)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReduceResult {
    RunFullQueryAgain,
    Computed {
        changed: bool,
        new_results: Vec<DocumentData>,
    },
}

impl ReduceResult {
    pub fn run_full_query_again(&self) -> bool {
        matches!(self, ReduceResult::RunFullQueryAgain)
    }
}

/// A known run of the full sorted match set.
struct KnownSlice<'p> {
    params: &'p QueryParams,
    docs: Vec<DocumentData>,
    /// Absolute index of `docs[0]` in the full set.
    start: usize,
    /// No matching document sorts after the last one in `docs`.
    reaches_end: bool,
}

impl<'p> KnownSlice<'p> {
    /// `None` when the previous result does not pin down any position,
    /// i.e. it is empty because `skip` went past the end.
    fn from_results(params: &'p QueryParams, results: &[DocumentData]) -> Option<Self> {
        if results.is_empty() && params.skip > 0 {
            return None;
        }
        Some(Self {
            params,
            docs: results.to_vec(),
            start: params.skip,
            reaches_end: params.limit.is_none_or(|limit| results.len() < limit),
        })
    }

    fn position_of_id(&self, id: &str) -> Option<usize> {
        self.docs.iter().position(|d| {
            self.params
                .id_of(d)
                .is_some_and(|v| v.as_str().map_or_else(|| v.to_string() == id, |s| s == id))
        })
    }

    fn insertion_point(&self, doc: &DocumentData) -> usize {
        self.docs
            .partition_point(|d| self.params.compare(d, doc) == Ordering::Less)
    }

    /// Apply one event. `None` means the outcome depends on unknown documents.
    fn apply(&mut self, event: &ChangeEvent) -> Option<()> {
        if let Some(pos) = self.position_of_id(&event.document_id) {
            self.docs.remove(pos);
        } else {
            match &event.previous_document_data {
                PreviousDocument::Known(prev) if self.params.matches(prev) => self.remove_unlisted(prev)?,
                PreviousDocument::Known(_) | PreviousDocument::None => {}
                PreviousDocument::Unknown => {
                    // only safe when the slice is the whole set
                    if !(self.start == 0 && self.reaches_end) {
                        return None;
                    }
                }
            }
        }

        if let Some(doc) = event.document_data.as_ref().filter(|d| self.params.matches(d)) {
            self.insert(doc)?;
        }
        Some(())
    }

    /// A previously matching document that is not in the slice goes away.
    fn remove_unlisted(&mut self, prev: &DocumentData) -> Option<()> {
        if self.docs.is_empty() {
            return if self.start == 0 {
                // everything lies after the slice
                Some(())
            } else if self.reaches_end {
                self.start -= 1;
                Some(())
            } else {
                None
            };
        }
        let pos = self.insertion_point(prev);
        if pos == 0 && self.start > 0 {
            self.start -= 1;
            Some(())
        } else if pos == self.docs.len() && !self.reaches_end {
            Some(())
        } else {
            None
        }
    }

    fn insert(&mut self, doc: &DocumentData) -> Option<()> {
        if self.docs.is_empty() {
            return match (self.start == 0, self.reaches_end) {
                (true, true) => {
                    self.docs.push(doc.clone());
                    Some(())
                }
                (true, false) => Some(()),
                (false, true) => {
                    self.start += 1;
                    Some(())
                }
                (false, false) => None,
            };
        }
        let pos = self.insertion_point(doc);
        if pos == 0 && self.start > 0 {
            self.start += 1;
        } else if pos == self.docs.len() && !self.reaches_end {
            // sorts somewhere into the unknown tail
        } else {
            self.docs.insert(pos, doc.clone());
        }
        Some(())
    }

    /// Cut the query window out of the slice.
    fn into_window(mut self) -> Option<Vec<DocumentData>> {
        let skip = self.params.skip;
        if self.start > skip {
            return None;
        }
        let drop = skip - self.start;
        if drop > self.docs.len() {
            return self.reaches_end.then(Vec::new);
        }
        self.docs.drain(..drop);
        match self.params.limit {
            Some(limit) if self.docs.len() >= limit => {
                self.docs.truncate(limit);
                Some(self.docs)
            }
            _ if self.reaches_end => Some(self.docs),
            _ => None,
        }
    }
}

fn same_states(params: &QueryParams, a: &[DocumentData], b: &[DocumentData]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            params.id_of(x) == params.id_of(y) && document::revision(x) == document::revision(y)
        })
}

/// Reconcile `previous_results` with `events`.
///
/// With `event_reduce` off every call asks for a full requery.
pub fn calculate_new_results(
    params: &QueryParams,
    previous_results: &[DocumentData],
    events: &[ChangeEvent],
    event_reduce: bool,
) -> ReduceResult {
    if !event_reduce {
        return ReduceResult::RunFullQueryAgain;
    }
    if params.limit == Some(0) {
        return ReduceResult::Computed {
            changed: false,
            new_results: Vec::new(),
        };
    }

    let Some(mut slice) = KnownSlice::from_results(params, previous_results) else {
        // the result is empty because of skip; any relevant event may fill it
        let relevant = events.iter().any(|e| {
            e.document_data.as_ref().is_some_and(|d| params.matches(d))
                || match &e.previous_document_data {
                    PreviousDocument::Known(prev) => params.matches(prev),
                    PreviousDocument::None => false,
                    PreviousDocument::Unknown => true,
                }
        });
        return if relevant {
            debug!(events = events.len(), "skipped-past-end query touched, requery");
            ReduceResult::RunFullQueryAgain
        } else {
            ReduceResult::Computed {
                changed: false,
                new_results: Vec::new(),
            }
        };
    };

    for event in events {
        if slice.apply(event).is_none() {
            debug!(document_id = %event.document_id, "event not reducible, requery");
            return ReduceResult::RunFullQueryAgain;
        }
    }

    match slice.into_window() {
        Some(new_results) => ReduceResult::Computed {
            changed: !same_states(params, previous_results, &new_results),
            new_results,
        },
        None => {
            debug!(events = events.len(), "window lost its bounds, requery");
            ReduceResult::RunFullQueryAgain
        }
    }
}

/// Reconcile a count query. `None` means the count must be recomputed.
pub fn calculate_new_count(
    params: &QueryParams,
    previous_count: usize,
    events: &[ChangeEvent],
    event_reduce: bool,
) -> Option<usize> {
    if !event_reduce {
        return None;
    }
    let mut count = previous_count;
    for event in events {
        let matched_before = match &event.previous_document_data {
            PreviousDocument::Known(prev) => params.matches(prev),
            PreviousDocument::None => false,
            PreviousDocument::Unknown => return None,
        };
        let matches_now = event.document_data.as_ref().is_some_and(|d| params.matches(d));
        match (matched_before, matches_now) {
            (false, true) => count += 1,
            (true, false) => count = count.checked_sub(1)?,
            _ => {}
        }
    }
    Some(count)
}
