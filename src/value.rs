use std::cmp::Ordering;

use serde_json::Value as JsonValue;

use crate::document;

/// Comparable projection of a JSON value, shared by selector matching and
/// sorting so that storage queries and incremental reconciliation agree.
///
/// Order: Missing < Null < Boolean < numbers < DateTime < String < Composite.
/// Date-like strings compare as millisecond timestamps, then by their text so
/// that two different strings never compare equal.
#[derive(Debug, Clone)]
pub enum SortValue {
    Missing,
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    DateTime(i64, String),
    String(String),
    /// Arrays and objects, compared by their serialized form.
    Composite(String),
}

impl Eq for SortValue {}

impl PartialEq for SortValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for SortValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use SortValue::*;
        match (self, other) {
            (Integer(a), Integer(b)) => a.cmp(b),
            (Integer(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Integer(b)) => a.total_cmp(&(*b as f64)),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (DateTime(a, raw_a), DateTime(b, raw_b)) => a.cmp(b).then_with(|| raw_a.cmp(raw_b)),
            (String(a), String(b)) | (Composite(a), Composite(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl SortValue {
    fn rank(&self) -> u8 {
        match self {
            SortValue::Missing => 0,
            SortValue::Null => 1,
            SortValue::Boolean(_) => 2,
            SortValue::Integer(_) | SortValue::Float(_) => 3,
            SortValue::DateTime(..) => 4,
            SortValue::String(_) => 5,
            SortValue::Composite(_) => 6,
        }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => SortValue::Null,
            JsonValue::Bool(b) => SortValue::Boolean(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => SortValue::Integer(i),
                None => n.as_f64().map(SortValue::Float).unwrap_or(SortValue::Null),
            },
            JsonValue::String(s) => Self::parse_string(s),
            other => SortValue::Composite(other.to_string()),
        }
    }

    /// Project the field at `path`; absent fields become `Missing`.
    pub fn from_field(data: &JsonValue, path: &str) -> Self {
        document::get_field(data, path)
            .map(Self::from_json)
            .unwrap_or(SortValue::Missing)
    }

    pub fn parse_string(s: &str) -> Self {
        // Only strings shaped like YYYY-MM-DD... are worth a date parse.
        let b = s.as_bytes();
        let looks_like_date = b.len() >= 10
            && b[..4].iter().all(u8::is_ascii_digit)
            && b[4] == b'-'
            && b[5..7].iter().all(u8::is_ascii_digit);
        if !looks_like_date {
            return SortValue::String(s.to_string());
        }

        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return SortValue::DateTime(dt.timestamp_millis(), s.to_string());
        }
        for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
            if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, fmt) {
                return SortValue::DateTime(dt.and_utc().timestamp_millis(), s.to_string());
            }
        }
        if let Some(dt) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return SortValue::DateTime(dt.and_utc().timestamp_millis(), s.to_string());
        }
        SortValue::String(s.to_string())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, SortValue::Missing)
    }
}
