use std::cmp::Ordering;

use regex::Regex;
use serde_json::{Map, Value as JsonValue, json};

use crate::document;
use crate::error::{Error, Result};
use crate::value::SortValue;

// ---------------------------------------------------------------------------
// Mango query: selector / sort / skip / limit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MangoQuery {
    pub selector: JsonValue,
    pub sort: Vec<(String, SortOrder)>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl Default for MangoQuery {
    fn default() -> Self {
        Self {
            selector: json!({}),
            sort: Vec::new(),
            skip: 0,
            limit: None,
        }
    }
}

impl MangoQuery {
    pub fn new(selector: JsonValue) -> Self {
        Self {
            selector,
            ..Self::default()
        }
    }

    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort.push((field.to_string(), order));
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Parse `{"selector": {..}, "sort": .., "skip": n, "limit": n}`.
    ///
    /// `sort` is either an array of single-field objects
    /// (`[{"age": "asc"}, {"name": -1}]`) or one object (`{"age": 1}`).
    pub fn from_json(request: &JsonValue) -> Result<Self> {
        let obj = request
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("query must be a JSON object".into()))?;
        let mut query = MangoQuery::new(obj.get("selector").cloned().unwrap_or_else(|| json!({})));

        match obj.get("sort") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::Array(parts)) => {
                for part in parts {
                    let part = part.as_object().ok_or_else(|| {
                        Error::InvalidQuery("sort entries must be objects".into())
                    })?;
                    parse_sort_object(part, &mut query.sort)?;
                }
            }
            Some(JsonValue::Object(part)) => parse_sort_object(part, &mut query.sort)?,
            Some(_) => return Err(Error::InvalidQuery("sort must be an array or object".into())),
        }

        if let Some(skip) = obj.get("skip") {
            query.skip = skip
                .as_u64()
                .ok_or_else(|| Error::InvalidQuery("skip must be a non-negative integer".into()))?
                as usize;
        }
        if let Some(limit) = obj.get("limit").filter(|v| !v.is_null()) {
            query.limit = Some(
                limit
                    .as_u64()
                    .ok_or_else(|| Error::InvalidQuery("limit must be a non-negative integer".into()))?
                    as usize,
            );
        }
        Ok(query)
    }
}

fn parse_sort_object(part: &Map<String, JsonValue>, out: &mut Vec<(String, SortOrder)>) -> Result<()> {
    for (field, dir) in part {
        let order = match dir {
            JsonValue::String(s) if s == "asc" => SortOrder::Asc,
            JsonValue::String(s) if s == "desc" => SortOrder::Desc,
            d if d.as_i64() == Some(1) => SortOrder::Asc,
            d if d.as_i64() == Some(-1) => SortOrder::Desc,
            _ => {
                return Err(Error::InvalidQuery(
                    "sort direction must be \"asc\"/\"desc\" or 1/-1".into(),
                ));
            }
        };
        out.push((field.clone(), order));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Selector AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum SelectorOp {
    Eq(SortValue),
    Ne(SortValue),
    Gt(SortValue),
    Gte(SortValue),
    Lt(SortValue),
    Lte(SortValue),
    In(Vec<SortValue>),
    Nin(Vec<SortValue>),
    Exists(bool),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub enum Selector {
    Field { field: String, op: SelectorOp },
    And(Vec<Selector>),
    Or(Vec<Selector>),
    All,
}

pub fn parse_selector(selector: &JsonValue) -> Result<Selector> {
    let obj = selector
        .as_object()
        .ok_or_else(|| Error::InvalidQuery("selector must be a JSON object".into()))?;

    let mut conditions: Vec<Selector> = Vec::new();

    for (key, value) in obj {
        match key.as_str() {
            "$and" | "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| Error::InvalidQuery(format!("{key} must be an array")))?;
                let subs = arr.iter().map(parse_selector).collect::<Result<Vec<_>>>()?;
                conditions.push(if key == "$and" {
                    Selector::And(subs)
                } else {
                    Selector::Or(subs)
                });
            }
            field => match value.as_object() {
                Some(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                    for (op_key, op_val) in ops {
                        // consumed by $regex
                        if op_key == "$options" {
                            continue;
                        }
                        conditions.push(Selector::Field {
                            field: field.to_string(),
                            op: parse_op(op_key, op_val, ops)?,
                        });
                    }
                }
                _ => conditions.push(Selector::Field {
                    field: field.to_string(),
                    op: SelectorOp::Eq(SortValue::from_json(value)),
                }),
            },
        }
    }

    Ok(match conditions.len() {
        0 => Selector::All,
        1 => conditions.remove(0),
        _ => Selector::And(conditions),
    })
}

fn parse_op(op_key: &str, op_val: &JsonValue, siblings: &Map<String, JsonValue>) -> Result<SelectorOp> {
    let list = |v: &JsonValue| -> Result<Vec<SortValue>> {
        let arr = v
            .as_array()
            .ok_or_else(|| Error::InvalidQuery(format!("{op_key} must be an array")))?;
        Ok(arr.iter().map(SortValue::from_json).collect())
    };
    Ok(match op_key {
        "$eq" => SelectorOp::Eq(SortValue::from_json(op_val)),
        "$ne" => SelectorOp::Ne(SortValue::from_json(op_val)),
        "$gt" => SelectorOp::Gt(SortValue::from_json(op_val)),
        "$gte" => SelectorOp::Gte(SortValue::from_json(op_val)),
        "$lt" => SelectorOp::Lt(SortValue::from_json(op_val)),
        "$lte" => SelectorOp::Lte(SortValue::from_json(op_val)),
        "$in" => SelectorOp::In(list(op_val)?),
        "$nin" => SelectorOp::Nin(list(op_val)?),
        "$exists" => SelectorOp::Exists(
            op_val
                .as_bool()
                .ok_or_else(|| Error::InvalidQuery("$exists must be a boolean".into()))?,
        ),
        "$regex" => {
            let pattern = op_val
                .as_str()
                .ok_or_else(|| Error::InvalidQuery("$regex must be a string".into()))?;
            let pattern = match siblings.get("$options").and_then(JsonValue::as_str) {
                Some(flags) if !flags.is_empty() => format!("(?{flags}){pattern}"),
                _ => pattern.to_string(),
            };
            SelectorOp::Regex(
                Regex::new(&pattern).map_err(|e| Error::InvalidQuery(e.to_string()))?,
            )
        }
        _ => return Err(Error::InvalidQuery(format!("unknown operator: {op_key}"))),
    })
}

impl Selector {
    pub fn matches(&self, data: &JsonValue) -> bool {
        match self {
            Selector::All => true,
            Selector::And(subs) => subs.iter().all(|s| s.matches(data)),
            Selector::Or(subs) => subs.iter().any(|s| s.matches(data)),
            Selector::Field { field, op } => {
                let value = SortValue::from_field(data, field);
                match op {
                    SelectorOp::Exists(expected) => !value.is_missing() == *expected,
                    SelectorOp::Eq(SortValue::Null) => {
                        matches!(value, SortValue::Null | SortValue::Missing)
                    }
                    SelectorOp::Ne(v) => value != *v,
                    SelectorOp::Nin(vals) => !vals.contains(&value),
                    _ if value.is_missing() => false,
                    SelectorOp::Eq(v) => value == *v,
                    SelectorOp::Gt(v) => value > *v,
                    SelectorOp::Gte(v) => value >= *v,
                    SelectorOp::Lt(v) => value < *v,
                    SelectorOp::Lte(v) => value <= *v,
                    SelectorOp::In(vals) => vals.contains(&value),
                    SelectorOp::Regex(re) => document::get_field(data, field)
                        .and_then(JsonValue::as_str)
                        .is_some_and(|s| re.is_match(s)),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sort comparator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SortComparator {
    fields: Vec<(String, SortOrder)>,
    /// Values at this path are additionally ordered by their raw key text,
    /// so distinct documents never compare equal.
    primary_path: Option<String>,
}

impl SortComparator {
    pub fn new(fields: Vec<(String, SortOrder)>) -> Self {
        Self {
            fields,
            primary_path: None,
        }
    }

    pub fn with_primary_key(mut self, primary_path: &str) -> Self {
        self.primary_path = Some(primary_path.to_string());
        self
    }

    pub fn fields(&self) -> &[(String, SortOrder)] {
        &self.fields
    }

    pub fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        for (field, order) in &self.fields {
            let mut cmp = SortValue::from_field(a, field).cmp(&SortValue::from_field(b, field));
            if cmp == Ordering::Equal && self.primary_path.as_deref() == Some(field.as_str()) {
                // 1 and 1.0 are equal values but different keys
                cmp = document::primary_key(a, field).cmp(&document::primary_key(b, field));
            }
            let cmp = match order {
                SortOrder::Asc => cmp,
                SortOrder::Desc => cmp.reverse(),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }
}

// ---------------------------------------------------------------------------
// Prepared query: what the storage engine executes
// ---------------------------------------------------------------------------

/// A normalised query with its compiled selector and comparator.
///
/// Normalisation appends the primary key as the final ascending sort field
/// (unless already sorted on), which makes the order total: two distinct
/// documents never compare equal.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub query: MangoQuery,
    pub primary_path: String,
    selector: Selector,
    comparator: SortComparator,
}

impl PreparedQuery {
    pub fn new(primary_path: &str, mut query: MangoQuery) -> Result<Self> {
        if !query.sort.iter().any(|(f, _)| f == primary_path) {
            query.sort.push((primary_path.to_string(), SortOrder::Asc));
        }
        let selector = parse_selector(&query.selector)?;
        let comparator = SortComparator::new(query.sort.clone()).with_primary_key(primary_path);
        Ok(Self {
            query,
            primary_path: primary_path.to_string(),
            selector,
            comparator,
        })
    }

    /// Deleted documents never match.
    pub fn matches(&self, data: &JsonValue) -> bool {
        !document::is_deleted(data) && self.selector.matches(data)
    }

    pub fn comparator(&self) -> &SortComparator {
        &self.comparator
    }

    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Filter, sort and window a document set the way a storage engine would.
    pub fn run<'a, I>(&self, docs: I) -> Vec<JsonValue>
    where
        I: IntoIterator<Item = &'a JsonValue>,
    {
        let mut matching: Vec<&JsonValue> = docs.into_iter().filter(|d| self.matches(d)).collect();
        matching.sort_by(|a, b| self.comparator.compare(a, b));
        let limit = self.query.limit.unwrap_or(usize::MAX);
        matching
            .into_iter()
            .skip(self.query.skip)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_eq_and_range() {
        let s = parse_selector(&json!({"name": "Alice", "age": {"$gte": 18, "$lt": 65}})).unwrap();
        assert!(s.matches(&json!({"name": "Alice", "age": 30})));
        assert!(!s.matches(&json!({"name": "Alice", "age": 70})));
        assert!(!s.matches(&json!({"name": "Bob", "age": 30})));
    }

    #[test]
    fn or_and_membership() {
        let s = parse_selector(&json!({
            "$or": [{"status": "active"}, {"priority": {"$in": [5, 6]}}]
        }))
        .unwrap();
        assert!(s.matches(&json!({"status": "active", "priority": 1})));
        assert!(s.matches(&json!({"status": "closed", "priority": 6})));
        assert!(!s.matches(&json!({"status": "closed", "priority": 1})));
    }

    #[test]
    fn missing_fields() {
        let ne = parse_selector(&json!({"a": {"$ne": 1}})).unwrap();
        assert!(ne.matches(&json!({})));
        let gt = parse_selector(&json!({"a": {"$gt": 1}})).unwrap();
        assert!(!gt.matches(&json!({})));
        let null = parse_selector(&json!({"a": null})).unwrap();
        assert!(null.matches(&json!({})));
        let exists = parse_selector(&json!({"a": {"$exists": false}})).unwrap();
        assert!(exists.matches(&json!({"b": 1})));
    }

    #[test]
    fn regex_with_options() {
        let s = parse_selector(&json!({"name": {"$regex": "^al", "$options": "i"}})).unwrap();
        assert!(s.matches(&json!({"name": "Alice"})));
        assert!(!s.matches(&json!({"name": "Bob"})));
        assert!(!s.matches(&json!({"name": 3})));
    }

    #[test]
    fn unknown_operator_rejected() {
        assert!(parse_selector(&json!({"a": {"$near": 1}})).is_err());
    }

    #[test]
    fn parse_mango_query() {
        let q = MangoQuery::from_json(&json!({
            "selector": {"age": {"$gt": 1}},
            "sort": [{"age": "desc"}, {"name": 1}],
            "skip": 2,
            "limit": 5
        }))
        .unwrap();
        assert_eq!(q.sort, vec![("age".into(), SortOrder::Desc), ("name".into(), SortOrder::Asc)]);
        assert_eq!(q.skip, 2);
        assert_eq!(q.limit, Some(5));
        assert!(MangoQuery::from_json(&json!({"sort": [{"a": "up"}]})).is_err());
    }

    #[test]
    fn primary_key_tie_break_is_appended() {
        let p = PreparedQuery::new("id", MangoQuery::default().sort_by("age", SortOrder::Asc)).unwrap();
        assert_eq!(p.query.sort.last().unwrap().0, "id");
        let a = json!({"id": "a", "age": 1});
        let b = json!({"id": "b", "age": 1});
        assert_eq!(p.comparator().compare(&a, &b), Ordering::Less);
    }

    #[test]
    fn date_shaped_keys_stay_distinct() {
        let p = PreparedQuery::new("id", MangoQuery::default()).unwrap();
        let day = json!({"id": "2024-01-01"});
        let midnight = json!({"id": "2024-01-01T00:00:00Z"});
        assert_eq!(p.comparator().compare(&day, &midnight), Ordering::Less);
        assert_eq!(p.comparator().compare(&midnight, &day), Ordering::Greater);

        let by_id = PreparedQuery::new("id", MangoQuery::new(json!({"id": "2024-01-01"}))).unwrap();
        assert!(by_id.matches(&day));
        assert!(!by_id.matches(&midnight));

        let whole = json!({"id": 1});
        let float = json!({"id": 1.0});
        assert_ne!(p.comparator().compare(&whole, &float), Ordering::Equal);
    }

    #[test]
    fn run_applies_window_and_skips_deleted() {
        let docs = [
            json!({"id": "a", "n": 3}),
            json!({"id": "b", "n": 1}),
            json!({"id": "c", "n": 2, "_deleted": true}),
            json!({"id": "d", "n": 4}),
        ];
        let p = PreparedQuery::new(
            "id",
            MangoQuery::default().sort_by("n", SortOrder::Asc).skip(1).limit(2),
        )
        .unwrap();
        let ids: Vec<_> = p.run(docs.iter()).iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("d")]);
    }
}
