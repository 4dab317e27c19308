//! Mongo-style update operators for incremental updates.
//!
//! An update is parsed once into an [`UpdateSpec`] and can then be applied
//! any number of times, which the write queue needs when a conflict makes it
//! rerun a modifier against a newer state.

use serde_json::{Map, Value};

use crate::document::{self, ATTACHMENTS_FIELD, DELETED_FIELD, META_FIELD, REV_FIELD};
use crate::error::{Error, Result};
use crate::value::SortValue;

#[derive(Debug, Clone, PartialEq)]
enum UpdateOp {
    Set(Value),
    Unset,
    Inc(f64),
    Min(Value),
    Max(Value),
    Rename(String),
    Push(Value),
    Pull(Value),
    AddToSet(Value),
    /// `true` pops the last element, `false` the first.
    Pop(bool),
}

/// A validated list of `(field path, operation)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateSpec {
    ops: Vec<(String, UpdateOp)>,
}

impl UpdateSpec {
    /// Parse `{"$set": {..}, "$inc": {..}, ..}`. Updates touching the
    /// primary key or reserved fields are rejected.
    pub fn parse(update: &Value, primary_path: &str) -> Result<Self> {
        let obj = update
            .as_object()
            .ok_or_else(|| Error::InvalidQuery("update must be an object".into()))?;

        let mut ops = Vec::new();
        for (op, fields) in obj {
            let fields = fields
                .as_object()
                .ok_or_else(|| Error::InvalidQuery(format!("{op} value must be an object")))?;
            for (path, arg) in fields {
                check_path(path, primary_path)?;
                ops.push((path.clone(), parse_op(op, path, arg)?));
                if let UpdateOp::Rename(target) = &ops[ops.len() - 1].1 {
                    check_path(target, primary_path)?;
                }
            }
        }
        Ok(Self { ops })
    }

    pub fn apply(&self, doc: &mut Value) -> Result<()> {
        for (path, op) in &self.ops {
            apply_op(doc, path, op)?;
        }
        Ok(())
    }
}

pub(crate) fn check_path(path: &str, primary_path: &str) -> Result<()> {
    let root = path.split('.').next().unwrap_or(path);
    if path == primary_path || [REV_FIELD, META_FIELD, DELETED_FIELD, ATTACHMENTS_FIELD].contains(&root) {
        return Err(Error::InvalidQuery(format!("field '{path}' cannot be updated")));
    }
    Ok(())
}

fn parse_op(op: &str, path: &str, arg: &Value) -> Result<UpdateOp> {
    let numeric = || {
        arg.as_f64()
            .ok_or_else(|| Error::InvalidQuery(format!("{op} value for '{path}' must be numeric")))
    };
    Ok(match op {
        "$set" => UpdateOp::Set(arg.clone()),
        "$unset" => UpdateOp::Unset,
        "$inc" => UpdateOp::Inc(numeric()?),
        "$min" => UpdateOp::Min(arg.clone()),
        "$max" => UpdateOp::Max(arg.clone()),
        "$rename" => UpdateOp::Rename(
            arg.as_str()
                .ok_or_else(|| Error::InvalidQuery(format!("$rename target for '{path}' must be a string")))?
                .to_string(),
        ),
        "$push" => UpdateOp::Push(arg.clone()),
        "$pull" => UpdateOp::Pull(arg.clone()),
        "$addToSet" => UpdateOp::AddToSet(arg.clone()),
        "$pop" => match arg.as_i64() {
            Some(1) => UpdateOp::Pop(true),
            Some(-1) => UpdateOp::Pop(false),
            _ => return Err(Error::InvalidQuery(format!("$pop value for '{path}' must be 1 or -1"))),
        },
        _ => return Err(Error::InvalidQuery(format!("unknown update operator: {op}"))),
    })
}

fn apply_op(doc: &mut Value, path: &str, op: &UpdateOp) -> Result<()> {
    let current = document::get_field(doc, path);
    match op {
        UpdateOp::Set(value) => document::set_field(doc, path, value.clone()),
        UpdateOp::Unset => {
            document::remove_field(doc, path);
        }
        UpdateOp::Inc(by) => {
            let base = match current {
                None | Some(Value::Null) => 0.0,
                Some(v) => v
                    .as_f64()
                    .ok_or_else(|| Error::Modifier(format!("$inc on non-numeric field '{path}'")))?,
            };
            document::set_field(doc, path, number_to_value(base + by));
        }
        UpdateOp::Min(value) | UpdateOp::Max(value) => {
            let replace = match current {
                None | Some(Value::Null) => true,
                Some(cur) => {
                    let ord = SortValue::from_json(value).cmp(&SortValue::from_json(cur));
                    if matches!(op, UpdateOp::Min(_)) { ord.is_lt() } else { ord.is_gt() }
                }
            };
            if replace {
                document::set_field(doc, path, value.clone());
            }
        }
        UpdateOp::Rename(target) => {
            if let Some(value) = document::remove_field(doc, path) {
                document::set_field(doc, target, value);
            }
        }
        UpdateOp::Push(_) | UpdateOp::Pull(_) | UpdateOp::AddToSet(_) | UpdateOp::Pop(_) => {
            let mut items = match current {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err(Error::Modifier(format!("field '{path}' is not an array"))),
            };
            match op {
                UpdateOp::Push(value) => items.push(value.clone()),
                UpdateOp::Pull(value) => items.retain(|item| item != value),
                UpdateOp::AddToSet(value) => {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                UpdateOp::Pop(true) => {
                    items.pop();
                }
                UpdateOp::Pop(false) => {
                    if !items.is_empty() {
                        items.remove(0);
                    }
                }
                _ => {}
            }
            // $pull/$pop on a missing field leave it missing
            if current.is_some() || matches!(op, UpdateOp::Push(_) | UpdateOp::AddToSet(_)) {
                document::set_field(doc, path, Value::Array(items));
            }
        }
    }
    Ok(())
}

fn number_to_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Shallow merge used by incremental patches: top-level fields of `patch`
/// replace those of `doc`.
pub fn apply_patch(doc: &mut Value, patch: &Map<String, Value>) -> Result<()> {
    let obj = document::as_object_mut(doc)?;
    for (key, value) in patch {
        obj.insert(key.clone(), value.clone());
    }
    Ok(())
}
