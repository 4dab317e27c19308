use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Stored document state: a JSON object carrying the reserved fields
/// `_rev`, `_deleted`, `_meta` and `_attachments`.
pub type DocumentData = Value;

pub const REV_FIELD: &str = "_rev";
pub const DELETED_FIELD: &str = "_deleted";
pub const META_FIELD: &str = "_meta";
pub const ATTACHMENTS_FIELD: &str = "_attachments";

/// Access a nested field using dot notation: "user.address.city"
pub fn get_field<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = data;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a nested field, creating intermediate objects as needed. Non-object
/// values on the way are replaced.
pub fn set_field(data: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = data;
    for part in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry(*part)
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.to_string(), value);
    }
}

/// Remove a nested field, returning its value.
pub fn remove_field(data: &mut Value, path: &str) -> Option<Value> {
    let (parent, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (get_field_mut(data, parent)?, last),
        None => (data, path),
    };
    parent.as_object_mut()?.remove(last)
}

fn get_field_mut<'a>(data: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = data;
    for part in path.split('.') {
        current = current.as_object_mut()?.get_mut(part)?;
    }
    Some(current)
}

pub fn as_object(data: &Value) -> Result<&Map<String, Value>> {
    data.as_object().ok_or(Error::NotAnObject)
}

pub fn as_object_mut(data: &mut Value) -> Result<&mut Map<String, Value>> {
    data.as_object_mut().ok_or(Error::NotAnObject)
}

/// Primary key value as a string. Numbers are rendered in decimal.
pub fn primary_key(data: &Value, primary_path: &str) -> Option<String> {
    match get_field(data, primary_path)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub fn require_primary_key(data: &Value, primary_path: &str) -> Result<String> {
    primary_key(data, primary_path).ok_or_else(|| Error::MissingPrimaryKey {
        path: primary_path.to_string(),
    })
}

pub fn revision(data: &Value) -> Option<&str> {
    data.get(REV_FIELD).and_then(Value::as_str)
}

pub fn is_deleted(data: &Value) -> bool {
    data.get(DELETED_FIELD).and_then(Value::as_bool).unwrap_or(false)
}

pub fn last_write_time(data: &Value) -> Option<f64> {
    data.get(META_FIELD)?.get("lwt")?.as_f64()
}

/// Fill in the reserved fields a fresh insert does not have to supply.
pub fn fill_defaults(data: &mut Value) -> Result<()> {
    let obj = as_object_mut(data)?;
    obj.entry(DELETED_FIELD).or_insert(Value::Bool(false));
    obj.entry(ATTACHMENTS_FIELD)
        .or_insert_with(|| Value::Object(Map::new()));
    obj.entry(META_FIELD).or_insert_with(|| Value::Object(Map::new()));
    Ok(())
}

/// Copy of the document without `_rev`, `_meta` and `_attachments`,
/// used to decide whether two states carry the same user data.
pub fn strip_meta(data: &Value) -> Value {
    match data {
        Value::Object(map) => {
            let mut out = map.clone();
            out.remove(REV_FIELD);
            out.remove(META_FIELD);
            out.remove(ATTACHMENTS_FIELD);
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_field_access() {
        let doc = json!({"user": {"address": {"city": "Oslo"}}});
        assert_eq!(get_field(&doc, "user.address.city"), Some(&json!("Oslo")));
        assert_eq!(get_field(&doc, "user.name"), None);
    }

    #[test]
    fn set_and_remove_nested() {
        let mut doc = json!({"user": "flat"});
        set_field(&mut doc, "user.address.city", json!("Oslo"));
        assert_eq!(doc, json!({"user": {"address": {"city": "Oslo"}}}));
        assert_eq!(remove_field(&mut doc, "user.address.city"), Some(json!("Oslo")));
        assert_eq!(remove_field(&mut doc, "user.missing.x"), None);
        assert_eq!(doc, json!({"user": {"address": {}}}));
    }

    #[test]
    fn numeric_primary_key_is_stringified() {
        let doc = json!({"id": 42});
        assert_eq!(primary_key(&doc, "id").as_deref(), Some("42"));
        assert!(primary_key(&json!({"id": ""}), "id").is_none());
        assert!(matches!(
            require_primary_key(&json!({}), "id"),
            Err(Error::MissingPrimaryKey { .. })
        ));
    }

    #[test]
    fn defaults_do_not_override() {
        let mut doc = json!({"id": "a", "_deleted": true});
        fill_defaults(&mut doc).unwrap();
        assert!(is_deleted(&doc));
        assert_eq!(doc["_attachments"], json!({}));
    }

    #[test]
    fn strip_meta_keeps_user_fields() {
        let doc = json!({"id": "a", "_rev": "1-x", "_meta": {"lwt": 1.0}, "_deleted": false});
        assert_eq!(strip_meta(&doc), json!({"id": "a", "_deleted": false}));
    }
}
