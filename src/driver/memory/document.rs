//! Update, projection and sort helpers for the in-memory driver.

use super::filter::{compare_values, lookup};
use crate::driver::{Document, DriverError};
use serde_json::Value;
use std::cmp::Ordering;

/// Apply an update document made of `$set` / `$unset` operators.
pub(crate) fn apply_update(doc: &mut Document, update: &Document) -> Result<(), DriverError> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(DriverError::InvalidArgument(
            "update document requires atomic operators".into(),
        ));
    }

    for (op, arg) in update {
        let fields = arg.as_object().ok_or_else(|| {
            DriverError::InvalidArgument(format!("{} requires a document argument", op))
        })?;
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    if path == "_id" && doc.get("_id").is_some_and(|id| id != value) {
                        return Err(DriverError::InvalidArgument(
                            "the _id field cannot be modified".into(),
                        ));
                    }
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    unset_path(doc, path);
                }
            }
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "unsupported update operator: {}",
                    other
                )));
            }
        }
    }
    Ok(())
}

fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Document::new()));
            if !entry.is_object() {
                *entry = Value::Object(Document::new());
            }
            if let Value::Object(nested) = entry {
                set_path(nested, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Value::Object(nested)) = doc.get_mut(head) {
                unset_path(nested, rest);
            }
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        _ => true,
    }
}

/// Inclusion projections keep `_id` unless it is excluded explicitly;
/// exclusion projections drop the listed top-level fields.
pub(crate) fn apply_projection(doc: Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc;
    }

    let inclusive = projection
        .iter()
        .any(|(field, flag)| field != "_id" && is_truthy(flag));

    if inclusive {
        let keep_id = projection.get("_id").is_none_or(is_truthy);
        doc.into_iter()
            .filter(|(field, _)| {
                if field == "_id" {
                    return keep_id;
                }
                projection.iter().any(|(path, flag)| {
                    is_truthy(flag) && (path == field || path.split('.').next() == Some(field))
                })
            })
            .collect()
    } else {
        doc.into_iter()
            .filter(|(field, _)| !projection.contains_key(field))
            .collect()
    }
}

pub(crate) fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (path, direction) in sort {
        let descending = direction.as_f64().is_some_and(|d| d < 0.0)
            || direction.as_str().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
        let null = Value::Null;
        let left = lookup(a, path).unwrap_or(&null);
        let right = lookup(b, path).unwrap_or(&null);
        let ord = compare_values(left, right);
        if ord != Ordering::Equal {
            return if descending { ord.reverse() } else { ord };
        }
    }
    Ordering::Equal
}
