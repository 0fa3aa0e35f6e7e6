//! Filter evaluation for the in-memory driver.
//!
//! Supports the subset of the MongoDB query language the persistence
//! components and their entity adapters produce: implicit equality, dotted
//! paths, comparison operators, `$in`/`$nin`, `$exists`, `$not` and the
//! logical `$and`/`$or`/`$nor` combinators.

use crate::driver::{Document, DriverError};
use serde_json::Value;
use std::cmp::Ordering;

pub(crate) fn matches(filter: &Document, doc: &Document) -> Result<bool, DriverError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let clauses = clauses(key, condition)?;
                let mut all = true;
                for clause in clauses {
                    if !matches(clause, doc)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let clauses = clauses(key, condition)?;
                let mut any = false;
                for clause in clauses {
                    if matches(clause, doc)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let clauses = clauses(key, condition)?;
                let mut any = false;
                for clause in clauses {
                    if matches(clause, doc)? {
                        any = true;
                        break;
                    }
                }
                !any
            }
            op if op.starts_with('$') => {
                return Err(DriverError::InvalidArgument(format!(
                    "unknown top level operator: {}",
                    op
                )));
            }
            path => field_matches(lookup(doc, path), condition)?,
        };

        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clauses<'a>(op: &str, condition: &'a Value) -> Result<Vec<&'a Document>, DriverError> {
    let items = condition
        .as_array()
        .ok_or_else(|| DriverError::InvalidArgument(format!("{} must be an array", op)))?;
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| {
                DriverError::InvalidArgument(format!("{} entries must be documents", op))
            })
        })
        .collect()
}

fn is_operator_document(condition: &Value) -> bool {
    match condition {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn field_matches(field: Option<&Value>, condition: &Value) -> Result<bool, DriverError> {
    if !is_operator_document(condition) {
        return Ok(equals(field, condition));
    }

    let Value::Object(operators) = condition else {
        return Ok(false);
    };
    for (op, arg) in operators {
        let matched = match op.as_str() {
            "$eq" => equals(field, arg),
            "$ne" => !equals(field, arg),
            "$gt" => compares(field, arg, |o| o == Ordering::Greater),
            "$gte" => compares(field, arg, |o| o != Ordering::Less),
            "$lt" => compares(field, arg, |o| o == Ordering::Less),
            "$lte" => compares(field, arg, |o| o != Ordering::Greater),
            "$in" => in_list(field, op, arg)?,
            "$nin" => !in_list(field, op, arg)?,
            "$exists" => {
                let wanted = match arg {
                    Value::Bool(b) => *b,
                    Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
                    _ => true,
                };
                field.is_some() == wanted
            }
            "$not" => !field_matches(field, arg)?,
            other => {
                return Err(DriverError::InvalidArgument(format!(
                    "unknown operator: {}",
                    other
                )));
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(field: Option<&Value>, op: &str, arg: &Value) -> Result<bool, DriverError> {
    let candidates = arg
        .as_array()
        .ok_or_else(|| DriverError::InvalidArgument(format!("{} needs an array", op)))?;
    Ok(candidates.iter().any(|candidate| equals(field, candidate)))
}

/// Equality with array fields matching element-wise; a missing field equals `null`.
fn equals(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn compares(field: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(value) = field else {
        return false;
    };
    let candidates: Vec<&Value> = match value {
        Value::Array(items) if !arg.is_array() => items.iter().collect(),
        other => vec![other],
    };
    candidates
        .into_iter()
        .any(|candidate| type_rank(candidate) == type_rank(arg) && accept(compare_values(candidate, arg)))
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y)
                    .all(|((lk, lv), (rk, rv))| lk == rk && values_equal(lv, rv))
        }
        _ => a == b,
    }
}

/// Cross-type ordering: null < numbers < strings < objects < arrays < booleans.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

pub(crate) fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Resolve a dotted path such as `address.city`.
pub(crate) fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
