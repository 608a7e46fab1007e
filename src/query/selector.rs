//! Evaluation of Mango selectors against JSON documents.
//!
//! Covers the operator subset emitted by [`super::plan::Condition`]. Ordering
//! across types follows CouchDB collation: null < false < true < numbers <
//! strings < arrays < objects.

use crate::error::FabricError;
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub fn matches(selector: &Value, doc: &Value) -> Result<bool, FabricError> {
    let Value::Object(clauses) = selector else {
        return Err(FabricError::Validation(format!(
            "selector must be an object, got {selector}"
        )));
    };
    for (key, clause) in clauses {
        let ok = match key.as_str() {
            "$and" => all_of(clause, doc)?,
            "$or" => any_of(clause, doc)?,
            "$nor" => !any_of(clause, doc)?,
            "$not" => !matches(clause, doc)?,
            field => field_matches(lookup(doc, field), clause)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_of(clause: &Value, doc: &Value) -> Result<bool, FabricError> {
    for sub in as_array(clause)? {
        if !matches(sub, doc)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(clause: &Value, doc: &Value) -> Result<bool, FabricError> {
    for sub in as_array(clause)? {
        if matches(sub, doc)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn as_array(clause: &Value) -> Result<&Vec<Value>, FabricError> {
    clause
        .as_array()
        .ok_or_else(|| FabricError::Validation(format!("expected array operand, got {clause}")))
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, part| cur.get(part))
}

fn field_matches(value: Option<&Value>, clause: &Value) -> Result<bool, FabricError> {
    match clause {
        Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) => {
            for (op, operand) in ops {
                if !apply_operator(value, op, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(value.is_some_and(|v| v == literal)),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, operand: &Value) -> Result<bool, FabricError> {
    let cmp = |pred: fn(Ordering) -> bool| value.is_some_and(|v| pred(collate(v, operand)));
    Ok(match op {
        "$eq" => value.is_some_and(|v| collate(v, operand) == Ordering::Equal),
        "$ne" => value.is_none_or(|v| collate(v, operand) != Ordering::Equal),
        "$lt" => cmp(Ordering::is_lt),
        "$lte" => cmp(Ordering::is_le),
        "$gt" => cmp(Ordering::is_gt),
        "$gte" => cmp(Ordering::is_ge),
        "$in" => {
            let options = as_array(operand)?;
            value.is_some_and(|v| options.iter().any(|o| collate(v, o) == Ordering::Equal))
        }
        "$nin" => {
            let options = as_array(operand)?;
            value.is_none_or(|v| options.iter().all(|o| collate(v, o) != Ordering::Equal))
        }
        "$exists" => value.is_some() == operand.as_bool().unwrap_or(true),
        "$not" => !field_matches(value, operand)?,
        other => {
            return Err(FabricError::Validation(format!(
                "unsupported selector operator '{other}'"
            )));
        }
    })
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over JSON values used for comparisons and sorting.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = collate(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => collate_objects(x, y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn collate_objects(x: &Map<String, Value>, y: &Map<String, Value>) -> Ordering {
    for ((kx, vx), (ky, vy)) in x.iter().zip(y) {
        let ord = kx.cmp(ky).then_with(|| collate(vx, vy));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    x.len().cmp(&y.len())
}

/// Sorts documents by a Mango `sort` clause (`[{"field": "asc"}]` or `["field"]`).
pub fn sort_documents<T>(docs: &mut [T], sort: &[Value], doc: impl Fn(&T) -> &Value) {
    if sort.is_empty() {
        return;
    }
    let keys: Vec<(String, bool)> = sort
        .iter()
        .filter_map(|s| match s {
            Value::String(field) => Some((field.clone(), false)),
            Value::Object(m) => m
                .iter()
                .next()
                .map(|(field, dir)| (field.clone(), dir.as_str() == Some("desc"))),
            _ => None,
        })
        .collect();
    docs.sort_by(|a, b| {
        for (field, desc) in &keys {
            let left = lookup(doc(a), field).unwrap_or(&Value::Null);
            let right = lookup(doc(b), field).unwrap_or(&Value::Null);
            let ord = collate(left, right);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn implicit_and_explicit_equality() {
        let doc = json!({"name": "ana", "age": 30});
        assert!(matches(&json!({"name": "ana"}), &doc).expect("eval"));
        assert!(matches(&json!({"age": {"$eq": 30}}), &doc).expect("eval"));
        assert!(!matches(&json!({"age": {"$eq": 31}}), &doc).expect("eval"));
    }

    #[test]
    fn logical_operators_compose() {
        let doc = json!({"qty": 5, "tag": "a"});
        let sel = json!({"$or": [{"qty": {"$gt": 10}}, {"$and": [{"tag": {"$in": ["a", "b"]}}, {"qty": {"$lte": 5}}]}]});
        assert!(matches(&sel, &doc).expect("eval"));
        assert!(!matches(&json!({"$not": sel}), &doc).expect("eval"));
    }

    #[test]
    fn missing_fields_only_match_negative_operators() {
        let doc = json!({"a": 1});
        assert!(matches(&json!({"b": {"$ne": 1}}), &doc).expect("eval"));
        assert!(matches(&json!({"b": {"$exists": false}}), &doc).expect("eval"));
        assert!(!matches(&json!({"b": {"$gt": 0}}), &doc).expect("eval"));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = matches(&json!({"a": {"$regex": "x"}}), &json!({"a": "x"})).expect_err("op");
        assert_eq!(err.code_str(), "validation");
    }

    #[test]
    fn sort_uses_collation_order() {
        let mut docs = vec![json!({"v": "b"}), json!({"v": 2}), json!({"v": null}), json!({"v": 1})];
        sort_documents(&mut docs, &[json!({"v": "asc"})], |d| d);
        assert_eq!(docs, vec![json!({"v": null}), json!({"v": 1}), json!({"v": 2}), json!({"v": "b"})]);
    }
}
