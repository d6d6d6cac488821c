//! Query-document matching for the memory document driver
//!
//! Supports `$and`, `$or`, literal equality and the field operators `$eq`,
//! `$ne`, `$gt`, `$gte`, `$lt`, `$lte`, `$in`, `$nin`, `$regex` (with
//! `$options`) and `$exists`. A missing field compares as null. Range
//! operators only match values of the same type as the operand.

use std::cmp::Ordering;

use regex::RegexBuilder;
use serde_json::{Map, Value};

use super::{compare_same_type, values_equal};
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, DriverResult};
use crate::repository::Document;

/// Server code for a malformed query
const BAD_VALUE: &str = "2";

fn bad_value(message: impl Into<String>) -> DatabaseError {
    DatabaseError::new(DatabaseOperation::Query, DatabaseErrorKind::QueryFailed, message)
        .with_code(BAD_VALUE)
}

/// Whether `document` satisfies the query document `filter`
pub(crate) fn matches(document: &Document, filter: &Value) -> DriverResult<bool> {
    let Value::Object(clauses) = filter else {
        return Err(bad_value(format!("query must be an object, got {}", filter)));
    };

    for (key, criterion) in clauses {
        let ok = match key.as_str() {
            "$and" => all_of(document, criterion)?,
            "$or" => any_of(document, criterion)?,
            other if other.starts_with('$') => {
                return Err(bad_value(format!("unknown top level operator: {}", other)));
            }
            field => field_matches(document.get(field), criterion)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sub_queries(criterion: &Value) -> DriverResult<&Vec<Value>> {
    match criterion {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(bad_value("$and/$or must be a nonempty array")),
    }
}

fn all_of(document: &Document, criterion: &Value) -> DriverResult<bool> {
    for query in sub_queries(criterion)? {
        if !matches(document, query)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn any_of(document: &Document, criterion: &Value) -> DriverResult<bool> {
    for query in sub_queries(criterion)? {
        if matches(document, query)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn field_matches(value: Option<&Value>, criterion: &Value) -> DriverResult<bool> {
    match criterion {
        Value::Object(operators) if is_operator_object(operators) => {
            for (operator, operand) in operators {
                if !operator_matches(value, operator, operand, operators)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        literal => Ok(equals(value, literal)),
    }
}

fn equals(value: Option<&Value>, operand: &Value) -> bool {
    values_equal(value.unwrap_or(&Value::Null), operand)
}

fn in_list(value: Option<&Value>, operand: &Value, operator: &str) -> DriverResult<bool> {
    let Value::Array(candidates) = operand else {
        return Err(bad_value(format!("{} needs an array", operator)));
    };
    Ok(candidates.iter().any(|candidate| equals(value, candidate)))
}

fn range(value: Option<&Value>, operand: &Value, accept: fn(Ordering) -> bool) -> bool {
    value
        .and_then(|value| compare_same_type(value, operand))
        .is_some_and(accept)
}

fn operator_matches(
    value: Option<&Value>,
    operator: &str,
    operand: &Value,
    siblings: &Map<String, Value>,
) -> DriverResult<bool> {
    Ok(match operator {
        "$eq" => equals(value, operand),
        "$ne" => !equals(value, operand),
        "$gt" => range(value, operand, Ordering::is_gt),
        "$gte" => range(value, operand, Ordering::is_ge),
        "$lt" => range(value, operand, Ordering::is_lt),
        "$lte" => range(value, operand, Ordering::is_le),
        "$in" => in_list(value, operand, operator)?,
        "$nin" => !in_list(value, operand, operator)?,
        "$exists" => {
            let wanted = operand
                .as_bool()
                .ok_or_else(|| bad_value("$exists needs a boolean"))?;
            value.is_some() == wanted
        }
        "$regex" => {
            let pattern = operand
                .as_str()
                .ok_or_else(|| bad_value("$regex has to be a string"))?;
            let options = siblings
                .get("$options")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let regex = RegexBuilder::new(pattern)
                .case_insensitive(options.contains('i'))
                .multi_line(options.contains('m'))
                .dot_matches_new_line(options.contains('s'))
                .build()
                .map_err(|e| bad_value(format!("invalid regular expression: {}", e)))?;
            value
                .and_then(Value::as_str)
                .is_some_and(|text| regex.is_match(text))
        }
        "$options" => true,
        other => return Err(bad_value(format!("unknown operator: {}", other))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[test]
    fn test_literal_equality_and_missing_fields() {
        let d = doc(json!({"name": "Ann", "age": 30}));
        assert!(matches(&d, &json!({})).unwrap());
        assert!(matches(&d, &json!({"name": "Ann"})).unwrap());
        assert!(matches(&d, &json!({"age": 30.0})).unwrap());
        assert!(!matches(&d, &json!({"name": "Bo"})).unwrap());
        assert!(matches(&d, &json!({"deleted_at": null})).unwrap());
        assert!(matches(&d, &json!({"deleted_at": {"$eq": null}})).unwrap());
        assert!(!matches(&d, &json!({"deleted_at": {"$ne": null}})).unwrap());
    }

    #[test]
    fn test_range_operators_bracket_types() {
        let d = doc(json!({"age": 30, "name": "Ann"}));
        assert!(matches(&d, &json!({"age": {"$gt": 18, "$lte": 30}})).unwrap());
        assert!(!matches(&d, &json!({"age": {"$gt": "18"}})).unwrap());
        assert!(!matches(&d, &json!({"missing": {"$lt": 5}})).unwrap());
        assert!(matches(&d, &json!({"name": {"$gte": "A"}})).unwrap());
    }

    #[test]
    fn test_in_and_nin() {
        let d = doc(json!({"status": "active"}));
        assert!(matches(&d, &json!({"status": {"$in": ["active", "pending"]}})).unwrap());
        assert!(matches(&d, &json!({"status": {"$nin": ["banned"]}})).unwrap());
        assert!(matches(&d, &json!({"other": {"$in": [null]}})).unwrap());
        assert!(matches(&d, &json!({"status": {"$in": 1}})).is_err());
    }

    #[test]
    fn test_regex_with_options() {
        let d = doc(json!({"email": "Ann@Example.com"}));
        assert!(matches(&d, &json!({"email": {"$regex": "^ann@", "$options": "i"}})).unwrap());
        assert!(!matches(&d, &json!({"email": {"$regex": "^ann@"}})).unwrap());
    }

    #[test]
    fn test_and_or() {
        let d = doc(json!({"a": 1, "b": 2}));
        assert!(matches(&d, &json!({"$and": [{"a": 1}, {"b": {"$gt": 1}}]})).unwrap());
        assert!(!matches(&d, &json!({"$and": [{"a": 1}, {"b": 3}]})).unwrap());
        assert!(matches(&d, &json!({"$or": [{"a": 5}, {"b": 2}]})).unwrap());
        assert!(matches(&d, &json!({"$and": []})).is_err());
    }

    #[test]
    fn test_unknown_operator_is_bad_value() {
        let d = doc(json!({"a": 1}));
        let err = matches(&d, &json!({"a": {"$near": 1}})).unwrap_err();
        assert_eq!(err.code.as_deref(), Some("2"));
        assert!(matches(&d, &json!({"$where": "1"})).is_err());
    }

    #[test]
    fn test_exists() {
        let d = doc(json!({"a": null}));
        assert!(matches(&d, &json!({"a": {"$exists": true}})).unwrap());
        assert!(matches(&d, &json!({"b": {"$exists": false}})).unwrap());
    }
}
