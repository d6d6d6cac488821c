//! Filter compiler: lowers a [`Filter`] into backend-native predicates

use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use super::error::RepositoryError;
use super::filter::{Filter, FilterCondition, FilterOperator, Sort};
use super::traits::RepositoryResult;

/// Set of fields a relational entity may filter, sort or project on
///
/// An empty whitelist is unrestricted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnWhitelist {
    columns: BTreeSet<String>,
}

impl ColumnWhitelist {
    /// Build a whitelist from explicit columns plus always-admitted fields
    ///
    /// When `columns` is empty the result is unrestricted and `always` is ignored.
    pub fn new<'a>(
        columns: impl IntoIterator<Item = &'a str>,
        always: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let mut set: BTreeSet<String> = columns.into_iter().map(str::to_string).collect();
        if !set.is_empty() {
            set.extend(always.into_iter().map(str::to_string));
        }
        Self { columns: set }
    }

    /// Whether the whitelist restricts nothing
    pub fn is_unrestricted(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether `field` may be used
    pub fn allows(&self, field: &str) -> bool {
        self.columns.is_empty() || self.columns.contains(field)
    }

    /// Reject `field` unless allowed
    pub fn check(&self, field: &str, usage: &str, entity: &str) -> RepositoryResult<()> {
        if self.allows(field) {
            Ok(())
        } else {
            Err(RepositoryError::configuration(format!(
                "{} field `{}` is not an allowed column of `{}`",
                usage, field, entity
            )))
        }
    }
}

/// Compile a filter into a MongoDB-style query document
///
/// A single condition becomes `{field: {$op: value}}`; several are wrapped in
/// `$and`. The empty filter compiles to `{}`.
pub fn compile_document(filter: &Filter, strict_operators: bool) -> RepositoryResult<Value> {
    let mut clauses = filter
        .conditions(strict_operators)?
        .into_iter()
        .map(|condition| document_clause(&condition))
        .collect::<RepositoryResult<Vec<Value>>>()?;

    Ok(match clauses.len() {
        0 => Value::Object(Map::new()),
        1 => clauses.remove(0),
        _ => json!({ "$and": clauses }),
    })
}

fn document_clause(condition: &FilterCondition) -> RepositoryResult<Value> {
    use FilterOperator as Op;

    let (key, value) = match condition.operator {
        Op::Equal => ("$eq", condition.value.clone()),
        Op::NotEqual => ("$ne", condition.value.clone()),
        Op::GreaterThan => ("$gt", condition.value.clone()),
        Op::GreaterThanOrEqual => ("$gte", condition.value.clone()),
        Op::LessThan => ("$lt", condition.value.clone()),
        Op::LessThanOrEqual => ("$lte", condition.value.clone()),
        Op::In => ("$in", condition.value.clone()),
        Op::NotIn => ("$nin", condition.value.clone()),
        Op::IsNull => ("$eq", Value::Null),
        Op::IsNotNull => ("$ne", Value::Null),
        Op::Like => {
            let pattern = condition.value.as_str().ok_or_else(|| {
                RepositoryError::validation_failed(format!(
                    "`like` on field `{}` expects a string pattern",
                    condition.field
                ))
            })?;
            ("$regex", Value::String(like_to_regex(pattern)))
        }
    };

    let mut operators = Map::new();
    operators.insert(key.to_string(), value);
    if condition.operator == Op::Like {
        // SQL LIKE wildcards cross line breaks
        operators.insert("$options".to_string(), Value::String("s".to_string()));
    }
    let mut clause = Map::new();
    clause.insert(condition.field.clone(), Value::Object(operators));
    Ok(Value::Object(clause))
}

/// Compile a filter into relational conditions, enforcing the column whitelist
pub fn compile_relational(
    filter: &Filter,
    whitelist: &ColumnWhitelist,
    entity: &str,
    strict_operators: bool,
) -> RepositoryResult<Vec<FilterCondition>> {
    for field in filter.fields() {
        whitelist.check(field, "filter", entity)?;
    }
    filter.conditions(strict_operators)
}

/// Check every sort field against the whitelist
pub fn check_sort(sort: &Sort, whitelist: &ColumnWhitelist, entity: &str) -> RepositoryResult<()> {
    for field in sort.fields() {
        whitelist.check(&field.field, "sort", entity)?;
    }
    Ok(())
}

/// Translate a SQL `LIKE` pattern into an anchored regular expression
///
/// `%` becomes `.*`, `_` becomes `.` and a backslash escapes the next character.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        match c {
            '%' | '_' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if c == '%' { ".*" } else { "." });
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    literal.push(escaped);
                }
            }
            other => literal.push(other),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryErrorKind;

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("A%"), "^A.*$");
        assert_eq!(like_to_regex("_b%"), "^.b.*$");
        assert_eq!(like_to_regex("a.c"), "^a\\.c$");
        assert_eq!(like_to_regex("100\\%"), "^100%$");

        let re = regex::Regex::new(&like_to_regex("%smith%")).unwrap();
        assert!(re.is_match("john smithers"));
        assert!(!re.is_match("john smyth"));
    }

    #[test]
    fn test_compile_document_single_condition() {
        let filter = Filter::new().eq("name", "Ann");
        let query = compile_document(&filter, false).unwrap();
        assert_eq!(query, json!({"name": {"$eq": "Ann"}}));
    }

    #[test]
    fn test_compile_document_many_conditions() {
        let filter = Filter::from_value(json!({
            "age": {"gte": 18},
            "deleted_at": null,
            "name": {"like": "A%"},
        }))
        .unwrap();
        let query = compile_document(&filter, false).unwrap();
        assert_eq!(
            query,
            json!({"$and": [
                {"age": {"$gte": 18}},
                {"deleted_at": {"$eq": null}},
                {"name": {"$regex": "^A.*$", "$options": "s"}},
            ]})
        );
    }

    #[test]
    fn test_compile_document_empty() {
        assert_eq!(compile_document(&Filter::new(), false).unwrap(), json!({}));
    }

    #[test]
    fn test_compile_relational_whitelist() {
        let whitelist = ColumnWhitelist::new(["id", "name", "email"], ["deleted_at"]);
        let ok = Filter::new().eq("name", "Ann").eq("deleted_at", Value::Null);
        let conditions = compile_relational(&ok, &whitelist, "users", false).unwrap();
        assert_eq!(conditions.len(), 2);

        let bad = Filter::new().eq("password", "x");
        let err = compile_relational(&bad, &whitelist, "users", false).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
        assert!(err.message.contains("password"));
    }

    #[test]
    fn test_empty_whitelist_is_unrestricted() {
        let whitelist = ColumnWhitelist::new(Vec::new(), ["id"]);
        assert!(whitelist.is_unrestricted());
        assert!(whitelist.allows("anything"));
    }

    #[test]
    fn test_check_sort() {
        let whitelist = ColumnWhitelist::new(["id", "name"], Vec::new());
        assert!(check_sort(&Sort::parse("-name,id"), &whitelist, "users").is_ok());
        let err = check_sort(&Sort::parse("-secret"), &whitelist, "users").unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::Configuration);
    }
}
