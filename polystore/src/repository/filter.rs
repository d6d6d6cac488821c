//! Declarative filters, filter conditions and sort specifications
//!
//! A [`Filter`] maps field names to either a literal value (equality) or an
//! operator object such as `{"gte": 18, "lt": 65}`. Filters are backend-neutral;
//! they are lowered to [`FilterCondition`] lists and from there into a
//! backend-native predicate by the compiler in [`super::compile`].
//!
//! # Example
//!
//! ```rust
//! use polystore::repository::{Filter, FilterOperator};
//! use serde_json::json;
//!
//! let filter = Filter::new()
//!     .eq("status", "active")
//!     .op("age", FilterOperator::GreaterThanOrEqual, 18);
//!
//! let same = Filter::from_value(json!({"status": "active", "age": {"gte": 18}})).unwrap();
//! assert_eq!(filter, same);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use super::error::RepositoryError;
use super::traits::RepositoryResult;
use super::Document;

/// Direction for ordering results
///
/// # Example
///
/// ```rust
/// use polystore::repository::OrderDirection;
///
/// assert_eq!(format!("{}", OrderDirection::Ascending), "asc");
/// assert_eq!(format!("{}", OrderDirection::Descending), "desc");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    Descending,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// Comparison operators for filter conditions
///
/// `Display` renders the SQL token.
///
/// # Example
///
/// ```rust
/// use polystore::repository::FilterOperator;
///
/// assert_eq!(format!("{}", FilterOperator::Equal), "=");
/// assert_eq!(format!("{}", FilterOperator::NotIn), "NOT IN");
/// assert_eq!(FilterOperator::from_key("isNull"), Some(FilterOperator::IsNull));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    /// Equal to (=)
    Equal,
    /// Not equal to (!=)
    NotEqual,
    /// Greater than (>)
    GreaterThan,
    /// Greater than or equal to (>=)
    GreaterThanOrEqual,
    /// Less than (<)
    LessThan,
    /// Less than or equal to (<=)
    LessThanOrEqual,
    /// Pattern matching (LIKE)
    Like,
    /// Value is in a list (IN)
    In,
    /// Value is not in a list (NOT IN)
    NotIn,
    /// Value is null (IS NULL)
    IsNull,
    /// Value is not null (IS NOT NULL)
    IsNotNull,
}

impl FilterOperator {
    /// Key used for this operator inside a filter operator object
    pub const fn key(self) -> &'static str {
        match self {
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::GreaterThan => "gt",
            Self::GreaterThanOrEqual => "gte",
            Self::LessThan => "lt",
            Self::LessThanOrEqual => "lte",
            Self::Like => "like",
            Self::In => "in",
            Self::NotIn => "nin",
            Self::IsNull => "isNull",
            Self::IsNotNull => "isNotNull",
        }
    }

    /// Parse an operator object key
    pub fn from_key(key: &str) -> Option<Self> {
        let op = match key {
            "eq" => Self::Equal,
            "ne" => Self::NotEqual,
            "gt" => Self::GreaterThan,
            "gte" => Self::GreaterThanOrEqual,
            "lt" => Self::LessThan,
            "lte" => Self::LessThanOrEqual,
            "like" => Self::Like,
            "in" => Self::In,
            "nin" => Self::NotIn,
            "isNull" => Self::IsNull,
            "isNotNull" => Self::IsNotNull,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterThanOrEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessThanOrEqual => write!(f, "<="),
            Self::Like => write!(f, "LIKE"),
            Self::In => write!(f, "IN"),
            Self::NotIn => write!(f, "NOT IN"),
            Self::IsNull => write!(f, "IS NULL"),
            Self::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// A single, normalized filter condition
///
/// Conditions are what relational drivers render into a parameterized
/// `WHERE` clause. Null checks carry `Value::Null`; `In`/`NotIn` carry an array.
///
/// # Example
///
/// ```rust
/// use polystore::repository::FilterCondition;
///
/// let status_filter = FilterCondition::eq("status", "active");
/// let age_filter = FilterCondition::gte("age", 18);
/// let name_filter = FilterCondition::like("name", "%smith%");
/// let deleted_filter = FilterCondition::is_null("deleted_at");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FilterCondition {
    /// The field name to filter on
    pub field: String,
    /// The comparison operator
    pub operator: FilterOperator,
    /// The value to compare against
    pub value: Value,
}

impl FilterCondition {
    /// Create a new filter condition
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Create an equality filter (field = value)
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Equal, value)
    }

    /// Create a not-equal filter (field != value)
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::NotEqual, value)
    }

    /// Create a greater-than filter (field > value)
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::GreaterThan, value)
    }

    /// Create a greater-than-or-equal filter (field >= value)
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::GreaterThanOrEqual, value)
    }

    /// Create a less-than filter (field < value)
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::LessThan, value)
    }

    /// Create a less-than-or-equal filter (field <= value)
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::LessThanOrEqual, value)
    }

    /// Create a pattern matching filter (field LIKE pattern)
    ///
    /// `%` matches any run of characters, `_` exactly one.
    pub fn like(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Like, Value::String(pattern.into()))
    }

    /// Create an IN filter (field IN (values...))
    pub fn in_list<V: Into<Value>>(field: impl Into<String>, values: Vec<V>) -> Self {
        let values = values.into_iter().map(Into::into).collect::<Vec<Value>>();
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    /// Create a NOT IN filter (field NOT IN (values...))
    pub fn not_in<V: Into<Value>>(field: impl Into<String>, values: Vec<V>) -> Self {
        let values = values.into_iter().map(Into::into).collect::<Vec<Value>>();
        Self::new(field, FilterOperator::NotIn, Value::Array(values))
    }

    /// Create an IS NULL filter
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNull, Value::Null)
    }

    /// Create an IS NOT NULL filter
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::IsNotNull, Value::Null)
    }
}

/// Criterion on a single field of a [`Filter`]
#[derive(Debug, Clone, PartialEq)]
pub enum FieldFilter {
    /// Literal equality; `null` means IS NULL
    Equals(Value),
    /// Operator object, e.g. `{"gte": 1, "lt": 10}`
    Operators(Map<String, Value>),
}

impl From<Value> for FieldFilter {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Operators(map),
            other => Self::Equals(other),
        }
    }
}

/// Declarative, backend-neutral filter
///
/// Top-level keys are ANDed. Filters compose by shallow merge where a later
/// layer replaces an earlier layer's criterion for the same field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    fields: BTreeMap<String, FieldFilter>,
}

impl Filter {
    /// Create an empty filter (matches everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from a JSON object
    ///
    /// `null` is treated as the empty filter. Any other non-object value is a
    /// validation error.
    pub fn from_value(value: Value) -> RepositoryResult<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(RepositoryError::validation_failed(format!(
                "filter must be a JSON object, got {}",
                other
            ))),
        }
    }

    /// Add an equality criterion
    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldFilter::Equals(value.into()));
        self
    }

    /// Add an operator criterion, extending any operator object already present
    /// for the field
    ///
    /// For [`FilterOperator::IsNull`] and [`FilterOperator::IsNotNull`] the value
    /// is the boolean flag.
    #[must_use]
    pub fn op(
        mut self,
        field: impl Into<String>,
        operator: FilterOperator,
        value: impl Into<Value>,
    ) -> Self {
        let entry = self
            .fields
            .entry(field.into())
            .or_insert_with(|| FieldFilter::Operators(Map::new()));
        if let FieldFilter::Equals(_) = entry {
            *entry = FieldFilter::Operators(Map::new());
        }
        if let FieldFilter::Operators(map) = entry {
            map.insert(operator.key().to_string(), value.into());
        }
        self
    }

    /// Set the criterion for a field, replacing any existing one
    pub fn insert(&mut self, field: impl Into<String>, criterion: impl Into<FieldFilter>) {
        self.fields.insert(field.into(), criterion.into());
    }

    /// Remove the criterion for a field
    pub fn remove(&mut self, field: &str) -> Option<FieldFilter> {
        self.fields.remove(field)
    }

    /// Criterion for a field
    pub fn get(&self, field: &str) -> Option<&FieldFilter> {
        self.fields.get(field)
    }

    /// Whether the filter has a criterion for a field
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Field names in the filter
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Whether the filter has no criteria
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Number of fields with criteria
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Shallow-merge `other` into `self`; `other` wins on shared keys
    pub fn merge(&mut self, other: &Filter) {
        for (field, criterion) in &other.fields {
            self.fields.insert(field.clone(), criterion.clone());
        }
    }

    /// Merge layers from lowest to highest precedence
    pub fn layered<'a>(layers: impl IntoIterator<Item = &'a Filter>) -> Filter {
        let mut merged = Filter::new();
        for layer in layers {
            merged.merge(layer);
        }
        merged
    }

    /// Literal equality entries, used to seed a record created by an upsert
    ///
    /// Includes literal values and operator objects whose only key is `eq`.
    pub fn equality_entries(&self) -> Document {
        let mut seed = Document::new();
        for (field, criterion) in &self.fields {
            match criterion {
                FieldFilter::Equals(value) => {
                    seed.insert(field.clone(), value.clone());
                }
                FieldFilter::Operators(map) if map.len() == 1 => {
                    if let Some(value) = map.get("eq") {
                        seed.insert(field.clone(), value.clone());
                    }
                }
                FieldFilter::Operators(_) => {}
            }
        }
        seed
    }

    /// Lower the filter into normalized conditions
    ///
    /// Unknown operator keys are skipped with a warning, or rejected when
    /// `strict_operators` is set.
    pub fn conditions(&self, strict_operators: bool) -> RepositoryResult<Vec<FilterCondition>> {
        let mut conditions = Vec::with_capacity(self.fields.len());
        for (field, criterion) in &self.fields {
            match criterion {
                FieldFilter::Equals(Value::Null) => {
                    conditions.push(FilterCondition::is_null(field.as_str()));
                }
                FieldFilter::Equals(value) => {
                    conditions.push(FilterCondition::eq(field.as_str(), value.clone()));
                }
                FieldFilter::Operators(map) => {
                    for (key, value) in map {
                        match FilterOperator::from_key(key) {
                            Some(operator) => {
                                conditions.push(operator_condition(field, operator, value)?);
                            }
                            None if strict_operators => {
                                return Err(RepositoryError::validation_failed(format!(
                                    "unknown filter operator `{}` on field `{}`",
                                    key, field
                                )));
                            }
                            None => {
                                tracing::warn!(
                                    field = %field,
                                    operator = %key,
                                    "Ignoring unknown filter operator"
                                );
                            }
                        }
                    }
                }
            }
        }
        Ok(conditions)
    }
}

fn operator_condition(
    field: &str,
    operator: FilterOperator,
    value: &Value,
) -> RepositoryResult<FilterCondition> {
    use FilterOperator as Op;

    let condition = match (operator, value) {
        (Op::Equal, Value::Null) => FilterCondition::is_null(field),
        (Op::NotEqual, Value::Null) => FilterCondition::is_not_null(field),
        (Op::In | Op::NotIn, Value::Array(_)) => {
            FilterCondition::new(field, operator, value.clone())
        }
        (Op::In | Op::NotIn, _) => {
            return Err(RepositoryError::validation_failed(format!(
                "`{}` on field `{}` expects an array",
                operator.key(),
                field
            )))
        }
        (Op::Like, Value::String(pattern)) => FilterCondition::like(field, pattern.as_str()),
        (Op::Like, _) => {
            return Err(RepositoryError::validation_failed(format!(
                "`like` on field `{}` expects a string pattern",
                field
            )))
        }
        (Op::IsNull, Value::Bool(true)) | (Op::IsNotNull, Value::Bool(false)) => {
            FilterCondition::is_null(field)
        }
        (Op::IsNull, Value::Bool(false)) | (Op::IsNotNull, Value::Bool(true)) => {
            FilterCondition::is_not_null(field)
        }
        (Op::IsNull | Op::IsNotNull, _) => {
            return Err(RepositoryError::validation_failed(format!(
                "`{}` on field `{}` expects a boolean",
                operator.key(),
                field
            )))
        }
        _ => FilterCondition::new(field, operator, value.clone()),
    };
    Ok(condition)
}

impl From<Document> for Filter {
    fn from(map: Document) -> Self {
        let fields = map
            .into_iter()
            .map(|(field, value)| (field, FieldFilter::from(value)))
            .collect();
        Self { fields }
    }
}

impl TryFrom<Value> for Filter {
    type Error = RepositoryError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

/// One field of a sort specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortField {
    /// Field to order by
    pub field: String,
    /// Direction
    pub direction: OrderDirection,
}

impl SortField {
    pub fn new(field: impl Into<String>, direction: OrderDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// Ordered sort specification
///
/// Parsed from a comma-separated list where a leading `-` means descending and
/// `+` or no prefix means ascending.
///
/// # Example
///
/// ```rust
/// use polystore::repository::{OrderDirection, Sort};
///
/// let sort = Sort::parse("-created_at, name");
/// assert_eq!(sort.fields()[0].direction, OrderDirection::Descending);
/// assert_eq!(sort.fields()[1].field, "name");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sort {
    fields: Vec<SortField>,
}

impl Sort {
    /// Parse a sort string
    pub fn parse(spec: &str) -> Self {
        let fields = spec
            .split(',')
            .map(str::trim)
            .filter_map(|part| {
                let (direction, field) = if let Some(rest) = part.strip_prefix('-') {
                    (OrderDirection::Descending, rest)
                } else if let Some(rest) = part.strip_prefix('+') {
                    (OrderDirection::Ascending, rest)
                } else {
                    (OrderDirection::Ascending, part)
                };
                let field = field.trim();
                (!field.is_empty()).then(|| SortField {
                    field: field.to_string(),
                    direction,
                })
            })
            .collect();
        Self { fields }
    }

    /// Append an ascending field
    #[must_use]
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(SortField {
            field: field.into(),
            direction: OrderDirection::Ascending,
        });
        self
    }

    /// Append a descending field
    #[must_use]
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(SortField {
            field: field.into(),
            direction: OrderDirection::Descending,
        });
        self
    }

    /// Sort fields in priority order
    pub fn fields(&self) -> &[SortField] {
        &self.fields
    }

    /// Whether no ordering was requested
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromStr for Sort {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Sort {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryErrorKind;
    use serde_json::json;

    #[test]
    fn test_filter_operator_display() {
        assert_eq!(format!("{}", FilterOperator::Equal), "=");
        assert_eq!(format!("{}", FilterOperator::NotEqual), "!=");
        assert_eq!(format!("{}", FilterOperator::GreaterThanOrEqual), ">=");
        assert_eq!(format!("{}", FilterOperator::Like), "LIKE");
        assert_eq!(format!("{}", FilterOperator::NotIn), "NOT IN");
        assert_eq!(format!("{}", FilterOperator::IsNotNull), "IS NOT NULL");
    }

    #[test]
    fn test_operator_keys() {
        for op in [
            FilterOperator::Equal,
            FilterOperator::NotEqual,
            FilterOperator::GreaterThan,
            FilterOperator::GreaterThanOrEqual,
            FilterOperator::LessThan,
            FilterOperator::LessThanOrEqual,
            FilterOperator::Like,
            FilterOperator::In,
            FilterOperator::NotIn,
            FilterOperator::IsNull,
            FilterOperator::IsNotNull,
        ] {
            assert_eq!(FilterOperator::from_key(op.key()), Some(op));
        }
        assert_eq!(FilterOperator::from_key("regex"), None);
    }

    #[test]
    fn test_from_value_rejects_non_object() {
        let err = Filter::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert!(Filter::from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_scalar_and_null_equality() {
        let filter = Filter::from_value(json!({"name": "Ann", "deleted_at": null})).unwrap();
        let conditions = filter.conditions(false).unwrap();
        assert_eq!(
            conditions,
            vec![
                FilterCondition::is_null("deleted_at"),
                FilterCondition::eq("name", "Ann"),
            ]
        );
    }

    #[test]
    fn test_operator_object_lowering() {
        let filter = Filter::from_value(json!({
            "age": {"gte": 18, "lt": 65},
            "role": {"in": ["admin", "owner"]},
            "email": {"isNull": false},
            "nickname": {"isNotNull": false},
            "name": {"like": "A%"},
            "score": {"ne": null},
        }))
        .unwrap();
        let conditions = filter.conditions(false).unwrap();
        assert!(conditions.contains(&FilterCondition::gte("age", 18)));
        assert!(conditions.contains(&FilterCondition::lt("age", 65)));
        assert!(conditions.contains(&FilterCondition::in_list("role", vec!["admin", "owner"])));
        assert!(conditions.contains(&FilterCondition::is_not_null("email")));
        assert!(conditions.contains(&FilterCondition::is_null("nickname")));
        assert!(conditions.contains(&FilterCondition::like("name", "A%")));
        assert!(conditions.contains(&FilterCondition::is_not_null("score")));
        assert_eq!(conditions.len(), 7);
    }

    #[test]
    fn test_unknown_operator_ignored_unless_strict() {
        let filter = Filter::from_value(json!({"age": {"between": [1, 2], "gt": 1}})).unwrap();
        assert_eq!(
            filter.conditions(false).unwrap(),
            vec![FilterCondition::gt("age", 1)]
        );

        let err = filter.conditions(true).unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
        assert!(err.message.contains("between"));
    }

    #[test]
    fn test_operator_value_validation() {
        let in_scalar = Filter::from_value(json!({"role": {"in": "admin"}})).unwrap();
        assert!(in_scalar.conditions(false).is_err());

        let like_number = Filter::from_value(json!({"name": {"like": 5}})).unwrap();
        assert!(like_number.conditions(false).is_err());

        let null_flag = Filter::from_value(json!({"name": {"isNull": "yes"}})).unwrap();
        assert!(null_flag.conditions(false).is_err());
    }

    #[test]
    fn test_merge_later_layer_wins() {
        let default_filter = Filter::new().eq("status", "active").eq("tenant", "a");
        let caller = Filter::new().eq("status", "archived");
        let merged = Filter::layered([&default_filter, &caller]);
        assert_eq!(
            merged.get("status"),
            Some(&FieldFilter::Equals(json!("archived")))
        );
        assert_eq!(merged.get("tenant"), Some(&FieldFilter::Equals(json!("a"))));
    }

    #[test]
    fn test_builder_op_extends_operator_object() {
        let filter = Filter::new()
            .eq("age", 3)
            .op("age", FilterOperator::GreaterThan, 1)
            .op("age", FilterOperator::LessThan, 9);
        assert_eq!(
            filter,
            Filter::from_value(json!({"age": {"gt": 1, "lt": 9}})).unwrap()
        );
    }

    #[test]
    fn test_equality_entries() {
        let filter = Filter::from_value(json!({
            "email": "a@example.com",
            "tenant": {"eq": "t1"},
            "age": {"gt": 3},
        }))
        .unwrap();
        let seed = filter.equality_entries();
        assert_eq!(seed.get("email"), Some(&json!("a@example.com")));
        assert_eq!(seed.get("tenant"), Some(&json!("t1")));
        assert!(!seed.contains_key("age"));
    }

    #[test]
    fn test_sort_parse() {
        let sort = Sort::parse("-created_at, +name,,email");
        assert_eq!(
            sort.fields(),
            &[
                SortField {
                    field: "created_at".into(),
                    direction: OrderDirection::Descending
                },
                SortField {
                    field: "name".into(),
                    direction: OrderDirection::Ascending
                },
                SortField {
                    field: "email".into(),
                    direction: OrderDirection::Ascending
                },
            ]
        );
        assert!(Sort::parse("").is_empty());
        assert!(Sort::parse(" - ").is_empty());
    }

    #[test]
    fn test_sort_builder() {
        let sort = Sort::default().desc("age").asc("name");
        assert_eq!(sort, Sort::parse("-age,name"));
    }
}
