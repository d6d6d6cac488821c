//! In-memory relational store
//!
//! Evaluates query descriptions directly with SQL semantics: comparisons with
//! NULL are false, `LIKE` is case-sensitive, ascending sorts put NULLs last.
//! Errors carry PostgreSQL SQLSTATE codes so classification behaves as it
//! would against a server.
//!
//! Tables are declared up front with [`TableSchema`] (strict mode), or created
//! on first insert with an auto-increment `id` key when the driver is built
//! with [`MemoryRelationalDriver::new`] (implicit mode). In implicit mode
//! unknown columns are added as they are written and read as NULL.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{compare_same_type, sort_order, values_equal, Counters, FaultQueue, MemoryStats};
use crate::driver::{
    CountQuery, DeleteQuery, InsertQuery, RelationalDriver, RelationalExecutor,
    RelationalTransaction, SelectQuery, UpdateQuery,
};
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, DriverResult};
use crate::repository::compile::like_to_regex;
use crate::repository::{Document, FilterCondition, FilterOperator, OrderDirection, SortField};
use crate::transaction::TransactionSettings;

/// SQLSTATE codes raised by this driver
mod sqlstate {
    pub const UNDEFINED_TABLE: &str = "42P01";
    pub const UNDEFINED_COLUMN: &str = "42703";
    pub const DUPLICATE_TABLE: &str = "42P07";
    pub const UNIQUE_VIOLATION: &str = "23505";
    pub const NOT_NULL_VIOLATION: &str = "23502";
    pub const DATATYPE_MISMATCH: &str = "42804";
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const QUERY_CANCELED: &str = "57014";
    pub const NO_ACTIVE_TRANSACTION: &str = "25P01";
}

/// Declared shape of a table
///
/// # Example
///
/// ```rust
/// use polystore::driver::TableSchema;
///
/// let users = TableSchema::new("users", ["name", "email"]);
/// assert_eq!(users.primary_key, "id");
/// assert_eq!(users.columns, vec!["id", "name", "email"]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    /// Column names in declaration order, primary key included
    pub columns: Vec<String>,
    /// Assign `max(key) + 1` when an insert omits the primary key
    pub auto_increment: bool,
}

impl TableSchema {
    /// Schema with an auto-increment `id` primary key plus `columns`
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let schema = Self {
            name: name.into(),
            primary_key: "id".to_string(),
            columns: Vec::new(),
            auto_increment: true,
        };
        schema.with_columns(columns)
    }

    fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![self.primary_key.clone()];
        for column in columns {
            let column = column.into();
            if !all.contains(&column) {
                all.push(column);
            }
        }
        self.columns = all;
        self
    }

    /// Use `column` as the primary key
    #[must_use]
    pub fn primary_key(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        let rest: Vec<String> = self
            .columns
            .iter()
            .filter(|c| **c != self.primary_key && **c != column)
            .cloned()
            .collect();
        self.primary_key = column;
        self.with_columns(rest)
    }

    #[must_use]
    pub fn auto_increment(mut self, enabled: bool) -> Self {
        self.auto_increment = enabled;
        self
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

#[derive(Debug, Clone)]
struct Table {
    schema: TableSchema,
    rows: Vec<Document>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Row with every declared column present
    fn full_row(&self, row: &Document) -> Document {
        self.schema
            .columns
            .iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
            .collect()
    }

    fn next_key(&self) -> i64 {
        self.rows
            .iter()
            .filter_map(|row| row.get(&self.schema.primary_key).and_then(Value::as_i64))
            .max()
            .unwrap_or(0)
            + 1
    }
}

type Tables = HashMap<String, Table>;

#[derive(Debug, Default)]
struct Database {
    tables: Tables,
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    database: Mutex<Database>,
    implicit: bool,
    stats: Counters,
    faults: FaultQueue,
    closed: AtomicBool,
}

fn undefined_table(operation: DatabaseOperation, table: &str) -> DatabaseError {
    DatabaseError::with_context(
        operation,
        DatabaseErrorKind::NotFound,
        format!("relation \"{}\" does not exist", table),
        table,
    )
    .with_code(sqlstate::UNDEFINED_TABLE)
}

fn undefined_column(operation: DatabaseOperation, table: &str, column: &str) -> DatabaseError {
    DatabaseError::with_context(
        operation,
        DatabaseErrorKind::QueryFailed,
        format!("column \"{}\" does not exist", column),
        table,
    )
    .with_code(sqlstate::UNDEFINED_COLUMN)
}

// ============================================================================
// Query evaluation
// ============================================================================

/// Query evaluation over one table map (shared store or transaction snapshot)
struct Evaluator<'a> {
    tables: &'a mut Tables,
    implicit: bool,
}

impl Evaluator<'_> {
    fn table(&self, operation: DatabaseOperation, name: &str) -> DriverResult<Option<&Table>> {
        match self.tables.get(name) {
            Some(table) => Ok(Some(table)),
            None if self.implicit => Ok(None),
            None => Err(undefined_table(operation, name)),
        }
    }

    fn table_mut(&mut self, operation: DatabaseOperation, name: &str) -> DriverResult<&mut Table> {
        if self.implicit {
            return Ok(self
                .tables
                .entry(name.to_string())
                .or_insert_with(|| Table::new(TableSchema::new(name, Vec::<String>::new()))));
        }
        self.tables
            .get_mut(name)
            .ok_or_else(|| undefined_table(operation, name))
    }

    /// Check (strict) or register (implicit) the columns a statement touches
    fn columns<'c>(
        implicit: bool,
        operation: DatabaseOperation,
        table: &mut Table,
        columns: impl IntoIterator<Item = &'c String>,
    ) -> DriverResult<()> {
        for column in columns {
            if table.schema.has_column(column) {
                continue;
            }
            if implicit {
                table.schema.columns.push(column.clone());
            } else {
                return Err(undefined_column(operation, &table.schema.name, column));
            }
        }
        Ok(())
    }

    fn check_columns<'c>(
        &self,
        operation: DatabaseOperation,
        table: &Table,
        columns: impl IntoIterator<Item = &'c String>,
    ) -> DriverResult<()> {
        if self.implicit {
            return Ok(());
        }
        for column in columns {
            if !table.schema.has_column(column) {
                return Err(undefined_column(operation, &table.schema.name, column));
            }
        }
        Ok(())
    }

    fn matching_rows<'t>(
        table: &'t Table,
        conditions: &[FilterCondition],
    ) -> DriverResult<Vec<&'t Document>> {
        let predicates = Predicates::compile(conditions)?;
        Ok(table.rows.iter().filter(|row| predicates.matches(row)).collect())
    }

    fn select(&mut self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        let operation = DatabaseOperation::Query;
        let Some(table) = self.table(operation, &query.table)? else {
            return Ok(Vec::new());
        };
        self.check_columns(operation, table, query.conditions.iter().map(|c| &c.field))?;
        self.check_columns(operation, table, query.order_by.iter().map(|s| &s.field))?;
        if let Some(columns) = &query.columns {
            self.check_columns(operation, table, columns)?;
        }

        let mut rows = Self::matching_rows(table, &query.conditions)?;
        sort_rows(&mut rows, &query.order_by);

        let mut projected: Vec<Document> = Vec::with_capacity(rows.len());
        for row in rows {
            let row = match &query.columns {
                Some(columns) => columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect(),
                None => table.full_row(row),
            };
            if query.distinct && projected.iter().any(|seen| rows_equal(seen, &row)) {
                continue;
            }
            projected.push(row);
        }

        let offset = query
            .offset
            .map_or(0, |o| usize::try_from(o).unwrap_or(usize::MAX));
        let limit = query
            .limit
            .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
        Ok(projected.into_iter().skip(offset).take(limit).collect())
    }

    fn count(&mut self, query: &CountQuery) -> DriverResult<u64> {
        let operation = DatabaseOperation::Count;
        let Some(table) = self.table(operation, &query.table)? else {
            return Ok(0);
        };
        self.check_columns(operation, table, query.conditions.iter().map(|c| &c.field))?;
        Ok(Self::matching_rows(table, &query.conditions)?.len() as u64)
    }

    fn insert(&mut self, query: &InsertQuery) -> DriverResult<Document> {
        let operation = DatabaseOperation::Insert;
        let implicit = self.implicit;
        let table = self.table_mut(operation, &query.table)?;
        Self::columns(implicit, operation, table, query.values.keys())?;

        let pk = table.schema.primary_key.clone();
        let mut row = query.values.clone();
        let missing_key = row.get(&pk).map_or(true, Value::is_null);
        if missing_key {
            if !table.schema.auto_increment {
                return Err(DatabaseError::with_context(
                    operation,
                    DatabaseErrorKind::ConstraintViolation,
                    format!("null value in column \"{}\" violates not-null constraint", pk),
                    table.schema.name.as_str(),
                )
                .with_code(sqlstate::NOT_NULL_VIOLATION));
            }
            row.insert(pk.clone(), Value::from(table.next_key()));
        }

        if let Some(key) = row.get(&pk) {
            if table
                .rows
                .iter()
                .any(|existing| existing.get(&pk).is_some_and(|k| values_equal(k, key)))
            {
                return Err(DatabaseError::with_context(
                    operation,
                    DatabaseErrorKind::ConstraintViolation,
                    format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        table.schema.name
                    ),
                    table.schema.name.as_str(),
                )
                .with_code(sqlstate::UNIQUE_VIOLATION));
            }
        }

        let row = table.full_row(&row);
        table.rows.push(row.clone());
        Ok(row)
    }

    fn update(&mut self, query: &UpdateQuery) -> DriverResult<u64> {
        let operation = DatabaseOperation::Update;
        let implicit = self.implicit;
        let table = self.table_mut(operation, &query.table)?;
        Self::columns(implicit, operation, table, query.values.keys())?;
        Self::columns(implicit, operation, table, query.conditions.iter().map(|c| &c.field))?;

        let predicates = Predicates::compile(&query.conditions)?;
        let indexes: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| predicates.matches(row))
            .map(|(i, _)| i)
            .collect();

        let pk = table.schema.primary_key.clone();
        if let Some(new_key) = query.values.get(&pk) {
            let clashes = table.rows.iter().enumerate().any(|(i, row)| {
                !indexes.contains(&i) && row.get(&pk).is_some_and(|k| values_equal(k, new_key))
            });
            if clashes || (indexes.len() > 1 && !new_key.is_null()) {
                return Err(DatabaseError::with_context(
                    operation,
                    DatabaseErrorKind::ConstraintViolation,
                    format!(
                        "duplicate key value violates unique constraint \"{}_pkey\"",
                        table.schema.name
                    ),
                    table.schema.name.as_str(),
                )
                .with_code(sqlstate::UNIQUE_VIOLATION));
            }
        }

        for &index in &indexes {
            let row = &mut table.rows[index];
            for (column, value) in &query.values {
                row.insert(column.clone(), value.clone());
            }
        }
        Ok(indexes.len() as u64)
    }

    fn delete(&mut self, query: &DeleteQuery) -> DriverResult<u64> {
        let operation = DatabaseOperation::Delete;
        if self.implicit && !self.tables.contains_key(&query.table) {
            return Ok(0);
        }
        let implicit = self.implicit;
        let table = self.table_mut(operation, &query.table)?;
        Self::columns(implicit, operation, table, query.conditions.iter().map(|c| &c.field))?;

        let predicates = Predicates::compile(&query.conditions)?;
        let before = table.rows.len();
        table.rows.retain(|row| !predicates.matches(row));
        Ok((before - table.rows.len()) as u64)
    }
}

fn rows_equal(a: &Document, b: &Document) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
}

/// ORDER BY with PostgreSQL null placement: NULLS LAST ascending, NULLS FIRST descending
fn sort_rows(rows: &mut [&Document], order_by: &[SortField]) {
    rows.sort_by(|a, b| {
        for key in order_by {
            let left = a.get(&key.field).unwrap_or(&Value::Null);
            let right = b.get(&key.field).unwrap_or(&Value::Null);
            let ordering = match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => sort_order(left, right),
            };
            let ordering = match key.direction {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

enum Predicate<'q> {
    Compare(&'q str, FilterOperator, &'q Value),
    Like(&'q str, Regex),
    InList(&'q str, &'q [Value], bool),
    Null(&'q str, bool),
}

/// Conditions prepared for evaluation, ANDed
struct Predicates<'q>(Vec<Predicate<'q>>);

impl<'q> Predicates<'q> {
    fn compile(conditions: &'q [FilterCondition]) -> DriverResult<Self> {
        let mismatch = |condition: &FilterCondition, expected: &str| {
            DatabaseError::new(
                DatabaseOperation::Query,
                DatabaseErrorKind::QueryFailed,
                format!(
                    "operator {} on column \"{}\" expects {}",
                    condition.operator, condition.field, expected
                ),
            )
            .with_code(sqlstate::DATATYPE_MISMATCH)
        };

        let mut predicates = Vec::with_capacity(conditions.len());
        for condition in conditions {
            let field = condition.field.as_str();
            let predicate = match condition.operator {
                FilterOperator::Like => {
                    let pattern = condition
                        .value
                        .as_str()
                        .ok_or_else(|| mismatch(condition, "a text pattern"))?;
                    let regex = Regex::new(&format!("(?s){}", like_to_regex(pattern)))
                        .map_err(|e| mismatch(condition, &e.to_string()))?;
                    Predicate::Like(field, regex)
                }
                FilterOperator::In | FilterOperator::NotIn => {
                    let list = condition
                        .value
                        .as_array()
                        .ok_or_else(|| mismatch(condition, "an array"))?;
                    Predicate::InList(field, list, condition.operator == FilterOperator::In)
                }
                FilterOperator::IsNull => Predicate::Null(field, true),
                FilterOperator::IsNotNull => Predicate::Null(field, false),
                operator => Predicate::Compare(field, operator, &condition.value),
            };
            predicates.push(predicate);
        }
        Ok(Self(predicates))
    }

    fn matches(&self, row: &Document) -> bool {
        self.0.iter().all(|predicate| {
            let column = |field: &str| row.get(field).filter(|v| !v.is_null());
            match predicate {
                Predicate::Null(field, want_null) => column(*field).is_none() == *want_null,
                Predicate::Compare(field, operator, operand) => {
                    let Some(value) = column(*field) else {
                        return false;
                    };
                    if operand.is_null() {
                        return false;
                    }
                    match operator {
                        FilterOperator::Equal => values_equal(value, operand),
                        FilterOperator::NotEqual => !values_equal(value, operand),
                        FilterOperator::GreaterThan => {
                            compare_same_type(value, operand).is_some_and(Ordering::is_gt)
                        }
                        FilterOperator::GreaterThanOrEqual => {
                            compare_same_type(value, operand).is_some_and(Ordering::is_ge)
                        }
                        FilterOperator::LessThan => {
                            compare_same_type(value, operand).is_some_and(Ordering::is_lt)
                        }
                        FilterOperator::LessThanOrEqual => {
                            compare_same_type(value, operand).is_some_and(Ordering::is_le)
                        }
                        _ => false,
                    }
                }
                Predicate::Like(field, regex) => match column(*field) {
                    Some(Value::String(text)) => regex.is_match(text),
                    Some(other) => regex.is_match(&other.to_string()),
                    None => false,
                },
                Predicate::InList(field, list, positive) => {
                    let Some(value) = column(*field) else {
                        return false;
                    };
                    let found = list.iter().any(|item| values_equal(value, item));
                    if *positive {
                        found
                    } else {
                        !found && !list.iter().any(Value::is_null)
                    }
                }
            }
        })
    }
}

// ============================================================================
// Driver
// ============================================================================

/// In-memory [`RelationalDriver`]
///
/// Cloning yields another handle to the same data.
#[derive(Debug, Clone)]
pub struct MemoryRelationalDriver {
    shared: Arc<Shared>,
}

impl Default for MemoryRelationalDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelationalDriver {
    /// Driver that creates tables and columns as they are written
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                implicit: true,
                ..Shared::default()
            }),
        }
    }

    /// Driver with a fixed set of declared tables
    pub fn with_tables(tables: impl IntoIterator<Item = TableSchema>) -> Self {
        let tables = tables
            .into_iter()
            .map(|schema| (schema.name.clone(), Table::new(schema)))
            .collect();
        Self {
            shared: Arc::new(Shared {
                database: Mutex::new(Database { tables, version: 0 }),
                ..Shared::default()
            }),
        }
    }

    /// Declare a table
    ///
    /// # Errors
    ///
    /// Fails with SQLSTATE `42P07` if the table already exists.
    pub async fn create_table(&self, schema: TableSchema) -> DriverResult<()> {
        let mut database = self.shared.database.lock().await;
        if database.tables.contains_key(&schema.name) {
            return Err(DatabaseError::new(
                DatabaseOperation::Query,
                DatabaseErrorKind::QueryFailed,
                format!("relation \"{}\" already exists", schema.name),
            )
            .with_code(sqlstate::DUPLICATE_TABLE));
        }
        tracing::debug!(table = %schema.name, columns = ?schema.columns, "table created");
        database.tables.insert(schema.name.clone(), Table::new(schema));
        database.version += 1;
        Ok(())
    }

    /// Make the next commit fail with `error`; queued errors are used in order
    pub fn fail_next_commit(&self, error: DatabaseError) {
        self.shared.faults.push(error);
    }

    pub fn stats(&self) -> MemoryStats {
        self.shared.stats.snapshot()
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.shared.closed.load(AtomicOrdering::Acquire) {
            Err(DatabaseError::connection_failed("memory relational driver is closed"))
        } else {
            Ok(())
        }
    }

    async fn run<R>(
        &self,
        write: bool,
        f: impl FnOnce(&mut Evaluator<'_>) -> DriverResult<R>,
    ) -> DriverResult<R> {
        self.ensure_open()?;
        let mut database = self.shared.database.lock().await;
        let mut evaluator = Evaluator {
            tables: &mut database.tables,
            implicit: self.shared.implicit,
        };
        let result = f(&mut evaluator)?;
        if write {
            database.version += 1;
        }
        Ok(result)
    }
}

#[async_trait]
impl RelationalExecutor for MemoryRelationalDriver {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        self.run(false, |db| db.select(query)).await
    }

    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document> {
        self.run(true, |db| db.insert(query)).await
    }

    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64> {
        self.run(true, |db| db.update(query)).await
    }

    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64> {
        self.run(true, |db| db.delete(query)).await
    }

    async fn count(&self, query: &CountQuery) -> DriverResult<u64> {
        self.run(false, |db| db.count(query)).await
    }
}

#[async_trait]
impl RelationalDriver for MemoryRelationalDriver {
    async fn begin(
        &self,
        settings: &TransactionSettings,
    ) -> DriverResult<Arc<dyn RelationalTransaction>> {
        self.ensure_open()?;
        let database = self.shared.database.lock().await;
        let snapshot = Snapshot {
            tables: database.tables.clone(),
            base_version: database.version,
            dirty: false,
            deadline: settings.timeout.map(|timeout| Instant::now() + timeout),
        };
        Counters::bump(&self.shared.stats.transactions_started);
        tracing::debug!(isolation = ?settings.isolation_level, "transaction started");
        Ok(Arc::new(MemoryRelationalTransaction {
            shared: self.shared.clone(),
            state: Mutex::new(Some(snapshot)),
        }))
    }

    async fn close(&self) -> DriverResult<()> {
        self.shared.closed.store(true, AtomicOrdering::Release);
        tracing::info!("memory relational driver closed");
        Ok(())
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug)]
struct Snapshot {
    tables: Tables,
    base_version: u64,
    dirty: bool,
    deadline: Option<Instant>,
}

/// Transaction handed out by [`MemoryRelationalDriver::begin`]
///
/// Works on a private copy of every table; the copy replaces the shared
/// tables on commit unless another writer committed first.
#[derive(Debug)]
pub struct MemoryRelationalTransaction {
    shared: Arc<Shared>,
    state: Mutex<Option<Snapshot>>,
}

impl MemoryRelationalTransaction {
    fn finished() -> DatabaseError {
        DatabaseError::new(
            DatabaseOperation::Transaction,
            DatabaseErrorKind::TransactionFailed,
            "transaction has already been committed or rolled back",
        )
        .with_code(sqlstate::NO_ACTIVE_TRANSACTION)
    }

    async fn run<R>(
        &self,
        operation: DatabaseOperation,
        write: bool,
        f: impl FnOnce(&mut Evaluator<'_>) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let mut state = self.state.lock().await;
        let snapshot = state.as_mut().ok_or_else(Self::finished)?;
        if snapshot
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(DatabaseError::timeout(
                operation,
                "canceling statement due to statement timeout",
            )
            .with_code(sqlstate::QUERY_CANCELED));
        }
        let mut evaluator = Evaluator {
            tables: &mut snapshot.tables,
            implicit: self.shared.implicit,
        };
        let result = f(&mut evaluator)?;
        snapshot.dirty |= write;
        Ok(result)
    }
}

#[async_trait]
impl RelationalExecutor for MemoryRelationalTransaction {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        self.run(DatabaseOperation::Query, false, |db| db.select(query))
            .await
    }

    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document> {
        self.run(DatabaseOperation::Insert, true, |db| db.insert(query))
            .await
    }

    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64> {
        self.run(DatabaseOperation::Update, true, |db| db.update(query))
            .await
    }

    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64> {
        self.run(DatabaseOperation::Delete, true, |db| db.delete(query))
            .await
    }

    async fn count(&self, query: &CountQuery) -> DriverResult<u64> {
        self.run(DatabaseOperation::Count, false, |db| db.count(query))
            .await
    }
}

#[async_trait]
impl RelationalTransaction for MemoryRelationalTransaction {
    async fn commit(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let snapshot = state.take().ok_or_else(Self::finished)?;

        if let Some(error) = self.shared.faults.next() {
            Counters::bump(&self.shared.stats.aborts);
            return Err(error);
        }

        if snapshot.dirty {
            let mut database = self.shared.database.lock().await;
            if database.version != snapshot.base_version {
                Counters::bump(&self.shared.stats.aborts);
                return Err(DatabaseError::write_conflict(
                    "could not serialize access due to concurrent update",
                )
                .with_code(sqlstate::SERIALIZATION_FAILURE));
            }
            database.tables = snapshot.tables;
            database.version += 1;
        }
        Counters::bump(&self.shared.stats.commits);
        tracing::debug!("transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if state.take().is_some() {
            Counters::bump(&self.shared.stats.aborts);
            tracing::debug!("transaction rolled back");
        }
        Ok(())
    }
}
