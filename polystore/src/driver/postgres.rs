//! PostgreSQL relational driver
//!
//! Query descriptions are rendered into parameterized SQL with
//! [`sqlx::QueryBuilder`]. Every bound value travels as JSON and is cast to
//! the column's declared type through `jsonb_populate_record`, so callers never
//! deal with SQL types. Rows come back as `to_jsonb` objects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, TryStreamExt};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Executor, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::Mutex;

use crate::database::RelationalConfig;
use crate::driver::{
    CountQuery, DeleteQuery, InsertQuery, RelationalDriver, RelationalExecutor,
    RelationalTransaction, SelectQuery, UpdateQuery,
};
use crate::error::{sanitize_url, DatabaseError, DatabaseErrorKind, DatabaseOperation, DriverResult};
use crate::repository::{Document, FilterCondition, FilterOperator, OrderDirection};
use crate::transaction::TransactionSettings;

/// Relational driver backed by a `sqlx` PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    /// Connect with retries and exponential backoff
    pub async fn connect(config: &RelationalConfig) -> DriverResult<Self> {
        let pool = create_pool_with_retries(config).await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

async fn create_pool_with_retries(config: &RelationalConfig) -> DriverResult<PgPool> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_pool(config).await {
            Ok(pool) => {
                if attempt > 0 {
                    tracing::info!(
                        "Database connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "Database connection pool created: max={}, min={}",
                        config.max_connections,
                        config.min_connections
                    );
                }
                return Ok(pool);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to database after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));
                tracing::warn!(
                    "Database connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn try_create_pool(config: &RelationalConfig) -> DriverResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| {
            DatabaseError::from(e).add_context(format!("connecting to {}", sanitize_url(&config.url)))
        })
}

// ============================================================================
// SQL rendering
// ============================================================================

fn quote_ident(name: &str) -> DriverResult<String> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(format!("\"{}\"", name))
    } else {
        Err(DatabaseError::new(
            DatabaseOperation::Query,
            DatabaseErrorKind::QueryFailed,
            format!("invalid identifier `{}`", name),
        )
        .with_code("42602"))
    }
}

/// Push `value` cast to the type of `table.column`
fn push_typed(
    qb: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    column: &str,
    value: Value,
) {
    let mut record = Map::new();
    record.insert(column.to_string(), value);
    qb.push("(jsonb_populate_record(NULL::")
        .push(table)
        .push(", ")
        .push_bind(Json(Value::Object(record)))
        .push("))")
        .push(".")
        .push(format!("\"{}\"", column));
}

/// Push a `= ANY(...)` / `<> ALL(...)` list test for `table.column`
fn push_list(
    qb: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    column: &str,
    values: Value,
    negate: bool,
) {
    qb.push(if negate { " <> ALL(ARRAY(SELECT (jsonb_populate_record(NULL::" } else {
        " = ANY(ARRAY(SELECT (jsonb_populate_record(NULL::"
    })
    .push(table)
    .push(", jsonb_build_object('")
    .push(column)
    .push("', e))).\"")
    .push(column)
    .push("\" FROM jsonb_array_elements(")
    .push_bind(Json(values))
    .push(") e))");
}

fn push_where(
    qb: &mut QueryBuilder<'static, Postgres>,
    table: &str,
    conditions: &[FilterCondition],
) -> DriverResult<()> {
    for (i, condition) in conditions.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        let column = quote_ident(&condition.field)?;
        let value = condition.value.clone();
        match condition.operator {
            FilterOperator::IsNull | FilterOperator::IsNotNull => {
                qb.push(&column).push(" ").push(condition.operator.to_string());
            }
            FilterOperator::Like => {
                qb.push(&column)
                    .push("::text LIKE ")
                    .push_bind(value.as_str().unwrap_or_default().to_string());
            }
            FilterOperator::In | FilterOperator::NotIn => {
                qb.push(&column);
                push_list(
                    qb,
                    table,
                    &condition.field,
                    value,
                    condition.operator == FilterOperator::NotIn,
                );
            }
            operator => {
                qb.push(&column).push(" ").push(operator.to_string()).push(" ");
                push_typed(qb, table, &condition.field, value);
            }
        }
    }
    Ok(())
}

fn render_select(query: &SelectQuery) -> DriverResult<QueryBuilder<'static, Postgres>> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new("SELECT to_jsonb(r) AS row FROM (SELECT ");
    if query.distinct {
        qb.push("DISTINCT ");
    }
    match &query.columns {
        Some(columns) => {
            let quoted = columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<DriverResult<Vec<_>>>()?;
            qb.push(quoted.join(", "));
        }
        None => {
            qb.push("*");
        }
    }
    qb.push(" FROM ").push(&table);
    push_where(&mut qb, &table, &query.conditions)?;

    for (i, sort) in query.order_by.iter().enumerate() {
        qb.push(if i == 0 { " ORDER BY " } else { ", " })
            .push(quote_ident(&sort.field)?)
            .push(match sort.direction {
                OrderDirection::Ascending => " ASC",
                OrderDirection::Descending => " DESC",
            });
    }
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if let Some(offset) = query.offset {
        qb.push(" OFFSET ").push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
    }
    qb.push(") r");
    Ok(qb)
}

fn render_insert(query: &InsertQuery) -> DriverResult<QueryBuilder<'static, Postgres>> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(&table).push(" AS r");
    if query.values.is_empty() {
        qb.push(" DEFAULT VALUES");
    } else {
        let columns = query
            .values
            .keys()
            .map(|c| quote_ident(c))
            .collect::<DriverResult<Vec<_>>>()?
            .join(", ");
        qb.push(" (")
            .push(&columns)
            .push(") SELECT ")
            .push(&columns)
            .push(" FROM jsonb_populate_record(NULL::")
            .push(&table)
            .push(", ")
            .push_bind(Json(Value::Object(query.values.clone())))
            .push(")");
    }
    qb.push(" RETURNING to_jsonb(r) AS row");
    Ok(qb)
}

fn render_update(query: &UpdateQuery) -> DriverResult<QueryBuilder<'static, Postgres>> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(&table).push(" SET ");
    for (i, (column, value)) in query.values.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(quote_ident(column)?).push(" = ");
        push_typed(&mut qb, &table, column, value.clone());
    }
    push_where(&mut qb, &table, &query.conditions)?;
    Ok(qb)
}

fn render_delete(query: &DeleteQuery) -> DriverResult<QueryBuilder<'static, Postgres>> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new("DELETE FROM ");
    qb.push(&table);
    push_where(&mut qb, &table, &query.conditions)?;
    Ok(qb)
}

fn render_count(query: &CountQuery) -> DriverResult<QueryBuilder<'static, Postgres>> {
    let table = quote_ident(&query.table)?;
    let mut qb = QueryBuilder::new("SELECT COUNT(*) AS count FROM ");
    qb.push(&table);
    push_where(&mut qb, &table, &query.conditions)?;
    Ok(qb)
}

fn decode_row(row: &PgRow) -> DriverResult<Document> {
    let Json(value): Json<Value> = row.try_get("row")?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(DatabaseError::new(
            DatabaseOperation::Query,
            DatabaseErrorKind::TypeConversion,
            format!("expected a row object, got {}", other),
        )),
    }
}

// ============================================================================
// Execution
// ============================================================================

async fn run_select<'e, E>(executor: E, query: &SelectQuery) -> DriverResult<Vec<Document>>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb = render_select(query)?;
    tracing::debug!(sql = qb.sql(), "pg select");
    qb.build()
        .fetch(executor)
        .map_err(DatabaseError::from)
        .and_then(|row| future::ready(decode_row(&row)))
        .try_collect()
        .await
}

async fn run_insert<'e, E>(executor: E, query: &InsertQuery) -> DriverResult<Document>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb = render_insert(query)?;
    tracing::debug!(sql = qb.sql(), "pg insert");
    let row = qb
        .build()
        .fetch_one(executor)
        .await
        .map_err(|e| DatabaseError::from(e).add_context(query.table.clone()))?;
    decode_row(&row)
}

async fn run_write<'e, E>(
    executor: E,
    mut qb: QueryBuilder<'static, Postgres>,
    operation: DatabaseOperation,
) -> DriverResult<u64>
where
    E: Executor<'e, Database = Postgres>,
{
    tracing::debug!(sql = qb.sql(), %operation, "pg write");
    let result = qb.build().execute(executor).await.map_err(|e| {
        let mut error = DatabaseError::from(e);
        error.operation = operation;
        error
    })?;
    Ok(result.rows_affected())
}

async fn run_count<'e, E>(executor: E, query: &CountQuery) -> DriverResult<u64>
where
    E: Executor<'e, Database = Postgres>,
{
    let mut qb = render_count(query)?;
    tracing::debug!(sql = qb.sql(), "pg count");
    let row = qb.build().fetch_one(executor).await?;
    let count: i64 = row.try_get("count")?;
    Ok(u64::try_from(count).unwrap_or_default())
}

#[async_trait]
impl RelationalExecutor for PgDriver {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        run_select(&self.pool, query).await
    }

    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document> {
        run_insert(&self.pool, query).await
    }

    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64> {
        run_write(&self.pool, render_update(query)?, DatabaseOperation::Update).await
    }

    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64> {
        run_write(&self.pool, render_delete(query)?, DatabaseOperation::Delete).await
    }

    async fn count(&self, query: &CountQuery) -> DriverResult<u64> {
        run_count(&self.pool, query).await
    }
}

#[async_trait]
impl RelationalDriver for PgDriver {
    async fn begin(
        &self,
        settings: &TransactionSettings,
    ) -> DriverResult<Arc<dyn RelationalTransaction>> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            let mut error = DatabaseError::from(e);
            error.operation = DatabaseOperation::Transaction;
            error
        })?;
        if let Some(level) = settings.isolation_level {
            sqlx::query(&format!("SET TRANSACTION ISOLATION LEVEL {}", level))
                .execute(&mut *tx)
                .await?;
        }
        if let Some(timeout) = settings.timeout {
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        tracing::debug!(isolation = ?settings.isolation_level, "pg transaction started");
        Ok(Arc::new(PgTransaction {
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn close(&self) -> DriverResult<()> {
        self.pool.close().await;
        tracing::info!("Database connection pool closed");
        Ok(())
    }
}

/// Open PostgreSQL transaction
pub struct PgTransaction {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn finished() -> DatabaseError {
    DatabaseError::new(
        DatabaseOperation::Transaction,
        DatabaseErrorKind::TransactionFailed,
        "transaction has already been committed or rolled back",
    )
    .with_code("25P01")
}

#[async_trait]
impl RelationalExecutor for PgTransaction {
    async fn select(&self, query: &SelectQuery) -> DriverResult<Vec<Document>> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        run_select(&mut **tx, query).await
    }

    async fn insert(&self, query: &InsertQuery) -> DriverResult<Document> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        run_insert(&mut **tx, query).await
    }

    async fn update(&self, query: &UpdateQuery) -> DriverResult<u64> {
        let qb = render_update(query)?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        run_write(&mut **tx, qb, DatabaseOperation::Update).await
    }

    async fn delete(&self, query: &DeleteQuery) -> DriverResult<u64> {
        let qb = render_delete(query)?;
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        run_write(&mut **tx, qb, DatabaseOperation::Delete).await
    }

    async fn count(&self, query: &CountQuery) -> DriverResult<u64> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        run_count(&mut **tx, query).await
    }
}

#[async_trait]
impl RelationalTransaction for PgTransaction {
    async fn commit(&self) -> DriverResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(finished)?;
        tx.commit().await.map_err(|e| {
            let mut error = DatabaseError::from(e);
            error.operation = DatabaseOperation::Transaction;
            error
        })
    }

    async fn rollback(&self) -> DriverResult<()> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test values are objects"),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users").unwrap(), "\"users\"");
        assert_eq!(quote_ident("created_at").unwrap(), "\"created_at\"");
        assert!(quote_ident("users; DROP TABLE x").is_err());
        assert!(quote_ident("1abc").is_err());
        assert!(quote_ident("").is_err());
    }

    #[test]
    fn test_render_select() {
        let query = SelectQuery {
            columns: Some(vec!["id".into(), "name".into()]),
            conditions: vec![
                FilterCondition::gte("age", 18),
                FilterCondition::is_null("deleted_at"),
            ],
            order_by: vec![crate::repository::SortField::new(
                "name",
                OrderDirection::Descending,
            )],
            limit: Some(10),
            offset: Some(20),
            ..SelectQuery::new("users")
        };
        let qb = render_select(&query).unwrap();
        assert_eq!(
            qb.sql(),
            "SELECT to_jsonb(r) AS row FROM (SELECT \"id\", \"name\" FROM \"users\" \
             WHERE \"age\" >= (jsonb_populate_record(NULL::\"users\", $1)).\"age\" \
             AND \"deleted_at\" IS NULL ORDER BY \"name\" DESC LIMIT $2 OFFSET $3) r"
        );
    }

    #[test]
    fn test_render_insert_and_update() {
        let insert = InsertQuery {
            table: "users".into(),
            values: values(json!({"name": "Ann"})),
        };
        assert_eq!(
            render_insert(&insert).unwrap().sql(),
            "INSERT INTO \"users\" AS r (\"name\") SELECT \"name\" FROM \
             jsonb_populate_record(NULL::\"users\", $1) RETURNING to_jsonb(r) AS row"
        );

        let update = UpdateQuery {
            table: "users".into(),
            values: values(json!({"name": "Bo"})),
            conditions: vec![FilterCondition::in_list("id", vec![1, 2])],
        };
        let sql = render_update(&update).unwrap().sql().to_string();
        assert!(sql.starts_with(
            "UPDATE \"users\" SET \"name\" = (jsonb_populate_record(NULL::\"users\", $1)).\"name\" WHERE \"id\" = ANY("
        ));
        assert!(sql.contains("jsonb_array_elements($2)"));
    }

    #[test]
    fn test_render_rejects_bad_identifiers() {
        let query = DeleteQuery {
            table: "users".into(),
            conditions: vec![FilterCondition::eq("name\"--", "x")],
        };
        assert!(render_delete(&query).is_err());
    }
}
