//! In-memory document store
//!
//! Collections are ordered lists of JSON documents. Sessions host one
//! snapshot transaction at a time; operations given a session with an open
//! transaction work on the snapshot.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::matcher::matches;
use super::{sort_order, values_equal, Counters, FaultQueue, MemoryStats};
use crate::driver::{DocumentDriver, DocumentSession, FindSpec};
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, DriverResult};
use crate::repository::{Document, OrderDirection};
use crate::transaction::{TransactionSettings, TRANSIENT_TRANSACTION_LABEL};

/// Server codes raised by this driver
mod codes {
    pub const DUPLICATE_KEY: &str = "11000";
    pub const FAILED_TO_PARSE: &str = "9";
    pub const IMMUTABLE_FIELD: &str = "66";
    pub const MAX_TIME_EXPIRED: &str = "50";
    pub const NO_SUCH_TRANSACTION: &str = "251";
    pub const TRANSACTION_IN_PROGRESS: &str = "256";
    pub const WRITE_CONFLICT: &str = "112";
}

type Collections = HashMap<String, Vec<Document>>;

#[derive(Debug, Default)]
struct Store {
    collections: Collections,
    version: u64,
}

#[derive(Debug, Default)]
struct Shared {
    store: Mutex<Store>,
    stats: Counters,
    faults: FaultQueue,
    closed: AtomicBool,
    next_session: AtomicU64,
}

/// In-memory [`DocumentDriver`]
///
/// Cloning yields another handle to the same data.
///
/// # Example
///
/// ```rust,ignore
/// use polystore::driver::{DocumentDriver, MemoryDocumentDriver};
/// use serde_json::json;
///
/// let driver = MemoryDocumentDriver::new();
/// let mut doc = serde_json::Map::new();
/// doc.insert("name".into(), json!("Ann"));
/// driver.insert("users", doc, None).await?;
/// assert_eq!(driver.count("users", &json!({"name": "Ann"}), None).await?, 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentDriver {
    shared: Arc<Shared>,
}

impl MemoryDocumentDriver {
    pub fn new() -> Self {
        Self::default()
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
            Err(DatabaseError::connection_failed("memory document driver is closed"))
        } else {
            Ok(())
        }
    }

    fn memory_session<'a>(
        session: Option<&'a dyn DocumentSession>,
    ) -> DriverResult<Option<&'a MemoryDocumentSession>> {
        match session {
            None => Ok(None),
            Some(session) => session
                .as_any()
                .downcast_ref::<MemoryDocumentSession>()
                .map(Some)
                .ok_or_else(|| {
                    DatabaseError::new(
                        DatabaseOperation::Session,
                        DatabaseErrorKind::Configuration,
                        "session was not started by the memory document driver",
                    )
                }),
        }
    }

    /// Run `f` against the session's snapshot, or the shared store outside a
    /// transaction; `f` reports whether it changed anything
    async fn run<R>(
        &self,
        operation: DatabaseOperation,
        session: Option<&dyn DocumentSession>,
        f: impl FnOnce(&mut Collections) -> DriverResult<(R, bool)>,
    ) -> DriverResult<R> {
        self.ensure_open()?;
        if let Some(session) = Self::memory_session(session)? {
            let mut state = session.state.lock().await;
            match &mut *state {
                SessionState::Ended => {
                    return Err(DatabaseError::new(
                        DatabaseOperation::Session,
                        DatabaseErrorKind::Other,
                        format!("session {} has ended", session.id),
                    ));
                }
                SessionState::InTransaction(tx) => {
                    tx.check_deadline(operation)?;
                    let (result, changed) = f(&mut tx.collections)?;
                    tx.dirty |= changed;
                    return Ok(result);
                }
                SessionState::Idle => {}
            }
        }

        let mut store = self.shared.store.lock().await;
        let (result, changed) = f(&mut store.collections)?;
        if changed {
            store.version += 1;
        }
        Ok(result)
    }
}

fn matching<'a>(
    documents: &'a [Document],
    filter: &'a Value,
) -> impl Iterator<Item = DriverResult<usize>> + 'a {
    documents.iter().enumerate().filter_map(move |(i, doc)| match matches(doc, filter) {
        Ok(true) => Some(Ok(i)),
        Ok(false) => None,
        Err(e) => Some(Err(e)),
    })
}

fn matching_indexes(documents: &[Document], filter: &Value, multi: bool) -> DriverResult<Vec<usize>> {
    let mut indexes = Vec::new();
    for index in matching(documents, filter) {
        indexes.push(index?);
        if !multi {
            break;
        }
    }
    Ok(indexes)
}

fn project(document: &Document, fields: &[String]) -> Document {
    fields
        .iter()
        .filter_map(|field| document.get(field).map(|v| (field.clone(), v.clone())))
        .collect()
}

struct UpdateSpec<'a> {
    set: Option<&'a Map<String, Value>>,
    unset: Option<&'a Map<String, Value>>,
}

fn parse_update(update: &Value) -> DriverResult<UpdateSpec<'_>> {
    let failed = |message: String| {
        DatabaseError::new(DatabaseOperation::Update, DatabaseErrorKind::QueryFailed, message)
            .with_code(codes::FAILED_TO_PARSE)
    };
    let Value::Object(ops) = update else {
        return Err(failed("update must be an object".into()));
    };
    let mut spec = UpdateSpec {
        set: None,
        unset: None,
    };
    for (op, fields) in ops {
        let Value::Object(fields) = fields else {
            return Err(failed(format!("modifier {} expects an object", op)));
        };
        match op.as_str() {
            "$set" => spec.set = Some(fields),
            "$unset" => spec.unset = Some(fields),
            other => return Err(failed(format!("unknown modifier: {}", other))),
        }
    }
    Ok(spec)
}

fn apply_update(document: &mut Document, spec: &UpdateSpec<'_>) -> DriverResult<()> {
    if let Some(set) = spec.set {
        if let Some(new_id) = set.get("_id") {
            if document.get("_id").is_some_and(|id| !values_equal(id, new_id)) {
                return Err(DatabaseError::new(
                    DatabaseOperation::Update,
                    DatabaseErrorKind::QueryFailed,
                    "performing an update on the path '_id' would modify the immutable field '_id'",
                )
                .with_code(codes::IMMUTABLE_FIELD));
            }
        }
        for (field, value) in set {
            document.insert(field.clone(), value.clone());
        }
    }
    if let Some(unset) = spec.unset {
        for field in unset.keys() {
            document.remove(field);
        }
    }
    Ok(())
}

#[async_trait]
impl DocumentDriver for MemoryDocumentDriver {
    async fn insert(
        &self,
        collection: &str,
        mut document: Document,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Value> {
        let id = document
            .entry("_id")
            .or_insert_with(|| Value::String(Uuid::now_v7().to_string()))
            .clone();
        let name = collection.to_string();
        self.run(DatabaseOperation::Insert, session, move |collections| {
            let documents = collections.entry(name.clone()).or_default();
            if documents
                .iter()
                .any(|d| d.get("_id").is_some_and(|existing| values_equal(existing, &id)))
            {
                return Err(DatabaseError::with_context(
                    DatabaseOperation::Insert,
                    DatabaseErrorKind::ConstraintViolation,
                    format!("E11000 duplicate key error dup key: {{ _id: {} }}", id),
                    name,
                )
                .with_code(codes::DUPLICATE_KEY));
            }
            documents.push(document);
            Ok((id, true))
        })
        .await
    }

    async fn find(
        &self,
        collection: &str,
        spec: &FindSpec,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Vec<Document>> {
        self.run(DatabaseOperation::Query, session, |collections| {
            let Some(documents) = collections.get(collection) else {
                return Ok((Vec::new(), false));
            };
            let mut found = Vec::new();
            for index in matching(documents, &spec.filter) {
                found.push(&documents[index?]);
            }
            for (field, direction) in spec.sort.iter().rev() {
                found.sort_by(|a, b| {
                    let ordering = sort_order(
                        a.get(field).unwrap_or(&Value::Null),
                        b.get(field).unwrap_or(&Value::Null),
                    );
                    match direction {
                        OrderDirection::Ascending => ordering,
                        OrderDirection::Descending => ordering.reverse(),
                    }
                });
            }
            let skip = usize::try_from(spec.skip).unwrap_or(usize::MAX);
            let limit = spec
                .limit
                .map_or(usize::MAX, |l| usize::try_from(l).unwrap_or(usize::MAX));
            let page = found
                .into_iter()
                .skip(skip)
                .take(limit)
                .map(|doc| match &spec.projection {
                    Some(fields) => project(doc, fields),
                    None => doc.clone(),
                })
                .collect();
            Ok((page, false))
        })
        .await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Value,
        update: &Value,
        multi: bool,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64> {
        let spec = parse_update(update)?;
        self.run(DatabaseOperation::Update, session, |collections| {
            let Some(documents) = collections.get_mut(collection) else {
                return Ok((0, false));
            };
            let indexes = matching_indexes(documents, filter, multi)?;
            for &index in &indexes {
                apply_update(&mut documents[index], &spec)?;
            }
            Ok((indexes.len() as u64, !indexes.is_empty()))
        })
        .await
    }

    async fn delete(
        &self,
        collection: &str,
        filter: &Value,
        multi: bool,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64> {
        self.run(DatabaseOperation::Delete, session, |collections| {
            let Some(documents) = collections.get_mut(collection) else {
                return Ok((0, false));
            };
            let indexes = matching_indexes(documents, filter, multi)?;
            for &index in indexes.iter().rev() {
                documents.remove(index);
            }
            Ok((indexes.len() as u64, !indexes.is_empty()))
        })
        .await
    }

    async fn count(
        &self,
        collection: &str,
        filter: &Value,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<u64> {
        self.run(DatabaseOperation::Count, session, |collections| {
            let Some(documents) = collections.get(collection) else {
                return Ok((0, false));
            };
            let mut count = 0;
            for index in matching(documents, filter) {
                index?;
                count += 1;
            }
            Ok((count, false))
        })
        .await
    }

    async fn distinct(
        &self,
        collection: &str,
        field: &str,
        filter: &Value,
        session: Option<&dyn DocumentSession>,
    ) -> DriverResult<Vec<Value>> {
        self.run(DatabaseOperation::Query, session, |collections| {
            let Some(documents) = collections.get(collection) else {
                return Ok((Vec::new(), false));
            };
            let mut values: Vec<Value> = Vec::new();
            for index in matching(documents, filter) {
                if let Some(value) = documents[index?].get(field) {
                    if !values.iter().any(|seen| values_equal(seen, value)) {
                        values.push(value.clone());
                    }
                }
            }
            Ok((values, false))
        })
        .await
    }

    async fn start_session(&self) -> DriverResult<Arc<dyn DocumentSession>> {
        self.ensure_open()?;
        let n = self.shared.next_session.fetch_add(1, AtomicOrdering::Relaxed);
        Counters::bump(&self.shared.stats.sessions_started);
        let session = MemoryDocumentSession {
            id: format!("memory-session-{}", n),
            shared: self.shared.clone(),
            state: Mutex::new(SessionState::Idle),
        };
        tracing::debug!(session = %session.id, "session started");
        Ok(Arc::new(session))
    }

    async fn close(&self) -> DriverResult<()> {
        self.shared.closed.store(true, AtomicOrdering::Release);
        tracing::info!("memory document driver closed");
        Ok(())
    }
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug)]
struct TransactionState {
    collections: Collections,
    base_version: u64,
    dirty: bool,
    deadline: Option<Instant>,
}

impl TransactionState {
    fn check_deadline(&self, operation: DatabaseOperation) -> DriverResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(DatabaseError::timeout(
                operation,
                "operation exceeded time limit",
            )
            .with_code(codes::MAX_TIME_EXPIRED)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug)]
enum SessionState {
    Idle,
    InTransaction(TransactionState),
    Ended,
}

/// Session handed out by [`MemoryDocumentDriver::start_session`]
#[derive(Debug)]
pub struct MemoryDocumentSession {
    id: String,
    shared: Arc<Shared>,
    state: Mutex<SessionState>,
}

impl MemoryDocumentSession {
    fn no_transaction(&self) -> DatabaseError {
        DatabaseError::new(
            DatabaseOperation::Transaction,
            DatabaseErrorKind::TransactionFailed,
            format!("no transaction started on session {}", self.id),
        )
        .with_code(codes::NO_SUCH_TRANSACTION)
    }
}

#[async_trait]
impl DocumentSession for MemoryDocumentSession {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn start_transaction(&self, settings: &TransactionSettings) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        match &*state {
            SessionState::Idle => {}
            SessionState::InTransaction(_) => {
                return Err(DatabaseError::new(
                    DatabaseOperation::Transaction,
                    DatabaseErrorKind::TransactionFailed,
                    "transaction already in progress on this session",
                )
                .with_code(codes::TRANSACTION_IN_PROGRESS));
            }
            SessionState::Ended => {
                return Err(DatabaseError::new(
                    DatabaseOperation::Session,
                    DatabaseErrorKind::Other,
                    format!("session {} has ended", self.id),
                ));
            }
        }

        let store = self.shared.store.lock().await;
        *state = SessionState::InTransaction(TransactionState {
            collections: store.collections.clone(),
            base_version: store.version,
            dirty: false,
            deadline: settings.timeout.map(|timeout| Instant::now() + timeout),
        });
        Counters::bump(&self.shared.stats.transactions_started);
        tracing::debug!(session = %self.id, "transaction started");
        Ok(())
    }

    async fn commit_transaction(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let SessionState::InTransaction(tx) = std::mem::replace(&mut *state, SessionState::Idle)
        else {
            return Err(self.no_transaction());
        };

        if let Some(error) = self.shared.faults.next() {
            Counters::bump(&self.shared.stats.aborts);
            return Err(error);
        }
        if let Err(error) = tx.check_deadline(DatabaseOperation::Transaction) {
            Counters::bump(&self.shared.stats.aborts);
            return Err(error);
        }

        if tx.dirty {
            let mut store = self.shared.store.lock().await;
            if store.version != tx.base_version {
                Counters::bump(&self.shared.stats.aborts);
                return Err(DatabaseError::write_conflict(
                    "WriteConflict error: this operation conflicted with another operation",
                )
                .with_code(codes::WRITE_CONFLICT)
                .with_label(TRANSIENT_TRANSACTION_LABEL));
            }
            store.collections = tx.collections;
            store.version += 1;
        }
        Counters::bump(&self.shared.stats.commits);
        tracing::debug!(session = %self.id, "transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        if let SessionState::InTransaction(_) = &*state {
            *state = SessionState::Idle;
            Counters::bump(&self.shared.stats.aborts);
            tracing::debug!(session = %self.id, "transaction aborted");
        }
        Ok(())
    }

    async fn end_session(&self) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, SessionState::Ended) {
            SessionState::Ended => return Ok(()),
            SessionState::InTransaction(_) => Counters::bump(&self.shared.stats.aborts),
            SessionState::Idle => {}
        }
        Counters::bump(&self.shared.stats.sessions_ended);
        tracing::debug!(session = %self.id, "session ended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test documents are objects"),
        }
    }

    #[tokio::test]
    async fn test_insert_generates_id_and_rejects_duplicates() {
        let driver = MemoryDocumentDriver::new();
        let id = driver.insert("users", doc(json!({"name": "Ann"})), None).await.unwrap();
        assert!(id.is_string());

        let err = driver
            .insert("users", doc(json!({"_id": id, "name": "Bo"})), None)
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("11000"));
        assert_eq!(err.kind, DatabaseErrorKind::ConstraintViolation);
    }

    #[tokio::test]
    async fn test_find_sort_skip_limit_projection() {
        let driver = MemoryDocumentDriver::new();
        for (name, age) in [("Ann", 30), ("Bo", 25), ("Cy", 35), ("Di", 25)] {
            driver
                .insert("users", doc(json!({"name": name, "age": age})), None)
                .await
                .unwrap();
        }
        let spec = FindSpec {
            filter: json!({"age": {"$gte": 25}}),
            sort: vec![
                ("age".into(), OrderDirection::Ascending),
                ("name".into(), OrderDirection::Descending),
            ],
            skip: 1,
            limit: Some(2),
            projection: Some(vec!["name".into()]),
        };
        let found = driver.find("users", &spec, None).await.unwrap();
        assert_eq!(found, vec![doc(json!({"name": "Bo"})), doc(json!({"name": "Ann"}))]);
    }

    #[tokio::test]
    async fn test_update_set_unset_and_delete() {
        let driver = MemoryDocumentDriver::new();
        for n in 0..3 {
            driver
                .insert("items", doc(json!({"n": n, "tag": "x"})), None)
                .await
                .unwrap();
        }
        let matched = driver
            .update("items", &json!({"tag": "x"}), &json!({"$set": {"tag": "y"}}), false, None)
            .await
            .unwrap();
        assert_eq!(matched, 1);
        let matched = driver
            .update("items", &json!({}), &json!({"$unset": {"tag": ""}}), true, None)
            .await
            .unwrap();
        assert_eq!(matched, 3);
        assert_eq!(
            driver
                .count("items", &json!({"tag": {"$exists": true}}), None)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            driver.delete("items", &json!({"n": {"$lt": 2}}), true, None).await.unwrap(),
            2
        );
        assert_eq!(driver.count("items", &json!({}), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_transaction_isolated_until_commit() {
        let driver = MemoryDocumentDriver::new();
        let session = driver.start_session().await.unwrap();
        session
            .start_transaction(&TransactionSettings::default())
            .await
            .unwrap();
        driver
            .insert("users", doc(json!({"name": "Ann"})), Some(session.as_ref()))
            .await
            .unwrap();

        assert_eq!(driver.count("users", &json!({}), None).await.unwrap(), 0);
        assert_eq!(
            driver.count("users", &json!({}), Some(session.as_ref())).await.unwrap(),
            1
        );

        session.commit_transaction().await.unwrap();
        session.end_session().await.unwrap();
        assert_eq!(driver.count("users", &json!({}), None).await.unwrap(), 1);
        assert_eq!(
            driver.stats(),
            MemoryStats {
                sessions_started: 1,
                sessions_ended: 1,
                transactions_started: 1,
                commits: 1,
                aborts: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_abort_discards_snapshot() {
        let driver = MemoryDocumentDriver::new();
        let session = driver.start_session().await.unwrap();
        session
            .start_transaction(&TransactionSettings::default())
            .await
            .unwrap();
        driver
            .insert("users", doc(json!({"name": "Ann"})), Some(session.as_ref()))
            .await
            .unwrap();
        session.abort_transaction().await.unwrap();
        assert_eq!(driver.count("users", &json!({}), None).await.unwrap(), 0);
        assert!(session.commit_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_write_conflicts_at_commit() {
        let driver = MemoryDocumentDriver::new();
        let session = driver.start_session().await.unwrap();
        session
            .start_transaction(&TransactionSettings::default())
            .await
            .unwrap();
        driver
            .insert("users", doc(json!({"name": "Ann"})), Some(session.as_ref()))
            .await
            .unwrap();
        driver
            .insert("users", doc(json!({"name": "Bo"})), None)
            .await
            .unwrap();

        let err = session.commit_transaction().await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("112"));
        assert!(err.has_label(TRANSIENT_TRANSACTION_LABEL));
        assert_eq!(driver.count("users", &json!({}), None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_injected_commit_fault() {
        let driver = MemoryDocumentDriver::new();
        driver.fail_next_commit(DatabaseError::transaction_failed("stepdown").with_code("189"));
        let session = driver.start_session().await.unwrap();
        session
            .start_transaction(&TransactionSettings::default())
            .await
            .unwrap();
        let err = session.commit_transaction().await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("189"));
        assert_eq!(driver.stats().aborts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transaction_deadline() {
        let driver = MemoryDocumentDriver::new();
        let session = driver.start_session().await.unwrap();
        let settings = TransactionSettings {
            timeout: Some(Duration::from_millis(50)),
            ..TransactionSettings::default()
        };
        session.start_transaction(&settings).await.unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        let err = driver
            .count("users", &json!({}), Some(session.as_ref()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::Timeout);
        assert_eq!(err.code.as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn test_closed_driver_rejects_operations() {
        let driver = MemoryDocumentDriver::new();
        driver.close().await.unwrap();
        let err = driver.count("users", &json!({}), None).await.unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::ConnectionFailed);
    }
}
