//! In-memory drivers
//!
//! Both drivers keep their data in process, behind `memory://` URLs. Each
//! transaction works on a private snapshot that is published on commit; a
//! commit fails with the engine's write-conflict error when another writer
//! committed after the snapshot was taken. Tests drive the retry paths through
//! the same errors a server would raise, or inject commit failures directly.

mod document;
mod matcher;
mod relational;

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use serde_json::Value;

use crate::error::DatabaseError;

pub use document::{MemoryDocumentDriver, MemoryDocumentSession};
pub use relational::{MemoryRelationalDriver, MemoryRelationalTransaction, TableSchema};

/// Snapshot of a memory driver's lifecycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub transactions_started: u64,
    pub commits: u64,
    pub aborts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    transactions_started: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            sessions_started: self.sessions_started.load(AtomicOrdering::Relaxed),
            sessions_ended: self.sessions_ended.load(AtomicOrdering::Relaxed),
            transactions_started: self.transactions_started.load(AtomicOrdering::Relaxed),
            commits: self.commits.load(AtomicOrdering::Relaxed),
            aborts: self.aborts.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Errors queued to be returned by upcoming commits, oldest first
#[derive(Debug, Default)]
struct FaultQueue {
    commits: Mutex<VecDeque<DatabaseError>>,
}

impl FaultQueue {
    fn push(&self, error: DatabaseError) {
        if let Ok(mut queue) = self.commits.lock() {
            queue.push_back(error);
        }
    }

    fn next(&self) -> Option<DatabaseError> {
        self.commits.lock().ok().and_then(|mut queue| queue.pop_front())
    }
}

/// Equality with numbers compared by value (`1 == 1.0`)
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Ordering of two values of the same type; `None` across types or for nulls
pub(crate) fn compare_same_type(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

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

/// Total order used for sorting: nulls first, then by type, then by value
pub(crate) fn sort_order(a: &Value, b: &Value) -> Ordering {
    type_rank(a)
        .cmp(&type_rank(b))
        .then_with(|| compare_same_type(a, b).unwrap_or(Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_equal_across_number_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(values_equal(&json!({"a": [1, 2]}), &json!({"a": [1.0, 2]})));
        assert!(!values_equal(&json!("1"), &json!(1)));
    }

    #[test]
    fn test_sort_order_brackets_types() {
        assert_eq!(sort_order(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(sort_order(&json!(10), &json!("1")), Ordering::Less);
        assert_eq!(sort_order(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(sort_order(&json!("b"), &json!("a")), Ordering::Greater);
    }

    #[test]
    fn test_fault_queue_is_fifo() {
        let queue = FaultQueue::default();
        queue.push(DatabaseError::transaction_failed("first"));
        queue.push(DatabaseError::transaction_failed("second"));
        assert_eq!(queue.next().unwrap().message, "first");
        assert_eq!(queue.next().unwrap().message, "second");
        assert!(queue.next().is_none());
    }
}
