//! Retrying transaction runner
//!
//! Each attempt opens a native transaction, hands the callback a context whose
//! repositories are bound to it, then commits. Failures are aborted, classified
//! and either rethrown or retried after an exponential backoff. The native
//! session or transaction is released on every exit path of an attempt.

use std::future::Future;
use std::sync::Arc;

use super::classify::{backoff_delay, classify, ErrorClass};
use super::context::{TransactionContext, TransactionHandle};
use super::options::{TransactionOptions, TransactionSettings};
use crate::driver::{DocumentDriver, RelationalDriver};
use crate::repository::engine::{AttemptScope, DocumentEngine, RelationalEngine};
use crate::repository::{Backend, RepositoryFactory, RepositoryResult};

/// Driver a transaction is opened on
#[derive(Clone)]
pub(crate) enum TransactionSource {
    Document(Arc<dyn DocumentDriver>),
    Relational(Arc<dyn RelationalDriver>),
}

impl TransactionSource {
    fn backend(&self) -> Backend {
        match self {
            Self::Document(_) => Backend::Document,
            Self::Relational(_) => Backend::Relational,
        }
    }

    /// Open the native transaction and a factory bound to it
    async fn begin(
        &self,
        settings: &TransactionSettings,
        scope: AttemptScope,
    ) -> RepositoryResult<(TransactionHandle, RepositoryFactory)> {
        match self {
            Self::Document(driver) => {
                let session = driver.start_session().await?;
                if let Err(error) = session.start_transaction(settings).await {
                    if let Err(end_error) = session.end_session().await {
                        tracing::warn!(error = %end_error, "failed to end session");
                    }
                    return Err(error.into());
                }
                let engine = DocumentEngine::with_session(driver.clone(), session.clone(), scope);
                Ok((
                    TransactionHandle::Document(session),
                    RepositoryFactory::new(Arc::new(engine)),
                ))
            }
            Self::Relational(driver) => {
                let tx = driver.begin(settings).await?;
                let engine = RelationalEngine::with_transaction(tx.clone(), scope);
                Ok((
                    TransactionHandle::Relational(tx),
                    RepositoryFactory::new(Arc::new(engine)),
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptState {
    Idle,
    AttemptStarted,
    Committed,
    AbortedRetryable,
    AbortedFatal,
}

struct StateMachine {
    state: AttemptState,
    backend: Backend,
}

impl StateMachine {
    fn transition(&mut self, next: AttemptState, attempt: u32) {
        tracing::debug!(
            backend = %self.backend,
            attempt,
            from = ?self.state,
            to = ?next,
            "transaction state"
        );
        self.state = next;
    }
}

/// Run `callback` inside a transaction on `source`, retrying transient failures
///
/// The callback runs at most `options.retries + 1` times. Its result on the
/// first committed attempt is returned; otherwise the last error.
pub(crate) async fn run<R, F, Fut>(
    source: &TransactionSource,
    options: &TransactionOptions,
    mut callback: F,
) -> RepositoryResult<R>
where
    F: FnMut(TransactionContext) -> Fut,
    Fut: Future<Output = RepositoryResult<R>>,
{
    let backend = source.backend();
    let settings = options.settings();
    let mut machine = StateMachine {
        state: AttemptState::Idle,
        backend,
    };

    let mut attempt = 0;
    loop {
        machine.transition(AttemptState::AttemptStarted, attempt);
        let error = match run_attempt(source, &settings, attempt, &mut callback).await {
            Ok(value) => {
                machine.transition(AttemptState::Committed, attempt);
                if attempt > 0 {
                    tracing::info!(
                        %backend,
                        "Transaction committed after {} attempt(s)",
                        attempt + 1
                    );
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if classify(backend, &error) == ErrorClass::Fatal {
            machine.transition(AttemptState::AbortedFatal, attempt);
            tracing::debug!(%backend, %error, "transaction failed with a non-retryable error");
            return Err(error);
        }
        if attempt >= options.retries {
            machine.transition(AttemptState::AbortedFatal, attempt);
            tracing::error!(
                %backend,
                "Transaction failed after {} attempts: {}",
                attempt + 1,
                error
            );
            return Err(error);
        }

        machine.transition(AttemptState::AbortedRetryable, attempt);
        let delay = backoff_delay(attempt);
        tracing::warn!(
            %backend,
            "Transaction attempt {} failed: {}. Retrying in {:?}...",
            attempt + 1,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn run_attempt<R, F, Fut>(
    source: &TransactionSource,
    settings: &TransactionSettings,
    attempt: u32,
    callback: &mut F,
) -> RepositoryResult<R>
where
    F: FnMut(TransactionContext) -> Fut,
    Fut: Future<Output = RepositoryResult<R>>,
{
    let scope = AttemptScope::open();
    let (handle, factory) = source.begin(settings, scope.clone()).await?;

    let context = TransactionContext::new(handle.clone(), factory, attempt);
    let outcome = match callback(context).await {
        Ok(value) => handle.commit().await.map(|()| value),
        Err(error) => Err(error),
    };
    scope.close();

    if outcome.is_err() {
        if let Err(abort_error) = handle.abort().await {
            tracing::debug!(error = %abort_error, "abort after failed attempt also failed");
        }
    }
    if let Err(error) = handle.release().await {
        tracing::warn!(%error, "failed to release transaction resources");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDocumentDriver, MemoryRelationalDriver, MemoryStats};
    use crate::error::DatabaseError;
    use crate::repository::{
        Document, EntityConfig, Filter, HookContext, QueryOptions, Repository, RepositoryError,
        RepositoryErrorKind, RepositoryHooks, RepositoryOperation,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn serialization_failure() -> RepositoryError {
        RepositoryError::database_error(RepositoryOperation::Update, "could not serialize access")
            .with_code("40001")
    }

    fn accounts() -> EntityConfig {
        EntityConfig::table("accounts").columns(["id", "owner", "balance"])
    }

    /// Lets the first create through and vetoes every later one
    #[derive(Default)]
    struct VetoAfterFirst {
        creates: AtomicUsize,
    }

    #[async_trait]
    impl RepositoryHooks for VetoAfterFirst {
        async fn before_create(&self, _ctx: &HookContext) -> RepositoryResult<Option<Document>> {
            if self.creates.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(RepositoryError::hook(RepositoryOperation::Create, "order limit"));
            }
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_serialization_failure_then_succeeds() {
        let driver = Arc::new(MemoryRelationalDriver::new());
        let source = TransactionSource::Relational(driver.clone());
        let options = TransactionOptions::default().retries(2);
        let start = Instant::now();

        let result = run(&source, &options, |ctx| async move {
            let repo = ctx.create_repository::<Value>(accounts())?;
            repo.create(json!({"owner": format!("attempt-{}", ctx.attempt())}))
                .await?;
            if ctx.attempt() < 2 {
                return Err(serialization_failure());
            }
            Ok(ctx.attempt())
        })
        .await
        .unwrap();

        assert_eq!(result, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        // only the committed attempt's write survives
        let repo = RepositoryFactory::relational(driver.clone())
            .basic::<Value>(accounts())
            .unwrap();
        let rows = repo.find_all(Filter::new(), QueryOptions::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["owner"], "attempt-2");

        let stats = driver.stats();
        assert_eq!(stats.transactions_started, 3);
        assert_eq!(stats.commits, 1);
        assert_eq!(stats.aborts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_retries_plus_one() {
        let source = TransactionSource::Relational(Arc::new(MemoryRelationalDriver::new()));
        let options = TransactionOptions::default().retries(3);
        let mut attempts = 0;
        let start = Instant::now();

        let err = run(&source, &options, |_ctx| {
            attempts += 1;
            async { Err::<(), _>(serialization_failure()) }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, 4);
        assert_eq!(err.code.as_deref(), Some("40001"));
        // 100 + 200 + 400
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let source = TransactionSource::Relational(Arc::new(MemoryRelationalDriver::new()));
        let mut attempts = 0;
        let start = Instant::now();

        let err = run(&source, &TransactionOptions::default(), |_ctx| {
            attempts += 1;
            async {
                Err::<(), _>(
                    RepositoryError::database_error(RepositoryOperation::Create, "duplicate key")
                        .with_code("23505"),
                )
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert_eq!(err.code.as_deref(), Some("23505"));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_caller_errors_are_never_retried() {
        let source = TransactionSource::Document(Arc::new(MemoryDocumentDriver::new()));
        let mut attempts = 0;

        let err = run(&source, &TransactionOptions::default(), |_ctx| {
            attempts += 1;
            async {
                Err::<(), _>(
                    RepositoryError::validation_failed("bad input")
                        .with_label("TransientTransactionError"),
                )
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert_eq!(err.kind, RepositoryErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_repository_unusable_after_attempt() {
        let source = TransactionSource::Document(Arc::new(MemoryDocumentDriver::new()));

        let leaked = run(&source, &TransactionOptions::default(), |ctx| async move {
            let repo = ctx.create_repository::<Value>(EntityConfig::collection("notes"))?;
            repo.create(json!({"text": "inside"})).await?;
            Ok(repo)
        })
        .await
        .unwrap();

        let err = leaked.count(Filter::new()).await.unwrap_err();
        assert_eq!(err.kind, RepositoryErrorKind::TransactionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_released_on_every_path() {
        let driver = Arc::new(MemoryDocumentDriver::new());
        let source = TransactionSource::Document(driver.clone());
        let options = TransactionOptions::default().retries(1);

        run(&source, &options, |_ctx| async { Ok(()) })
            .await
            .unwrap();
        run(&source, &options, |_ctx| async {
            Err::<(), _>(
                RepositoryError::database_error(RepositoryOperation::Update, "stepped down")
                    .with_code("189"),
            )
        })
        .await
        .unwrap_err();

        assert_eq!(
            driver.stats(),
            MemoryStats {
                sessions_started: 3,
                sessions_ended: 3,
                transactions_started: 3,
                commits: 1,
                aborts: 2,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_conflict_is_retried() {
        let driver = Arc::new(MemoryDocumentDriver::new());
        let outside = RepositoryFactory::document(driver.clone())
            .basic::<Value>(EntityConfig::collection("notes"))
            .unwrap();
        let source = TransactionSource::Document(driver.clone());

        let attempts = run(&source, &TransactionOptions::default(), |ctx| {
            let outside = outside.clone();
            async move {
                let repo = ctx.create_repository::<Value>(EntityConfig::collection("notes"))?;
                repo.create(json!({"text": "inside"})).await?;
                if ctx.attempt() == 0 {
                    outside.create(json!({"text": "concurrent"})).await?;
                }
                Ok(ctx.attempt() + 1)
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(outside.count(Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_injected_commit_fault_is_classified() {
        let driver = Arc::new(MemoryRelationalDriver::new());
        driver.fail_next_commit(DatabaseError::transaction_failed("deadlock").with_code("40P01"));
        let source = TransactionSource::Relational(driver.clone());

        let value = run(&source, &TransactionOptions::default(), |ctx| async move {
            Ok(ctx.attempt())
        })
        .await
        .unwrap();
        assert_eq!(value, 1);

        driver.fail_next_commit(DatabaseError::transaction_failed("disk full").with_code("53100"));
        let err = run(&source, &TransactionOptions::default(), |_ctx| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code.as_deref(), Some("53100"));
        assert_eq!(err.kind, RepositoryErrorKind::DatabaseError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hook_error_rolls_back_the_transaction() {
        let driver = Arc::new(MemoryDocumentDriver::new());
        let source = TransactionSource::Document(driver.clone());
        let hooks = Arc::new(VetoAfterFirst::default());
        let mut attempts = 0;

        let err = run(&source, &TransactionOptions::default(), |ctx| {
            attempts += 1;
            let hooks = hooks.clone();
            async move {
                let orders =
                    ctx.create_repository::<Value>(EntityConfig::collection("orders").hooks(hooks))?;
                orders.create(json!({"sku": "a"})).await?;
                orders.create(json!({"sku": "b"})).await?;
                Ok(())
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempts, 1);
        assert_eq!(err.kind, RepositoryErrorKind::Hook);

        let orders = RepositoryFactory::document(driver.clone())
            .basic::<Value>(EntityConfig::collection("orders"))
            .unwrap();
        assert_eq!(orders.count(Filter::new()).await.unwrap(), 0);
        assert_eq!(driver.stats().commits, 0);
        assert_eq!(driver.stats().aborts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounds_each_attempt() {
        let driver = Arc::new(MemoryRelationalDriver::new());
        let source = TransactionSource::Relational(driver.clone());
        let options = TransactionOptions::default().timeout(Duration::from_millis(100));
        let start = Instant::now();

        let attempts = run(&source, &options, |ctx| async move {
            let repo = ctx.create_repository::<Value>(accounts())?;
            if ctx.attempt() == 0 {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            repo.create(json!({"owner": "ann"})).await?;
            Ok(ctx.attempt() + 1)
        })
        .await
        .unwrap();

        assert_eq!(attempts, 2);
        // 150ms over budget, then one 100ms backoff
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(driver.stats().aborts, 1);
        assert_eq!(driver.stats().commits, 1);
    }
}
