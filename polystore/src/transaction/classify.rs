//! Transient/fatal classification and retry backoff

use std::time::Duration;

use crate::repository::{Backend, RepositoryError};

/// Relational SQLSTATEs worth retrying
///
/// serialization failure, deadlock detected, lock not available, admin shutdown,
/// query canceled.
pub const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57P01", "57014"];

/// Document server codes worth retrying
///
/// NotWritablePrimary, InterruptedDueToReplStateChange, PrimarySteppedDown,
/// ShutdownInProgress, InterruptedAtShutdown.
pub const RETRYABLE_DOCUMENT_CODES: &[&str] = &["10107", "11602", "189", "91", "11600"];

/// Label a document server attaches to errors that abort a transaction transiently
pub const TRANSIENT_TRANSACTION_LABEL: &str = "TransientTransactionError";

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 3_000;

/// Outcome of classifying a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Expected to resolve on retry
    Transient,
    /// Rethrown immediately without consuming a retry
    Fatal,
}

/// Classify an error raised during a transaction attempt on `backend`
pub fn classify(backend: Backend, error: &RepositoryError) -> ErrorClass {
    if error.is_caller_error() {
        return ErrorClass::Fatal;
    }
    let code = error.code.as_deref();
    let transient = match backend {
        Backend::Relational => code.is_some_and(|c| RETRYABLE_SQLSTATES.contains(&c)),
        Backend::Document => {
            error.has_label(TRANSIENT_TRANSACTION_LABEL)
                || code.is_some_and(|c| RETRYABLE_DOCUMENT_CODES.contains(&c))
        }
    };
    if transient {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Delay before the retry that follows attempt number `attempt` (0-based)
///
/// `min(100 * 2^attempt, 3000)` milliseconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{RepositoryErrorKind, RepositoryOperation};

    fn db_error(code: &str) -> RepositoryError {
        RepositoryError::database_error(RepositoryOperation::Update, "boom").with_code(code)
    }

    #[test]
    fn test_relational_retryable_codes() {
        for code in RETRYABLE_SQLSTATES {
            assert_eq!(
                classify(Backend::Relational, &db_error(code)),
                ErrorClass::Transient
            );
        }
        assert_eq!(
            classify(Backend::Relational, &db_error("23505")),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_document_retryable_codes_and_label() {
        for code in RETRYABLE_DOCUMENT_CODES {
            assert_eq!(
                classify(Backend::Document, &db_error(code)),
                ErrorClass::Transient
            );
        }
        let labelled = db_error("112").with_label(TRANSIENT_TRANSACTION_LABEL);
        assert_eq!(classify(Backend::Document, &labelled), ErrorClass::Transient);
        assert_eq!(classify(Backend::Document, &db_error("11000")), ErrorClass::Fatal);
    }

    #[test]
    fn test_codes_do_not_cross_backends() {
        assert_eq!(classify(Backend::Document, &db_error("40001")), ErrorClass::Fatal);
        assert_eq!(classify(Backend::Relational, &db_error("189")), ErrorClass::Fatal);
    }

    #[test]
    fn test_caller_errors_are_fatal() {
        let err = RepositoryError::configuration("bad column").with_code("40001");
        assert_eq!(classify(Backend::Relational, &err), ErrorClass::Fatal);

        let err = RepositoryError::hook(RepositoryOperation::Create, "no").with_code("40001");
        assert_eq!(err.kind, RepositoryErrorKind::Hook);
        assert_eq!(classify(Backend::Relational, &err), ErrorClass::Fatal);
    }

    #[test]
    fn test_backoff_delay() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(5), Duration::from_millis(3000));
        assert_eq!(backoff_delay(64), Duration::from_millis(3000));
    }
}
