use sea_orm::{DbErr, RuntimeErr, SqlErr};
use thiserror::Error;

/// Errors returned by the closure-index APIs.
#[derive(Debug, Error)]
pub enum ClosureIndexError {
    #[error("closure-index supports PostgreSQL and SQLite connections only")]
    UnsupportedBackend,

    #[error("{operation}: entity {id} does not exist or is deleted")]
    NotFound { operation: &'static str, id: String },

    #[error("reparent: moving {node} under {new_parent} would make a node its own ancestor")]
    CycleViolation { node: String, new_parent: String },

    #[error("{operation}: store rejected write: {source}")]
    ConstraintViolation {
        operation: &'static str,
        #[source]
        source: DbErr,
    },

    #[error("{operation}: transient store error: {source}")]
    TransientStore {
        operation: &'static str,
        #[source]
        source: DbErr,
    },

    #[error("{operation}: database error: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: DbErr,
    },

    /// Unclassified store error; replaced by one of the variants above
    /// before it leaves a public operation.
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("closure-index invariant violation: {0}")]
    Invariant(String),
}

impl ClosureIndexError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant(detail.into())
    }

    pub(crate) fn not_found(operation: &'static str, id: impl std::fmt::Debug) -> Self {
        Self::NotFound {
            operation,
            id: format!("{id:?}"),
        }
    }

    /// True when the whole operation can be re-run from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore { .. })
    }

    /// True when the store refused a write the engine believed valid.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    /// Attach the operation name and sort raw store errors into
    /// constraint, transient and other failures.
    pub(crate) fn in_operation(self, operation: &'static str) -> Self {
        let source = match self {
            Self::Database(source) => source,
            other => return other,
        };

        match classify(&source) {
            StoreErrorKind::Constraint => {
                tracing::error!(operation, error = %source, "closure index constraint violation");
                Self::ConstraintViolation { operation, source }
            }
            StoreErrorKind::Transient => Self::TransientStore { operation, source },
            StoreErrorKind::Other => Self::Store { operation, source },
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum StoreErrorKind {
    Constraint,
    Transient,
    Other,
}

fn classify(err: &DbErr) -> StoreErrorKind {
    if matches!(
        err.sql_err(),
        Some(SqlErr::UniqueConstraintViolation(_)) | Some(SqlErr::ForeignKeyConstraintViolation(_))
    ) {
        return StoreErrorKind::Constraint;
    }

    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => StoreErrorKind::Transient,
        DbErr::Exec(RuntimeErr::SqlxError(inner)) | DbErr::Query(RuntimeErr::SqlxError(inner)) => {
            if is_transient_sqlx(inner) {
                StoreErrorKind::Transient
            } else {
                StoreErrorKind::Other
            }
        }
        _ => StoreErrorKind::Other,
    }
}

// SQLSTATE 40001 serialization_failure, 40P01 deadlock_detected.
// SQLite reports extended codes: 5 BUSY, 261 BUSY_RECOVERY, 517 BUSY_SNAPSHOT,
// 773 BUSY_TIMEOUT, 6 LOCKED, 262 LOCKED_SHAREDCACHE.
const TRANSIENT_CODES: &[&str] = &["40001", "40P01", "5", "261", "517", "773", "6", "262"];

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_CODES.contains(&&*code)),
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ConnAcquireErr;
    use std::borrow::Cow;
    use std::error::Error as StdError;

    #[derive(Debug, Error)]
    #[error("database reported code {0}")]
    struct Coded(&'static str);

    impl sqlx::error::DatabaseError for Coded {
        fn message(&self) -> &str {
            "coded failure"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn coded(code: &'static str) -> DbErr {
        DbErr::Exec(RuntimeErr::SqlxError(sqlx::Error::Database(Box::new(Coded(code)))))
    }

    #[test]
    fn busy_and_serialization_codes_are_retryable() {
        for code in ["40001", "40P01", "5", "261", "517", "773", "6", "262"] {
            let err = ClosureIndexError::from(coded(code)).in_operation("reparent");
            assert!(err.is_retryable(), "code {code} should be transient");
        }

        for code in ["1555", "2067", "23505", "42P01"] {
            let err = ClosureIndexError::from(coded(code)).in_operation("reparent");
            assert!(!err.is_retryable(), "code {code} should not be transient");
        }
    }

    #[test]
    fn connection_failures_are_retryable() {
        let err = ClosureIndexError::from(DbErr::ConnectionAcquire(ConnAcquireErr::Timeout))
            .in_operation("create_node");
        assert!(err.is_retryable());

        let err = ClosureIndexError::from(DbErr::Exec(RuntimeErr::SqlxError(
            sqlx::Error::PoolTimedOut,
        )))
        .in_operation("reparent");
        assert!(matches!(
            err,
            ClosureIndexError::TransientStore {
                operation: "reparent",
                ..
            }
        ));
    }

    #[test]
    fn unclassified_errors_keep_operation_context() {
        let err = ClosureIndexError::from(DbErr::Custom("boom".into())).in_operation("soft_delete");
        assert!(!err.is_retryable());
        assert!(!err.is_constraint_violation());
        assert!(err.to_string().starts_with("soft_delete: database error:"));
    }

    #[test]
    fn domain_errors_pass_through_untouched() {
        let err = ClosureIndexError::CycleViolation {
            node: "1".into(),
            new_parent: "3".into(),
        }
        .in_operation("reparent");
        assert!(matches!(err, ClosureIndexError::CycleViolation { .. }));

        let err = ClosureIndexError::not_found("descendants", 42).in_operation("descendants");
        assert_eq!(
            err.to_string(),
            "descendants: entity 42 does not exist or is deleted"
        );
    }
}
