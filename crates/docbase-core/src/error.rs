//! The closed error taxonomy shared by every crate in the workspace.
//!
//! Every public operation returns [`Result<T>`]. `rusqlite`/`serde_json`
//! errors are folded into [`Error::Database`] or [`Error::Query`] at the
//! boundary where they occur and re-classified to a more specific variant
//! (e.g. [`Error::UniqueConstraint`]) wherever the caller has the context
//! to do so.

use std::fmt;
use std::time::Duration;

/// Errors raised anywhere in the document store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A document failed the collection's schema validator.
    #[error("validation error on field `{field}`: {message}")]
    Validation {
        /// The field that failed validation, if the validator attributed one.
        field: String,
        /// Human-readable description of the failure.
        message: String,
    },

    /// An operator was applied to a field whose declared type is incompatible
    /// with that operator (e.g. `$gt` against a TEXT field).
    #[error("type mismatch: operator `{operator}` cannot be applied to field `{field}` (declared as {declared_type})")]
    TypeMismatch {
        /// The offending operator, e.g. `$gt`.
        operator: String,
        /// The field the operator was applied to.
        field: String,
        /// The field's declared storage type.
        declared_type: String,
    },

    /// The filter or options record could not be translated into SQL.
    #[error("query error: {0} — check the filter/options shape")]
    Query(String),

    /// The engine reported a unique-index violation.
    #[error("unique constraint violated on field `{field}`: value {value} already exists — choose a different value or upsert instead")]
    UniqueConstraint {
        /// The field whose uniqueness was violated.
        field: String,
        /// A debug rendering of the duplicate value.
        value: String,
    },

    /// Some other engine-level constraint was violated (e.g. NOT NULL).
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A referenced document or collection was absent where one was required.
    #[error("{entity} not found: {id} — verify the id or insert it first")]
    NotFound {
        /// Kind of entity, e.g. "document" or "collection".
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The underlying SQL connection is unusable (including post-close access).
    #[error("connection error: {0}")]
    Connection(String),

    /// A transaction-level failure (includes busy/locked during commit).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// Any other engine error, annotated with the engine's error code.
    #[error("database error ({code}): {message}")]
    Database {
        /// Engine-assigned error code (e.g. SQLite's primary result code).
        code: String,
        /// Engine-supplied message.
        message: String,
    },

    /// A cancellation token fired before or during the operation.
    #[error("operation aborted: {reason}")]
    OperationAborted {
        /// The reason attached to the cancellation token, if any.
        reason: String,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(
        operator: impl Into<String>,
        field: impl Into<String>,
        declared_type: impl fmt::Display,
    ) -> Self {
        Self::TypeMismatch {
            operator: operator.into(),
            field: field.into(),
            declared_type: declared_type.to_string(),
        }
    }

    pub fn query(message: impl Into<String>) -> Self {
        Self::Query(message.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::OperationAborted {
            reason: reason.into(),
        }
    }

    /// Whether the retry envelope (§4.6) should ever re-attempt an operation
    /// that failed with this error. Validation/type/query/constraint/abort
    /// errors are never retried; connection and transaction errors always
    /// are; `Database` errors depend on the engine code they carry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Transaction(_) => true,
            Self::Database { code, .. } => matches!(
                code.as_str(),
                "SQLITE_BUSY" | "SQLITE_LOCKED" | "SQLITE_NOMEM" | "SQLITE_IOERR"
            ),
            _ => false,
        }
    }
}

/// Classifies a [`rusqlite::Error`] into the closed taxonomy.
///
/// Unique-index violations are detected from SQLite's extended result code
/// and annotated with the field name the caller supplies (the constraint
/// name alone does not reliably carry the field in all SQLite builds).
pub fn classify_rusqlite_error(err: rusqlite::Error, context_field: Option<&str>) -> Error {
    use rusqlite::ffi::ErrorCode;
    use rusqlite::Error as RE;

    match &err {
        RE::SqliteFailure(se, msg) => match se.code {
            ErrorCode::ConstraintViolation => {
                let text = msg.clone().unwrap_or_default();
                if text.contains("UNIQUE") {
                    let field = context_field
                        .map(str::to_string)
                        .or_else(|| unique_field_from_message(&text))
                        .unwrap_or_else(|| "<unknown>".to_string());
                    Error::UniqueConstraint { field, value: text }
                } else {
                    Error::Constraint(text)
                }
            }
            code => Error::Database {
                code: sqlite_code_name(code).to_string(),
                message: msg.clone().unwrap_or_default(),
            },
        },
        other => Error::Database {
            code: "SQLITE_UNKNOWN".into(),
            message: other.to_string(),
        },
    }
}

/// Maps a `rusqlite` [`ErrorCode`](rusqlite::ffi::ErrorCode) to the canonical
/// `SQLITE_*` primary result code name, matching what [`Error::is_retryable`]
/// matches against — `ErrorCode`'s `Debug` output (`DatabaseBusy`, …) does
/// not.
fn sqlite_code_name(code: rusqlite::ffi::ErrorCode) -> &'static str {
    use rusqlite::ffi::ErrorCode;
    match code {
        ErrorCode::InternalMalfunction => "SQLITE_INTERNAL",
        ErrorCode::PermissionDenied => "SQLITE_PERM",
        ErrorCode::OperationAborted => "SQLITE_ABORT",
        ErrorCode::DatabaseBusy => "SQLITE_BUSY",
        ErrorCode::DatabaseLocked => "SQLITE_LOCKED",
        ErrorCode::OutOfMemory => "SQLITE_NOMEM",
        ErrorCode::ReadOnly => "SQLITE_READONLY",
        ErrorCode::OperationInterrupted => "SQLITE_INTERRUPT",
        ErrorCode::SystemIoFailure => "SQLITE_IOERR",
        ErrorCode::DatabaseCorrupt => "SQLITE_CORRUPT",
        ErrorCode::NotFound => "SQLITE_NOTFOUND",
        ErrorCode::DiskFull => "SQLITE_FULL",
        ErrorCode::CannotOpen => "SQLITE_CANTOPEN",
        ErrorCode::FileLockingProtocolFailed => "SQLITE_PROTOCOL",
        ErrorCode::SchemaChanged => "SQLITE_SCHEMA",
        ErrorCode::TooBig => "SQLITE_TOOBIG",
        ErrorCode::ConstraintViolation => "SQLITE_CONSTRAINT",
        ErrorCode::TypeMismatch => "SQLITE_MISMATCH",
        ErrorCode::ApiMisuse => "SQLITE_MISUSE",
        ErrorCode::NoLargeFileSupport => "SQLITE_NOLFS",
        ErrorCode::AuthorizationForStatementDenied => "SQLITE_AUTH",
        ErrorCode::ParameterOutOfRange => "SQLITE_RANGE",
        ErrorCode::NotADatabase => "SQLITE_NOTADB",
        _ => "SQLITE_UNKNOWN",
    }
}

/// Picks the first column name out of a SQLite "UNIQUE constraint failed:
/// table._field[, table._field2, ...]" message and strips the generated
/// column's `_` prefix back to the declared field name. Falls back to
/// `None` if the message doesn't match the expected shape (e.g. a driver
/// that doesn't embed column names).
fn unique_field_from_message(message: &str) -> Option<String> {
    let after = message.split("failed: ").nth(1)?;
    let first = after.split(',').next()?.trim();
    let column = first.rsplit('.').next()?;
    Some(column.strip_prefix('_').unwrap_or(column).to_string())
}

/// Renders a retry delay for log/diagnostic messages.
pub fn format_delay(delay: Duration) -> String {
    format!("{}ms", delay.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_and_transaction_are_retryable() {
        assert!(Error::Connection("x".into()).is_retryable());
        assert!(Error::Transaction("x".into()).is_retryable());
    }

    #[test]
    fn validation_is_never_retryable() {
        assert!(!Error::validation("email", "required").is_retryable());
        assert!(!Error::Constraint("x".into()).is_retryable());
        assert!(!Error::aborted("timeout").is_retryable());
    }

    #[test]
    fn database_error_retryable_depends_on_code() {
        assert!(Error::Database {
            code: "SQLITE_BUSY".into(),
            message: "busy".into()
        }
        .is_retryable());
        assert!(!Error::Database {
            code: "SQLITE_MISUSE".into(),
            message: "oops".into()
        }
        .is_retryable());
    }

    #[test]
    fn classify_rusqlite_error_produces_canonical_codes_is_retryable_agrees() {
        use rusqlite::ffi;

        let busy = rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::DatabaseBusy,
                extended_code: 5,
            },
            Some("database is locked".into()),
        );
        let classified = classify_rusqlite_error(busy, None);
        match &classified {
            Error::Database { code, .. } => assert_eq!(code, "SQLITE_BUSY"),
            other => panic!("expected Database, got {other:?}"),
        }
        assert!(classified.is_retryable());

        let misuse = rusqlite::Error::SqliteFailure(
            ffi::Error {
                code: ffi::ErrorCode::ApiMisuse,
                extended_code: 21,
            },
            Some("bad usage".into()),
        );
        let classified = classify_rusqlite_error(misuse, None);
        match &classified {
            Error::Database { code, .. } => assert_eq!(code, "SQLITE_MISUSE"),
            other => panic!("expected Database, got {other:?}"),
        }
        assert!(!classified.is_retryable());
    }
}
