use thiserror::Error;

/// Storage-layer errors. Backend-specific SQLite codes are folded into the
/// four semantic kinds the rest of the daemon is allowed to react to;
/// everything else stays opaque inside `Sqlite`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated")]
    UniqueConstraint,

    /// The backend could not serialize this transaction (SQLITE_BUSY).
    /// Retryable; absorbed by the transaction executor.
    #[error("serialization conflict")]
    Serialization,

    /// Lock ordering conflict (SQLITE_LOCKED). Retryable.
    #[error("deadlock")]
    Deadlock,

    /// Corrupt file, missing table, wrong schema. Fatal misconfiguration.
    #[error("schema error: {0}")]
    Schema(String),

    #[error("transaction failed after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },

    #[error("database schema version {found} is newer than this binary supports ({supported})")]
    DowngradeDetected { found: i64, supported: i64 },

    #[error("migration {0} previously failed and left the schema dirty; restore from backup")]
    DirtyMigration(i64),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the transaction executor should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Serialization | StoreError::Deadlock)
    }

    /// Classify a raw rusqlite error into the semantic kinds.
    pub fn from_sqlite(err: rusqlite::Error) -> StoreError {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(code, msg) => match code.code {
                ErrorCode::ConstraintViolation => {
                    let text = msg.as_deref().unwrap_or("");
                    if text.contains("UNIQUE") || text.contains("PRIMARY KEY") {
                        StoreError::UniqueConstraint
                    } else {
                        StoreError::Sqlite(err)
                    }
                }
                ErrorCode::DatabaseBusy => StoreError::Serialization,
                ErrorCode::DatabaseLocked => StoreError::Deadlock,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    StoreError::Schema(msg.clone().unwrap_or_else(|| "corrupt database".into()))
                }
                _ => StoreError::Sqlite(err),
            },
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Domain errors for mail and agent operations. These ride *inside* response
/// values (the request/reply channel always carries a value), while
/// `StoreError` and actor failures propagate beside the response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Service results carry the domain outcome inside and infrastructure
/// failure outside, so callers can pattern-match on domain errors without
/// exception-like unwinding.
pub type ServiceResult<T> = Result<Result<T, MailError>, StoreError>;
