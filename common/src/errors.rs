// Error handling framework
// Job faults are contained in result text; infrastructure errors propagate.

use thiserror::Error;

/// Faults raised by a job snippet.
///
/// These never cross the sandbox boundary as `Err`: they are rendered into
/// the job's captured text instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobFault {
    #[error("{0}")]
    Compile(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Execution timeout after {0} seconds")]
    Timeout(u64),
}

/// Package manager invocation errors
#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Package manager command is empty: {0}")]
    InvalidCommand(String),

    #[error("Failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("Package manager exited with status {code:?}:\n{output}")]
    NonZeroExit { code: Option<i32>, output: String },
}

/// Ledger (persistent job store) errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Ledger query failed: {0}")]
    QueryFailed(String),

    #[error("Job record not found: {0}")]
    NotFound(String),

    #[error("Duplicate job record: {0}")]
    DuplicateKey(String),

    #[error("Invalid job record: {0}")]
    InvalidRecord(String),
}

/// Errors that abort a synchronization cycle
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Sync cycle aborted: {0}")]
    Ledger(#[from] LedgerError),
}

/// Schedule-related errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid schedule configuration: {0}")]
    InvalidConfiguration(String),

    #[error("No next execution time available for bucket {0}")]
    NoNextExecution(String),
}

/// Validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field value for {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => LedgerError::NotFound("Record not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::ConnectionFailed(err.to_string())
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => LedgerError::DuplicateKey(db_err.message().to_string()),
                Some("23514") => LedgerError::InvalidRecord(db_err.message().to_string()),
                _ => LedgerError::QueryFailed(db_err.message().to_string()),
            },
            _ => LedgerError::QueryFailed(err.to_string()),
        }
    }
}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::InvalidRecord(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::InvalidJson(err.to_string())
    }
}
