use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not inspect schema: {0}")]
    Inspection(#[source] tokio_postgres::Error),

    #[error("invalid plan: {0}")]
    Planning(#[from] PlanningError),

    #[error("{operation}: existing rows violate the new constraint: {message}")]
    ConstraintViolation { operation: String, message: String },

    #[error("{operation}: object appeared during the run, another migration raced us: {message}")]
    ConcurrentMigration { operation: String, message: String },

    #[error("another ddlsync run holds the migration lock (waited {waited:?})")]
    LockUnavailable { waited: Duration },

    #[error("{operation}: statement timed out waiting for a lock or to finish")]
    Timeout { operation: String },

    #[error("{operation}: {source}")]
    Ddl {
        operation: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("ledger error: {0}")]
    Ledger(#[source] tokio_postgres::Error),

    #[error("run interrupted ({0}), transaction rolled back")]
    Interrupted(String),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Errors in the catalog itself, or between the catalog and the live schema.
///
/// These are raised before any DDL statement is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("operation '{name}' appears more than once in the catalog")]
    DuplicateOperation { name: String },

    #[error("{operation}: table '{table}' does not exist")]
    TableNotFound { operation: String, table: String },

    #[error("{operation}: column '{table}.{column}' does not exist")]
    ColumnNotFound {
        operation: String,
        table: String,
        column: String,
    },

    #[error("{operation}: index name '{index}' is already used on table '{table}'")]
    IndexNameTaken {
        operation: String,
        index: String,
        table: String,
    },

    #[error("{operation}: foreign key from '{table}' references missing '{target}'")]
    ForeignKeyTargetNotFound {
        operation: String,
        table: String,
        target: String,
    },
}
