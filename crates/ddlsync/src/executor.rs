//! Migration executor - sends the planned DDL.
//!
//! The executor runs on the caller's transaction and stops at the first
//! failure. It never commits or rolls back itself: the runner owns the
//! transaction and rolls it back whenever `apply` returns an error, so a
//! failed batch leaves no structural change behind.

use crate::model::Operation;
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tracing::{error, info, warn};

/// What happened to one planned operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Statement succeeded. Final only once the transaction commits.
    Applied { elapsed: Duration },
    /// Statement failed; the batch stops here.
    Failed { message: String },
    /// Never sent because an earlier operation failed.
    NotAttempted,
}

/// Per-operation result of one batch.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<(String, Outcome)>,
}

impl ApplyReport {
    pub fn applied(&self) -> impl Iterator<Item = &str> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, Outcome::Applied { .. }))
            .map(|(name, _)| name.as_str())
    }
}

/// How a failed DDL statement is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Existing rows violate the new constraint.
    ConstraintViolation,
    /// The object already exists: another run got there first.
    Concurrent,
    /// `lock_timeout` or `statement_timeout` fired.
    Timeout,
    Other,
}

/// Classify a failed statement by its SQLSTATE.
pub fn classify(code: Option<&SqlState>) -> FailureClass {
    let Some(code) = code else {
        return FailureClass::Other;
    };
    if *code == SqlState::UNIQUE_VIOLATION
        || *code == SqlState::FOREIGN_KEY_VIOLATION
        || *code == SqlState::NOT_NULL_VIOLATION
        || *code == SqlState::CHECK_VIOLATION
    {
        FailureClass::ConstraintViolation
    } else if *code == SqlState::DUPLICATE_TABLE
        || *code == SqlState::DUPLICATE_COLUMN
        || *code == SqlState::DUPLICATE_OBJECT
    {
        FailureClass::Concurrent
    } else if *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED {
        FailureClass::Timeout
    } else {
        FailureClass::Other
    }
}

fn to_error(operation: &Operation, source: tokio_postgres::Error) -> Error {
    let operation = operation.name();
    let message = source
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| source.to_string());
    match classify(source.code()) {
        FailureClass::ConstraintViolation => Error::ConstraintViolation { operation, message },
        FailureClass::Concurrent => Error::ConcurrentMigration { operation, message },
        FailureClass::Timeout => Error::Timeout { operation },
        FailureClass::Other => Error::Ddl { operation, source },
    }
}

/// Applies planned operations on a connection, normally the run's transaction.
pub struct Executor<'a, C: Connection> {
    conn: &'a C,
}

impl<'a, C: Connection> Executor<'a, C> {
    pub fn new(conn: &'a C) -> Self {
        Self { conn }
    }

    /// Apply `operations` in order, stopping at the first failure.
    ///
    /// On failure every outcome is logged (applied-then-rolled-back, failed,
    /// not attempted) and the classified error is returned; the caller must
    /// roll back.
    pub async fn apply(&self, operations: &[&Operation]) -> Result<ApplyReport> {
        let conn = self.conn.traced();
        let mut report = ApplyReport::default();

        for (i, op) in operations.iter().enumerate() {
            let name = op.name();
            info!(operation = %name, kind = %op.kind(), "applying");

            let start = Instant::now();
            match conn.execute(&op.to_sql(), &[]).await {
                Ok(_) => {
                    report.outcomes.push((
                        name,
                        Outcome::Applied {
                            elapsed: start.elapsed(),
                        },
                    ));
                }
                Err(source) => {
                    let err = to_error(op, source);
                    report.outcomes.push((
                        name,
                        Outcome::Failed {
                            message: err.to_string(),
                        },
                    ));
                    for rest in &operations[i + 1..] {
                        report.outcomes.push((rest.name(), Outcome::NotAttempted));
                    }
                    log_failed_batch(&report);
                    return Err(err);
                }
            }
        }

        Ok(report)
    }
}

fn log_failed_batch(report: &ApplyReport) {
    for (name, outcome) in &report.outcomes {
        match outcome {
            Outcome::Applied { .. } => warn!(operation = %name, "rolled back"),
            Outcome::Failed { message } => error!(operation = %name, %message, "failed"),
            Outcome::NotAttempted => warn!(operation = %name, "not attempted"),
        }
    }
}
