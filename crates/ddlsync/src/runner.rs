//! One migration run: inspect, plan and apply inside a single transaction.
//!
//! ```text
//! BEGIN
//!   SET LOCAL lock_timeout / statement_timeout
//!   pg_advisory_xact_lock(...)       -- serialize concurrent runs
//!   inspect -> plan -> apply         -- stop at first failure
//!   record in ddlsync_ledger
//! COMMIT                             -- or ROLLBACK on any error
//! ```
//!
//! DDL is transactional in Postgres, so a failed run leaves the schema
//! exactly as it found it.

use crate::executor::Executor;
use crate::introspect;
use crate::planner::{self, Decision, Drift};
use crate::traced::ConnectionExt;
use crate::{catalog, ledger, lock, Error, Operation, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_postgres::{Client, NoTls, Transaction};
use tracing::{Instrument, info, warn};

/// Tunables for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Upper bound on waiting for any lock, the migration lock included.
    /// `None` waits forever.
    pub lock_timeout: Option<Duration>,
    /// Upper bound on any single statement. `None` means no limit.
    pub statement_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(30)),
            statement_timeout: None,
        }
    }
}

/// What a successful run did.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Operations applied and committed, in order.
    pub applied: Vec<String>,
    /// Operations already present.
    pub skipped: Vec<String>,
    /// Existing columns whose definition differs from the catalog.
    pub drift: Vec<Drift>,
    pub elapsed: Duration,
}

impl RunReport {
    /// True when nothing needed to change.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Runs the catalog against one connection.
///
/// # Example
///
/// ```ignore
/// let (mut client, connection) = tokio_postgres::connect(&url, NoTls).await?;
/// tokio::spawn(connection);
///
/// let report = MigrationRunner::new(&mut client).run().await?;
/// println!("applied {} operation(s)", report.applied.len());
/// ```
pub struct MigrationRunner<'a> {
    client: &'a mut Client,
    catalog: Vec<Operation>,
    external: Vec<String>,
    options: RunOptions,
}

impl<'a> MigrationRunner<'a> {
    /// A runner for the built-in classroom catalog with default options.
    pub fn new(client: &'a mut Client) -> Self {
        Self {
            client,
            catalog: catalog::catalog(),
            external: catalog::EXTERNAL_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
            options: RunOptions::default(),
        }
    }

    /// Replace the catalog, along with the tables it expects to already exist.
    pub fn with_catalog(mut self, catalog: Vec<Operation>, external: &[&str]) -> Self {
        self.catalog = catalog;
        self.external = external.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Run once. Commits if every planned operation succeeds, otherwise rolls
    /// back and returns the first error.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`run`](Self::run), but gives up when `interrupt` resolves.
    ///
    /// Only the inspect, plan and apply phase can be interrupted. The
    /// in-flight statement is cancelled server-side, the transaction is
    /// rolled back, and [`Error::Interrupted`] carries the reason `interrupt`
    /// returned. The connection is usable again afterwards. Once `COMMIT` has
    /// been sent, `interrupt` is no longer polled and the run's real outcome
    /// is returned.
    pub async fn run_until<F>(&mut self, interrupt: F) -> Result<RunReport>
    where
        F: Future<Output = String>,
    {
        let start = Instant::now();

        let external: Vec<&str> = self.external.iter().map(String::as_str).collect();
        catalog::validate(&self.catalog, &external)?;

        let cancel_token = self.client.cancel_token();
        let span = tracing::info_span!("ddlsync.run", operations = self.catalog.len());
        async {
            let tx = self
                .client
                .transaction()
                .await
                .map_err(Error::Inspection)?;

            let outcome = {
                let work = run_in_transaction(&tx, &self.catalog, &self.options);
                tokio::pin!(work);
                tokio::select! {
                    result = &mut work => Ok(result),
                    reason = interrupt => Err(reason),
                }
                // `work` is dropped here, abandoning any in-flight statement.
            };

            match outcome {
                Ok(Ok(mut report)) => {
                    tx.commit().await?;
                    report.elapsed = start.elapsed();
                    info!(
                        applied = report.applied.len(),
                        skipped = report.skipped.len(),
                        drift = report.drift.len(),
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "run complete"
                    );
                    Ok(report)
                }
                Ok(Err(e)) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "rollback failed; the connection will discard the transaction");
                    }
                    tracing::error!(error = %e, "run failed, schema unchanged");
                    Err(e)
                }
                Err(reason) => {
                    if let Err(e) = cancel_token.cancel_query(NoTls).await {
                        warn!(error = %e, "could not cancel in-flight statement");
                    }
                    // Responses arrive in order: once this returns, the
                    // cancelled statement has finished too.
                    if let Err(e) = tx.rollback().await {
                        warn!(error = %e, "rollback after interrupt failed");
                    }
                    warn!(%reason, "run interrupted, transaction rolled back");
                    Err(Error::Interrupted(reason))
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn run_in_transaction(
    tx: &Transaction<'_>,
    catalog: &[Operation],
    options: &RunOptions,
) -> Result<RunReport> {
    if let Some(timeout) = options.statement_timeout {
        tx.traced()
            .batch_execute(&format!(
                "SET LOCAL statement_timeout = '{}ms'",
                timeout.as_millis()
            ))
            .await?;
    }

    lock::acquire(tx, options.lock_timeout).await?;

    let tables = catalog::referenced_tables(catalog);
    let snapshot = introspect::inspect(tx, &tables).await?;
    let ledger = ledger::load(tx).await?;

    for op in ledger::cross_check(&ledger, catalog, &snapshot) {
        warn!(operation = %op.name(), "recorded in ledger but missing from schema, re-applying");
    }

    let plan = planner::plan(catalog, &snapshot)?;

    let drift = planner::detect_drift(catalog, &snapshot);
    for d in &drift {
        warn!(table = %d.table, column = %d.column, expected = %d.expected, found = %d.found, "column definition drift");
    }

    for step in &plan.steps {
        if step.decision == Decision::Skip {
            info!(operation = %step.operation.name(), "skipped: already present");
        }
    }

    let pending = plan.pending();
    let satisfied = plan.satisfied();
    let skipped = satisfied.iter().map(|op| op.name()).collect();

    if pending.is_empty() {
        info!("schema is up to date");
        return Ok(RunReport {
            applied: Vec::new(),
            skipped,
            drift,
            elapsed: Duration::ZERO,
        });
    }

    let report = Executor::new(tx).apply(&pending).await?;

    let adopted: Vec<&Operation> = satisfied
        .into_iter()
        .filter(|op| !ledger.contains(&op.name()))
        .collect();
    ledger::record(tx, &ledger, &pending, &adopted).await?;

    Ok(RunReport {
        applied: report.applied().map(str::to_string).collect(),
        skipped,
        drift,
        elapsed: Duration::ZERO,
    })
}
