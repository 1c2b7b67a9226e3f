//! Idempotent schema migrations for the classroom trading database.
//!
//! Instead of a numbered migration history, `ddlsync` keeps a fixed, ordered
//! catalog of structural changes (tables, columns, indexes, unique and
//! foreign-key constraints). Every run:
//!
//! 1. inspects the live schema ([`introspect`]),
//! 2. keeps only the catalog operations that are still missing ([`planner`]),
//! 3. applies exactly those, all-or-nothing, in one transaction ([`executor`]).
//!
//! The schema itself is the record of what has been applied, so running the
//! engine twice is harmless: the second run plans nothing.
//!
//! ```ignore
//! let (mut client, connection) = tokio_postgres::connect(&url, NoTls).await?;
//! tokio::spawn(connection);
//!
//! let report = ddlsync::MigrationRunner::new(&mut client).run().await?;
//! for name in &report.applied {
//!     println!("applied {name}");
//! }
//! ```
//!
//! # Adding a change
//!
//! Append an [`Operation`] to [`catalog::catalog`], after everything it
//! depends on. Nothing else needs to change.

pub mod catalog;
mod error;
pub mod executor;
pub mod introspect;
pub mod ledger;
pub mod lock;
mod model;
pub mod planner;
mod runner;
mod traced;

pub use error::{Error, PlanningError};
pub use executor::{ApplyReport, Executor, Outcome};
pub use introspect::{ColumnInfo, SchemaSnapshot, TableSnapshot, inspect};
pub use model::{
    ColumnSpec, ColumnType, ConstraintSpec, IdempotencyKey, IndexSpec, OnDelete, Operation,
    OperationKind, TableSpec, quote_ident,
};
pub use planner::{Decision, Drift, Plan, PlanStep, detect_drift, plan};
pub use runner::{MigrationRunner, RunOptions, RunReport};
pub use traced::{Connection, ConnectionExt, TracedConn};

/// Result type for ddlsync operations.
pub type Result<T> = std::result::Result<T, Error>;
