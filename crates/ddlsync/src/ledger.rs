//! Applied-operations ledger.
//!
//! An append-only table recording which catalog operation was applied when.
//! Every application adds a row, so an operation re-applied after its object
//! was dropped shows up twice. Rows are written in the same transaction as
//! the DDL they describe, so the ledger can never disagree with a committed
//! run. Operations found already present without any row (applied by hand,
//! or before the ledger existed) are recorded once as `adopted`.
//!
//! The live schema stays the planning source; the ledger is the audit trail
//! and a cross-check (see [`cross_check`]).

use crate::introspect::SchemaSnapshot;
use crate::model::Operation;
use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

/// Ledger table name.
pub const LEDGER_TABLE: &str = "ddlsync_ledger";

/// Generate SQL to create the ledger table.
pub fn create_ledger_sql() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
    "id" BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    "operation" TEXT NOT NULL,
    "kind" TEXT NOT NULL,
    "adopted" BOOLEAN NOT NULL DEFAULT false,
    "applied_at" TIMESTAMPTZ NOT NULL DEFAULT now()
);"#,
        crate::quote_ident(LEDGER_TABLE)
    )
}

/// Generate SQL to append one row. Parameters: operation, kind, adopted.
pub fn record_sql() -> String {
    format!(
        r#"INSERT INTO {} ("operation", "kind", "adopted") VALUES ($1, $2, $3)"#,
        crate::quote_ident(LEDGER_TABLE)
    )
}

/// The latest ledger row for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub operation: String,
    pub kind: String,
    pub adopted: bool,
    pub applied_at: DateTime<Utc>,
    /// Rows recorded for this operation, this one included
    pub applications: i64,
}

/// Ledger contents, latest row per operation name. Empty when the table does
/// not exist yet.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub exists: bool,
    pub entries: IndexMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn contains(&self, operation: &str) -> bool {
        self.entries.contains_key(operation)
    }
}

/// Read the ledger, if there is one.
pub async fn load<C: Connection>(conn: &C) -> Result<Ledger> {
    let conn = conn.traced();

    let exists = conn
        .query_one(
            "SELECT to_regclass(quote_ident(current_schema()) || '.' || quote_ident($1)) IS NOT NULL",
            &[&LEDGER_TABLE],
        )
        .await
        .map_err(Error::Ledger)?
        .get::<_, bool>(0);
    if !exists {
        return Ok(Ledger::default());
    }

    let sql = format!(
        r#"SELECT DISTINCT ON ("operation")
    "operation", "kind", "adopted", "applied_at",
    count(*) OVER (PARTITION BY "operation")
FROM {}
ORDER BY "operation", "id" DESC"#,
        crate::quote_ident(LEDGER_TABLE)
    );
    let rows = conn.query(&sql, &[]).await.map_err(Error::Ledger)?;

    let entries = rows
        .into_iter()
        .map(|row| {
            let entry = LedgerEntry {
                operation: row.get(0),
                kind: row.get(1),
                adopted: row.get(2),
                applied_at: row.get(3),
                applications: row.get(4),
            };
            (entry.operation.clone(), entry)
        })
        .collect();

    Ok(Ledger {
        exists: true,
        entries,
    })
}

/// Append a row for every applied operation, and one for every adopted
/// operation the ledger has never seen. Creates the ledger table if needed.
pub async fn record<C: Connection>(
    conn: &C,
    ledger: &Ledger,
    applied: &[&Operation],
    adopted: &[&Operation],
) -> Result<()> {
    let conn = conn.traced();

    if !ledger.exists {
        conn.batch_execute(&create_ledger_sql())
            .await
            .map_err(Error::Ledger)?;
    }

    let sql = record_sql();
    let rows = applied.iter().map(|op| (op, false)).chain(
        adopted
            .iter()
            .filter(|op| !ledger.contains(&op.name()))
            .map(|op| (op, true)),
    );
    for (op, is_adopted) in rows {
        if is_adopted {
            tracing::debug!(operation = %op.name(), "adopting existing object");
        } else if ledger.contains(&op.name()) {
            tracing::info!(operation = %op.name(), "recording re-application");
        }
        conn.execute(&sql, &[&op.name(), &op.kind().as_str(), &is_adopted])
            .await
            .map_err(Error::Ledger)?;
    }

    Ok(())
}

/// Ledger rows whose object is missing from the live schema.
///
/// Someone dropped an object the engine once created. The planner will
/// re-apply it; the runner reports each one.
pub fn cross_check<'c>(
    ledger: &Ledger,
    catalog: &'c [Operation],
    snapshot: &SchemaSnapshot,
) -> Vec<&'c Operation> {
    catalog
        .iter()
        .filter(|op| ledger.contains(&op.name()))
        .filter(|op| !is_present(op, snapshot))
        .collect()
}

fn is_present(op: &Operation, snapshot: &SchemaSnapshot) -> bool {
    use crate::model::IdempotencyKey;
    match op.key() {
        IdempotencyKey::Table(t) => snapshot.table_exists(t),
        IdempotencyKey::Column { table, column } => {
            snapshot.table(table).is_some_and(|t| t.has_column(column))
        }
        IdempotencyKey::Index { table, name } => {
            snapshot.table(table).is_some_and(|t| t.has_index(name))
        }
        IdempotencyKey::Constraint { table, name } => {
            snapshot.table(table).is_some_and(|t| t.has_constraint(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::introspect::TableSnapshot;

    fn entry(operation: &str) -> LedgerEntry {
        LedgerEntry {
            operation: operation.to_string(),
            kind: "create_index".to_string(),
            adopted: false,
            applied_at: DateTime::<Utc>::UNIX_EPOCH,
            applications: 1,
        }
    }

    #[test]
    fn test_create_ledger_sql() {
        insta::assert_snapshot!(create_ledger_sql(), @r#"
        CREATE TABLE IF NOT EXISTS "ddlsync_ledger" (
            "id" BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
            "operation" TEXT NOT NULL,
            "kind" TEXT NOT NULL,
            "adopted" BOOLEAN NOT NULL DEFAULT false,
            "applied_at" TIMESTAMPTZ NOT NULL DEFAULT now()
        );
        "#);
    }

    #[test]
    fn test_record_sql_always_appends() {
        insta::assert_snapshot!(
            record_sql(),
            @r#"INSERT INTO "ddlsync_ledger" ("operation", "kind", "adopted") VALUES ($1, $2, $3)"#
        );
    }

    #[test]
    fn test_cross_check_reports_dropped_objects() {
        let ops = catalog::catalog();
        let mut ledger = Ledger {
            exists: true,
            ..Default::default()
        };
        for name in ["ix_classes_download_code", "teachers"] {
            ledger.entries.insert(name.to_string(), entry(name));
        }

        let mut snapshot = SchemaSnapshot::new();
        snapshot.tables.insert(
            "teachers".to_string(),
            TableSnapshot {
                exists: true,
                ..Default::default()
            },
        );
        snapshot.tables.insert(
            "classes".to_string(),
            TableSnapshot {
                exists: true,
                ..Default::default()
            },
        );

        let missing = cross_check(&ledger, &ops, &snapshot);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].name(), "ix_classes_download_code");
    }

    #[test]
    fn test_cross_check_without_ledger_is_empty() {
        let ops = catalog::catalog();
        assert!(cross_check(&Ledger::default(), &ops, &SchemaSnapshot::new()).is_empty());
    }
}
