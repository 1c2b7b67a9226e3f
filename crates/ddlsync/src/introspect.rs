//! Schema introspection: read the live structure of the tables the catalog
//! touches.
//!
//! All queries are read-only and scoped to `current_schema()`. A table that
//! does not exist yet still gets an entry, with `exists == false` and empty
//! sets, so the planner never has to special-case a missing map key.

use crate::traced::{Connection, ConnectionExt};
use crate::{Error, Result};
use indexmap::{IndexMap, IndexSet};

/// What the database reports about one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// `information_schema.columns.data_type`, e.g. `character varying`
    pub data_type: String,
    /// Declared character length, if any
    pub max_length: Option<i32>,
    pub nullable: bool,
    pub default: Option<String>,
}

/// Structural objects of one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub exists: bool,
    pub columns: IndexMap<String, ColumnInfo>,
    pub indexes: IndexSet<String>,
    /// Constraint name -> `pg_constraint.contype` (`p`, `u`, `f`, `c`, ...)
    pub constraints: IndexMap<String, char>,
}

impl TableSnapshot {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.contains(name)
    }

    pub fn has_constraint(&self, name: &str) -> bool {
        self.constraints.contains_key(name)
    }
}

/// Point-in-time read of the live schema, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub tables: IndexMap<String, TableSnapshot>,
    /// Every index in the schema, catalog tables or not: index name -> table.
    /// Index names share one namespace per schema.
    pub index_owners: IndexMap<String, String>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a table. Unknown tables read as missing.
    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    pub fn table_exists(&self, name: &str) -> bool {
        self.table(name).is_some_and(|t| t.exists)
    }

    /// The table an index name is already used on, anywhere in the schema.
    pub fn index_owner(&self, index: &str) -> Option<&str> {
        self.index_owners.get(index).map(String::as_str)
    }

    /// Total number of columns, indexes and constraints across all tables.
    pub fn object_count(&self) -> usize {
        self.tables
            .values()
            .map(|t| t.columns.len() + t.indexes.len() + t.constraints.len())
            .sum()
    }
}

const TABLES_SQL: &str = r#"
SELECT table_name::text
FROM information_schema.tables
WHERE table_schema = current_schema()
  AND table_name::text = ANY($1::text[])
"#;

const COLUMNS_SQL: &str = r#"
SELECT
    table_name::text,
    column_name::text,
    data_type::text,
    character_maximum_length::int4,
    is_nullable::text = 'YES',
    column_default::text
FROM information_schema.columns
WHERE table_schema = current_schema()
  AND table_name::text = ANY($1::text[])
ORDER BY table_name, ordinal_position
"#;

const INDEXES_SQL: &str = r#"
SELECT tablename::text, indexname::text
FROM pg_indexes
WHERE schemaname = current_schema()
ORDER BY tablename, indexname
"#;

const CONSTRAINTS_SQL: &str = r#"
SELECT rel.relname::text, con.conname::text, con.contype::text
FROM pg_constraint con
JOIN pg_class rel ON rel.oid = con.conrelid
JOIN pg_namespace nsp ON nsp.oid = rel.relnamespace
WHERE nsp.nspname = current_schema()
  AND rel.relname::text = ANY($1::text[])
ORDER BY rel.relname, con.conname
"#;

/// Inspect the given tables.
///
/// Fails with [`Error::Inspection`] on any connectivity or permission error.
pub async fn inspect<C: Connection>(conn: &C, tables: &[String]) -> Result<SchemaSnapshot> {
    let conn = conn.traced();
    let names: Vec<String> = tables.to_vec();

    let mut snapshot = SchemaSnapshot {
        tables: tables
            .iter()
            .map(|t| (t.clone(), TableSnapshot::default()))
            .collect(),
        index_owners: IndexMap::new(),
    };

    let rows = conn
        .query(TABLES_SQL, &[&names])
        .await
        .map_err(Error::Inspection)?;
    for row in rows {
        let table: String = row.get(0);
        if let Some(t) = snapshot.tables.get_mut(&table) {
            t.exists = true;
        }
    }

    let rows = conn
        .query(COLUMNS_SQL, &[&names])
        .await
        .map_err(Error::Inspection)?;
    for row in rows {
        let table: String = row.get(0);
        if let Some(t) = snapshot.tables.get_mut(&table) {
            t.columns.insert(
                row.get(1),
                ColumnInfo {
                    data_type: row.get(2),
                    max_length: row.get(3),
                    nullable: row.get(4),
                    default: row.get(5),
                },
            );
        }
    }

    let rows = conn
        .query(INDEXES_SQL, &[])
        .await
        .map_err(Error::Inspection)?;
    for row in rows {
        let table: String = row.get(0);
        let index: String = row.get(1);
        if let Some(t) = snapshot.tables.get_mut(&table) {
            t.indexes.insert(index.clone());
        }
        snapshot.index_owners.insert(index, table);
    }

    let rows = conn
        .query(CONSTRAINTS_SQL, &[&names])
        .await
        .map_err(Error::Inspection)?;
    for row in rows {
        let table: String = row.get(0);
        let kind: String = row.get(2);
        if let Some(t) = snapshot.tables.get_mut(&table) {
            t.constraints
                .insert(row.get(1), kind.chars().next().unwrap_or('?'));
        }
    }

    tracing::debug!(
        tables = snapshot.tables.len(),
        objects = snapshot.object_count(),
        "inspected schema"
    );

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_table_reads_as_missing() {
        let snapshot = SchemaSnapshot::new();
        assert!(!snapshot.table_exists("users"));
        assert!(snapshot.table("users").is_none());
    }

    #[test]
    fn test_missing_table_entry_is_empty() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot
            .tables
            .insert("classes".to_string(), TableSnapshot::default());
        let classes = snapshot.table("classes").unwrap();
        assert!(!snapshot.table_exists("classes"));
        assert!(!classes.has_column("id"));
        assert!(!classes.has_index("ix_classes_download_code"));
        assert!(!classes.has_constraint("uq_classes_download_code"));
        assert_eq!(snapshot.object_count(), 0);
    }

    #[test]
    fn test_index_owner() {
        let mut snapshot = SchemaSnapshot::new();
        snapshot
            .index_owners
            .insert("ix_classes_download_code".to_string(), "archive".to_string());
        assert_eq!(snapshot.index_owner("ix_classes_download_code"), Some("archive"));
        assert_eq!(snapshot.index_owner("ix_transactions_timestamp"), None);
    }
}
