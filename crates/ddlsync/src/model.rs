//! Desired-state schema objects and the DDL they render to.
//!
//! Everything here is immutable once built: the catalog constructs these
//! values at startup and the planner/executor only ever read them.
//!
//! ## Example
//!
//! ```
//! use ddlsync::{ColumnSpec, ColumnType, Operation};
//!
//! let op = Operation::AddColumn(
//!     ColumnSpec::new("users", "is_teacher", ColumnType::Boolean)
//!         .not_null()
//!         .default("false"),
//! );
//! assert_eq!(op.name(), "users.is_teacher");
//! assert_eq!(
//!     op.to_sql(),
//!     r#"ALTER TABLE "users" ADD COLUMN "is_teacher" BOOLEAN NOT NULL DEFAULT false;"#
//! );
//! ```

use std::fmt;

/// Quote a PostgreSQL identifier.
///
/// Always quotes, so reserved words like `user` or `type` are safe. Doubles any
/// embedded quotes.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push_str("\"\"");
        } else {
            out.push(c);
        }
    }
    out.push('"');
    out
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Semantic column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// TEXT
    Text,
    /// VARCHAR(n)
    VarChar(u32),
    /// NUMERIC (arbitrary precision)
    Numeric,
    /// TIMESTAMP (without time zone)
    Timestamp,
    /// BOOLEAN
    Boolean,
    /// UUID
    Identifier,
}

impl ColumnType {
    /// The `data_type` value `information_schema.columns` reports for this type.
    pub fn information_schema_name(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::VarChar(_) => "character varying",
            ColumnType::Numeric => "numeric",
            ColumnType::Timestamp => "timestamp without time zone",
            ColumnType::Boolean => "boolean",
            ColumnType::Identifier => "uuid",
        }
    }

    /// Declared character length, if the type has one.
    pub fn max_length(&self) -> Option<i32> {
        match self {
            ColumnType::VarChar(n) => i32::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Text => write!(f, "TEXT"),
            ColumnType::VarChar(n) => write!(f, "VARCHAR({})", n),
            ColumnType::Numeric => write!(f, "NUMERIC"),
            ColumnType::Timestamp => write!(f, "TIMESTAMP"),
            ColumnType::Boolean => write!(f, "BOOLEAN"),
            ColumnType::Identifier => write!(f, "UUID"),
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Table the column belongs to
    pub table: String,
    /// Column name
    pub name: String,
    /// Semantic type
    pub column_type: ColumnType,
    /// Whether the column allows NULL
    pub nullable: bool,
    /// Default value expression (if any), emitted verbatim
    pub default: Option<String>,
    /// Whether the column carries an inline UNIQUE
    pub unique: bool,
    /// Whether the column is (part of) the primary key. Only used by `CREATE TABLE`.
    pub primary_key: bool,
}

impl ColumnSpec {
    /// A nullable column with no default.
    pub fn new(table: impl Into<String>, name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
            unique: false,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as primary key; implies NOT NULL.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Column definition as it appears in `CREATE TABLE` or `ADD COLUMN`.
    fn definition(&self, inline_pk: bool) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.column_type);
        if self.primary_key && inline_pk {
            def.push_str(" PRIMARY KEY");
        } else if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }
        if let Some(default) = &self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }
}

/// A table created by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name
    pub name: String,
    /// Columns, in declaration order
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    pub fn primary_key_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    fn to_create_table_sql(&self) -> String {
        let pk_columns = self.primary_key_columns();

        // Composite keys need a table constraint instead of inline PRIMARY KEY
        let composite_pk = pk_columns.len() > 1;

        let mut parts: Vec<String> = self
            .columns
            .iter()
            .map(|col| format!("    {}", col.definition(!composite_pk)))
            .collect();

        if composite_pk {
            let quoted: Vec<_> = pk_columns.iter().map(|c| quote_ident(c)).collect();
            parts.push(format!("    PRIMARY KEY ({})", quoted.join(", ")));
        }

        format!(
            "CREATE TABLE {} (\n{}\n);",
            quote_ident(&self.name),
            parts.join(",\n")
        )
    }
}

/// A named, ordered index. Column order matters and is kept exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name, unique within the database
    pub name: String,
    /// Indexed table
    pub table: String,
    /// Columns in index order
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// What happens to referencing rows when the referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnDelete {
    #[default]
    Cascade,
    Restrict,
    SetNull,
}

impl fmt::Display for OnDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnDelete::Cascade => write!(f, "CASCADE"),
            OnDelete::Restrict => write!(f, "RESTRICT"),
            OnDelete::SetNull => write!(f, "SET NULL"),
        }
    }
}

/// A named table constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintSpec {
    Unique {
        name: String,
        table: String,
        columns: Vec<String>,
    },
    ForeignKey {
        name: String,
        table: String,
        columns: Vec<String>,
        references_table: String,
        references_columns: Vec<String>,
        on_delete: OnDelete,
    },
    /// `CHECK (expression)`; `columns` are the columns the expression reads.
    Check {
        name: String,
        table: String,
        columns: Vec<String>,
        expression: String,
    },
}

impl ConstraintSpec {
    pub fn unique(name: impl Into<String>, table: impl Into<String>, columns: &[&str]) -> Self {
        ConstraintSpec::Unique {
            name: name.into(),
            table: table.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Single-column foreign key. Use the enum directly for composite keys.
    pub fn foreign_key(
        name: impl Into<String>,
        table: impl Into<String>,
        column: &str,
        references: (&str, &str),
        on_delete: OnDelete,
    ) -> Self {
        ConstraintSpec::ForeignKey {
            name: name.into(),
            table: table.into(),
            columns: vec![column.to_string()],
            references_table: references.0.to_string(),
            references_columns: vec![references.1.to_string()],
            on_delete,
        }
    }

    /// Restrict a text column to a fixed set of values.
    pub fn one_of(
        name: impl Into<String>,
        table: impl Into<String>,
        column: &str,
        values: &[&str],
    ) -> Self {
        let allowed: Vec<String> = values
            .iter()
            .map(|v| format!("'{}'", v.replace('\'', "''")))
            .collect();
        ConstraintSpec::Check {
            name: name.into(),
            table: table.into(),
            columns: vec![column.to_string()],
            expression: format!("{} IN ({})", quote_ident(column), allowed.join(", ")),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ConstraintSpec::Unique { name, .. }
            | ConstraintSpec::ForeignKey { name, .. }
            | ConstraintSpec::Check { name, .. } => name,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ConstraintSpec::Unique { table, .. }
            | ConstraintSpec::ForeignKey { table, .. }
            | ConstraintSpec::Check { table, .. } => table,
        }
    }

    pub fn columns(&self) -> &[String] {
        match self {
            ConstraintSpec::Unique { columns, .. }
            | ConstraintSpec::ForeignKey { columns, .. }
            | ConstraintSpec::Check { columns, .. } => columns,
        }
    }
}

/// Operation variants, as reported in logs and recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateTable,
    AddColumn,
    CreateIndex,
    AddUniqueConstraint,
    AddCheckConstraint,
    AddForeignKey,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateTable => "create_table",
            OperationKind::AddColumn => "add_column",
            OperationKind::CreateIndex => "create_index",
            OperationKind::AddUniqueConstraint => "add_unique_constraint",
            OperationKind::AddCheckConstraint => "add_check_constraint",
            OperationKind::AddForeignKey => "add_foreign_key",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the planner looks up in the snapshot to decide whether an operation
/// has already been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdempotencyKey<'a> {
    Table(&'a str),
    Column { table: &'a str, column: &'a str },
    Index { table: &'a str, name: &'a str },
    Constraint { table: &'a str, name: &'a str },
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Create a table with its columns and primary key.
    CreateTable(TableSpec),
    /// Add a column to an existing table.
    AddColumn(ColumnSpec),
    /// Create a (non-unique) index.
    CreateIndex(IndexSpec),
    /// Add a UNIQUE, FOREIGN KEY or CHECK constraint.
    AddConstraint(ConstraintSpec),
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::CreateTable(_) => OperationKind::CreateTable,
            Operation::AddColumn(_) => OperationKind::AddColumn,
            Operation::CreateIndex(_) => OperationKind::CreateIndex,
            Operation::AddConstraint(ConstraintSpec::Unique { .. }) => {
                OperationKind::AddUniqueConstraint
            }
            Operation::AddConstraint(ConstraintSpec::ForeignKey { .. }) => {
                OperationKind::AddForeignKey
            }
            Operation::AddConstraint(ConstraintSpec::Check { .. }) => {
                OperationKind::AddCheckConstraint
            }
        }
    }

    /// Stable identifying name.
    ///
    /// This is the DDL object name for tables, indexes and constraints, and
    /// `table.column` for added columns. The ledger is keyed on it.
    pub fn name(&self) -> String {
        match self {
            Operation::CreateTable(t) => t.name.clone(),
            Operation::AddColumn(c) => format!("{}.{}", c.table, c.name),
            Operation::CreateIndex(i) => i.name.clone(),
            Operation::AddConstraint(c) => c.name().to_string(),
        }
    }

    /// The table this operation changes.
    pub fn table(&self) -> &str {
        match self {
            Operation::CreateTable(t) => &t.name,
            Operation::AddColumn(c) => &c.table,
            Operation::CreateIndex(i) => &i.table,
            Operation::AddConstraint(c) => c.table(),
        }
    }

    pub fn key(&self) -> IdempotencyKey<'_> {
        match self {
            Operation::CreateTable(t) => IdempotencyKey::Table(&t.name),
            Operation::AddColumn(c) => IdempotencyKey::Column {
                table: &c.table,
                column: &c.name,
            },
            Operation::CreateIndex(i) => IdempotencyKey::Index {
                table: &i.table,
                name: &i.name,
            },
            Operation::AddConstraint(c) => IdempotencyKey::Constraint {
                table: c.table(),
                name: c.name(),
            },
        }
    }

    /// Render the DDL statement for this operation.
    pub fn to_sql(&self) -> String {
        match self {
            Operation::CreateTable(t) => t.to_create_table_sql(),
            Operation::AddColumn(col) => format!(
                "ALTER TABLE {} ADD COLUMN {};",
                quote_ident(&col.table),
                col.definition(true)
            ),
            Operation::CreateIndex(idx) => format!(
                "CREATE INDEX {} ON {} ({});",
                quote_ident(&idx.name),
                quote_ident(&idx.table),
                quote_list(&idx.columns)
            ),
            Operation::AddConstraint(ConstraintSpec::Unique {
                name,
                table,
                columns,
            }) => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({});",
                quote_ident(table),
                quote_ident(name),
                quote_list(columns)
            ),
            Operation::AddConstraint(ConstraintSpec::ForeignKey {
                name,
                table,
                columns,
                references_table,
                references_columns,
                on_delete,
            }) => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {};",
                quote_ident(table),
                quote_ident(name),
                quote_list(columns),
                quote_ident(references_table),
                quote_list(references_columns),
                on_delete
            ),
            Operation::AddConstraint(ConstraintSpec::Check {
                name,
                table,
                expression,
                ..
            }) => format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({});",
                quote_ident(table),
                quote_ident(name),
                expression
            ),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::CreateTable(t) => write!(f, "+ table {}", t.name),
            Operation::AddColumn(col) => {
                let nullable = if col.nullable { " (nullable)" } else { "" };
                write!(
                    f,
                    "+ {}.{}: {}{}",
                    col.table, col.name, col.column_type, nullable
                )
            }
            Operation::CreateIndex(idx) => write!(
                f,
                "+ INDEX {} ON {} ({})",
                idx.name,
                idx.table,
                idx.columns.join(", ")
            ),
            Operation::AddConstraint(ConstraintSpec::Unique {
                name,
                table,
                columns,
            }) => write!(f, "+ UNIQUE {} ON {} ({})", name, table, columns.join(", ")),
            Operation::AddConstraint(ConstraintSpec::ForeignKey {
                name,
                table,
                columns,
                references_table,
                references_columns,
                on_delete,
            }) => write!(
                f,
                "+ FOREIGN KEY {} {}({}) -> {}({}) ON DELETE {}",
                name,
                table,
                columns.join(", "),
                references_table,
                references_columns.join(", "),
                on_delete
            ),
            Operation::AddConstraint(ConstraintSpec::Check {
                name,
                table,
                expression,
                ..
            }) => write!(f, "+ CHECK {} ON {} ({})", name, table, expression),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("bla\"h"), "\"bla\"\"h\"");
    }

    #[test]
    fn test_create_table_single_pk() {
        let op = Operation::CreateTable(TableSpec::new(
            "teachers",
            vec![
                ColumnSpec::new("teachers", "id", ColumnType::Identifier)
                    .primary_key()
                    .default("gen_random_uuid()"),
                ColumnSpec::new("teachers", "email", ColumnType::Text).not_null(),
                ColumnSpec::new("teachers", "school", ColumnType::Text),
            ],
        ));
        insta::assert_snapshot!(op.to_sql(), @r#"
        CREATE TABLE "teachers" (
            "id" UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            "email" TEXT NOT NULL,
            "school" TEXT
        );
        "#);
    }

    #[test]
    fn test_create_table_composite_pk() {
        let op = Operation::CreateTable(TableSpec::new(
            "student_classes",
            vec![
                ColumnSpec::new("student_classes", "student_id", ColumnType::Identifier)
                    .primary_key(),
                ColumnSpec::new("student_classes", "class_id", ColumnType::Identifier)
                    .primary_key(),
            ],
        ));
        insta::assert_snapshot!(op.to_sql(), @r#"
        CREATE TABLE "student_classes" (
            "student_id" UUID NOT NULL,
            "class_id" UUID NOT NULL,
            PRIMARY KEY ("student_id", "class_id")
        );
        "#);
    }

    #[test]
    fn test_add_column_varchar() {
        let op = Operation::AddColumn(ColumnSpec::new(
            "users",
            "last_initial",
            ColumnType::VarChar(1),
        ));
        assert_eq!(
            op.to_sql(),
            r#"ALTER TABLE "users" ADD COLUMN "last_initial" VARCHAR(1);"#
        );
        assert_eq!(op.kind(), OperationKind::AddColumn);
    }

    #[test]
    fn test_create_index_keeps_column_order() {
        let op = Operation::CreateIndex(IndexSpec::new(
            "ix_trades",
            "transactions",
            &["timestamp", "student_id"],
        ));
        assert_eq!(
            op.to_sql(),
            r#"CREATE INDEX "ix_trades" ON "transactions" ("timestamp", "student_id");"#
        );
    }

    #[test]
    fn test_foreign_key_sql() {
        let op = Operation::AddConstraint(ConstraintSpec::foreign_key(
            "fk_classes_teacher_id",
            "classes",
            "teacher_id",
            ("teachers", "id"),
            OnDelete::SetNull,
        ));
        assert_eq!(op.kind(), OperationKind::AddForeignKey);
        insta::assert_snapshot!(
            op.to_sql(),
            @r#"ALTER TABLE "classes" ADD CONSTRAINT "fk_classes_teacher_id" FOREIGN KEY ("teacher_id") REFERENCES "teachers" ("id") ON DELETE SET NULL;"#
        );
    }

    #[test]
    fn test_unique_sql_and_key() {
        let op = Operation::AddConstraint(ConstraintSpec::unique(
            "uq_classes_download_code",
            "classes",
            &["download_code"],
        ));
        assert_eq!(op.kind(), OperationKind::AddUniqueConstraint);
        assert_eq!(
            op.key(),
            IdempotencyKey::Constraint {
                table: "classes",
                name: "uq_classes_download_code"
            }
        );
        assert_eq!(
            op.to_sql(),
            r#"ALTER TABLE "classes" ADD CONSTRAINT "uq_classes_download_code" UNIQUE ("download_code");"#
        );
    }

    #[test]
    fn test_check_constraint_sql() {
        let op = Operation::AddConstraint(ConstraintSpec::one_of(
            "ck_transactions_type",
            "transactions",
            "type",
            &["buy", "sell"],
        ));
        assert_eq!(op.kind(), OperationKind::AddCheckConstraint);
        insta::assert_snapshot!(
            op.to_sql(),
            @r#"ALTER TABLE "transactions" ADD CONSTRAINT "ck_transactions_type" CHECK ("type" IN ('buy', 'sell'));"#
        );
    }

    #[test]
    fn test_check_values_are_escaped() {
        let c = ConstraintSpec::one_of("ck_t_a", "t", "a", &["it's"]);
        match c {
            ConstraintSpec::Check { expression, .. } => {
                assert_eq!(expression, r#""a" IN ('it''s')"#)
            }
            other => panic!("expected Check, got {:?}", other),
        }
    }

    #[test]
    fn test_display() {
        let op = Operation::AddColumn(ColumnSpec::new("users", "first_name", ColumnType::VarChar(255)));
        assert_eq!(op.to_string(), "+ users.first_name: VARCHAR(255) (nullable)");
    }
}
