//! The operation catalog: every structural change this version knows about.
//!
//! Order is significant. An operation always comes after the operations it
//! depends on: tables before their columns, columns before indexes and
//! constraints on them, referenced tables before foreign keys pointing at
//! them. To evolve the schema, append to [`catalog`].

use crate::model::{ColumnSpec, ColumnType, ConstraintSpec, IndexSpec, OnDelete, Operation, TableSpec};
use crate::PlanningError;
use std::collections::{HashMap, HashSet};

/// Tables the catalog alters but does not create. They are owned by the
/// application and must already exist.
pub const EXTERNAL_TABLES: &[&str] = &["users"];

fn col(table: &str, name: &str, column_type: ColumnType) -> ColumnSpec {
    ColumnSpec::new(table, name, column_type)
}

fn id(table: &str) -> ColumnSpec {
    col(table, "id", ColumnType::Identifier)
        .primary_key()
        .default("gen_random_uuid()")
}

fn timestamps(table: &str) -> [ColumnSpec; 2] {
    [
        col(table, "created_at", ColumnType::Timestamp).default("now()"),
        col(table, "updated_at", ColumnType::Timestamp).default("now()"),
    ]
}

/// Build the ordered catalog. Pure and deterministic.
pub fn catalog() -> Vec<Operation> {
    let mut teachers = vec![
        id("teachers"),
        col("teachers", "first_name", ColumnType::Text).not_null(),
        col("teachers", "last_name", ColumnType::Text).not_null(),
        col("teachers", "email", ColumnType::Text).not_null(),
        col("teachers", "password", ColumnType::Text).not_null(),
        col("teachers", "district", ColumnType::Text),
        col("teachers", "school", ColumnType::Text),
    ];
    teachers.extend(timestamps("teachers"));

    let mut classes = vec![
        id("classes"),
        col("classes", "teacher_id", ColumnType::Identifier),
        col("classes", "name", ColumnType::Text).not_null(),
        col("classes", "download_code", ColumnType::Text).not_null(),
    ];
    classes.extend(timestamps("classes"));

    let mut student_classes = vec![
        col("student_classes", "student_id", ColumnType::Identifier).primary_key(),
        col("student_classes", "class_id", ColumnType::Identifier).primary_key(),
    ];
    student_classes.extend(timestamps("student_classes"));

    let transactions = vec![
        id("transactions"),
        col("transactions", "student_id", ColumnType::Identifier),
        col("transactions", "stock_id", ColumnType::Text).not_null(),
        col("transactions", "type", ColumnType::Text).not_null(),
        col("transactions", "quantity", ColumnType::Numeric).not_null(),
        col("transactions", "price", ColumnType::Numeric).not_null(),
        col("transactions", "timestamp", ColumnType::Timestamp).default("now()"),
    ];

    vec![
        // Tables
        Operation::CreateTable(TableSpec::new("teachers", teachers)),
        Operation::CreateTable(TableSpec::new("classes", classes)),
        Operation::CreateTable(TableSpec::new("student_classes", student_classes)),
        Operation::CreateTable(TableSpec::new("transactions", transactions)),
        // Columns on the application-owned users table
        Operation::AddColumn(
            col("users", "is_teacher", ColumnType::Boolean)
                .not_null()
                .default("false"),
        ),
        Operation::AddColumn(col("users", "last_initial", ColumnType::VarChar(1))),
        Operation::AddColumn(col("users", "first_name", ColumnType::VarChar(255))),
        // Indexes
        Operation::CreateIndex(IndexSpec::new(
            "ix_classes_download_code",
            "classes",
            &["download_code"],
        )),
        Operation::CreateIndex(IndexSpec::new(
            "ix_student_classes_student_id",
            "student_classes",
            &["student_id"],
        )),
        Operation::CreateIndex(IndexSpec::new(
            "ix_student_classes_class_id",
            "student_classes",
            &["class_id"],
        )),
        Operation::CreateIndex(IndexSpec::new(
            "ix_transactions_timestamp",
            "transactions",
            &["timestamp"],
        )),
        // Uniqueness
        Operation::AddConstraint(ConstraintSpec::unique(
            "uq_classes_download_code",
            "classes",
            &["download_code"],
        )),
        Operation::AddConstraint(ConstraintSpec::unique(
            "uq_teachers_email",
            "teachers",
            &["email"],
        )),
        // Allowed values
        Operation::AddConstraint(ConstraintSpec::one_of(
            "ck_transactions_type",
            "transactions",
            "type",
            &["buy", "sell"],
        )),
        // Referential integrity
        Operation::AddConstraint(ConstraintSpec::foreign_key(
            "fk_classes_teacher_id",
            "classes",
            "teacher_id",
            ("teachers", "id"),
            OnDelete::Cascade,
        )),
        Operation::AddConstraint(ConstraintSpec::foreign_key(
            "fk_student_classes_student_id",
            "student_classes",
            "student_id",
            ("users", "id"),
            OnDelete::Cascade,
        )),
        Operation::AddConstraint(ConstraintSpec::foreign_key(
            "fk_student_classes_class_id",
            "student_classes",
            "class_id",
            ("classes", "id"),
            OnDelete::Cascade,
        )),
        Operation::AddConstraint(ConstraintSpec::foreign_key(
            "fk_transactions_student_id",
            "transactions",
            "student_id",
            ("users", "id"),
            OnDelete::Cascade,
        )),
    ]
}

/// Every table the catalog touches, foreign-key targets included, in
/// first-seen order.
pub fn referenced_tables(catalog: &[Operation]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut tables = Vec::new();
    let mut push = |t: &str| {
        if seen.insert(t.to_string()) {
            tables.push(t.to_string());
        }
    };
    for op in catalog {
        push(op.table());
        if let Operation::AddConstraint(ConstraintSpec::ForeignKey {
            references_table, ..
        }) = op
        {
            push(references_table);
        }
    }
    tables
}

/// Check the catalog against itself, without touching the database.
///
/// Catches duplicate names and ordering mistakes: every table must be external
/// or created earlier, and every column referenced on a catalog-created table
/// must be defined earlier. Columns of external tables are only known once
/// the live schema is inspected, so the planner checks those.
pub fn validate(catalog: &[Operation], external: &[&str]) -> Result<(), PlanningError> {
    let mut names = HashSet::new();
    // table -> known columns; None means external (columns unknown until inspection)
    let mut tables: HashMap<&str, Option<HashSet<&str>>> =
        external.iter().map(|t| (*t, None)).collect();

    fn require<'a>(
        tables: &HashMap<&'a str, Option<HashSet<&'a str>>>,
        operation: &str,
        table: &str,
        columns: &[String],
    ) -> Result<(), PlanningError> {
        match tables.get(table) {
            None => Err(PlanningError::TableNotFound {
                operation: operation.to_string(),
                table: table.to_string(),
            }),
            Some(None) => Ok(()),
            Some(Some(known)) => {
                for column in columns {
                    if !known.contains(column.as_str()) {
                        return Err(PlanningError::ColumnNotFound {
                            operation: operation.to_string(),
                            table: table.to_string(),
                            column: column.clone(),
                        });
                    }
                }
                Ok(())
            }
        }
    }

    for op in catalog {
        let name = op.name();
        if !names.insert(name.clone()) {
            return Err(PlanningError::DuplicateOperation { name });
        }

        match op {
            Operation::CreateTable(t) => {
                let columns = t.columns.iter().map(|c| c.name.as_str()).collect();
                tables.insert(&t.name, Some(columns));
            }
            Operation::AddColumn(c) => {
                require(&tables, &name, &c.table, &[])?;
                if let Some(Some(known)) = tables.get_mut(c.table.as_str()) {
                    known.insert(&c.name);
                }
            }
            Operation::CreateIndex(idx) => require(&tables, &name, &idx.table, &idx.columns)?,
            Operation::AddConstraint(
                ConstraintSpec::Unique { table, columns, .. }
                | ConstraintSpec::Check { table, columns, .. },
            ) => require(&tables, &name, table, columns)?,
            Operation::AddConstraint(ConstraintSpec::ForeignKey {
                table,
                columns,
                references_table,
                references_columns,
                ..
            }) => {
                require(&tables, &name, table, columns)?;
                require(&tables, &name, references_table, references_columns).map_err(|_| {
                    PlanningError::ForeignKeyTargetNotFound {
                        operation: name.clone(),
                        table: table.clone(),
                        target: format!("{}({})", references_table, references_columns.join(", ")),
                    }
                })?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OperationKind;

    #[test]
    fn test_catalog_is_valid() {
        validate(&catalog(), EXTERNAL_TABLES).unwrap();
    }

    #[test]
    fn test_catalog_is_deterministic() {
        assert_eq!(catalog(), catalog());
    }

    #[test]
    fn test_tables_come_before_everything_else() {
        let ops = catalog();
        let last_table = ops
            .iter()
            .rposition(|op| op.kind() == OperationKind::CreateTable)
            .unwrap();
        let first_other = ops
            .iter()
            .position(|op| op.kind() != OperationKind::CreateTable)
            .unwrap();
        assert!(last_table < first_other);
    }

    #[test]
    fn test_foreign_keys_are_last() {
        let ops = catalog();
        let first_fk = ops
            .iter()
            .position(|op| op.kind() == OperationKind::AddForeignKey)
            .unwrap();
        assert!(ops[first_fk..]
            .iter()
            .all(|op| op.kind() == OperationKind::AddForeignKey));
        assert!(ops.iter().filter(|op| op.kind() == OperationKind::AddForeignKey).all(|op| {
            matches!(
                op,
                Operation::AddConstraint(ConstraintSpec::ForeignKey {
                    on_delete: OnDelete::Cascade,
                    ..
                })
            )
        }));
    }

    #[test]
    fn test_transaction_type_is_restricted() {
        let ops = catalog();
        let check = ops
            .iter()
            .find(|op| op.kind() == OperationKind::AddCheckConstraint)
            .unwrap();
        assert_eq!(check.name(), "ck_transactions_type");
        assert_eq!(
            check.to_sql(),
            r#"ALTER TABLE "transactions" ADD CONSTRAINT "ck_transactions_type" CHECK ("type" IN ('buy', 'sell'));"#
        );
    }

    #[test]
    fn test_referenced_tables() {
        assert_eq!(
            referenced_tables(&catalog()),
            vec!["teachers", "classes", "student_classes", "transactions", "users"]
        );
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut ops = catalog();
        ops.push(ops[7].clone());
        assert_eq!(
            validate(&ops, EXTERNAL_TABLES),
            Err(PlanningError::DuplicateOperation {
                name: "ix_classes_download_code".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_index_before_table() {
        let ops = vec![
            Operation::CreateIndex(IndexSpec::new("ix_t_a", "t", &["a"])),
            Operation::CreateTable(TableSpec::new(
                "t",
                vec![ColumnSpec::new("t", "a", ColumnType::Text)],
            )),
        ];
        assert!(matches!(
            validate(&ops, &[]),
            Err(PlanningError::TableNotFound { table, .. }) if table == "t"
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_column() {
        let ops = vec![
            Operation::CreateTable(TableSpec::new(
                "t",
                vec![ColumnSpec::new("t", "a", ColumnType::Text)],
            )),
            Operation::CreateIndex(IndexSpec::new("ix_t_b", "t", &["b"])),
        ];
        assert!(matches!(
            validate(&ops, &[]),
            Err(PlanningError::ColumnNotFound { column, .. }) if column == "b"
        ));
    }

    #[test]
    fn test_validate_accepts_column_added_later_then_indexed() {
        let ops = vec![
            Operation::CreateTable(TableSpec::new(
                "t",
                vec![ColumnSpec::new("t", "a", ColumnType::Text)],
            )),
            Operation::AddColumn(ColumnSpec::new("t", "b", ColumnType::Text)),
            Operation::CreateIndex(IndexSpec::new("ix_t_b", "t", &["b"])),
        ];
        validate(&ops, &[]).unwrap();
    }

    #[test]
    fn test_validate_rejects_fk_to_unknown_table() {
        let ops = vec![
            Operation::CreateTable(TableSpec::new(
                "t",
                vec![ColumnSpec::new("t", "owner_id", ColumnType::Identifier)],
            )),
            Operation::AddConstraint(ConstraintSpec::foreign_key(
                "fk_t_owner_id",
                "t",
                "owner_id",
                ("owners", "id"),
                OnDelete::Cascade,
            )),
        ];
        assert!(matches!(
            validate(&ops, &[]),
            Err(PlanningError::ForeignKeyTargetNotFound { .. })
        ));
    }
}
