//! Migration planner - decides which catalog operations are still missing.
//!
//! The planner walks the catalog in order against a virtual copy of the
//! snapshot. Each operation whose idempotency key is already present is
//! skipped; every other operation is checked for its preconditions and then
//! applied to the virtual schema, so later operations can depend on it:
//!
//! ```text
//! + table classes                   -- apply: table missing
//! + INDEX ix_classes_download_code  -- apply: needs classes.download_code,
//!                                   --        which the line above provides
//! ```
//!
//! Planning never touches the database and is fully deterministic.

use crate::introspect::{SchemaSnapshot, TableSnapshot};
use crate::model::{ColumnSpec, ConstraintSpec, IdempotencyKey, Operation};
use crate::PlanningError;
use std::collections::{HashMap, HashSet};

/// Whether an operation will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The key is absent from the live schema; the operation will run.
    Apply,
    /// Already present; nothing to do.
    Skip,
}

/// One catalog entry with the planner's decision.
#[derive(Debug, Clone)]
pub struct PlanStep<'c> {
    pub operation: &'c Operation,
    pub decision: Decision,
}

/// The planner's output: every catalog entry, in catalog order.
#[derive(Debug, Clone, Default)]
pub struct Plan<'c> {
    pub steps: Vec<PlanStep<'c>>,
}

impl<'c> Plan<'c> {
    /// Operations to apply, in order.
    pub fn pending(&self) -> Vec<&'c Operation> {
        self.steps
            .iter()
            .filter(|s| s.decision == Decision::Apply)
            .map(|s| s.operation)
            .collect()
    }

    /// Operations already present.
    pub fn satisfied(&self) -> Vec<&'c Operation> {
        self.steps
            .iter()
            .filter(|s| s.decision == Decision::Skip)
            .map(|s| s.operation)
            .collect()
    }

    /// True when the schema already matches the catalog.
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.decision == Decision::Skip)
    }
}

/// Virtual representation of a table for simulation.
#[derive(Debug, Clone, Default)]
struct VirtualTable {
    columns: HashSet<String>,
    indexes: HashSet<String>,
    constraints: HashSet<String>,
}

impl From<&TableSnapshot> for VirtualTable {
    fn from(t: &TableSnapshot) -> Self {
        Self {
            columns: t.columns.keys().cloned().collect(),
            indexes: t.indexes.iter().cloned().collect(),
            constraints: t.constraints.keys().cloned().collect(),
        }
    }
}

/// Virtual schema state, seeded from the snapshot and advanced by each
/// planned operation.
#[derive(Debug, Clone, Default)]
struct VirtualSchema {
    tables: HashMap<String, VirtualTable>,
    /// Schema-wide index name -> table
    index_owners: HashMap<String, String>,
}

impl VirtualSchema {
    fn from_snapshot(snapshot: &SchemaSnapshot) -> Self {
        Self {
            tables: snapshot
                .tables
                .iter()
                .filter(|(_, t)| t.exists)
                .map(|(name, t)| (name.clone(), VirtualTable::from(t)))
                .collect(),
            index_owners: snapshot
                .index_owners
                .iter()
                .map(|(index, table)| (index.clone(), table.clone()))
                .collect(),
        }
    }

    fn is_satisfied(&self, key: IdempotencyKey<'_>) -> bool {
        match key {
            IdempotencyKey::Table(name) => self.tables.contains_key(name),
            IdempotencyKey::Column { table, column } => self
                .tables
                .get(table)
                .is_some_and(|t| t.columns.contains(column)),
            IdempotencyKey::Index { table, name } => self
                .tables
                .get(table)
                .is_some_and(|t| t.indexes.contains(name)),
            IdempotencyKey::Constraint { table, name } => self
                .tables
                .get(table)
                .is_some_and(|t| t.constraints.contains(name)),
        }
    }

    fn require(&self, operation: &str, table: &str, columns: &[String]) -> Result<(), PlanningError> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| PlanningError::TableNotFound {
                operation: operation.to_string(),
                table: table.to_string(),
            })?;
        for column in columns {
            if !t.columns.contains(column) {
                return Err(PlanningError::ColumnNotFound {
                    operation: operation.to_string(),
                    table: table.to_string(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    /// Claim a schema-wide index name for `table`. Unique constraints are
    /// backed by an index of the same name, so they claim one too.
    fn claim_index_name(
        &mut self,
        operation: &str,
        index: &str,
        table: &str,
    ) -> Result<(), PlanningError> {
        if let Some(owner) = self.index_owners.get(index) {
            return Err(PlanningError::IndexNameTaken {
                operation: operation.to_string(),
                index: index.to_string(),
                table: owner.clone(),
            });
        }
        self.index_owners.insert(index.to_string(), table.to_string());
        Ok(())
    }

    /// Validate preconditions for `op`, then record its effect.
    fn apply(&mut self, op: &Operation) -> Result<(), PlanningError> {
        let name = op.name();
        match op {
            Operation::CreateTable(t) => {
                self.tables.insert(
                    t.name.clone(),
                    VirtualTable {
                        columns: t.columns.iter().map(|c| c.name.clone()).collect(),
                        ..Default::default()
                    },
                );
            }
            Operation::AddColumn(ColumnSpec { table, name: column, .. }) => {
                self.require(&name, table, &[])?;
                if let Some(t) = self.tables.get_mut(table) {
                    t.columns.insert(column.clone());
                }
            }
            Operation::CreateIndex(idx) => {
                self.require(&name, &idx.table, &idx.columns)?;
                self.claim_index_name(&name, &idx.name, &idx.table)?;
                if let Some(t) = self.tables.get_mut(&idx.table) {
                    t.indexes.insert(idx.name.clone());
                }
            }
            Operation::AddConstraint(c) => {
                self.require(&name, c.table(), c.columns())?;
                if let ConstraintSpec::ForeignKey {
                    table,
                    references_table,
                    references_columns,
                    ..
                } = c
                {
                    self.require(&name, references_table, references_columns)
                        .map_err(|_| PlanningError::ForeignKeyTargetNotFound {
                            operation: name.clone(),
                            table: table.clone(),
                            target: format!(
                                "{}({})",
                                references_table,
                                references_columns.join(", ")
                            ),
                        })?;
                }
                if let ConstraintSpec::Unique { name: index, table, .. } = c {
                    self.claim_index_name(&name, index, table)?;
                }
                if let Some(t) = self.tables.get_mut(c.table()) {
                    t.constraints.insert(c.name().to_string());
                }
            }
        }
        Ok(())
    }
}

/// Filter the catalog against the snapshot.
///
/// The result contains every catalog entry in catalog order, each marked
/// [`Decision::Apply`] or [`Decision::Skip`]. An existing column counts as
/// satisfied whatever its type; see [`detect_drift`].
pub fn plan<'c>(
    catalog: &'c [Operation],
    snapshot: &SchemaSnapshot,
) -> Result<Plan<'c>, PlanningError> {
    let mut schema = VirtualSchema::from_snapshot(snapshot);
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(catalog.len());

    for operation in catalog {
        let name = operation.name();
        if !seen.insert(name.clone()) {
            return Err(PlanningError::DuplicateOperation { name });
        }

        let decision = if schema.is_satisfied(operation.key()) {
            Decision::Skip
        } else {
            schema.apply(operation)?;
            Decision::Apply
        };

        steps.push(PlanStep {
            operation,
            decision,
        });
    }

    Ok(Plan { steps })
}

/// A column that exists under the catalog's name but not with the catalog's
/// definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub table: String,
    pub column: String,
    pub expected: String,
    pub found: String,
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}: expected {}, found {}",
            self.table, self.column, self.expected, self.found
        )
    }
}

fn column_drift(spec: &ColumnSpec, snapshot: &SchemaSnapshot) -> Option<Drift> {
    let info = snapshot.table(&spec.table)?.columns.get(&spec.name)?;
    let type_matches = info.data_type == spec.column_type.information_schema_name()
        && (spec.column_type.max_length().is_none()
            || info.max_length == spec.column_type.max_length());
    if type_matches && info.nullable == spec.nullable {
        return None;
    }
    let describe = |ty: &str, nullable: bool| {
        format!("{}{}", ty, if nullable { "" } else { " NOT NULL" })
    };
    let found_type = match info.max_length {
        Some(len) => format!("{}({})", info.data_type, len),
        None => info.data_type.clone(),
    };
    Some(Drift {
        table: spec.table.clone(),
        column: spec.name.clone(),
        expected: describe(&spec.column_type.to_string(), spec.nullable),
        found: describe(&found_type, info.nullable),
    })
}

/// Compare the type and nullability of every catalog column that already
/// exists.
pub fn detect_drift(catalog: &[Operation], snapshot: &SchemaSnapshot) -> Vec<Drift> {
    catalog
        .iter()
        .flat_map(|op| match op {
            Operation::CreateTable(t) => t.columns.iter().collect::<Vec<_>>(),
            Operation::AddColumn(c) => vec![c],
            _ => Vec::new(),
        })
        .filter_map(|spec| column_drift(spec, snapshot))
        .collect()
}
