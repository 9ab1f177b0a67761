//! Versioned, reversible schema changes and the runner that applies them.
//!
//! Each [`MigrationUnit`] carries an ordered list of `up` steps and the exact
//! inverse as `down` steps. Applied units are tracked in a ledger table; a
//! unit with a ledger row is never applied again.

mod plan;
mod runner;

use std::fmt;

use chrono::{DateTime, Utc};
use csps_common::MigrationId;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::ddl::{Dialect, SchemaChange};

pub use plan::{
    MigrationStatus, UnitSummary, last_applied, plan_forward, plan_forward_to, status, validate,
};
pub use runner::{
    Migrator, MigratorSettings, PlannedMigration, RunReport, Target, apply_forward, revert_last,
};

/// Condition evaluated against the live schema before running a guarded step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    ColumnMissing { table: String, column: String },
    ColumnExists { table: String, column: String },
    TableMissing { table: String },
    TableExists { table: String },
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::ColumnMissing { table, column } => write!(f, "column {table}.{column} is missing"),
            Guard::ColumnExists { table, column } => write!(f, "column {table}.{column} exists"),
            Guard::TableMissing { table } => write!(f, "table {table} is missing"),
            Guard::TableExists { table } => write!(f, "table {table} exists"),
        }
    }
}

/// One statement position in a unit's `up` or `down` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Sql(String),
    Change(SchemaChange),
    /// Runs `step` only when `guard` holds; skipped otherwise.
    Guarded { guard: Guard, step: Box<Step> },
}

impl Step {
    pub fn sql(statement: impl Into<String>) -> Self {
        Step::Sql(statement.into())
    }

    pub fn when(guard: Guard, step: impl Into<Step>) -> Self {
        Step::Guarded {
            guard,
            step: Box::new(step.into()),
        }
    }

    /// The SQL text this step executes, without its guard.
    pub fn statement(&self) -> String {
        match self {
            Step::Sql(sql) => sql.clone(),
            Step::Change(change) => change.to_string(),
            Step::Guarded { step, .. } => step.statement(),
        }
    }

    /// What this step runs on a `dialect` backend, for dry runs. Changes that
    /// need a table rebuild there are shown as a comment naming the change.
    pub fn preview(&self, dialect: Dialect) -> String {
        match self {
            Step::Sql(sql) => sql.clone(),
            Step::Change(change) => change
                .to_sql(dialect)
                .unwrap_or_else(|| format!("-- rebuild table {}: {change}", change.table())),
            Step::Guarded { guard, step } => format!("-- when {guard}\n{}", step.preview(dialect)),
        }
    }
}

impl From<SchemaChange> for Step {
    fn from(change: SchemaChange) -> Self {
        Step::Change(change)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Sql(sql) => f.write_str(sql),
            Step::Change(change) => write!(f, "{change}"),
            Step::Guarded { guard, step } => write!(f, "-- when {guard}\n{step}"),
        }
    }
}

/// One versioned schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    pub id: MigrationId,
    pub name: String,
    pub up: Vec<Step>,
    /// Exact inverse of `up`. Empty means the unit cannot be reverted.
    pub down: Vec<Step>,
}

impl MigrationUnit {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: MigrationId::new(id),
            name: name.into(),
            up: Vec::new(),
            down: Vec::new(),
        }
    }

    pub fn up(mut self, step: impl Into<Step>) -> Self {
        self.up.push(step.into());
        self
    }

    pub fn down(mut self, step: impl Into<Step>) -> Self {
        self.down.push(step.into());
        self
    }

    pub fn is_reversible(&self) -> bool {
        !self.down.is_empty()
    }

    /// Hex SHA-256 of the rendered `up` steps. Stored in the ledger so edits
    /// to an already-applied unit can be detected.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for step in &self.up {
            hasher.update(step.to_string().as_bytes());
            hasher.update(b"\n");
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: MigrationId,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}
