use thiserror::Error;

use crate::types::MigrationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

/// Failures raised by the migration runner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// A statement of a unit failed. The unit was rolled back; units applied
    /// earlier in the same run stay applied.
    #[error("migration {id} ({name}) failed at statement {position}: {message}")]
    StatementExecution {
        id: MigrationId,
        name: String,
        /// 1-based position of the failing step.
        position: usize,
        statement: String,
        message: String,
    },

    #[error("migration {id} ({name}) is irreversible: it has no down statements")]
    Irreversible { id: MigrationId, name: String },

    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(Inconsistency),

    #[error("migration already in progress (lock `{lock}` is held by another process)")]
    ConcurrentMigration { lock: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("applied migration {0} is not among the known migrations")]
    UnknownApplied(MigrationId),

    #[error("migration identifier {0} is declared more than once")]
    DuplicateIdentifier(MigrationId),
}

impl Error {
    /// The migration failure behind this error, if any.
    pub fn as_migration(&self) -> Option<&MigrationError> {
        match self {
            Error::Migration(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let e = Error::Config("bad yaml".into());
        assert_eq!(e.to_string(), "configuration error: bad yaml");

        let e = Error::Database("connection refused".into());
        assert_eq!(e.to_string(), "database error: connection refused");

        let e = Error::Other("misc".into());
        assert_eq!(e.to_string(), "misc");
    }

    #[test]
    fn statement_failure_names_unit_and_position() {
        let e = Error::from(MigrationError::StatementExecution {
            id: MigrationId::new(1711929600000),
            name: "AddMissionRejectionReason".into(),
            position: 2,
            statement: "ALTER TABLE `missions` ADD `x` int".into(),
            message: "duplicate column name".into(),
        });
        assert_eq!(
            e.to_string(),
            "migration 1711929600000 (AddMissionRejectionReason) failed at statement 2: duplicate column name"
        );
        assert!(matches!(
            e.as_migration(),
            Some(MigrationError::StatementExecution { position: 2, .. })
        ));
    }

    #[test]
    fn ledger_inconsistency_display() {
        let e = MigrationError::LedgerInconsistency(Inconsistency::DuplicateIdentifier(
            MigrationId::new(42),
        ));
        assert_eq!(
            e.to_string(),
            "ledger inconsistency: migration identifier 42 is declared more than once"
        );

        let e = MigrationError::ConcurrentMigration {
            lock: "csps_migrations".into(),
        };
        assert!(e.to_string().starts_with("migration already in progress"));
    }
}
