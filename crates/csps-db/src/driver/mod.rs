//! Database backends the migration runner can drive.

mod mysql;
mod sqlite;

use async_trait::async_trait;
use csps_common::{MigrationId, Result};
use csps_config::{AppConfig, DatabaseDriver};
use tracing::info;

use crate::ddl::{Dialect, SchemaChange};
use crate::migrations::{AppliedMigration, Guard};

pub use mysql::MySqlDriver;
pub use sqlite::SqliteDriver;

/// Connection-level operations the runner needs: ledger access, a
/// cross-process lock, transactions and statement execution.
///
/// Implementations own a single session so that `begin`/`commit` and the
/// lock apply to the same connection.
#[async_trait]
pub trait MigrationDriver: Send {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Name of the lock guarding migration runs.
    fn lock_name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Statements that carry out `change` on this backend, in order. May
    /// inspect the live schema, so call it inside the unit's transaction.
    async fn render(&mut self, change: &SchemaChange) -> Result<Vec<String>>;

    /// Create the ledger (and any lock bookkeeping) if absent.
    async fn ensure_ledger(&mut self) -> Result<()>;

    /// Ledger rows ordered by identifier.
    async fn applied(&mut self) -> Result<Vec<AppliedMigration>>;

    /// Take the migration lock without waiting. `Ok(false)` means another
    /// session holds it.
    async fn try_lock(&mut self) -> Result<bool>;

    async fn unlock(&mut self) -> Result<()>;

    /// Clear a lock left behind by a crashed run.
    async fn force_unlock(&mut self) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Whether `guard` holds against the live schema.
    async fn check(&mut self, guard: &Guard) -> Result<bool>;

    async fn record(&mut self, record: &AppliedMigration) -> Result<()>;

    async fn forget(&mut self, id: MigrationId) -> Result<()>;
}

#[async_trait]
impl<D: MigrationDriver + ?Sized> MigrationDriver for Box<D> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn lock_name(&self) -> &str {
        (**self).lock_name()
    }

    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    async fn render(&mut self, change: &SchemaChange) -> Result<Vec<String>> {
        (**self).render(change).await
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        (**self).ensure_ledger().await
    }

    async fn applied(&mut self) -> Result<Vec<AppliedMigration>> {
        (**self).applied().await
    }

    async fn try_lock(&mut self) -> Result<bool> {
        (**self).try_lock().await
    }

    async fn unlock(&mut self) -> Result<()> {
        (**self).unlock().await
    }

    async fn force_unlock(&mut self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn begin(&mut self) -> Result<()> {
        (**self).begin().await
    }

    async fn commit(&mut self) -> Result<()> {
        (**self).commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        (**self).rollback().await
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        (**self).execute(statement).await
    }

    async fn check(&mut self, guard: &Guard) -> Result<bool> {
        (**self).check(guard).await
    }

    async fn record(&mut self, record: &AppliedMigration) -> Result<()> {
        (**self).record(record).await
    }

    async fn forget(&mut self, id: MigrationId) -> Result<()> {
        (**self).forget(id).await
    }
}

/// Open the driver selected by `config.database.driver`.
pub async fn connect(config: &AppConfig) -> Result<Box<dyn MigrationDriver>> {
    info!(
        "connecting to {} database at {}",
        match config.database.driver {
            DatabaseDriver::Mysql => "mysql",
            DatabaseDriver::Sqlite => "sqlite",
        },
        config.database.display_target()
    );
    match config.database.driver {
        DatabaseDriver::Mysql => Ok(Box::new(
            MySqlDriver::connect(&config.database, &config.migrations).await?,
        )),
        DatabaseDriver::Sqlite => {
            let driver = match &config.database.sqlite_path {
                Some(path) => SqliteDriver::open(path, &config.migrations)?,
                None => SqliteDriver::in_memory(&config.migrations)?,
            };
            Ok(Box::new(driver))
        }
    }
}
