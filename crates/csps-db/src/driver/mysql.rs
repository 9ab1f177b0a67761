use async_trait::async_trait;
use chrono::NaiveDateTime;
use csps_common::{Error, MigrationId, Result};
use csps_config::{DatabaseConfig, MigrationConfig};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Executor, Row};
use tracing::{debug, info, warn};

use super::MigrationDriver;
use crate::ddl::{Dialect, SchemaChange};
use crate::migrations::{AppliedMigration, Guard};

const GET_LOCK: &str = "SELECT CAST(GET_LOCK(?, 0) AS SIGNED)";
const RELEASE_LOCK: &str = "SELECT CAST(RELEASE_LOCK(?) AS SIGNED)";
const IS_USED_LOCK: &str = "SELECT CAST(IS_USED_LOCK(?) AS SIGNED)";

/// MySQL backend over one dedicated session.
///
/// Mutual exclusion uses a named lock (`GET_LOCK`), which the server releases
/// automatically when the session ends. MySQL commits DDL implicitly, so only
/// the ledger write is covered by the unit's transaction.
pub struct MySqlDriver {
    conn: MySqlConnection,
    table: String,
    lock_name: String,
    holds_lock: bool,
}

fn db_err(context: &'static str) -> impl Fn(sqlx::Error) -> Error {
    move |e| Error::Database(format!("{context}: {e}"))
}

fn ledger_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS `{table}` (\
         `id` bigint NOT NULL, \
         `name` varchar(255) NOT NULL, \
         `checksum` char(64) NOT NULL, \
         `applied_at` datetime(6) NOT NULL, \
         PRIMARY KEY (`id`)) ENGINE=InnoDB"
    )
}

fn select_ledger_sql(table: &str) -> String {
    format!("SELECT `id`, `name`, `checksum`, `applied_at` FROM `{table}` ORDER BY `id` ASC")
}

fn insert_ledger_sql(table: &str) -> String {
    format!("INSERT INTO `{table}` (`id`, `name`, `checksum`, `applied_at`) VALUES (?, ?, ?, ?)")
}

fn delete_ledger_sql(table: &str) -> String {
    format!("DELETE FROM `{table}` WHERE `id` = ?")
}

impl MySqlDriver {
    pub async fn connect(config: &DatabaseConfig, settings: &MigrationConfig) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.username)
            .password(&config.password)
            .database(&config.database);

        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(db_err("failed to connect"))?;
        info!(
            "connected to mysql at {}:{}/{}",
            config.host, config.port, config.database
        );

        Ok(Self {
            conn,
            table: settings.table.clone(),
            lock_name: settings.lock_name.clone(),
            holds_lock: false,
        })
    }

    async fn count(&mut self, sql: &str, binds: &[&str]) -> Result<i64> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for value in binds {
            query = query.bind(*value);
        }
        query
            .fetch_one(&mut self.conn)
            .await
            .map_err(db_err("schema lookup failed"))
    }

    async fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        let n = self
            .count(
                "SELECT COUNT(*) FROM information_schema.COLUMNS \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?",
                &[table, column],
            )
            .await?;
        Ok(n > 0)
    }

    /// Run a statement over the text protocol. DDL and transaction control
    /// cannot be prepared on every server version.
    async fn run(&mut self, statement: &str) -> std::result::Result<(), sqlx::Error> {
        (&mut self.conn).execute(statement).await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let n = self
            .count(
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                &[table],
            )
            .await?;
        Ok(n > 0)
    }
}

#[async_trait]
impl MigrationDriver for MySqlDriver {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    fn lock_name(&self) -> &str {
        &self.lock_name
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn render(&mut self, change: &SchemaChange) -> Result<Vec<String>> {
        Ok(vec![change.to_string()])
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        let ddl = ledger_ddl(&self.table);
        self.run(&ddl)
            .await
            .map_err(db_err("failed to create ledger table"))
    }

    async fn applied(&mut self) -> Result<Vec<AppliedMigration>> {
        let sql = select_ledger_sql(&self.table);
        let rows = sqlx::query(&sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(db_err("failed to query ledger"))?;

        rows.iter()
            .map(|row| {
                let applied_at: NaiveDateTime =
                    row.try_get(3).map_err(db_err("failed to read ledger row"))?;
                Ok(AppliedMigration {
                    id: MigrationId::new(row.try_get(0).map_err(db_err("failed to read ledger row"))?),
                    name: row.try_get(1).map_err(db_err("failed to read ledger row"))?,
                    checksum: row.try_get(2).map_err(db_err("failed to read ledger row"))?,
                    applied_at: applied_at.and_utc(),
                })
            })
            .collect()
    }

    async fn try_lock(&mut self) -> Result<bool> {
        let acquired: Option<i64> = sqlx::query_scalar(GET_LOCK)
            .bind(&self.lock_name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(db_err("failed to take migration lock"))?;
        self.holds_lock = acquired == Some(1);
        Ok(self.holds_lock)
    }

    async fn unlock(&mut self) -> Result<()> {
        if !self.holds_lock {
            return Ok(());
        }
        let released: Option<i64> = sqlx::query_scalar(RELEASE_LOCK)
            .bind(&self.lock_name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(db_err("failed to release migration lock"))?;
        self.holds_lock = false;
        match released {
            Some(1) => debug!("released migration lock `{}`", self.lock_name),
            // 0: held by another session, NULL: no such lock
            other => warn!(
                "migration lock `{}` was not held by this session on release (RELEASE_LOCK returned {:?})",
                self.lock_name, other
            ),
        }
        Ok(())
    }

    async fn force_unlock(&mut self) -> Result<()> {
        let holder: Option<i64> = sqlx::query_scalar(IS_USED_LOCK)
            .bind(&self.lock_name)
            .fetch_one(&mut self.conn)
            .await
            .map_err(db_err("failed to inspect migration lock"))?;
        match holder {
            None => {
                debug!("migration lock `{}` is free", self.lock_name);
                Ok(())
            }
            Some(connection_id) => Err(Error::Database(format!(
                "lock `{}` is held by live connection {connection_id}; \
                 it is released when that session ends",
                self.lock_name
            ))),
        }
    }

    async fn begin(&mut self) -> Result<()> {
        self.run("START TRANSACTION").await.map_err(db_err("failed to begin transaction"))
    }

    async fn commit(&mut self) -> Result<()> {
        self.run("COMMIT").await.map_err(db_err("failed to commit transaction"))
    }

    async fn rollback(&mut self) -> Result<()> {
        self.run("ROLLBACK").await.map_err(db_err("failed to roll back transaction"))
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.run(statement)
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn check(&mut self, guard: &Guard) -> Result<bool> {
        match guard {
            Guard::ColumnMissing { table, column } => Ok(!self.column_exists(table, column).await?),
            Guard::ColumnExists { table, column } => self.column_exists(table, column).await,
            Guard::TableMissing { table } => Ok(!self.table_exists(table).await?),
            Guard::TableExists { table } => self.table_exists(table).await,
        }
    }

    async fn record(&mut self, record: &AppliedMigration) -> Result<()> {
        let sql = insert_ledger_sql(&self.table);
        sqlx::query(&sql)
            .bind(record.id.get())
            .bind(&record.name)
            .bind(&record.checksum)
            .bind(record.applied_at.naive_utc())
            .execute(&mut self.conn)
            .await
            .map_err(db_err("failed to record migration"))?;
        Ok(())
    }

    async fn forget(&mut self, id: MigrationId) -> Result<()> {
        let sql = delete_ledger_sql(&self.table);
        sqlx::query(&sql)
            .bind(id.get())
            .execute(&mut self.conn)
            .await
            .map_err(db_err("failed to remove ledger row"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::{ColumnDef, SchemaChange};

    #[test]
    fn ledger_ddl_uses_microsecond_timestamps() {
        assert_eq!(
            ledger_ddl("migrations"),
            "CREATE TABLE IF NOT EXISTS `migrations` (`id` bigint NOT NULL, \
             `name` varchar(255) NOT NULL, `checksum` char(64) NOT NULL, \
             `applied_at` datetime(6) NOT NULL, PRIMARY KEY (`id`)) ENGINE=InnoDB"
        );
    }

    #[test]
    fn ledger_statements_target_configured_table() {
        assert_eq!(
            select_ledger_sql("csps_ledger"),
            "SELECT `id`, `name`, `checksum`, `applied_at` FROM `csps_ledger` ORDER BY `id` ASC"
        );
        assert_eq!(
            insert_ledger_sql("csps_ledger"),
            "INSERT INTO `csps_ledger` (`id`, `name`, `checksum`, `applied_at`) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(
            delete_ledger_sql("csps_ledger"),
            "DELETE FROM `csps_ledger` WHERE `id` = ?"
        );
    }

    #[test]
    fn lock_queries_do_not_wait_and_return_integers() {
        assert!(GET_LOCK.contains("GET_LOCK(?, 0)"));
        for sql in [GET_LOCK, RELEASE_LOCK, IS_USED_LOCK] {
            assert!(sql.starts_with("SELECT CAST("), "{sql}");
            assert!(sql.ends_with(" AS SIGNED)"), "{sql}");
            assert_eq!(sql.matches('?').count(), 1, "{sql}");
        }
    }

    #[test]
    fn changes_render_as_single_mysql_statement() {
        let change = SchemaChange::add_column(
            "missions",
            ColumnDef::new("code_legacy", "varchar(50)").nullable().after("description"),
        );
        assert_eq!(change.to_sql(Dialect::MySql), Some(change.to_string()));
        assert!(change.to_string().ends_with("AFTER `description`"));
    }
}
