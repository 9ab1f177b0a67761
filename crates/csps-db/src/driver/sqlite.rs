use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csps_common::{Error, MigrationId, Result};
use csps_config::MigrationConfig;
use rusqlite::{Connection, ErrorCode, params};
use tracing::{info, warn};

use super::MigrationDriver;
use crate::ddl::{ColumnDef, ColumnType, DefaultValue, Dialect, ForeignKey, SchemaChange, TableDef, quote_ident};
use crate::migrations::{AppliedMigration, Guard};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const REBUILD_TABLE: &str = "csps_rebuild";

/// SQLite backend, used for ephemeral and test databases. DDL is
/// transactional here, so a failed unit leaves no trace.
///
/// Column and foreign key changes are carried out by rebuilding the table
/// from its live definition. Foreign key enforcement is off for the length of
/// a unit so rebuilding a parent table does not cascade into its children;
/// violations are checked before commit instead.
///
/// The migration lock is a single row in `<ledger>_lock`; its primary key
/// makes a second insert fail while a run is in progress.
pub struct SqliteDriver {
    conn: Connection,
    table: String,
    lock_table: String,
    lock_name: String,
    holds_lock: bool,
}

impl SqliteDriver {
    pub fn open(db_path: &Path, settings: &MigrationConfig) -> Result<Self> {
        info!("opening sqlite database at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;
        Self::with_connection(conn, settings)
    }

    pub fn in_memory(settings: &MigrationConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;
        Self::with_connection(conn, settings)
    }

    fn with_connection(conn: Connection, settings: &MigrationConfig) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;

        Ok(Self {
            conn,
            table: settings.table.clone(),
            lock_table: format!("{}_lock", settings.table),
            lock_name: settings.lock_name.clone(),
            holds_lock: false,
        })
    }

    /// The underlying connection, for inspecting the schema.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn count(&self, sql: &str, params: impl rusqlite::Params) -> Result<i64> {
        self.conn
            .query_row(sql, params, |row| row.get(0))
            .map_err(|e| Error::Database(format!("schema lookup failed: {e}")))
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let n = self.count(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
            params![table, column],
        )?;
        Ok(n > 0)
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let n = self.count(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
        )?;
        Ok(n > 0)
    }

    /// Read the live definition of `table` back into a [`TableDef`].
    fn describe(&self, table: &str) -> Result<TableDef> {
        let db_err = |e: rusqlite::Error| Error::Database(format!("failed to describe `{table}`: {e}"));

        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(db_err)?;

        let mut def = TableDef::new(table);
        let mut primary_key = Vec::new();
        for row in rows {
            let (name, sql_type, not_null, default, pk) = row.map_err(db_err)?;
            if pk > 0 {
                primary_key.push((pk, name.clone()));
            }
            def.columns.push(ColumnDef {
                name,
                column_type: ColumnType::Raw(sql_type),
                nullable: !not_null,
                default: default.map(|expr| {
                    if expr.eq_ignore_ascii_case("CURRENT_TIMESTAMP") {
                        DefaultValue::CurrentTimestamp { on_update: false }
                    } else {
                        DefaultValue::Expr(expr)
                    }
                }),
                auto_increment: false,
                after: None,
            });
        }
        if def.columns.is_empty() {
            return Err(Error::NotFound(format!("table `{table}`")));
        }
        primary_key.sort();
        def.primary_key = primary_key.into_iter().map(|(_, name)| name).collect();

        let mut stmt = self
            .conn
            .prepare(
                "SELECT \"table\", \"from\", \"to\", on_delete, on_update \
                 FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
            )
            .map_err(db_err)?;
        let keys = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?;
        for key in keys {
            let (parent, column, parent_column, on_delete, on_update) = key.map_err(db_err)?;
            let mut key = ForeignKey::new(String::new(), column, parent)
                .on_delete(on_delete.parse()?)
                .on_update(on_update.parse()?);
            if let Some(parent_column) = parent_column {
                key.references_column = parent_column;
            }
            def.foreign_keys.push(key);
        }
        Ok(def)
    }

    fn index_sql(&self, table: &str) -> Result<Vec<String>> {
        let db_err = |e: rusqlite::Error| Error::Database(format!("failed to list indexes of `{table}`: {e}"));
        let mut stmt = self
            .conn
            .prepare(
                "SELECT sql FROM sqlite_master \
                 WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.map(|row| row.map_err(db_err)).collect()
    }

    /// Statements replacing `table` with the definition `change` leads to:
    /// park the rows in a temp table, recreate the table, copy the surviving
    /// columns back and restore its indexes.
    fn rebuild(&self, change: &SchemaChange) -> Result<Vec<String>> {
        let table = change.table();
        let mut def = self.describe(table)?;
        let before = def.column_names();
        def.apply(change)?;

        let kept: Vec<String> = def
            .column_names()
            .into_iter()
            .filter(|name| before.contains(name))
            .map(|name| quote_ident(&name, Dialect::Sqlite))
            .collect();
        let kept = kept.join(", ");
        let quoted = quote_ident(table, Dialect::Sqlite);
        let parked = format!("temp.{}", quote_ident(REBUILD_TABLE, Dialect::Sqlite));

        let mut statements = vec![
            format!("CREATE TEMP TABLE {} AS SELECT * FROM {quoted}", quote_ident(REBUILD_TABLE, Dialect::Sqlite)),
            format!("DROP TABLE {quoted}"),
            def.create_sql(Dialect::Sqlite),
            format!("INSERT INTO {quoted} ({kept}) SELECT {kept} FROM {parked}"),
            format!("DROP TABLE {parked}"),
        ];
        statements.extend(self.index_sql(table)?);
        Ok(statements)
    }

    fn foreign_key_violations(&self) -> Result<Vec<String>> {
        let db_err = |e: rusqlite::Error| Error::Database(format!("foreign key check failed: {e}"));
        let mut stmt = self
            .conn
            .prepare("SELECT \"table\", parent FROM pragma_foreign_key_check")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(format!("{} -> {}", row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(db_err)?;
        rows.map(|row| row.map_err(db_err)).collect()
    }
}

#[async_trait]
impl MigrationDriver for SqliteDriver {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn lock_name(&self) -> &str {
        &self.lock_name
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn render(&mut self, change: &SchemaChange) -> Result<Vec<String>> {
        match change.to_sql(Dialect::Sqlite) {
            Some(sql) => Ok(vec![sql]),
            None => self.rebuild(change),
        }
    }

    async fn ensure_ledger(&mut self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{table}\" (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS \"{lock}\" (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    owner TEXT NOT NULL,
                    acquired_at TEXT NOT NULL
                );",
                table = self.table,
                lock = self.lock_table,
            ))
            .map_err(|e| Error::Database(format!("failed to create ledger table: {e}")))
    }

    async fn applied(&mut self) -> Result<Vec<AppliedMigration>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, name, checksum, applied_at FROM \"{}\" ORDER BY id ASC",
                self.table
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query ledger: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, checksum, applied_at) =
                row.map_err(|e| Error::Database(format!("failed to read ledger row: {e}")))?;
            records.push(AppliedMigration {
                id: MigrationId::new(id),
                name,
                checksum,
                applied_at: parse_datetime(&applied_at)?,
            });
        }
        Ok(records)
    }

    async fn try_lock(&mut self) -> Result<bool> {
        let owner = format!("{}:{}", self.lock_name, std::process::id());
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, owner, acquired_at) VALUES (1, ?1, ?2)",
                self.lock_table
            ),
            params![owner, Utc::now().to_rfc3339()],
        );
        match inserted {
            Ok(_) => {
                self.holds_lock = true;
                Ok(true)
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Ok(false)
            }
            Err(e) => Err(Error::Database(format!("failed to take migration lock: {e}"))),
        }
    }

    async fn unlock(&mut self) -> Result<()> {
        if !self.holds_lock {
            return Ok(());
        }
        self.conn
            .execute(&format!("DELETE FROM \"{}\" WHERE id = 1", self.lock_table), [])
            .map_err(|e| Error::Database(format!("failed to release migration lock: {e}")))?;
        self.holds_lock = false;
        Ok(())
    }

    async fn force_unlock(&mut self) -> Result<()> {
        let removed = self
            .conn
            .execute(&format!("DELETE FROM \"{}\"", self.lock_table), [])
            .map_err(|e| Error::Database(format!("failed to clear migration lock: {e}")))?;
        if removed > 0 {
            warn!("cleared stale migration lock `{}`", self.lock_name);
        }
        self.holds_lock = false;
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        // foreign_keys cannot change inside a transaction
        self.conn
            .execute_batch("PRAGMA foreign_keys=OFF; BEGIN IMMEDIATE;")
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))
    }

    async fn commit(&mut self) -> Result<()> {
        let violations = self.foreign_key_violations()?;
        if !violations.is_empty() {
            return Err(Error::Database(format!(
                "foreign key violations: {}",
                violations.join(", ")
            )));
        }
        self.conn
            .execute_batch("COMMIT; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to commit transaction: {e}")))
    }

    async fn rollback(&mut self) -> Result<()> {
        let rolled_back = self
            .conn
            .execute_batch("ROLLBACK")
            .map_err(|e| Error::Database(format!("failed to roll back transaction: {e}")));
        self.conn
            .execute_batch("PRAGMA foreign_keys=ON")
            .map_err(|e| Error::Database(format!("failed to restore foreign keys: {e}")))?;
        rolled_back
    }

    async fn execute(&mut self, statement: &str) -> Result<()> {
        self.conn
            .execute_batch(statement)
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn check(&mut self, guard: &Guard) -> Result<bool> {
        match guard {
            Guard::ColumnMissing { table, column } => Ok(!self.column_exists(table, column)?),
            Guard::ColumnExists { table, column } => self.column_exists(table, column),
            Guard::TableMissing { table } => Ok(!self.table_exists(table)?),
            Guard::TableExists { table } => self.table_exists(table),
        }
    }

    async fn record(&mut self, record: &AppliedMigration) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO \"{}\" (id, name, checksum, applied_at) VALUES (?1, ?2, ?3, ?4)",
                    self.table
                ),
                params![
                    record.id.get(),
                    record.name,
                    record.checksum,
                    record.applied_at.to_rfc3339()
                ],
            )
            .map_err(|e| Error::Database(format!("failed to record migration: {e}")))?;
        Ok(())
    }

    async fn forget(&mut self, id: MigrationId) -> Result<()> {
        self.conn
            .execute(
                &format!("DELETE FROM \"{}\" WHERE id = ?1", self.table),
                params![id.get()],
            )
            .map_err(|e| Error::Database(format!("failed to remove ledger row: {e}")))?;
        Ok(())
    }
}

/// Ledger rows carry RFC 3339 timestamps; rows inserted by hand with
/// `datetime('now')` are read as UTC.
fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| Error::Database(format!("invalid ledger timestamp `{value}`: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> SqliteDriver {
        SqliteDriver::in_memory(&MigrationConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn ledger_is_created_idempotently() {
        let mut db = driver();
        db.ensure_ledger().await.unwrap();
        db.ensure_ledger().await.unwrap();
        assert!(db.table_exists("migrations").unwrap());
        assert!(db.table_exists("migrations_lock").unwrap());
        assert!(db.applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn record_and_forget_round_trip() {
        let mut db = driver();
        db.ensure_ledger().await.unwrap();
        let record = AppliedMigration {
            id: MigrationId::new(1709251200000),
            name: "InitialSchema".into(),
            checksum: "ab".repeat(32),
            applied_at: Utc::now(),
        };
        db.record(&record).await.unwrap();

        let rows = db.applied().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, record.id);
        assert_eq!(rows[0].name, "InitialSchema");
        assert_eq!(rows[0].checksum, record.checksum);

        db.forget(record.id).await.unwrap();
        assert!(db.applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let mut db = driver();
        db.ensure_ledger().await.unwrap();
        assert!(db.try_lock().await.unwrap());
        assert!(!db.try_lock().await.unwrap());
        db.unlock().await.unwrap();
        assert!(db.try_lock().await.unwrap());
        db.force_unlock().await.unwrap();
        assert!(db.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn guards_read_live_schema() {
        let mut db = driver();
        db.execute("CREATE TABLE missions (id INTEGER PRIMARY KEY, titre TEXT)")
            .await
            .unwrap();

        let present = Guard::ColumnExists {
            table: "missions".into(),
            column: "titre".into(),
        };
        let missing = Guard::ColumnMissing {
            table: "missions".into(),
            column: "priorite".into(),
        };
        assert!(db.check(&present).await.unwrap());
        assert!(db.check(&missing).await.unwrap());
        assert!(db.check(&Guard::TableExists { table: "missions".into() }).await.unwrap());
        assert!(db.check(&Guard::TableMissing { table: "reports".into() }).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_discards_ddl() {
        let mut db = driver();
        db.begin().await.unwrap();
        db.execute("CREATE TABLE scratch (id INTEGER)").await.unwrap();
        db.rollback().await.unwrap();
        assert!(!db.table_exists("scratch").unwrap());
    }

    #[test]
    fn parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2024-03-01 08:30:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2024-03-01T08:30:00+00:00");
    }

    #[tokio::test]
    async fn corrupt_ledger_timestamp_is_an_error() {
        let mut db = driver();
        db.ensure_ledger().await.unwrap();
        db.execute("INSERT INTO migrations (id, name, checksum, applied_at) VALUES (1, 'a', 'x', 'yesterday')")
            .await
            .unwrap();
        match db.applied().await {
            Err(Error::Database(message)) => assert!(message.contains("yesterday")),
            other => panic!("expected a database error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rebuild_preserves_rows_indexes_and_position() {
        let mut db = driver();
        db.execute(
            "CREATE TABLE \"missions\" (\"id\" INTEGER NOT NULL, \"titre\" varchar(255) NOT NULL, \
             \"description\" varchar(255), PRIMARY KEY (\"id\"))",
        )
        .await
        .unwrap();
        db.execute("CREATE INDEX \"IDX_missions_titre\" ON \"missions\" (\"titre\")")
            .await
            .unwrap();
        db.execute("INSERT INTO missions (id, titre, description) VALUES (1, 'Ronde', 'nuit')")
            .await
            .unwrap();

        let add = SchemaChange::add_column(
            "missions",
            ColumnDef::new("code", "varchar(50)").nullable().after("titre"),
        );
        db.begin().await.unwrap();
        for statement in db.render(&add).await.unwrap() {
            db.execute(&statement).await.unwrap();
        }
        db.commit().await.unwrap();

        let def = db.describe("missions").unwrap();
        assert_eq!(def.column_names(), vec!["id", "titre", "code", "description"]);
        assert_eq!(def.primary_key, vec!["id"]);
        assert_eq!(db.index_sql("missions").unwrap().len(), 1);
        let (titre, description): (String, String) = db
            .connection()
            .query_row("SELECT titre, description FROM missions WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((titre.as_str(), description.as_str()), ("Ronde", "nuit"));
        assert!(!db.table_exists("csps_rebuild").unwrap());
    }

    #[tokio::test]
    async fn commit_refuses_foreign_key_violations() {
        let mut db = driver();
        db.begin().await.unwrap();
        db.execute("CREATE TABLE parent (id INTEGER PRIMARY KEY)").await.unwrap();
        db.execute("CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))")
            .await
            .unwrap();
        db.execute("INSERT INTO child (id, parent_id) VALUES (1, 99)").await.unwrap();

        assert!(db.commit().await.is_err());
        db.rollback().await.unwrap();
        assert!(!db.table_exists("child").unwrap());
        let enforced: bool = db
            .connection()
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert!(enforced);
    }
}
