use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    #[default]
    Mysql,
    Sqlite,
}

/// Connection settings for the target database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: DatabaseDriver,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Database file for the SQLite driver; `None` means in-memory.
    pub sqlite_path: Option<PathBuf>,
    /// Reflective schema sync. Must stay off: the loader rejects `true`.
    pub synchronize: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::Mysql,
            host: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: "csps".to_string(),
            sqlite_path: None,
            synchronize: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Ledger table recording applied migrations.
    pub table: String,
    pub lock_name: String,
    /// How long to wait for a concurrent run to finish; 0 fails fast.
    pub lock_timeout_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            table: "migrations".to_string(),
            lock_name: "csps_migrations".to_string(),
            lock_timeout_secs: 0,
        }
    }
}

impl MigrationConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl DatabaseConfig {
    /// `host:port/database` for log lines; never includes the password.
    pub fn display_target(&self) -> String {
        match self.driver {
            DatabaseDriver::Mysql => format!("{}:{}/{}", self.host, self.port, self.database),
            DatabaseDriver::Sqlite => match &self.sqlite_path {
                Some(path) => path.display().to_string(),
                None => ":memory:".to_string(),
            },
        }
    }
}
