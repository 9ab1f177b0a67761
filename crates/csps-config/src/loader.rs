use std::path::{Path, PathBuf};

use csps_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, DatabaseDriver};

/// Resolves `AppConfig` from an optional file, `.env`, and the process
/// environment, in that order of increasing precedence.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<AppConfig> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("loaded environment from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => return Err(Error::Config(format!(".env error: {e}"))),
        }
        self.load_with(|key| std::env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable lookup instead
    /// of the process environment.
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match &self.path {
            Some(path) => {
                info!("loading config from {}", path.display());
                read_config_file(path)?
            }
            None => AppConfig::default(),
        };

        apply_env(&mut config, lookup)?;
        validate(&config)?;
        Ok(config)
    }
}

fn read_config_file(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
        "toml" => {
            toml::from_str(&contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let db = &mut config.database;
    if let Some(driver) = lookup("DB_DRIVER") {
        db.driver = match driver.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => DatabaseDriver::Mysql,
            "sqlite" => DatabaseDriver::Sqlite,
            other => return Err(Error::Config(format!("unknown DB_DRIVER: {other}"))),
        };
    }
    if let Some(host) = lookup("DB_HOST") {
        db.host = host;
    }
    if let Some(port) = lookup("DB_PORT") {
        db.port = port
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("DB_PORT is not a valid port: {port}")))?;
    }
    if let Some(username) = lookup("DB_USERNAME") {
        db.username = username;
    }
    if let Some(password) = lookup("DB_PASSWORD") {
        db.password = password;
    }
    if let Some(database) = lookup("DB_DATABASE") {
        db.database = database;
    }
    if let Some(path) = lookup("DB_SQLITE_PATH") {
        db.sqlite_path = Some(PathBuf::from(path));
    }
    if let Some(flag) = lookup("DB_SYNCHRONIZE") {
        db.synchronize = parse_bool("DB_SYNCHRONIZE", &flag)?;
    }

    let migrations = &mut config.migrations;
    if let Some(table) = lookup("MIGRATIONS_TABLE") {
        migrations.table = table;
    }
    if let Some(lock) = lookup("MIGRATIONS_LOCK_NAME") {
        migrations.lock_name = lock;
    }
    if let Some(timeout) = lookup("MIGRATIONS_LOCK_TIMEOUT") {
        migrations.lock_timeout_secs = timeout.trim().parse().map_err(|_| {
            Error::Config(format!("MIGRATIONS_LOCK_TIMEOUT is not a number: {timeout}"))
        })?;
    }
    Ok(())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::Config(format!("{key} is not a boolean: {value}"))),
    }
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.database.synchronize {
        return Err(Error::Config(
            "schema synchronize must stay disabled; apply schema changes through migrations"
                .into(),
        ));
    }
    validate_identifier("migrations.table", &config.migrations.table)?;
    validate_identifier("migrations.lock_name", &config.migrations.lock_name)?;
    Ok(())
}

/// Ledger and lock names are interpolated into SQL, so only plain
/// identifiers are accepted.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Config(format!("{field} cannot be empty")));
    }
    if value.len() > 64 {
        return Err(Error::Config(format!("{field} too long")));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!(
            "{field} must contain only letters, digits and underscores: {value}"
        )));
    }
    Ok(())
}
