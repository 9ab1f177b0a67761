use std::time::{Duration, Instant};

use chrono::Utc;
use csps_common::{MigrationError, MigrationId, Result};
use csps_config::MigrationConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::plan::{self, MigrationStatus};
use super::{AppliedMigration, MigrationUnit, Step};
use crate::driver::MigrationDriver;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// How far `up` should go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Target {
    #[default]
    Latest,
    /// Apply pending units up to and including this identifier.
    UpTo(MigrationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigratorSettings {
    /// How long to wait for another run's lock; zero fails immediately.
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
}

impl Default for MigratorSettings {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::ZERO,
            lock_retry_interval: LOCK_RETRY_INTERVAL,
        }
    }
}

impl From<&MigrationConfig> for MigratorSettings {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            ..Self::default()
        }
    }
}

/// Outcome of an `up` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub applied: Vec<AppliedMigration>,
}

impl RunReport {
    pub fn ids(&self) -> Vec<MigrationId> {
        self.applied.iter().map(|r| r.id).collect()
    }
}

/// A pending unit with its rendered statements, for dry runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedMigration {
    pub id: MigrationId,
    pub name: String,
    pub statements: Vec<String>,
}

/// Run `steps` in order. Guarded steps whose guard does not hold are
/// skipped. Any failure is reported with the 1-based position of the step.
async fn run_steps<D>(unit: &MigrationUnit, steps: &[Step], driver: &mut D) -> Result<()>
where
    D: MigrationDriver + ?Sized,
{
    let total = steps.len();
    for (index, step) in steps.iter().enumerate() {
        let position = index + 1;
        let failure = |statement: String, message: String| MigrationError::StatementExecution {
            id: unit.id,
            name: unit.name.clone(),
            position,
            statement,
            message,
        };

        let mut current = step;
        let mut skip = false;
        while let Step::Guarded { guard, step } = current {
            let holds = driver
                .check(guard)
                .await
                .map_err(|e| failure(format!("-- when {guard}"), e.to_string()))?;
            if !holds {
                debug!("[{position}/{total}] skipped: guard `{guard}` does not hold");
                skip = true;
                break;
            }
            current = step.as_ref();
        }
        if skip {
            continue;
        }

        let statements = match current {
            Step::Change(change) => driver
                .render(change)
                .await
                .map_err(|e| failure(change.to_string(), e.to_string()))?,
            other => vec![other.statement()],
        };
        for statement in statements {
            debug!("[{position}/{total}] {statement}");
            driver
                .execute(&statement)
                .await
                .map_err(|e| failure(statement.clone(), e.to_string()))?;
        }
    }
    Ok(())
}

async fn rollback_quietly<D>(driver: &mut D, unit: &MigrationUnit)
where
    D: MigrationDriver + ?Sized,
{
    if let Err(e) = driver.rollback().await {
        warn!("rollback of migration {} failed: {e}", unit.id);
    }
}

/// Execute `unit.up` and write its ledger row in one transaction. On any
/// failure the transaction is rolled back and nothing is recorded.
pub async fn apply_forward<D>(unit: &MigrationUnit, driver: &mut D) -> Result<AppliedMigration>
where
    D: MigrationDriver + ?Sized,
{
    driver.begin().await?;

    if let Err(e) = run_steps(unit, &unit.up, driver).await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }

    let record = AppliedMigration {
        id: unit.id,
        name: unit.name.clone(),
        checksum: unit.checksum(),
        applied_at: Utc::now(),
    };
    if let Err(e) = driver.record(&record).await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }
    if let Err(e) = driver.commit().await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }
    Ok(record)
}

/// Undo the most recently applied unit and delete its ledger row in one
/// transaction. Returns `None` when nothing is applied.
pub async fn revert_last<D>(
    applied: &[AppliedMigration],
    known: &[MigrationUnit],
    driver: &mut D,
) -> Result<Option<MigrationId>>
where
    D: MigrationDriver + ?Sized,
{
    let Some(unit) = plan::last_applied(known, applied)? else {
        return Ok(None);
    };
    if !unit.is_reversible() {
        return Err(MigrationError::Irreversible {
            id: unit.id,
            name: unit.name.clone(),
        }
        .into());
    }

    driver.begin().await?;

    if let Err(e) = run_steps(unit, &unit.down, driver).await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }
    if let Err(e) = driver.forget(unit.id).await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }
    if let Err(e) = driver.commit().await {
        rollback_quietly(driver, unit).await;
        return Err(e);
    }
    Ok(Some(unit.id))
}

/// Applies and reverts a fixed set of units against one database.
pub struct Migrator<D> {
    driver: D,
    units: Vec<MigrationUnit>,
    settings: MigratorSettings,
}

impl<D: MigrationDriver> Migrator<D> {
    /// Fails on duplicate identifiers before touching the database.
    pub fn new(driver: D, units: Vec<MigrationUnit>, settings: MigratorSettings) -> Result<Self> {
        plan::validate(&units, &[])?;
        Ok(Self {
            driver,
            units,
            settings,
        })
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    pub async fn status(&mut self) -> Result<MigrationStatus> {
        self.driver.ensure_ledger().await?;
        let applied = self.driver.applied().await?;
        plan::status(&self.units, &applied)
    }

    /// Units `up(target)` would apply, with their statements. Read-only.
    pub async fn pending(&mut self, target: Target) -> Result<Vec<PlannedMigration>> {
        self.driver.ensure_ledger().await?;
        let applied = self.driver.applied().await?;
        plan::validate(&self.units, &applied)?;
        let plan = match target {
            Target::Latest => plan::plan_forward(&self.units, &applied)?,
            Target::UpTo(id) => plan::plan_forward_to(&self.units, &applied, id)?,
        };
        let dialect = self.driver.dialect();
        Ok(plan
            .into_iter()
            .map(|unit| PlannedMigration {
                id: unit.id,
                name: unit.name.clone(),
                statements: unit.up.iter().map(|step| step.preview(dialect)).collect(),
            })
            .collect())
    }

    /// Apply every pending unit (up to `target`) in ascending order under the
    /// migration lock. Stops at the first failure; units applied before it
    /// stay applied.
    pub async fn up(&mut self, target: Target) -> Result<RunReport> {
        self.driver.ensure_ledger().await?;
        self.lock().await?;
        let result = self.up_locked(target).await;
        self.release(result).await
    }

    /// Revert the `steps` most recently applied units, newest first.
    pub async fn down(&mut self, steps: usize) -> Result<Vec<MigrationId>> {
        self.driver.ensure_ledger().await?;
        self.lock().await?;
        let result = self.down_locked(steps).await;
        self.release(result).await
    }

    pub async fn force_unlock(&mut self) -> Result<()> {
        self.driver.ensure_ledger().await?;
        self.driver.force_unlock().await
    }

    async fn up_locked(&mut self, target: Target) -> Result<RunReport> {
        let applied = self.driver.applied().await?;
        plan::validate(&self.units, &applied)?;

        for id in plan::status(&self.units, &applied)?.drifted {
            warn!("migration {id} was modified after it was applied");
        }

        let plan = match target {
            Target::Latest => plan::plan_forward(&self.units, &applied)?,
            Target::UpTo(id) => plan::plan_forward_to(&self.units, &applied, id)?,
        };
        if plan.is_empty() {
            info!("schema is up to date");
            return Ok(RunReport::default());
        }

        info!(
            "{} pending migration(s) on {}",
            plan.len(),
            self.driver.backend()
        );
        let mut report = RunReport::default();
        for unit in plan {
            let started = Instant::now();
            let record = apply_forward(unit, &mut self.driver).await?;
            info!(
                "applied {} {} in {:?}",
                unit.id,
                unit.name,
                started.elapsed()
            );
            report.applied.push(record);
        }
        Ok(report)
    }

    async fn down_locked(&mut self, steps: usize) -> Result<Vec<MigrationId>> {
        let mut reverted = Vec::new();
        for _ in 0..steps {
            let applied = self.driver.applied().await?;
            plan::validate(&self.units, &applied)?;
            match revert_last(&applied, &self.units, &mut self.driver).await? {
                Some(id) => {
                    info!("reverted {id}");
                    reverted.push(id);
                }
                None => {
                    info!("no applied migrations left to revert");
                    break;
                }
            }
        }
        Ok(reverted)
    }

    async fn lock(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.settings.lock_timeout;
        let mut waiting = false;
        loop {
            if self.driver.try_lock().await? {
                debug!("acquired migration lock `{}`", self.driver.lock_name());
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::ConcurrentMigration {
                    lock: self.driver.lock_name().to_string(),
                }
                .into());
            }
            if !waiting {
                warn!(
                    "migration lock `{}` is held, waiting up to {:?}",
                    self.driver.lock_name(),
                    self.settings.lock_timeout
                );
                waiting = true;
            }
            tokio::time::sleep(self.settings.lock_retry_interval).await;
        }
    }

    async fn release<T>(&mut self, result: Result<T>) -> Result<T> {
        match (result, self.driver.unlock().await) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(unlock)) => {
                warn!("failed to release migration lock: {unlock}");
                Err(e)
            }
        }
    }
}
