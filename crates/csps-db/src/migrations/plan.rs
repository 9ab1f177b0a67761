use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use csps_common::{Inconsistency, MigrationError, MigrationId, Result};
use serde::Serialize;

use super::{AppliedMigration, MigrationUnit};

/// Read-only view of a database's migration state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<UnitSummary>,
    pub pending: Vec<UnitSummary>,
    /// Ledger rows with no matching unit in the code.
    pub unknown: Vec<AppliedMigration>,
    /// Applied units whose `up` steps changed since they were applied.
    pub drifted: Vec<MigrationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitSummary {
    pub id: MigrationId,
    pub name: String,
    pub reversible: bool,
    pub applied_at: Option<DateTime<Utc>>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn current_version(&self) -> Option<MigrationId> {
        self.applied.last().map(|u| u.id)
    }
}

fn index_known(known: &[MigrationUnit]) -> Result<BTreeMap<MigrationId, &MigrationUnit>> {
    let mut index = BTreeMap::new();
    for unit in known {
        if index.insert(unit.id, unit).is_some() {
            return Err(
                MigrationError::LedgerInconsistency(Inconsistency::DuplicateIdentifier(unit.id))
                    .into(),
            );
        }
    }
    Ok(index)
}

/// Fails when `known` declares an identifier twice or the ledger references a
/// unit the code does not know about.
pub fn validate(known: &[MigrationUnit], applied: &[AppliedMigration]) -> Result<()> {
    let index = index_known(known)?;
    if let Some(orphan) = applied.iter().find(|r| !index.contains_key(&r.id)) {
        return Err(
            MigrationError::LedgerInconsistency(Inconsistency::UnknownApplied(orphan.id)).into(),
        );
    }
    Ok(())
}

/// Units not yet in the ledger, in ascending identifier order.
pub fn plan_forward<'a>(
    known: &'a [MigrationUnit],
    applied: &[AppliedMigration],
) -> Result<Vec<&'a MigrationUnit>> {
    let index = index_known(known)?;
    let done: HashSet<MigrationId> = applied.iter().map(|r| r.id).collect();
    Ok(index
        .into_values()
        .filter(|unit| !done.contains(&unit.id))
        .collect())
}

/// Like [`plan_forward`], limited to units with `id <= target`.
pub fn plan_forward_to<'a>(
    known: &'a [MigrationUnit],
    applied: &[AppliedMigration],
    target: MigrationId,
) -> Result<Vec<&'a MigrationUnit>> {
    let mut plan = plan_forward(known, applied)?;
    plan.retain(|unit| unit.id <= target);
    Ok(plan)
}

/// The unit behind the most recent ledger row, or `None` on an empty ledger.
pub fn last_applied<'a>(
    known: &'a [MigrationUnit],
    applied: &[AppliedMigration],
) -> Result<Option<&'a MigrationUnit>> {
    let index = index_known(known)?;
    let Some(latest) = applied.iter().map(|r| r.id).max() else {
        return Ok(None);
    };
    match index.get(&latest) {
        Some(unit) => Ok(Some(*unit)),
        None => Err(
            MigrationError::LedgerInconsistency(Inconsistency::UnknownApplied(latest)).into(),
        ),
    }
}

pub fn status(known: &[MigrationUnit], applied: &[AppliedMigration]) -> Result<MigrationStatus> {
    let index = index_known(known)?;
    let records: BTreeMap<MigrationId, &AppliedMigration> =
        applied.iter().map(|r| (r.id, r)).collect();

    let mut report = MigrationStatus::default();
    for (id, unit) in &index {
        let summary = UnitSummary {
            id: *id,
            name: unit.name.clone(),
            reversible: unit.is_reversible(),
            applied_at: records.get(id).map(|r| r.applied_at),
        };
        match records.get(id) {
            Some(record) => {
                if record.checksum != unit.checksum() {
                    report.drifted.push(*id);
                }
                report.applied.push(summary);
            }
            None => report.pending.push(summary),
        }
    }
    report.unknown = records
        .into_values()
        .filter(|r| !index.contains_key(&r.id))
        .cloned()
        .collect();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::Step;

    fn unit(id: i64) -> MigrationUnit {
        MigrationUnit::new(id, format!("Unit{id}"))
            .up(Step::sql(format!("CREATE TABLE t{id} (id INTEGER)")))
            .down(Step::sql(format!("DROP TABLE t{id}")))
    }

    fn record(unit: &MigrationUnit) -> AppliedMigration {
        AppliedMigration {
            id: unit.id,
            name: unit.name.clone(),
            checksum: unit.checksum(),
            applied_at: Utc::now(),
        }
    }

    fn ids(plan: &[&MigrationUnit]) -> Vec<i64> {
        plan.iter().map(|u| u.id.get()).collect()
    }

    #[test]
    fn plan_is_sorted_regardless_of_input_order() {
        let known = vec![unit(30), unit(10), unit(20)];
        let plan = plan_forward(&known, &[]).unwrap();
        assert_eq!(ids(&plan), vec![10, 20, 30]);
    }

    #[test]
    fn plan_skips_applied_units() {
        let known = vec![unit(10), unit(20), unit(30)];
        let applied = vec![record(&known[1])];
        let plan = plan_forward(&known, &applied).unwrap();
        assert_eq!(ids(&plan), vec![10, 30]);
    }

    #[test]
    fn plan_is_deterministic_and_empty_when_up_to_date() {
        let known = vec![unit(2), unit(1)];
        let first = ids(&plan_forward(&known, &[]).unwrap());
        let second = ids(&plan_forward(&known, &[]).unwrap());
        assert_eq!(first, second);

        let applied: Vec<_> = known.iter().map(record).collect();
        assert!(plan_forward(&known, &applied).unwrap().is_empty());
        assert!(plan_forward(&[], &[]).unwrap().is_empty());
    }

    #[test]
    fn duplicate_identifiers_are_fatal() {
        let known = vec![unit(5), unit(7), MigrationUnit::new(5, "Other")];
        let err = plan_forward(&known, &[]).unwrap_err();
        assert_eq!(
            err.as_migration(),
            Some(&MigrationError::LedgerInconsistency(
                Inconsistency::DuplicateIdentifier(MigrationId::new(5))
            ))
        );
    }

    #[test]
    fn plan_to_target_stops_at_target() {
        let known = vec![unit(1), unit(2), unit(3)];
        let plan = plan_forward_to(&known, &[], MigrationId::new(2)).unwrap();
        assert_eq!(ids(&plan), vec![1, 2]);
    }

    #[test]
    fn validate_rejects_unknown_ledger_rows() {
        let known = vec![unit(1)];
        let stray = record(&unit(99));
        let err = validate(&known, &[stray]).unwrap_err();
        assert_eq!(
            err.as_migration(),
            Some(&MigrationError::LedgerInconsistency(
                Inconsistency::UnknownApplied(MigrationId::new(99))
            ))
        );
        assert!(validate(&known, &[record(&known[0])]).is_ok());
    }

    #[test]
    fn last_applied_picks_highest_identifier() {
        let known = vec![unit(1), unit(2), unit(3)];
        let applied = vec![record(&known[1]), record(&known[0])];
        let last = last_applied(&known, &applied).unwrap().unwrap();
        assert_eq!(last.id.get(), 2);
        assert!(last_applied(&known, &[]).unwrap().is_none());
    }

    #[test]
    fn last_applied_unknown_unit_is_inconsistent() {
        let known = vec![unit(1)];
        let applied = vec![record(&known[0]), record(&unit(4))];
        assert!(last_applied(&known, &applied).is_err());
    }

    #[test]
    fn status_reports_applied_pending_unknown_and_drift() {
        let known = vec![unit(1), unit(2), unit(3)];
        let mut edited = record(&known[1]);
        edited.checksum = "0".repeat(64);
        let applied = vec![record(&known[0]), edited, record(&unit(9))];

        let report = status(&known, &applied).unwrap();
        assert_eq!(
            report.applied.iter().map(|u| u.id.get()).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            report.pending.iter().map(|u| u.id.get()).collect::<Vec<_>>(),
            vec![3]
        );
        assert!(report.pending[0].applied_at.is_none());
        assert_eq!(report.unknown.len(), 1);
        assert_eq!(report.drifted, vec![MigrationId::new(2)]);
        assert_eq!(report.current_version(), Some(MigrationId::new(2)));
        assert!(!report.is_up_to_date());
    }

    #[test]
    fn status_serializes_for_machine_output() {
        let known = vec![unit(1), unit(2)];
        let applied = vec![record(&known[0])];
        let report = status(&known, &applied).unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["applied"][0]["id"], 1);
        assert_eq!(json["applied"][0]["name"], "Unit1");
        assert_eq!(json["pending"][0]["id"], 2);
        assert!(json["pending"][0]["applied_at"].is_null());
        assert_eq!(json["unknown"].as_array().map(Vec::len), Some(0));
    }
}
