//! Schema history of the CSPS database, oldest first.
//!
//! Units are never edited or removed once shipped. To undo a change, add a
//! new unit.

use csps_common::{MissionStatus, ReportStatus};

use crate::ddl::{ColumnDef, ForeignKey, ReferentialAction, SchemaChange, TableDef};
use crate::migrations::{Guard, MigrationUnit, Step};

fn missions_agent_key() -> ForeignKey {
    ForeignKey::new("FK_missions_agent", "agent_id", "users")
        .on_delete(ReferentialAction::SetNull)
        .on_update(ReferentialAction::NoAction)
}

fn reports_mission_key() -> ForeignKey {
    ForeignKey::new("FK_reports_mission", "mission_id", "missions")
        .on_delete(ReferentialAction::Cascade)
        .on_update(ReferentialAction::NoAction)
}

fn audit_mission_key() -> ForeignKey {
    ForeignKey::new("FK_mission_audit_mission", "mission_id", "missions")
        .on_delete(ReferentialAction::Cascade)
        .on_update(ReferentialAction::NoAction)
}

fn audit_user_key() -> ForeignKey {
    ForeignKey::new("FK_mission_audit_user", "user_id", "users")
        .on_delete(ReferentialAction::SetNull)
        .on_update(ReferentialAction::NoAction)
}

const MISSION_STATUSES_V1: [MissionStatus; 3] = [
    MissionStatus::Planifiee,
    MissionStatus::EnCours,
    MissionStatus::Terminee,
];

const REPORT_STATUSES_V1: [ReportStatus; 4] = [
    ReportStatus::Brouillon,
    ReportStatus::Envoye,
    ReportStatus::Valide,
    ReportStatus::Rejete,
];

fn codes<T: Copy, const N: usize>(statuses: [T; N], code: fn(T) -> &'static str) -> Vec<&'static str> {
    statuses.into_iter().map(code).collect()
}

fn mission_status_column(values: &[&str]) -> ColumnDef {
    ColumnDef::enumeration("status", values).default_str(MissionStatus::Planifiee.as_str())
}

fn report_status_column(values: &[&str]) -> ColumnDef {
    ColumnDef::enumeration("status", values).default_str(ReportStatus::Brouillon.as_str())
}

fn id_column() -> ColumnDef {
    ColumnDef::new("id", "int").auto_increment()
}

fn timestamps(table: TableDef) -> TableDef {
    table
        .column(ColumnDef::new("created_at", "datetime(6)").default_now())
        .column(ColumnDef::new("updated_at", "datetime(6)").default_now_on_update())
}

fn initial_schema() -> MigrationUnit {
    let users = timestamps(
        TableDef::new("users")
            .column(id_column())
            .column(ColumnDef::new("email", "varchar(255)"))
            .column(ColumnDef::new("nom", "varchar(255)"))
            .column(ColumnDef::new("prenom", "varchar(255)"))
            .column(ColumnDef::new("password", "varchar(255)"))
            .column(ColumnDef::enumeration("role", ["admin", "superviseur", "agent"]).default_str("agent")),
    )
    .primary_key("id");

    let missions = timestamps(
        TableDef::new("missions")
            .column(id_column())
            .column(ColumnDef::new("titre", "varchar(255)"))
            .column(ColumnDef::new("description", "varchar(255)").nullable())
            .column(ColumnDef::new("code_legacy", "varchar(50)").nullable())
            .column(ColumnDef::new("date_debut", "datetime"))
            .column(mission_status_column(&codes(MISSION_STATUSES_V1, MissionStatus::as_str)))
            .column(ColumnDef::new("agent_id", "int").nullable()),
    )
    .primary_key("id");

    let reports = timestamps(
        TableDef::new("reports")
            .column(id_column())
            .column(ColumnDef::new("reference", "varchar(100)"))
            .column(ColumnDef::new("contenu", "text"))
            .column(report_status_column(&codes(REPORT_STATUSES_V1, ReportStatus::as_str)))
            .column(ColumnDef::new("mission_id", "int").nullable()),
    )
    .primary_key("id");

    MigrationUnit::new(1709251200000, "InitialSchema")
        .up(SchemaChange::CreateTable(users))
        .up(SchemaChange::create_index("users", "IDX_users_email", "email", true))
        .up(SchemaChange::CreateTable(missions))
        .up(SchemaChange::CreateTable(reports))
        .up(SchemaChange::create_index("reports", "IDX_reports_reference", "reference", false))
        .up(SchemaChange::add_foreign_key("missions", missions_agent_key()))
        .up(SchemaChange::add_foreign_key("reports", reports_mission_key()))
        .down(SchemaChange::drop_foreign_key("reports", reports_mission_key()))
        .down(SchemaChange::drop_foreign_key("missions", missions_agent_key()))
        .down(SchemaChange::drop_index("reports", "IDX_reports_reference"))
        .down(SchemaChange::drop_table("reports"))
        .down(SchemaChange::drop_table("missions"))
        .down(SchemaChange::drop_index("users", "IDX_users_email"))
        .down(SchemaChange::drop_table("users"))
}

fn add_mission_location() -> MigrationUnit {
    MigrationUnit::new(1710115200000, "AddMissionLocation")
        .up(SchemaChange::add_column("missions", ColumnDef::new("lieu", "varchar(255)").nullable()))
        .up(SchemaChange::add_column("missions", ColumnDef::new("date_fin", "datetime").nullable()))
        .down(SchemaChange::drop_column("missions", "date_fin"))
        .down(SchemaChange::drop_column("missions", "lieu"))
}

fn add_report_submission() -> MigrationUnit {
    MigrationUnit::new(1710720000000, "AddReportSubmission")
        .up(SchemaChange::add_column("reports", ColumnDef::new("date_envoi", "datetime").nullable()))
        .up(SchemaChange::add_column("reports", ColumnDef::new("commentaire", "text").nullable()))
        .down(SchemaChange::drop_column("reports", "commentaire"))
        .down(SchemaChange::drop_column("reports", "date_envoi"))
}

fn add_rejected_rescheduled_status() -> MigrationUnit {
    MigrationUnit::new(1711324800000, "AddRejeteeReplanifieeStatus")
        .up(SchemaChange::alter_enum(
            "missions",
            "status",
            codes(MissionStatus::ALL, MissionStatus::as_str),
            MissionStatus::Planifiee.as_str(),
        ))
        .down(SchemaChange::alter_enum(
            "missions",
            "status",
            codes(MISSION_STATUSES_V1, MissionStatus::as_str),
            MissionStatus::Planifiee.as_str(),
        ))
}

fn add_mission_rejection_fields() -> MigrationUnit {
    MigrationUnit::new(1711929600000, "AddMissionRejectionFields")
        .up(SchemaChange::add_column("missions", ColumnDef::new("motif_rejet", "text").nullable()))
        .up(SchemaChange::add_column(
            "missions",
            ColumnDef::new("nombre_replanifications", "int").default("0"),
        ))
        .down(SchemaChange::drop_column("missions", "nombre_replanifications"))
        .down(SchemaChange::drop_column("missions", "motif_rejet"))
}

fn unique_report_reference() -> MigrationUnit {
    MigrationUnit::new(1712534400000, "UniqueReportReference")
        .up(SchemaChange::drop_index("reports", "IDX_reports_reference"))
        .up(SchemaChange::create_index("reports", "UQ_reports_reference", "reference", true))
        .down(SchemaChange::drop_index("reports", "UQ_reports_reference"))
        .down(SchemaChange::create_index("reports", "IDX_reports_reference", "reference", false))
}

/// Existing reports with a NULL `mission_id` make this unit fail; they must
/// be attached or deleted by hand first.
fn require_report_mission() -> MigrationUnit {
    MigrationUnit::new(1713139200000, "RequireReportMission")
        .up(SchemaChange::modify_column("reports", ColumnDef::new("mission_id", "int")))
        .down(SchemaChange::modify_column("reports", ColumnDef::new("mission_id", "int").nullable()))
}

fn add_archived_report_status() -> MigrationUnit {
    MigrationUnit::new(1713744000000, "AddArchiveReportStatus")
        .up(SchemaChange::alter_enum(
            "reports",
            "status",
            codes(ReportStatus::ALL, ReportStatus::as_str),
            ReportStatus::Brouillon.as_str(),
        ))
        .down(SchemaChange::alter_enum(
            "reports",
            "status",
            codes(REPORT_STATUSES_V1, ReportStatus::as_str),
            ReportStatus::Brouillon.as_str(),
        ))
}

fn create_mission_audit() -> MigrationUnit {
    let audit = TableDef::new("mission_audit")
        .column(id_column())
        .column(ColumnDef::new("mission_id", "int"))
        .column(ColumnDef::new("user_id", "int").nullable())
        .column(ColumnDef::new("action", "varchar(50)"))
        .column(ColumnDef::new("ancien_statut", "varchar(50)").nullable())
        .column(ColumnDef::new("nouveau_statut", "varchar(50)").nullable())
        .column(ColumnDef::new("details", "text").nullable())
        .column(ColumnDef::new("created_at", "datetime(6)").default_now())
        .primary_key("id");

    MigrationUnit::new(1714348800000, "CreateMissionAudit")
        .up(SchemaChange::CreateTable(audit))
        .up(SchemaChange::add_foreign_key("mission_audit", audit_mission_key()))
        .up(SchemaChange::add_foreign_key("mission_audit", audit_user_key()))
        .down(SchemaChange::drop_foreign_key("mission_audit", audit_user_key()))
        .down(SchemaChange::drop_foreign_key("mission_audit", audit_mission_key()))
        .down(SchemaChange::drop_table("mission_audit"))
}

fn widen_mission_description() -> MigrationUnit {
    MigrationUnit::new(1714953600000, "WidenMissionDescription")
        .up(SchemaChange::modify_column("missions", ColumnDef::new("description", "text").nullable()))
        .down(SchemaChange::modify_column(
            "missions",
            ColumnDef::new("description", "varchar(255)").nullable(),
        ))
}

fn drop_mission_legacy_code() -> MigrationUnit {
    MigrationUnit::new(1715558400000, "DropMissionLegacyCode")
        .up(SchemaChange::drop_column("missions", "code_legacy"))
        .down(SchemaChange::add_column(
            "missions",
            ColumnDef::new("code_legacy", "varchar(50)")
                .nullable()
                .after("description"),
        ))
}

/// Some environments received `priorite` through a hotfix before this unit
/// existed, hence the guard. Irreversible: once applied there is no telling
/// whether the column came from this unit or from the hotfix.
fn add_mission_priority() -> MigrationUnit {
    MigrationUnit::new(1716163200000, "AddMissionPriority").up(Step::when(
        Guard::ColumnMissing {
            table: "missions".into(),
            column: "priorite".into(),
        },
        SchemaChange::add_column("missions", ColumnDef::new("priorite", "int").default("0")),
    ))
}

/// Deletes audit rows whose mission no longer exists. Irreversible.
fn purge_orphan_audit_rows() -> MigrationUnit {
    MigrationUnit::new(1716768000000, "PurgeOrphanAuditRows").up(Step::sql(
        "DELETE FROM `mission_audit` WHERE `mission_id` NOT IN (SELECT `id` FROM `missions`)",
    ))
}

/// Every CSPS migration unit in application order.
pub fn csps_history() -> Vec<MigrationUnit> {
    vec![
        initial_schema(),
        add_mission_location(),
        add_report_submission(),
        add_rejected_rescheduled_status(),
        add_mission_rejection_fields(),
        unique_report_reference(),
        require_report_mission(),
        add_archived_report_status(),
        create_mission_audit(),
        widen_mission_description(),
        drop_mission_legacy_code(),
        add_mission_priority(),
        purge_orphan_audit_rows(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::plan_forward;

    fn unit(id: i64) -> MigrationUnit {
        csps_history()
            .into_iter()
            .find(|u| u.id.get() == id)
            .unwrap()
    }

    fn rendered(steps: &[Step]) -> Vec<String> {
        steps.iter().map(Step::statement).collect()
    }

    #[test]
    fn history_is_strictly_ascending() {
        let history = csps_history();
        assert!(history.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(plan_forward(&history, &[]).unwrap().len(), history.len());
    }

    #[test]
    fn priority_and_purge_are_irreversible() {
        let irreversible: Vec<_> = csps_history()
            .into_iter()
            .filter(|u| !u.is_reversible())
            .map(|u| u.name)
            .collect();
        assert_eq!(irreversible, vec!["AddMissionPriority", "PurgeOrphanAuditRows"]);
    }

    #[test]
    fn down_steps_mirror_up_step_count() {
        for unit in csps_history().into_iter().filter(MigrationUnit::is_reversible) {
            assert_eq!(unit.up.len(), unit.down.len(), "{}", unit.name);
        }
    }

    #[test]
    fn mission_status_enum_gains_rescheduled_value() {
        let unit = unit(1711324800000);
        assert_eq!(
            rendered(&unit.up),
            vec![
                "ALTER TABLE `missions` MODIFY `status` enum ('planifiee', 'en_cours', 'terminee', \
                 'rejetee_replanifiee') NOT NULL DEFAULT 'planifiee'"
            ]
        );
        assert_eq!(
            rendered(&unit.down),
            vec![
                "ALTER TABLE `missions` MODIFY `status` enum ('planifiee', 'en_cours', 'terminee') \
                 NOT NULL DEFAULT 'planifiee'"
            ]
        );
    }

    #[test]
    fn report_reference_index_swap() {
        let unit = unit(1712534400000);
        assert_eq!(
            rendered(&unit.up),
            vec![
                "DROP INDEX `IDX_reports_reference` ON `reports`",
                "CREATE UNIQUE INDEX `UQ_reports_reference` ON `reports` (`reference`)",
            ]
        );
        assert_eq!(
            rendered(&unit.down),
            vec![
                "DROP INDEX `UQ_reports_reference` ON `reports`",
                "CREATE INDEX `IDX_reports_reference` ON `reports` (`reference`)",
            ]
        );
    }

    #[test]
    fn report_mission_becomes_required() {
        let unit = unit(1713139200000);
        assert_eq!(
            rendered(&unit.up),
            vec!["ALTER TABLE `reports` MODIFY `mission_id` int NOT NULL"]
        );
        assert_eq!(
            rendered(&unit.down),
            vec!["ALTER TABLE `reports` MODIFY `mission_id` int NULL"]
        );
    }

    #[test]
    fn audit_table_and_foreign_keys() {
        let unit = unit(1714348800000);
        let up = rendered(&unit.up);
        assert!(up[0].starts_with("CREATE TABLE `mission_audit` (`id` int NOT NULL AUTO_INCREMENT"));
        assert!(up[0].ends_with("PRIMARY KEY (`id`)) ENGINE=InnoDB"));
        assert_eq!(
            up[1],
            "ALTER TABLE `mission_audit` ADD CONSTRAINT `FK_mission_audit_mission` FOREIGN KEY (`mission_id`) \
             REFERENCES `missions`(`id`) ON DELETE CASCADE ON UPDATE NO ACTION"
        );
        assert_eq!(
            rendered(&unit.down).last().map(String::as_str),
            Some("DROP TABLE `mission_audit`")
        );
    }

    #[test]
    fn priority_column_is_guarded() {
        let unit = unit(1716163200000);
        assert!(matches!(
            &unit.up[0],
            Step::Guarded {
                guard: Guard::ColumnMissing { .. },
                ..
            }
        ));
        assert_eq!(
            rendered(&unit.up),
            vec!["ALTER TABLE `missions` ADD `priorite` int NOT NULL DEFAULT 0"]
        );
        assert!(unit.down.is_empty());
    }

    #[test]
    fn legacy_code_returns_after_description() {
        let unit = unit(1715558400000);
        assert_eq!(
            rendered(&unit.up),
            vec!["ALTER TABLE `missions` DROP COLUMN `code_legacy`"]
        );
        assert_eq!(
            rendered(&unit.down),
            vec!["ALTER TABLE `missions` ADD `code_legacy` varchar(50) NULL AFTER `description`"]
        );
    }

    #[test]
    fn foreign_keys_are_dropped_by_name_on_mysql() {
        let unit = unit(1709251200000);
        let down = rendered(&unit.down);
        assert_eq!(down[0], "ALTER TABLE `reports` DROP FOREIGN KEY `FK_reports_mission`");
        assert_eq!(down[1], "ALTER TABLE `missions` DROP FOREIGN KEY `FK_missions_agent`");
    }

    #[test]
    fn timestamps_default_to_now_with_microseconds() {
        let initial = rendered(&unit(1709251200000).up).join("\n");
        assert!(initial.contains("`created_at` datetime(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6)"));
        assert!(initial.contains(
            "`updated_at` datetime(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6) ON UPDATE CURRENT_TIMESTAMP(6)"
        ));
    }

    #[test]
    fn enum_ddl_uses_shared_vocabulary() {
        let initial = rendered(&unit(1709251200000).up).join("\n");
        assert!(initial.contains(
            "`status` enum ('brouillon', 'envoye', 'valide', 'rejete') NOT NULL DEFAULT 'brouillon'"
        ));
        let archive = rendered(&unit(1713744000000).up);
        assert!(archive[0].contains("'archive'"));
    }
}
