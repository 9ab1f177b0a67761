use csps_common::{MissionStatus, ReportStatus};
use serde::Serialize;

/// Label and colour tokens used to render a status badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusDescriptor {
    pub label: &'static str,
    pub color: &'static str,
    pub gradient: [&'static str; 2],
}

const BLUE: [&str; 2] = ["#3B82F6", "#1D4ED8"];
const AMBER: [&str; 2] = ["#F59E0B", "#D97706"];
const GREEN: [&str; 2] = ["#10B981", "#059669"];
const RED: [&str; 2] = ["#EF4444", "#DC2626"];
const SLATE: [&str; 2] = ["#64748B", "#475569"];

const fn descriptor(label: &'static str, gradient: [&'static str; 2]) -> StatusDescriptor {
    StatusDescriptor {
        label,
        color: gradient[0],
        gradient,
    }
}

const MISSION_DEFAULT: StatusDescriptor = descriptor("Planifiée", SLATE);
const REPORT_DEFAULT: StatusDescriptor = descriptor("Brouillon", SLATE);

/// Badge for a mission status code. Unknown codes get the slate "Planifiée"
/// badge rather than an error.
pub fn mission_status_info(status: &str) -> StatusDescriptor {
    match status.parse::<MissionStatus>() {
        Ok(MissionStatus::Planifiee) => descriptor("Planifiée", BLUE),
        Ok(MissionStatus::EnCours) => descriptor("En cours", AMBER),
        Ok(MissionStatus::Terminee) => descriptor("Terminée", GREEN),
        Ok(MissionStatus::RejeteeReplanifiee) => descriptor("Rejetée - Replanifiée", RED),
        Err(_) => MISSION_DEFAULT,
    }
}

/// Badge for a report status code. Unknown codes fall back to "Brouillon".
pub fn report_status_info(status: &str) -> StatusDescriptor {
    match status.parse::<ReportStatus>() {
        Ok(ReportStatus::Brouillon) => descriptor("Brouillon", SLATE),
        Ok(ReportStatus::Envoye) => descriptor("Envoyé", BLUE),
        Ok(ReportStatus::Valide) => descriptor("Validé", GREEN),
        Ok(ReportStatus::Rejete) => descriptor("Rejeté", RED),
        Ok(ReportStatus::Archive) => descriptor("Archivé", SLATE),
        Err(_) => REPORT_DEFAULT,
    }
}
