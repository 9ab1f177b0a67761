//! Business status vocabularies shared by the schema history (SQL enums) and
//! the display helpers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Planifiee,
    EnCours,
    Terminee,
    RejeteeReplanifiee,
}

impl MissionStatus {
    pub const ALL: [MissionStatus; 4] = [
        MissionStatus::Planifiee,
        MissionStatus::EnCours,
        MissionStatus::Terminee,
        MissionStatus::RejeteeReplanifiee,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            MissionStatus::Planifiee => "planifiee",
            MissionStatus::EnCours => "en_cours",
            MissionStatus::Terminee => "terminee",
            MissionStatus::RejeteeReplanifiee => "rejetee_replanifiee",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Brouillon,
    Envoye,
    Valide,
    Rejete,
    Archive,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 5] = [
        ReportStatus::Brouillon,
        ReportStatus::Envoye,
        ReportStatus::Valide,
        ReportStatus::Rejete,
        ReportStatus::Archive,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ReportStatus::Brouillon => "brouillon",
            ReportStatus::Envoye => "envoye",
            ReportStatus::Valide => "valide",
            ReportStatus::Rejete => "rejete",
            ReportStatus::Archive => "archive",
        }
    }
}

/// Returned when a string is not part of a status vocabulary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for MissionStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl FromStr for ReportStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
