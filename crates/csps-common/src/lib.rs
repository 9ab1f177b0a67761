pub mod error;
pub mod status;
pub mod types;

pub use error::{Error, Inconsistency, MigrationError, Result};
pub use status::{MissionStatus, ReportStatus};
pub use types::MigrationId;
