pub mod status;

pub use status::{StatusDescriptor, mission_status_info, report_status_info};
