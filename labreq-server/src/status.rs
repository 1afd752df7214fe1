//! Service status summary: counts by lifecycle state and priority, exposed by
//! the `/status` endpoint for the operator dashboard.

use serde::Serialize;

use crate::lifecycle::state::{Priority, RequestStatus};
use crate::model::Request;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub urgent: usize,
    pub routine: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub version: String,
    pub summary: StatusSummary,
}

impl StatusData {
    pub fn from_requests(requests: &[Request], version: String) -> Self {
        let mut summary = StatusSummary {
            total: requests.len(),
            pending: 0,
            in_progress: 0,
            completed: 0,
            cancelled: 0,
            urgent: 0,
            routine: 0,
        };

        for request in requests {
            match request.status {
                RequestStatus::Pending => summary.pending += 1,
                RequestStatus::InProgress => summary.in_progress += 1,
                RequestStatus::Completed => summary.completed += 1,
                RequestStatus::Cancelled => summary.cancelled += 1,
            }
            match request.priority {
                Priority::Urgent => summary.urgent += 1,
                Priority::Routine => summary.routine += 1,
            }
        }

        Self { version, summary }
    }
}

pub fn service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
