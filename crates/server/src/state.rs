//! Shared state handed to every handler.

use chrono::{DateTime, Utc};
use episodic_scheduler::StatusReporter;

pub struct AppState {
    pub status: StatusReporter,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(status: StatusReporter) -> Self {
        Self {
            status,
            started_at: Utc::now(),
        }
    }
}
