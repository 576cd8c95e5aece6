//! Generic cron jobs sharing the flow claim loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job payload. `kind` selects the handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJobData {
    pub kind: String,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A cron job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub due_time: DateTime<Utc>,
    pub data: CronJobData,
    pub version: i64,
}

impl CronJob {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        due_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            due_time,
            data: CronJobData {
                kind: kind.into(),
                payload,
            },
            version: 0,
        }
    }
}
