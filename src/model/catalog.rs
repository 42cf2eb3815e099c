use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::flow::{FlowType, NotifyType};

fn default_timeout() -> i32 {
    1800
}

fn default_max_try_times() -> i32 {
    1
}

/// A stored workflow definition (project scoped).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: i32,
    pub project_id: i32,
    pub name: String,
    pub owner_id: i32,
    #[serde(default)]
    pub flow_type: FlowType,
    /// Default run timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: i32,
    #[serde(default)]
    pub workflow_data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    #[default]
    Online,
    Offline,
}

/// Cron trigger definition bound to one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub flow_id: i32,
    pub project_id: i32,
    pub crontab: String,
    /// Trigger is valid within `[start_date, end_date)`.
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default)]
    pub status: ScheduleStatus,
    #[serde(default)]
    pub notify_type: NotifyType,
    #[serde(default)]
    pub notify_mails: Vec<String>,
    #[serde(default = "default_max_try_times")]
    pub max_try_times: i32,
    #[serde(default)]
    pub timeout: i32,
}

/// A one-off request executed outside the flow dispatch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHoc {
    pub id: i32,
    pub project_id: i32,
    pub owner_id: i32,
    #[serde(default)]
    pub statement: String,
}

/// The persisted address of the active master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRecord {
    pub host: String,
    pub port: u16,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl MasterRecord {
    pub fn is_same_address(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

impl std::fmt::Display for MasterRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
