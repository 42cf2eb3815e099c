use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::catalog::{Schedule, Workflow};

/// Execution status of a flow.
///
/// The discriminants are the persisted ordinals; "not yet finished" checks
/// compare against them, so the order must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Init = 0,
    WaitingDep = 1,
    WaitingRes = 2,
    Running = 3,
    Success = 4,
    Kill = 5,
    Failed = 6,
    DepFailed = 7,
}

impl FlowStatus {
    /// True for the terminal states.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            FlowStatus::Success | FlowStatus::Kill | FlowStatus::Failed | FlowStatus::DepFailed
        )
    }

    pub fn ordinal(&self) -> i32 {
        *self as i32
    }

    pub fn from_ordinal(value: i32) -> Option<Self> {
        match value {
            0 => Some(FlowStatus::Init),
            1 => Some(FlowStatus::WaitingDep),
            2 => Some(FlowStatus::WaitingRes),
            3 => Some(FlowStatus::Running),
            4 => Some(FlowStatus::Success),
            5 => Some(FlowStatus::Kill),
            6 => Some(FlowStatus::Failed),
            7 => Some(FlowStatus::DepFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FlowStatus::Init => "INIT",
            FlowStatus::WaitingDep => "WAITING_DEP",
            FlowStatus::WaitingRes => "WAITING_RES",
            FlowStatus::Running => "RUNNING",
            FlowStatus::Success => "SUCCESS",
            FlowStatus::Kill => "KILL",
            FlowStatus::Failed => "FAILED",
            FlowStatus::DepFailed => "DEP_FAILED",
        };
        write!(f, "{}", name)
    }
}

/// How an execution came into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    Direct,
    Scheduled,
    Backfill,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::Direct => write!(f, "DIRECT"),
            RunType::Scheduled => write!(f, "SCHEDULED"),
            RunType::Backfill => write!(f, "BACKFILL"),
        }
    }
}

/// Workflow category, forwarded verbatim to the executor on submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    #[default]
    Short,
    Long,
    Etl,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Short => "SHORT",
            FlowType::Long => "LONG",
            FlowType::Etl => "ETL",
        }
    }
}

impl std::fmt::Display for FlowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which part of the DAG an ad-hoc node run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeDepType {
    #[default]
    NodeOnly,
    NodePre,
    NodePost,
}

impl NodeDepType {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => NodeDepType::NodePre,
            2 => NodeDepType::NodePost,
            _ => NodeDepType::NodeOnly,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            NodeDepType::NodeOnly => 0,
            NodeDepType::NodePre => 1,
            NodeDepType::NodePost => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyType {
    #[default]
    None,
    Success,
    Failure,
    All,
}

impl NotifyType {
    pub fn from_wire(value: i32) -> Self {
        match value {
            1 => NotifyType::Success,
            2 => NotifyType::Failure,
            3 => NotifyType::All,
            _ => NotifyType::None,
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            NotifyType::None => 0,
            NotifyType::Success => 1,
            NotifyType::Failure => 2,
            NotifyType::All => 3,
        }
    }
}

/// Per-request execution options supplied with a direct run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSettings {
    pub node_name: Option<String>,
    pub node_dep: NodeDepType,
    pub notify_type: NotifyType,
    pub notify_mails: Vec<String>,
    pub timeout: i32,
}

/// One attempt to run a workflow's DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionFlow {
    pub id: i64,
    pub project_id: i32,
    pub flow_id: i32,
    pub flow_type: FlowType,
    pub exec_type: RunType,
    pub status: FlowStatus,
    /// `host:port` of the executor the flow was last handed to.
    pub worker: Option<String>,
    pub submit_user_id: i32,
    pub submit_time: DateTime<Utc>,
    pub schedule_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub max_try_times: i32,
    pub timeout: i32,
    pub node_name: Option<String>,
    pub node_dep: NodeDepType,
    pub notify_type: NotifyType,
    pub notify_mails: Vec<String>,
    /// Serialized DAG; opaque to the master.
    pub workflow_data: String,
}

/// Insert parameters for a new execution row. The store assigns the id,
/// the submit time and the initial `INIT` status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewExecution {
    pub project_id: i32,
    pub flow_id: i32,
    pub flow_type: FlowType,
    pub exec_type: RunType,
    pub submit_user_id: i32,
    pub schedule_time: DateTime<Utc>,
    pub max_try_times: i32,
    pub timeout: i32,
    pub node_name: Option<String>,
    pub node_dep: NodeDepType,
    pub notify_type: NotifyType,
    pub notify_mails: Vec<String>,
    pub workflow_data: String,
}

impl NewExecution {
    fn for_workflow(workflow: &Workflow, exec_type: RunType, schedule_time: DateTime<Utc>) -> Self {
        Self {
            project_id: workflow.project_id,
            flow_id: workflow.id,
            flow_type: workflow.flow_type,
            exec_type,
            submit_user_id: workflow.owner_id,
            schedule_time,
            max_try_times: 1,
            timeout: workflow.timeout,
            node_name: None,
            node_dep: NodeDepType::NodeOnly,
            notify_type: NotifyType::None,
            notify_mails: Vec::new(),
            workflow_data: workflow.workflow_data.clone(),
        }
    }

    /// A single manually requested run.
    pub fn direct(workflow: &Workflow, schedule_time: DateTime<Utc>, settings: ExecSettings) -> Self {
        let mut exec = Self::for_workflow(workflow, RunType::Direct, schedule_time);
        exec.node_name = settings.node_name;
        exec.node_dep = settings.node_dep;
        exec.notify_type = settings.notify_type;
        exec.notify_mails = settings.notify_mails;
        if settings.timeout > 0 {
            exec.timeout = settings.timeout;
        }
        exec
    }

    /// A run materialized by a cron trigger at `fire_time`.
    pub fn scheduled(workflow: &Workflow, schedule: &Schedule, fire_time: DateTime<Utc>) -> Self {
        let mut exec = Self::for_workflow(workflow, RunType::Scheduled, fire_time);
        exec.max_try_times = schedule.max_try_times;
        exec.notify_type = schedule.notify_type;
        exec.notify_mails = schedule.notify_mails.clone();
        if schedule.timeout > 0 {
            exec.timeout = schedule.timeout;
        }
        exec
    }

    /// One tick of a backfill range.
    pub fn backfill(workflow: &Workflow, fire_time: DateTime<Utc>) -> Self {
        Self::for_workflow(workflow, RunType::Backfill, fire_time)
    }
}
