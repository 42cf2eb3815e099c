//! Domain records shared by the dispatch core, the cron scheduler and the
//! persistence contract.

pub mod catalog;
pub mod flow;

pub use catalog::{AdHoc, MasterRecord, Schedule, ScheduleStatus, Workflow};
pub use flow::{
    ExecSettings, ExecutionFlow, FlowStatus, FlowType, NewExecution, NodeDepType, NotifyType,
    RunType,
};
