use thiserror::Error;

use crate::model::MasterRecord;

/// Errors raised by the persistence contract.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("Failed to read seed file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid seed file: {0}")]
    Seed(#[from] serde_json::Error),
}

/// Failure of a single RPC from the master to an executor.
///
/// The dispatch protocol branches on the variant: a transport failure is
/// evidence the executor is gone, a rejection is not.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Connection refused, timeout, broken pipe.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The executor answered but refused the request.
    #[error("Executor rejected request: {0}")]
    Rejected(String),
}

impl DispatchError {
    pub fn is_transport(&self) -> bool {
        matches!(self, DispatchError::Transport(_))
    }
}

/// Malformed `host:port` executor address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrParseError {
    #[error("expected host:port, got '{0}'")]
    MissingPort(String),

    #[error("missing host in '{0}'")]
    MissingHost(String),

    #[error("invalid port in '{0}'")]
    InvalidPort(String),
}

/// Errors surfaced by synchronous master operations.
#[derive(Error, Debug)]
pub enum MasterError {
    #[error("Can't register more than one master, existing master is {0}; clear the master record to move it")]
    MasterConflict(MasterRecord),

    #[error("Schedule not found for flow {0}")]
    ScheduleNotFound(i32),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(i32),

    #[error("Ad-hoc request not found: {0}")]
    AdHocNotFound(i32),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("Execution {0} has already finished")]
    AlreadyFinished(i64),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No executor available")]
    NoExecutorAvailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Executor call failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MasterError {
    /// Status code carried in the response envelope. Zero is reserved for
    /// success.
    pub fn code(&self) -> i32 {
        match self {
            MasterError::MasterConflict(_) => 2,
            MasterError::ScheduleNotFound(_)
            | MasterError::WorkflowNotFound(_)
            | MasterError::AdHocNotFound(_)
            | MasterError::ExecutionNotFound(_) => 3,
            MasterError::InvalidCronExpression { .. } | MasterError::Validation(_) => 4,
            MasterError::AlreadyFinished(_) => 5,
            MasterError::NoExecutorAvailable | MasterError::Dispatch(_) => 6,
            MasterError::Store(_) | MasterError::Transport(_) | MasterError::Internal(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, MasterError>;
