//! Persistence contract consumed by the master.
//!
//! The relational schema behind it is owned elsewhere; the master only needs
//! the handful of reads and writes below. [`ExecutionStore::transition`] is a
//! compare-and-set on the status column and is the only way the master moves
//! a flow between states, so a stale in-memory copy can never overwrite a
//! newer persisted status.

pub mod memory;

use tonic::async_trait;

use crate::error::StoreError;
use crate::model::{
    AdHoc, ExecutionFlow, FlowStatus, MasterRecord, NewExecution, Schedule, Workflow,
};

pub use memory::{MemoryStore, SeedData};

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`ExecutionStore::insert_master_record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterClaim {
    /// No record existed; this one was written.
    Inserted(MasterRecord),
    /// A record was already present and is returned unchanged.
    Existing(MasterRecord),
}

/// Target of a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: FlowStatus,
    /// New worker address; `None` leaves the column untouched.
    pub worker: Option<String>,
}

impl StatusUpdate {
    pub fn to(status: FlowStatus) -> Self {
        Self {
            status,
            worker: None,
        }
    }

    pub fn running_on(worker: impl Into<String>) -> Self {
        Self {
            status: FlowStatus::Running,
            worker: Some(worker.into()),
        }
    }
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn master_record(&self) -> StoreResult<Option<MasterRecord>>;

    /// Write a record for `host:port` only if no master record exists.
    ///
    /// The check and the write are one atomic step, so of two masters racing
    /// to register exactly one sees [`MasterClaim::Inserted`].
    async fn insert_master_record(&self, host: &str, port: u16) -> StoreResult<MasterClaim>;

    /// Refresh the modify time of the record matching `host:port`.
    async fn touch_master_record(&self, host: &str, port: u16) -> StoreResult<MasterRecord>;

    async fn workflow(&self, flow_id: i32) -> StoreResult<Option<Workflow>>;

    async fn ad_hoc(&self, ad_hoc_id: i32) -> StoreResult<Option<AdHoc>>;

    async fn schedule(&self, flow_id: i32) -> StoreResult<Option<Schedule>>;

    async fn online_schedules(&self) -> StoreResult<Vec<Schedule>>;

    /// Insert a new execution row in `INIT` and return it with its id.
    async fn create_execution(&self, exec: NewExecution) -> StoreResult<ExecutionFlow>;

    async fn execution(&self, exec_id: i64) -> StoreResult<Option<ExecutionFlow>>;

    async fn executions_in_status(&self, status: FlowStatus) -> StoreResult<Vec<ExecutionFlow>>;

    /// Apply `update` only if the persisted status still equals `expected`.
    /// Returns whether the row was changed.
    async fn transition(
        &self,
        exec_id: i64,
        expected: FlowStatus,
        update: StatusUpdate,
    ) -> StoreResult<bool>;
}
