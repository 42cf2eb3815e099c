use tonic::async_trait;

use crate::dispatch::ExecutorAddr;
use crate::error::DispatchError;
use crate::model::FlowType;

/// Calls the master makes against an executor server.
///
/// Implementations must classify every failure as either
/// [`DispatchError::Transport`] or [`DispatchError::Rejected`]; the dispatch
/// worker evicts executors on the former only.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn submit_flow(
        &self,
        executor: &ExecutorAddr,
        project_id: i32,
        exec_id: i64,
        flow_type: FlowType,
    ) -> Result<(), DispatchError>;

    async fn exec_ad_hoc(&self, executor: &ExecutorAddr, ad_hoc_id: i32)
        -> Result<(), DispatchError>;

    async fn cancel_exec_flow(&self, executor: &ExecutorAddr, exec_id: i64)
        -> Result<(), DispatchError>;

    /// Drop any connection state held for an evicted executor.
    async fn forget(&self, _executor: &ExecutorAddr) {}
}
