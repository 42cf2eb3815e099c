use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cron::{CronExpr, CronScheduler};
use crate::dispatch::{
    DispatchQueue, ExecutorAddr, ExecutorClient, ExecutorRegistry, ExecutorServerInfo,
    HeartBeatSnapshot,
};
use crate::error::{MasterError, Result};
use crate::model::{ExecSettings, ExecutionFlow, FlowStatus, NewExecution, Workflow};
use crate::store::{ExecutionStore, StatusUpdate};

/// Cancelling a queued flow races with its dispatch; retry the
/// compare-and-set this many times before giving up.
const CANCEL_ATTEMPTS: usize = 3;

/// The master's synchronous operations, shared by the RPC layer and startup.
///
/// Every method either completes durably or returns an error; nothing here
/// waits on a flow being dispatched.
#[derive(Clone)]
pub struct MasterHandle {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<RwLock<ExecutorRegistry>>,
    queue: DispatchQueue,
    cron: Arc<CronScheduler>,
    client: Arc<dyn ExecutorClient>,
    max_backfill_runs: usize,
}

impl MasterHandle {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<RwLock<ExecutorRegistry>>,
        queue: DispatchQueue,
        cron: Arc<CronScheduler>,
        client: Arc<dyn ExecutorClient>,
        max_backfill_runs: usize,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            cron,
            client,
            max_backfill_runs,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    pub async fn set_schedule(&self, project_id: i32, flow_id: i32) -> Result<()> {
        self.cron.set_schedule(project_id, flow_id).await
    }

    pub async fn delete_schedule(&self, project_id: i32, flow_id: i32) -> Result<()> {
        if !self.cron.delete_schedule(project_id, flow_id).await {
            tracing::debug!(project_id, flow_id, "No trigger to delete");
        }
        Ok(())
    }

    pub async fn delete_schedules(&self, project_id: i32) -> Result<()> {
        self.cron.delete_schedules(project_id).await;
        Ok(())
    }

    async fn workflow(&self, project_id: i32, flow_id: i32) -> Result<Workflow> {
        match self.store.workflow(flow_id).await? {
            Some(workflow) if workflow.project_id == project_id => Ok(workflow),
            _ => Err(MasterError::WorkflowNotFound(flow_id)),
        }
    }

    /// Create one `DIRECT` run and enqueue it. Returns the new exec id.
    pub async fn exec_flow(
        &self,
        project_id: i32,
        flow_id: i32,
        schedule_time: DateTime<Utc>,
        settings: ExecSettings,
    ) -> Result<i64> {
        let workflow = self.workflow(project_id, flow_id).await?;
        let flow = self
            .store
            .create_execution(NewExecution::direct(&workflow, schedule_time, settings))
            .await?;
        let exec_id = flow.id;
        self.queue.push(flow);
        tracing::info!(exec_id, project_id, flow_id, "Direct run accepted");
        Ok(exec_id)
    }

    /// Hand an ad-hoc request to the next executor in rotation.
    pub async fn exec_ad_hoc(&self, ad_hoc_id: i32) -> Result<ExecutorAddr> {
        if self.store.ad_hoc(ad_hoc_id).await?.is_none() {
            return Err(MasterError::AdHocNotFound(ad_hoc_id));
        }
        let executor = self
            .registry
            .write()
            .await
            .pick_executor()
            .ok_or(MasterError::NoExecutorAvailable)?;
        self.client.exec_ad_hoc(&executor.addr, ad_hoc_id).await?;
        tracing::info!(ad_hoc_id, executor = %executor.addr, "Ad-hoc request forwarded");
        Ok(executor.addr)
    }

    /// Create one `BACKFILL` run per fire time of `cron_expression` in
    /// `[start, end)` and enqueue each. Returns the new exec ids in fire
    /// order.
    pub async fn append_work_flow(
        &self,
        project_id: i32,
        flow_id: i32,
        cron_expression: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let workflow = self.workflow(project_id, flow_id).await?;
        let cron = CronExpr::parse(cron_expression)?;
        if start >= end {
            return Err(MasterError::Validation(format!(
                "start date {} must be before end date {}",
                start, end
            )));
        }
        let fire_times = cron.fire_times(start, end, self.max_backfill_runs)?;

        let mut exec_ids = Vec::with_capacity(fire_times.len());
        for fire_time in fire_times {
            let flow = self
                .store
                .create_execution(NewExecution::backfill(&workflow, fire_time))
                .await?;
            exec_ids.push(flow.id);
            self.queue.push(flow);
        }
        tracing::info!(
            project_id,
            flow_id,
            runs = exec_ids.len(),
            "Backfill accepted"
        );
        Ok(exec_ids)
    }

    /// Cancel a flow.
    ///
    /// A flow that already has a worker is cancelled on that executor. A
    /// flow still waiting for dispatch is moved to `KILL` in the store,
    /// which makes the pending dispatch abandon it.
    pub async fn cancel_exec_flow(&self, exec_id: i64) -> Result<()> {
        for _ in 0..CANCEL_ATTEMPTS {
            let flow = self
                .store
                .execution(exec_id)
                .await?
                .ok_or(MasterError::ExecutionNotFound(exec_id))?;
            if flow.status.is_finished() {
                return Err(MasterError::AlreadyFinished(exec_id));
            }

            if let Some(worker) = flow.worker.as_deref() {
                let executor: ExecutorAddr = worker.parse().map_err(|e| {
                    MasterError::Internal(format!("bad worker address on {}: {}", exec_id, e))
                })?;
                self.client.cancel_exec_flow(&executor, exec_id).await?;
                tracing::info!(exec_id, executor = %executor, "Cancel forwarded to executor");
                return Ok(());
            }

            if self
                .store
                .transition(exec_id, flow.status, StatusUpdate::to(FlowStatus::Kill))
                .await?
            {
                tracing::info!(exec_id, "Queued flow killed");
                return Ok(());
            }
        }
        Err(MasterError::Internal(format!(
            "execution {} kept changing status during cancel",
            exec_id
        )))
    }

    pub async fn register_executor(
        &self,
        host: &str,
        port: i32,
        registered_at: DateTime<Utc>,
    ) -> Result<()> {
        let addr = executor_addr(host, port)?;
        self.registry
            .write()
            .await
            .register_executor(addr, registered_at);
        Ok(())
    }

    pub async fn executor_report(
        &self,
        host: &str,
        port: i32,
        reported_at: DateTime<Utc>,
        exec_ids: Vec<i64>,
    ) -> Result<()> {
        let addr = executor_addr(host, port)?;
        self.registry
            .write()
            .await
            .report_heartbeat(addr, HeartBeatSnapshot::new(reported_at, exec_ids));
        Ok(())
    }

    pub async fn get_exec_flow(&self, exec_id: i64) -> Result<ExecutionFlow> {
        self.store
            .execution(exec_id)
            .await?
            .ok_or(MasterError::ExecutionNotFound(exec_id))
    }

    pub async fn list_executors(&self) -> Vec<ExecutorServerInfo> {
        self.registry
            .read()
            .await
            .all_executors()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Re-enqueue flows persisted in `INIT`. They were sitting in the queue
    /// of a previous master process when it stopped.
    pub async fn recover_pending(&self) -> Result<usize> {
        let pending = self.store.executions_in_status(FlowStatus::Init).await?;
        let count = pending.len();
        for flow in pending {
            self.queue.push(flow);
        }
        if count > 0 {
            tracing::info!(count, "Re-queued pending flows from store");
        }
        Ok(count)
    }
}

fn executor_addr(host: &str, port: i32) -> Result<ExecutorAddr> {
    if host.trim().is_empty() {
        return Err(MasterError::Validation("executor host is empty".to_string()));
    }
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| MasterError::Validation(format!("invalid executor port {}", port)))?;
    Ok(ExecutorAddr::new(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_addr_validation() {
        assert_eq!(
            executor_addr("10.0.0.5", 9000).unwrap(),
            ExecutorAddr::new("10.0.0.5", 9000)
        );
        assert!(matches!(
            executor_addr("", 9000),
            Err(MasterError::Validation(_))
        ));
        assert!(matches!(
            executor_addr("h", 0),
            Err(MasterError::Validation(_))
        ));
        assert!(matches!(
            executor_addr("h", 70000),
            Err(MasterError::Validation(_))
        ));
        assert!(matches!(
            executor_addr("h", -1),
            Err(MasterError::Validation(_))
        ));
    }
}
