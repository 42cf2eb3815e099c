use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::DispatchConfig;
use crate::dispatch::{
    DispatchQueue, DispatchReceiver, ExecutorAddr, ExecutorClient, ExecutorRegistry,
    ExecutorServerInfo,
};
use crate::error::DispatchError;
use crate::model::{ExecutionFlow, FlowStatus};
use crate::store::{ExecutionStore, StatusUpdate};

/// What happened to one dequeued flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Accepted by the executor and persisted as running there.
    Dispatched { executor: ExecutorAddr },
    /// No executor registered; the flow went back on the queue after a backoff.
    Stalled,
    /// The persisted status moved on before or during the dispatch; the flow
    /// was dropped without any write, and cancelled on the executor if it had
    /// already been accepted there.
    Abandoned,
    /// The executor stopped answering. The flow was re-queued, the executor
    /// evicted, and the listed orphans re-queued with it.
    ExecutorLost {
        executor: ExecutorAddr,
        resubmitted: Vec<i64>,
    },
    /// Every attempt was rejected; the flow is now FAILED.
    Failed,
}

/// Hands flows to executors.
///
/// The status a flow carried when it was enqueued is the expected value of
/// every compare-and-set the dispatcher issues for it. A flow re-queued by
/// failover therefore still says `RUNNING`, and a flow cancelled while queued
/// fails the check and is dropped.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<RwLock<ExecutorRegistry>>,
    queue: DispatchQueue,
    client: Arc<dyn ExecutorClient>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<RwLock<ExecutorRegistry>>,
        queue: DispatchQueue,
        client: Arc<dyn ExecutorClient>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            client,
            config,
        }
    }

    /// Run the dispatch protocol for one flow.
    ///
    /// `shutdown` only shortens the no-executor backoff; an in-flight submit
    /// always runs to completion.
    pub async fn dispatch(
        &self,
        flow: ExecutionFlow,
        shutdown: &CancellationToken,
    ) -> DispatchOutcome {
        if !self.still_pending(&flow).await {
            tracing::info!(
                exec_id = flow.id,
                expected = %flow.status,
                "Flow status changed while queued, not submitting"
            );
            return DispatchOutcome::Abandoned;
        }

        let picked = self.registry.write().await.pick_executor();
        let Some(executor) = picked else {
            tracing::warn!(
                exec_id = flow.id,
                backoff_ms = self.config.no_executor_backoff.as_millis() as u64,
                "No executor available, re-queueing after backoff"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.no_executor_backoff) => {}
                _ = shutdown.cancelled() => {}
            }
            self.queue.push(flow);
            return DispatchOutcome::Stalled;
        };
        let addr = executor.addr;

        let attempts = self.config.retry_count.max(1);
        let mut executor_down = false;
        for attempt in 1..=attempts {
            tracing::debug!(exec_id = flow.id, executor = %addr, attempt, "Submitting flow");
            match self
                .client
                .submit_flow(&addr, flow.project_id, flow.id, flow.flow_type)
                .await
            {
                Ok(()) => return self.commit(&flow, addr).await,
                Err(DispatchError::Transport(reason)) => {
                    if !self.still_pending(&flow).await {
                        tracing::info!(
                            exec_id = flow.id,
                            executor = %addr,
                            "Flow status changed during dispatch, abandoning"
                        );
                        return DispatchOutcome::Abandoned;
                    }
                    tracing::warn!(
                        exec_id = flow.id,
                        executor = %addr,
                        attempt,
                        error = %reason,
                        "Executor unreachable"
                    );
                    executor_down = true;
                    break;
                }
                Err(DispatchError::Rejected(reason)) => {
                    tracing::warn!(
                        exec_id = flow.id,
                        executor = %addr,
                        attempt,
                        attempts,
                        error = %reason,
                        "Executor rejected flow"
                    );
                }
            }
        }

        if executor_down {
            self.fail_over(flow, addr).await
        } else {
            self.mark_failed(&flow).await
        }
    }

    async fn commit(&self, flow: &ExecutionFlow, addr: ExecutorAddr) -> DispatchOutcome {
        match self
            .store
            .transition(flow.id, flow.status, StatusUpdate::running_on(addr.to_string()))
            .await
        {
            Ok(true) => {
                tracing::info!(exec_id = flow.id, executor = %addr, "Flow dispatched");
                DispatchOutcome::Dispatched { executor: addr }
            }
            Ok(false) => {
                tracing::warn!(
                    exec_id = flow.id,
                    executor = %addr,
                    expected = %flow.status,
                    "Flow accepted but status already moved on, cancelling on executor"
                );
                if let Err(e) = self.client.cancel_exec_flow(&addr, flow.id).await {
                    tracing::error!(
                        exec_id = flow.id,
                        executor = %addr,
                        error = %e,
                        "Failed to cancel abandoned flow on executor"
                    );
                }
                DispatchOutcome::Abandoned
            }
            Err(e) => {
                tracing::error!(
                    exec_id = flow.id,
                    executor = %addr,
                    error = %e,
                    "Failed to persist dispatch"
                );
                DispatchOutcome::Abandoned
            }
        }
    }

    /// Whether the persisted status still equals the status the flow was
    /// enqueued with. An unreadable store counts as pending so the flow is
    /// kept; the compare-and-set on the next attempt settles it.
    async fn still_pending(&self, flow: &ExecutionFlow) -> bool {
        match self.store.execution(flow.id).await {
            Ok(Some(current)) => current.status == flow.status,
            Ok(None) => false,
            Err(e) => {
                tracing::error!(exec_id = flow.id, error = %e, "Failed to re-read flow status");
                true
            }
        }
    }

    async fn fail_over(&self, flow: ExecutionFlow, addr: ExecutorAddr) -> DispatchOutcome {
        let exec_id = flow.id;
        self.queue.push(flow);

        let evicted = self.registry.write().await.evict(&addr);
        self.client.forget(&addr).await;

        let resubmitted = match evicted {
            Some(info) => self.resubmit_orphans(&info, exec_id).await,
            None => {
                tracing::debug!(executor = %addr, "Executor already evicted");
                Vec::new()
            }
        };
        DispatchOutcome::ExecutorLost {
            executor: addr,
            resubmitted,
        }
    }

    /// Re-queue the unfinished flows an evicted executor last reported,
    /// except `skip` which the caller already re-queued.
    ///
    /// A reported flow is only an orphan while the store still records it on
    /// the evicted executor. A flow that has since been dispatched elsewhere
    /// belongs to that executor and is left alone.
    async fn resubmit_orphans(&self, info: &ExecutorServerInfo, skip: i64) -> Vec<i64> {
        let evicted = info.addr.to_string();
        let mut resubmitted = Vec::new();
        for exec_id in info.running_exec_ids() {
            if exec_id == skip {
                continue;
            }
            match self.store.execution(exec_id).await {
                Ok(Some(orphan)) if is_orphaned_on(&orphan, &evicted) => {
                    if self.queue.push(orphan) {
                        resubmitted.push(exec_id);
                    }
                }
                Ok(Some(other)) => {
                    tracing::debug!(
                        exec_id,
                        executor = %info.addr,
                        status = %other.status,
                        worker = ?other.worker,
                        "Reported flow no longer held by evicted executor"
                    );
                }
                Ok(None) => {
                    tracing::warn!(exec_id, executor = %info.addr, "Reported flow not found in store");
                }
                Err(e) => {
                    tracing::error!(exec_id, error = %e, "Failed to load orphaned flow");
                }
            }
        }
        if !resubmitted.is_empty() {
            tracing::info!(
                executor = %info.addr,
                resubmitted = ?resubmitted,
                "Re-queued flows from evicted executor"
            );
        }
        resubmitted
    }

    async fn mark_failed(&self, flow: &ExecutionFlow) -> DispatchOutcome {
        match self
            .store
            .transition(flow.id, flow.status, StatusUpdate::to(FlowStatus::Failed))
            .await
        {
            Ok(true) => {
                tracing::error!(exec_id = flow.id, "Dispatch retries exhausted, flow failed");
                DispatchOutcome::Failed
            }
            Ok(false) => {
                tracing::info!(
                    exec_id = flow.id,
                    "Flow status changed during dispatch, not marking failed"
                );
                DispatchOutcome::Abandoned
            }
            Err(e) => {
                tracing::error!(exec_id = flow.id, error = %e, "Failed to mark flow failed");
                DispatchOutcome::Failed
            }
        }
    }
}

/// Whether `flow` is unfinished and still recorded on `executor`. A flow
/// with no worker only counts while it is `INIT`.
fn is_orphaned_on(flow: &ExecutionFlow, executor: &str) -> bool {
    if flow.status.is_finished() {
        return false;
    }
    match flow.worker.as_deref() {
        Some(worker) => worker == executor,
        None => flow.status == FlowStatus::Init,
    }
}

/// The single consumer of the dispatch queue.
pub struct DispatchWorker {
    dispatcher: Dispatcher,
    receiver: DispatchReceiver,
}

impl DispatchWorker {
    pub fn new(dispatcher: Dispatcher, receiver: DispatchReceiver) -> Self {
        Self {
            dispatcher,
            receiver,
        }
    }

    /// Dequeue and dispatch until `shutdown` fires or every producer is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Dispatch worker started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!(
                        pending = self.receiver.len(),
                        "Dispatch worker stopping"
                    );
                    break;
                }
                next = self.receiver.recv() => {
                    let Some(flow) = next else {
                        tracing::info!("Dispatch queue closed");
                        break;
                    };
                    let exec_id = flow.id;
                    let outcome = self.dispatcher.dispatch(flow, &shutdown).await;
                    tracing::debug!(exec_id, outcome = ?outcome, "Dispatch finished");
                }
            }
        }
    }
}
