use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::config::AgentConfig;
use crate::error::{MasterError, Result};
use crate::grpc::master_service::ok_ret;
use crate::proto::executor_service_server::{ExecutorService, ExecutorServiceServer};
use crate::proto::{CancelExecFlowRequest, ExecAdHocRequest, RetInfo, SubmitFlowRequest};
use crate::worker::HeartbeatReporter;

/// Exec ids held by this executor.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    exec_ids: Arc<RwLock<BTreeSet<i64>>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already held.
    pub async fn insert(&self, exec_id: i64) -> bool {
        self.exec_ids.write().await.insert(exec_id)
    }

    pub async fn remove(&self, exec_id: i64) -> bool {
        self.exec_ids.write().await.remove(&exec_id)
    }

    pub async fn contains(&self, exec_id: i64) -> bool {
        self.exec_ids.read().await.contains(&exec_id)
    }

    pub async fn snapshot(&self) -> Vec<i64> {
        self.exec_ids.read().await.iter().copied().collect()
    }
}

fn rejected(err: MasterError) -> RetInfo {
    RetInfo {
        status: err.code(),
        msg: err.to_string(),
    }
}

/// `ExecutorService` implementation backing the agent.
pub struct ExecutorRpcService {
    inventory: Inventory,
}

impl ExecutorRpcService {
    pub fn new(inventory: Inventory) -> Self {
        Self { inventory }
    }
}

#[tonic::async_trait]
impl ExecutorService for ExecutorRpcService {
    async fn submit_flow(
        &self,
        request: Request<SubmitFlowRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        if req.flow_type.trim().is_empty() {
            tracing::warn!(exec_id = req.exec_id, "Rejecting flow with empty flow type");
            return Ok(Response::new(rejected(MasterError::Validation(
                "flow type is empty".to_string(),
            ))));
        }

        if self.inventory.insert(req.exec_id).await {
            tracing::info!(
                exec_id = req.exec_id,
                project_id = req.project_id,
                flow_type = %req.flow_type,
                "Flow accepted"
            );
        } else {
            tracing::debug!(exec_id = req.exec_id, "Flow already held");
        }
        Ok(Response::new(ok_ret()))
    }

    async fn exec_ad_hoc(
        &self,
        request: Request<ExecAdHocRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(ad_hoc_id = req.ad_hoc_id, "Ad-hoc request accepted");
        Ok(Response::new(ok_ret()))
    }

    async fn cancel_exec_flow(
        &self,
        request: Request<CancelExecFlowRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        if !self.inventory.remove(req.exec_id).await {
            return Ok(Response::new(rejected(MasterError::ExecutionNotFound(
                req.exec_id,
            ))));
        }
        tracing::info!(exec_id = req.exec_id, "Flow cancelled");
        Ok(Response::new(ok_ret()))
    }
}

/// Executor agent: serves `ExecutorService` and heartbeats to the master.
pub struct ExecutorAgent {
    config: AgentConfig,
    inventory: Inventory,
}

impl ExecutorAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            inventory: Inventory::new(),
        }
    }

    pub fn inventory(&self) -> Inventory {
        self.inventory.clone()
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| {
                MasterError::Internal(format!(
                    "failed to bind {}: {}",
                    self.config.listen_addr, e
                ))
            })?;
        self.run_with_listener(listener, shutdown).await
    }

    /// Run on an already bound listener. The advertised port is the
    /// listener's.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let port = listener
            .local_addr()
            .map_err(|e| MasterError::Internal(format!("listener has no address: {}", e)))?
            .port();
        tracing::info!(
            host = %self.config.advertise_host,
            port,
            master = %self.config.master_addr,
            "Starting executor agent"
        );

        let reporter = HeartbeatReporter::new(
            self.config.master_addr.clone(),
            self.config.advertise_host.clone(),
            port,
            self.config.heartbeat_interval,
            self.inventory.clone(),
        );
        let heartbeat = tokio::spawn(reporter.run(shutdown.clone()));

        let served = Server::builder()
            .add_service(ExecutorServiceServer::new(ExecutorRpcService::new(
                self.inventory.clone(),
            )))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await;
            })
            .await;

        if let Err(e) = heartbeat.await {
            tracing::error!(error = %e, "Heartbeat task failed");
        }
        served?;
        tracing::info!("Executor agent stopped");
        Ok(())
    }
}
