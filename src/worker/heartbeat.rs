use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::proto::master_service_client::MasterServiceClient;
use crate::proto::{ExecutorReportRequest, HeartBeatData, RegisterExecutorRequest};
use crate::worker::Inventory;

/// Keeps an executor registered with the master.
///
/// Registers once, then sends the inventory every `interval`. Failed calls
/// are logged and retried on the next tick with a fresh connection.
pub struct HeartbeatReporter {
    master_addr: String,
    host: String,
    port: u16,
    interval: Duration,
    inventory: Inventory,
    client: Option<MasterServiceClient<Channel>>,
    registered: bool,
}

impl HeartbeatReporter {
    pub fn new(
        master_addr: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        interval: Duration,
        inventory: Inventory,
    ) -> Self {
        Self {
            master_addr: master_addr.into(),
            host: host.into(),
            port,
            interval,
            inventory,
            client: None,
            registered: false,
        }
    }

    /// Run until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(master = %self.master_addr, error = %e, "Heartbeat failed");
                        self.client = None;
                    }
                }
            }
        }
        tracing::debug!("Heartbeat reporter stopped");
    }

    async fn tick(&mut self) -> Result<(), tonic::Status> {
        let mut client = self.client().await?;
        if !self.registered {
            let ret = client
                .register_executor(RegisterExecutorRequest {
                    host: self.host.clone(),
                    port: i32::from(self.port),
                    register_time: Utc::now().timestamp_millis(),
                })
                .await?
                .into_inner();
            if ret.status != 0 {
                return Err(tonic::Status::failed_precondition(ret.msg));
            }
            self.registered = true;
            tracing::info!(master = %self.master_addr, "Registered with master");
        }

        let exec_ids = self.inventory.snapshot().await;
        let ret = client
            .executor_report(ExecutorReportRequest {
                host: self.host.clone(),
                port: i32::from(self.port),
                heartbeat: Some(HeartBeatData {
                    report_date: Utc::now().timestamp_millis(),
                    exec_ids,
                }),
            })
            .await?
            .into_inner();
        if ret.status != 0 {
            return Err(tonic::Status::failed_precondition(ret.msg));
        }
        Ok(())
    }

    async fn client(&mut self) -> Result<MasterServiceClient<Channel>, tonic::Status> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = MasterServiceClient::connect(self.master_addr.clone())
            .await
            .map_err(|e| tonic::Status::unavailable(format!("connect failed: {}", e)))?;
        self.client = Some(client.clone());
        Ok(client)
    }
}
