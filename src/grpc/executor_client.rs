use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tonic::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use crate::config::ExecutorClientConfig;
use crate::dispatch::{ExecutorAddr, ExecutorClient};
use crate::error::DispatchError;
use crate::model::FlowType;
use crate::proto::executor_service_client::ExecutorServiceClient;
use crate::proto::{CancelExecFlowRequest, ExecAdHocRequest, RetInfo, SubmitFlowRequest};

/// Map a gRPC status to the dispatch failure classes.
pub fn classify_status(status: &Status) -> DispatchError {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => {
            DispatchError::Transport(status.message().to_string())
        }
        _ => DispatchError::Rejected(format!("{:?}: {}", status.code(), status.message())),
    }
}

fn check_envelope(ret: RetInfo) -> Result<(), DispatchError> {
    if ret.status == 0 {
        Ok(())
    } else {
        Err(DispatchError::Rejected(format!(
            "status {}: {}",
            ret.status, ret.msg
        )))
    }
}

/// [`ExecutorClient`] over tonic, with one cached channel per executor.
pub struct GrpcExecutorClient {
    config: ExecutorClientConfig,
    pool: Arc<Mutex<HashMap<ExecutorAddr, ExecutorServiceClient<Channel>>>>,
}

impl GrpcExecutorClient {
    pub fn new(config: ExecutorClientConfig) -> Self {
        Self {
            config,
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get or create a cached connection to an executor.
    ///
    /// The pool lock is never held while connecting, so a slow executor does
    /// not stall calls to the others. When two callers connect to the same
    /// executor at once the first channel stored wins.
    async fn client(
        &self,
        executor: &ExecutorAddr,
    ) -> Result<ExecutorServiceClient<Channel>, DispatchError> {
        let cached = self.pool.lock().await.get(executor).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let endpoint = Endpoint::from_shared(executor.endpoint())
            .map_err(|e| DispatchError::Rejected(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);
        let channel = endpoint.connect().await.map_err(|e| {
            DispatchError::Transport(format!("Failed to connect to {}: {}", executor, e))
        })?;

        let mut pool = self.pool.lock().await;
        let client = pool
            .entry(executor.clone())
            .or_insert_with(|| ExecutorServiceClient::new(channel));
        Ok(client.clone())
    }

    /// Turn an RPC result into a dispatch result, dropping the cached
    /// channel on transport failures so the next call reconnects.
    async fn finish(
        &self,
        executor: &ExecutorAddr,
        result: Result<tonic::Response<RetInfo>, Status>,
    ) -> Result<(), DispatchError> {
        match result {
            Ok(response) => check_envelope(response.into_inner()),
            Err(status) => {
                let err = classify_status(&status);
                if err.is_transport() {
                    self.pool.lock().await.remove(executor);
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ExecutorClient for GrpcExecutorClient {
    async fn submit_flow(
        &self,
        executor: &ExecutorAddr,
        project_id: i32,
        exec_id: i64,
        flow_type: FlowType,
    ) -> Result<(), DispatchError> {
        let mut client = self.client(executor).await?;
        let result = client
            .submit_flow(SubmitFlowRequest {
                project_id,
                exec_id,
                flow_type: flow_type.as_str().to_string(),
            })
            .await;
        self.finish(executor, result).await
    }

    async fn exec_ad_hoc(
        &self,
        executor: &ExecutorAddr,
        ad_hoc_id: i32,
    ) -> Result<(), DispatchError> {
        let mut client = self.client(executor).await?;
        let result = client.exec_ad_hoc(ExecAdHocRequest { ad_hoc_id }).await;
        self.finish(executor, result).await
    }

    async fn cancel_exec_flow(
        &self,
        executor: &ExecutorAddr,
        exec_id: i64,
    ) -> Result<(), DispatchError> {
        let mut client = self.client(executor).await?;
        let result = client
            .cancel_exec_flow(CancelExecFlowRequest { exec_id })
            .await;
        self.finish(executor, result).await
    }

    async fn forget(&self, executor: &ExecutorAddr) {
        self.pool.lock().await.remove(executor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_codes_are_transport_failures() {
        for status in [
            Status::unavailable("connection refused"),
            Status::deadline_exceeded("timeout"),
            Status::cancelled("broken pipe"),
        ] {
            assert!(classify_status(&status).is_transport(), "{status:?}");
        }
    }

    #[test]
    fn other_codes_are_rejections() {
        for status in [
            Status::invalid_argument("flow type empty"),
            Status::internal("boom"),
            Status::not_found("missing"),
        ] {
            assert!(!classify_status(&status).is_transport(), "{status:?}");
        }
    }

    #[test]
    fn non_zero_envelope_is_a_rejection() {
        assert!(check_envelope(RetInfo {
            status: 0,
            msg: String::new()
        })
        .is_ok());
        let err = check_envelope(RetInfo {
            status: 4,
            msg: "flow type empty".to_string(),
        })
        .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Rejected("status 4: flow type empty".to_string())
        );
    }

    #[tokio::test]
    async fn unreachable_executor_is_a_transport_failure() {
        let client = GrpcExecutorClient::new(ExecutorClientConfig {
            connect_timeout: std::time::Duration::from_millis(200),
            request_timeout: std::time::Duration::from_millis(200),
        });
        // Port 1 on localhost is not listening
        let err = client
            .submit_flow(&ExecutorAddr::new("127.0.0.1", 1), 1, 1, FlowType::Short)
            .await
            .unwrap_err();
        assert!(err.is_transport(), "{err:?}");
    }

    /// Test: A connect that hangs does not hold up calls to other executors
    #[tokio::test]
    async fn hung_connect_does_not_block_other_executors() {
        // Listener with a full accept queue: further SYNs go unanswered
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let hung_addr = listener.local_addr().unwrap();
        let mut backlog = Vec::new();
        for _ in 0..4 {
            let connect = tokio::net::TcpStream::connect(hung_addr);
            if let Ok(Ok(stream)) =
                tokio::time::timeout(std::time::Duration::from_millis(100), connect).await
            {
                backlog.push(stream);
            }
        }

        let client = Arc::new(GrpcExecutorClient::new(ExecutorClientConfig {
            connect_timeout: std::time::Duration::from_secs(3),
            request_timeout: std::time::Duration::from_secs(3),
        }));
        let hung = ExecutorAddr::new("127.0.0.1", hung_addr.port());
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.client(&hung).await.is_ok() }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        let err = client
            .cancel_exec_flow(&ExecutorAddr::new("127.0.0.1", 1), 7)
            .await
            .unwrap_err();
        assert!(err.is_transport(), "{err:?}");
        assert!(
            started.elapsed() < std::time::Duration::from_secs(1),
            "Call waited {:?} behind another executor's connect",
            started.elapsed()
        );

        pending.abort();
        drop(listener);
    }
}
