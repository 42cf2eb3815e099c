//! Master process wiring.
//!
//! Startup order:
//! 1. Claim the master record; a conflict aborts before anything serves
//! 2. Re-queue flows the previous process left in `INIT`
//! 3. Reinstall triggers for online schedules
//! 4. Spawn the dispatch worker
//! 5. Serve RPCs until shutdown
//!
//! On shutdown the RPC server stops accepting requests first, then cron
//! timers stop, then the dispatch worker gets the grace period to finish the
//! flow it is working on.

mod handle;

pub use handle::MasterHandle;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::config::MasterConfig;
use crate::cron::CronScheduler;
use crate::dispatch::{DispatchQueue, DispatchWorker, Dispatcher, ExecutorClient, ExecutorRegistry};
use crate::error::{MasterError, Result};
use crate::grpc::{GrpcExecutorClient, MasterServer};
use crate::registrar;
use crate::shutdown::join_with_grace;
use crate::store::ExecutionStore;

pub struct Master {
    config: MasterConfig,
    handle: MasterHandle,
    worker: DispatchWorker,
}

impl Master {
    pub fn new(
        config: MasterConfig,
        store: Arc<dyn ExecutionStore>,
        client: Arc<dyn ExecutorClient>,
    ) -> Self {
        let (queue, receiver) = DispatchQueue::new();
        let registry = Arc::new(RwLock::new(ExecutorRegistry::new()));
        let cron = Arc::new(CronScheduler::new(store.clone(), queue.clone()));

        let dispatcher = Dispatcher::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            client.clone(),
            config.dispatch.clone(),
        );
        let handle = MasterHandle::new(
            store,
            registry,
            queue,
            cron,
            client,
            config.max_backfill_runs,
        );

        Self {
            config,
            handle,
            worker: DispatchWorker::new(dispatcher, receiver),
        }
    }

    /// Master that talks to executors over gRPC.
    pub fn with_grpc_client(config: MasterConfig, store: Arc<dyn ExecutionStore>) -> Self {
        let client = Arc::new(GrpcExecutorClient::new(config.executor_client.clone()));
        Self::new(config, store, client)
    }

    pub fn handle(&self) -> MasterHandle {
        self.handle.clone()
    }

    /// Bind the configured address and run until `shutdown` fires.
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

    /// Run on an already bound listener until `shutdown` fires.
    ///
    /// The port registered in the master record is the listener's, so an
    /// ephemeral port works.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let port = listener
            .local_addr()
            .map_err(|e| MasterError::Internal(format!("listener has no address: {}", e)))?
            .port();

        registrar::register(
            self.handle.store().as_ref(),
            &self.config.advertise_host,
            port,
        )
        .await?;

        self.handle.recover_pending().await?;
        let restored = self.handle.cron().restore().await?;
        tracing::info!(triggers = restored, "Schedules restored");

        let worker_shutdown = CancellationToken::new();
        let worker = tokio::spawn(self.worker.run(worker_shutdown.clone()));

        let served = MasterServer::new(self.handle.clone())
            .serve(listener, shutdown)
            .await;

        self.handle.cron().shutdown().await;
        worker_shutdown.cancel();
        join_with_grace("dispatch worker", worker, self.config.shutdown_grace).await;

        served?;
        tracing::info!("Master stopped");
        Ok(())
    }
}
