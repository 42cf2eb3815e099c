//! Shared fixtures for flowmaster integration tests.
//!
//! - [`ScriptedExecutorClient`]: in-process executor double with per-address
//!   scripted replies and a call log
//! - [`Harness`]: master components wired by hand so tests can step the
//!   dispatch loop one flow at a time
//! - [`spawn_master`] / [`spawn_agent`]: real gRPC processes on ephemeral ports

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::async_trait;

use flowmaster::config::{AgentConfig, DispatchConfig, MasterConfig};
use flowmaster::cron::CronScheduler;
use flowmaster::dispatch::{
    DispatchOutcome, DispatchQueue, DispatchReceiver, DispatchWorker, Dispatcher, ExecutorAddr,
    ExecutorClient, ExecutorRegistry,
};
use flowmaster::error::DispatchError;
use flowmaster::master::{Master, MasterHandle};
use flowmaster::model::{
    AdHoc, ExecutionFlow, FlowStatus, FlowType, NotifyType, Schedule, ScheduleStatus,
    Workflow,
};
use flowmaster::store::{ExecutionStore, MemoryStore};
use flowmaster::worker::{ExecutorAgent, Inventory};

// =============================================================================
// Fixtures
// =============================================================================

pub fn workflow(id: i32, project_id: i32) -> Workflow {
    Workflow {
        id,
        project_id,
        name: format!("flow-{}", id),
        owner_id: 42,
        flow_type: FlowType::Short,
        timeout: 600,
        workflow_data: format!("{{\"nodes\":[\"n{}\"]}}", id),
    }
}

pub fn schedule(
    flow_id: i32,
    project_id: i32,
    crontab: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Schedule {
    Schedule {
        flow_id,
        project_id,
        crontab: crontab.to_string(),
        start_date: start,
        end_date: end,
        status: ScheduleStatus::Online,
        notify_type: NotifyType::Failure,
        notify_mails: vec!["oncall@example.com".to_string()],
        max_try_times: 2,
        timeout: 300,
    }
}

pub fn ad_hoc(id: i32, project_id: i32) -> AdHoc {
    AdHoc {
        id,
        project_id,
        owner_id: 42,
        statement: "select 1".to_string(),
    }
}

pub fn addr(host: &str, port: u16) -> ExecutorAddr {
    ExecutorAddr::new(host, port)
}

/// Poll `check` every 20ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Scripted executor client
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Submit {
        executor: ExecutorAddr,
        exec_id: i64,
        flow_type: FlowType,
    },
    AdHoc {
        executor: ExecutorAddr,
        ad_hoc_id: i32,
    },
    Cancel {
        executor: ExecutorAddr,
        exec_id: i64,
    },
}

/// Executor double. Each address answers from its script in order and
/// succeeds once the script runs out.
#[derive(Default)]
pub struct ScriptedExecutorClient {
    scripts: Mutex<HashMap<ExecutorAddr, VecDeque<Result<(), DispatchError>>>>,
    calls: Mutex<Vec<Call>>,
    forgotten: Mutex<Vec<ExecutorAddr>>,
    store: Option<Arc<MemoryStore>>,
    status_on_submit: Mutex<HashMap<i64, FlowStatus>>,
}

impl ScriptedExecutorClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client that can write to `store` while a submit is in flight.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::default()
        }
    }

    /// The next submit of `exec_id` moves it to `status` in the store before
    /// the executor replies, as a concurrent cancel would.
    pub fn move_on_submit(&self, exec_id: i64, status: FlowStatus) {
        self.status_on_submit.lock().unwrap().insert(exec_id, status);
    }

    pub fn script(&self, executor: &ExecutorAddr, replies: Vec<Result<(), DispatchError>>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(executor.clone())
            .or_default()
            .extend(replies);
    }

    /// Every call to `executor` fails at the transport level.
    pub fn fail_transport(&self, executor: &ExecutorAddr, times: usize) {
        self.script(
            executor,
            (0..times)
                .map(|_| Err(DispatchError::Transport("connection refused".to_string())))
                .collect(),
        );
    }

    pub fn reject(&self, executor: &ExecutorAddr, times: usize) {
        self.script(
            executor,
            (0..times)
                .map(|_| Err(DispatchError::Rejected("flow type empty".to_string())))
                .collect(),
        );
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Exec ids submitted to `executor`, in call order.
    pub fn submitted_to(&self, executor: &ExecutorAddr) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Submit {
                    executor: e,
                    exec_id,
                    ..
                } if &e == executor => Some(exec_id),
                _ => None,
            })
            .collect()
    }

    pub fn forgotten(&self) -> Vec<ExecutorAddr> {
        self.forgotten.lock().unwrap().clone()
    }

    fn next_reply(&self, executor: &ExecutorAddr) -> Result<(), DispatchError> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(executor)
            .and_then(|script| script.pop_front())
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl ExecutorClient for ScriptedExecutorClient {
    async fn submit_flow(
        &self,
        executor: &ExecutorAddr,
        _project_id: i32,
        exec_id: i64,
        flow_type: FlowType,
    ) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(Call::Submit {
            executor: executor.clone(),
            exec_id,
            flow_type,
        });
        let moved = self.status_on_submit.lock().unwrap().remove(&exec_id);
        if let (Some(status), Some(store)) = (moved, self.store.as_ref()) {
            store.set_status(exec_id, status).await.unwrap();
        }
        self.next_reply(executor)
    }

    async fn exec_ad_hoc(
        &self,
        executor: &ExecutorAddr,
        ad_hoc_id: i32,
    ) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(Call::AdHoc {
            executor: executor.clone(),
            ad_hoc_id,
        });
        self.next_reply(executor)
    }

    async fn cancel_exec_flow(
        &self,
        executor: &ExecutorAddr,
        exec_id: i64,
    ) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(Call::Cancel {
            executor: executor.clone(),
            exec_id,
        });
        self.next_reply(executor)
    }

    async fn forget(&self, executor: &ExecutorAddr) {
        self.forgotten.lock().unwrap().push(executor.clone());
    }
}

// =============================================================================
// Hand-wired master
// =============================================================================

pub fn test_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        retry_count: 3,
        no_executor_backoff: Duration::from_millis(20),
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedExecutorClient>,
    pub registry: Arc<RwLock<ExecutorRegistry>>,
    pub queue: DispatchQueue,
    pub dispatcher: Dispatcher,
    pub cron: Arc<CronScheduler>,
    pub master: MasterHandle,
    pub shutdown: CancellationToken,
    receiver: Option<DispatchReceiver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_dispatch_config())
    }

    pub fn with_config(config: DispatchConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn ExecutionStore> = store.clone();
        let client = Arc::new(ScriptedExecutorClient::with_store(store.clone()));
        let dyn_client: Arc<dyn ExecutorClient> = client.clone();
        let registry = Arc::new(RwLock::new(ExecutorRegistry::new()));
        let (queue, receiver) = DispatchQueue::new();
        let cron = Arc::new(CronScheduler::new(dyn_store.clone(), queue.clone()));

        let dispatcher = Dispatcher::new(
            dyn_store.clone(),
            registry.clone(),
            queue.clone(),
            dyn_client.clone(),
            config,
        );
        let master = MasterHandle::new(
            dyn_store,
            registry.clone(),
            queue.clone(),
            cron.clone(),
            dyn_client,
            1_000,
        );

        Self {
            store,
            client,
            registry,
            queue,
            dispatcher,
            cron,
            master,
            shutdown: CancellationToken::new(),
            receiver: Some(receiver),
        }
    }

    /// Store pre-loaded with workflows 1..=3 of project 10.
    pub async fn with_catalog() -> Self {
        let harness = Self::new();
        for id in 1..=3 {
            harness.store.put_workflow(workflow(id, 10)).await;
        }
        harness
    }

    pub async fn register(&self, executor: &ExecutorAddr) {
        self.registry
            .write()
            .await
            .register_executor(executor.clone(), Utc::now());
    }

    pub async fn heartbeat(&self, executor: &ExecutorAddr, exec_ids: Vec<i64>) {
        self.master
            .executor_report(
                &executor.host,
                i32::from(executor.port),
                Utc::now(),
                exec_ids,
            )
            .await
            .unwrap();
    }

    /// Submit a direct run of `flow_id` in project 10.
    pub async fn exec(&self, flow_id: i32) -> i64 {
        self.master
            .exec_flow(10, flow_id, Utc::now(), Default::default())
            .await
            .unwrap()
    }

    /// Dequeue one flow and run the dispatch protocol on it.
    pub async fn dispatch_next(&mut self) -> Option<(i64, DispatchOutcome)> {
        let flow = self.receiver.as_mut()?.try_recv()?;
        let exec_id = flow.id;
        let outcome = self.dispatcher.dispatch(flow, &self.shutdown).await;
        Some((exec_id, outcome))
    }

    /// Dispatch until the queue is empty, capped at `max` rounds.
    pub async fn dispatch_all(&mut self, max: usize) -> Vec<(i64, DispatchOutcome)> {
        let mut outcomes = Vec::new();
        for _ in 0..max {
            match self.dispatch_next().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }

    /// Hand the receiver to a real dispatch worker task.
    pub fn spawn_worker(&mut self) -> JoinHandle<()> {
        let receiver = self.receiver.take().expect("worker already spawned");
        let worker = DispatchWorker::new(self.dispatcher.clone(), receiver);
        tokio::spawn(worker.run(self.shutdown.clone()))
    }

    pub async fn flow(&self, exec_id: i64) -> ExecutionFlow {
        self.store.execution(exec_id).await.unwrap().unwrap()
    }

    pub async fn status(&self, exec_id: i64) -> FlowStatus {
        self.flow(exec_id).await.status
    }
}

// =============================================================================
// Real processes
// =============================================================================

pub struct RunningMaster {
    pub addr: SocketAddr,
    pub handle: MasterHandle,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<flowmaster::error::Result<()>>,
}

impl RunningMaster {
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for RunningMaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

pub async fn spawn_master(store: Arc<MemoryStore>) -> RunningMaster {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = MasterConfig::new(addr).with_no_executor_backoff(Duration::from_millis(50));
    config.shutdown_grace = Duration::from_millis(500);

    let master = Master::with_grpc_client(config, store);
    let handle = master.handle();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(master.run_with_listener(listener, shutdown.clone()));

    RunningMaster {
        addr,
        handle,
        shutdown,
        task,
    }
}

pub struct RunningAgent {
    pub addr: ExecutorAddr,
    pub inventory: Inventory,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<flowmaster::error::Result<()>>,
}

impl RunningAgent {
    /// Stop serving; the port is closed once the task returns.
    pub async fn kill(&mut self) {
        self.shutdown.cancel();
        if tokio::time::timeout(Duration::from_secs(2), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for RunningAgent {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.task.abort();
    }
}

pub async fn spawn_agent(master_endpoint: &str) -> RunningAgent {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let mut config = AgentConfig::new(local, master_endpoint);
    config.heartbeat_interval = Duration::from_millis(50);

    let agent = ExecutorAgent::new(config);
    let inventory = agent.inventory();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.run_with_listener(listener, shutdown.clone()));

    RunningAgent {
        addr: ExecutorAddr::new("127.0.0.1", local.port()),
        inventory,
        shutdown,
        task,
    }
}
