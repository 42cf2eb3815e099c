use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tonic::async_trait;

use super::{ExecutionStore, MasterClaim, StatusUpdate, StoreResult};
use crate::error::StoreError;
use crate::model::{
    AdHoc, ExecutionFlow, FlowStatus, MasterRecord, NewExecution, Schedule, ScheduleStatus,
    Workflow,
};

/// Catalog fixture loaded into a [`MemoryStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    /// Master record left behind by an earlier process, if any.
    #[serde(default)]
    pub master: Option<MasterRecord>,
    #[serde(default)]
    pub workflows: Vec<Workflow>,
    #[serde(default)]
    pub schedules: Vec<Schedule>,
    #[serde(default)]
    pub ad_hocs: Vec<AdHoc>,
}

#[derive(Debug, Default)]
struct StoreState {
    master: Option<MasterRecord>,
    workflows: HashMap<i32, Workflow>,
    schedules: HashMap<i32, Schedule>,
    ad_hocs: HashMap<i32, AdHoc>,
    executions: BTreeMap<i64, ExecutionFlow>,
    next_exec_id: i64,
}

/// Store that keeps everything in process memory, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_seed_file(path: &Path) -> StoreResult<Self> {
        let raw = tokio::fs::read_to_string(path).await?;
        let seed: SeedData = serde_json::from_str(&raw)?;
        let store = Self::new();
        store.load_seed(seed).await;
        Ok(store)
    }

    pub async fn load_seed(&self, seed: SeedData) {
        let mut state = self.state.write().await;
        if seed.master.is_some() {
            state.master = seed.master;
        }
        for workflow in seed.workflows {
            state.workflows.insert(workflow.id, workflow);
        }
        for schedule in seed.schedules {
            state.schedules.insert(schedule.flow_id, schedule);
        }
        for ad_hoc in seed.ad_hocs {
            state.ad_hocs.insert(ad_hoc.id, ad_hoc);
        }
    }

    pub async fn put_workflow(&self, workflow: Workflow) {
        self.state
            .write()
            .await
            .workflows
            .insert(workflow.id, workflow);
    }

    pub async fn put_schedule(&self, schedule: Schedule) {
        self.state
            .write()
            .await
            .schedules
            .insert(schedule.flow_id, schedule);
    }

    pub async fn put_ad_hoc(&self, ad_hoc: AdHoc) {
        self.state.write().await.ad_hocs.insert(ad_hoc.id, ad_hoc);
    }

    /// Operator action: forget the registered master.
    pub async fn clear_master_record(&self) {
        self.state.write().await.master = None;
    }

    /// Unconditional status write, standing in for the executor side which
    /// owns every transition past `RUNNING`.
    pub async fn set_status(&self, exec_id: i64, status: FlowStatus) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let exec = state
            .executions
            .get_mut(&exec_id)
            .ok_or(StoreError::ExecutionNotFound(exec_id))?;
        exec.status = status;
        if status.is_finished() {
            exec.end_time = Some(Utc::now());
        }
        Ok(())
    }

    /// All execution rows ordered by id.
    pub async fn executions(&self) -> Vec<ExecutionFlow> {
        self.state.read().await.executions.values().cloned().collect()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn master_record(&self) -> StoreResult<Option<MasterRecord>> {
        Ok(self.state.read().await.master.clone())
    }

    async fn insert_master_record(&self, host: &str, port: u16) -> StoreResult<MasterClaim> {
        let mut state = self.state.write().await;
        if let Some(existing) = &state.master {
            return Ok(MasterClaim::Existing(existing.clone()));
        }
        let now = Utc::now();
        let record = MasterRecord {
            host: host.to_string(),
            port,
            create_time: now,
            modify_time: now,
        };
        state.master = Some(record.clone());
        Ok(MasterClaim::Inserted(record))
    }

    async fn touch_master_record(&self, host: &str, port: u16) -> StoreResult<MasterRecord> {
        let mut state = self.state.write().await;
        match state.master.as_mut() {
            Some(record) if record.is_same_address(host, port) => {
                record.modify_time = Utc::now();
                Ok(record.clone())
            }
            _ => Err(StoreError::Unavailable(format!(
                "no master record for {}:{}",
                host, port
            ))),
        }
    }

    async fn workflow(&self, flow_id: i32) -> StoreResult<Option<Workflow>> {
        Ok(self.state.read().await.workflows.get(&flow_id).cloned())
    }

    async fn ad_hoc(&self, ad_hoc_id: i32) -> StoreResult<Option<AdHoc>> {
        Ok(self.state.read().await.ad_hocs.get(&ad_hoc_id).cloned())
    }

    async fn schedule(&self, flow_id: i32) -> StoreResult<Option<Schedule>> {
        Ok(self.state.read().await.schedules.get(&flow_id).cloned())
    }

    async fn online_schedules(&self) -> StoreResult<Vec<Schedule>> {
        let state = self.state.read().await;
        let mut schedules: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.status == ScheduleStatus::Online)
            .cloned()
            .collect();
        schedules.sort_by_key(|s| s.flow_id);
        Ok(schedules)
    }

    async fn create_execution(&self, exec: NewExecution) -> StoreResult<ExecutionFlow> {
        let mut state = self.state.write().await;
        state.next_exec_id += 1;
        let flow = ExecutionFlow {
            id: state.next_exec_id,
            project_id: exec.project_id,
            flow_id: exec.flow_id,
            flow_type: exec.flow_type,
            exec_type: exec.exec_type,
            status: FlowStatus::Init,
            worker: None,
            submit_user_id: exec.submit_user_id,
            submit_time: Utc::now(),
            schedule_time: exec.schedule_time,
            start_time: None,
            end_time: None,
            max_try_times: exec.max_try_times,
            timeout: exec.timeout,
            node_name: exec.node_name,
            node_dep: exec.node_dep,
            notify_type: exec.notify_type,
            notify_mails: exec.notify_mails,
            workflow_data: exec.workflow_data,
        };
        state.executions.insert(flow.id, flow.clone());
        Ok(flow)
    }

    async fn execution(&self, exec_id: i64) -> StoreResult<Option<ExecutionFlow>> {
        Ok(self.state.read().await.executions.get(&exec_id).cloned())
    }

    async fn executions_in_status(&self, status: FlowStatus) -> StoreResult<Vec<ExecutionFlow>> {
        Ok(self
            .state
            .read()
            .await
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn transition(
        &self,
        exec_id: i64,
        expected: FlowStatus,
        update: StatusUpdate,
    ) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let exec = state
            .executions
            .get_mut(&exec_id)
            .ok_or(StoreError::ExecutionNotFound(exec_id))?;
        if exec.status != expected {
            return Ok(false);
        }

        let now = Utc::now();
        exec.status = update.status;
        if let Some(worker) = update.worker {
            exec.worker = Some(worker);
        }
        if update.status == FlowStatus::Running && exec.start_time.is_none() {
            exec.start_time = Some(now);
        }
        if update.status.is_finished() {
            exec.end_time = Some(now);
        }
        Ok(true)
    }
}
