//! Cron-driven materialization of scheduled runs.
//!
//! Each installed schedule owns one timer task. On every tick the task
//! creates a `SCHEDULED` execution for the fire time and pushes it onto the
//! dispatch queue; it never waits for the flow to be dispatched.

mod expr;

pub use expr::CronExpr;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::dispatch::DispatchQueue;
use crate::error::{MasterError, Result};
use crate::model::{NewExecution, Schedule};
use crate::store::ExecutionStore;

/// Identity of an installed trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    pub group: String,
    pub name: String,
}

impl TriggerKey {
    pub fn group_for(project_id: i32) -> String {
        format!("job_group_{}", project_id)
    }

    pub fn for_flow(project_id: i32, flow_id: i32) -> Self {
        Self {
            group: Self::group_for(project_id),
            name: format!("job_flow_{}", flow_id),
        }
    }
}

impl std::fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

pub struct CronScheduler {
    store: Arc<dyn ExecutionStore>,
    queue: DispatchQueue,
    triggers: Mutex<HashMap<TriggerKey, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(store: Arc<dyn ExecutionStore>, queue: DispatchQueue) -> Self {
        Self {
            store,
            queue,
            triggers: Mutex::new(HashMap::new()),
        }
    }

    /// Install or replace the trigger for `flow_id` from its stored schedule.
    pub async fn set_schedule(&self, project_id: i32, flow_id: i32) -> Result<()> {
        let schedule = self
            .store
            .schedule(flow_id)
            .await?
            .ok_or(MasterError::ScheduleNotFound(flow_id))?;
        let cron = CronExpr::parse(&schedule.crontab)?;
        self.install(TriggerKey::for_flow(project_id, flow_id), schedule, cron)
            .await;
        Ok(())
    }

    /// Remove one trigger. Returns whether it existed.
    pub async fn delete_schedule(&self, project_id: i32, flow_id: i32) -> bool {
        let key = TriggerKey::for_flow(project_id, flow_id);
        match self.triggers.lock().await.remove(&key) {
            Some(handle) => {
                handle.abort();
                tracing::info!(trigger = %key, "Trigger removed");
                true
            }
            None => false,
        }
    }

    /// Remove every trigger of a project. Returns how many were removed.
    pub async fn delete_schedules(&self, project_id: i32) -> usize {
        let group = TriggerKey::group_for(project_id);
        let mut triggers = self.triggers.lock().await;
        let keys: Vec<TriggerKey> = triggers
            .keys()
            .filter(|k| k.group == group)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(handle) = triggers.remove(key) {
                handle.abort();
            }
        }
        tracing::info!(group = %group, removed = keys.len(), "Trigger group removed");
        keys.len()
    }

    /// Reinstall triggers for every online schedule. Schedules with an
    /// unparsable expression are logged and skipped.
    pub async fn restore(&self) -> Result<usize> {
        let mut installed = 0;
        for schedule in self.store.online_schedules().await? {
            match CronExpr::parse(&schedule.crontab) {
                Ok(cron) => {
                    let key = TriggerKey::for_flow(schedule.project_id, schedule.flow_id);
                    self.install(key, schedule, cron).await;
                    installed += 1;
                }
                Err(e) => {
                    tracing::error!(
                        flow_id = schedule.flow_id,
                        error = %e,
                        "Skipping schedule with invalid cron expression"
                    );
                }
            }
        }
        Ok(installed)
    }

    /// Whether a trigger is installed and still has fire times ahead.
    pub async fn is_active(&self, project_id: i32, flow_id: i32) -> bool {
        self.triggers
            .lock()
            .await
            .get(&TriggerKey::for_flow(project_id, flow_id))
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn trigger_keys(&self) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self.triggers.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop every timer task.
    pub async fn shutdown(&self) {
        let mut triggers = self.triggers.lock().await;
        for (_, handle) in triggers.drain() {
            handle.abort();
        }
        tracing::info!("Cron scheduler stopped");
    }

    async fn install(&self, key: TriggerKey, schedule: Schedule, cron: CronExpr) {
        tracing::info!(
            trigger = %key,
            cron = cron.as_str(),
            start = %schedule.start_date,
            end = %schedule.end_date,
            "Installing trigger"
        );
        let trigger = Trigger {
            key: key.clone(),
            schedule,
            cron,
            store: self.store.clone(),
            queue: self.queue.clone(),
        };
        let handle = tokio::spawn(trigger.run());
        if let Some(previous) = self.triggers.lock().await.insert(key, handle) {
            previous.abort();
        }
    }
}

struct Trigger {
    key: TriggerKey,
    schedule: Schedule,
    cron: CronExpr,
    store: Arc<dyn ExecutionStore>,
    queue: DispatchQueue,
}

impl Trigger {
    async fn run(self) {
        let mut last_fire: Option<DateTime<Utc>> = None;
        loop {
            let now = Utc::now();
            let from = last_fire.map_or(now, |t| t.max(now));
            let next = if from < self.schedule.start_date {
                self.cron.next_at_or_after(self.schedule.start_date)
            } else {
                self.cron.next_after(from)
            };
            let Some(fire_time) = next.filter(|t| *t < self.schedule.end_date) else {
                tracing::info!(trigger = %self.key, "Trigger has no further fire times");
                return;
            };

            let wait = (fire_time - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            if let Err(e) = self.fire(fire_time).await {
                tracing::error!(
                    trigger = %self.key,
                    fire_time = %fire_time,
                    error = %e,
                    "Trigger fire failed, tick dropped"
                );
            }
            last_fire = Some(fire_time);
        }
    }

    async fn fire(&self, fire_time: DateTime<Utc>) -> Result<()> {
        let exec_id = materialize_scheduled(
            self.store.as_ref(),
            &self.queue,
            &self.schedule,
            fire_time,
        )
        .await?;
        tracing::info!(trigger = %self.key, exec_id, fire_time = %fire_time, "Trigger fired");
        Ok(())
    }
}

/// Create the `SCHEDULED` execution for one tick and enqueue it.
pub async fn materialize_scheduled(
    store: &dyn ExecutionStore,
    queue: &DispatchQueue,
    schedule: &Schedule,
    fire_time: DateTime<Utc>,
) -> Result<i64> {
    let workflow = store
        .workflow(schedule.flow_id)
        .await?
        .ok_or(MasterError::WorkflowNotFound(schedule.flow_id))?;
    let flow = store
        .create_execution(NewExecution::scheduled(&workflow, schedule, fire_time))
        .await?;
    let exec_id = flow.id;
    queue.push(flow);
    Ok(exec_id)
}
