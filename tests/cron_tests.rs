//! Cron scheduler tests: trigger installation, firing and backfill.

mod test_harness;

use std::time::Duration;

use chrono::{TimeZone, Utc};
use flowmaster::cron::{materialize_scheduled, TriggerKey};
use flowmaster::dispatch::DispatchOutcome;
use flowmaster::error::MasterError;
use flowmaster::model::{FlowStatus, NotifyType, RunType, ScheduleStatus};
use test_harness::{addr, schedule, wait_until, workflow, Harness};

/// Test 1: Installing a schedule that does not exist fails
#[tokio::test]
async fn test_set_schedule_not_found() {
    let h = Harness::with_catalog().await;
    let err = h.cron.set_schedule(10, 1).await.unwrap_err();
    assert!(matches!(err, MasterError::ScheduleNotFound(1)));
    assert!(h.cron.trigger_keys().await.is_empty());
}

/// Test 2: A stored crontab that does not parse is reported synchronously
#[tokio::test]
async fn test_set_schedule_invalid_cron() {
    let h = Harness::with_catalog().await;
    let now = Utc::now();
    h.store
        .put_schedule(schedule(1, 10, "every hour", now, now + chrono::Duration::days(1)))
        .await;

    let err = h.cron.set_schedule(10, 1).await.unwrap_err();
    assert!(matches!(err, MasterError::InvalidCronExpression { .. }));
    assert!(h.cron.trigger_keys().await.is_empty());
}

/// Test 3: Triggers are keyed per flow and grouped per project
#[tokio::test]
async fn test_install_replace_and_delete_triggers() {
    let h = Harness::with_catalog().await;
    let now = Utc::now();
    let end = now + chrono::Duration::days(1);
    h.store.put_workflow(workflow(7, 20)).await;
    h.store.put_schedule(schedule(1, 10, "0 0 * * * ?", now, end)).await;
    h.store.put_schedule(schedule(2, 10, "0 0 * * * ?", now, end)).await;
    h.store.put_schedule(schedule(7, 20, "0 0 * * * ?", now, end)).await;

    h.cron.set_schedule(10, 1).await.unwrap();
    h.cron.set_schedule(10, 2).await.unwrap();
    h.cron.set_schedule(20, 7).await.unwrap();
    // Replacing keeps a single trigger
    h.cron.set_schedule(10, 1).await.unwrap();

    assert_eq!(
        h.cron.trigger_keys().await,
        vec![
            TriggerKey::for_flow(10, 1),
            TriggerKey::for_flow(10, 2),
            TriggerKey::for_flow(20, 7),
        ]
    );
    assert_eq!(TriggerKey::for_flow(10, 1).to_string(), "job_group_10.job_flow_1");
    assert!(h.cron.is_active(10, 1).await);

    assert!(h.cron.delete_schedule(10, 1).await);
    assert!(!h.cron.delete_schedule(10, 1).await, "Second delete is a no-op");
    assert!(!h.cron.is_active(10, 1).await);

    assert_eq!(h.cron.delete_schedules(10).await, 1);
    assert_eq!(h.cron.delete_schedules(10).await, 0);
    assert_eq!(h.cron.trigger_keys().await, vec![TriggerKey::for_flow(20, 7)]);

    h.cron.shutdown().await;
    assert!(h.cron.trigger_keys().await.is_empty());
}

/// Test 4: An hourly tick materializes a SCHEDULED run that dispatches to
/// the sole executor
#[tokio::test]
async fn test_scheduled_tick_dispatches_to_sole_executor() {
    let mut h = Harness::with_catalog().await;
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let sched = schedule(1, 10, "0 0 * * * ?", start, end);
    h.store.put_schedule(sched.clone()).await;

    let fire_time = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let exec_id = materialize_scheduled(h.store.as_ref(), &h.queue, &sched, fire_time)
        .await
        .unwrap();

    let flow = h.flow(exec_id).await;
    assert_eq!(flow.exec_type, RunType::Scheduled);
    assert_eq!(flow.status, FlowStatus::Init);
    assert_eq!(flow.schedule_time, fire_time);
    assert_eq!(flow.notify_type, NotifyType::Failure);
    assert_eq!(flow.max_try_times, 2);
    assert_eq!(flow.timeout, 300);
    assert_eq!(h.queue.len(), 1);

    let executor = addr("10.0.0.5", 9000);
    h.register(&executor).await;
    let (_, outcome) = h.dispatch_next().await.unwrap();
    assert_eq!(outcome, DispatchOutcome::Dispatched { executor });

    let flow = h.flow(exec_id).await;
    assert_eq!(flow.status, FlowStatus::Running);
    assert_eq!(flow.worker.as_deref(), Some("10.0.0.5:9000"));
}

/// Test 5: A tick for a workflow that disappeared is an error and enqueues
/// nothing
#[tokio::test]
async fn test_tick_for_missing_workflow() {
    let h = Harness::new();
    let now = Utc::now();
    let sched = schedule(99, 10, "0 0 * * * ?", now, now + chrono::Duration::days(1));

    let err = materialize_scheduled(h.store.as_ref(), &h.queue, &sched, now)
        .await
        .unwrap_err();
    assert!(matches!(err, MasterError::WorkflowNotFound(99)));
    assert!(h.queue.is_empty());
    assert!(h.store.executions().await.is_empty());
}

/// Test 6: A live trigger fires on its own and stops once deleted
#[tokio::test]
async fn test_trigger_fires_until_deleted() {
    let h = Harness::with_catalog().await;
    let now = Utc::now();
    h.store
        .put_schedule(schedule(
            1,
            10,
            "* * * * * ?",
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        ))
        .await;
    h.cron.set_schedule(10, 1).await.unwrap();

    let store = h.store.clone();
    let fired = wait_until(Duration::from_secs(5), || {
        let store = store.clone();
        async move { !store.executions().await.is_empty() }
    })
    .await;
    assert!(fired, "Per-second trigger should fire within a few seconds");

    for flow in h.store.executions().await {
        assert_eq!(flow.exec_type, RunType::Scheduled);
        assert_eq!(flow.flow_id, 1);
        assert_eq!(flow.schedule_time.timestamp_subsec_nanos(), 0);
    }

    h.cron.delete_schedule(10, 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let count = h.store.executions().await.len();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.store.executions().await.len(), count, "Deleted trigger must not fire");
}

/// Test 7: A trigger whose window already closed finishes without firing
#[tokio::test]
async fn test_expired_window_never_fires() {
    let h = Harness::with_catalog().await;
    let now = Utc::now();
    h.store
        .put_schedule(schedule(
            1,
            10,
            "* * * * * ?",
            now - chrono::Duration::days(2),
            now - chrono::Duration::days(1),
        ))
        .await;
    h.cron.set_schedule(10, 1).await.unwrap();

    let cron = h.cron.clone();
    let finished = wait_until(Duration::from_secs(2), || {
        let cron = cron.clone();
        async move { !cron.is_active(10, 1).await }
    })
    .await;
    assert!(finished);
    assert!(h.store.executions().await.is_empty());
}

/// Test 8: Restore reinstalls online schedules only
#[tokio::test]
async fn test_restore_online_schedules() {
    let h = Harness::with_catalog().await;
    let now = Utc::now();
    let end = now + chrono::Duration::days(1);
    h.store.put_schedule(schedule(1, 10, "0 0 * * * ?", now, end)).await;
    h.store.put_schedule(schedule(2, 10, "0 0 * * * ?", now, end)).await;
    let mut offline = schedule(3, 10, "0 0 * * * ?", now, end);
    offline.status = ScheduleStatus::Offline;
    h.store.put_schedule(offline).await;

    assert_eq!(h.cron.restore().await.unwrap(), 2);
    assert_eq!(
        h.cron.trigger_keys().await,
        vec![TriggerKey::for_flow(10, 1), TriggerKey::for_flow(10, 2)]
    );
}
