use chrono::{DateTime, TimeZone, Utc};
use tonic::{Request, Response, Status};

use crate::error::{MasterError, Result};
use crate::master::MasterHandle;
use crate::model::{ExecSettings, ExecutionFlow, NodeDepType, NotifyType};
use crate::proto::master_service_server::MasterService;
use crate::proto::{
    AppendWorkFlowRequest, CancelExecFlowRequest, DeleteSchedulesRequest, ExecAdHocRequest,
    ExecFlowRequest, ExecInfo, ExecutorInfo, ExecutorReportRequest, GetExecFlowRequest,
    GetExecFlowResponse, ListExecutorsRequest, ListExecutorsResponse, RegisterExecutorRequest,
    RetInfo, RetResultInfo, ScheduleRequest,
};

pub(crate) fn ok_ret() -> RetInfo {
    RetInfo {
        status: 0,
        msg: String::new(),
    }
}

fn err_ret(op: &'static str, err: &MasterError) -> RetInfo {
    tracing::warn!(op, code = err.code(), error = %err, "Request failed");
    RetInfo {
        status: err.code(),
        msg: err.to_string(),
    }
}

fn ret_info(op: &'static str, result: Result<()>) -> RetInfo {
    match result {
        Ok(()) => ok_ret(),
        Err(e) => err_ret(op, &e),
    }
}

fn ret_result_info(op: &'static str, result: Result<Vec<i64>>) -> RetResultInfo {
    match result {
        Ok(exec_ids) => RetResultInfo {
            ret: Some(ok_ret()),
            exec_ids,
        },
        Err(e) => RetResultInfo {
            ret: Some(err_ret(op, &e)),
            exec_ids: Vec::new(),
        },
    }
}

/// Wire timestamps are milliseconds since the epoch. Zero means "now".
fn from_millis(field: &str, millis: i64) -> Result<DateTime<Utc>> {
    if millis == 0 {
        return Ok(Utc::now());
    }
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| MasterError::Validation(format!("{} out of range: {}", field, millis)))
}

fn exec_settings(info: Option<ExecInfo>) -> ExecSettings {
    let Some(info) = info else {
        return ExecSettings::default();
    };
    ExecSettings {
        node_name: Some(info.node_name).filter(|n| !n.is_empty()),
        node_dep: NodeDepType::from_wire(info.node_dep),
        notify_type: NotifyType::from_wire(info.notify_type),
        notify_mails: info.notify_mails,
        timeout: info.timeout,
    }
}

fn exec_flow_response(flow: ExecutionFlow) -> GetExecFlowResponse {
    GetExecFlowResponse {
        ret: Some(ok_ret()),
        exec_id: flow.id,
        project_id: flow.project_id,
        flow_id: flow.flow_id,
        status: flow.status.to_string(),
        exec_type: flow.exec_type.to_string(),
        worker: flow.worker.unwrap_or_default(),
        submit_time: flow.submit_time.timestamp_millis(),
        schedule_time: flow.schedule_time.timestamp_millis(),
        start_time: flow.start_time.map(|t| t.timestamp_millis()),
        end_time: flow.end_time.map(|t| t.timestamp_millis()),
    }
}

/// gRPC front of the master. Every outcome, including a malformed request,
/// is reported through the result envelope.
pub struct MasterRpcService {
    master: MasterHandle,
}

impl MasterRpcService {
    pub fn new(master: MasterHandle) -> Self {
        Self { master }
    }
}

#[tonic::async_trait]
impl MasterService for MasterRpcService {
    async fn set_schedule(
        &self,
        request: Request<ScheduleRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(project_id = req.project_id, flow_id = req.flow_id, "SetSchedule");
        let result = self.master.set_schedule(req.project_id, req.flow_id).await;
        Ok(Response::new(ret_info("set_schedule", result)))
    }

    async fn delete_schedule(
        &self,
        request: Request<ScheduleRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(project_id = req.project_id, flow_id = req.flow_id, "DeleteSchedule");
        let result = self.master.delete_schedule(req.project_id, req.flow_id).await;
        Ok(Response::new(ret_info("delete_schedule", result)))
    }

    async fn delete_schedules(
        &self,
        request: Request<DeleteSchedulesRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(project_id = req.project_id, "DeleteSchedules");
        let result = self.master.delete_schedules(req.project_id).await;
        Ok(Response::new(ret_info("delete_schedules", result)))
    }

    async fn exec_flow(
        &self,
        request: Request<ExecFlowRequest>,
    ) -> std::result::Result<Response<RetResultInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(project_id = req.project_id, flow_id = req.flow_id, "ExecFlow");
        let result = match from_millis("schedule_date", req.schedule_date) {
            Ok(schedule_time) => self
                .master
                .exec_flow(
                    req.project_id,
                    req.flow_id,
                    schedule_time,
                    exec_settings(req.exec_info),
                )
                .await
                .map(|exec_id| vec![exec_id]),
            Err(e) => Err(e),
        };
        Ok(Response::new(ret_result_info("exec_flow", result)))
    }

    async fn exec_ad_hoc(
        &self,
        request: Request<ExecAdHocRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(ad_hoc_id = req.ad_hoc_id, "ExecAdHoc");
        let result = self.master.exec_ad_hoc(req.ad_hoc_id).await.map(|_| ());
        Ok(Response::new(ret_info("exec_ad_hoc", result)))
    }

    async fn append_work_flow(
        &self,
        request: Request<AppendWorkFlowRequest>,
    ) -> std::result::Result<Response<RetResultInfo>, Status> {
        let req = request.into_inner();
        let Some(info) = req.schedule_info else {
            let err = MasterError::Validation("schedule_info is required".to_string());
            return Ok(Response::new(ret_result_info("append_work_flow", Err(err))));
        };
        tracing::info!(
            project_id = req.project_id,
            flow_id = req.flow_id,
            cron = %info.cron_expression,
            "AppendWorkFlow"
        );

        let result: Result<Vec<i64>> = async {
            let start = from_millis("start_date", info.start_date)?;
            let end = from_millis("end_date", info.end_date)?;
            self.master
                .append_work_flow(req.project_id, req.flow_id, &info.cron_expression, start, end)
                .await
        }
        .await;
        // Backfill runs are tracked through the store; the envelope carries no ids.
        Ok(Response::new(ret_result_info(
            "append_work_flow",
            result.map(|_| Vec::new()),
        )))
    }

    async fn cancel_exec_flow(
        &self,
        request: Request<CancelExecFlowRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        tracing::info!(exec_id = req.exec_id, "CancelExecFlow");
        let result = self.master.cancel_exec_flow(req.exec_id).await;
        Ok(Response::new(ret_info("cancel_exec_flow", result)))
    }

    async fn register_executor(
        &self,
        request: Request<RegisterExecutorRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        let result = match from_millis("register_time", req.register_time) {
            Ok(registered_at) => {
                self.master
                    .register_executor(&req.host, req.port, registered_at)
                    .await
            }
            Err(e) => Err(e),
        };
        Ok(Response::new(ret_info("register_executor", result)))
    }

    async fn executor_report(
        &self,
        request: Request<ExecutorReportRequest>,
    ) -> std::result::Result<Response<RetInfo>, Status> {
        let req = request.into_inner();
        let heartbeat = req.heartbeat.unwrap_or_default();
        let result = match from_millis("report_date", heartbeat.report_date) {
            Ok(reported_at) => {
                self.master
                    .executor_report(&req.host, req.port, reported_at, heartbeat.exec_ids)
                    .await
            }
            Err(e) => Err(e),
        };
        Ok(Response::new(ret_info("executor_report", result)))
    }

    async fn get_exec_flow(
        &self,
        request: Request<GetExecFlowRequest>,
    ) -> std::result::Result<Response<GetExecFlowResponse>, Status> {
        let req = request.into_inner();
        let response = match self.master.get_exec_flow(req.exec_id).await {
            Ok(flow) => exec_flow_response(flow),
            Err(e) => GetExecFlowResponse {
                ret: Some(err_ret("get_exec_flow", &e)),
                exec_id: req.exec_id,
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn list_executors(
        &self,
        _request: Request<ListExecutorsRequest>,
    ) -> std::result::Result<Response<ListExecutorsResponse>, Status> {
        let executors = self
            .master
            .list_executors()
            .await
            .into_iter()
            .map(|info| ExecutorInfo {
                exec_ids: info.running_exec_ids(),
                last_report_time: info
                    .heartbeat
                    .as_ref()
                    .map(|hb| hb.reported_at.timestamp_millis()),
                register_time: info.registered_at.timestamp_millis(),
                host: info.addr.host,
                port: i32::from(info.addr.port),
            })
            .collect();
        Ok(Response::new(ListExecutorsResponse { executors }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_millis() {
        let t = from_millis("d", 1_700_000_000_000).unwrap();
        assert_eq!(t.timestamp_millis(), 1_700_000_000_000);
        assert!(from_millis("d", i64::MAX).is_err());

        let before = Utc::now();
        assert!(from_millis("d", 0).unwrap() >= before);
    }

    #[test]
    fn test_exec_settings_from_wire() {
        let settings = exec_settings(Some(ExecInfo {
            node_name: String::new(),
            node_dep: 1,
            notify_type: 3,
            notify_mails: vec!["ops@example.com".to_string()],
            timeout: 120,
        }));
        assert_eq!(settings.node_name, None);
        assert_eq!(settings.node_dep, NodeDepType::NodePre);
        assert_eq!(settings.notify_type, NotifyType::All);
        assert_eq!(settings.notify_mails, vec!["ops@example.com"]);
        assert_eq!(settings.timeout, 120);

        assert_eq!(exec_settings(None), ExecSettings::default());
    }

    #[test]
    fn test_error_envelope_carries_code_and_message() {
        let ret = ret_info("op", Err(MasterError::WorkflowNotFound(7)));
        assert_eq!(ret.status, 3);
        assert!(ret.msg.contains('7'));

        let ret = ret_result_info("op", Ok(vec![1, 2]));
        assert_eq!(ret.ret.unwrap().status, 0);
        assert_eq!(ret.exec_ids, vec![1, 2]);
    }
}
