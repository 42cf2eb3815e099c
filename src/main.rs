use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use flowmaster::config::{AgentConfig, MasterConfig};
use flowmaster::master::Master;
use flowmaster::model::{NodeDepType, NotifyType};
use flowmaster::proto::master_service_client::MasterServiceClient;
use flowmaster::proto::{
    AppendWorkFlowRequest, CancelExecFlowRequest, DeleteSchedulesRequest, ExecFlowRequest,
    ExecInfo, GetExecFlowRequest, ListExecutorsRequest, RetInfo, ScheduleInfo, ScheduleRequest,
};
use flowmaster::shutdown::install_shutdown_handler;
use flowmaster::store::MemoryStore;
use flowmaster::worker::ExecutorAgent;

#[derive(Parser, Debug)]
#[command(name = "flowmaster")]
#[command(version)]
#[command(about = "Workflow scheduling master with executor dispatch and failover")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the master server
    Server(ServerArgs),

    /// Start an executor agent that registers with a master
    Executor(ExecutorArgs),

    /// Flow execution commands
    Flow {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: FlowCommands,
    },

    /// Cron schedule commands
    Schedule {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ScheduleCommands,
    },

    /// Cluster inspection commands
    Cluster {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClusterCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to bind the gRPC server to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "8090")]
    port: u16,

    /// Host recorded in the master record (defaults to 127.0.0.1 when
    /// binding to all interfaces)
    #[arg(long)]
    advertise_host: Option<String>,

    /// JSON fixture of workflows, schedules and ad-hoc requests
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Submit attempts against one executor before marking a flow failed
    #[arg(long, default_value = "3")]
    retry_count: u32,

    /// Backoff before re-queueing when no executor is registered (ms)
    #[arg(long, default_value = "5000")]
    no_executor_backoff_ms: u64,

    /// Time the dispatch worker gets to finish on shutdown (seconds)
    #[arg(long, default_value = "10")]
    shutdown_grace_secs: u64,
}

#[derive(Parser, Debug)]
struct ExecutorArgs {
    /// Address to bind the executor service to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "9000")]
    port: u16,

    /// Host the master should dial back
    #[arg(long, default_value = "127.0.0.1")]
    advertise_host: String,

    /// Master address
    #[arg(long, short = 'm', default_value = "http://127.0.0.1:8090")]
    master: String,

    /// Heartbeat interval (ms)
    #[arg(long, default_value = "3000")]
    heartbeat_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by flow, schedule and cluster commands)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Master address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8090")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

/// Part of the DAG run around `--node-name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NodeDepArg {
    NodeOnly,
    NodePre,
    NodePost,
}

impl From<NodeDepArg> for NodeDepType {
    fn from(arg: NodeDepArg) -> Self {
        match arg {
            NodeDepArg::NodeOnly => NodeDepType::NodeOnly,
            NodeDepArg::NodePre => NodeDepType::NodePre,
            NodeDepArg::NodePost => NodeDepType::NodePost,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NotifyArg {
    None,
    Success,
    Failure,
    All,
}

impl From<NotifyArg> for NotifyType {
    fn from(arg: NotifyArg) -> Self {
        match arg {
            NotifyArg::None => NotifyType::None,
            NotifyArg::Success => NotifyType::Success,
            NotifyArg::Failure => NotifyType::Failure,
            NotifyArg::All => NotifyType::All,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum FlowCommands {
    /// Run a workflow once
    Exec {
        project_id: i32,
        flow_id: i32,

        /// Logical schedule time (RFC 3339), defaults to now
        #[arg(long)]
        schedule_date: Option<String>,

        /// Run only this node of the DAG
        #[arg(long)]
        node_name: Option<String>,

        /// Which neighbours of --node-name run with it
        #[arg(long, value_enum, default_value = "node-only")]
        node_dep: NodeDepArg,

        /// When to send notification mail
        #[arg(long, value_enum, default_value = "none")]
        notify_type: NotifyArg,

        /// Timeout override in seconds
        #[arg(long, default_value = "0")]
        timeout: i32,

        /// Notification address (repeatable)
        #[arg(long = "notify-mail")]
        notify_mails: Vec<String>,
    },
    /// Backfill a workflow over a time range
    Append {
        project_id: i32,
        flow_id: i32,

        /// Cron expression, e.g. "0 0 * * * ?"
        #[arg(long)]
        cron: String,

        /// Range start (RFC 3339, inclusive)
        #[arg(long)]
        start: String,

        /// Range end (RFC 3339, exclusive)
        #[arg(long)]
        end: String,
    },
    /// Show the persisted state of an execution
    Status { exec_id: i64 },
    /// Cancel an execution
    Cancel { exec_id: i64 },
}

#[derive(clap::Subcommand, Debug)]
enum ScheduleCommands {
    /// Install or replace the trigger of a workflow
    Set { project_id: i32, flow_id: i32 },
    /// Remove the trigger of a workflow
    Delete { project_id: i32, flow_id: i32 },
    /// Remove every trigger of a project
    DeleteAll { project_id: i32 },
}

#[derive(clap::Subcommand, Debug)]
enum ClusterCommands {
    /// List registered executors
    Executors,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct ResultOutput {
    status: i32,
    msg: String,
    exec_ids: Vec<i64>,
}

#[derive(Serialize)]
struct ExecFlowOutput {
    exec_id: i64,
    project_id: i32,
    flow_id: i32,
    status: String,
    exec_type: String,
    worker: Option<String>,
    submit_time_ms: i64,
    schedule_time_ms: i64,
    start_time_ms: Option<i64>,
    end_time_ms: Option<i64>,
}

#[derive(Serialize)]
struct ExecutorOutput {
    address: String,
    register_time_ms: i64,
    last_report_time_ms: Option<i64>,
    exec_ids: Vec<i64>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))?
        .with_timezone(&Utc))
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| millis.to_string())
}

/// Fail on a non-zero envelope.
fn check(ret: Option<RetInfo>) -> Result<RetInfo, Box<dyn std::error::Error>> {
    let ret = ret.ok_or("response is missing its result envelope")?;
    if ret.status != 0 {
        return Err(format!("request failed (status {}): {}", ret.status, ret.msg).into());
    }
    Ok(ret)
}

fn print_result(
    ret: RetInfo,
    exec_ids: Vec<i64>,
    message: &str,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            let output = ResultOutput {
                status: ret.status,
                msg: ret.msg,
                exec_ids,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{}", message);
            for exec_id in exec_ids {
                println!("Exec ID: {}", exec_id);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Process Entry Points
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let advertise_host = args.advertise_host.unwrap_or_else(|| {
        if listen_addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            listen_addr.ip().to_string()
        }
    });

    let mut config = MasterConfig::new(listen_addr)
        .with_advertise_host(advertise_host)
        .with_retry_count(args.retry_count)
        .with_no_executor_backoff(Duration::from_millis(args.no_executor_backoff_ms));
    config.shutdown_grace = Duration::from_secs(args.shutdown_grace_secs);

    let store = match &args.seed {
        Some(path) => {
            tracing::info!(seed = %path.display(), "Loading store fixture");
            MemoryStore::from_seed_file(path).await?
        }
        None => MemoryStore::new(),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        advertise_host = %config.advertise_host,
        retry_count = config.dispatch.retry_count,
        "Starting flowmaster master"
    );

    let shutdown = install_shutdown_handler();
    Master::with_grpc_client(config, Arc::new(store))
        .run(shutdown)
        .await?;
    Ok(())
}

async fn run_executor(args: ExecutorArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let listen_addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    let mut config = AgentConfig::new(listen_addr, args.master);
    config.advertise_host = args.advertise_host;
    config.heartbeat_interval = Duration::from_millis(args.heartbeat_interval_ms);

    let shutdown = install_shutdown_handler();
    ExecutorAgent::new(config).run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_flow(
    client: &mut MasterServiceClient<Channel>,
    command: FlowCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        FlowCommands::Exec {
            project_id,
            flow_id,
            schedule_date,
            node_name,
            node_dep,
            notify_type,
            timeout,
            notify_mails,
        } => {
            let schedule_date = match schedule_date {
                Some(value) => parse_time(&value)?.timestamp_millis(),
                None => 0,
            };
            let response = client
                .exec_flow(ExecFlowRequest {
                    project_id,
                    flow_id,
                    schedule_date,
                    exec_info: Some(ExecInfo {
                        node_name: node_name.unwrap_or_default(),
                        node_dep: NodeDepType::from(node_dep).to_wire(),
                        notify_type: NotifyType::from(notify_type).to_wire(),
                        notify_mails,
                        timeout,
                    }),
                })
                .await?
                .into_inner();
            let ret = check(response.ret)?;
            print_result(ret, response.exec_ids, "Flow submitted successfully!", output_format)
        }
        FlowCommands::Append {
            project_id,
            flow_id,
            cron,
            start,
            end,
        } => {
            let response = client
                .append_work_flow(AppendWorkFlowRequest {
                    project_id,
                    flow_id,
                    schedule_info: Some(ScheduleInfo {
                        cron_expression: cron,
                        start_date: parse_time(&start)?.timestamp_millis(),
                        end_date: parse_time(&end)?.timestamp_millis(),
                    }),
                })
                .await?
                .into_inner();
            let ret = check(response.ret)?;
            print_result(ret, response.exec_ids, "Backfill accepted.", output_format)
        }
        FlowCommands::Status { exec_id } => {
            let response = client
                .get_exec_flow(GetExecFlowRequest { exec_id })
                .await?
                .into_inner();
            check(response.ret.clone())?;
            match output_format {
                OutputFormat::Json => {
                    let output = ExecFlowOutput {
                        exec_id: response.exec_id,
                        project_id: response.project_id,
                        flow_id: response.flow_id,
                        status: response.status,
                        exec_type: response.exec_type,
                        worker: Some(response.worker).filter(|w| !w.is_empty()),
                        submit_time_ms: response.submit_time,
                        schedule_time_ms: response.schedule_time,
                        start_time_ms: response.start_time,
                        end_time_ms: response.end_time,
                    };
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                OutputFormat::Table => {
                    println!("Exec ID:       {}", response.exec_id);
                    println!("Project/Flow:  {}/{}", response.project_id, response.flow_id);
                    println!("Status:        {}", response.status);
                    println!("Run Type:      {}", response.exec_type);
                    if !response.worker.is_empty() {
                        println!("Worker:        {}", response.worker);
                    }
                    println!("Submitted:     {}", format_millis(response.submit_time));
                    println!("Scheduled For: {}", format_millis(response.schedule_time));
                    if let Some(start) = response.start_time {
                        println!("Started:       {}", format_millis(start));
                    }
                    if let Some(end) = response.end_time {
                        println!("Ended:         {}", format_millis(end));
                    }
                }
            }
            Ok(())
        }
        FlowCommands::Cancel { exec_id } => {
            let ret = client
                .cancel_exec_flow(CancelExecFlowRequest { exec_id })
                .await?
                .into_inner();
            let ret = check(Some(ret))?;
            print_result(ret, vec![exec_id], "Cancellation requested.", output_format)
        }
    }
}

async fn handle_schedule(
    client: &mut MasterServiceClient<Channel>,
    command: ScheduleCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (ret, message) = match command {
        ScheduleCommands::Set {
            project_id,
            flow_id,
        } => (
            client
                .set_schedule(ScheduleRequest {
                    project_id,
                    flow_id,
                })
                .await?,
            "Schedule installed.",
        ),
        ScheduleCommands::Delete {
            project_id,
            flow_id,
        } => (
            client
                .delete_schedule(ScheduleRequest {
                    project_id,
                    flow_id,
                })
                .await?,
            "Schedule removed.",
        ),
        ScheduleCommands::DeleteAll { project_id } => (
            client
                .delete_schedules(DeleteSchedulesRequest { project_id })
                .await?,
            "Project schedules removed.",
        ),
    };
    let ret = check(Some(ret.into_inner()))?;
    print_result(ret, Vec::new(), message, output_format)
}

async fn handle_cluster_executors(
    client: &mut MasterServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .list_executors(ListExecutorsRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output: Vec<ExecutorOutput> = response
                .executors
                .into_iter()
                .map(|e| ExecutorOutput {
                    address: format!("{}:{}", e.host, e.port),
                    register_time_ms: e.register_time,
                    last_report_time_ms: e.last_report_time,
                    exec_ids: e.exec_ids,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if response.executors.is_empty() {
                println!("No executors registered.");
                return Ok(());
            }
            println!("{:<24} {:<27} {:<8}", "ADDRESS", "LAST HEARTBEAT", "RUNNING");
            println!("{}", "-".repeat(62));
            for executor in &response.executors {
                let last = executor
                    .last_report_time
                    .map(format_millis)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<24} {:<27} {:<8}",
                    format!("{}:{}", executor.host, executor.port),
                    last,
                    executor.exec_ids.len()
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Executor(executor_args) => {
            run_executor(executor_args).await?;
        }
        Commands::Flow { client, command } => {
            let mut grpc_client = MasterServiceClient::connect(client.addr.clone()).await?;
            handle_flow(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Schedule { client, command } => {
            let mut grpc_client = MasterServiceClient::connect(client.addr.clone()).await?;
            handle_schedule(&mut grpc_client, command, &client.output).await?;
        }
        Commands::Cluster { client, command } => {
            let mut grpc_client = MasterServiceClient::connect(client.addr.clone()).await?;
            match command {
                ClusterCommands::Executors => {
                    handle_cluster_executors(&mut grpc_client, &client.output).await?;
                }
            }
        }
    }

    Ok(())
}
