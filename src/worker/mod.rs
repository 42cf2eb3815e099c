//! Executor-side agent.
//!
//! Runs next to an executor process and speaks the master's protocol for it:
//! - **Service**: accepts `SubmitFlow`, `ExecAdHoc` and `CancelExecFlow`
//! - **Inventory**: the exec ids this executor currently holds
//! - **Heartbeat**: registers with the master, then reports the inventory
//!   on a fixed interval
//!
//! DAG execution itself happens outside this crate; the agent only keeps
//! the bookkeeping the master relies on for failover.

pub mod agent;
pub mod heartbeat;

pub use agent::{ExecutorAgent, ExecutorRpcService, Inventory};
pub use heartbeat::HeartbeatReporter;
