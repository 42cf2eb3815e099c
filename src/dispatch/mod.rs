//! Master-side dispatch pipeline.
//!
//! - [`ExecutorRegistry`]: live executors and their last heartbeat, with
//!   round-robin selection
//! - [`DispatchQueue`]: unbounded FIFO of flows waiting for an executor,
//!   many producers and one consumer
//! - [`DispatchWorker`]: the single consumer loop; hands each flow to an
//!   executor with bounded retries and fails over when an executor is gone
//! - [`ExecutorClient`]: the master-to-executor RPC seam

pub mod client;
pub mod queue;
pub mod registry;
pub mod worker;

pub use client::ExecutorClient;
pub use queue::{DispatchQueue, DispatchReceiver};
pub use registry::{ExecutorAddr, ExecutorRegistry, ExecutorServerInfo, HeartBeatSnapshot};
pub use worker::{DispatchOutcome, DispatchWorker, Dispatcher};
