//! gRPC surface of the master.
//!
//! - [`MasterRpcService`]: the `MasterService` implementation
//! - [`GrpcExecutorClient`]: master-to-executor calls
//! - [`MasterServer`]: binds the service to a listener

pub mod executor_client;
pub mod master_service;
pub mod server;

pub use executor_client::GrpcExecutorClient;
pub use master_service::MasterRpcService;
pub use server::MasterServer;
