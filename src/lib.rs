pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod master;
pub mod model;
pub mod registrar;
pub mod shutdown;
pub mod store;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("flowmaster");
}
