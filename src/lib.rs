pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod grpc;
pub mod process;
pub mod scheduler;
pub mod shutdown;
pub mod wire;
pub mod worker;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("batchd");
}

pub use client::DaemonClient;
pub use daemon::Daemon;
pub use error::{BatchError, Result};
