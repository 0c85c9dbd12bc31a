pub mod daemon_service;
pub mod server;

pub use daemon_service::BatchService;
pub use server::GrpcServer;
