use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::daemon::Daemon;
use crate::error::{BatchError, Result};
use crate::grpc::daemon_service::BatchService;
use crate::proto::daemon_service_server::DaemonServiceServer;

pub struct GrpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    daemon: Arc<Daemon>,
}

impl GrpcServer {
    /// Claim the daemon's listen address. A second daemon on the same
    /// address fails here with [`BatchError::AlreadyBound`].
    pub async fn bind(daemon: Arc<Daemon>) -> Result<Self> {
        let addr = daemon.config().listen_addr;
        let listener = TcpListener::bind(addr).await.map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => BatchError::AlreadyBound(addr),
            _ => BatchError::Io(e),
        })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            daemon,
        })
    }

    /// Address actually bound; differs from the configured one for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the daemon's shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        let token = self.daemon.shutdown_token();
        let service = BatchService::new(self.daemon);

        tracing::info!(addr = %self.local_addr, "Starting gRPC server");

        Server::builder()
            .add_service(DaemonServiceServer::new(service))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(self.listener),
                async move { token.cancelled().await },
            )
            .await?;

        tracing::info!(addr = %self.local_addr, "gRPC server stopped");
        Ok(())
    }
}
