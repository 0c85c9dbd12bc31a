//! Test harness for daemon integration tests.
//!
//! Starts an in-process daemon on an ephemeral loopback port and provides
//! polling helpers for asynchronous assertions.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use batchd::client::DaemonClient;
use batchd::config::{daemon_uri, DaemonConfig, WorkerConfig};
use batchd::daemon::Daemon;
use batchd::grpc::GrpcServer;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Handle to a running test daemon
pub struct TestDaemon {
    pub daemon: Arc<Daemon>,
    pub addr: SocketAddr,
    output_dir: TempDir,
    server_handle: JoinHandle<()>,
}

impl TestDaemon {
    /// Start a daemon on 127.0.0.1 with an OS-assigned port and a temporary
    /// output directory.
    pub async fn start() -> Self {
        let output_dir = TempDir::new().expect("create temp output dir");
        let config = DaemonConfig::new("127.0.0.1:0".parse().unwrap())
            .with_output_dir(output_dir.path());
        let daemon = Arc::new(Daemon::new(config));

        let server = GrpcServer::bind(daemon.clone())
            .await
            .expect("bind test daemon");
        let addr = server.local_addr();

        let server_handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("gRPC server error: {}", e);
            }
        });

        Self {
            daemon,
            addr,
            output_dir,
            server_handle,
        }
    }

    pub fn uri(&self) -> String {
        daemon_uri(self.addr)
    }

    pub fn output_dir(&self) -> &Path {
        self.output_dir.path()
    }

    pub async fn client(&self) -> DaemonClient {
        DaemonClient::connect(self.uri())
            .await
            .expect("connect to test daemon")
    }

    /// Worker settings with short timers for fast tests
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::new(self.uri())
            .with_poll_interval(Duration::from_millis(50))
            .with_liveness_interval(Duration::from_millis(50))
            .with_idle_timeout(Duration::from_secs(30))
    }

    /// Whether the server task has exited
    pub fn is_stopped(&self) -> bool {
        self.server_handle.is_finished()
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// Wait for a condition to become true, polling at the given interval
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
