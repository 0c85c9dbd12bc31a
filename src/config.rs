use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Port the daemon listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 8000;

/// Directory job output files are written to when a submission names none.
pub const DEFAULT_OUTPUT_DIR: &str = "./outputs";

/// Configuration for the scheduling daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Loopback address the gRPC server binds to. Only one daemon may hold it.
    pub listen_addr: SocketAddr,
    /// Default directory for job stdout/stderr capture files.
    pub output_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl DaemonConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Daemon endpoint, e.g. `http://127.0.0.1:8000`.
    pub daemon_addr: String,
    /// How long to sleep between polls while the queue is empty.
    pub poll_interval: Duration,
    /// How often a running job is cross-checked with the daemon.
    pub liveness_interval: Duration,
    /// Idle time after which the worker deregisters and exits.
    pub idle_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL when stopping a job.
    pub kill_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            daemon_addr: daemon_uri(SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))),
            poll_interval: Duration::from_secs(1),
            liveness_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    pub fn new(daemon_addr: impl Into<String>) -> Self {
        Self {
            daemon_addr: daemon_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_liveness_interval(mut self, liveness_interval: Duration) -> Self {
        self.liveness_interval = liveness_interval;
        self
    }
}

/// Build the `http://` URI a client uses to reach a daemon bound at `addr`.
pub fn daemon_uri(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_config_default() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8000");
        assert_eq!(cfg.output_dir, PathBuf::from("./outputs"));
    }

    #[test]
    fn daemon_config_new_keeps_default_output_dir() {
        let addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let cfg = DaemonConfig::new(addr).with_output_dir("/tmp/out");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.daemon_addr, "http://127.0.0.1:8000");
        assert_eq!(cfg.poll_interval, Duration::from_secs(1));
        assert_eq!(cfg.liveness_interval, Duration::from_millis(500));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn worker_config_builders() {
        let cfg = WorkerConfig::new("http://127.0.0.1:9000")
            .with_idle_timeout(Duration::from_millis(200))
            .with_poll_interval(Duration::from_millis(20))
            .with_liveness_interval(Duration::from_millis(10));
        assert_eq!(cfg.daemon_addr, "http://127.0.0.1:9000");
        assert_eq!(cfg.idle_timeout, Duration::from_millis(200));
        assert_eq!(cfg.poll_interval, Duration::from_millis(20));
        assert_eq!(cfg.liveness_interval, Duration::from_millis(10));
    }

    #[test]
    fn daemon_uri_formats_http() {
        let addr: SocketAddr = "127.0.0.1:8123".parse().unwrap();
        assert_eq!(daemon_uri(addr), "http://127.0.0.1:8123");
    }
}
