use std::fs::{self, File};
use std::net::SocketAddr;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ExitCode, Stdio};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use batchd::client::DaemonClient;
use batchd::config::{daemon_uri, DaemonConfig, WorkerConfig, DEFAULT_OUTPUT_DIR};
use batchd::daemon::Daemon;
use batchd::error::BatchError;
use batchd::grpc::GrpcServer;
use batchd::process;
use batchd::scheduler::{JobFilter, JobSpec};
use batchd::shutdown::install_shutdown_handler;
use batchd::wire::{self, JobSummary, ListQuery};
use batchd::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "batchd")]
#[command(version)]
#[command(about = "A lightweight batch-job scheduler")]
#[command(propagate_version = true)]
struct Args {
    /// Daemon address
    #[arg(
        long,
        short = 'a',
        global = true,
        env = "BATCHD_ADDR",
        default_value = "127.0.0.1:8000"
    )]
    addr: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a shell command as a job
    Submit {
        /// The command to execute (e.g., "python3 train.py")
        command: String,

        /// Higher priorities are dispatched first
        #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,

        /// Job name (derived from the command if omitted)
        #[arg(short, long)]
        name: Option<String>,

        /// Directory for the job's .out/.err files
        #[arg(long, env = "BATCHD_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },

    /// List jobs
    List {
        #[command(flatten)]
        filter: FilterArgs,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Cancel every job matching the filters
    Cancel {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show registered workers and queue counts
    ClusterStatus {
        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Start the daemon or a worker
    Start {
        #[arg(value_enum)]
        target: Target,

        /// Run in this process instead of detaching
        #[arg(long)]
        foreground: bool,

        /// Default output directory for jobs (daemon only)
        #[arg(long, env = "BATCHD_OUTPUT_DIR", default_value = DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Seconds a worker may stay idle before exiting (worker only)
        #[arg(long, default_value_t = 300)]
        idle_timeout: u64,

        /// Where detached processes write their logs
        #[arg(long, default_value = "./logs")]
        log_dir: PathBuf,
    },

    /// Stop the daemon or workers
    Stop {
        #[arg(value_enum, required_unless_present = "all")]
        target: Option<Target>,

        /// Stop every worker, then the daemon
        #[arg(long, conflicts_with_all = ["target", "id"])]
        all: bool,

        /// Daemon: stop even with pending or running jobs. Worker: SIGKILL.
        #[arg(long)]
        force: bool,

        /// Worker pid (all workers if omitted)
        #[arg(long)]
        id: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Target {
    Daemon,
    Worker,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Args, Debug, Clone)]
struct FilterArgs {
    /// Only jobs owned by the current user
    #[arg(long)]
    mine: bool,

    /// Job ID (UUID)
    #[arg(long)]
    job: Option<String>,

    /// Job name
    #[arg(long)]
    name: Option<String>,

    /// Owner user name
    #[arg(long)]
    user: Option<String>,

    /// Job type (e.g. shell)
    #[arg(long = "type")]
    kind: Option<String>,

    /// Job status
    #[arg(long)]
    status: Option<String>,

    /// Include finished and failed jobs
    #[arg(long)]
    finished: bool,
}

impl FilterArgs {
    fn is_empty(&self) -> bool {
        !self.mine
            && self.job.is_none()
            && self.name.is_none()
            && self.user.is_none()
            && self.kind.is_none()
            && self.status.is_none()
    }

    fn to_query(&self) -> Result<ListQuery, BatchError> {
        Ok(ListQuery {
            mine: self.mine,
            filter: JobFilter {
                id: self.job.as_deref().map(wire::parse_job_id).transpose()?,
                name: self.name.clone(),
                owner: self.user.clone(),
                kind: self.kind.clone(),
                status: self.status.as_deref().map(str::parse).transpose()?,
                include_finished: self.finished,
            },
        })
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobListItem {
    job_id: String,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    status: String,
    owner: Option<String>,
    priority: i32,
    created_at: String,
    start_time: Option<String>,
    end_time: Option<String>,
    runtime: Option<String>,
    exit_code: Option<i32>,
    command: String,
}

impl From<&JobSummary> for JobListItem {
    fn from(job: &JobSummary) -> Self {
        Self {
            job_id: job.id.to_string(),
            name: job.name.clone(),
            kind: job.kind.clone(),
            status: job.status.to_string(),
            owner: job.owner.clone(),
            priority: job.priority,
            created_at: wire::format_timestamp(&job.created_at),
            start_time: job.start_time.as_ref().map(wire::format_timestamp),
            end_time: job.end_time.as_ref().map(wire::format_timestamp),
            runtime: job.runtime_secs.map(wire::format_runtime),
            exit_code: job.exit_code,
            command: job.command.clone(),
        }
    }
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: u32,
    status: String,
    current_job_id: Option<String>,
    started_at: String,
    uptime: String,
}

/// Who is asking, shown above the cluster summary.
#[derive(Serialize)]
struct ClientInfo {
    date_time: String,
    user: String,
    pid: u32,
}

impl ClientInfo {
    fn current() -> Self {
        Self {
            date_time: wire::format_timestamp(&chrono::Utc::now()),
            user: process::current_user(),
            pid: std::process::id(),
        }
    }
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    client: ClientInfo,
    pending_jobs: u32,
    running_jobs: u32,
    workers: Vec<WorkerOutput>,
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

/// One-line message for an error, never a backtrace.
fn describe_error(err: &(dyn std::error::Error + 'static), addr: SocketAddr) -> String {
    match err.downcast_ref::<BatchError>() {
        Some(e) if e.is_unreachable() => format!("daemon not running at {}", addr),
        Some(BatchError::JobNotFound(id)) => format!("job {} not found", id),
        Some(BatchError::WorkerNotFound(id)) => format!("worker {} not found", id),
        _ => err.to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let head: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

async fn connect(addr: SocketAddr) -> Result<DaemonClient, BatchError> {
    DaemonClient::connect(daemon_uri(addr)).await
}

async fn is_reachable(addr: SocketAddr) -> bool {
    match connect(addr).await {
        Ok(mut client) => client.num_pending_jobs().await.is_ok(),
        Err(_) => false,
    }
}

/// Poll until a daemon answers on `addr` or `timeout` passes.
async fn wait_until_reachable(addr: SocketAddr, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if is_reachable(addr).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

// =============================================================================
// Daemon and Worker Processes
// =============================================================================

async fn run_daemon(addr: SocketAddr, output_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = DaemonConfig::new(addr).with_output_dir(output_dir);
    tracing::info!(
        listen_addr = %config.listen_addr,
        output_dir = %config.output_dir.display(),
        "Starting batchd daemon"
    );

    let token = CancellationToken::new();
    install_shutdown_handler(token.clone())?;
    let daemon = Arc::new(Daemon::with_shutdown(config, token));
    let server = GrpcServer::bind(daemon).await?;
    server.run().await?;
    Ok(())
}

async fn run_worker(addr: SocketAddr, idle_timeout: u64) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config =
        WorkerConfig::new(daemon_uri(addr)).with_idle_timeout(Duration::from_secs(idle_timeout));
    let token = CancellationToken::new();
    install_shutdown_handler(token.clone())?;

    let worker = Worker::connect(config).await?;
    worker.run(token).await?;
    Ok(())
}

/// Re-run this binary in the foreground mode, detached into its own process
/// group with output going to `log_path`. Returns the child pid.
fn spawn_detached(args: &[String], log_path: &Path) -> Result<u32, Box<dyn std::error::Error>> {
    let log = File::create(log_path)?;
    let child = std::process::Command::new(std::env::current_exe()?)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .process_group(0)
        .spawn()?;
    Ok(child.id())
}

async fn handle_start(
    addr: SocketAddr,
    target: Target,
    output_dir: PathBuf,
    idle_timeout: u64,
    log_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(&log_dir)?;
    let mut args = vec!["--addr".to_string(), addr.to_string(), "start".to_string()];

    match target {
        Target::Daemon => {
            if is_reachable(addr).await {
                return Err(BatchError::AlreadyBound(addr).into());
            }
            args.extend([
                "daemon".to_string(),
                "--foreground".to_string(),
                "--output-dir".to_string(),
                output_dir.to_string_lossy().into_owned(),
            ]);
            let log_path = log_dir.join("daemon.log");
            let pid = spawn_detached(&args, &log_path)?;

            if !wait_until_reachable(addr, Duration::from_secs(5)).await {
                return Err(format!(
                    "daemon (pid {}) did not come up, see {}",
                    pid,
                    log_path.display()
                )
                .into());
            }
            println!("Daemon started on {} (pid {})", addr, pid);
            println!("Log: {}", log_path.display());
        }
        Target::Worker => {
            // Fail fast with the usual message when there is no daemon.
            connect(addr).await?.num_pending_jobs().await?;

            args.extend([
                "worker".to_string(),
                "--foreground".to_string(),
                "--idle-timeout".to_string(),
                idle_timeout.to_string(),
            ]);
            let staging = log_dir.join(format!("worker-starting-{}.log", std::process::id()));
            let pid = spawn_detached(&args, &staging)?;
            let log_path = log_dir.join(format!("worker-{}.log", pid));
            fs::rename(&staging, &log_path)?;

            println!("Worker started (pid {})", pid);
            println!("Log: {}", log_path.display());
        }
    }
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(
    client: &mut DaemonClient,
    command: String,
    priority: i32,
    name: Option<String>,
    output_dir: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut spec = JobSpec::shell(command)
        .with_priority(priority)
        .with_owner(process::current_user());
    if let Some(name) = name {
        spec = spec.with_name(name);
    }
    if let Some(dir) = output_dir {
        // Resolved here so the worker writes where the submitter expects.
        let dir = if dir.is_relative() {
            std::env::current_dir()?.join(dir)
        } else {
            dir
        };
        spec = spec.with_output_dir(dir);
    }

    let job_id = client.submit(&spec).await?;
    println!("Job submitted: {}", job_id);
    Ok(())
}

async fn handle_list(
    client: &mut DaemonClient,
    filter: &FilterArgs,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = client
        .list_jobs(&process::current_user(), &filter.to_query()?)
        .await?;
    let items: Vec<JobListItem> = jobs.iter().map(JobListItem::from).collect();

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<16} {:<6} {:<10} {:<10} {:>4} {:<18} {:<12} {:>4}  COMMAND",
                "JOB ID", "NAME", "TYPE", "STATUS", "OWNER", "PRI", "CREATED", "RUNTIME", "EXIT"
            );
            println!("{}", "-".repeat(136));
            for job in &items {
                println!(
                    "{:<38} {:<16} {:<6} {:<10} {:<10} {:>4} {:<18} {:<12} {:>4}  {}",
                    job.job_id,
                    truncate(&job.name, 16),
                    job.kind,
                    job.status,
                    truncate(job.owner.as_deref().unwrap_or("-"), 10),
                    job.priority,
                    job.created_at,
                    job.runtime.as_deref().unwrap_or("-"),
                    job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                    truncate(&job.command, 40),
                );
            }
        }
    }
    Ok(())
}

async fn handle_cancel(
    client: &mut DaemonClient,
    filter: &FilterArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if filter.is_empty() {
        return Err(
            "cancel needs at least one filter (--mine, --job, --name, --user, --type, --status)"
                .into(),
        );
    }

    let jobs = client
        .list_jobs(&process::current_user(), &filter.to_query()?)
        .await?;
    if jobs.is_empty() {
        println!("No matching jobs.");
        return Ok(());
    }

    for job in jobs {
        match client.cancel(&job.id).await {
            Ok(previous) => println!("Cancelled job {} ({}, was {})", job.id, job.name, previous),
            // Finished and was removed since listing.
            Err(BatchError::JobNotFound(_)) => println!("Job {} already gone", job.id),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn handle_cluster_status(
    client: &mut DaemonClient,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let client_info = ClientInfo::current();
    let snapshot = client.cluster_status().await?;
    let workers: Vec<WorkerOutput> = snapshot
        .workers
        .into_iter()
        .map(|w| WorkerOutput {
            worker_id: w.worker_id,
            status: w.status,
            current_job_id: w.current_job_id,
            started_at: wire::format_timestamp(&w.started_at),
            uptime: wire::format_runtime(w.uptime_secs),
        })
        .collect();

    match output_format {
        OutputFormat::Json => {
            let output = ClusterStatusOutput {
                client: client_info,
                pending_jobs: snapshot.pending_jobs,
                running_jobs: snapshot.running_jobs,
                workers,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Date-time:   {}", client_info.date_time);
            println!("User:        {}", client_info.user);
            println!("Client pid:  {}", client_info.pid);
            println!();
            println!("Pending jobs: {}", snapshot.pending_jobs);
            println!("Running jobs: {}", snapshot.running_jobs);
            println!();
            if workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<10} {:<8} {:<38} {:<18} UPTIME",
                "PID", "STATUS", "CURRENT JOB", "STARTED"
            );
            println!("{}", "-".repeat(90));
            for w in &workers {
                println!(
                    "{:<10} {:<8} {:<38} {:<18} {}",
                    w.worker_id,
                    w.status,
                    w.current_job_id.as_deref().unwrap_or("-"),
                    w.started_at,
                    w.uptime
                );
            }
        }
    }
    Ok(())
}

async fn stop_daemon(
    client: &mut DaemonClient,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    client.shutdown(force).await?;
    println!("Daemon at {} is shutting down", client.addr());
    Ok(())
}

async fn stop_workers(
    client: &mut DaemonClient,
    force: bool,
    id: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    let ids = match id {
        Some(id) => vec![id],
        None => client
            .cluster_status()
            .await?
            .workers
            .into_iter()
            .map(|w| w.worker_id)
            .collect(),
    };
    if ids.is_empty() {
        println!("No workers registered.");
    }
    for worker_id in ids {
        if force {
            client.deregister_worker(worker_id).await?;
            process::force_kill(worker_id)?;
            println!("Killed worker {}", worker_id);
        } else {
            client.kill_worker(worker_id).await?;
            println!("Stopping worker {}", worker_id);
        }
    }
    Ok(())
}

async fn handle_stop(
    client: &mut DaemonClient,
    target: Option<Target>,
    all: bool,
    force: bool,
    id: Option<u32>,
) -> Result<(), Box<dyn std::error::Error>> {
    match target {
        // Workers first, the daemon is needed to find them.
        _ if all => {
            stop_workers(client, force, None).await?;
            stop_daemon(client, force).await
        }
        Some(Target::Daemon) => stop_daemon(client, force).await,
        Some(Target::Worker) => stop_workers(client, force, id).await,
        None => Err("stop needs a target (daemon or worker) or --all".into()),
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args.addr;
    match args.command {
        Commands::Start {
            target,
            foreground: true,
            output_dir,
            idle_timeout,
            ..
        } => match target {
            Target::Daemon => run_daemon(addr, output_dir).await,
            Target::Worker => run_worker(addr, idle_timeout).await,
        },
        Commands::Start {
            target,
            output_dir,
            idle_timeout,
            log_dir,
            ..
        } => handle_start(addr, target, output_dir, idle_timeout, log_dir).await,
        Commands::Submit {
            command,
            priority,
            name,
            output_dir,
        } => handle_submit(&mut connect(addr).await?, command, priority, name, output_dir).await,
        Commands::List { filter, output } => {
            handle_list(&mut connect(addr).await?, &filter, &output).await
        }
        Commands::Cancel { filter } => handle_cancel(&mut connect(addr).await?, &filter).await,
        Commands::ClusterStatus { output } => {
            handle_cluster_status(&mut connect(addr).await?, &output).await
        }
        Commands::Stop {
            target,
            all,
            force,
            id,
        } => handle_stop(&mut connect(addr).await?, target, all, force, id).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        // Usage errors exit with 1, unlike clap's own `exit()`.
        Err(e) if e.use_stderr() => {
            eprint!("{}", e.render());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            print!("{}", e.render());
            return ExitCode::SUCCESS;
        }
    };

    let addr = args.addr;
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", describe_error(&*e, addr));
            ExitCode::FAILURE
        }
    }
}
