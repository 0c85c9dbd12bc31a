pub mod job;
pub mod queue;
pub mod registry;

pub use job::{Job, JobKind, JobPatch, JobSpec, JobStatus, ShellJob};
pub use queue::{JobFilter, JobQueue};
pub use registry::{WorkerPatch, WorkerRecord, WorkerRegistry, WorkerStatus};
