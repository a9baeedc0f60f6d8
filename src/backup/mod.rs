mod artifact;
pub mod compression;
mod dump;
mod job;
mod retry;
pub mod scheduler;

pub use artifact::Artifact;
pub use dump::{DumpExecutor, Dumper};
pub use job::{BackupEngine, TriggerOutcome};
pub use retry::RetryPolicy;
pub use scheduler::{JobState, ScheduledJob, Scheduler};
