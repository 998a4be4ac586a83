mod context;
mod inventory;
mod jobs;
mod progress;
mod runner;
mod types;

pub use progress::ProgressCounter;
pub use runner::{Pipeline, PipelineHandle, StartError};
pub use types::{checking_jobs, deployment_jobs, JobKind, JobSpec, JobStatus, PipelineEvent};
