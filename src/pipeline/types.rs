/// Job lifecycle. Terminal once Passed or Failed within a run; a job skipped
/// by the abort flag stays NotStarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    NotStarted,
    Running,
    Passed,
    Failed,
}

/// The closed set of pipeline steps. New steps are additions here, not new
/// types; the runner dispatches on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    PreparePlaybooks,
    InstallAnsible,
    InstallDocker,
    CheckComputing,
    CheckNetwork,
    CheckStorage,
    DeployOps,
    DeployChain,
    DeployExplorer,
}

/// One weighted, sequenced unit of the checking or deployment pipeline. The
/// weight is this step's share of the run's 0-100 progress range.
#[derive(Debug, Clone, Copy)]
pub struct JobSpec {
    pub kind: JobKind,
    pub name: &'static str,
    pub weight: u32,
}

const fn job(kind: JobKind, name: &'static str, weight: u32) -> JobSpec {
    JobSpec { kind, name, weight }
}

/// The pre-deployment checking pipeline, in execution order.
pub fn checking_jobs() -> Vec<JobSpec> {
    vec![
        job(JobKind::PreparePlaybooks, "prepare playbooks", 30),
        job(JobKind::InstallAnsible, "install ansible", 15),
        job(JobKind::InstallDocker, "install docker", 10),
        job(JobKind::CheckComputing, "check computing resources", 10),
        job(JobKind::CheckNetwork, "check network resources", 25),
        job(JobKind::CheckStorage, "check storage resources", 10),
    ]
}

/// The deployment pipeline, in execution order.
pub fn deployment_jobs() -> Vec<JobSpec> {
    vec![
        job(JobKind::DeployOps, "deploy ops platform", 25),
        job(JobKind::DeployChain, "deploy chain nodes", 50),
        job(JobKind::DeployExplorer, "deploy chain explorer", 25),
    ]
}

/// What the pipeline reports to its observer: ordered, at-least-once, one
/// `Finished` per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// Append a log line.
    Log(String),
    /// Replace the most recent log line (upload progress).
    LogOverwrite(String),
    /// One human-readable result line per completed or failed action.
    Summary { passed: bool, message: String },
    /// Cumulative run progress, 0-100.
    Progress(u8),
    /// The run is over; no further events follow.
    Finished { all_passed: bool },
}
