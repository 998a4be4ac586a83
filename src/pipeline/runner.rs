use anyhow::Context;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ChainConfig, Resources};
use crate::topology::ClusterTopology;

use super::context::{time_stamp, Emitter, RunContext};
use super::jobs::run_job;
use super::progress::ProgressCounter;
use super::types::{JobSpec, JobStatus, PipelineEvent};

/// Rejections at the caller boundary, before any remote work starts.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("the cluster does not meet the deployment schema")]
    SchemaNotMet,
}

/// Shared state of one run: the abort flag, the progress counter and the job
/// statuses. Only the worker writes; observers read snapshots.
pub(super) struct RunState {
    pub(super) aborted: AtomicBool,
    pub(super) progress: ProgressCounter,
    names: Vec<&'static str>,
    statuses: Mutex<Vec<JobStatus>>,
}

impl RunState {
    fn new(jobs: &[JobSpec]) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            progress: ProgressCounter::new(),
            names: jobs.iter().map(|job| job.name).collect(),
            statuses: Mutex::new(vec![JobStatus::NotStarted; jobs.len()]),
        }
    }

    fn statuses_lock(&self) -> MutexGuard<'_, Vec<JobStatus>> {
        match self.statuses.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("recovering job status store from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    fn set_status(&self, index: usize, status: JobStatus) {
        let mut statuses = self.statuses_lock();
        if let Some(entry) = statuses.get_mut(index) {
            *entry = status;
        }
    }

    fn snapshot(&self) -> Vec<(&'static str, JobStatus)> {
        let statuses = self.statuses_lock();
        self.names.iter().copied().zip(statuses.iter().copied()).collect()
    }

    fn all_passed(&self) -> bool {
        let statuses = self.statuses_lock();
        !statuses.is_empty() && statuses.iter().all(|status| *status == JobStatus::Passed)
    }
}

/// An ordered job list bound to one topology for one run. Jobs execute
/// strictly sequentially on a single blocking worker; shared run state is
/// only ever written from that worker.
pub struct Pipeline {
    jobs: Vec<JobSpec>,
}

impl Pipeline {
    pub fn checking() -> Self {
        Self::new(super::types::checking_jobs())
    }

    pub fn deployment() -> Self {
        Self::new(super::types::deployment_jobs())
    }

    pub fn new(jobs: Vec<JobSpec>) -> Self {
        assert!(!jobs.is_empty(), "a pipeline needs at least one job");
        Self { jobs }
    }

    /// Spawns the run. Rejected outright while the topology does not meet
    /// its schema; nothing is contacted in that case.
    pub fn start(
        self,
        mut topology: ClusterTopology,
        config: ChainConfig,
        resources: Resources,
    ) -> Result<PipelineHandle, StartError> {
        if !topology.schema_satisfied() {
            return Err(StartError::SchemaNotMet);
        }

        let run_id = random_hex(4);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(RunState::new(&self.jobs));
        let worker_state = state.clone();
        let jobs = self.jobs;

        let worker = tokio::task::spawn_blocking(move || {
            run_all(&run_id, &jobs, &mut topology, &config, &resources, &events_tx, &worker_state);
            topology
        });

        Ok(PipelineHandle {
            events: events_rx,
            state,
            worker,
        })
    }
}

fn run_all(
    run_id: &str,
    jobs: &[JobSpec],
    topology: &mut ClusterTopology,
    config: &ChainConfig,
    resources: &Resources,
    events: &mpsc::UnboundedSender<PipelineEvent>,
    state: &RunState,
) {
    tracing::info!(run_id, jobs = jobs.len(), "pipeline run started");
    for (index, job) in jobs.iter().enumerate() {
        if state.aborted.load(Ordering::SeqCst) {
            // Skipped, not failed: the remaining jobs stay NotStarted.
            break;
        }
        state.set_status(index, JobStatus::Running);
        let out = Emitter::new(events, &state.aborted, &state.progress, job.weight);
        out.log(format!("========== {} starting {} ==========", time_stamp(), job.name));

        let mut ctx = RunContext {
            topology,
            config,
            resources,
            out,
        };
        match run_job(job.kind, &mut ctx) {
            Ok(()) => state.set_status(index, JobStatus::Passed),
            Err(_failed) => {
                // The failing sub-step already summarized and set the abort flag.
                state.set_status(index, JobStatus::Failed);
                tracing::error!(run_id, job = job.name, "job failed; aborting the run");
            }
        }
    }

    let all_passed = state.all_passed();
    if all_passed {
        let value = state.progress.complete();
        let _ = events.send(PipelineEvent::Progress(value));
    }
    topology.close_all();
    let _ = events.send(PipelineEvent::Finished { all_passed });
    tracing::info!(run_id, all_passed, "pipeline run finished");
}

/// Live view of a running (or finished) pipeline: drain the events, then
/// join to get the topology back with its sessions closed.
pub struct PipelineHandle {
    events: mpsc::UnboundedReceiver<PipelineEvent>,
    state: Arc<RunState>,
    worker: JoinHandle<ClusterTopology>,
}

impl PipelineHandle {
    /// Next event, or `None` once the run is over and the channel drained.
    pub async fn next_event(&mut self) -> Option<PipelineEvent> {
        self.events.recv().await
    }

    pub fn progress(&self) -> u8 {
        self.state.progress.value()
    }

    pub fn job_statuses(&self) -> Vec<(&'static str, JobStatus)> {
        self.state.snapshot()
    }

    pub fn all_passed(&self) -> bool {
        self.state.all_passed()
    }

    pub async fn join(self) -> anyhow::Result<ClusterTopology> {
        self.worker.await.context("pipeline worker panicked")
    }
}

fn random_hex(bytes: usize) -> String {
    let mut raw = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeployPlan;
    use crate::topology::CapacityTargets;

    fn empty_custom_plan() -> DeployPlan {
        // Schema satisfied with zero hosts everywhere: every job then fails
        // fast on the missing ops host without touching the network.
        serde_json::from_str(r#"{ "schema": "custom", "custom": {}, "hosts": [] }"#)
            .expect("parse plan")
    }

    #[test]
    #[should_panic(expected = "at least one job")]
    fn an_empty_pipeline_is_a_contract_violation() {
        let _ = Pipeline::new(Vec::new());
    }

    #[tokio::test]
    async fn start_rejects_an_unsatisfied_schema() {
        let topology = ClusterTopology::new(CapacityTargets::test_single());
        let plan = empty_custom_plan();
        let result = Pipeline::checking().start(
            topology,
            ChainConfig::default(),
            plan.resources(None),
        );
        assert!(matches!(result, Err(StartError::SchemaNotMet)));
    }

    #[tokio::test]
    async fn a_failed_job_short_circuits_the_rest_of_the_run() {
        let plan = empty_custom_plan();
        let topology = plan.build_topology().expect("topology");
        let mut handle = Pipeline::checking()
            .start(topology, ChainConfig::default(), plan.resources(None))
            .expect("start");

        let mut failed_summaries = 0;
        let mut finished = None;
        let mut max_progress = 0u8;
        while let Some(event) = handle.next_event().await {
            match event {
                PipelineEvent::Summary { passed: false, .. } => failed_summaries += 1,
                PipelineEvent::Progress(value) => max_progress = max_progress.max(value),
                PipelineEvent::Finished { all_passed } => finished = Some(all_passed),
                _ => {}
            }
        }

        assert_eq!(failed_summaries, 1);
        assert_eq!(finished, Some(false));
        assert_eq!(max_progress, 0);
        assert!(!handle.all_passed());

        let statuses = handle.job_statuses();
        assert_eq!(statuses[0].1, JobStatus::Failed);
        for (_, status) in &statuses[1..] {
            assert_eq!(*status, JobStatus::NotStarted);
        }

        let topology = handle.join().await.expect("join");
        assert!(topology.is_empty());
    }

    #[tokio::test]
    async fn progress_only_reaches_100_through_completion() {
        // Statically: weighted advances pin at 99 (progress.rs tests); here we
        // check a failed run never emits 100 nor Finished{true}.
        let plan = empty_custom_plan();
        let topology = plan.build_topology().expect("topology");
        let mut handle = Pipeline::deployment()
            .start(topology, ChainConfig::default(), plan.resources(None))
            .expect("start");

        while let Some(event) = handle.next_event().await {
            match event {
                PipelineEvent::Progress(value) => assert!(value < 100),
                PipelineEvent::Finished { all_passed } => assert!(!all_passed),
                _ => {}
            }
        }
        handle.join().await.expect("join");
    }
}
