use chrono::Local;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::UnboundedSender;

use crate::config::{ChainConfig, Resources};
use crate::host::RemoteHost;
use crate::topology::ClusterTopology;

use super::progress::ProgressCounter;
use super::types::PipelineEvent;

/// Marker for a sub-step that failed: the failure summary has been emitted
/// and the abort flag is already set by the time this propagates.
pub(super) struct StepFailed;

pub(super) type StepResult = Result<(), StepFailed>;

pub(super) fn time_stamp() -> String {
    format!("[{}]", Local::now().format("%H:%M:%S"))
}

/// Event emission plus the shared abort/progress state for the job that is
/// currently running. Split from the topology so job bodies can hold a host
/// mutably while still reporting.
pub(super) struct Emitter<'a> {
    events: &'a UnboundedSender<PipelineEvent>,
    aborted: &'a AtomicBool,
    progress: &'a ProgressCounter,
    weight: u32,
}

impl<'a> Emitter<'a> {
    pub(super) fn new(
        events: &'a UnboundedSender<PipelineEvent>,
        aborted: &'a AtomicBool,
        progress: &'a ProgressCounter,
        weight: u32,
    ) -> Self {
        Self {
            events,
            aborted,
            progress,
            weight,
        }
    }

    pub(super) fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn emit(&self, event: PipelineEvent) {
        // Observers may be gone; the run itself must not care.
        let _ = self.events.send(event);
    }

    pub(super) fn log(&self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("{line}");
        self.emit(PipelineEvent::Log(line));
    }

    pub(super) fn log_overwrite(&self, line: impl Into<String>) {
        self.emit(PipelineEvent::LogOverwrite(line.into()));
    }

    pub(super) fn summary(&self, passed: bool, message: impl Into<String>) {
        let message = message.into();
        if passed {
            tracing::debug!("{message}");
        } else {
            tracing::error!("{message}");
        }
        self.emit(PipelineEvent::Summary {
            passed,
            message: format!("{} {message}", time_stamp()),
        });
    }

    /// Records the failure summary and trips the run-wide abort flag.
    pub(super) fn fail(&self, message: impl Into<String>) {
        self.summary(false, message);
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub(super) fn progress_forward(&self, delta: u32) {
        let value = self.progress.advance(delta, self.weight);
        self.emit(PipelineEvent::Progress(value));
    }
}

/// Everything one job invocation works with; owned by the pipeline worker
/// for the run's lifetime, never process-wide.
pub(super) struct RunContext<'a> {
    pub(super) topology: &'a mut ClusterTopology,
    pub(super) config: &'a ChainConfig,
    pub(super) resources: &'a Resources,
    pub(super) out: Emitter<'a>,
}

/// The ops-master host automation operations are launched from. Failing to
/// find one is a job failure, not a panic: a custom schema may legitimately
/// have an empty ops tier.
pub(super) fn ops_host<'t>(
    topology: &'t mut ClusterTopology,
    out: &Emitter<'_>,
) -> Result<&'t mut RemoteHost, StepFailed> {
    let Some(address) = topology.first_ops_address() else {
        out.fail("no ops-master host is assigned in the topology");
        return Err(StepFailed);
    };
    let Some(host) = topology.host_mut(&address) else {
        out.fail("no ops-master host is assigned in the topology");
        return Err(StepFailed);
    };
    Ok(host)
}

/// Streams a remote command, logging every output line, then summarizes by
/// exit code. Non-zero exit records the failure and aborts the run.
pub(super) fn exec_logged(
    out: &Emitter<'_>,
    host: &mut RemoteHost,
    description: &str,
    command: &str,
) -> StepResult {
    let mut stream = match host.exec_streamed(command) {
        Ok(stream) => stream,
        Err(err) => {
            out.fail(format!("{{{}}} {description} failed: {err:#}", host.address()));
            return Err(StepFailed);
        }
    };
    out.log(format!("{{{}}} {description} >>", host.address()));
    if let Err(err) = stream.stream_lines(|line| out.log(format!("| {line}"))) {
        out.fail(format!("{{{}}} {description} failed: {err:#}", host.address()));
        return Err(StepFailed);
    }
    let exit_code = stream.finish();
    if exit_code == 0 {
        out.summary(true, format!("{{{}}} {description} succeeded", host.address()));
        Ok(())
    } else {
        out.fail(format!(
            "{{{}}} {description} failed (exit {exit_code})",
            host.address()
        ));
        Err(StepFailed)
    }
}

/// Uploads an archive (overwriting one progress line as bytes move), then
/// tails the remote extraction pipeline.
pub(super) fn upload_extract(
    out: &Emitter<'_>,
    host: &mut RemoteHost,
    description: &str,
    local_archive: &Path,
    remote_dir: &str,
) -> StepResult {
    let address = host.address().to_string();
    out.log(format!("{{{address}}} uploading {description} >>>"));
    // Blank line for the first overwrite to replace.
    out.log("");
    let mut on_progress = |transferred: u64, total: u64| {
        let percent = if total == 0 {
            100.0
        } else {
            transferred as f64 * 100.0 / total as f64
        };
        out.log_overwrite(format!(
            "| uploaded {:.2}MB/{:.2}MB ({percent:.1}%)",
            transferred as f64 / 1_048_576.0,
            total as f64 / 1_048_576.0,
        ));
    };
    let mut stream = match host.unarchive(local_archive, remote_dir, Some(&mut on_progress)) {
        Ok(stream) => stream,
        Err(err) => {
            out.fail(format!("{{{address}}} uploading {description} failed: {err:#}"));
            return Err(StepFailed);
        }
    };
    out.log(format!("{{{address}}} extracting {description}"));
    if let Err(err) = stream.stream_lines(|line| out.log(format!("| {line}"))) {
        out.fail(format!("{{{address}}} extracting {description} failed: {err:#}"));
        return Err(StepFailed);
    }
    if stream.finish() != 0 {
        out.fail(format!("{{{address}}} extracting {description} failed"));
        return Err(StepFailed);
    }
    out.summary(
        true,
        format!("{{{address}}} uploaded and extracted {description}"),
    );
    out.log(format!("{{{address}}} extracted {description}"));
    Ok(())
}

/// Runs a named automation playbook from the resolved playbooks directory on
/// the ops host; success is exit code 0.
pub(super) fn run_playbook(ctx: &mut RunContext<'_>, description: &str, playbook: &str) -> StepResult {
    if ctx.out.aborted() {
        return Ok(());
    }
    let host = ops_host(ctx.topology, &ctx.out)?;
    let playbooks_dir = host.resolve_home_path(&ctx.resources.playbooks_dir);
    let command = format!("cd {playbooks_dir} && ansible-playbook {playbook}.yml");
    exec_logged(&ctx.out, host, description, &command)
}
