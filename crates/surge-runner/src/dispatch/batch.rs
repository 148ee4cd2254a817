use std::sync::Arc;

use surge_core::{Backend, JobRequest, OrchestrationError, Result, RunTag};

use super::{Classification, JobDispatcher, JobExecution, JobPhase, JobStatus, LogStream};

/// HPC batch scheduler collaborator. [`crate::slurm::SlurmCli`] is the real one.
pub trait BatchScheduler: Send + Sync {
    /// Submit `script` with positional `args`; `env` is exported to the job.
    /// Returns the scheduler's job id.
    fn submit(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> Result<String>;

    /// Recorded state of the job and each of its steps. Empty while the
    /// scheduler has no accounting record yet.
    fn job_states(&self, job_id: &str) -> Result<Vec<String>>;

    fn cancel(&self, job_id: &str) -> Result<()>;

    /// Contents of the job's completion log file.
    fn completion_log(&self, job_id: &str, workdir: Option<&str>) -> Result<Vec<String>>;
}

/// States during which a job or step may still change.
const ACTIVE_STATES: &[&str] = &[
    "PENDING",
    "RUNNING",
    "REQUEUED",
    "CONFIGURING",
    "COMPLETING",
    "SUSPENDED",
    "RESIZING",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Active,
    Completed,
    Failed(Vec<String>),
}

/// Fold per-step scheduler states into one verdict. Any active step keeps the
/// job active; otherwise every step must be `COMPLETED`. `NODE_FAIL` and other
/// terminal states are failures. Suffixes such as `CANCELLED by 1234` are
/// ignored.
pub fn classify_states(states: &[String]) -> BatchState {
    let normalized: Vec<&str> = states
        .iter()
        .filter_map(|s| s.split_whitespace().next())
        .map(|s| s.trim_end_matches('+'))
        .collect();
    if normalized.is_empty() || normalized.iter().any(|s| ACTIVE_STATES.contains(s)) {
        return BatchState::Active;
    }
    let failed: Vec<String> = normalized
        .iter()
        .filter(|s| **s != "COMPLETED")
        .map(|s| s.to_string())
        .collect();
    if failed.is_empty() {
        BatchState::Completed
    } else {
        BatchState::Failed(failed)
    }
}

pub struct BatchDispatcher {
    scheduler: Arc<dyn BatchScheduler>,
}

impl BatchDispatcher {
    pub fn new(scheduler: Arc<dyn BatchScheduler>) -> Self {
        Self { scheduler }
    }
}

impl JobDispatcher for BatchDispatcher {
    fn backend(&self) -> Backend {
        Backend::Batch
    }

    fn submit(&self, tag: &RunTag, request: &JobRequest) -> Result<JobExecution> {
        let mut execution = JobExecution::new(tag, request);
        execution.advance(JobPhase::Submitting);
        if request.backend() != Backend::Batch {
            return Err(OrchestrationError::Dispatch(format!(
                "job {} targets the {} backend",
                request.name(),
                request.backend()
            )));
        }
        let resolved = request.resolve(tag)?;
        let job_id = self.scheduler.submit(
            request.program(),
            &resolved.argv,
            &resolved.env,
            resolved.workdir.as_deref(),
        )?;
        if job_id.trim().is_empty() {
            return Err(OrchestrationError::Dispatch(format!(
                "scheduler returned no job id for {}",
                request.name()
            )));
        }
        execution.remote_job_id = Some(job_id);
        execution.workdir = resolved.workdir;
        execution.advance(JobPhase::Dispatched);
        Ok(execution)
    }

    fn query(&self, execution: &JobExecution) -> Result<JobStatus> {
        let states = self.scheduler.job_states(execution.remote_id()?)?;
        match classify_states(&states) {
            BatchState::Active => Ok(JobStatus::Running(states.join(","))),
            _ => Ok(JobStatus::Stopped),
        }
    }

    fn classify(&self, execution: &JobExecution) -> Result<Classification> {
        let states = self.scheduler.job_states(execution.remote_id()?)?;
        Ok(match classify_states(&states) {
            BatchState::Completed => Classification::succeeded(),
            BatchState::Failed(failed) => {
                Classification::failed(format!("job steps ended as {}", failed.join(", ")))
            }
            BatchState::Active => Classification::failed("job became active again after stopping"),
        })
    }

    fn fetch_logs(&self, execution: &JobExecution) -> Result<LogStream> {
        let lines = self
            .scheduler
            .completion_log(execution.remote_id()?, execution.workdir.as_deref())?;
        Ok(LogStream {
            lines,
            complete: true,
        })
    }

    fn kill(&self, execution: &JobExecution) -> Result<()> {
        self.scheduler.cancel(execution.remote_id()?)
    }
}
