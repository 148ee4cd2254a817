//! Submit / poll / classify / log retrieval for remote jobs.
//!
//! Both backends share one state machine:
//! `Pending → Submitting → Dispatched → Polling → {Succeeded | Failed |
//! TimedOut} → LogsRetrieved → Finalized`. Backend specifics live behind
//! [`JobDispatcher`]; the bounded poll loop and the terminal handling are
//! provided once here.

pub mod batch;
pub mod container;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use surge_core::{Backend, JobRequest, OrchestrationError, Outcome, Result, RunTag};
use tracing::{debug, info, info_span, warn};

pub use batch::{BatchDispatcher, BatchScheduler};
pub use container::ContainerDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Pending,
    Submitting,
    Dispatched,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
    LogsRetrieved,
    Finalized,
}

impl From<Outcome> for JobPhase {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => JobPhase::Succeeded,
            Outcome::Failed => JobPhase::Failed,
            Outcome::TimedOut => JobPhase::TimedOut,
        }
    }
}

/// Captured remote output. `complete` is false when a later page could not be
/// fetched; the lines gathered so far are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogStream {
    pub lines: Vec<String>,
    pub complete: bool,
}

impl LogStream {
    /// Last `n` lines, for error reports.
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.lines.len().saturating_sub(n);
        &self.lines[start..]
    }
}

/// Result of one status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Still running; carries the backend's state text for logging.
    Running(String),
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub outcome: Outcome,
    pub detail: String,
}

impl Classification {
    pub fn succeeded() -> Self {
        Self {
            outcome: Outcome::Succeeded,
            detail: String::new(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            detail: detail.into(),
        }
    }
}

/// One remote job from submission to finalization.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecution {
    pub job: String,
    pub backend: Backend,
    pub run_tag: String,
    pub remote_job_id: Option<String>,
    pub phase: JobPhase,
    pub outcome: Option<Outcome>,
    pub detail: Option<String>,
    pub status_queries: u32,
    #[serde(skip)]
    pub logs: LogStream,
    #[serde(skip)]
    pub request: JobRequest,
    /// Resolved working directory (batch backend).
    #[serde(skip)]
    pub workdir: Option<String>,
}

impl JobExecution {
    pub fn new(tag: &RunTag, request: &JobRequest) -> Self {
        Self {
            job: request.name().to_string(),
            backend: request.backend(),
            run_tag: tag.to_string(),
            remote_job_id: None,
            phase: JobPhase::Pending,
            outcome: None,
            detail: None,
            status_queries: 0,
            logs: LogStream::default(),
            request: request.clone(),
            workdir: None,
        }
    }

    /// Execution for a request that never reached the backend.
    pub fn rejected(tag: &RunTag, request: &JobRequest, detail: impl Into<String>) -> Self {
        let mut execution = Self::new(tag, request);
        execution.finish(Outcome::Failed, detail);
        execution.advance(JobPhase::Finalized);
        execution
    }

    pub fn advance(&mut self, phase: JobPhase) {
        debug!(job = %self.job, from = ?self.phase, to = ?phase, "job phase");
        self.phase = phase;
    }

    fn finish(&mut self, outcome: Outcome, detail: impl Into<String>) {
        let detail = detail.into();
        self.outcome = Some(outcome);
        self.detail = (!detail.is_empty()).then_some(detail);
        self.advance(outcome.into());
    }

    pub fn remote_id(&self) -> Result<&str> {
        self.remote_job_id.as_deref().ok_or_else(|| {
            OrchestrationError::Dispatch(format!("job {} was never dispatched", self.job))
        })
    }

    pub fn is_success(&self) -> bool {
        self.outcome.map(|o| o.is_success()).unwrap_or(false)
    }

    /// Map a terminal state onto the error taxonomy.
    pub fn check(&self) -> Result<()> {
        match self.outcome {
            Some(Outcome::Succeeded) => Ok(()),
            Some(Outcome::TimedOut) => Err(OrchestrationError::PollTimeout {
                job: self.job.clone(),
                attempts: self.status_queries,
            }),
            Some(outcome) => Err(OrchestrationError::ExecutionFailure {
                job: self.job.clone(),
                outcome,
                detail: self.detail.clone().unwrap_or_default(),
            }),
            None => Err(OrchestrationError::Dispatch(format!(
                "job {} has no terminal state",
                self.job
            ))),
        }
    }
}

/// Cooperative cancellation shared by every poll loop of a run. A cancelled
/// loop ends as `TimedOut` and issues the same best-effort kill.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn sleep(&self, total: Duration) {
        let step = Duration::from_millis(500);
        let mut left = total;
        while !left.is_zero() && !self.is_cancelled() {
            let nap = left.min(step);
            thread::sleep(nap);
            left -= nap;
        }
    }
}

pub trait JobDispatcher: Send + Sync {
    fn backend(&self) -> Backend;

    /// Format and submit the backend invocation. An unroutable request is a
    /// `Dispatch` error and is never retried.
    fn submit(&self, tag: &RunTag, request: &JobRequest) -> Result<JobExecution>;

    /// One status query.
    fn query(&self, execution: &JobExecution) -> Result<JobStatus>;

    /// Decide success for a stopped job.
    fn classify(&self, execution: &JobExecution) -> Result<Classification>;

    fn fetch_logs(&self, execution: &JobExecution) -> Result<LogStream>;

    /// Stop request for a job that outlived its budget.
    fn kill(&self, execution: &JobExecution) -> Result<()>;

    /// Query every `wait_delay` until the job stops, at most
    /// `wait_max_attempts` times. Exhausting the budget (or cancellation)
    /// yields `TimedOut` plus exactly one kill request. A failed query counts
    /// as an attempt.
    fn poll(&self, execution: &mut JobExecution, cancel: &Cancellation) -> Outcome {
        execution.advance(JobPhase::Polling);
        let max_attempts = execution.request.wait_max_attempts().max(1);
        let delay = execution.request.wait_delay();
        let mut stopped = false;
        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                info!(job = %execution.job, "poll cancelled");
                break;
            }
            execution.status_queries = attempt;
            match self.query(execution) {
                Ok(JobStatus::Stopped) => {
                    stopped = true;
                    break;
                }
                Ok(JobStatus::Running(state)) => {
                    debug!(job = %execution.job, attempt, max_attempts, state = %state, "still running");
                }
                Err(e) => {
                    warn!(job = %execution.job, attempt, error = %e, "status query failed");
                }
            }
            if attempt < max_attempts {
                cancel.sleep(delay);
            }
        }

        if !stopped {
            let detail = if cancel.is_cancelled() {
                "cancelled".to_string()
            } else {
                format!("no terminal state after {} status queries", execution.status_queries)
            };
            execution.finish(Outcome::TimedOut, detail);
            if let Err(e) = self.kill(execution) {
                warn!(job = %execution.job, error = %e, "best-effort kill failed");
            }
            return Outcome::TimedOut;
        }

        let verdict = self.classify(execution).unwrap_or_else(|e| {
            Classification::failed(format!("could not classify stopped job: {}", e))
        });
        execution.finish(verdict.outcome, verdict.detail);
        verdict.outcome
    }
}

/// Drive one request through the full state machine. Only submission errors
/// are returned as `Err`; every terminal state, including failure, comes back
/// as a finalized execution so its logs stay available.
pub fn run_job<D>(
    dispatcher: &D,
    tag: &RunTag,
    request: &JobRequest,
    cancel: &Cancellation,
) -> Result<JobExecution>
where
    D: JobDispatcher + ?Sized,
{
    let span = info_span!(
        "job",
        run_tag = %tag,
        job = request.name(),
        backend = dispatcher.backend().as_str()
    );
    let _entered = span.enter();

    let mut execution = dispatcher.submit(tag, request)?;
    info!(remote_job_id = ?execution.remote_job_id, "job dispatched");
    let outcome = dispatcher.poll(&mut execution, cancel);
    info!(outcome = %outcome, status_queries = execution.status_queries, "job reached terminal state");

    match dispatcher.fetch_logs(&execution) {
        Ok(logs) => {
            for line in &logs.lines {
                info!(target: "surge::remote", run_tag = %tag, job = %execution.job, "{}", line);
            }
            if !logs.complete {
                warn!(lines = logs.lines.len(), "job logs are incomplete");
            }
            execution.logs = logs;
        }
        Err(e) => warn!(error = %e, "log retrieval failed"),
    }
    execution.advance(JobPhase::LogsRetrieved);
    execution.advance(JobPhase::Finalized);
    Ok(execution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Dispatcher whose job never stops; counts queries and kills.
    #[derive(Default)]
    struct StuckDispatcher {
        queries: Mutex<u32>,
        kills: Mutex<u32>,
        fail_queries: bool,
        stop_after: Option<u32>,
    }

    impl JobDispatcher for StuckDispatcher {
        fn backend(&self) -> Backend {
            Backend::Batch
        }

        fn submit(&self, tag: &RunTag, request: &JobRequest) -> Result<JobExecution> {
            let mut execution = JobExecution::new(tag, request);
            execution.remote_job_id = Some("42".to_string());
            execution.advance(JobPhase::Dispatched);
            Ok(execution)
        }

        fn query(&self, _execution: &JobExecution) -> Result<JobStatus> {
            let mut queries = self.queries.lock().expect("lock");
            *queries += 1;
            if self.fail_queries {
                return Err(OrchestrationError::backend("sacct", "timeout"));
            }
            match self.stop_after {
                Some(n) if *queries >= n => Ok(JobStatus::Stopped),
                _ => Ok(JobStatus::Running("RUNNING".to_string())),
            }
        }

        fn classify(&self, _execution: &JobExecution) -> Result<Classification> {
            Ok(Classification::succeeded())
        }

        fn fetch_logs(&self, _execution: &JobExecution) -> Result<LogStream> {
            Err(OrchestrationError::backend("cat slurm-42.out", "missing"))
        }

        fn kill(&self, _execution: &JobExecution) -> Result<()> {
            *self.kills.lock().expect("lock") += 1;
            Err(OrchestrationError::backend("scancel 42", "already gone"))
        }
    }

    fn request(attempts: u32) -> (RunTag, JobRequest) {
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        (tag, JobRequest::batch("solve", "~/schism.sbatch").wait(0, attempts))
    }

    #[test]
    fn never_terminal_job_gets_k_queries_then_one_kill() {
        for k in [1, 3, 7] {
            let dispatcher = StuckDispatcher::default();
            let (tag, req) = request(k);
            let execution =
                run_job(&dispatcher, &tag, &req, &Cancellation::new()).expect("dispatch");
            assert_eq!(*dispatcher.queries.lock().expect("lock"), k);
            assert_eq!(*dispatcher.kills.lock().expect("lock"), 1);
            assert_eq!(execution.outcome, Some(Outcome::TimedOut));
            assert_eq!(execution.phase, JobPhase::Finalized);
            assert!(matches!(
                execution.check(),
                Err(OrchestrationError::PollTimeout { attempts, .. }) if attempts == k
            ));
        }
    }

    #[test]
    fn failed_queries_still_consume_the_budget() {
        let dispatcher = StuckDispatcher {
            fail_queries: true,
            ..Default::default()
        };
        let (tag, req) = request(4);
        let execution = run_job(&dispatcher, &tag, &req, &Cancellation::new()).expect("dispatch");
        assert_eq!(*dispatcher.queries.lock().expect("lock"), 4);
        assert_eq!(execution.outcome, Some(Outcome::TimedOut));
    }

    #[test]
    fn stopping_job_is_classified_without_a_kill() {
        let dispatcher = StuckDispatcher {
            stop_after: Some(2),
            ..Default::default()
        };
        let (tag, req) = request(5);
        let execution = run_job(&dispatcher, &tag, &req, &Cancellation::new()).expect("dispatch");
        assert_eq!(*dispatcher.queries.lock().expect("lock"), 2);
        assert_eq!(*dispatcher.kills.lock().expect("lock"), 0);
        assert!(execution.is_success());
        assert!(execution.check().is_ok());
    }

    #[test]
    fn cancelled_poll_times_out_with_a_kill() {
        let dispatcher = StuckDispatcher::default();
        let (tag, req) = request(100);
        let cancel = Cancellation::new();
        cancel.cancel();
        let execution = run_job(&dispatcher, &tag, &req, &cancel).expect("dispatch");
        assert_eq!(*dispatcher.queries.lock().expect("lock"), 0);
        assert_eq!(*dispatcher.kills.lock().expect("lock"), 1);
        assert_eq!(execution.detail.as_deref(), Some("cancelled"));
    }
}
