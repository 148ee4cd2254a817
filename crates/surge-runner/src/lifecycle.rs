use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use surge_core::{Backend, JobRequest, OrchestrationError, OrchestratorConfig, Outcome, RunTag, Stage};
use tracing::{error, info, info_span};

use crate::dispatch::{Cancellation, JobExecution};
use crate::ensemble::EnsembleCoordinator;
use crate::lock::ResourceLock;
use crate::runner::JobRunner;
use crate::stages::{RunOptions, StagePlan};
use crate::sync::StorageSyncEngine;
use crate::workspace::{self, CleanupReport, Publication};

/// Lines of remote log kept on a failure report.
const FAILURE_LOG_TAIL: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    /// `None` for stages that run on the orchestrator host.
    pub backend: Option<Backend>,
    pub outcome: Outcome,
    pub jobs: Vec<JobExecution>,
}

impl StageRecord {
    fn local(stage: Stage) -> Self {
        Self {
            stage,
            backend: None,
            outcome: Outcome::Succeeded,
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_tag: String,
    pub stages: Vec<StageRecord>,
    pub publication: Option<Publication>,
    pub cleanup: Option<CleanupReport>,
}

/// First fatal failure of a run. `error` is wrapped with the stage and run tag.
#[derive(Debug)]
pub struct RunFailure {
    pub stage: Stage,
    pub run_tag: String,
    /// Terminal state of the failing job, when a job got that far.
    pub outcome: Option<Outcome>,
    pub logs: Vec<String>,
    pub error: OrchestrationError,
    pub completed: Vec<StageRecord>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<RunFailure> for OrchestrationError {
    fn from(failure: RunFailure) -> Self {
        failure.error
    }
}

struct StageError {
    error: OrchestrationError,
    outcome: Option<Outcome>,
    logs: Vec<String>,
}

impl From<OrchestrationError> for StageError {
    fn from(error: OrchestrationError) -> Self {
        Self {
            error,
            outcome: None,
            logs: Vec::new(),
        }
    }
}

impl StageError {
    fn from_execution(execution: &JobExecution) -> Self {
        let error = execution.check().err().unwrap_or_else(|| {
            OrchestrationError::ExecutionFailure {
                job: execution.job.clone(),
                outcome: Outcome::Failed,
                detail: "job did not succeed".to_string(),
            }
        });
        Self {
            error,
            outcome: execution.outcome,
            logs: execution.logs.tail(FAILURE_LOG_TAIL).to_vec(),
        }
    }
}

type StageResult<T> = std::result::Result<T, StageError>;

/// Drives one run through `Init → Info → Mesh → Setup → Solve → Visualize →
/// Finalize → Cleanup`. The first stage that does not succeed halts the run;
/// nothing after it executes, so a failed run's directory is left in place.
pub struct RunLifecycle<'a> {
    config: &'a OrchestratorConfig,
    container: &'a dyn JobRunner,
    batch: Option<&'a dyn JobRunner>,
    sync: StorageSyncEngine,
    lock: ResourceLock,
    cancel: Cancellation,
}

impl<'a> RunLifecycle<'a> {
    pub fn new(
        config: &'a OrchestratorConfig,
        container: &'a dyn JobRunner,
        sync: StorageSyncEngine,
    ) -> Self {
        Self {
            config,
            container,
            batch: None,
            sync,
            lock: ResourceLock::new(&config.shared.lock_path),
            cancel: Cancellation::new(),
        }
    }

    pub fn with_batch(mut self, batch: &'a dyn JobRunner) -> Self {
        self.batch = Some(batch);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, options: &RunOptions) -> std::result::Result<RunReport, RunFailure> {
        let tag = options.run_tag().map_err(|error| RunFailure {
            stage: Stage::Init,
            run_tag: format!(
                "{}_{}_{}",
                options.storm_name, options.storm_year, options.run_id
            ),
            outcome: None,
            logs: Vec::new(),
            error,
            completed: Vec::new(),
        })?;
        let span = info_span!("run", run_tag = %tag);
        let _entered = span.enter();
        info!(
            ensemble = options.ensemble,
            hpc = options.use_hpc,
            "run started"
        );

        let plan = StagePlan::new(self.config, options);
        let mut report = RunReport {
            run_tag: tag.to_string(),
            stages: Vec::new(),
            publication: None,
            cleanup: None,
        };
        for stage in Stage::ALL {
            debug_assert_eq!(
                stage.predecessor(),
                report.stages.last().map(|r| r.stage),
                "stage {} started out of order",
                stage
            );
            info!(stage = %stage, "stage started");
            let result = match stage {
                Stage::Init => self.init(&tag, options),
                Stage::Info => self.remote(stage, &tag, &plan, vec![plan.info()]),
                Stage::Mesh => self.remote(stage, &tag, &plan, vec![plan.mesh()]),
                Stage::Setup => self.remote(stage, &tag, &plan, vec![plan.setup()]),
                Stage::Solve if options.ensemble => self.ensemble(&tag, options, &plan),
                Stage::Solve => {
                    self.remote(stage, &tag, &plan, vec![plan.deterministic_solve(&tag)])
                }
                Stage::Visualize => self.remote(stage, &tag, &plan, plan.visualize()),
                Stage::Finalize => self.finalize(&tag).map(|publication| {
                    report.publication = Some(publication);
                    StageRecord::local(stage)
                }),
                Stage::Cleanup => self.cleanup(&tag).map(|cleanup| {
                    report.cleanup = Some(cleanup);
                    StageRecord::local(stage)
                }),
            };
            match result {
                Ok(record) => {
                    info!(stage = %stage, jobs = record.jobs.len(), "stage succeeded");
                    report.stages.push(record);
                }
                Err(failure) => {
                    error!(
                        stage = %stage,
                        outcome = ?failure.outcome,
                        error = %failure.error,
                        "run halted"
                    );
                    return Err(RunFailure {
                        stage,
                        run_tag: tag.to_string(),
                        outcome: failure.outcome,
                        logs: failure.logs,
                        error: failure.error.in_stage(stage, &tag),
                        completed: report.stages,
                    });
                }
            }
        }
        info!("run finished");
        Ok(report)
    }

    fn init(&self, tag: &RunTag, options: &RunOptions) -> StageResult<StageRecord> {
        let store = self.sync.store().as_ref();
        self.lock
            .with_lock(|| workspace::bootstrap(store, self.config, tag, options))?;
        Ok(StageRecord::local(Stage::Init))
    }

    fn runner_for(&self, backend: Backend) -> StageResult<&'a dyn JobRunner> {
        match backend {
            Backend::Container => Ok(self.container),
            Backend::Batch => self.batch.ok_or_else(|| {
                StageError::from(OrchestrationError::Config(
                    "HPC backend requested but no batch scheduler is configured".to_string(),
                ))
            }),
        }
    }

    fn scratch_runs_root(&self) -> PathBuf {
        self.config.hpc.scratch_root.join(&self.config.shared.runs_dir)
    }

    fn staging_uri(&self) -> StageResult<&str> {
        let uri = self.config.hpc.staging_uri.trim();
        if uri.is_empty() {
            return Err(OrchestrationError::Config("hpc.staging_uri is not set".to_string()).into());
        }
        Ok(uri)
    }

    /// Shared filesystem → object store → HPC scratch.
    fn stage_in(&self, tag: &RunTag) -> StageResult<()> {
        let staging = self.staging_uri()?;
        self.sync.push(tag, &self.config.shared.runs_root(), staging)?;
        self.sync.pull(tag, staging, &self.scratch_runs_root())?;
        Ok(())
    }

    /// HPC scratch → object store → shared filesystem.
    fn stage_out(&self, tag: &RunTag) -> StageResult<()> {
        let staging = self.staging_uri()?;
        self.sync.push(tag, &self.scratch_runs_root(), staging)?;
        self.sync.pull(tag, staging, &self.config.shared.runs_root())?;
        Ok(())
    }

    /// Run the stage's jobs one after another on the stage's backend.
    fn remote(
        &self,
        stage: Stage,
        tag: &RunTag,
        plan: &StagePlan<'_>,
        requests: Vec<JobRequest>,
    ) -> StageResult<StageRecord> {
        let backend = plan.backend_for(stage);
        let runner = self.runner_for(backend)?;
        let staged = backend == Backend::Batch;
        if staged {
            self.stage_in(tag)?;
        }
        let mut jobs = Vec::with_capacity(requests.len());
        for request in &requests {
            let execution = runner.run(tag, request, &self.cancel)?;
            if !execution.is_success() {
                return Err(StageError::from_execution(&execution));
            }
            jobs.push(execution);
        }
        if staged {
            self.stage_out(tag)?;
        }
        Ok(StageRecord {
            stage,
            backend: Some(backend),
            outcome: Outcome::Succeeded,
            jobs,
        })
    }

    fn ensemble(
        &self,
        tag: &RunTag,
        options: &RunOptions,
        plan: &StagePlan<'_>,
    ) -> StageResult<StageRecord> {
        let backend = plan.backend_for(Stage::Solve);
        let runner = self.runner_for(backend)?;
        let staged = backend == Backend::Batch;
        if staged {
            self.stage_in(tag)?;
        }
        let solver = &self.config.solver;
        let coordinator = EnsembleCoordinator::new(
            runner,
            &solver.uncoupled_exec,
            solver.exec_for(options.couple_wind),
        );
        let fan_out = coordinator.run_ensemble(
            tag,
            &plan.solve_template(tag),
            &plan.ensemble_layout(tag),
            &self.cancel,
        )?;
        if let Some(member) = fan_out.first_failure() {
            let mut failure = StageError::from_execution(member);
            failure.outcome = Some(fan_out.outcome);
            return Err(failure);
        }
        fan_out.check()?;
        if staged {
            self.stage_out(tag)?;
        }
        let mut jobs = vec![fan_out.cold_start];
        jobs.extend(fan_out.hot_starts);
        Ok(StageRecord {
            stage: Stage::Solve,
            backend: Some(backend),
            outcome: fan_out.outcome,
            jobs,
        })
    }

    fn finalize(&self, tag: &RunTag) -> StageResult<Publication> {
        let run_dir = workspace::run_dir(&self.config.shared, tag);
        Ok(workspace::publish_results(
            self.sync.store().as_ref(),
            &run_dir,
            &self.config.aws.result_bucket,
            tag,
        )?)
    }

    fn cleanup(&self, tag: &RunTag) -> StageResult<CleanupReport> {
        let store = self.sync.store().as_ref();
        Ok(self
            .lock
            .with_lock(|| workspace::cleanup(store, self.config, tag))?)
    }
}
