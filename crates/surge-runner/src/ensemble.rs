use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::thread;

use serde::Serialize;
use surge_core::{JobRequest, OrchestrationError, Outcome, Result, RunTag};
use tracing::{info, warn};

use crate::dispatch::{Cancellation, JobExecution};
use crate::runner::JobRunner;

/// Where an ensemble lives. `ensemble_dir` is relative to `data_root` and is
/// the form handed to the jobs; discovery lists `data_root/ensemble_dir/runs/*`.
#[derive(Debug, Clone)]
pub struct EnsembleLayout {
    pub data_root: PathBuf,
    pub ensemble_dir: String,
}

impl EnsembleLayout {
    pub fn spinup_dir(&self) -> String {
        format!("{}/spinup", self.ensemble_dir.trim_end_matches('/'))
    }

    pub fn member_dir(&self, name: &str) -> String {
        format!("{}/runs/{}", self.ensemble_dir.trim_end_matches('/'), name)
    }

    /// Hot-start run directory names in sorted order.
    pub fn discover_runs(&self) -> Result<Vec<String>> {
        let runs = self.data_root.join(&self.ensemble_dir).join("runs");
        let entries = fs::read_dir(&runs).map_err(|e| {
            OrchestrationError::Dispatch(format!(
                "cannot list ensemble runs under {}: {}",
                runs.display(),
                e
            ))
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// One cold start and its hot starts, with the aggregate verdict.
#[derive(Debug, Clone, Serialize)]
pub struct EnsembleFanOut {
    pub cold_start: JobExecution,
    pub hot_starts: Vec<JobExecution>,
    pub outcome: Outcome,
}

impl EnsembleFanOut {
    /// `Succeeded` iff every member succeeded; any `Failed` wins over
    /// `TimedOut`. A failed cold start decides the group on its own.
    pub fn aggregate(cold_start: &JobExecution, hot_starts: &[JobExecution]) -> Outcome {
        match cold_start.outcome {
            Some(Outcome::Succeeded) => {}
            Some(other) => return other,
            None => return Outcome::Failed,
        }
        let outcomes: Vec<Outcome> = hot_starts
            .iter()
            .map(|h| h.outcome.unwrap_or(Outcome::Failed))
            .collect();
        if outcomes.contains(&Outcome::Failed) {
            Outcome::Failed
        } else if outcomes.contains(&Outcome::TimedOut) {
            Outcome::TimedOut
        } else {
            Outcome::Succeeded
        }
    }

    /// First non-successful member, cold start first.
    pub fn first_failure(&self) -> Option<&JobExecution> {
        std::iter::once(&self.cold_start)
            .chain(self.hot_starts.iter())
            .find(|e| !e.is_success())
    }

    pub fn check(&self) -> Result<()> {
        match self.first_failure() {
            Some(member) => member.check(),
            None if self.outcome.is_success() => Ok(()),
            None => Err(OrchestrationError::ExecutionFailure {
                job: self.cold_start.job.clone(),
                outcome: self.outcome,
                detail: "ensemble did not succeed".to_string(),
            }),
        }
    }
}

/// Runs the solve stage as a fan-out: one spin-up, then one hot start per
/// discovered run directory, concurrently.
///
/// The base request carries `{run_dir}` and `{exec}` placeholders that are
/// bound per member.
pub struct EnsembleCoordinator<'a> {
    runner: &'a dyn JobRunner,
    spinup_exec: String,
    hotstart_exec: String,
}

impl<'a> EnsembleCoordinator<'a> {
    pub fn new(
        runner: &'a dyn JobRunner,
        spinup_exec: impl Into<String>,
        hotstart_exec: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            spinup_exec: spinup_exec.into(),
            hotstart_exec: hotstart_exec.into(),
        }
    }

    pub fn run_ensemble(
        &self,
        tag: &RunTag,
        base: &JobRequest,
        layout: &EnsembleLayout,
        cancel: &Cancellation,
    ) -> Result<EnsembleFanOut> {
        let cold_request = base
            .renamed(format!("{}-spinup", base.name()))
            .with_var("run_dir", layout.spinup_dir())
            .with_var("exec", &self.spinup_exec);
        info!(run_tag = %tag, "submitting ensemble cold start");
        let cold_start = self.runner.run(&tag.member("spinup")?, &cold_request, cancel)?;

        if !cold_start.is_success() {
            let outcome = EnsembleFanOut::aggregate(&cold_start, &[]);
            warn!(run_tag = %tag, outcome = %outcome, "cold start did not succeed; no hot starts submitted");
            return Ok(EnsembleFanOut {
                cold_start,
                hot_starts: Vec::new(),
                outcome,
            });
        }

        let runs = layout.discover_runs()?;
        if runs.is_empty() {
            warn!(run_tag = %tag, dir = %layout.ensemble_dir, "no hot-start run directories found");
        }
        let suffixes = member_suffixes(&runs)?;
        info!(run_tag = %tag, members = runs.len(), "submitting ensemble hot starts");

        let hot_starts: Vec<JobExecution> = thread::scope(|scope| {
            let handles: Vec<_> = runs
                .iter()
                .zip(&suffixes)
                .map(|(name, suffix)| {
                    let request = base
                        .renamed(format!("{}-{}", base.name(), name))
                        .with_var("run_dir", layout.member_dir(name))
                        .with_var("exec", &self.hotstart_exec);
                    let handle = scope.spawn(move || {
                        let member_tag = tag.member(suffix)?;
                        self.runner.run(&member_tag, &request, cancel)
                    });
                    (name, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(name, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(OrchestrationError::Dispatch(
                            "hot-start worker panicked".to_string(),
                        ))
                    });
                    result.unwrap_or_else(|e| {
                        warn!(run_tag = %tag, member = %name, error = %e, "hot start could not be dispatched");
                        let request = base.renamed(format!("{}-{}", base.name(), name));
                        JobExecution::rejected(tag, &request, e.to_string())
                    })
                })
                .collect()
        });

        let outcome = EnsembleFanOut::aggregate(&cold_start, &hot_starts);
        info!(run_tag = %tag, outcome = %outcome, "ensemble finished");
        Ok(EnsembleFanOut {
            cold_start,
            hot_starts,
            outcome,
        })
    }
}

/// Run directory names become part of a compute tag; map anything outside
/// the tag charset to `-`.
fn tag_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '-' })
        .collect()
}

/// Claim-tag suffix per member. Two run directories that map to the same
/// suffix would share compute claims, so that is rejected up front.
fn member_suffixes(runs: &[String]) -> Result<Vec<String>> {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    let mut suffixes = Vec::with_capacity(runs.len());
    for name in runs {
        let suffix = tag_safe(name);
        if let Some(other) = seen.insert(suffix.clone(), name) {
            return Err(OrchestrationError::Dispatch(format!(
                "ensemble run directories {:?} and {:?} both map to member tag suffix {:?}",
                other, name, suffix
            )));
        }
        suffixes.push(suffix);
    }
    Ok(suffixes)
}
