use std::sync::Arc;

use surge_core::{Backend, JobRequest, OrchestrationError, Result, RunTag};

use crate::claim::ComputeClaimManager;
use crate::cloud::ClusterApi;
use crate::dispatch::{run_job, BatchDispatcher, Cancellation, ContainerDispatcher, JobExecution};

/// Runs one request to a finalized execution on one backend, including any
/// compute lease the backend needs. Selected once per stage by the lifecycle.
pub trait JobRunner: Send + Sync {
    fn backend(&self) -> Backend;

    /// `tag` names the compute claim; ensemble members pass their own
    /// derived tags so concurrent members never share instances.
    fn run(&self, tag: &RunTag, request: &JobRequest, cancel: &Cancellation)
        -> Result<JobExecution>;
}

/// Container backend: lease → bind → dispatch → release, per job.
pub struct ContainerRunner {
    claims: ComputeClaimManager,
    cluster: Arc<dyn ClusterApi>,
    dispatcher: ContainerDispatcher,
    placement_attribute: String,
}

impl ContainerRunner {
    pub fn new(
        claims: ComputeClaimManager,
        cluster: Arc<dyn ClusterApi>,
        dispatcher: ContainerDispatcher,
        placement_attribute: impl Into<String>,
    ) -> Self {
        Self {
            claims,
            cluster,
            dispatcher,
            placement_attribute: placement_attribute.into(),
        }
    }

    pub fn claims(&self) -> &ComputeClaimManager {
        &self.claims
    }
}

impl JobRunner for ContainerRunner {
    fn backend(&self) -> Backend {
        Backend::Container
    }

    fn run(
        &self,
        tag: &RunTag,
        request: &JobRequest,
        cancel: &Cancellation,
    ) -> Result<JobExecution> {
        let template_id = request.claim_template_id().ok_or_else(|| {
            OrchestrationError::Dispatch(format!(
                "container job {} has no launch template to claim",
                request.name()
            ))
        })?;
        self.claims.with_claim(tag, template_id, |claim| {
            self.claims.bind_to_cluster(
                claim,
                self.cluster.as_ref(),
                request.cluster_ref(),
                &self.placement_attribute,
            )?;
            run_job(&self.dispatcher, tag, request, cancel)
        })
    }
}

/// Batch backend: the scheduler owns placement, so there is nothing to lease.
pub struct BatchRunner {
    dispatcher: BatchDispatcher,
}

impl BatchRunner {
    pub fn new(dispatcher: BatchDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl JobRunner for BatchRunner {
    fn backend(&self) -> Backend {
        Backend::Batch
    }

    fn run(
        &self,
        tag: &RunTag,
        request: &JobRequest,
        cancel: &Cancellation,
    ) -> Result<JobExecution> {
        run_job(&self.dispatcher, tag, request, cancel)
    }
}
