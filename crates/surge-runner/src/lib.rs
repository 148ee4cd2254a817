//! Orchestration core: compute claims, job dispatch on the container and
//! batch backends, ensemble fan-out, symlink-preserving storage sync, the
//! shared-filesystem lock and the run lifecycle that ties them together.

pub mod aws;
pub mod claim;
pub mod cloud;
pub mod dispatch;
pub mod ensemble;
pub mod lifecycle;
pub mod lock;
mod process;
pub mod runner;
pub mod slurm;
pub mod stages;
pub mod store;
pub mod sync;
pub mod workspace;

#[cfg(test)]
mod fakes;

pub use aws::{AwsCli, AwsS3Store};
pub use claim::{ClaimStatus, ComputeClaim, ComputeClaimManager, ReleaseOutcome};
pub use dispatch::{
    run_job, BatchDispatcher, Cancellation, ContainerDispatcher, JobDispatcher, JobExecution,
    JobPhase,
};
pub use ensemble::{EnsembleCoordinator, EnsembleFanOut, EnsembleLayout};
pub use lifecycle::{RunFailure, RunLifecycle, RunReport, StageRecord};
pub use lock::ResourceLock;
pub use runner::{BatchRunner, ContainerRunner, JobRunner};
pub use slurm::SlurmCli;
pub use stages::{plan, MeshOptions, PlannedJob, PlannedStage, RunOptions, StagePlan};
pub use store::{FsMirrorStore, ObjectStore};
pub use sync::{StorageSyncEngine, SyncDirection, SyncSummary};
pub use workspace::{CleanupReport, Publication};
