//! Leaf types shared by the orchestrator: run identity, job requests,
//! argument templates, configuration and the error taxonomy.

pub mod args;
pub mod config;
pub mod error;
pub mod fs;
pub mod request;
pub mod stage;
pub mod tag;

pub use args::Arg;
pub use config::{load_config, OrchestratorConfig};
pub use error::{OrchestrationError, Result};
pub use request::{Backend, JobRequest, ResolvedCommand};
pub use stage::{Outcome, Stage};
pub use tag::RunTag;
