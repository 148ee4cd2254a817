use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::args::{resolve_all, Arg};
use crate::error::{OrchestrationError, Result};
use crate::tag::RunTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Container tasks on a cluster of leased, tagged instances.
    Container,
    /// Script submissions to an HPC batch scheduler.
    Batch,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Container => "container",
            Backend::Batch => "batch",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to run one remote job. Built once, then only read.
///
/// For the container backend `cluster_ref` is the cluster, `resource_ref` the
/// task definition and `program` the container whose command is overridden.
/// For the batch backend `program` is the submitted script and `workdir` the
/// run-scoped working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    name: String,
    backend: Backend,
    cluster_ref: String,
    resource_ref: String,
    program: String,
    #[serde(default)]
    claim_template: Option<String>,
    #[serde(default)]
    workdir: Option<Arg>,
    argv: Vec<Arg>,
    #[serde(default)]
    env: BTreeMap<String, Arg>,
    #[serde(default)]
    env_secrets: Vec<String>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
    wait_delay_secs: u64,
    wait_max_attempts: u32,
}

/// Argument list and environment with every template substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

impl JobRequest {
    pub fn container(
        name: impl Into<String>,
        cluster: impl Into<String>,
        task_definition: impl Into<String>,
        container: impl Into<String>,
    ) -> Self {
        Self::new(
            name.into(),
            Backend::Container,
            cluster.into(),
            task_definition.into(),
            container.into(),
        )
    }

    pub fn batch(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(name.into(), Backend::Batch, String::new(), String::new(), script.into())
    }

    fn new(
        name: String,
        backend: Backend,
        cluster_ref: String,
        resource_ref: String,
        program: String,
    ) -> Self {
        Self {
            name,
            backend,
            cluster_ref,
            resource_ref,
            program,
            claim_template: None,
            workdir: None,
            argv: Vec::new(),
            env: BTreeMap::new(),
            env_secrets: Vec::new(),
            vars: BTreeMap::new(),
            wait_delay_secs: 60,
            wait_max_attempts: 150,
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn env_secrets<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.env_secrets.extend(names);
        self
    }

    pub fn claim_template(mut self, template_id: impl Into<String>) -> Self {
        self.claim_template = Some(template_id.into());
        self
    }

    pub fn workdir(mut self, workdir: impl Into<Arg>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn wait(mut self, delay_secs: u64, max_attempts: u32) -> Self {
        self.wait_delay_secs = delay_secs;
        self.wait_max_attempts = max_attempts;
        self
    }

    /// Copy of this request with one template variable bound.
    pub fn with_var(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.vars.insert(key.into(), value.into());
        next
    }

    /// Copy of this request under a different display name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.name = name.into();
        next
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn cluster_ref(&self) -> &str {
        &self.cluster_ref
    }

    pub fn resource_ref(&self) -> &str {
        &self.resource_ref
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn claim_template_id(&self) -> Option<&str> {
        self.claim_template.as_deref()
    }

    pub fn argv(&self) -> &[Arg] {
        &self.argv
    }

    pub fn env_secret_names(&self) -> &[String] {
        &self.env_secrets
    }

    pub fn wait_delay(&self) -> Duration {
        Duration::from_secs(self.wait_delay_secs)
    }

    pub fn wait_max_attempts(&self) -> u32 {
        self.wait_max_attempts
    }

    /// Substitutes templates and reads secret values from the process
    /// environment. A missing secret makes the request unroutable.
    pub fn resolve(&self, tag: &RunTag) -> Result<ResolvedCommand> {
        self.resolve_with(tag, |name| std::env::var(name).ok())
    }

    pub fn resolve_with<F>(&self, tag: &RunTag, lookup_secret: F) -> Result<ResolvedCommand>
    where
        F: Fn(&str) -> Option<String>,
    {
        let argv = resolve_all(&self.argv, tag, &self.vars)?;
        let mut env = Vec::with_capacity(self.env.len() + self.env_secrets.len());
        for (key, value) in &self.env {
            env.push((key.clone(), value.resolve(tag, &self.vars)?));
        }
        for name in &self.env_secrets {
            let value = lookup_secret(name).ok_or_else(|| {
                OrchestrationError::Dispatch(format!(
                    "secret {} required by job {} is not set",
                    name, self.name
                ))
            })?;
            env.push((name.clone(), value));
        }
        let workdir = match &self.workdir {
            Some(w) => Some(w.resolve(tag, &self.vars)?),
            None => None,
        };
        Ok(ResolvedCommand { argv, env, workdir })
    }
}
