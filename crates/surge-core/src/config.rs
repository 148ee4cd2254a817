use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{OrchestrationError, Result};

/// Process-wide settings, loaded once at start-up and passed by reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub shared: SharedFsConfig,
    pub aws: AwsConfig,
    #[serde(default)]
    pub hpc: HpcConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    pub stages: StageProfiles,
    #[serde(default)]
    pub batch: BatchProfiles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedFsConfig {
    pub root: PathBuf,
    pub runs_dir: String,
    pub lock_path: PathBuf,
    pub cache_dir: String,
}

impl Default for SharedFsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/efs"),
            runs_dir: "hurricanes".to_string(),
            lock_path: PathBuf::from("/efs/.initfini.lock"),
            cache_dir: "cache".to_string(),
        }
    }
}

impl SharedFsConfig {
    pub fn runs_root(&self) -> PathBuf {
        self.root.join(&self.runs_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    #[serde(default = "default_tag_key")]
    pub tag_key: String,
    #[serde(default = "default_placement_attribute")]
    pub placement_attribute: String,
    #[serde(default = "default_log_group")]
    pub log_group: String,
    /// Object-store URI holding static inputs and the shared cache.
    pub static_uri: String,
    /// Bucket name for long-term results.
    pub result_bucket: String,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_tag_key() -> String {
    "Workflow Tag".to_string()
}

fn default_placement_attribute() -> String {
    "run-tag".to_string()
}

fn default_log_group() -> String {
    "odssm_ecs_task_docker_logs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    pub scratch_root: PathBuf,
    /// Object-store URI used to stage run data between the shared
    /// filesystem and HPC scratch.
    pub staging_uri: String,
    pub mesh_script: String,
    pub setup_script: String,
    pub solve_script: String,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            scratch_root: PathBuf::from("/lustre"),
            staging_uri: String::new(),
            mesh_script: "~/mesh.sbatch".to_string(),
            setup_script: "~/setup.sbatch".to_string(),
            solve_script: "~/schism.sbatch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Executable used when the wave model is coupled to the solver.
    pub coupled_exec: String,
    pub uncoupled_exec: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            coupled_exec: "pschism_WWM_PAHM_TVD-VL".to_string(),
            uncoupled_exec: "pschism_PAHM_TVD-VL".to_string(),
        }
    }
}

impl SolverConfig {
    pub fn exec_for(&self, couple_wind: bool) -> &str {
        if couple_wind {
            &self.coupled_exec
        } else {
            &self.uncoupled_exec
        }
    }
}

/// Container-backend profile of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStageConfig {
    pub cluster: String,
    pub template_id: String,
    pub task_definition: String,
    pub container: String,
    pub wait_delay_secs: u64,
    pub wait_max_attempts: u32,
    #[serde(default)]
    pub env_secrets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageProfiles {
    pub info: ContainerStageConfig,
    pub mesh: ContainerStageConfig,
    pub setup: ContainerStageConfig,
    pub solve: ContainerStageConfig,
    pub viz: ContainerStageConfig,
    pub ensemble_post: ContainerStageConfig,
}

impl StageProfiles {
    fn named(&self) -> [(&'static str, &ContainerStageConfig); 6] {
        [
            ("info", &self.info),
            ("mesh", &self.mesh),
            ("setup", &self.setup),
            ("solve", &self.solve),
            ("viz", &self.viz),
            ("ensemble_post", &self.ensemble_post),
        ]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchWait {
    pub wait_delay_secs: u64,
    pub wait_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchProfiles {
    pub mesh: BatchWait,
    pub setup: BatchWait,
    pub solve: BatchWait,
}

impl Default for BatchProfiles {
    fn default() -> Self {
        Self {
            mesh: BatchWait {
                wait_delay_secs: 30,
                wait_max_attempts: 240,
            },
            setup: BatchWait {
                wait_delay_secs: 30,
                wait_max_attempts: 120,
            },
            solve: BatchWait {
                wait_delay_secs: 60,
                wait_max_attempts: 240,
            },
        }
    }
}

impl OrchestratorConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: OrchestratorConfig = serde_yaml::from_str(raw)
            .map_err(|e| OrchestrationError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        for (name, stage) in self.stages.named() {
            if stage.cluster.trim().is_empty() {
                problems.push(format!("stages.{}.cluster", name));
            }
            if stage.template_id.trim().is_empty() {
                problems.push(format!("stages.{}.template_id", name));
            }
            if stage.task_definition.trim().is_empty() {
                problems.push(format!("stages.{}.task_definition", name));
            }
            if stage.container.trim().is_empty() {
                problems.push(format!("stages.{}.container", name));
            }
            if stage.wait_max_attempts == 0 {
                problems.push(format!("stages.{}.wait_max_attempts", name));
            }
        }
        for (name, wait) in [
            ("mesh", &self.batch.mesh),
            ("setup", &self.batch.setup),
            ("solve", &self.batch.solve),
        ] {
            if wait.wait_max_attempts == 0 {
                problems.push(format!("batch.{}.wait_max_attempts", name));
            }
        }
        if self.aws.static_uri.trim().is_empty() {
            problems.push("aws.static_uri".to_string());
        }
        if self.aws.result_bucket.trim().is_empty() {
            problems.push("aws.result_bucket".to_string());
        }
        if self.shared.runs_dir.is_empty() || self.shared.runs_dir.contains('/') {
            problems.push("shared.runs_dir".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::Config(format!(
                "missing or invalid fields: {}",
                problems.join(", ")
            )))
        }
    }
}

pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        OrchestrationError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    OrchestratorConfig::from_yaml_str(&raw)
}

/// Commented starting point written by `surge init`.
pub const CONFIG_TEMPLATE: &str = "\
shared:
  root: /efs
  runs_dir: hurricanes
  lock_path: /efs/.initfini.lock
  cache_dir: cache
aws:
  tag_key: Workflow Tag
  placement_attribute: run-tag
  log_group: odssm_ecs_task_docker_logs
  static_uri: ''                  # REQUIRED: e.g. s3://my-static-bucket
  result_bucket: ''               # REQUIRED: bucket name for final results
hpc:
  scratch_root: /lustre
  staging_uri: ''                 # REQUIRED for --hpc: e.g. s3://bucket/prefix
  mesh_script: ~/mesh.sbatch
  setup_script: ~/setup.sbatch
  solve_script: ~/schism.sbatch
solver:
  coupled_exec: pschism_WWM_PAHM_TVD-VL
  uncoupled_exec: pschism_PAHM_TVD-VL
stages:
  info:
    cluster: ''                   # REQUIRED
    template_id: ''               # REQUIRED: launch template id
    task_definition: odssm-info
    container: info
    wait_delay_secs: 60
    wait_max_attempts: 20
  mesh:
    cluster: ''
    template_id: ''
    task_definition: odssm-mesh
    container: mesh
    wait_delay_secs: 60
    wait_max_attempts: 180
  setup:
    cluster: ''
    template_id: ''
    task_definition: odssm-prep
    container: prep
    wait_delay_secs: 60
    wait_max_attempts: 180
    env_secrets: [CDSAPI_URL, CDSAPI_KEY]
  solve:
    cluster: ''
    template_id: ''
    task_definition: odssm-solve
    container: solve
    wait_delay_secs: 60
    wait_max_attempts: 240
  viz:
    cluster: ''
    template_id: ''
    task_definition: odssm-post
    container: post
    wait_delay_secs: 20
    wait_max_attempts: 45
  ensemble_post:
    cluster: ''
    template_id: ''
    task_definition: odssm-prep
    container: prep
    wait_delay_secs: 60
    wait_max_attempts: 90
batch:
  mesh: { wait_delay_secs: 30, wait_max_attempts: 240 }
  setup: { wait_delay_secs: 30, wait_max_attempts: 120 }
  solve: { wait_delay_secs: 60, wait_max_attempts: 240 }
";

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_template() -> String {
        CONFIG_TEMPLATE
            .replace("static_uri: ''", "static_uri: s3://static")
            .replace("result_bucket: ''", "result_bucket: results")
            .replace("cluster: ''", "cluster: odssm-cluster")
            .replace("template_id: ''", "template_id: lt-0abc")
    }

    #[test]
    fn template_with_required_fields_parses() {
        let config = OrchestratorConfig::from_yaml_str(&filled_template()).expect("config");
        assert_eq!(config.stages.info.wait_max_attempts, 20);
        assert_eq!(config.stages.setup.env_secrets, vec!["CDSAPI_URL", "CDSAPI_KEY"]);
        assert_eq!(config.shared.runs_root(), PathBuf::from("/efs/hurricanes"));
        assert_eq!(config.solver.exec_for(true), "pschism_WWM_PAHM_TVD-VL");
    }

    #[test]
    fn unfilled_template_reports_every_missing_field() {
        let err = OrchestratorConfig::from_yaml_str(CONFIG_TEMPLATE).expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("stages.info.cluster"), "{}", msg);
        assert!(msg.contains("stages.viz.template_id"), "{}", msg);
        assert!(msg.contains("aws.static_uri"), "{}", msg);
        assert!(!msg.contains("stages.info.container"), "{}", msg);
    }

    #[test]
    fn zero_attempt_budget_is_rejected() {
        let raw = filled_template().replace("wait_max_attempts: 45", "wait_max_attempts: 0");
        let err = OrchestratorConfig::from_yaml_str(&raw).expect_err("should fail");
        assert!(err.to_string().contains("stages.viz.wait_max_attempts"));
    }
}
