use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use surge_core::config::CONFIG_TEMPLATE;
use surge_core::{load_config, OrchestrationError, OrchestratorConfig, RunTag};
use surge_runner::{
    workspace, AwsCli, AwsS3Store, BatchDispatcher, BatchRunner, Cancellation,
    ComputeClaimManager, ContainerDispatcher, ContainerRunner, MeshOptions, ResourceLock,
    RunFailure, RunLifecycle, RunOptions, SlurmCli, StorageSyncEngine, SyncDirection,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "surge", version, about = "Storm-surge simulation pipeline orchestrator")]
struct Cli {
    /// Orchestrator configuration file.
    #[arg(long, global = true, default_value = "surge.yaml")]
    config: PathBuf,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct TagArgs {
    storm_name: String,
    storm_year: u16,
    run_id: String,
}

impl TagArgs {
    fn tag(&self) -> Result<RunTag> {
        Ok(RunTag::new(&self.storm_name, self.storm_year, &self.run_id)?)
    }
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    tag: TagArgs,
    /// Run mesh, setup and solve on the HPC batch scheduler.
    #[arg(long)]
    hpc: bool,
    #[arg(long)]
    ensemble: bool,
    #[arg(long)]
    parametric_wind: bool,
    #[arg(long)]
    subset_mesh: bool,
    #[arg(long)]
    past_forecast: bool,
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    hours_before_landfall: i32,
    /// Couple the wave model to the solver.
    #[arg(long)]
    couple_wind: bool,
    #[arg(long, default_value_t = 40)]
    perturbations: u32,
    #[arg(long, default_value = "korobov")]
    sample_rule: String,
    /// Largest mesh element size.
    #[arg(long, default_value_t = 20000.0)]
    hmax: f64,
    #[arg(long, default_value_t = 1500.0)]
    hmin_low: f64,
    #[arg(long, default_value_t = 2e-3)]
    rate_low: f64,
    /// Elevation splitting the low and high resolution regions.
    #[arg(long, default_value_t = -200.0, allow_hyphen_values = true)]
    transition_elev: f64,
    #[arg(long, default_value_t = 300.0)]
    hmin_high: f64,
    #[arg(long, default_value_t = 1e-3)]
    rate_high: f64,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        let mut options =
            RunOptions::new(&self.tag.storm_name, self.tag.storm_year, &self.tag.run_id);
        options.use_hpc = self.hpc;
        options.ensemble = self.ensemble;
        options.parametric_wind = self.parametric_wind;
        options.subset_mesh = self.subset_mesh;
        options.past_forecast = self.past_forecast;
        options.hours_before_landfall = self.hours_before_landfall;
        options.couple_wind = self.couple_wind;
        options.ensemble_num_perturbations = self.perturbations;
        options.ensemble_sample_rule = self.sample_rule.clone();
        options.mesh = MeshOptions {
            hmax: self.hmax,
            hmin_low: self.hmin_low,
            rate_low: self.rate_low,
            transition_elev: self.transition_elev,
            hmin_high: self.hmin_high,
            rate_high: self.rate_high,
        };
        options
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole pipeline for one storm.
    Run {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print every stage's jobs and resolved arguments without running them.
    Plan {
        #[command(flatten)]
        run: RunArgs,
        #[arg(long)]
        json: bool,
    },
    /// Lease and tag compute instances for a run tag.
    Claim {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        template: String,
        #[arg(long)]
        json: bool,
    },
    /// Terminate every instance tagged with a run tag.
    Release {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        json: bool,
    },
    Push {
        #[command(flatten)]
        tag: TagArgs,
        /// Defaults to the shared runs directory.
        #[arg(long)]
        local_root: Option<PathBuf>,
        /// Defaults to `hpc.staging_uri`.
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        json: bool,
    },
    Pull {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        local_root: Option<PathBuf>,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a run's remote copy.
    DeleteRemote {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Remove a run directory and, if no other run remains, the shared root.
    Cleanup {
        #[command(flatten)]
        tag: TagArgs,
        #[arg(long)]
        json: bool,
    },
    /// Write a configuration template.
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli.config, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&error_to_json(&err));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(config_path: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run { run, json } => {
            let config = load_config(config_path)?;
            tracing::debug!(config = %config_path.display(), hpc = run.hpc, "configuration loaded");
            let options = run.options();
            let container = container_runner(&config);
            let batch = BatchRunner::new(BatchDispatcher::new(Arc::new(SlurmCli::new())));
            let cancel = Cancellation::new();
            let on_interrupt = cancel.clone();
            ctrlc::set_handler(move || {
                tracing::warn!("interrupt received; cancelling in-flight jobs");
                on_interrupt.cancel();
            })?;
            let mut lifecycle = RunLifecycle::new(&config, &container, sync_engine(&config))
                .with_cancellation(cancel);
            if options.use_hpc {
                lifecycle = lifecycle.with_batch(&batch);
            }
            let report = lifecycle.run(&options).map_err(anyhow::Error::new)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": serde_json::to_value(&report)?,
                })));
            }
            println!("run_tag: {}", report.run_tag);
            for stage in &report.stages {
                let backend = stage.backend.map(|b| b.as_str()).unwrap_or("local");
                println!(
                    "{}: {} ({}, {} jobs)",
                    stage.stage,
                    stage.outcome,
                    backend,
                    stage.jobs.len()
                );
            }
            if let Some(publication) = &report.publication {
                println!("published: {}", publication.remote);
            }
            if let Some(cleanup) = &report.cleanup {
                println!("cleanup: {}", serde_json::to_string(cleanup)?);
            }
        }
        Commands::Plan { run, json } => {
            let config = load_config(config_path)?;
            let planned = surge_runner::plan(&config, &run.options())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "run_tag": run.tag.tag()?.to_string(),
                    "stages": serde_json::to_value(&planned)?,
                })));
            }
            for stage in &planned {
                match stage.backend {
                    Some(backend) => println!("{} [{}]", stage.stage, backend),
                    None => println!("{} [local]", stage.stage),
                }
                for job in &stage.jobs {
                    println!("  {}: {}", job.name, job.argv.join(" "));
                    if !job.env.is_empty() {
                        println!("    env: {}", job.env.join(", "));
                    }
                    if let Some(workdir) = &job.workdir {
                        println!("    workdir: {}", workdir);
                    }
                }
            }
        }
        Commands::Claim {
            tag,
            template,
            json,
        } => {
            let config = load_config(config_path)?;
            let claim = claim_manager(&config).claim(&tag.tag()?, &template)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "claim",
                    "claim": serde_json::to_value(&claim)?,
                })));
            }
            println!("run_tag: {}", claim.run_tag);
            println!("instances: {}", claim.instance_ids.join(" "));
        }
        Commands::Release { tag, json } => {
            let config = load_config(config_path)?;
            let released = claim_manager(&config).release(&tag.tag()?)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "release",
                    "release": serde_json::to_value(&released)?,
                })));
            }
            println!("{:?}", released);
        }
        Commands::Push {
            tag,
            local_root,
            remote,
            json,
        } => {
            let config = load_config(config_path)?;
            let local_root = local_root.unwrap_or_else(|| config.shared.runs_root());
            let remote = remote_or_staging(remote, &config)?;
            let summary = sync_engine(&config).push(&tag.tag()?, &local_root, &remote)?;
            return Ok(sync_output(SyncDirection::Push, &remote, &local_root, summary.links, json));
        }
        Commands::Pull {
            tag,
            local_root,
            remote,
            json,
        } => {
            let config = load_config(config_path)?;
            let local_root = local_root.unwrap_or_else(|| config.shared.runs_root());
            let remote = remote_or_staging(remote, &config)?;
            let summary = sync_engine(&config).pull(&tag.tag()?, &remote, &local_root)?;
            return Ok(sync_output(SyncDirection::Pull, &remote, &local_root, summary.links, json));
        }
        Commands::DeleteRemote { tag, remote, json } => {
            let config = load_config(config_path)?;
            let remote = remote_or_staging(remote, &config)?;
            let tag = tag.tag()?;
            sync_engine(&config).delete_remote(&tag, &remote)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "delete-remote",
                    "run_tag": tag.to_string(),
                    "remote": remote,
                })));
            }
            println!("deleted: {}/{}", remote.trim_end_matches('/'), tag);
        }
        Commands::Cleanup { tag, json } => {
            let config = load_config(config_path)?;
            let tag = tag.tag()?;
            let sync = sync_engine(&config);
            let report = ResourceLock::new(&config.shared.lock_path)
                .with_lock(|| workspace::cleanup(sync.store().as_ref(), &config, &tag))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "cleanup",
                    "run_tag": tag.to_string(),
                    "cleanup": serde_json::to_value(&report)?,
                })));
            }
            println!("cleanup: {}", serde_json::to_string(&report)?);
        }
        Commands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(config_path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", config_path.display());
            println!("next: fill in the REQUIRED fields, then `surge plan <storm> <year> <run-id>`");
        }
    }
    Ok(None)
}

fn claim_manager(config: &OrchestratorConfig) -> ComputeClaimManager {
    let aws = Arc::new(AwsCli::from_config(&config.aws));
    ComputeClaimManager::new(aws, &config.aws.tag_key)
}

fn container_runner(config: &OrchestratorConfig) -> ContainerRunner {
    let aws = Arc::new(AwsCli::from_config(&config.aws));
    let dispatcher = ContainerDispatcher::new(
        aws.clone(),
        aws.clone(),
        aws.clone(),
        &config.aws.tag_key,
        &config.aws.log_group,
    );
    ContainerRunner::new(
        claim_manager(config),
        aws,
        dispatcher,
        &config.aws.placement_attribute,
    )
}

fn sync_engine(config: &OrchestratorConfig) -> StorageSyncEngine {
    let store = AwsS3Store::new(AwsCli::from_config(&config.aws));
    StorageSyncEngine::new(Arc::new(store))
}

fn remote_or_staging(remote: Option<String>, config: &OrchestratorConfig) -> Result<String> {
    match remote {
        Some(remote) => Ok(remote),
        None if !config.hpc.staging_uri.trim().is_empty() => Ok(config.hpc.staging_uri.clone()),
        None => bail!("no --remote given and hpc.staging_uri is not set"),
    }
}

fn sync_output(
    direction: SyncDirection,
    remote: &str,
    local_root: &Path,
    links: usize,
    json: bool,
) -> Option<Value> {
    if json {
        let command = match direction {
            SyncDirection::Push => "push",
            SyncDirection::Pull => "pull",
        };
        return Some(json!({
            "ok": true,
            "command": command,
            "direction": direction,
            "remote": remote,
            "local_root": local_root.display().to_string(),
            "links": links,
        }));
    }
    println!("remote: {}", remote);
    println!("local_root: {}", local_root.display());
    println!("links: {}", links);
    None
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_to_json(err: &anyhow::Error) -> Value {
    if let Some(failure) = err.downcast_ref::<RunFailure>() {
        return json_error(
            failure.error.code(),
            failure.to_string(),
            json!({
                "stage": failure.stage,
                "run_tag": failure.run_tag,
                "outcome": failure.outcome,
                "logs": failure.logs,
                "completed_stages": failure.completed.iter().map(|s| s.stage).collect::<Vec<_>>(),
            }),
        );
    }
    if let Some(orchestration) = err.downcast_ref::<OrchestrationError>() {
        return json_error(orchestration.code(), orchestration.to_string(), json!({}));
    }
    json_error("command_failed", err.to_string(), json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::Claim { json, .. }
        | Commands::Release { json, .. }
        | Commands::Push { json, .. }
        | Commands::Pull { json, .. }
        | Commands::DeleteRemote { json, .. }
        | Commands::Cleanup { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}
