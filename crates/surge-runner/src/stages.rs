//! Per-stage job requests. Argument lists mirror the interfaces of the
//! external stage programs; paths are templated on the run tag.

use serde::{Deserialize, Serialize};
use surge_core::config::{BatchWait, ContainerStageConfig};
use surge_core::{Arg, Backend, JobRequest, OrchestratorConfig, Result, RunTag, Stage};

use crate::ensemble::EnsembleLayout;

const FINE_BASE_MESH: &str = "grid/HSOFS_250m_v1.0_fixed.14";
const COARSE_BASE_MESH: &str = "grid/WNAT_1km.14";
const NWM_HYDROFABRIC: &str = "nwm/NWM_v2.0_channel_hydrofabric/nwm_v2_0_hydrofabric.gdb";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshOptions {
    pub hmax: f64,
    pub hmin_low: f64,
    pub rate_low: f64,
    pub transition_elev: f64,
    pub hmin_high: f64,
    pub rate_high: f64,
}

impl Default for MeshOptions {
    fn default() -> Self {
        Self {
            hmax: 20000.0,
            hmin_low: 1500.0,
            rate_low: 2e-3,
            transition_elev: -200.0,
            hmin_high: 300.0,
            rate_high: 1e-3,
        }
    }
}

/// Everything an operator chooses for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub storm_name: String,
    pub storm_year: u16,
    pub run_id: String,
    /// Mesh, setup and solve go to the HPC batch scheduler.
    pub use_hpc: bool,
    pub ensemble: bool,
    pub parametric_wind: bool,
    pub subset_mesh: bool,
    pub past_forecast: bool,
    pub hours_before_landfall: i32,
    pub couple_wind: bool,
    pub ensemble_num_perturbations: u32,
    pub ensemble_sample_rule: String,
    pub mesh: MeshOptions,
}

impl RunOptions {
    pub fn new(storm_name: &str, storm_year: u16, run_id: &str) -> Self {
        Self {
            storm_name: storm_name.to_string(),
            storm_year,
            run_id: run_id.to_string(),
            use_hpc: false,
            ensemble: false,
            parametric_wind: false,
            subset_mesh: false,
            past_forecast: false,
            hours_before_landfall: -1,
            couple_wind: false,
            ensemble_num_perturbations: 40,
            ensemble_sample_rule: "korobov".to_string(),
            mesh: MeshOptions::default(),
        }
    }

    pub fn run_tag(&self) -> Result<RunTag> {
        RunTag::new(&self.storm_name, self.storm_year, &self.run_id)
    }
}

/// Builds the requests of every stage from the configuration and the run
/// options. Backend choice is fixed here, once per run.
pub struct StagePlan<'a> {
    config: &'a OrchestratorConfig,
    options: &'a RunOptions,
}

impl<'a> StagePlan<'a> {
    pub fn new(config: &'a OrchestratorConfig, options: &'a RunOptions) -> Self {
        Self { config, options }
    }

    pub fn backend_for(&self, stage: Stage) -> Backend {
        match stage {
            Stage::Mesh | Stage::Setup | Stage::Solve if self.options.use_hpc => Backend::Batch,
            _ => Backend::Container,
        }
    }

    /// `<runs_dir>/{tag}/<rel>`, relative to the data root the job sees.
    fn run_path(&self, rel: &str) -> Arg {
        Arg::tmpl(format!("{}/{{tag}}/{}", self.config.shared.runs_dir, rel))
    }

    fn tag_path(rel: &str) -> Arg {
        Arg::tmpl(format!("{{tag}}/{}", rel))
    }

    fn container_job(name: &str, profile: &ContainerStageConfig) -> JobRequest {
        JobRequest::container(
            name,
            &profile.cluster,
            &profile.task_definition,
            &profile.container,
        )
        .claim_template(&profile.template_id)
        .env_secrets(profile.env_secrets.clone())
        .wait(profile.wait_delay_secs, profile.wait_max_attempts)
    }

    /// Run-scoped scratch directory; `run` is `{tag}` or a rendered tag.
    fn scratch_run_dir(&self, run: &str) -> String {
        let scratch = self.config.hpc.scratch_root.display().to_string();
        format!(
            "{}/{}/{}",
            scratch.trim_end_matches('/'),
            self.config.shared.runs_dir,
            run
        )
    }

    fn batch_job(&self, name: &str, script: &str, wait: &BatchWait) -> JobRequest {
        JobRequest::batch(name, script)
            .workdir(Arg::tmpl(self.scratch_run_dir("{tag}")))
            .wait(wait.wait_delay_secs, wait.wait_max_attempts)
    }

    pub fn info(&self) -> JobRequest {
        let o = self.options;
        let mut job = Self::container_job("info", &self.config.stages.info).args([
            Arg::lit("--date-range-outpath"),
            Self::tag_path("setup/dates.csv"),
            Arg::lit("--track-outpath"),
            Self::tag_path("nhc_track/hurricane-track.dat"),
            Arg::lit("--swath-outpath"),
            Self::tag_path("windswath"),
            Arg::lit("--station-data-outpath"),
            Self::tag_path("coops_ssh/stations.nc"),
            Arg::lit("--station-location-outpath"),
            Self::tag_path("setup/stations.csv"),
        ]);
        if o.past_forecast {
            job = job.args([
                Arg::lit("--past-forecast"),
                Arg::lit("--hours-before-landfall"),
                Arg::lit(o.hours_before_landfall),
            ]);
        }
        job.args([Arg::lit(&o.storm_name), Arg::lit(o.storm_year)])
    }

    fn mesh_kwds(&self) -> Vec<Arg> {
        let m = &self.options.mesh;
        if self.options.subset_mesh {
            vec![
                Arg::lit("subset_n_combine"),
                Arg::lit(FINE_BASE_MESH),
                Arg::lit(COARSE_BASE_MESH),
                self.run_path("windswath"),
            ]
        } else {
            vec![
                Arg::lit("hurricane_mesh"),
                Arg::lit("--hmax"),
                Arg::lit(m.hmax),
                Arg::lit("--hmin-low"),
                Arg::lit(m.hmin_low),
                Arg::lit("--rate-low"),
                Arg::lit(m.rate_low),
                Arg::lit("--transition-elev"),
                Arg::lit(m.transition_elev),
                Arg::lit("--hmin-high"),
                Arg::lit(m.hmin_high),
                Arg::lit("--rate-high"),
                Arg::lit(m.rate_high),
                Arg::lit("--shapes-dir"),
                Arg::lit("shape"),
                Arg::lit("--windswath"),
                self.run_path("windswath"),
            ]
        }
    }

    pub fn mesh(&self) -> JobRequest {
        let o = self.options;
        match self.backend_for(Stage::Mesh) {
            Backend::Container => Self::container_job("mesh", &self.config.stages.mesh)
                .args([
                    Arg::lit(&o.storm_name),
                    Arg::lit(o.storm_year),
                    Arg::lit("--rasters-dir"),
                    Arg::lit("dem"),
                ])
                .args(self.mesh_kwds())
                .args([Arg::lit("--out"), self.run_path("mesh")]),
            Backend::Batch => {
                let mut kwds = vec!["--tag".to_string(), "{tag}".to_string()];
                for arg in self.mesh_kwds() {
                    match arg {
                        Arg::Literal(v) | Arg::Template(v) => kwds.push(v),
                    }
                }
                self.batch_job("mesh", &self.config.hpc.mesh_script, &self.config.batch.mesh)
                    .env("KWDS", Arg::tmpl(kwds.join(" ")))
                    .env("STORM", Arg::lit(&o.storm_name))
                    .env("YEAR", Arg::lit(o.storm_year))
            }
        }
    }

    fn setup_args(&self) -> Vec<Arg> {
        let o = self.options;
        let mut args = Vec::new();
        if o.ensemble {
            args.extend([
                Arg::lit("setup_ensemble"),
                Arg::lit("--track-file"),
                self.run_path("nhc_track/hurricane-track.dat"),
                Arg::lit("--output-directory"),
                self.run_path("setup/ensemble.dir/"),
                Arg::lit("--num-perturbations"),
                Arg::lit(o.ensemble_num_perturbations),
                Arg::lit("--mesh-directory"),
                self.run_path("mesh/"),
                Arg::lit("--sample-from-distribution"),
                Arg::lit("--sample-rule"),
                Arg::lit(&o.ensemble_sample_rule),
                Arg::lit("--hours-before-landfall"),
                Arg::lit(o.hours_before_landfall),
                Arg::lit("--nwm-file"),
                Arg::lit(NWM_HYDROFABRIC),
            ]);
        } else {
            args.push(Arg::lit("setup_model"));
            if o.parametric_wind {
                args.push(Arg::lit("--parametric-wind"));
            }
            args.extend([
                Arg::lit("--mesh-file"),
                self.run_path("mesh/mesh_w_bdry.grd"),
                Arg::lit("--domain-bbox-file"),
                self.run_path("mesh/domain_box/"),
                Arg::lit("--station-location-file"),
                self.run_path("setup/stations.csv"),
                Arg::lit("--out"),
                self.run_path("setup/schism.dir/"),
            ]);
            if o.parametric_wind {
                args.extend([
                    Arg::lit("--track-file"),
                    self.run_path("nhc_track/hurricane-track.dat"),
                ]);
            }
            args.extend([
                Arg::lit("--cache-dir"),
                Arg::lit(&self.config.shared.cache_dir),
                Arg::lit("--nwm-dir"),
                Arg::lit("nwm"),
            ]);
        }
        args.extend([
            Arg::lit("--date-range-file"),
            self.run_path("setup/dates.csv"),
            Arg::lit("--tpxo-dir"),
            Arg::lit("tpxo"),
        ]);
        if o.couple_wind {
            args.push(Arg::lit("--use-wwm"));
        }
        args.extend([Arg::lit(&o.storm_name), Arg::lit(o.storm_year)]);
        args
    }

    pub fn setup(&self) -> JobRequest {
        match self.backend_for(Stage::Setup) {
            Backend::Container => {
                Self::container_job("setup", &self.config.stages.setup).args(self.setup_args())
            }
            Backend::Batch => self
                .batch_job("setup", &self.config.hpc.setup_script, &self.config.batch.setup)
                .env_secrets(self.config.stages.setup.env_secrets.clone())
                .args(self.setup_args()),
        }
    }

    /// Solve request with `{run_dir}` and `{exec}` left open; bind them with
    /// [`StagePlan::deterministic_solve`] or through the ensemble coordinator.
    /// Ensemble members run under derived tags, so nothing here refers to
    /// `{tag}`.
    pub fn solve_template(&self, tag: &RunTag) -> JobRequest {
        match self.backend_for(Stage::Solve) {
            Backend::Container => Self::container_job("solve", &self.config.stages.solve)
                .args([Arg::tmpl("{run_dir}"), Arg::tmpl("{exec}")]),
            Backend::Batch => self
                .batch_job("solve", &self.config.hpc.solve_script, &self.config.batch.solve)
                .workdir(Arg::lit(self.scratch_run_dir(&tag.to_string())))
                .env("STORM_PATH", Arg::tmpl("{run_dir}"))
                .env("SCHISM_EXEC", Arg::tmpl("{exec}")),
        }
    }

    /// Path of `rel` inside the run directory as the solve jobs see it:
    /// relative to the shared root for containers, absolute on HPC scratch.
    fn solve_path(&self, tag: &RunTag, rel: &str) -> String {
        match self.backend_for(Stage::Solve) {
            Backend::Container => format!("{}/{}/{}", self.config.shared.runs_dir, tag, rel),
            Backend::Batch => format!("{}/{}", self.scratch_run_dir(&tag.to_string()), rel),
        }
    }

    pub fn deterministic_solve(&self, tag: &RunTag) -> JobRequest {
        self.solve_template(tag)
            .with_var("run_dir", self.solve_path(tag, "setup/schism.dir/"))
            .with_var("exec", self.config.solver.exec_for(self.options.couple_wind))
    }

    pub fn ensemble_layout(&self, tag: &RunTag) -> EnsembleLayout {
        let data_root = match self.backend_for(Stage::Solve) {
            Backend::Container => self.config.shared.root.clone(),
            Backend::Batch => self.config.hpc.scratch_root.clone(),
        };
        EnsembleLayout {
            data_root,
            ensemble_dir: self.solve_path(tag, "setup/ensemble.dir"),
        }
    }

    pub fn visualize(&self) -> Vec<JobRequest> {
        let o = self.options;
        if !o.ensemble {
            return vec![Self::container_job("viz", &self.config.stages.viz).args([
                Arg::lit(&o.storm_name),
                Arg::lit(o.storm_year),
                self.run_path("setup/schism.dir/"),
            ])];
        }
        ["combine_ensemble", "analyze_ensemble"]
            .iter()
            .map(|program| {
                Self::container_job(program, &self.config.stages.ensemble_post).args([
                    Arg::lit(*program),
                    Arg::lit("--ensemble-dir"),
                    self.run_path("setup/ensemble.dir/"),
                    Arg::lit("--tracks-dir"),
                    self.run_path("setup/ensemble.dir/track_files"),
                ])
            })
            .collect()
    }
}

/// Dry-run view of one job: resolved argv and the names of its environment.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub name: String,
    pub backend: Backend,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub workdir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedStage {
    pub stage: Stage,
    pub backend: Option<Backend>,
    pub jobs: Vec<PlannedJob>,
}

fn planned(tag: &RunTag, request: &JobRequest) -> Result<PlannedJob> {
    let resolved = request.resolve_with(tag, |_| Some("***".to_string()))?;
    Ok(PlannedJob {
        name: request.name().to_string(),
        backend: request.backend(),
        argv: resolved.argv,
        env: resolved.env.into_iter().map(|(k, _)| k).collect(),
        workdir: resolved.workdir,
    })
}

/// The full stage sequence as it would run, without touching any backend.
/// Ensemble hot starts are shown as one `runs/*` placeholder job since their
/// directories only exist after setup.
pub fn plan(config: &OrchestratorConfig, options: &RunOptions) -> Result<Vec<PlannedStage>> {
    let tag = options.run_tag()?;
    let stages = StagePlan::new(config, options);
    let mut out = Vec::new();
    for stage in Stage::ALL {
        let requests: Vec<JobRequest> = match stage {
            Stage::Init | Stage::Finalize | Stage::Cleanup => Vec::new(),
            Stage::Info => vec![stages.info()],
            Stage::Mesh => vec![stages.mesh()],
            Stage::Setup => vec![stages.setup()],
            Stage::Solve if options.ensemble => {
                let base = stages.solve_template(&tag);
                let layout = stages.ensemble_layout(&tag);
                vec![
                    base.renamed("solve-spinup")
                        .with_var("run_dir", layout.spinup_dir())
                        .with_var("exec", &config.solver.uncoupled_exec),
                    base.renamed("solve-<run>")
                        .with_var("run_dir", layout.member_dir("*"))
                        .with_var("exec", config.solver.exec_for(options.couple_wind)),
                ]
            }
            Stage::Solve => vec![stages.deterministic_solve(&tag)],
            Stage::Visualize => stages.visualize(),
        };
        let jobs = requests
            .iter()
            .map(|r| planned(&tag, r))
            .collect::<Result<Vec<_>>>()?;
        let backend = (!jobs.is_empty()).then(|| stages.backend_for(stage));
        out.push(PlannedStage {
            stage,
            backend,
            jobs,
        });
    }
    Ok(out)
}
