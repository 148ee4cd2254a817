//! Slurm implementation of [`BatchScheduler`] over `sbatch`, `sacct` and
//! `scancel`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use surge_core::fs::ensure_dir;
use surge_core::{OrchestrationError, Result};

use crate::dispatch::BatchScheduler;
use crate::process::{expand_home, run_capture, run_capture_labeled, shell_join};

#[derive(Debug, Clone, Default)]
pub struct SlurmCli {
    /// Directory holding the Slurm binaries; `None` means `$PATH`.
    bin_dir: Option<PathBuf>,
}

impl SlurmCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bin_dir(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: Some(bin_dir.into()),
        }
    }

    fn command(&self, program: &str) -> Command {
        match &self.bin_dir {
            Some(dir) => Command::new(dir.join(program)),
            None => Command::new(program),
        }
    }
}

/// `--parsable` prints `jobid[;cluster]`.
fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.trim().split(';').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

fn parse_states(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn completion_log_path(job_id: &str, workdir: Option<&str>) -> PathBuf {
    let name = format!("slurm-{}.out", job_id);
    match workdir {
        Some(dir) => Path::new(dir).join(name),
        None => PathBuf::from(name),
    }
}

impl BatchScheduler for SlurmCli {
    fn submit(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> Result<String> {
        let mut cmd = self.command("sbatch");
        cmd.args(["--parsable", "--export=ALL"]);
        if let Some(dir) = workdir {
            ensure_dir(Path::new(dir))?;
            cmd.arg(format!("--chdir={}", dir));
        }
        cmd.arg(expand_home(script)).args(args);
        // Values may be secrets: the label lists names only.
        let names: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        let label = format!("{} (env: {})", shell_join(&cmd), names.join(","));
        cmd.envs(env.iter().map(|(k, v)| (k, v)));
        let stdout = run_capture_labeled(cmd, label.clone())?;
        parse_job_id(&stdout).ok_or_else(|| {
            OrchestrationError::backend(label, format!("no job id in output {:?}", stdout))
        })
    }

    fn job_states(&self, job_id: &str) -> Result<Vec<String>> {
        let mut cmd = self.command("sacct");
        cmd.args([
            "--format=State",
            "--parsable2",
            "--noheader",
            &format!("--jobs={}", job_id),
        ]);
        Ok(parse_states(&run_capture(cmd)?))
    }

    fn cancel(&self, job_id: &str) -> Result<()> {
        let mut cmd = self.command("scancel");
        cmd.arg(job_id);
        run_capture(cmd).map(drop)
    }

    fn completion_log(&self, job_id: &str, workdir: Option<&str>) -> Result<Vec<String>> {
        let path = completion_log_path(job_id, workdir);
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::scratch_dir;

    #[test]
    fn parsable_output_yields_the_job_id() {
        assert_eq!(parse_job_id("48213\n").as_deref(), Some("48213"));
        assert_eq!(parse_job_id("48213;hpc-east\n").as_deref(), Some("48213"));
        assert_eq!(parse_job_id("\n"), None);
    }

    #[test]
    fn sacct_lines_become_states() {
        assert_eq!(
            parse_states("COMPLETED\nCANCELLED by 501\n\n"),
            vec!["COMPLETED", "CANCELLED by 501"]
        );
        assert!(parse_states("").is_empty());
    }

    #[test]
    fn completion_log_is_read_from_the_workdir() {
        let dir = scratch_dir("slurm-log");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("slurm-77.out"), "meshing\ndone\n").expect("write log");
        let slurm = SlurmCli::new();
        let workdir = dir.display().to_string();
        assert_eq!(
            slurm.completion_log("77", Some(&workdir)).expect("log"),
            vec!["meshing", "done"]
        );
        assert!(slurm.completion_log("78", Some(&workdir)).expect("missing").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn submit_runs_sbatch_in_the_workdir_with_exported_env() {
        use std::os::unix::fs::PermissionsExt;

        let bin = scratch_dir("slurm-bin");
        fs::create_dir_all(&bin).expect("mkdir");
        let sbatch = bin.join("sbatch");
        fs::write(
            &sbatch,
            "#!/bin/sh\necho \"$@\" > \"$SURGE_ARGS_OUT\"\necho '901;hpc'\n",
        )
        .expect("write stub");
        fs::set_permissions(&sbatch, fs::Permissions::from_mode(0o755)).expect("chmod");
        let workdir = bin.join("run").display().to_string();
        let args_out = bin.join("args.txt");

        let id = SlurmCli::with_bin_dir(&bin)
            .submit(
                "/opt/schism.sbatch",
                &["IAN".to_string()],
                &[(
                    "SURGE_ARGS_OUT".to_string(),
                    args_out.display().to_string(),
                )],
                Some(&workdir),
            )
            .expect("submit");
        assert_eq!(id, "901");
        assert!(Path::new(&workdir).is_dir());
        let recorded = fs::read_to_string(&args_out).expect("args");
        assert_eq!(
            recorded.trim(),
            format!("--parsable --export=ALL --chdir={} /opt/schism.sbatch IAN", workdir)
        );
    }
}
