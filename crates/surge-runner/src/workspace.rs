//! Shared-filesystem side of a run: bootstrap of the run directory, result
//! publication and end-of-run cleanup. Callers hold the [`crate::lock::ResourceLock`]
//! around [`bootstrap`] and [`cleanup`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use surge_core::config::SharedFsConfig;
use surge_core::fs::{atomic_write_bytes, ensure_dir};
use surge_core::{OrchestrationError, OrchestratorConfig, Result, RunTag};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::stages::RunOptions;
use crate::store::{join_uri, ObjectStore};

pub const RUN_SUBDIRS: [&str; 5] = ["mesh", "setup", "sim", "nhc_track", "coops_ssh"];
pub const RUN_INFO_FILE: &str = "run_info.json";

/// Bulk intermediate outputs that never go to long-term storage.
pub const PUBLISH_IGNORE: [&str; 5] = [
    "max*_*",
    "schout_*_*.nc",
    "hotstart_*_*.nc",
    "local_to_global_*",
    "nonfatal_*",
];

pub fn run_dir(shared: &SharedFsConfig, tag: &RunTag) -> PathBuf {
    shared.runs_root().join(tag.to_string())
}

#[derive(Debug, Serialize)]
struct RunInfo<'a> {
    run_tag: String,
    start_date: String,
    orchestrator_version: &'static str,
    options: &'a RunOptions,
}

/// Bring static inputs onto the shared filesystem and create the run
/// directory.
pub fn bootstrap(
    store: &dyn ObjectStore,
    config: &OrchestratorConfig,
    tag: &RunTag,
    options: &RunOptions,
) -> Result<PathBuf> {
    info!(run_tag = %tag, src = %config.aws.static_uri, "syncing static data");
    ensure_dir(&config.shared.root)?;
    store
        .sync_down(&config.aws.static_uri, &config.shared.root)
        .map_err(|e| match e {
            OrchestrationError::Sync(_) => e,
            other => OrchestrationError::Sync(other.to_string()),
        })?;
    init_run_dir(&config.shared, tag, options)
}

/// Create the run directory skeleton. An existing run directory is reused
/// and its `run_info.json` kept.
pub fn init_run_dir(shared: &SharedFsConfig, tag: &RunTag, options: &RunOptions) -> Result<PathBuf> {
    let dir = run_dir(shared, tag);
    for sub in RUN_SUBDIRS {
        ensure_dir(&dir.join(sub))?;
    }
    let info_path = dir.join(RUN_INFO_FILE);
    if info_path.exists() {
        debug!(run_tag = %tag, "run directory already initialized");
        return Ok(dir);
    }
    let run_info = RunInfo {
        run_tag: tag.to_string(),
        start_date: Utc::now().to_rfc3339(),
        orchestrator_version: env!("CARGO_PKG_VERSION"),
        options,
    };
    let bytes = serde_json::to_vec_pretty(&run_info)
        .map_err(|e| OrchestrationError::Config(format!("run_info.json: {}", e)))?;
    atomic_write_bytes(&info_path, &bytes)?;
    info!(run_tag = %tag, dir = %dir.display(), "run directory initialized");
    Ok(dir)
}

/// `*` matches any run of characters, everything else matches itself.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

fn is_ignored(name: &str) -> bool {
    PUBLISH_IGNORE.iter().any(|p| wildcard_match(p, name))
}

/// `{prefix}NNN`, one past the highest numeric suffix already published.
pub fn next_publication_name(prefix: &str, existing: &[String]) -> String {
    let last = existing
        .iter()
        .filter_map(|name| name.strip_prefix(prefix))
        .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    format!("{}{:03}", prefix, last + 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub remote: String,
    pub uploaded: usize,
    pub skipped: usize,
}

fn bucket_uri(bucket: &str) -> String {
    if bucket.contains("://") {
        bucket.to_string()
    } else {
        format!("s3://{}", bucket)
    }
}

/// Upload the run directory to long-term storage under a fresh
/// `{name}_{year}_NNN` prefix.
pub fn publish_results(
    store: &dyn ObjectStore,
    run_dir: &Path,
    result_bucket: &str,
    tag: &RunTag,
) -> Result<Publication> {
    let bucket = bucket_uri(result_bucket);
    let existing = store.list_prefixes(&bucket)?;
    let name = next_publication_name(&tag.storm_prefix(), &existing);
    let remote = join_uri(&bucket, &name);
    info!(run_tag = %tag, remote = %remote, "publishing results");
    let (mut uploaded, mut skipped) = (0, 0);
    for entry in WalkDir::new(run_dir).follow_links(false) {
        let entry = entry.map_err(|e| OrchestrationError::Sync(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if is_ignored(&entry.file_name().to_string_lossy()) {
            skipped += 1;
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(run_dir)
            .map_err(|e| OrchestrationError::Sync(e.to_string()))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        store.put_file(entry.path(), &join_uri(&remote, &rel))?;
        uploaded += 1;
    }
    info!(run_tag = %tag, uploaded, skipped, "results published");
    Ok(Publication {
        remote,
        uploaded,
        skipped,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "shared_root", rename_all = "snake_case")]
pub enum CleanupReport {
    Wiped { removed: Vec<String> },
    /// Other runs still live under the runs directory.
    Skipped { remaining: Vec<String> },
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn dir_names(path: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Remove the run's directory, save the shared cache, and wipe the shared
/// root if no other run is still using it. The lock file always survives.
pub fn cleanup(
    store: &dyn ObjectStore,
    config: &OrchestratorConfig,
    tag: &RunTag,
) -> Result<CleanupReport> {
    let shared = &config.shared;
    remove_path(&run_dir(shared, tag))?;

    let cache = shared.root.join(&shared.cache_dir);
    ensure_dir(&cache)?;
    store.sync_up(&cache, &join_uri(&config.aws.static_uri, &shared.cache_dir))?;

    let remaining = dir_names(&shared.runs_root())?;
    if !remaining.is_empty() {
        info!(run_tag = %tag, remaining = ?remaining, "other runs present, shared root kept");
        return Ok(CleanupReport::Skipped { remaining });
    }

    let mut removed = Vec::new();
    for entry in fs::read_dir(&shared.root)? {
        let path = entry?.path();
        if path == shared.lock_path {
            continue;
        }
        remove_path(&path)?;
        removed.push(
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
    }
    removed.sort();
    info!(run_tag = %tag, removed = removed.len(), "shared root wiped");
    Ok(CleanupReport::Wiped { removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::scratch_dir;
    use crate::stages::tests::test_config;
    use crate::store::FsMirrorStore;

    fn config_at(root: &Path) -> OrchestratorConfig {
        let mut config = test_config();
        config.shared.root = root.join("efs");
        config.shared.lock_path = root.join("efs").join(".initfini.lock");
        config
    }

    fn tag(id: &str) -> RunTag {
        RunTag::new("IAN", 2022, id).expect("tag")
    }

    #[test]
    fn init_creates_skeleton_and_keeps_existing_run_info() {
        let root = scratch_dir("init-run");
        let config = config_at(&root);
        let options = RunOptions::new("IAN", 2022, "7");
        let dir = init_run_dir(&config.shared, &tag("7"), &options).expect("init");
        for sub in RUN_SUBDIRS {
            assert!(dir.join(sub).is_dir(), "{}", sub);
        }
        let first = fs::read_to_string(dir.join(RUN_INFO_FILE)).expect("run_info");
        assert!(first.contains("\"run_tag\": \"IAN_2022_7\""), "{}", first);
        init_run_dir(&config.shared, &tag("7"), &options).expect("re-init");
        let second = fs::read_to_string(dir.join(RUN_INFO_FILE)).expect("run_info");
        assert_eq!(first, second);
    }

    #[test]
    fn bootstrap_brings_static_data_onto_the_shared_root() {
        let root = scratch_dir("bootstrap");
        let config = config_at(&root);
        let store = FsMirrorStore::new(root.join("s3"));
        fs::create_dir_all(root.join("s3/static/grid")).expect("mkdir");
        fs::write(root.join("s3/static/grid/WNAT_1km.14"), "grid").expect("write");
        let options = RunOptions::new("IAN", 2022, "7");
        let dir = bootstrap(&store, &config, &tag("7"), &options).expect("bootstrap");
        assert!(config.shared.root.join("grid/WNAT_1km.14").is_file());
        assert!(dir.join("mesh").is_dir());
    }

    #[test]
    fn wildcard_matches_ignore_patterns() {
        assert!(wildcard_match("max*_*", "maxelev_0001"));
        assert!(wildcard_match("schout_*_*.nc", "schout_0000_12.nc"));
        assert!(!wildcard_match("schout_*_*.nc", "schout_12.nc"));
        assert!(wildcard_match("nonfatal_*", "nonfatal_0003"));
        assert!(!wildcard_match("max*_*", "param.nml"));
        assert!(wildcard_match("*", ""));
    }

    #[test]
    fn publication_numbers_continue_past_the_highest_suffix() {
        let existing = vec![
            "IAN_2022_001".to_string(),
            "IAN_2022_004".to_string(),
            "IAN_2022_latest".to_string(),
            "FLORENCE_2018_009".to_string(),
        ];
        assert_eq!(next_publication_name("IAN_2022_", &existing), "IAN_2022_005");
        assert_eq!(next_publication_name("IAN_2022_", &[]), "IAN_2022_001");
    }

    #[test]
    fn publish_skips_bulk_outputs() {
        let root = scratch_dir("publish");
        let run = root.join("run");
        fs::create_dir_all(run.join("setup/schism.dir/outputs")).expect("mkdir");
        fs::write(run.join("run_info.json"), "{}").expect("write");
        fs::write(run.join("setup/schism.dir/outputs/staout_1"), "1").expect("write");
        fs::write(run.join("setup/schism.dir/outputs/schout_0001_3.nc"), "x").expect("write");
        fs::write(run.join("setup/schism.dir/outputs/maxelev_0001"), "x").expect("write");
        let store = FsMirrorStore::new(root.join("s3"));
        fs::create_dir_all(root.join("s3/results/IAN_2022_002")).expect("mkdir");

        let publication = publish_results(&store, &run, "results", &tag("7")).expect("publish");
        assert_eq!(publication.remote, "s3://results/IAN_2022_003");
        assert_eq!(publication.uploaded, 2);
        assert_eq!(publication.skipped, 2);
        assert!(root
            .join("s3/results/IAN_2022_003/setup/schism.dir/outputs/staout_1")
            .is_file());
    }

    #[test]
    fn cleanup_wipes_shared_root_only_when_run_is_alone() {
        let root = scratch_dir("cleanup-alone");
        let config = config_at(&root);
        let store = FsMirrorStore::new(root.join("s3"));
        let options = RunOptions::new("IAN", 2022, "7");
        init_run_dir(&config.shared, &tag("7"), &options).expect("init");
        fs::create_dir_all(config.shared.root.join("cache")).expect("mkdir");
        fs::write(config.shared.root.join("cache/tile.nc"), "c").expect("write");
        fs::write(&config.shared.lock_path, "").expect("lock file");

        let report = cleanup(&store, &config, &tag("7")).expect("cleanup");
        assert_eq!(
            report,
            CleanupReport::Wiped {
                removed: vec!["cache".to_string(), "hurricanes".to_string()]
            }
        );
        assert!(config.shared.lock_path.exists(), "lock file survives");
        assert!(root.join("s3/static/cache/tile.nc").is_file(), "cache saved");
    }

    #[test]
    fn cleanup_skips_shared_root_when_another_run_is_present() {
        let root = scratch_dir("cleanup-shared");
        let config = config_at(&root);
        let store = FsMirrorStore::new(root.join("s3"));
        let options = RunOptions::new("IAN", 2022, "7");
        let own = init_run_dir(&config.shared, &tag("7"), &options).expect("init X");
        init_run_dir(&config.shared, &tag("8"), &options).expect("init Y");

        let report = cleanup(&store, &config, &tag("7")).expect("cleanup");
        assert_eq!(
            report,
            CleanupReport::Skipped {
                remaining: vec!["IAN_2022_8".to_string()]
            }
        );
        assert!(!own.exists());
        assert!(run_dir(&config.shared, &tag("8")).is_dir());
    }
}
