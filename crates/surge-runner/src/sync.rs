use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use surge_core::fs::remove_file_if_exists;
use surge_core::{OrchestrationError, Result, RunTag};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::store::{join_uri, ObjectStore};

pub const SIDECAR_SUFFIX: &str = ".symlnk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Push,
    Pull,
}

/// Counts from one sync, mostly for logs and `--json` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SyncSummary {
    pub links: usize,
}

/// Moves a run-tag scoped subtree between a local root and a remote URI of
/// the same relative layout: `<local_root>/<tag>` ↔ `<remote_uri>/<tag>`.
///
/// Object stores have no symlinks, so links travel as `<path>.symlnk` sidecar
/// files holding the link target.
#[derive(Clone)]
pub struct StorageSyncEngine {
    store: Arc<dyn ObjectStore>,
}

impl StorageSyncEngine {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Upload the run subtree. Links stay intact on the source; their sidecars
    /// exist only for the duration of the upload.
    pub fn push(&self, tag: &RunTag, local_root: &Path, remote_uri: &str) -> Result<SyncSummary> {
        let local = local_root.join(tag.to_string());
        let remote = join_uri(remote_uri, &tag.to_string());
        if !local.is_dir() {
            return Err(OrchestrationError::Sync(format!(
                "nothing to push: {} is not a directory",
                local.display()
            )));
        }
        info!(run_tag = %tag, src = %local.display(), dst = %remote, "push");
        let sidecars = write_sidecars(&local)?;
        let uploaded = self
            .store
            .sync_up(&local, &remote)
            .map_err(|e| sync_error("push", &remote, e));
        for sidecar in &sidecars {
            remove_file_if_exists(sidecar)?;
        }
        uploaded?;
        Ok(SyncSummary {
            links: sidecars.len(),
        })
    }

    /// Download the run subtree, then turn every sidecar back into a link.
    pub fn pull(&self, tag: &RunTag, remote_uri: &str, local_root: &Path) -> Result<SyncSummary> {
        let local = local_root.join(tag.to_string());
        let remote = join_uri(remote_uri, &tag.to_string());
        info!(run_tag = %tag, src = %remote, dst = %local.display(), "pull");
        self.store
            .sync_down(&remote, &local)
            .map_err(|e| sync_error("pull", &remote, e))?;
        let links = restore_links(&local)?;
        Ok(SyncSummary { links })
    }

    /// Remove the run's remote copy. Never implied by push or pull.
    pub fn delete_remote(&self, tag: &RunTag, remote_uri: &str) -> Result<()> {
        let remote = join_uri(remote_uri, &tag.to_string());
        info!(run_tag = %tag, remote = %remote, "delete remote copy");
        self.store
            .remove_prefix(&remote)
            .map_err(|e| sync_error("delete", &remote, e))
    }
}

fn sync_error(op: &str, remote: &str, err: OrchestrationError) -> OrchestrationError {
    match err {
        OrchestrationError::Sync(_) => err,
        other => OrchestrationError::Sync(format!("{} {}: {}", op, remote, other)),
    }
}

fn write_sidecars(root: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| OrchestrationError::Sync(e.to_string()))?;
        if !entry.path_is_symlink() {
            continue;
        }
        let target = fs::read_link(entry.path())?;
        let mut sidecar = entry.path().as_os_str().to_owned();
        sidecar.push(SIDECAR_SUFFIX);
        let sidecar = PathBuf::from(sidecar);
        fs::write(&sidecar, target.to_string_lossy().as_bytes())?;
        debug!(link = %entry.path().display(), target = %target.display(), "wrote symlink sidecar");
        written.push(sidecar);
    }
    Ok(written)
}

fn restore_links(root: &Path) -> Result<usize> {
    let sidecars: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().ends_with(SIDECAR_SUFFIX))
        .map(|e| e.into_path())
        .collect();
    for sidecar in &sidecars {
        let target = fs::read_to_string(sidecar)?;
        let target = target.trim_end_matches('\n');
        let raw = sidecar.to_string_lossy();
        let link = PathBuf::from(&raw[..raw.len() - SIDECAR_SUFFIX.len()]);
        match fs::symlink_metadata(&link) {
            Ok(meta) if meta.is_dir() => {
                return Err(OrchestrationError::Sync(format!(
                    "cannot restore link {}: a directory is in the way",
                    link.display()
                )));
            }
            Ok(_) => fs::remove_file(&link)?,
            Err(_) => {}
        }
        make_symlink(Path::new(target), &link)?;
        fs::remove_file(sidecar)?;
        debug!(link = %link.display(), target = %target, "restored symlink");
    }
    Ok(sidecars.len())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    Err(OrchestrationError::Sync(format!(
        "symlinks are not supported on this platform ({} -> {})",
        link.display(),
        target.display()
    )))
}
