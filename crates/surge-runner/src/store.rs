use std::fs;
use std::path::{Path, PathBuf};

use surge_core::fs::ensure_dir;
use surge_core::{OrchestrationError, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Durable object storage as seen by the orchestrator.
///
/// Remote locations are URIs such as `s3://bucket/prefix`. Every recursive
/// transfer runs in "do not follow symlinks" mode: symbolic links are skipped,
/// never dereferenced.
pub trait ObjectStore: Send + Sync {
    /// Recursive local → remote sync. Unchanged files are not re-sent.
    fn sync_up(&self, local: &Path, remote: &str) -> Result<()>;

    /// Recursive remote → local sync. Unchanged files are not re-fetched.
    fn sync_down(&self, remote: &str, local: &Path) -> Result<()>;

    /// Recursively delete everything under `remote`.
    fn remove_prefix(&self, remote: &str) -> Result<()>;

    /// Upload one file to an exact object key.
    fn put_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Names of the immediate "directories" under `remote`, without slashes.
    fn list_prefixes(&self, remote: &str) -> Result<Vec<String>>;
}

/// Join URI segments with exactly one `/` between them.
pub fn join_uri(base: &str, rel: &str) -> String {
    let rel = rel.trim_matches('/');
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

/// Split `scheme://bucket/key` into bucket and key (key may be empty).
pub fn split_bucket_uri(uri: &str) -> Option<(&str, &str)> {
    let (_, rest) = uri.split_once("://")?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        None
    } else {
        Some((bucket, key))
    }
}

/// Object store whose remote side is a plain directory tree.
///
/// `s3://bucket/key` maps to `<root>/bucket/key`. Used by tests and for
/// single-host runs where the "bucket" is another mounted filesystem.
#[derive(Debug, Clone)]
pub struct FsMirrorStore {
    root: PathBuf,
}

impl FsMirrorStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> PathBuf {
        let rel = remote
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(remote)
            .trim_matches('/');
        let mut path = self.root.clone();
        for segment in rel.split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(segment);
        }
        path
    }
}

impl ObjectStore for FsMirrorStore {
    fn sync_up(&self, local: &Path, remote: &str) -> Result<()> {
        let dst = self.resolve(remote);
        debug!(src = %local.display(), dst = %dst.display(), "mirror sync up");
        mirror_tree(local, &dst)
    }

    fn sync_down(&self, remote: &str, local: &Path) -> Result<()> {
        let src = self.resolve(remote);
        debug!(src = %src.display(), dst = %local.display(), "mirror sync down");
        if !src.exists() {
            return Err(OrchestrationError::Sync(format!("{} does not exist", remote)));
        }
        mirror_tree(&src, local)
    }

    fn remove_prefix(&self, remote: &str) -> Result<()> {
        let path = self.resolve(remote);
        if path == self.root {
            return Err(OrchestrationError::Sync(format!(
                "refusing to remove the whole mirror for {}",
                remote
            )));
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let dst = self.resolve(remote);
        if let Some(parent) = dst.parent() {
            ensure_dir(parent)?;
        }
        fs::copy(local, &dst)?;
        Ok(())
    }

    fn list_prefixes(&self, remote: &str) -> Result<Vec<String>> {
        let path = self.resolve(remote);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
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
}

/// Copy regular files from `src` into `dst`, skipping symlinks and files whose
/// content is already identical.
fn mirror_tree(src: &Path, dst: &Path) -> Result<()> {
    ensure_dir(dst)?;
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| OrchestrationError::Sync(e.to_string()))?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            ensure_dir(&target)?;
        } else if file_type.is_file() {
            if same_content(entry.path(), &target) {
                continue;
            }
            if let Some(parent) = target.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (fs::symlink_metadata(a), fs::symlink_metadata(b)) {
        (Ok(ma), Ok(mb)) if mb.is_file() && ma.len() == mb.len() => {
            matches!((fs::read(a), fs::read(b)), (Ok(x), Ok(y)) if x == y)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_uri_normalizes_slashes() {
        assert_eq!(join_uri("s3://b/", "/hurricanes/"), "s3://b/hurricanes");
        assert_eq!(join_uri("s3://b", ""), "s3://b");
        assert_eq!(join_uri("s3://b/pre", "IAN_2022_7"), "s3://b/pre/IAN_2022_7");
    }

    #[test]
    fn split_bucket_uri_handles_bare_buckets() {
        assert_eq!(split_bucket_uri("s3://results"), Some(("results", "")));
        assert_eq!(
            split_bucket_uri("s3://static/cache/"),
            Some(("static", "cache/"))
        );
        assert_eq!(split_bucket_uri("results"), None);
    }

    #[test]
    fn mirror_resolve_ignores_scheme_and_parent_segments() {
        let store = FsMirrorStore::new("/tmp/mirror");
        assert_eq!(
            store.resolve("s3://bucket/../a/b/"),
            PathBuf::from("/tmp/mirror/bucket/a/b")
        );
    }
}
