//! Filesystem backend for single-operator use
//!
//! Layout under the root directory:
//!
//! ```text
//! clusters/<name>/state.json          current state
//! clusters/<name>/state.json.backup   previous state
//! locks/<name>.lock                   lock record, linked into place once written
//! ```

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};

use strata_common::state::ClusterState;
use strata_common::{Error, Result};

use crate::backend::{check_name, BackendInfo, StateBackend, CLUSTERS_PREFIX, STATE_FILE};
use crate::lock::{LockHandle, LockInfo, LockRecord};
use crate::s3::held_message;

const LOCKS_DIR: &str = "locks";
const BACKUP_SUFFIX: &str = ".backup";

/// State backend over a local directory
pub struct LocalBackend {
    root: PathBuf,
    owner: String,
}

impl LocalBackend {
    /// Create a backend rooted at `root`
    pub fn new(root: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            owner: owner.into(),
        }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn clusters_dir(&self) -> PathBuf {
        self.root.join(CLUSTERS_PREFIX.trim_end_matches('/'))
    }

    fn state_path(&self, name: &str) -> PathBuf {
        self.clusters_dir().join(name).join(STATE_FILE)
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.clusters_dir()
            .join(name)
            .join(format!("{}{}", STATE_FILE, BACKUP_SUFFIX))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", name))
    }

    async fn read_lock(&self, name: &str) -> Result<Option<LockRecord>> {
        let path = self.lock_path(name);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(format!("reading {}", path.display()), e)),
        }
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .map_err(|e| Error::io(format!("creating {}", path.display()), e))
}

/// Publish `body` at `path` only if nothing is there yet
///
/// The body is written in full to `staging` and then hard-linked into place, so
/// `path` never exists with partial content. `staging` is removed either way.
async fn create_exclusive(path: &Path, staging: &Path, body: &[u8]) -> std::io::Result<()> {
    let result = match fs::write(staging, body).await {
        Ok(()) => fs::hard_link(staging, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = fs::remove_file(staging).await {
        if e.kind() != IoErrorKind::NotFound {
            warn!(path = %staging.display(), error = %e, "Could not remove staged lock");
        }
    }
    result
}

async fn remove_file(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(format!("removing {}", path.display()), e)),
    }
}

#[async_trait]
impl StateBackend for LocalBackend {
    async fn initialize(&self) -> Result<()> {
        create_dir(&self.clusters_dir()).await?;
        create_dir(&self.root.join(LOCKS_DIR)).await?;
        info!(root = %self.root.display(), "Local state backend ready");
        Ok(())
    }

    async fn save(&self, name: &str, state: &ClusterState) -> Result<()> {
        check_name(name)?;
        let path = self.state_path(name);
        if let Some(dir) = path.parent() {
            create_dir(dir).await?;
        }

        if fs::try_exists(&path).await.unwrap_or(false) {
            let backup = self.backup_path(name);
            fs::copy(&path, &backup)
                .await
                .map_err(|e| Error::io(format!("backing up {}", path.display()), e))?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, state.to_json()?)
            .await
            .map_err(|e| Error::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::io(format!("replacing {}", path.display()), e))?;
        debug!(cluster = %name, path = %path.display(), "Saved state");
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<ClusterState> {
        check_name(name)?;
        let path = self.state_path(name);
        match fs::read(&path).await {
            Ok(data) => ClusterState::from_json(&data),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(Error::not_found("cluster state", name))
            }
            Err(e) => Err(Error::io(format!("reading {}", path.display()), e)),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        check_name(name)?;
        if !remove_file(&self.state_path(name)).await? {
            return Err(Error::not_found("cluster state", name));
        }
        // The backup is the only history a local backend keeps; leave it.
        debug!(cluster = %name, "Deleted state");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let dir = self.clusters_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("listing {}", dir.display()), e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(format!("listing {}", dir.display()), e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if fs::try_exists(self.state_path(&name)).await.unwrap_or(false) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        let path = self.state_path(name);
        fs::try_exists(&path)
            .await
            .map_err(|e| Error::io(format!("probing {}", path.display()), e))
    }

    async fn lock(&self, name: &str, operation: &str) -> Result<LockHandle> {
        check_name(name)?;
        let path = self.lock_path(name);
        if let Some(dir) = path.parent() {
            create_dir(dir).await?;
        }

        let lock_id = path.display().to_string();
        let info = LockInfo::new(operation, &self.owner);
        let record = LockRecord::new(&lock_id, &info)?;

        let body = serde_json::to_vec_pretty(&record)?;
        let staging = path.with_extension(format!("lock.{}", info.id));
        match create_exclusive(&path, &staging, &body).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                let holder = self.lock_info(name).await.ok().flatten();
                return Err(Error::conflict(name, held_message(holder.as_ref())));
            }
            Err(e) => return Err(Error::io(format!("creating {}", path.display()), e)),
        }

        info!(cluster = %name, operation = %operation, "Acquired lock");
        Ok(LockHandle {
            name: name.to_string(),
            lock_id,
            info,
        })
    }

    async fn unlock(&self, handle: &LockHandle) -> Result<()> {
        let Some(record) = self.read_lock(&handle.name).await? else {
            return Ok(());
        };
        if record.lock_info()?.id != handle.owner_token() {
            return Err(Error::conflict(
                &handle.name,
                "lock is held by a different owner; not released",
            ));
        }
        remove_file(&self.lock_path(&handle.name)).await?;
        info!(cluster = %handle.name, "Released lock");
        Ok(())
    }

    async fn force_unlock(&self, name: &str) -> Result<()> {
        check_name(name)?;
        if remove_file(&self.lock_path(name)).await? {
            warn!(cluster = %name, "Force-released lock");
        }
        Ok(())
    }

    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>> {
        check_name(name)?;
        self.read_lock(name)
            .await?
            .map(|record| record.lock_info())
            .transpose()
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: "local".to_string(),
            location: self.root.display().to_string(),
            region: None,
            encrypted: false,
            versioned: true,
            locking: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::cluster::ClusterConfig;
    use strata_common::state::{ClusterPhase, ClusterStatus};
    use strata_common::ErrorKind;

    fn state(name: &str, message: &str) -> ClusterState {
        ClusterState::new(
            ClusterConfig::new(name, "us-east-1"),
            ClusterStatus::new(ClusterPhase::Active, message),
        )
    }

    async fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("state"), "ops@laptop");
        backend.initialize().await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn save_keeps_previous_version_as_backup() {
        let (_dir, backend) = backend().await;

        backend.save("t1", &state("t1", "first")).await.unwrap();
        backend.save("t1", &state("t1", "second")).await.unwrap();

        assert_eq!(backend.load("t1").await.unwrap().status.message, "second");
        let backup = std::fs::read(backend.backup_path("t1")).unwrap();
        let previous = ClusterState::from_json(&backup).unwrap();
        assert_eq!(previous.status.message, "first");
    }

    #[tokio::test]
    async fn list_exists_and_delete() {
        let (_dir, backend) = backend().await;
        backend.save("b", &state("b", "")).await.unwrap();
        backend.save("a", &state("a", "")).await.unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["a", "b"]);
        assert!(backend.exists("a").await.unwrap());

        backend.delete("a").await.unwrap();
        assert!(!backend.exists("a").await.unwrap());
        assert_eq!(backend.list().await.unwrap(), vec!["b"]);
        assert_eq!(backend.delete("a").await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn lock_files_exclude_second_holder() {
        let (_dir, backend) = backend().await;

        let handle = backend.lock("t1", "create").await.unwrap();
        let err = backend.lock("t1", "create").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("ops@laptop"));

        backend.unlock(&handle).await.unwrap();
        assert!(backend.lock_info("t1").await.unwrap().is_none());
        backend.lock("t1", "create").await.unwrap();
    }

    #[tokio::test]
    async fn lock_leaves_only_the_lock_file() {
        let (_dir, backend) = backend().await;
        backend.lock("t1", "create").await.unwrap();

        let names: Vec<_> = std::fs::read_dir(backend.root().join(LOCKS_DIR))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["t1.lock"]);
    }

    #[tokio::test]
    async fn failed_lock_write_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.lock");
        let staging = dir.path().join("t1.lock.pending");
        // A directory where the staged record should go makes the write fail
        std::fs::create_dir(&staging).unwrap();

        assert!(create_exclusive(&path, &staging, b"{}").await.is_err());
        assert!(!path.exists());

        std::fs::remove_dir(&staging).unwrap();
        create_exclusive(&path, &staging, b"{}").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
        assert!(!staging.exists());

        let err = create_exclusive(&path, &staging, b"[]").await.unwrap_err();
        assert_eq!(err.kind(), IoErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&path).unwrap(), b"{}");
    }

    #[tokio::test]
    async fn unlock_requires_matching_owner() {
        let (_dir, backend) = backend().await;

        let stale = backend.lock("t1", "create").await.unwrap();
        backend.force_unlock("t1").await.unwrap();
        let current = backend.lock("t1", "destroy").await.unwrap();

        assert_eq!(backend.unlock(&stale).await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(
            backend.lock_info("t1").await.unwrap().unwrap().id,
            current.owner_token()
        );
    }

    #[tokio::test]
    async fn list_on_uninitialized_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("missing"), "ops");
        assert!(backend.list().await.unwrap().is_empty());
    }

    #[test]
    fn info_reports_unencrypted() {
        let backend = LocalBackend::new("/tmp/strata", "ops");
        let info = backend.info();
        assert_eq!(info.kind, "local");
        assert!(!info.encrypted);
        assert!(info.locking);
    }
}
