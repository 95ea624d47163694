//! Advisory deployment lock

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::errors::{OrchestratorError, Warnings};
use crate::filesys::file::File;
use crate::utils::hostname;

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub hostname: Option<String>,
    pub acquired_at: DateTime<Utc>,

    /// Distinguishes this holder from a later one with a recycled pid
    pub token: String,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Older than `stale_after`, or a local process that no longer exists
    pub fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        if age.to_std().map(|age| age > stale_after).unwrap_or(false) {
            return true;
        }
        self.hostname == hostname() && !pid_alive(self.pid)
    }
}

/// Private path next to the lock file
fn sibling(file: &File, suffix: &str) -> PathBuf {
    file.path()
        .with_file_name(format!(".{}.{}.{}", file.name(), uuid::Uuid::new_v4(), suffix))
}

async fn modified_age(file: &File) -> std::io::Result<Duration> {
    let modified = tokio::fs::metadata(file.path()).await?.modified()?;
    Ok(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

/// Held for the whole invocation; the file is removed on release or drop
#[derive(Debug)]
pub struct DeploymentLock {
    file: File,
    owner: LockOwner,
    released: bool,
}

impl DeploymentLock {
    /// Publish the lock file, breaking a stale (or, with `force`, any)
    /// existing lock first.
    ///
    /// An unreadable lock younger than `stale_after` is treated as held.
    pub async fn acquire(
        file: File,
        stale_after: Duration,
        force: bool,
        warnings: &mut Warnings,
    ) -> Result<Self, OrchestratorError> {
        let owner = LockOwner::current();
        let contents = serde_json::to_vec_pretty(&owner)?;

        for _ in 0..3 {
            match Self::publish(&file, &contents).await {
                Ok(()) => {
                    debug!("Acquired {}", file.path().display());
                    return Ok(Self {
                        file,
                        owner,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            // Released in the meantime
            let Some(seen) = file.read_optional().await? else {
                continue;
            };

            match serde_json::from_slice::<LockOwner>(&seen) {
                Ok(holder) if force => {
                    warnings.push("lock", format!("breaking lock held by pid {} (forced)", holder.pid));
                }
                Ok(holder) if holder.is_stale(stale_after) => {
                    warnings.push(
                        "lock",
                        format!(
                            "breaking stale lock held by pid {} since {}",
                            holder.pid, holder.acquired_at
                        ),
                    );
                }
                Ok(holder) => {
                    return Err(OrchestratorError::Lock(format!(
                        "another run (pid {} on {}) holds {} since {}",
                        holder.pid,
                        holder.hostname.as_deref().unwrap_or("unknown host"),
                        file.path().display(),
                        holder.acquired_at
                    )));
                }
                Err(e) => {
                    let age = match modified_age(&file).await {
                        Ok(age) => age,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    if !force && age <= stale_after {
                        return Err(OrchestratorError::Lock(format!(
                            "{} is unreadable and was modified {}s ago",
                            file.path().display(),
                            age.as_secs()
                        )));
                    }
                    warnings.push("lock", format!("breaking unreadable lock file: {}", e));
                }
            }

            if !Self::break_if_unchanged(&file, &seen).await? {
                return Err(OrchestratorError::Lock(format!(
                    "{} was taken by another run while breaking it",
                    file.path().display()
                )));
            }
        }

        Err(OrchestratorError::Lock(format!(
            "could not acquire {}",
            file.path().display()
        )))
    }

    /// Write the owner to a private file and hard-link it into place, so the
    /// lock file never exists without its full contents. Fails with
    /// `AlreadyExists` when another lock is present.
    async fn publish(file: &File, contents: &[u8]) -> std::io::Result<()> {
        let temp = sibling(file, "tmp");
        let result = async {
            let mut handle = tokio::fs::File::create(&temp).await?;
            handle.write_all(contents).await?;
            handle.sync_all().await?;
            drop(handle);
            tokio::fs::hard_link(&temp, file.path()).await
        }
        .await;
        let _ = tokio::fs::remove_file(&temp).await;
        result
    }

    /// Move the lock aside and delete it only if it still holds `seen`.
    /// A lock that changed in between is put back. Returns whether the
    /// path is free.
    async fn break_if_unchanged(file: &File, seen: &[u8]) -> Result<bool, OrchestratorError> {
        let aside = sibling(file, "stale");
        match tokio::fs::rename(file.path(), &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = tokio::fs::read(&aside).await;
        let unchanged = moved.as_deref().is_ok_and(|moved| moved == seen);
        if !unchanged {
            match tokio::fs::hard_link(&aside, file.path()).await {
                Ok(()) => debug!("Put back a lock that changed while breaking it"),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    let _ = tokio::fs::remove_file(&aside).await;
                    return Err(e.into());
                }
            }
        }
        tokio::fs::remove_file(&aside).await?;
        Ok(unchanged)
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Remove the lock file if it is still ours
    pub async fn release(mut self) -> Result<(), OrchestratorError> {
        self.released = true;
        match self.file.read_json::<LockOwner>().await {
            Ok(holder) if holder.token == self.owner.token => {
                self.file.delete().await?;
                info!("Released deployment lock");
            }
            Ok(_) => debug!("Lock was taken over, leaving it in place"),
            Err(OrchestratorError::IoError(e)) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let ours = std::fs::read(self.file.path())
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LockOwner>(&bytes).ok())
            .is_some_and(|holder| holder.token == self.owner.token);
        if ours {
            let _ = std::fs::remove_file(self.file.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        let mut warnings = Warnings::new();

        let lock = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings)
            .await
            .unwrap();
        let second = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings).await;
        assert!(matches!(second, Err(OrchestratorError::Lock(_))));

        lock.release().await.unwrap();
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        let mut warnings = Warnings::new();

        {
            let _lock = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings)
                .await
                .unwrap();
            assert!(file.exists().await);
        }
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        let old = LockOwner {
            pid: std::process::id(),
            hostname: hostname(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
            token: "old".to_string(),
        };
        file.write_json(&old).await.unwrap();

        let mut warnings = Warnings::new();
        let lock = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings)
            .await
            .unwrap();

        assert_eq!(warnings.len(), 1);
        assert_ne!(lock.owner().token, "old");
    }

    #[tokio::test]
    async fn test_lock_file_is_complete_once_visible() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        let mut warnings = Warnings::new();

        let lock = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings)
            .await
            .unwrap();

        let holder: LockOwner = file.read_json().await.unwrap();
        assert_eq!(&holder, lock.owner());
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        std::fs::write(file.path(), b"").unwrap();

        let mut warnings = Warnings::new();
        let result = DeploymentLock::acquire(file.clone(), Duration::from_secs(3600), false, &mut warnings).await;

        assert!(matches!(result, Err(OrchestratorError::Lock(_))));
        assert!(warnings.is_empty());
        assert!(file.exists().await);
    }

    #[tokio::test]
    async fn test_old_unreadable_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        std::fs::write(file.path(), b"{").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut warnings = Warnings::new();
        let lock = DeploymentLock::acquire(file.clone(), Duration::from_millis(10), false, &mut warnings)
            .await
            .unwrap();

        assert_eq!(warnings.len(), 1);
        let holder: LockOwner = file.read_json().await.unwrap();
        assert_eq!(holder.token, lock.owner().token);
    }

    #[tokio::test]
    async fn test_break_leaves_a_replaced_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join(".rollctl.lock"));
        let fresh = serde_json::to_vec_pretty(&LockOwner::current()).unwrap();
        std::fs::write(file.path(), &fresh).unwrap();

        // Judged stale from an earlier read that no longer matches
        let removed = DeploymentLock::break_if_unchanged(&file, b"{\"token\":\"old\"}").await.unwrap();
        assert!(!removed);
        assert_eq!(std::fs::read(file.path()).unwrap(), fresh);

        let removed = DeploymentLock::break_if_unchanged(&file, &fresh).await.unwrap();
        assert!(removed);
        assert!(!file.exists().await);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
