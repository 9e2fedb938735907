use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another sync pass holds the lock")]
    Busy,
    #[error("lock file I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Keeps sync passes from overlapping: a single-flight guard inside the
/// process plus an exclusive lock file for other processes on the same
/// manifest.
#[derive(Clone)]
pub struct PassLock {
    in_process: Arc<Mutex<()>>,
    lock_path: PathBuf,
    stale_after: Duration,
}

pub struct PassGuard {
    _in_process: OwnedMutexGuard<()>,
    lock_path: PathBuf,
}

impl PassLock {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            in_process: Arc::new(Mutex::new(())),
            lock_path: lock_path.into(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    pub async fn acquire(&self) -> Result<PassGuard, LockError> {
        let in_process = Arc::clone(&self.in_process)
            .try_lock_owned()
            .map_err(|_| LockError::Busy)?;

        if let Some(parent) = self.lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        match create_lock_file(&self.lock_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !self.is_stale().await? {
                    return Err(LockError::Busy);
                }
                tracing::warn!(path = %self.lock_path.display(), "taking over stale sync lock");
                match tokio::fs::remove_file(&self.lock_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                create_lock_file(&self.lock_path).await.map_err(|err| {
                    if err.kind() == io::ErrorKind::AlreadyExists {
                        LockError::Busy
                    } else {
                        LockError::Io(err)
                    }
                })?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(PassGuard {
            _in_process: in_process,
            lock_path: self.lock_path.clone(),
        })
    }

    async fn is_stale(&self) -> Result<bool, io::Error> {
        let meta = match tokio::fs::metadata(&self.lock_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err),
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or_default();
        Ok(age >= self.stale_after)
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.lock_path)
            && err.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.lock_path.display(), error = %err, "failed to release sync lock");
        }
    }
}

async fn create_lock_file(path: &Path) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(format!("{}\n", std::process::id()).as_bytes())
        .await?;
    file.flush().await
}
