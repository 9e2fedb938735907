use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::lock::{LockError, PassLock};
use super::paths::local_name_for;
use super::remote::{RemoteDirectory, RemoteError, RemoteFile};
use super::transfer::partial_path;
use crate::manifest::{ManifestEntry, ManifestError, ManifestStore};

pub const DEFAULT_DESCRIPTOR_NAME: &str = "playlist.json";
pub const DEFAULT_MAX_BYTES: u64 = 1_000_000_000;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote listing failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("failed to fetch playlist descriptor: {0}")]
    DescriptorFetch(RemoteError),
    #[error("malformed playlist descriptor: {0}")]
    Descriptor(serde_json::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),
    #[error("sync pass already in progress")]
    PassInProgress,
    #[error("lock error: {0}")]
    Lock(LockError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    /// Drive refused the access token while listing or fetching the descriptor.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            SyncError::Remote(err) | SyncError::DescriptorFetch(err) => err.is_auth_failure(),
            _ => false,
        }
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy => SyncError::PassInProgress,
            other => SyncError::Lock(other),
        }
    }
}

/// Per-item problems. They are reported, never fatal to a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemIssue {
    MissingSource { name: String },
    OversizeSkipped { name: String, size_bytes: u64, limit: u64 },
    OversizeDownloaded { name: String, size_bytes: u64, limit: u64 },
    Transport { name: String, message: String },
    Cancelled { name: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub descriptor_found: bool,
    pub wanted: usize,
    pub downloaded: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub issues: Vec<ItemIssue>,
    pub manifest_entries: usize,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlaylistDescriptor {
    #[serde(default)]
    pub items: Vec<DescriptorItem>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DescriptorItem {
    pub file: String,
    #[serde(default)]
    pub title: Option<String>,
}

impl PlaylistDescriptor {
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub folder_id: String,
    pub media_root: PathBuf,
    pub descriptor_name: String,
    pub max_bytes: u64,
    pub download_concurrency: usize,
}

impl SyncSettings {
    pub fn new(folder_id: impl Into<String>, media_root: impl Into<PathBuf>) -> Self {
        Self {
            folder_id: folder_id.into(),
            media_root: media_root.into(),
            descriptor_name: DEFAULT_DESCRIPTOR_NAME.to_string(),
            max_bytes: DEFAULT_MAX_BYTES,
            download_concurrency: 2,
        }
    }
}

pub struct SyncEngine<R> {
    remote: R,
    store: ManifestStore,
    lock: PassLock,
    settings: SyncSettings,
    cancel: CancellationToken,
}

struct Placement {
    title: Option<String>,
    position: u32,
}

impl<R: RemoteDirectory> SyncEngine<R> {
    pub fn new(remote: R, store: ManifestStore, settings: SyncSettings) -> Self {
        let lock = PassLock::new(store.lock_path());
        Self {
            remote,
            store,
            lock,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_lock(mut self, lock: PassLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn cancel_all_transfers(&self) {
        self.cancel.cancel();
    }

    /// Runs one reconciliation pass: list, diff, download, delete, persist.
    pub async fn run_pass(&self) -> Result<SyncReport, SyncError> {
        let _guard = self.lock.acquire().await?;
        let span = tracing::info_span!("sync_pass", folder_id = %self.settings.folder_id);
        self.reconcile().instrument(span).await
    }

    async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        let listing = self.remote.list(&self.settings.folder_id).await?;
        let Some(descriptor_file) = listing
            .iter()
            .find(|f| f.name == self.settings.descriptor_name)
        else {
            tracing::warn!(
                descriptor = %self.settings.descriptor_name,
                "playlist descriptor not found in remote folder, nothing to sync"
            );
            return Ok(SyncReport::default());
        };

        let descriptor = self.fetch_descriptor(descriptor_file).await?;
        let mut manifest = self.store.load().await?;
        tokio::fs::create_dir_all(&self.settings.media_root).await?;

        let mut report = SyncReport {
            descriptor_found: true,
            ..SyncReport::default()
        };

        let mut by_name: HashMap<&str, &RemoteFile> = HashMap::new();
        for file in &listing {
            by_name.insert(file.name.as_str(), file);
        }

        let mut seen_names = HashSet::new();
        let mut wanted_ids = HashSet::new();
        let mut placements: HashMap<String, Placement> = HashMap::new();
        let mut to_download = Vec::new();

        for (position, item) in descriptor.items.iter().enumerate() {
            if !seen_names.insert(item.file.as_str()) {
                continue;
            }
            let Some(file) = by_name.get(item.file.as_str()).copied() else {
                tracing::error!(name = %item.file, "playlist item not found in remote folder, skipping");
                report.issues.push(ItemIssue::MissingSource {
                    name: item.file.clone(),
                });
                continue;
            };
            wanted_ids.insert(file.id.clone());
            placements.entry(file.id.clone()).or_insert(Placement {
                title: item.title.clone(),
                position: u32::try_from(position).unwrap_or(u32::MAX),
            });

            if file.size_bytes > self.settings.max_bytes {
                tracing::error!(
                    name = %file.name,
                    size_bytes = file.size_bytes,
                    limit = self.settings.max_bytes,
                    "remote file exceeds size cap, skipping download"
                );
                report.issues.push(ItemIssue::OversizeSkipped {
                    name: file.name.clone(),
                    size_bytes: file.size_bytes,
                    limit: self.settings.max_bytes,
                });
                continue;
            }

            let existing = manifest.find_by_remote_id(&file.id);
            let local_present = match existing {
                Some(entry) => {
                    is_regular_file(&self.settings.media_root.join(&entry.local_name)).await
                }
                None => false,
            };
            if needs_download(existing, file, local_present) {
                to_download.push(file.clone());
            } else if let Some(entry) = existing {
                tracing::debug!(local_name = %entry.local_name, "unchanged, skipping download");
                report.unchanged.push(entry.local_name.clone());
            }
        }
        report.wanted = wanted_ids.len();

        let pending: Vec<_> = to_download
            .iter()
            .map(|file| self.download_one(file))
            .collect();
        let outcomes: Vec<Result<ManifestEntry, ItemIssue>> = futures_util::stream::iter(pending)
            .buffer_unordered(self.settings.download_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(entry) => {
                    report.downloaded.push(entry.local_name.clone());
                    manifest.replace_for_remote(entry);
                }
                Err(issue) => report.issues.push(issue),
            }
        }
        report.downloaded.sort();

        for entry in manifest.items.values_mut() {
            if let Some(placement) = placements.get(&entry.remote_id) {
                entry.title = placement.title.clone();
                entry.position = Some(placement.position);
            }
        }

        let retained = manifest.retained_names(&wanted_ids);
        let present = self
            .remove_unretained_files(&retained, &mut report.deleted)
            .await?;
        manifest
            .items
            .retain(|name, _| retained.contains(name) && present.contains(name));

        self.store.save(&manifest).await?;
        report.manifest_entries = manifest.len();

        tracing::info!(
            downloaded = report.downloaded.len(),
            unchanged = report.unchanged.len(),
            deleted = report.deleted.len(),
            issues = report.issues.len(),
            entries = report.manifest_entries,
            "sync pass complete"
        );
        Ok(report)
    }

    async fn fetch_descriptor(
        &self,
        descriptor_file: &RemoteFile,
    ) -> Result<PlaylistDescriptor, SyncError> {
        let temp = self
            .store
            .path()
            .with_file_name(format!("{}.download", self.settings.descriptor_name));
        if let Some(parent) = temp.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.remote
            .download(descriptor_file, &temp)
            .await
            .map_err(SyncError::DescriptorFetch)?;
        let raw = tokio::fs::read(&temp).await;
        let _ = tokio::fs::remove_file(&temp).await;
        let descriptor = PlaylistDescriptor::parse(&raw?).map_err(SyncError::Descriptor)?;
        tracing::info!(items = descriptor.items.len(), "playlist descriptor loaded");
        Ok(descriptor)
    }

    async fn download_one(&self, file: &RemoteFile) -> Result<ManifestEntry, ItemIssue> {
        if self.cancel.is_cancelled() {
            return Err(ItemIssue::Cancelled {
                name: file.name.clone(),
            });
        }
        let local_name = local_name_for(&file.id, &file.name);
        let dest = self.settings.media_root.join(&local_name);
        tracing::info!(name = %file.name, local_name = %local_name, "downloading");

        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.remote.download(file, &dest) => Some(result),
        };
        let result = match result {
            Some(result) => result,
            None => {
                let _ = tokio::fs::remove_file(partial_path(&dest)).await;
                return Err(ItemIssue::Cancelled {
                    name: file.name.clone(),
                });
            }
        };
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(partial_path(&dest)).await;
            return Err(self.issue_for_download_error(file, err));
        }

        let size_bytes = match tokio::fs::metadata(&dest).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::error!(local_name = %local_name, error = %err, "downloaded file is not readable");
                return Err(ItemIssue::Transport {
                    name: file.name.clone(),
                    message: err.to_string(),
                });
            }
        };
        if size_bytes > self.settings.max_bytes {
            tracing::error!(
                local_name = %local_name,
                size_bytes,
                limit = self.settings.max_bytes,
                "downloaded file exceeds size cap, deleting local copy"
            );
            if let Err(err) = tokio::fs::remove_file(&dest).await {
                tracing::warn!(local_name = %local_name, error = %err, "failed to delete oversize download");
            }
            return Err(ItemIssue::OversizeDownloaded {
                name: file.name.clone(),
                size_bytes,
                limit: self.settings.max_bytes,
            });
        }

        tracing::info!(local_name = %local_name, size_bytes, "saved");
        Ok(ManifestEntry {
            remote_id: file.id.clone(),
            name: file.name.clone(),
            checksum: file.checksum.clone(),
            remote_modified_time: file.modified_time.clone(),
            local_name,
            size_bytes,
            updated_at: now_rfc3339(),
            title: None,
            position: None,
        })
    }

    fn issue_for_download_error(&self, file: &RemoteFile, err: RemoteError) -> ItemIssue {
        if err.is_cancelled() {
            return ItemIssue::Cancelled {
                name: file.name.clone(),
            };
        }
        if err.is_too_large() {
            tracing::error!(name = %file.name, limit = self.settings.max_bytes, "download exceeded size cap");
            return ItemIssue::OversizeDownloaded {
                name: file.name.clone(),
                size_bytes: file.size_bytes,
                limit: self.settings.max_bytes,
            };
        }
        tracing::error!(
            name = %file.name,
            error = %err,
            retryable = err.is_retryable(),
            "download failed"
        );
        ItemIssue::Transport {
            name: file.name.clone(),
            message: err.to_string(),
        }
    }

    /// Deletes regular files directly under the media root that are not in
    /// `retained`. Returns the names of regular files still present.
    async fn remove_unretained_files(
        &self,
        retained: &HashSet<String>,
        deleted: &mut Vec<String>,
    ) -> Result<HashSet<String>, SyncError> {
        let protected = [
            self.store.path().to_path_buf(),
            self.store.temp_path(),
            self.store.lock_path(),
        ];
        let mut present = HashSet::new();
        let mut dir = tokio::fs::read_dir(&self.settings.media_root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if protected.iter().any(|p| *p == path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let keep = entry
                .file_name()
                .to_str()
                .is_some_and(|n| retained.contains(n));
            if keep {
                present.insert(name);
                continue;
            }
            tracing::info!(local_name = %name, "deleting local file not in playlist");
            match tokio::fs::remove_file(&path).await {
                Ok(()) => deleted.push(name),
                Err(err) => {
                    tracing::warn!(local_name = %name, error = %err, "failed to delete local file");
                }
            }
        }
        deleted.sort();
        Ok(present)
    }
}

/// Whether `remote` has to be fetched again given the manifest's record of it.
pub fn needs_download(
    existing: Option<&ManifestEntry>,
    remote: &RemoteFile,
    local_present: bool,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    if !local_present {
        return true;
    }
    match (remote.checksum.as_deref(), existing.checksum.as_deref()) {
        (Some(remote_sum), Some(local_sum)) => !remote_sum.eq_ignore_ascii_case(local_sum),
        _ => match remote.modified_time.as_deref() {
            Some(remote_modified) => {
                existing.remote_modified_time.as_deref() != Some(remote_modified)
            }
            None => false,
        },
    }
}

async fn is_regular_file(path: &Path) -> bool {
    tokio::fs::symlink_metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
