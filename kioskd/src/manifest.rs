//! Persisted record of which remote files are mirrored locally.
//!
//! The manifest is one JSON document keyed by local file name. It is never
//! patched in place: a sync pass builds the next manifest in memory and
//! [`ManifestStore::save`] swaps it in with write-temp-then-rename, so readers
//! only ever observe a complete document.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed manifest: {0}")]
    Format(#[from] serde_json::Error),
    #[error("failed to encode manifest: {0}")]
    Encode(serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "driveId")]
    pub remote_id: String,
    pub name: String,
    #[serde(rename = "md5", default)]
    pub checksum: Option<String>,
    #[serde(rename = "modifiedTime", default)]
    pub remote_modified_time: Option<String>,
    #[serde(rename = "localName")]
    pub local_name: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub items: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn contains(&self, local_name: &str) -> bool {
        self.items.contains_key(local_name)
    }

    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&ManifestEntry> {
        self.items.values().find(|entry| entry.remote_id == remote_id)
    }

    /// Inserts `entry`, dropping any other entry that mirrors the same remote
    /// file under a different local name.
    pub fn replace_for_remote(&mut self, entry: ManifestEntry) {
        self.items
            .retain(|key, existing| existing.remote_id != entry.remote_id || *key == entry.local_name);
        self.items.insert(entry.local_name.clone(), entry);
    }

    /// Local names of entries whose remote id is in `wanted`.
    pub fn retained_names(&self, wanted: &HashSet<String>) -> HashSet<String> {
        self.items
            .values()
            .filter(|entry| wanted.contains(&entry.remote_id))
            .map(|entry| entry.local_name.clone())
            .collect()
    }

    /// Entries in playlist order: descriptor position first, then local name.
    pub fn ordered_entries(&self) -> Vec<&ManifestEntry> {
        let mut entries: Vec<_> = self.items.values().collect();
        entries.sort_by(|a, b| {
            let pa = a.position.unwrap_or(u32::MAX);
            let pb = b.position.unwrap_or(u32::MAX);
            pa.cmp(&pb).then_with(|| a.local_name.cmp(&b.local_name))
        });
        entries
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn temp_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "tmp")
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling_with_suffix(&self.path, "lock")
    }

    /// Loads the manifest; a missing file is an empty manifest.
    pub async fn load(&self) -> Result<Manifest, ManifestError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(err) => return Err(err.into()),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Manifest::default());
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn save(&self, manifest: &Manifest) -> Result<(), ManifestError> {
        let encoded = serde_json::to_vec_pretty(manifest).map_err(ManifestError::Encode)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        if let Err(err) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }
        Ok(())
    }
}

/// Identity of one on-disk version of the manifest. An atomic save always
/// lands on a new inode, so a same-length rewrite inside one mtime tick is
/// still seen.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    #[cfg(unix)]
    inode: (u64, u64),
    #[cfg(unix)]
    changed: (i64, i64),
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;

        Self {
            modified: meta.modified().ok(),
            len: meta.len(),
            #[cfg(unix)]
            inode: (meta.dev(), meta.ino()),
            #[cfg(unix)]
            changed: (meta.ctime(), meta.ctime_nsec()),
        }
    }
}

struct CachedManifest {
    stamp: Option<FileStamp>,
    manifest: Arc<Manifest>,
}

/// Read side of the manifest for request handlers. Reloads only when the
/// file's stamp moves, and hands out shared snapshots.
pub struct ManifestCache {
    store: ManifestStore,
    cached: RwLock<Option<CachedManifest>>,
}

impl ManifestCache {
    pub fn new(store: ManifestStore) -> Self {
        Self {
            store,
            cached: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> Result<Arc<Manifest>, ManifestError> {
        let stamp = match tokio::fs::metadata(self.store.path()).await {
            Ok(meta) => Some(FileStamp::of(&meta)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };

        if let Some(manifest) = self.cached_if_fresh(&stamp) {
            return Ok(manifest);
        }

        let manifest = Arc::new(self.store.load().await?);
        if let Ok(mut guard) = self.cached.write() {
            *guard = Some(CachedManifest {
                stamp,
                manifest: Arc::clone(&manifest),
            });
        }
        Ok(manifest)
    }

    fn cached_if_fresh(&self, stamp: &Option<FileStamp>) -> Option<Arc<Manifest>> {
        let guard = self.cached.read().ok()?;
        let cached = guard.as_ref()?;
        (cached.stamp == *stamp).then(|| Arc::clone(&cached.manifest))
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(local_name: &str, remote_id: &str, position: Option<u32>) -> ManifestEntry {
        ManifestEntry {
            remote_id: remote_id.into(),
            name: local_name.into(),
            checksum: Some("abc".into()),
            remote_modified_time: None,
            local_name: local_name.into(),
            size_bytes: 10,
            updated_at: "2024-01-01T00:00:00Z".into(),
            title: None,
            position,
        }
    }

    #[tokio::test]
    async fn missing_manifest_loads_empty() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_replaces_document_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let mut manifest = Manifest::default();
        manifest.replace_for_remote(entry("id1_A.mp4", "id1", Some(0)));

        store.save(&manifest).await.unwrap();

        assert!(!store.temp_path().exists());
        assert_eq!(store.load().await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn uses_canonical_field_names() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let mut manifest = Manifest::default();
        manifest.replace_for_remote(entry("id1_A.mp4", "id1", None));
        store.save(&manifest).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        let item = &raw["items"]["id1_A.mp4"];
        assert_eq!(item["driveId"], "id1");
        assert_eq!(item["md5"], "abc");
        assert_eq!(item["localName"], "id1_A.mp4");
        assert_eq!(item["size"], 10);
        assert!(item.get("position").is_none());
    }

    #[tokio::test]
    async fn malformed_manifest_is_a_format_error() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        std::fs::write(store.path(), b"{ not json").unwrap();
        assert!(matches!(
            store.load().await,
            Err(ManifestError::Format(_))
        ));
    }

    #[test]
    fn replace_for_remote_drops_renamed_copies() {
        let mut manifest = Manifest::default();
        manifest.replace_for_remote(entry("id1_old.mp4", "id1", None));
        manifest.replace_for_remote(entry("id2_B.mp4", "id2", None));
        manifest.replace_for_remote(entry("id1_new.mp4", "id1", None));

        assert!(!manifest.contains("id1_old.mp4"));
        assert!(manifest.contains("id1_new.mp4"));
        assert!(manifest.contains("id2_B.mp4"));
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn ordered_entries_follow_position_then_name() {
        let mut manifest = Manifest::default();
        manifest.replace_for_remote(entry("c", "3", None));
        manifest.replace_for_remote(entry("b", "2", Some(0)));
        manifest.replace_for_remote(entry("a", "1", Some(1)));

        let names: Vec<_> = manifest
            .ordered_entries()
            .into_iter()
            .map(|e| e.local_name.as_str())
            .collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn cache_reloads_after_atomic_replace() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let cache = ManifestCache::new(store.clone());

        assert!(cache.snapshot().await.unwrap().is_empty());

        let mut manifest = Manifest::default();
        manifest.replace_for_remote(entry("id1_A.mp4", "id1", None));
        store.save(&manifest).await.unwrap();

        let snapshot = cache.snapshot().await.unwrap();
        assert!(snapshot.contains("id1_A.mp4"));
    }

    #[tokio::test]
    async fn cache_sees_same_length_rewrite_with_unchanged_mtime() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let cache = ManifestCache::new(store.clone());

        let mut first = Manifest::default();
        first.replace_for_remote(entry("id1_A.mp4", "id1", None));
        store.save(&first).await.unwrap();
        let modified = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        assert!(cache.snapshot().await.unwrap().contains("id1_A.mp4"));

        let mut second = Manifest::default();
        second.replace_for_remote(entry("id1_B.mp4", "id1", None));
        store.save(&second).await.unwrap();
        std::fs::File::options()
            .write(true)
            .open(store.path())
            .unwrap()
            .set_modified(modified)
            .unwrap();
        assert_eq!(
            std::fs::metadata(store.path()).unwrap().len(),
            serde_json::to_vec_pretty(&first).unwrap().len() as u64
        );

        let snapshot = cache.snapshot().await.unwrap();
        assert!(snapshot.contains("id1_B.mp4"));
        assert!(!snapshot.contains("id1_A.mp4"));
    }
}
