use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use drive_core::DriveClient;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::logging::LogFormat;
use crate::manifest::{ManifestCache, ManifestStore};
use crate::media::{MediaState, router};
use crate::sync::engine::{DEFAULT_DESCRIPTOR_NAME, DEFAULT_MAX_BYTES};
use crate::sync::transfer::{TransferClient, TransferConfig};
use crate::sync::{DriveRemote, SyncEngine, SyncError, SyncReport, SyncSettings};

const DEFAULT_DATA_DIR_NAME: &str = "kiosk-mirror";
const DEFAULT_DRIVE_API_URL: &str = "https://www.googleapis.com";
const DEFAULT_DOWNLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub drive_folder_id: Option<String>,
    pub drive_token: Option<String>,
    pub drive_api_url: String,
    pub media_root: PathBuf,
    pub manifest_path: PathBuf,
    pub descriptor_name: String,
    pub max_bytes: u64,
    pub download_concurrency: usize,
    pub sync_interval: Duration,
    pub listen_addr: SocketAddr,
    pub log_format: LogFormat,
    pub enable_sync: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let data_root = default_data_root();
        let media_root = read_path_env(&lookup, "KIOSK_MEDIA_DIR", &home)
            .unwrap_or_else(|| data_root.join("media"));
        let manifest_path = read_path_env(&lookup, "KIOSK_MANIFEST_PATH", &home)
            .unwrap_or_else(|| data_root.join("manifest.json"));
        let descriptor_name = read_string_env(&lookup, "KIOSK_PLAYLIST_NAME")
            .unwrap_or_else(|| DEFAULT_DESCRIPTOR_NAME.to_string());
        let drive_api_url = read_string_env(&lookup, "KIOSK_DRIVE_API_URL")
            .unwrap_or_else(|| DEFAULT_DRIVE_API_URL.to_string());
        let listen_addr = read_string_env(&lookup, "KIOSK_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid KIOSK_LISTEN_ADDR: {listen_addr}"))?;
        let log_format = match read_string_env(&lookup, "KIOSK_LOG_FORMAT") {
            Some(value) => value
                .parse::<LogFormat>()
                .context("invalid KIOSK_LOG_FORMAT")?,
            None => LogFormat::default(),
        };

        Ok(Self {
            drive_folder_id: read_string_env(&lookup, "KIOSK_DRIVE_FOLDER_ID"),
            drive_token: read_string_env(&lookup, "KIOSK_DRIVE_TOKEN"),
            drive_api_url,
            media_root,
            manifest_path,
            descriptor_name,
            max_bytes: read_u64_env(&lookup, "KIOSK_MAX_BYTES", DEFAULT_MAX_BYTES),
            download_concurrency: read_u64_env(
                &lookup,
                "KIOSK_DOWNLOAD_CONCURRENCY",
                DEFAULT_DOWNLOAD_CONCURRENCY,
            ) as usize,
            sync_interval: Duration::from_secs(read_u64_env(
                &lookup,
                "KIOSK_SYNC_INTERVAL_SECS",
                DEFAULT_SYNC_INTERVAL_SECS,
            )),
            listen_addr,
            log_format,
            enable_sync: read_bool_env(&lookup, "KIOSK_ENABLE_SYNC", true),
        })
    }

    pub fn sync_settings(&self) -> Option<SyncSettings> {
        let folder_id = self.drive_folder_id.clone()?;
        Some(SyncSettings {
            folder_id,
            media_root: self.media_root.clone(),
            descriptor_name: self.descriptor_name.clone(),
            max_bytes: self.max_bytes,
            download_concurrency: self.download_concurrency,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Option<Arc<SyncEngine<DriveRemote>>>,
    manifest: Arc<ManifestCache>,
    shutdown: CancellationToken,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.media_root)
            .await
            .with_context(|| format!("failed to create media root at {:?}", config.media_root))?;
        if let Some(parent) = config.manifest_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create state dir at {parent:?}"))?;
        }

        let shutdown = CancellationToken::new();
        let store = ManifestStore::new(&config.manifest_path);
        let manifest = Arc::new(ManifestCache::new(store.clone()));
        let engine = match (config.sync_settings(), config.drive_token.as_deref()) {
            (Some(settings), Some(token)) if config.enable_sync => {
                let client = DriveClient::with_base_url(&config.drive_api_url, token)
                    .context("failed to build Drive client")?;
                let transfer = TransferClient::with_config(TransferConfig {
                    download_concurrency: config.download_concurrency,
                    max_bytes: Some(config.max_bytes),
                })
                .with_cancellation(shutdown.clone());
                let engine = SyncEngine::new(DriveRemote::new(client, transfer), store, settings)
                    .with_cancellation(shutdown.clone());
                Some(Arc::new(engine))
            }
            _ => None,
        };

        Ok(Self {
            config,
            engine,
            manifest,
            shutdown,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    fn require_engine(&self) -> anyhow::Result<&Arc<SyncEngine<DriveRemote>>> {
        if !self.config.enable_sync {
            anyhow::bail!("syncing is disabled by KIOSK_ENABLE_SYNC");
        }
        if self.config.drive_folder_id.is_none() {
            anyhow::bail!("KIOSK_DRIVE_FOLDER_ID is not set");
        }
        self.engine
            .as_ref()
            .context("KIOSK_DRIVE_TOKEN is not set")
    }

    /// Runs exactly one sync pass.
    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        let engine = self.require_engine()?;
        engine.run_pass().await.context("sync pass aborted")
    }

    /// Serves the media endpoint, and with `with_sync` also runs the periodic
    /// sync loop, until Ctrl-C.
    pub async fn run(self, with_sync: bool) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;
        let app = router(MediaState::new(
            self.config.media_root.clone(),
            Arc::clone(&self.manifest),
        ));
        tracing::info!(
            addr = %self.config.listen_addr,
            media_root = %self.config.media_root.display(),
            manifest = %self.config.manifest_path.display(),
            "media endpoint listening"
        );

        let server_shutdown = self.shutdown.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await
        });

        let sync_handle = if with_sync {
            match self.require_engine() {
                Ok(engine) => Some(tokio::spawn(run_sync_loop(
                    Arc::clone(engine),
                    self.config.sync_interval,
                    self.shutdown.clone(),
                ))),
                Err(err) => {
                    tracing::warn!(error = %err, "periodic sync disabled, serving existing mirror only");
                    None
                }
            }
        } else {
            None
        };

        let server_exited = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                tracing::info!("shutdown requested");
                None
            }
            res = &mut server => Some(res),
        };

        self.shutdown.cancel();
        if let Some(handle) = sync_handle
            && let Err(err) = handle.await
        {
            tracing::warn!(error = %err, "sync loop ended abnormally");
        }
        let served = match server_exited {
            Some(res) => res,
            None => server.await,
        };
        served
            .context("media server task failed")?
            .context("media server failed")?;
        Ok(())
    }
}

async fn run_sync_loop(
    engine: Arc<SyncEngine<DriveRemote>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!(
        folder_id = %engine.settings().folder_id,
        interval_secs = interval.as_secs(),
        "sync loop started"
    );
    loop {
        match engine.run_pass().await {
            Ok(report) if !report.descriptor_found => {
                tracing::warn!("no playlist descriptor in the remote folder");
            }
            Ok(_) => {}
            Err(SyncError::PassInProgress) => {
                tracing::warn!("previous sync pass still running, skipping this tick");
            }
            Err(err) if err.is_auth_failure() => {
                tracing::error!(error = %err, "Drive rejected the access token, replace KIOSK_DRIVE_TOKEN");
            }
            Err(err) => {
                tracing::error!(error = %err, "sync pass aborted");
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::info!("sync loop stopped");
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
