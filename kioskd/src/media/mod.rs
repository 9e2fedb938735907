//! HTTP endpoint serving mirrored files to kiosk displays.
//!
//! Only names present in the current manifest are served; everything else is
//! a 404, even when a file with that name sits in the media root. Range
//! requests are answered with `206` and streamed straight from disk.

pub mod range;

use std::io::SeekFrom;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::manifest::{Manifest, ManifestCache};
use crate::sync::paths::media_path_for;
use range::parse_range;

const MEDIA_MIME_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("m4v", "video/x-m4v"),
    ("ogv", "video/ogg"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
];

#[derive(Clone)]
pub struct MediaState {
    media_root: PathBuf,
    manifest: Arc<ManifestCache>,
}

impl MediaState {
    pub fn new(media_root: impl Into<PathBuf>, manifest: Arc<ManifestCache>) -> Self {
        Self {
            media_root: media_root.into(),
            manifest,
        }
    }
}

pub fn router(state: MediaState) -> Router {
    Router::new()
        .route("/media", get(media_by_query))
        .route("/media/{name}", get(media_by_path))
        .route("/playlist", get(playlist))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("missing media name")]
    BadRequest,
    #[error("not found")]
    NotFound,
    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for MediaError {
    fn into_response(self) -> Response {
        match self {
            MediaError::BadRequest => (StatusCode::BAD_REQUEST, "missing name").into_response(),
            MediaError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            MediaError::RangeNotSatisfiable { size } => (
                StatusCode::RANGE_NOT_SATISFIABLE,
                [(header::CONTENT_RANGE, format!("bytes */{size}"))],
            )
                .into_response(),
            MediaError::Internal(message) => {
                tracing::error!(error = %message, "media request failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    name: Option<String>,
}

/// One `/playlist` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistItem {
    pub title: String,
    pub local_name: String,
    pub url: String,
    pub size: u64,
    pub modified_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaylistResponse {
    pub items: Vec<PlaylistItem>,
}

pub fn media_url(local_name: &str) -> String {
    format!("/media?name={}", urlencoding::encode(local_name))
}

pub fn playlist_items(manifest: &Manifest) -> Vec<PlaylistItem> {
    manifest
        .ordered_entries()
        .into_iter()
        .map(|entry| PlaylistItem {
            title: entry.title.clone().unwrap_or_else(|| entry.name.clone()),
            local_name: entry.local_name.clone(),
            url: media_url(&entry.local_name),
            size: entry.size_bytes,
            modified_time: entry.remote_modified_time.clone(),
        })
        .collect()
}

pub fn content_type_for(path: &FsPath) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .and_then(|ext| {
            MEDIA_MIME_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, mime)| *mime)
        })
        .unwrap_or("application/octet-stream")
}

async fn media_by_query(
    State(state): State<MediaState>,
    headers: HeaderMap,
    Query(query): Query<MediaQuery>,
) -> Result<Response, MediaError> {
    serve_media(&state, query.name.as_deref().unwrap_or_default(), &headers).await
}

async fn media_by_path(
    State(state): State<MediaState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Response, MediaError> {
    serve_media(&state, &name, &headers).await
}

async fn playlist(State(state): State<MediaState>) -> Response {
    match state.manifest.snapshot().await {
        Ok(manifest) => Json(PlaylistResponse {
            items: playlist_items(&manifest),
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "manifest unreadable, serving empty playlist");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PlaylistResponse::default()),
            )
                .into_response()
        }
    }
}

async fn serve_media(
    state: &MediaState,
    name: &str,
    headers: &HeaderMap,
) -> Result<Response, MediaError> {
    if name.is_empty() {
        return Err(MediaError::BadRequest);
    }
    let manifest = match state.manifest.snapshot().await {
        Ok(manifest) => manifest,
        Err(err) => {
            tracing::warn!(error = %err, "manifest unreadable, refusing media request");
            return Err(MediaError::NotFound);
        }
    };
    if !manifest.contains(name) {
        tracing::debug!(local_name = %name, "not in manifest");
        return Err(MediaError::NotFound);
    }
    let path = media_path_for(&state.media_root, name).map_err(|_| MediaError::NotFound)?;
    let is_file = tokio::fs::symlink_metadata(&path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);
    if !is_file {
        tracing::warn!(local_name = %name, "manifest entry has no file on disk");
        return Err(MediaError::NotFound);
    }

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| MediaError::NotFound)?;
    let size = file
        .metadata()
        .await
        .map_err(|err| MediaError::Internal(err.to_string()))?
        .len();
    let content_type = HeaderValue::from_static(content_type_for(&path));

    let Some(raw_range) = headers.get(header::RANGE) else {
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, size)
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from_stream(ReaderStream::new(file)))
            .map_err(|err| MediaError::Internal(err.to_string()));
    };

    let range = raw_range
        .to_str()
        .map_err(|_| MediaError::RangeNotSatisfiable { size })
        .and_then(|raw| {
            parse_range(raw, size).map_err(|err| {
                tracing::debug!(local_name = %name, range = %raw, error = %err, "rejecting range");
                MediaError::RangeNotSatisfiable { size }
            })
        })?;

    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(|err| MediaError::Internal(err.to_string()))?;
    let body = Body::from_stream(ReaderStream::new(file.take(range.len())));

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, range.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_RANGE, range.content_range(size))
        .body(body)
        .map_err(|err| MediaError::Internal(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestEntry;

    fn entry(local_name: &str, position: Option<u32>, title: Option<&str>) -> ManifestEntry {
        ManifestEntry {
            remote_id: local_name.split('_').next().unwrap_or_default().to_string(),
            name: local_name.to_string(),
            checksum: None,
            remote_modified_time: Some("2024-05-01T10:00:00Z".into()),
            local_name: local_name.to_string(),
            size_bytes: 10,
            updated_at: "2024-05-01T10:01:00Z".into(),
            title: title.map(str::to_string),
            position,
        }
    }

    #[test]
    fn playlist_follows_descriptor_order_and_encodes_urls() {
        let mut manifest = Manifest::default();
        for e in [
            entry("b_Second clip.mp4", Some(1), None),
            entry("a_first.mp4", Some(0), Some("Welcome")),
            entry("z_orphan.mp4", None, None),
        ] {
            manifest.items.insert(e.local_name.clone(), e);
        }

        let items = playlist_items(&manifest);

        let names: Vec<_> = items.iter().map(|i| i.local_name.as_str()).collect();
        assert_eq!(names, ["a_first.mp4", "b_Second clip.mp4", "z_orphan.mp4"]);
        assert_eq!(items[0].title, "Welcome");
        assert_eq!(items[1].title, "b_Second clip.mp4");
        assert_eq!(items[1].url, "/media?name=b_Second%20clip.mp4");
    }

    #[test]
    fn content_type_falls_back_to_octet_stream() {
        assert_eq!(content_type_for(FsPath::new("a.MP4")), "video/mp4");
        assert_eq!(content_type_for(FsPath::new("a.webm")), "video/webm");
        assert_eq!(content_type_for(FsPath::new("a.png")), "image/png");
        assert_eq!(
            content_type_for(FsPath::new("a.bin")),
            "application/octet-stream"
        );
        assert_eq!(
            content_type_for(FsPath::new("noext")),
            "application/octet-stream"
        );
    }
}
