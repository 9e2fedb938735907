use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use kioskd::manifest::{Manifest, ManifestCache, ManifestEntry, ManifestStore};
use kioskd::media::{MediaState, PlaylistResponse, router};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE};
use tempfile::{TempDir, tempdir};
use tokio::net::TcpListener;

struct Server {
    _dir: TempDir,
    root: PathBuf,
    store: ManifestStore,
    addr: SocketAddr,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

fn entry(local_name: &str, size: u64, position: u32) -> ManifestEntry {
    ManifestEntry {
        remote_id: local_name.split('_').next().unwrap().to_string(),
        name: local_name.split_once('_').unwrap().1.to_string(),
        checksum: Some("00".into()),
        remote_modified_time: Some("2024-05-01T10:00:00Z".into()),
        local_name: local_name.to_string(),
        size_bytes: size,
        updated_at: "2024-05-01T10:01:00Z".into(),
        title: None,
        position: Some(position),
    }
}

fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn start(files: &[(&str, usize)], listed: &[&str]) -> Server {
    let dir = tempdir().unwrap();
    let root = dir.path().join("media");
    std::fs::create_dir_all(&root).unwrap();
    for (name, len) in files {
        std::fs::write(root.join(name), sample_bytes(*len)).unwrap();
    }
    let store = ManifestStore::new(dir.path().join("manifest.json"));
    let mut manifest = Manifest::default();
    for (position, name) in listed.iter().enumerate() {
        let len = files
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, len)| *len as u64)
            .unwrap_or_default();
        manifest
            .items
            .insert(name.to_string(), entry(name, len, position as u32));
    }
    store.save(&manifest).await.unwrap();

    let cache = Arc::new(ManifestCache::new(store.clone()));
    let app = router(MediaState::new(&root, cache));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        _dir: dir,
        root,
        store,
        addr,
    }
}

async fn get(url: &str, range: Option<&str>) -> reqwest::Response {
    let client = reqwest::Client::new();
    let mut request = client.get(url);
    if let Some(range) = range {
        request = request.header(RANGE, range);
    }
    request.send().await.unwrap()
}

#[tokio::test]
async fn serves_whole_file_without_range() {
    let server = start(&[("id1_clip.mp4", 1000)], &["id1_clip.mp4"]).await;

    let response = get(&server.url("/media?name=id1_clip.mp4"), None).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers()[CONTENT_LENGTH], "1000");
    assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
    assert_eq!(response.bytes().await.unwrap().as_ref(), sample_bytes(1000));
}

#[tokio::test]
async fn serves_partial_content_for_a_closed_range() {
    let server = start(&[("id1_clip.mp4", 1000)], &["id1_clip.mp4"]).await;

    let response = get(&server.url("/media?name=id1_clip.mp4"), Some("bytes=0-99")).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-99/1000");
    assert_eq!(response.headers()[CONTENT_LENGTH], "100");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &sample_bytes(1000)[..100]);
}

#[tokio::test]
async fn open_ended_range_runs_to_the_last_byte() {
    let server = start(&[("id1_clip.mp4", 1000)], &["id1_clip.mp4"]).await;

    let response = get(&server.url("/media/id1_clip.mp4"), Some("bytes=900-")).await;

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[CONTENT_RANGE], "bytes 900-999/1000");
    let body = response.bytes().await.unwrap();
    assert_eq!(body.as_ref(), &sample_bytes(1000)[900..]);
}

#[tokio::test]
async fn unsatisfiable_ranges_get_416_with_the_size() {
    let server = start(&[("id1_clip.mp4", 1000)], &["id1_clip.mp4"]).await;
    let url = server.url("/media?name=id1_clip.mp4");

    for range in ["bytes=900-1200", "bytes=-100", "bytes=0-1,4-5", "bytes=x-1", "chunks=0-1"] {
        let response = get(&url, Some(range)).await;
        assert_eq!(
            response.status(),
            StatusCode::RANGE_NOT_SATISFIABLE,
            "range {range}"
        );
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */1000");
    }
}

#[tokio::test]
async fn files_outside_the_manifest_are_not_found() {
    let server = start(
        &[("id1_clip.mp4", 10), ("stray.mp4", 10)],
        &["id1_clip.mp4"],
    )
    .await;

    let stray = get(&server.url("/media?name=stray.mp4"), None).await;
    assert_eq!(stray.status(), StatusCode::NOT_FOUND);
    let stray_body = stray.text().await.unwrap();

    let traversal = get(&server.url("/media?name=..%2Fmanifest.json"), None).await;
    assert_eq!(traversal.status(), StatusCode::NOT_FOUND);
    assert_eq!(traversal.text().await.unwrap(), stray_body);
}

#[tokio::test]
async fn listed_but_missing_file_looks_like_an_unknown_name() {
    let server = start(&[("id1_clip.mp4", 10)], &["id1_clip.mp4", "id2_gone.mp4"]).await;

    let unknown = get(&server.url("/media?name=nope.mp4"), None).await;
    let missing = get(&server.url("/media?name=id2_gone.mp4"), None).await;

    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(unknown.text().await.unwrap(), missing.text().await.unwrap());
}

#[tokio::test]
async fn empty_or_missing_name_is_a_bad_request() {
    let server = start(&[], &[]).await;

    assert_eq!(
        get(&server.url("/media"), None).await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        get(&server.url("/media?name="), None).await.status(),
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn playlist_lists_entries_in_order_with_media_urls() {
    let server = start(
        &[("b_second clip.webm", 20), ("a_first.mp4", 10)],
        &["b_second clip.webm", "a_first.mp4"],
    )
    .await;

    let response = get(&server.url("/playlist"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let playlist: PlaylistResponse = serde_json::from_str(&response.text().await.unwrap()).unwrap();

    let names: Vec<_> = playlist.items.iter().map(|i| i.local_name.as_str()).collect();
    assert_eq!(names, ["b_second clip.webm", "a_first.mp4"]);
    assert_eq!(playlist.items[0].url, "/media?name=b_second%20clip.webm");
    assert_eq!(playlist.items[0].title, "second clip.webm");
    assert_eq!(playlist.items[1].size, 10);

    let follow = get(&server.url(&playlist.items[0].url), None).await;
    assert_eq!(follow.status(), StatusCode::OK);
    assert_eq!(follow.headers()[CONTENT_TYPE], "video/webm");
}

#[tokio::test]
async fn manifest_changes_are_picked_up_without_restart() {
    let server = start(&[("id1_clip.mp4", 10), ("id2_new.mp4", 10)], &["id1_clip.mp4"]).await;
    assert_eq!(
        get(&server.url("/media?name=id2_new.mp4"), None).await.status(),
        StatusCode::NOT_FOUND
    );

    let mut manifest = server.store.load().await.unwrap();
    manifest
        .items
        .insert("id2_new.mp4".into(), entry("id2_new.mp4", 10, 1));
    server.store.save(&manifest).await.unwrap();

    assert_eq!(
        get(&server.url("/media?name=id2_new.mp4"), None).await.status(),
        StatusCode::OK
    );
    assert!(server.root.join("id2_new.mp4").exists());
}

#[tokio::test]
async fn unreadable_manifest_serves_an_empty_playlist_with_500() {
    let server = start(&[("id1_clip.mp4", 10)], &["id1_clip.mp4"]).await;
    std::fs::write(server.store.path(), b"{ broken").unwrap();

    let response = get(&server.url("/playlist"), None).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.text().await.unwrap(), r#"{"items":[]}"#);

    let media = get(&server.url("/media?name=id1_clip.mp4"), None).await;
    assert_eq!(media.status(), StatusCode::NOT_FOUND);
}
