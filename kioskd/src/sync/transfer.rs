use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures_util::StreamExt;
use md5::Context;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("download exceeded {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    /// Streaming stops once more than this many bytes have arrived.
    pub max_bytes: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 2,
            max_bytes: None,
        }
    }
}

#[derive(Clone)]
pub struct TransferClient {
    download_limit: Arc<Semaphore>,
    max_bytes: Option<u64>,
    cancel: CancellationToken,
}

impl TransferClient {
    pub fn new() -> Self {
        Self::with_config(TransferConfig::default())
    }

    pub fn with_config(config: TransferConfig) -> Self {
        Self {
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            max_bytes: config.max_bytes,
            cancel: CancellationToken::new(),
        }
    }

    /// Ties in-flight transfers to `cancel`; cancelling it aborts them.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_all(&self) {
        self.cancel.cancel();
    }

    /// Streams `response` into `<target>.partial`, then renames it over
    /// `target`. Returns the number of bytes written.
    pub async fn write_response_to_path(
        &self,
        response: reqwest::Response,
        target: &Path,
        expected_md5: Option<&str>,
    ) -> Result<u64, TransferError> {
        let _permit = self
            .download_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransferError::ConcurrencyClosed)?;
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let result = self
            .stream_into(response, &partial, expected_md5)
            .await;
        match result {
            Ok(written) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(written)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(err)
            }
        }
    }

    async fn stream_into(
        &self,
        response: reqwest::Response,
        partial: &Path,
        expected_md5: Option<&str>,
    ) -> Result<u64, TransferError> {
        let response = response.error_for_status()?;
        if let (Some(limit), Some(declared)) = (self.max_bytes, response.content_length())
            && declared > limit
        {
            return Err(TransferError::TooLarge { limit });
        }

        let mut file = tokio::fs::File::create(partial).await?;
        let mut stream = response.bytes_stream();
        let mut md5 = expected_md5.map(|_| Context::new());
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            written = written.saturating_add(chunk.len() as u64);
            if let Some(limit) = self.max_bytes
                && written > limit
            {
                return Err(TransferError::TooLarge { limit });
            }
            file.write_all(&chunk).await?;
            if let Some(ctx) = md5.as_mut() {
                ctx.consume(&chunk);
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        if let (Some(expected_md5), Some(ctx)) = (expected_md5, md5) {
            let actual_md5 = format!("{:x}", ctx.compute());
            if actual_md5 != expected_md5.to_ascii_lowercase() {
                return Err(TransferError::IntegrityMismatch {
                    expected_md5: expected_md5.to_ascii_lowercase(),
                    actual_md5,
                });
            }
        }
        Ok(written)
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new()
    }
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve(body: &'static [u8]) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }

    async fn fetch(server: &MockServer) -> reqwest::Response {
        reqwest::get(format!("{}/file", server.uri())).await.unwrap()
    }

    #[tokio::test]
    async fn downloads_file_to_target_path() {
        let server = serve(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out.mp4");
        let client = TransferClient::new();

        let written = client
            .write_response_to_path(fetch(&server).await, &target, None)
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn verifies_md5_when_expected() {
        let server = serve(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("ok.mp4");
        let client = TransferClient::new();

        client
            .write_response_to_path(
                fetch(&server).await,
                &target,
                Some("5D41402ABC4B2A76B9719D911017C592"),
            )
            .await
            .unwrap();
        assert!(target.exists());
    }

    #[tokio::test]
    async fn fails_when_md5_does_not_match() {
        let server = serve(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("bad.mp4");
        let client = TransferClient::new();

        let err = client
            .write_response_to_path(fetch(&server).await, &target, Some("deadbeef"))
            .await
            .expect_err("expected md5 mismatch");

        assert!(matches!(err, TransferError::IntegrityMismatch { .. }));
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn stops_streaming_past_the_size_cap() {
        let server = serve(b"0123456789").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("big.mp4");
        let client = TransferClient::with_config(TransferConfig {
            download_concurrency: 1,
            max_bytes: Some(4),
        });

        let err = client
            .write_response_to_path(fetch(&server).await, &target, None)
            .await
            .expect_err("expected size cap");

        assert!(matches!(err, TransferError::TooLarge { limit: 4 }));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn cancelled_client_refuses_new_transfers() {
        let server = serve(b"hello").await;
        let dir = tempdir().unwrap();
        let target = dir.path().join("never.mp4");
        let client = TransferClient::new();
        client.cancel_all();

        let err = client
            .write_response_to_path(fetch(&server).await, &target, None)
            .await
            .expect_err("expected cancellation");

        assert!(matches!(err, TransferError::Cancelled));
        assert!(!target.exists());
    }

    #[test]
    fn partial_path_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("/m/a.mp4")),
            PathBuf::from("/m/a.mp4.partial")
        );
        assert_eq!(
            partial_path(Path::new("/m/noext")),
            PathBuf::from("/m/noext.partial")
        );
    }
}
