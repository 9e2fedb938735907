use std::future::Future;
use std::path::Path;

use drive_core::{ApiErrorClass, DriveClient, DriveError, DriveFile};
use thiserror::Error;

use super::transfer::{TransferClient, TransferError};

const LIST_PAGE_SIZE: u32 = 200;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("drive api error: {0}")]
    Drive(#[from] DriveError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RemoteError::Transfer(TransferError::Cancelled))
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, RemoteError::Transfer(TransferError::TooLarge { .. }))
    }

    /// The token was refused; retrying before it is replaced will not help.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            RemoteError::Drive(err) if err.classification() == Some(ApiErrorClass::Auth)
        )
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Drive(err) => err.is_retryable(),
            RemoteError::Transfer(TransferError::Request(err)) => {
                err.is_timeout() || err.is_connect()
            }
            RemoteError::Transfer(_) => false,
            RemoteError::Unavailable(_) => true,
        }
    }
}

/// One entry of a remote folder listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub checksum: Option<String>,
    pub modified_time: Option<String>,
    pub size_bytes: u64,
}

impl From<DriveFile> for RemoteFile {
    fn from(file: DriveFile) -> Self {
        let size_bytes = file.size_bytes();
        Self {
            id: file.id,
            name: file.name,
            checksum: file.md5_checksum.filter(|s| !s.is_empty()),
            modified_time: file.modified_time.filter(|s| !s.is_empty()),
            size_bytes,
        }
    }
}

/// The remote side of a mirror: a flat folder that can be listed and whose
/// files can be copied to a local path.
pub trait RemoteDirectory: Send + Sync {
    fn list(
        &self,
        folder_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteFile>, RemoteError>> + Send;

    /// Writes the file's bytes to `dest`. On error `dest` is left untouched.
    fn download(
        &self,
        file: &RemoteFile,
        dest: &Path,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

/// Google Drive backed [`RemoteDirectory`].
#[derive(Clone)]
pub struct DriveRemote {
    client: DriveClient,
    transfer: TransferClient,
}

impl DriveRemote {
    pub fn new(client: DriveClient, transfer: TransferClient) -> Self {
        Self { client, transfer }
    }
}

impl RemoteDirectory for DriveRemote {
    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteFile>, RemoteError> {
        let files = self.client.list_folder_all(folder_id, LIST_PAGE_SIZE).await?;
        Ok(files.into_iter().map(RemoteFile::from).collect())
    }

    async fn download(&self, file: &RemoteFile, dest: &Path) -> Result<(), RemoteError> {
        let response = self.client.open_media(&file.id).await?;
        let written = self
            .transfer
            .write_response_to_path(response, dest, file.checksum.as_deref())
            .await?;
        tracing::debug!(remote_id = %file.id, bytes = written, "transfer finished");
        Ok(())
    }
}
