mod client;

pub use client::{ApiErrorClass, DriveClient, DriveError, DriveFile, FileList};
