pub mod engine;
pub mod lock;
pub mod paths;
pub mod remote;
pub mod transfer;

pub use engine::{ItemIssue, SyncEngine, SyncError, SyncReport, SyncSettings};
pub use remote::{DriveRemote, RemoteDirectory, RemoteFile};
