pub mod daemon;
pub mod logging;
pub mod manifest;
pub mod media;
pub mod sync;
