//! Block storage.

pub mod blocking_disk;

pub use blocking_disk::{BlockingDisk, DiskError, DriveId, BLOCK_SIZE};
