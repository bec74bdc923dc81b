//! Local log mirror.

pub mod lock;
pub mod synchronizer;

pub use lock::FileLock;
pub use synchronizer::{LogSynchronizer, StreamId, StreamKind};
