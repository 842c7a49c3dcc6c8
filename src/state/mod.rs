//! State management module.
//!
//! Durable record of what was last applied for each deployment: the diff
//! baseline, updated one resource at a time as a plan executes.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_INTERVAL, LockInfo, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{StateMutation, StateStore};
pub use types::{
    MAX_HISTORY, ResourceRecord, RunHistoryEntry, RunOperation, STATE_VERSION, StateSnapshot,
};

#[cfg(test)]
pub(crate) use types::test_record;
