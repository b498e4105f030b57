// Store module: key-value persistence for settings and the device session

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt stored value for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}
