use std::path::PathBuf;
use thiserror::Error;

use crate::engine::types::DownloadId;
use crate::network::NetworkError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization failed: {0}")]
    Store(#[from] serde_json::Error),
    #[error("unknown download id {0}")]
    UnknownId(DownloadId),
    #[error("part file {} has {actual} bytes, expected {expected}", .path.display())]
    PartSizeMismatch {
        path: PathBuf,
        actual: u64,
        expected: u64,
    },
}
