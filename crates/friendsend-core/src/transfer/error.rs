use std::path::PathBuf;

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Cannot send {0:?}: file does not exist")]
    NotFound(PathBuf),

    #[error("Cannot send {path:?}: file not in root dir ({root:?})")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("Cannot send {0:?}: symlinks are not supported")]
    SymlinkRefused(PathBuf),

    #[error("Cannot send {0:?}: not a regular file or directory")]
    UnsupportedFileType(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Offer task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Transfer engine has stopped")]
    Stopped,
}
