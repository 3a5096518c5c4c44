//! Error types for the core host.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while hosting a core.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Failed to load core library {path}: {source}")]
    Library {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("Core is missing required export: {0}")]
    SymbolMissing(&'static str),

    #[error("Unsupported libretro API version: {0}")]
    ApiVersion(u32),

    #[error("Core rejected game image: {0}")]
    LoadGame(String),

    #[error("No game loaded")]
    NoGame,

    #[error("State size mismatch: core expects {expected} bytes, got {actual}")]
    StateSizeMismatch { expected: usize, actual: usize },

    #[error("Core failed to serialize its state")]
    Serialize,

    #[error("Core failed to restore its state")]
    Unserialize,

    #[error("Address range {address:#x}+{length:#x} is not mapped")]
    Unmapped { address: u64, length: u64 },

    #[error("ROM range {address:#x}+{length:#x} exceeds image of {size:#x} bytes")]
    RomRange {
        address: u32,
        length: usize,
        size: usize,
    },

    #[error("Auto-load aborted after {frames} frames")]
    AutoLoadAborted { frames: u64 },

    #[error("Project error: {0}")]
    Project(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;
