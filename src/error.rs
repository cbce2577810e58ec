//! Error taxonomy.
//!
//! Only [`MapperError`] crosses the session boundary. [`ObservationError`]
//! covers a single bad observation; the mapper absorbs it into counters.

use std::path::PathBuf;

/// Result type alias for session-level operations.
pub type Result<T> = std::result::Result<T, MapperError>;

/// Hard failures surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// Persisted state could not be written or read back.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Another live session owns the directory.
    #[error("directory {} is already bound by process {holder_pid}", .directory.display())]
    OwnershipConflict {
        directory: PathBuf,
        holder_pid: u32,
    },
}

/// Failures of the map store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Stored layout was written by an incompatible format version.
    #[error("format version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// Stored layout is structurally inconsistent.
    #[error("corrupt map at {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("serialization error at {}: {source}", .path.display())]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error at {}: {source}", .path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Per-observation problems. Never fatal to a session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObservationError {
    /// The observation itself is malformed or out of range; it is dropped.
    #[error("transient input: {0}")]
    TransientInput(String),

    /// The data is fine but geometry cannot produce a stable estimate yet.
    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),
}
