use std::path::PathBuf;

use thiserror::Error;

/// The error taxonomy a probe's adapter call can signal, per the backend contract.
///
/// This is distinct from [`LmsError`]: a probe outcome is a *value* the
/// tester classifies (never an exception), while `LmsError` covers the
/// handful of failure modes that are fatal to the current invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    LoadError,
    OutOfMemory,
    InferenceTimeout,
    InferenceError,
    UnloadError,
    ConnectionError,
}

impl ErrorKind {
    /// Stable lowercase key, the same string used in journal entries and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::LoadError => "load_error",
            Self::OutOfMemory => "out_of_memory",
            Self::InferenceTimeout => "inference_timeout",
            Self::InferenceError => "inference_error",
            Self::UnloadError => "unload_error",
            Self::ConnectionError => "connection_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal-to-the-current-invocation errors: registry/journal I/O, identifier
/// resolution, and cancellation. Per-probe errors never appear here — they are
/// recovered locally by the tester as [`crate::backend::ProbeOutcome`] values.
#[derive(Debug, Error)]
pub enum LmsError {
    #[error("model not resolvable: {0}")]
    NotFound(String),

    #[error("identifier {0:?} matches multiple records; resolve ambiguity by path, id, or short_id")]
    AmbiguousIdentifier(String),

    #[error("registry I/O error at {path}: {source}")]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file at {path} is corrupt: {detail}")]
    RegistryCorrupt { path: PathBuf, detail: String },

    #[error("journal I/O error at {path}: {source}")]
    JournalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl LmsError {
    /// Maps to the stable error taxonomy string used in logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AmbiguousIdentifier(_) => "ambiguous_identifier",
            Self::RegistryIo { .. } => "registry_io_error",
            Self::RegistryCorrupt { .. } => "registry_corrupt",
            Self::JournalIo { .. } => "journal_io_error",
            Self::Cancelled => "cancelled",
            Self::Request(_) => "connection_error",
            Self::Other(_) => "other",
        }
    }
}
