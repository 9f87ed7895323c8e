use thiserror::Error;

/// Strata error types
#[derive(Error, Debug)]
pub enum StrataError {
    /// Computed digest differs from the expected one. Never retried.
    #[error("Content mismatch: {path} had {actual}, expected {expected}")]
    ContentMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Digest string without the `sha256:` algorithm prefix
    #[error("Malformed digest: {0}")]
    MalformedDigest(String),

    /// Persisted size disagrees with the on-disk file size
    #[error("Size mismatch: {path} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    /// A source file vanished while an archive was being built
    #[error("Source unavailable: {path} - {message}")]
    SourceUnavailable { path: String, message: String },

    /// Registry answered with an unclassified non-success status
    #[error("Registry error: {repo} {url} -> {status}")]
    RegistryError {
        repo: String,
        url: String,
        status: u16,
        body: String,
    },

    /// Cross-repository mount was not honored
    #[error("Mount rejected: {digest} from {from} into {repo} -> {status}")]
    MountRejected {
        repo: String,
        digest: String,
        from: String,
        status: u16,
    },

    /// A product was registered twice under the same key
    #[error("Duplicate product: {0}")]
    DuplicateProduct(String),

    /// Remote manifest layers and config diff_ids have different lengths
    #[error("Layer count mismatch: {layers} layers, {diff_ids} diff_ids")]
    LayerCountMismatch { layers: usize, diff_ids: usize },

    /// A manifest references a layer that is not known locally
    #[error("Missing layer: {0}")]
    MissingLayer(String),

    /// Connection-level failure talking to a registry
    #[error("Transport error: {url} - {message}")]
    Transport { url: String, message: String },

    /// Operation aborted by a cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Archive construction or parsing error
    #[error("Archive error: {0}")]
    ArchiveError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl StrataError {
    /// Whether a caller may reasonably retry the whole operation.
    ///
    /// Only transport failures and server-side (5xx) registry errors qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            StrataError::Transport { .. } => true,
            StrataError::RegistryError { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(err: serde_json::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StrataError {
    fn from(err: serde_yaml::Error) -> Self {
        StrataError::SerializationError(err.to_string())
    }
}

/// Result type alias for strata operations
pub type Result<T> = std::result::Result<T, StrataError>;
