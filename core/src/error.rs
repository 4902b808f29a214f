use thiserror::Error;

/// Classification of session failures.
///
/// The local source decides between falling back to another session and
/// failing outright by looking at this kind, never at the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionErrorKind {
    /// The session group has no session to offer.
    NoSession,
    /// The requested session id is not connected.
    NotFound,
    /// The session was connected but is no longer usable (closed, reset,
    /// or it stopped serving the requested directory).
    Invalid,
    /// The peer does not implement the requested method.
    Unsupported,
    /// Any other transport failure.
    Transport,
}

impl std::fmt::Display for SessionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSession => write!(f, "no session"),
            Self::NotFound => write!(f, "not found"),
            Self::Invalid => write!(f, "invalid"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Transport => write!(f, "transport"),
        }
    }
}

/// Why a cache ref could not be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefErrorKind {
    /// Another holder currently owns the ref as mutable.
    Locked,
    /// No ref with this id exists.
    NotFound,
    /// The ref exists but cannot be used as mutable.
    NotMutable,
}

impl std::fmt::Display for RefErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::NotFound => write!(f, "not found"),
            Self::NotMutable => write!(f, "not mutable"),
        }
    }
}

/// A3S build cache error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Session-related error
    #[error("Session error ({kind}): {message}")]
    SessionError {
        kind: SessionErrorKind,
        message: String,
    },

    /// Cache ref could not be acquired
    #[error("Cache ref {id} is {kind}")]
    RefError { id: String, kind: RefErrorKind },

    /// Snapshot store error
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Mount or unmount of a snapshot failed
    #[error("Mount error: {0}")]
    MountError(String),

    /// File transfer from a session peer failed
    #[error("Transfer error: {0}")]
    TransferError(String),

    /// Source identifier attributes could not be parsed
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Path pattern could not be compiled
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// OCI image error
    #[error("OCI image error: {0}")]
    OciImageError(String),

    /// Manifest format that is no longer supported
    #[error("Unsupported manifest: {0}")]
    UnsupportedManifest(String),

    /// Manifest document carries both manifest and index fields
    #[error("invalid ambiguous manifest and manifest list")]
    AmbiguousManifest,

    /// Declared media type disagrees with the document shape
    #[error("mediaType in manifest does not match manifest contents: {0}")]
    MediaTypeMismatch(String),

    /// Media type that cannot be expanded
    #[error("encountered unknown type {0}; children may not be fetched")]
    UnknownMediaType(String),

    /// No manifest matched the requested platform
    #[error("No match for platform {0} in manifest")]
    NoMatchingPlatform(String),

    /// Fetched content did not hash to its descriptor
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// Content missing from the store
    #[error("Content not found: {0}")]
    NotFound(String),

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Retry-eligible network failure
    #[error("Transient error: {0}")]
    TransientError(String),

    /// Lease error
    #[error("Lease error: {0}")]
    LeaseError(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// Shorthand for a session error.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self::SessionError {
            kind,
            message: message.into(),
        }
    }

    /// Session classification, if this is a session error.
    pub fn session_kind(&self) -> Option<SessionErrorKind> {
        match self {
            Self::SessionError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the fetch pipeline may retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientError(_) | Self::TimeoutError(_))
    }

    /// Whether a ref acquisition failed because the ref is held or gone.
    pub fn is_ref_unavailable(&self) -> bool {
        matches!(self, Self::RefError { .. })
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::SerializationError(err.to_string())
    }
}

/// Result type alias for A3S build cache operations
pub type Result<T> = std::result::Result<T, BuildError>;
