//! Error types for the Muster discovery service

/// Error type for discovery operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address '{0}', expected <host>:<port>")]
    InvalidAddress(String),

    #[error("invalid discovery uri '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("discovery scheme '{0}' is already registered")]
    SchemeAlreadyRegistered(String),

    #[error("unsupported discovery scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("'{operation}' is not supported by the '{backend}' backend")]
    NotSupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("store connect failed: {0}")]
    StoreConnect(String),

    #[error("store read failed: {0}")]
    StoreRead(String),

    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("watch stream failed: {0}")]
    WatchStream(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build an `InvalidUri` error with a canned reason.
    pub fn invalid_uri(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidUri {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
