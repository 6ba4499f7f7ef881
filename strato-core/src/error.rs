use thiserror::Error;

pub type Result<T> = std::result::Result<T, StratoError>;

#[derive(Error, Debug)]
pub enum StratoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Auth failed against {endpoint}: {message}")]
    Auth { endpoint: String, message: String },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Remote server error ({status}): {message}")]
    RemoteServer { status: u16, message: String },

    #[error("Remote rejected request ({status}): {message}")]
    RemoteClient { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Remote copy of {0} is newer")]
    ConflictNewer(String),

    #[error("ETag mismatch for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("Large object cannot be transferred: {0}")]
    LargeObjectPolicy(String),

    #[error("Status file corrupt: {0}")]
    StatusCorrupt(String),

    #[error("Stale row for {0}: object changed since enumeration")]
    StaleRow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StratoError {
    /// Counter suffix for `errors.<kind>` metrics. Stable names, never
    /// derived from Display output.
    pub fn kind(&self) -> &'static str {
        match self {
            StratoError::Io(_) => "io",
            StratoError::Config(_) => "config_invalid",
            StratoError::Auth { .. } => "auth",
            StratoError::TransientNetwork(_) => "transient_network",
            StratoError::RemoteServer { .. } => "remote_5xx",
            StratoError::RemoteClient { .. } => "remote_4xx_client",
            StratoError::NotFound(_) => "not_found",
            StratoError::ConflictNewer(_) => "conflict_newer",
            StratoError::IntegrityMismatch { .. } => "integrity",
            StratoError::LargeObjectPolicy(_) => "large_object_policy",
            StratoError::StatusCorrupt(_) => "status_corrupt",
            StratoError::StaleRow(_) => "stale_row",
            StratoError::Serialization(_) => "serialization",
            StratoError::InvalidRequest(_) => "invalid_request",
            StratoError::Internal(_) => "internal",
        }
    }

    /// Errors worth another attempt with backoff. Everything else either
    /// succeeded in disguise (404 on delete) or needs an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StratoError::TransientNetwork(_) | StratoError::RemoteServer { .. }
        )
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StratoError::NotFound(message),
            401 | 403 => StratoError::Auth {
                endpoint: String::new(),
                message,
            },
            400..=499 => StratoError::RemoteClient { status, message },
            _ => StratoError::RemoteServer { status, message },
        }
    }
}

impl From<reqwest::Error> for StratoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return StratoError::TransientNetwork(err.to_string());
        }
        match err.status() {
            Some(status) => StratoError::from_status(status.as_u16(), err.to_string()),
            None => StratoError::TransientNetwork(err.to_string()),
        }
    }
}
