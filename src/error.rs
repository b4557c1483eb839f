use serde::Serialize;

/// Why a transport call never produced a response.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NetworkFailure {
    #[error("timeout")]
    Timeout,

    #[error("cannot reach server: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

/// Coarse failure category surfaced to callers so they can pick a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    NotAuthenticated,
    InvalidSession,
    Network,
    ServerRejected,
    Local,
}

/// All errors that can occur while reading, writing or syncing progress.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("Network error: {0}")]
    Network(NetworkFailure),

    #[error("Server rejected request{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    ServerRejected { status: Option<u16>, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Custom(String),
}

impl SyncError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SyncError::NotAuthenticated => FailureKind::NotAuthenticated,
            SyncError::InvalidSession(_) => FailureKind::InvalidSession,
            SyncError::Network(_) | SyncError::Http(_) => FailureKind::Network,
            SyncError::ServerRejected { .. } => FailureKind::ServerRejected,
            SyncError::Io(_) | SyncError::Json(_) | SyncError::Custom(_) => FailureKind::Local,
        }
    }

    /// HTTP status of the response that caused this error, if there was one.
    pub fn transport_code(&self) -> Option<u16> {
        match self {
            SyncError::ServerRejected { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<NetworkFailure> for SyncError {
    fn from(failure: NetworkFailure) -> Self {
        SyncError::Network(failure)
    }
}

// UI bindings receive errors as plain strings.
impl Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_authenticated_message() {
        assert_eq!(SyncError::NotAuthenticated.to_string(), "Not logged in");
    }

    #[test]
    fn test_server_rejected_carries_status() {
        let err = SyncError::ServerRejected {
            status: Some(401),
            message: "bad password".into(),
        };
        assert_eq!(err.kind(), FailureKind::ServerRejected);
        assert_eq!(err.transport_code(), Some(401));
        assert_eq!(err.to_string(), "Server rejected request (401): bad password");

        let unparsable = SyncError::ServerRejected {
            status: None,
            message: "garbage".into(),
        };
        assert_eq!(unparsable.to_string(), "Server rejected request: garbage");
    }

    #[test]
    fn test_timeout_is_network_kind() {
        let err: SyncError = NetworkFailure::Timeout.into();
        assert_eq!(err.kind(), FailureKind::Network);
        assert_eq!(err.transport_code(), None);
        assert_eq!(err.to_string(), "Network error: timeout");
    }

    #[test]
    fn test_serializes_as_string() {
        let json = serde_json::to_string(&SyncError::NotAuthenticated).unwrap();
        assert_eq!(json, "\"Not logged in\"");
    }
}
