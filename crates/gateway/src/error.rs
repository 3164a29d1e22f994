use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("backend transport failed: {0}")]
    Transport(String),
    #[error("no backend connection available")]
    NoBackendAvailable,
    #[error("client `{0}` not found")]
    ClientNotFound(String),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
    #[error("connection rejected by backend")]
    AuthorizationRejected,
    #[error("backend did not respond within {0:?}")]
    BackendTimeout(std::time::Duration),
    #[error("gateway is shutting down")]
    Shutdown,
    #[error("malformed params: {0}")]
    MalformedParams(String),
}

impl GatewayError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::NoBackendAvailable => "NO_BACKEND_AVAILABLE",
            Self::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::AuthorizationRejected => "AUTHORIZATION_REJECTED",
            Self::BackendTimeout(_) => "BACKEND_TIMEOUT",
            Self::Shutdown => "SHUTDOWN",
            Self::MalformedParams(_) => "MALFORMED_PARAMS",
        }
    }

    /// Status returned on the HTTP upgrade request when authorization fails.
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::AuthorizationRejected => StatusCode::FORBIDDEN,
            Self::NoBackendAvailable | Self::BackendTimeout(_) | Self::Shutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(error: std::io::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
