use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for Ferry
#[derive(Error, Debug)]
pub enum FerryError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No usable credential: {0}")]
    AuthConfig(String),

    // Tunnel errors
    #[error("Tunnel handshake failed: {0}")]
    ConnectFailed(String),

    #[error("Tunnel transport closed: {0}")]
    TransportClosed(String),

    // Dial errors
    #[error("Dial failed: {0}")]
    DialFailed(String),

    // Proxy authentication
    #[error("Proxy authentication failed")]
    AuthenticationFailed,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for Ferry operations
pub type Result<T> = std::result::Result<T, FerryError>;

impl FerryError {
    /// Get the HTTP status code a proxied session answers with for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            FerryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            FerryError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            FerryError::ConnectFailed(_)
            | FerryError::TransportClosed(_)
            | FerryError::DialFailed(_)
            | FerryError::Http(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            FerryError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            FerryError::InvalidConfig(_)
            | FerryError::AuthConfig(_)
            | FerryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this dial failure means the tunnel itself is gone and
    /// reconnecting may help
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, FerryError::TransportClosed(_))
    }
}

// Convert from hyper errors
impl From<hyper::Error> for FerryError {
    fn from(err: hyper::Error) -> Self {
        FerryError::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_code_mapping() {
        assert_eq!(
            FerryError::InvalidRequest("bad".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            FerryError::AuthenticationFailed.status_code(),
            StatusCode::PROXY_AUTHENTICATION_REQUIRED
        );
        assert_eq!(
            FerryError::DialFailed("no route".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            FerryError::ConnectFailed("refused".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(FerryError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            FerryError::AuthConfig("none".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_transport_closed_triggers_reconnect() {
        assert!(FerryError::TransportClosed("eof".to_string()).is_transport_closed());
        assert!(!FerryError::DialFailed("dns".to_string()).is_transport_closed());
        assert!(!FerryError::ConnectFailed("auth".to_string()).is_transport_closed());
        assert!(!FerryError::Timeout.is_transport_closed());
    }
}
