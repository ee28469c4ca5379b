use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("api error: {message}")]
    Api { message: String },
    #[error("timed out: {0}")]
    Timeout(&'static str),
    #[error("socket connection closed")]
    ConnectionClosed,
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl AppError {
    /// Failures worth another attempt at the call site.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ConnectionClosed | Self::WebSocket(_) | Self::Io(_) => true,
            Self::Reqwest(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(AppError::Timeout("stats").is_transient());
        assert!(AppError::ConnectionClosed.is_transient());
        assert!(!AppError::InvalidPayload("missing trade".to_string()).is_transient());
        assert!(!AppError::Api {
            message: "unauthorized".to_string()
        }
        .is_transient());
    }
}
