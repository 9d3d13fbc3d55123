use axum::http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Credential error: {0}")]
    CredentialError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Upstream error {status}: {message}")]
    UpstreamError { status: u16, message: String },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Response parse timed out after {0}s")]
    ParseTimeout(u64),

    #[error("Request cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProxyError {
    /// Client-visible error type string
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::JsonError(_) => "invalid_request_error",
            ProxyError::CredentialError(_) => "authentication_error",
            ProxyError::UpstreamError { status, .. } => match status {
                400 => "invalid_request_error",
                401 => "authentication_error",
                403 => "permission_error",
                429 => "rate_limit_error",
                529 => "overloaded_error",
                _ => "api_error",
            },
            ProxyError::ParseTimeout(_) => "timeout_error",
            _ => "api_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidRequest(_) | ProxyError::JsonError(_) => StatusCode::BAD_REQUEST,
            ProxyError::CredentialError(_) => StatusCode::UNAUTHORIZED,
            ProxyError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::TransportError(_) => StatusCode::BAD_GATEWAY,
            ProxyError::ParseTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Anthropic-style structured error body
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "error",
            "error": {
                "type": self.error_type(),
                "message": self.to_string()
            }
        })
    }

    /// OpenAI-style structured error body
    pub fn to_openai_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "code": self.status_code().as_u16()
            }
        })
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
