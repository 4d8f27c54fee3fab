//! Error taxonomy for registry, dispatch and payment operations.

use axum::http::StatusCode;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Tool '{0}' not found in agent's available tools")]
    UnknownTool(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("Webhook request timed out after {timeout_ms}ms")]
    UpstreamTimeout {
        tool_call_id: String,
        timeout_ms: u64,
    },

    #[error("{message}")]
    UpstreamError {
        tool_call_id: String,
        message: String,
    },

    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Token signing failed: {0}")]
    TokenSigning(#[from] jsonwebtoken::errors::Error),
}

impl RegistryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        RegistryError::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::Validation(_) | RegistryError::UnknownTool(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RegistryError::InvalidState(_) => StatusCode::CONFLICT,
            RegistryError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RegistryError::UpstreamError { .. } | RegistryError::PaymentProvider(_) => {
                StatusCode::BAD_GATEWAY
            }
            RegistryError::Database(_) | RegistryError::TokenSigning(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable name, used by the MCP facade.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::Validation(_) => "validation_error",
            RegistryError::NotFound(_) => "not_found",
            RegistryError::UnknownTool(_) => "unknown_tool",
            RegistryError::Unauthorized(_) => "unauthorized",
            RegistryError::InvalidState(_) => "invalid_state",
            RegistryError::UpstreamTimeout { .. } => "upstream_timeout",
            RegistryError::UpstreamError { .. } => "upstream_error",
            RegistryError::PaymentProvider(_) => "payment_provider_error",
            RegistryError::Database(_) => "database_error",
            RegistryError::TokenSigning(_) => "token_signing_error",
        }
    }

    /// The tool call an upstream failure was recorded against, if any.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            RegistryError::UpstreamTimeout { tool_call_id, .. }
            | RegistryError::UpstreamError { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}
