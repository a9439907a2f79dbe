use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
}

impl ErrorCode {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            429 => Self::RateLimited,
            400..=499 => Self::Validation,
            _ => Self::Internal,
        }
    }
}

/// Error body returned by the backend: `{error, details?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{status} {code:?}: {message}")]
pub struct ApiException {
    pub status: u16,
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiException {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: ErrorCode::from_status(status),
            message: message.into(),
            details: None,
        }
    }

    pub fn from_response(status: u16, body: Option<ApiErrorBody>) -> Self {
        match body {
            Some(body) => Self {
                details: body.details,
                ..Self::new(status, body.error)
            },
            None => Self::new(status, "An error occurred"),
        }
    }

    /// The request went out but nothing came back.
    pub fn no_response() -> Self {
        Self::new(500, "No response from server")
    }

    /// The request could not be built or sent at all.
    pub fn request_setup() -> Self {
        Self::new(500, "Network error occurred")
    }
}

impl From<ApiException> for ApiErrorBody {
    fn from(value: ApiException) -> Self {
        Self {
            error: value.message,
            details: value.details,
        }
    }
}
