use sectap_protocol::{ApiError, ErrorCode, ValidationIssue};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Error type shared by the daemon core and the backend adapters.
///
/// `NotFound`, `LabelExists` and `Timeout` are sentinel variants: handlers
/// match on them to pick the envelope code, everything else collapses into
/// `BACKEND_ERROR` or `INTERNAL_ERROR` at the handler boundary.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("label already exists: {0}")]
    LabelExists(String),

    #[error("request validation failed")]
    Validation(Vec<ValidationIssue>),

    #[error("{0}")]
    Timeout(String),

    /// The client abandoned the request; nobody will read the response.
    #[error("request cancelled")]
    Canceled,

    #[error("{0}")]
    Backend(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::InvalidRequest(_) | ServiceError::LabelExists(_) => {
                ErrorCode::InvalidRequest
            }
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::Validation(_) => ErrorCode::ValidationError,
            ServiceError::Timeout(_) | ServiceError::Canceled => ErrorCode::Timeout,
            ServiceError::Backend(_) => ErrorCode::BackendError,
            ServiceError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ServiceError::Timeout(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, ServiceError::Canceled)
    }

    pub fn to_api_error(&self) -> ApiError {
        let details = match self {
            ServiceError::Validation(issues) => serde_json::to_value(issues).ok(),
            _ => None,
        };
        ApiError {
            code: self.code(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}
