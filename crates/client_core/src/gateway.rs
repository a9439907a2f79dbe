use async_trait::async_trait;
use shared::{
    domain::{Todo, TodoId},
    error::{ApiException, ErrorCode},
    protocol::{CreateTodoRequest, OperationAck, UpdateTodoRequest},
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("invalid response from server: {0}")]
    InvalidResponse(String),
}

/// How a failed call should be treated by whoever retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 404: the entity is not (or not yet) visible.
    NotFound,
    /// Server-side or transport failure; the same request may succeed later.
    Transient,
    /// A deterministic rejection; retrying cannot change it.
    Fatal,
}

impl GatewayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Api(err) => match err.code {
                ErrorCode::NotFound => ErrorClass::NotFound,
                ErrorCode::Internal | ErrorCode::RateLimited => ErrorClass::Transient,
                ErrorCode::Unauthorized | ErrorCode::Forbidden | ErrorCode::Validation => {
                    ErrorClass::Fatal
                }
            },
            Self::InvalidResponse(_) => ErrorClass::Fatal,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api(err) => Some(err.status),
            Self::InvalidResponse(_) => None,
        }
    }
}

/// The canonical store. Mutations return an acknowledgement; their effect
/// becomes visible to `list`/`get` some time later.
#[async_trait]
pub trait TodoGateway: Send + Sync {
    async fn list(&self) -> Result<Vec<Todo>, GatewayError>;
    async fn get(&self, id: &TodoId) -> Result<Todo, GatewayError>;
    async fn create(&self, input: &CreateTodoRequest) -> Result<OperationAck, GatewayError>;
    async fn update(
        &self,
        id: &TodoId,
        patch: &UpdateTodoRequest,
    ) -> Result<OperationAck, GatewayError>;
    async fn delete(&self, id: &TodoId) -> Result<OperationAck, GatewayError>;
}
