// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use thiserror::Error;
use tracing::error;

use crate::pools::PoolError;
use crate::store::FolderError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Error returned by handlers, rendered as `{"error": message}`
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status).json(serde_json::json!({ "error": self.message }))
    }
}

impl From<FolderError> for ApiError {
    fn from(err: FolderError) -> Self {
        match err {
            FolderError::InvalidId => Self::bad_request("Bad Request"),
            FolderError::NotFound => Self::not_found("Not Found"),
            FolderError::Io(e) => {
                error!("Storage error: {}", e);
                Self::internal("Internal Server Error")
            }
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::InvalidId => Self::bad_request("Bad Request"),
            PoolError::NotFound => Self::not_found("Not Found"),
            PoolError::InvalidMode(_) | PoolError::Invalid(_) => Self::bad_request(err.to_string()),
            PoolError::Conflict(msg) => Self::conflict(msg),
            PoolError::Io(_) | PoolError::Serialization(_) => {
                error!("Pool storage error: {}", err);
                Self::internal("Internal Server Error")
            }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        error!("I/O error: {}", err);
        Self::internal("Internal Server Error")
    }
}
