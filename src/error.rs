//! 统一的 API 错误类型与 JSON 错误响应。

use axum::Json;
use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::response::ErrorBody;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid client: {0}")]
    InvalidTenant(String),
    #[error("authentication token required")]
    AuthRequired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file id {0} matches more than one stored file")]
    AmbiguousFileId(String),
    #[error("file too large, maximum is {0} bytes")]
    FileTooLarge(u64),
    #[error("file type not allowed: {0}")]
    UnsupportedType(String),
    #[error("search query is required")]
    EmptyQuery,
    #[error("{0}")]
    ValidationError(String),
    #[error("failed to scan files: {0}")]
    ScanFailed(String),
    #[error("failed to store file: {0}")]
    StorageWriteFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("range not satisfiable")]
    RangeNotSatisfiable(u64),
    #[error("too many requests")]
    TooManyRequests(u64),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidTenant(_)
            | ApiError::FileTooLarge(_)
            | ApiError::UnsupportedType(_)
            | ApiError::EmptyQuery
            | ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::AuthRequired | ApiError::InvalidToken(_) | ApiError::InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ApiError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::AmbiguousFileId(_) => StatusCode::CONFLICT,
            ApiError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ScanFailed(_) | ApiError::StorageWriteFailed(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        match self {
            // 416 不返回响应体，仅携带 Content-Range。
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (status, headers, AxumBody::empty()).into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (status, headers, Json(ErrorBody::new(message, status))).into_response()
            }
            _ => (status, Json(ErrorBody::new(message, status))).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::ValidationError("invalid path".into()),
            StorageError::NotFound(id) => ApiError::FileNotFound(id),
            StorageError::Ambiguous(id) => ApiError::AmbiguousFileId(id),
            StorageError::Cancelled => ApiError::ScanFailed("scan cancelled".into()),
            StorageError::Walk(err) => ApiError::ScanFailed(err.to_string()),
            StorageError::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ApiError::FileNotFound(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
