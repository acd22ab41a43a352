//! 统一的 JSON 响应包装：`{success, data, ...}` 与 `{success, error, code}`。

use axum::http::StatusCode;
use serde::Serialize;

/// 成功响应。
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            message: None,
            count: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

/// 失败响应，`code` 为 HTTP 状态码。
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: u16,
}

impl ErrorBody {
    pub fn new(error: String, status: StatusCode) -> Self {
        Self {
            success: false,
            error,
            code: status.as_u16(),
        }
    }
}
