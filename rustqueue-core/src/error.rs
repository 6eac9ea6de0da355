//! Error codes and the caller-facing error shape

use serde::Serialize;
use thiserror::Error;

use crate::request_id::RequestId;

/// Error codes reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authentication / authorization
    MissingApiKey,
    InvalidApiKey,
    AccessDenied,

    // Validation
    InvalidQueueName,
    InvalidParameter,
    MessageTooLarge,

    // Lookups
    MessageNotFound,

    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingApiKey => "MissingApiKey",
            Self::InvalidApiKey => "InvalidApiKey",
            Self::AccessDenied => "AccessDenied",
            Self::InvalidQueueName => "InvalidQueueName",
            Self::InvalidParameter => "InvalidParameterValue",
            Self::MessageTooLarge => "MessageTooLarge",
            Self::MessageNotFound => "MessageNotFound",
            Self::InternalError => "InternalError",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::MissingApiKey | Self::InvalidApiKey => 401,
            Self::AccessDenied => 403,
            Self::InvalidQueueName | Self::InvalidParameter => 400,
            Self::MessageTooLarge => 413,
            Self::MessageNotFound => 404,
            Self::InternalError => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error as rendered to an API caller
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: RequestId,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: RequestId::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as a JSON error body
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonError<'a> {
            error: &'a str,
            detail: &'a str,
            request_id: &'a str,
        }

        let error = JsonError {
            error: self.code.as_str(),
            detail: &self.message,
            request_id: self.request_id.as_str(),
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","request_id":"{}"}}"#,
                self.code.as_str(),
                self.request_id
            )
        })
    }
}
