use serde::{Deserialize, Serialize};

use crate::constants::{CODE_SUCCESS, CODE_UNAUTHORIZED};

/// Business-level failure carried in an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server rejected request ({code}): {message}")]
pub struct ApiError {
    pub code: i32,
    pub message: String,
}

impl ApiError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns `true` for 5xx codes (worth retrying).
    pub fn is_server_fault(&self) -> bool {
        self.code >= 500
    }

    /// Returns `true` when the session is no longer valid.
    pub fn is_unauthorized(&self) -> bool {
        self.code == CODE_UNAUTHORIZED
    }
}

/// Envelope wrapping every server response.
///
/// A `code` other than [`CODE_SUCCESS`] is a failure regardless of the
/// HTTP status that carried it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Creates a successful envelope around `data`.
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            code: CODE_SUCCESS,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Creates a failure envelope without data.
    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Returns `true` if the envelope reports success.
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    /// Unwraps the payload, turning a failure code or a missing `data`
    /// field into an [`ApiError`].
    pub fn into_data(self) -> Result<T, ApiError> {
        if !self.is_success() {
            return Err(ApiError {
                code: self.code,
                message: self.message,
            });
        }
        self.data.ok_or_else(|| ApiError {
            code: self.code,
            message: "response carried no data".into(),
        })
    }
}
