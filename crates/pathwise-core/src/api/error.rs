use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {}", describe(.0, "token may be expired"))]
    Unauthorized(Option<String>),

    #[error("Access denied: {}", describe(.0, "forbidden"))]
    AccessDenied(Option<String>),

    #[error("Resource not found: {}", describe(.0, "no such resource"))]
    NotFound(Option<String>),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected ({status}): {}", describe(.message, "bad request"))]
    Rejected { status: u16, message: Option<String> },

    #[error("Server error ({status}): {}", describe(.message, "internal error"))]
    ServerError { status: u16, message: Option<String> },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error payload the backend attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

fn describe<'a>(message: &'a Option<String>, fallback: &'a str) -> &'a str {
    message.as_deref().unwrap_or(fallback)
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull the human-readable `error` field out of a JSON error body.
    fn extract_message(body: &str) -> Option<String> {
        serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::extract_message(body);
        if message.is_none() && !body.is_empty() {
            debug!(status = status.as_u16(), body = %Self::truncate_body(body), "Error response without message");
        }
        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            code @ 400..=499 => ApiError::Rejected { status: code, message },
            code @ 500..=599 => ApiError::ServerError { status: code, message },
            _ => ApiError::InvalidResponse(format!(
                "Status {}: {}",
                status,
                message.unwrap_or_else(|| Self::truncate_body(body))
            )),
        }
    }

    /// The message the backend put in its error payload, if any.
    pub fn backend_message(&self) -> Option<&str> {
        match self {
            ApiError::Unauthorized(m) | ApiError::AccessDenied(m) | ApiError::NotFound(m) => {
                m.as_deref()
            }
            ApiError::Rejected { message, .. } | ApiError::ServerError { message, .. } => {
                message.as_deref()
            }
            _ => None,
        }
    }

    /// True when the backend understood the request and refused it (4xx),
    /// as opposed to the request never completing properly.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ApiError::Unauthorized(_)
                | ApiError::AccessDenied(_)
                | ApiError::NotFound(_)
                | ApiError::Rejected { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_))
    }
}
