use thiserror::Error;

use crate::api::ApiError;

/// Broad category of an authentication failure, so callers can branch
/// without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    /// The backend refused the credential or request (4xx, `valid: false`).
    InvalidCredential,
    /// The request never got a usable answer: network, timeout, 5xx, bad JSON.
    Transport,
    /// Rejected locally before anything was sent.
    Validation,
    /// Finished after a newer session change; its result was discarded.
    Superseded,
}

/// Failure returned by session operations. `message` is always display-ready.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AuthError {
    kind: AuthErrorKind,
    message: String,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::InvalidCredential, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Transport, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Validation, message)
    }

    pub fn superseded() -> Self {
        Self::new(
            AuthErrorKind::Superseded,
            "The session changed before this request finished",
        )
    }

    pub fn not_authenticated() -> Self {
        Self::invalid_credential("Not authenticated")
    }

    /// Normalize an API failure. The backend's own message wins; `fallback`
    /// is used when it sent none (or the request never reached it).
    pub fn from_api(err: &ApiError, fallback: &str) -> Self {
        let message = err.backend_message().unwrap_or(fallback);
        if err.is_rejection() {
            Self::invalid_credential(message)
        } else {
            Self::transport(message)
        }
    }

    pub fn kind(&self) -> AuthErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_api_prefers_backend_message() {
        let api = ApiError::Unauthorized(Some("invalid credentials".to_string()));
        let err = AuthError::from_api(&api, "Login failed");
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredential);
        assert_eq!(err.message(), "invalid credentials");
        assert_eq!(err.to_string(), "invalid credentials");
    }

    #[test]
    fn test_from_api_falls_back() {
        let api = ApiError::Rejected { status: 400, message: None };
        let err = AuthError::from_api(&api, "Login failed");
        assert_eq!(err.kind(), AuthErrorKind::InvalidCredential);
        assert_eq!(err.message(), "Login failed");

        let api = ApiError::InvalidResponse("not json".to_string());
        let err = AuthError::from_api(&api, "Registration failed");
        assert_eq!(err.kind(), AuthErrorKind::Transport);
        assert_eq!(err.message(), "Registration failed");
    }

    #[test]
    fn test_server_error_keeps_backend_text() {
        let api = ApiError::ServerError { status: 500, message: Some("database is down".to_string()) };
        let err = AuthError::from_api(&api, "Login failed");
        assert_eq!(err.kind(), AuthErrorKind::Transport);
        assert_eq!(err.message(), "database is down");
    }
}
