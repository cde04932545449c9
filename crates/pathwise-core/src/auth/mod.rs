//! Authentication module for the client session.
//!
//! This module provides:
//! - `SessionManager`: credential lifecycle (verify on startup, login,
//!   register, logout) and bearer hand-out for outbound requests
//! - `TokenStore`: the single persisted credential slot, backed by a file
//!   (`FileTokenStore`), the OS keychain (`KeyringTokenStore`), or memory
//! - `AuthBackend`: the auth/profile endpoints, implemented over HTTP by
//!   `crate::api::HttpAuthBackend`
//! - `AuthError`: display-ready failures tagged with an `AuthErrorKind`

pub mod backend;
pub mod credentials;
pub mod error;
pub mod session;
pub mod store;

pub use backend::{AuthBackend, AuthGrant, Verification};
pub use credentials::KeyringTokenStore;
pub use error::{AuthError, AuthErrorKind};
pub use session::{Phase, SessionManager, SessionSnapshot};
pub use store::{FileTokenStore, MemoryTokenStore, StoredToken, TokenStore};
