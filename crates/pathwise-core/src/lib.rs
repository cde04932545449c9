//! Client core for the pathwise learning platform.
//!
//! The centre of the crate is [`auth::SessionManager`], which owns the signed-in
//! user's credential: it verifies a stored token at startup, signs in and
//! registers, hands the bearer to outbound requests, and forgets everything
//! on logout. [`api::ApiClient`] uses it for every other backend call.

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod models;

pub use api::{ApiClient, ApiError, HttpAuthBackend};
pub use auth::{AuthError, AuthErrorKind, Phase, SessionManager, SessionSnapshot};
pub use config::Config;
pub use context::AppContext;
pub use models::{Principal, RegistrationForm};
