//! REST API client module for the learning platform backend.
//!
//! - `HttpAuthBackend`: the auth and profile endpoints used by the session
//!   manager
//! - `ApiClient`: generic JSON requests for everything else, with the
//!   session's bearer token injected per request

pub mod client;
pub mod error;
pub mod http_backend;

pub use client::{build_http_client, ApiClient};
pub use error::ApiError;
pub use http_backend::HttpAuthBackend;
