use async_trait::async_trait;

use crate::api::ApiError;
use crate::models::{PasswordChange, Principal, ProfileUpdate, RegistrationForm};

/// Token and profile handed back by a successful login or registration.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthGrant {
    pub token: String,
    pub principal: Principal,
}

/// Backend's verdict on a stored token.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Valid(Principal),
    Invalid,
}

/// Auth and profile endpoints the session manager talks to.
///
/// Calls that act on the signed-in account take the bearer token as an
/// argument; implementations must not hold one of their own.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<Verification, ApiError>;

    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ApiError>;

    async fn register(&self, form: &RegistrationForm) -> Result<AuthGrant, ApiError>;

    async fn fetch_profile(&self, token: &str) -> Result<Principal, ApiError>;

    async fn update_profile(
        &self,
        token: &str,
        update: &ProfileUpdate,
    ) -> Result<Principal, ApiError>;

    async fn change_password(&self, token: &str, change: &PasswordChange)
        -> Result<(), ApiError>;

    async fn delete_account(&self, token: &str) -> Result<(), ApiError>;
}
