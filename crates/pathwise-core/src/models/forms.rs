//! Request payloads submitted by the session manager, with the checks that
//! can run before anything is sent over the network.

use serde::{Deserialize, Serialize};

use super::{Difficulty, LearningStyle};
use crate::auth::AuthError;

/// Shortest username the backend accepts.
const MIN_USERNAME_LENGTH: usize = 3;

/// Shortest password the backend accepts.
const MIN_PASSWORD_LENGTH: usize = 8;

/// Allowed range for the daily study goal, in minutes (5 minutes to 8 hours).
pub const DAILY_GOAL_RANGE: std::ops::RangeInclusive<u32> = 5..=480;

/// Default daily study goal for new accounts.
pub const DEFAULT_DAILY_GOAL_MINUTES: u32 = 30;

// ============================================================================
// Registration
// ============================================================================

/// Everything submitted to `/auth/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationForm {
    pub username: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub learning_style: LearningStyle,
    pub preferred_difficulty: Difficulty,
    pub daily_goal_minutes: u32,
}

impl Default for RegistrationForm {
    fn default() -> Self {
        Self {
            username: String::new(),
            email: String::new(),
            password: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            learning_style: LearningStyle::default(),
            preferred_difficulty: Difficulty::default(),
            daily_goal_minutes: DEFAULT_DAILY_GOAL_MINUTES,
        }
    }
}

impl RegistrationForm {
    /// Apply the same rules the backend enforces so obvious mistakes are
    /// reported without a round trip.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.username.trim().is_empty() {
            return Err(AuthError::validation("username is required"));
        }
        if self.email.trim().is_empty() {
            return Err(AuthError::validation("email is required"));
        }
        if self.password.is_empty() {
            return Err(AuthError::validation("password is required"));
        }
        if self.username.trim().chars().count() < MIN_USERNAME_LENGTH {
            return Err(AuthError::validation(
                "Username must be at least 3 characters long",
            ));
        }
        if !is_valid_email(self.email.trim()) {
            return Err(AuthError::validation("Invalid email format"));
        }
        validate_password_strength(&self.password)?;
        if !DAILY_GOAL_RANGE.contains(&self.daily_goal_minutes) {
            return Err(AuthError::validation(
                "Daily goal must be between 5 and 480 minutes",
            ));
        }
        Ok(())
    }
}

/// Check password strength: length, upper case, lower case, and a digit.
pub fn validate_password_strength(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::validation(
            "Password must be at least 8 characters long",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(AuthError::validation(
            "Password must contain at least one uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(AuthError::validation(
            "Password must contain at least one lowercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AuthError::validation(
            "Password must contain at least one digit",
        ));
    }
    Ok(())
}

/// Structural email check: `local@domain.tld` where the TLD is two or more
/// letters.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

// ============================================================================
// Profile & Password
// ============================================================================

/// Partial profile update. Unset fields are left untouched by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_style: Option<LearningStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_difficulty: Option<Difficulty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_goal_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub study_reminders_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_email: Option<bool>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> Result<(), AuthError> {
        if self.is_empty() {
            return Err(AuthError::validation("Nothing to update"));
        }
        if let Some(minutes) = self.daily_goal_minutes {
            if !DAILY_GOAL_RANGE.contains(&minutes) {
                return Err(AuthError::validation(
                    "Daily goal must be between 5 and 480 minutes",
                ));
            }
        }
        Ok(())
    }
}

/// Body of `PUT /user/profile/password`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
    pub confirm_new_password: String,
}

impl PasswordChange {
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.old_password.is_empty() || self.new_password.is_empty() {
            return Err(AuthError::validation(
                "Old password and new password are required",
            ));
        }
        if self.new_password != self.confirm_new_password {
            return Err(AuthError::validation("New passwords do not match"));
        }
        Ok(())
    }
}
