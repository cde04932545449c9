//! Data models exchanged with the learning platform backend.
//!
//! - `Principal`: the signed-in user's profile and learning preferences
//! - `RegistrationForm`, `ProfileUpdate`, `PasswordChange`: request payloads
//!   with client-side validation

pub mod forms;
pub mod principal;

pub use forms::{
    is_valid_email, validate_password_strength, PasswordChange, ProfileUpdate, RegistrationForm,
    DAILY_GOAL_RANGE, DEFAULT_DAILY_GOAL_MINUTES,
};
pub use principal::{Difficulty, LearningStyle, Principal};
