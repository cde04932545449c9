use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ============================================================================
// Preference Enums
// ============================================================================

/// How the learner prefers to absorb material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LearningStyle {
    #[default]
    Visual,
    Auditory,
    Kinesthetic,
    Reading,
    /// Any value the backend sends that this client does not know about
    #[serde(other)]
    Unknown,
}

impl LearningStyle {
    /// Styles a user may pick when registering or editing their profile.
    pub const SELECTABLE: [LearningStyle; 4] = [
        LearningStyle::Visual,
        LearningStyle::Auditory,
        LearningStyle::Kinesthetic,
        LearningStyle::Reading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LearningStyle::Visual => "visual",
            LearningStyle::Auditory => "auditory",
            LearningStyle::Kinesthetic => "kinesthetic",
            LearningStyle::Reading => "reading",
            LearningStyle::Unknown => "unknown",
        }
    }

    /// Parse user input, case-insensitively. Returns None for unrecognized text.
    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        Self::SELECTABLE.into_iter().find(|style| style.as_str() == lower)
    }
}

impl fmt::Display for LearningStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preferred difficulty of recommended content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
    #[serde(other)]
    Unknown,
}

impl Difficulty {
    pub const SELECTABLE: [Difficulty; 3] = [
        Difficulty::Beginner,
        Difficulty::Intermediate,
        Difficulty::Advanced,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
            Difficulty::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let lower = s.trim().to_lowercase();
        Self::SELECTABLE.into_iter().find(|d| d.as_str() == lower)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Principal
// ============================================================================

/// The authenticated user's profile as returned by the backend.
///
/// Only `id` and `username` are guaranteed; everything else is filled with
/// defaults when the backend omits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub learning_style: Option<LearningStyle>,
    #[serde(default)]
    pub preferred_difficulty: Option<Difficulty>,
    #[serde(default)]
    pub daily_goal_minutes: Option<u32>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub study_reminders_enabled: Option<bool>,
    #[serde(default)]
    pub notification_email: Option<bool>,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub updated_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub last_login: Option<NaiveDateTime>,
}

impl Principal {
    /// Minimal principal carrying only identity fields.
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: None,
            first_name: None,
            last_name: None,
            learning_style: None,
            preferred_difficulty: None,
            daily_goal_minutes: None,
            is_active: None,
            study_reminders_enabled: None,
            notification_email: None,
            created_at: None,
            updated_at: None,
            last_login: None,
        }
    }

    /// "First Last" when a name is on file, otherwise the username.
    pub fn display_name(&self) -> String {
        let first = self.first_name.as_deref().map(str::trim).unwrap_or("");
        let last = self.last_name.as_deref().map(str::trim).unwrap_or("");
        match (first.is_empty(), last.is_empty()) {
            (true, true) => self.username.clone(),
            (false, true) => first.to_string(),
            (true, false) => last.to_string(),
            (false, false) => format!("{} {}", first, last),
        }
    }
}
