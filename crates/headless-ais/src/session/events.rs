use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle events of the primary session, broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    LoginStarted {
        timestamp: DateTime<Utc>,
    },

    LoggedIn {
        identifier: String,
        generation: u64,
        try_count: u32,
        captcha_attempts: u32,
        timestamp: DateTime<Utc>,
    },

    LoginFailed {
        error: String,
        /// The user has to enter their account and password again.
        requires_reentry: bool,
        /// Consecutive failures for this identity.
        failure_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A token was rejected by the Academic System and dropped.
    TokenInvalidated {
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    /// The refreshed token was rejected too.
    SessionExpired {
        generation: u64,
        timestamp: DateTime<Utc>,
    },

    LoggedOut {
        timestamp: DateTime<Utc>,
    },
}

impl SessionEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::LoginStarted { .. } => "login_started",
            Self::LoggedIn { .. } => "logged_in",
            Self::LoginFailed { .. } => "login_failed",
            Self::TokenInvalidated { .. } => "token_invalidated",
            Self::SessionExpired { .. } => "session_expired",
            Self::LoggedOut { .. } => "logged_out",
        }
    }

    /// Human-readable one-liner for UI toasts and logs.
    pub fn to_message(&self) -> String {
        match self {
            Self::LoginStarted { .. } => "Signing in to the academic system".to_string(),
            Self::LoggedIn {
                identifier,
                try_count,
                captcha_attempts,
                ..
            } => format!(
                "Signed in as {identifier} ({try_count} cycle(s), {captcha_attempts} captcha attempt(s))"
            ),
            Self::LoginFailed {
                error,
                requires_reentry,
                failure_count,
                ..
            } => {
                if *requires_reentry {
                    format!("Sign-in failed, please sign in again: {error}")
                } else {
                    format!("Sign-in failed (attempt {failure_count}): {error}")
                }
            }
            Self::TokenInvalidated { generation, .. } => {
                format!("Session #{generation} was rejected, refreshing")
            }
            Self::SessionExpired { generation, .. } => {
                format!("Session #{generation} expired right after refresh")
            }
            Self::LoggedOut { .. } => "Signed out".to_string(),
        }
    }
}
