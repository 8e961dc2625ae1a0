use std::fmt;

use serde::{Deserialize, Serialize};

/// `PAM_SUCCESS`.
pub const PAM_SUCCESS: i32 = 0;
/// `PAM_AUTH_ERR`.
pub const PAM_AUTH_ERR: i32 = 7;

/// Final outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Approved,
    Denied,
    /// Approval skipped for a trusted context.
    Forced,
    Error(String),
}

impl Decision {
    /// Only an explicit approval or a bypass lets the login through.
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Approved | Decision::Forced)
    }

    pub fn pam_code(&self) -> i32 {
        if self.is_accept() {
            PAM_SUCCESS
        } else {
            PAM_AUTH_ERR
        }
    }

    /// Text the challenge message is edited to once resolved.
    pub fn outcome_text(&self) -> String {
        match self {
            Decision::Approved => "Access Granted".to_string(),
            Decision::Denied => "Access Denied".to_string(),
            Decision::Forced => "Access Granted (approval bypassed)".to_string(),
            Decision::Error(reason) => format!("Error: {reason}"),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Denied => write!(f, "denied"),
            Decision::Forced => write!(f, "forced"),
            Decision::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
