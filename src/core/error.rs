use thiserror::Error;

use super::types::{FailureKind, FailureReason};

/// Failure taxonomy shared by every pipeline stage.
///
/// `Clone` so a failed topology lookup can be handed to every caller that
/// joined the same in-flight discovery.
#[derive(Debug, Clone, Error)]
pub enum PortalError {
    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("form rejected: {0}")]
    FormValidation(String),

    #[error("captcha rejected on attempt {attempt}")]
    CaptchaRejected { attempt: u32 },

    #[error("captcha retries exhausted after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("timed out waiting for {what} after {timeout_ms}ms")]
    Timeout { what: String, timeout_ms: u64 },

    #[error("unexpected page layout: {0}")]
    Parse(String),

    #[error("portal unavailable: {0}")]
    PortalUnavailable(String),

    #[error("browser session error: {0}")]
    Session(String),

    #[error("duplicate outcome for request {request_id} in run {run_id}")]
    PersistenceConflict { run_id: String, request_id: String },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("cancelled")]
    Cancelled,
}

impl PortalError {
    pub fn timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        PortalError::Timeout {
            what: what.into(),
            timeout_ms,
        }
    }

    /// Transient failures are absorbed by the whole-pipeline retry budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, PortalError::Timeout { .. })
    }

    /// Map a terminal error onto the outcome vocabulary.
    pub fn failure_reason(&self) -> FailureReason {
        let kind = match self {
            PortalError::Navigation(_) => FailureKind::Navigation,
            PortalError::FormValidation(_) => FailureKind::FormValidation,
            PortalError::Timeout { .. } => FailureKind::Timeout,
            PortalError::Parse(_) => FailureKind::Parse,
            PortalError::PortalUnavailable(_) => FailureKind::PortalUnavailable,
            PortalError::Session(_) => FailureKind::SessionUnavailable,
            PortalError::PersistenceConflict { .. } | PortalError::Persistence(_) => {
                FailureKind::Persistence
            }
            PortalError::Cancelled => FailureKind::Cancelled,
            // Both are folded into the navigation bucket when they escape the
            // captcha loop without being converted to an outcome.
            PortalError::CaptchaRejected { .. } | PortalError::ExhaustedRetries { .. } => {
                FailureKind::Navigation
            }
        };
        FailureReason {
            kind,
            message: self.to_string(),
        }
    }
}

impl From<rusqlite::Error> for PortalError {
    fn from(value: rusqlite::Error) -> Self {
        PortalError::Persistence(value.to_string())
    }
}

pub type PortalResult<T> = Result<T, PortalError>;
