//! Error taxonomy shared by every ReportClaw crate.

use thiserror::Error;

/// Errors surfaced synchronously to callers.
///
/// Executor failures are not part of this enum: they are recorded on the task
/// as a [`FailureDetail`](crate::types::FailureDetail) and never propagate.
#[derive(Debug, Error)]
pub enum ReportClawError {
    /// Malformed cadence, empty destinations, conflicting target.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The actor may not perform the requested action.
    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Unknown task kind, malformed task tree, illegal status transition.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Config error: {0}")]
    Config(String),

    /// A delivery transport or the render service failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReportClawError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Authorization(_) | Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ReportClawError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_detail() {
        let err = ReportClawError::Validation("destinations must not be empty".into());
        assert!(err.to_string().contains("Validation error"));
        assert!(err.to_string().contains("destinations"));
    }

    #[test]
    fn test_rejection_classification() {
        assert!(ReportClawError::Authorization("nope".into()).is_rejection());
        assert!(!ReportClawError::Store("disk full".into()).is_rejection());
        assert!(!ReportClawError::Invariant("bad tree".into()).is_rejection());
    }
}
