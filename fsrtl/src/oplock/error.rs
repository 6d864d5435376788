//! Oplock error types

use thiserror::Error;

use super::types::{OpenId, OplockLevel};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OplockError {
    /// Caller broke the lifecycle contract (double initialize, use before
    /// initialize)
    #[error("invalid oplock state: {0}")]
    InvalidState(&'static str),

    /// Acknowledgment from an open that is not the pending break target
    #[error("stale break acknowledgment from {open} (pending target: {expected:?})")]
    StaleAcknowledgment {
        open: OpenId,
        expected: Option<OpenId>,
    },

    /// Acknowledged level is stronger than the break allows
    #[error("{open} acknowledged break to {level}, but the break allows at most {allowed}")]
    InvalidAcknowledgment {
        open: OpenId,
        level: OplockLevel,
        allowed: OplockLevel,
    },

    /// Acknowledgment arrived after the break had timed out and the holder
    /// was revoked
    #[error("break of {holder} timed out; its oplock was revoked")]
    BreakTimeout { holder: OpenId },

    /// Oplock was uninitialized
    #[error("oplock has been torn down")]
    TornDown,
}
