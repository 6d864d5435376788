//! Per-stream oplock configuration

use std::time::Duration;

/// Default break acknowledgment timeout (35 seconds)
pub const DEFAULT_BREAK_TIMEOUT_MS: u64 = 35000;

/// What happens to queued waiters when a break times out
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Complete every queued waiter with `BreakFailed`
    #[default]
    FailWaiters,
    /// Re-evaluate queued waiters against the revoked state
    Reevaluate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OplockConfig {
    /// Maximum wait for a break acknowledgment (None = unbounded)
    pub break_timeout: Option<Duration>,
    /// Waiter handling on timeout
    pub timeout_policy: TimeoutPolicy,
}

impl OplockConfig {
    pub const fn new() -> Self {
        Self {
            break_timeout: Some(Duration::from_millis(DEFAULT_BREAK_TIMEOUT_MS)),
            timeout_policy: TimeoutPolicy::FailWaiters,
        }
    }

    pub fn with_break_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.break_timeout = timeout;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }
}

impl Default for OplockConfig {
    fn default() -> Self {
        Self::new()
    }
}
