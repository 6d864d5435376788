//! Oplock statistics for monitoring

use super::types::OplockLevel;

/// Per-stream oplock counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OplockStats {
    /// Total oplocks granted
    pub total_granted: u64,
    /// Level 1 oplocks granted
    pub level1_granted: u64,
    /// Batch oplocks granted
    pub batch_granted: u64,
    /// Filter oplocks granted
    pub filter_granted: u64,
    /// Level 2 oplocks granted
    pub level2_granted: u64,
    /// Requests denied
    pub denied: u64,
    /// Total oplock breaks initiated (exclusive and shared)
    pub total_breaks: u64,
    /// Breaks to Level 2
    pub breaks_to_level2: u64,
    /// Breaks to None
    pub breaks_to_none: u64,
    /// Shared holders broken without acknowledgment
    pub shared_breaks: u64,
    /// Break acknowledgements received
    pub break_acks: u64,
    /// Acknowledgements rejected as stale
    pub stale_acks: u64,
    /// Breaks revoked after the acknowledgment timeout
    pub break_timeouts: u64,
    /// Waiters queued for break completion
    pub waiters_queued: u64,
    /// Waiters completed
    pub waiters_completed: u64,
    /// Waiters cancelled
    pub waiters_cancelled: u64,
}

impl OplockStats {
    pub(crate) fn record_grant(&mut self, level: OplockLevel) {
        self.total_granted += 1;
        match level {
            OplockLevel::Level1 => self.level1_granted += 1,
            OplockLevel::Batch => self.batch_granted += 1,
            OplockLevel::Filter => self.filter_granted += 1,
            OplockLevel::Level2 => self.level2_granted += 1,
            OplockLevel::None => {}
        }
    }

    pub(crate) fn record_break(&mut self, to: OplockLevel) {
        self.total_breaks += 1;
        if to == OplockLevel::None {
            self.breaks_to_none += 1;
        } else {
            self.breaks_to_level2 += 1;
        }
    }
}
