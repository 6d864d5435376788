//! Per-stream oplock state record
//!
//! `OplockState` is only ever touched under the owning `Oplock`'s mutex.
//! Anything that must reach code outside this package (completion and
//! break notification routines) is collected in a `DeferredWork` and run
//! after the mutex is released.

use std::time::Instant;

use log::debug;

use super::config::OplockConfig;
use super::error::OplockError;
use super::flags::OplockFlags;
use super::stats::OplockStats;
use super::types::{
    BreakNotice, BreakNotifyRoutine, CompletionRoutine, OpenId, OplockBreakStatus, OplockLevel,
    OplockOutcome, RequestId,
};
use super::waiters::{PendingRequest, WaiterQueue};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Uninitialized,
    Active,
    TornDown,
}

/// One open holding an oplock on the stream
#[derive(Clone)]
pub(crate) struct Holder {
    pub open: OpenId,
    pub level: OplockLevel,
    pub notify: Option<BreakNotifyRoutine>,
}

/// Outstanding break of an exclusive holder
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingBreak {
    /// Holder being broken; acknowledgments are validated against it
    pub target: OpenId,
    pub from: OplockLevel,
    pub to: OplockLevel,
    pub epoch: u64,
    pub deadline: Option<Instant>,
}

pub(crate) struct OplockState {
    pub lifecycle: Lifecycle,
    /// Level of the first holder (None when nothing is held)
    pub level: OplockLevel,
    /// Exclusive levels have exactly one holder; shared levels may have many
    pub holders: Vec<Holder>,
    pub flags: OplockFlags,
    pub pending_break: Option<PendingBreak>,
    /// Holder revoked by the most recent break timeout
    pub last_expired: Option<OpenId>,
    pub waiters: WaiterQueue,
    pub config: OplockConfig,
    pub stats: OplockStats,
    next_request: u64,
    next_epoch: u64,
}

impl OplockState {
    pub const fn new() -> Self {
        Self {
            lifecycle: Lifecycle::Uninitialized,
            level: OplockLevel::None,
            holders: Vec::new(),
            flags: OplockFlags::empty(),
            pending_break: None,
            last_expired: None,
            waiters: WaiterQueue::new(),
            config: OplockConfig::new(),
            stats: OplockStats {
                total_granted: 0,
                level1_granted: 0,
                batch_granted: 0,
                filter_granted: 0,
                level2_granted: 0,
                denied: 0,
                total_breaks: 0,
                breaks_to_level2: 0,
                breaks_to_none: 0,
                shared_breaks: 0,
                break_acks: 0,
                stale_acks: 0,
                break_timeouts: 0,
                waiters_queued: 0,
                waiters_completed: 0,
                waiters_cancelled: 0,
            },
            next_request: 1,
            next_epoch: 1,
        }
    }

    pub fn ensure_active(&self) -> Result<(), OplockError> {
        match self.lifecycle {
            Lifecycle::Active => Ok(()),
            Lifecycle::Uninitialized => Err(OplockError::InvalidState("oplock not initialized")),
            Lifecycle::TornDown => Err(OplockError::TornDown),
        }
    }

    pub fn holder(&self) -> Option<OpenId> {
        self.holders.first().map(|h| h.open)
    }

    pub fn holding_of(&self, open: OpenId) -> Option<&Holder> {
        self.holders.iter().find(|h| h.open == open)
    }

    pub fn is_break_in_progress(&self) -> bool {
        self.flags.contains(OplockFlags::BREAK_IN_PROGRESS)
    }

    pub fn fast_io_allowed(&self) -> bool {
        self.lifecycle == Lifecycle::Active
            && self.level != OplockLevel::None
            && !self.is_break_in_progress()
    }

    pub fn break_status(&self) -> OplockBreakStatus {
        match self.pending_break {
            Some(pending) => pending.to.into(),
            None => OplockBreakStatus::None,
        }
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    pub fn next_epoch(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        epoch
    }

    /// Apply a grant decided by the evaluator.
    pub fn grant(&mut self, open: OpenId, level: OplockLevel, notify: Option<BreakNotifyRoutine>) {
        if level == OplockLevel::None {
            return;
        }
        if self.last_expired == Some(open) {
            self.last_expired = None;
        }

        if let Some(existing) = self.holders.iter_mut().find(|h| h.open == open) {
            if notify.is_some() {
                existing.notify = notify;
            }
            if level.rank() <= existing.level.rank() {
                return;
            }
            // Upgrade by the sole holder
            existing.level = level;
        } else if level.is_exclusive() {
            self.holders.clear();
            self.holders.push(Holder { open, level, notify });
        } else {
            self.holders.push(Holder { open, level, notify });
        }

        self.refresh_level();
        self.stats.record_grant(level);
        debug!("oplock {} granted to {} ({} holder(s))", level, open, self.holders.len());
    }

    /// Drop every holding of `open`. Returns whether anything was removed.
    pub fn remove_holder(&mut self, open: OpenId) -> bool {
        let before = self.holders.len();
        self.holders.retain(|h| h.open != open);
        let removed = self.holders.len() != before;
        if removed {
            self.refresh_level();
        }
        removed
    }

    pub fn refresh_level(&mut self) {
        self.level = self.holders.first().map_or(OplockLevel::None, |h| h.level);
        self.flags.set(OplockFlags::EXCLUSIVE, self.level.is_exclusive());
    }

    pub fn invariants_hold(&self) -> bool {
        let holder_iff_level = self.holders.is_empty() == (self.level == OplockLevel::None);
        let break_needs_level = !self.is_break_in_progress() || self.level != OplockLevel::None;
        let break_record = self.is_break_in_progress() == self.pending_break.is_some();
        let exclusive_alone = !self.level.is_exclusive() || self.holders.len() == 1;
        holder_iff_level && break_needs_level && break_record && exclusive_alone
    }
}

enum Deferred {
    Complete {
        id: RequestId,
        outcome: OplockOutcome,
        routine: CompletionRoutine,
    },
    Notify {
        routine: BreakNotifyRoutine,
        notice: BreakNotice,
    },
}

/// Callbacks collected under the state lock, run after it is released
#[derive(Default)]
pub(crate) struct DeferredWork {
    items: Vec<Deferred>,
}

impl DeferredWork {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn complete(&mut self, request: PendingRequest, outcome: OplockOutcome) {
        self.complete_routine(request.id, outcome, request.completion);
    }

    pub fn complete_routine(
        &mut self,
        id: RequestId,
        outcome: OplockOutcome,
        routine: CompletionRoutine,
    ) {
        self.items.push(Deferred::Complete { id, outcome, routine });
    }

    pub fn notify(&mut self, routine: BreakNotifyRoutine, notice: BreakNotice) {
        self.items.push(Deferred::Notify { routine, notice });
    }

    /// Outcome recorded for `id` in this batch, if it was completed
    pub fn outcome_of(&self, id: RequestId) -> Option<OplockOutcome> {
        self.items.iter().find_map(|item| match item {
            Deferred::Complete { id: done, outcome, .. } if *done == id => Some(*outcome),
            _ => None,
        })
    }

    /// Must be called with the state lock released.
    pub fn run(self) {
        for item in self.items {
            match item {
                Deferred::Complete { id, outcome, routine } => routine(id, outcome),
                Deferred::Notify { routine, notice } => routine(notice),
            }
        }
    }
}
