//! FIFO queue of operations waiting on an oplock break
//!
//! Arrival order is the only fairness guarantee: drain always looks at the
//! front of the queue and stops at the first waiter that needs a break the
//! holder has not acknowledged yet.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::debug;

use super::breaking::BreakProgress;
use super::evaluate::{evaluate, Decision};
use super::flags::RequestFlags;
use super::state::{DeferredWork, OplockState};
use super::types::{
    BreakNotifyRoutine, CompletionRoutine, IoOperation, OpenId, OplockLevel, OplockOutcome,
    RequestId,
};

/// What a waiter is waiting for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitKind {
    /// Oplock request at a level
    Oplock(OplockLevel),
    /// I/O operation that conflicts with the current holder
    Operation(IoOperation),
    /// Wait for an outstanding break to resolve, never breaks anything
    BreakWait,
}

pub(crate) struct PendingRequest {
    pub id: RequestId,
    pub requester: OpenId,
    pub kind: WaitKind,
    pub flags: RequestFlags,
    /// Registered with the holding if this request is granted
    pub notify: Option<BreakNotifyRoutine>,
    /// Overrides the configured acknowledgment timeout for breaks it starts
    pub break_timeout: Option<Duration>,
    pub completion: CompletionRoutine,
}

pub(crate) struct WaiterQueue {
    queue: VecDeque<PendingRequest>,
}

impl WaiterQueue {
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    pub fn enqueue(&mut self, request: PendingRequest) {
        self.queue.push_back(request);
    }

    pub fn front(&self) -> Option<&PendingRequest> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<PendingRequest> {
        self.queue.pop_front()
    }

    /// Remove a not-yet-completed request
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        let index = self.queue.iter().position(|r| r.id == id)?;
        self.queue.remove(index)
    }

    pub fn take_all(&mut self) -> VecDeque<PendingRequest> {
        std::mem::take(&mut self.queue)
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.queue.iter().map(|r| r.id).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl OplockState {
    /// Re-evaluate queued waiters front to back.
    ///
    /// Grants, proceeds and denials complete in order. A waiter that still
    /// conflicts starts a new break; shared holders are broken on the spot
    /// and the same waiter is evaluated again, while an exclusive break
    /// leaves it at the front until the holder acknowledges.
    pub(crate) fn drain(&mut self, now: Instant, work: &mut DeferredWork) {
        while !self.is_break_in_progress() {
            let Some(front) = self.waiters.front() else {
                break;
            };
            let (requester, kind, flags) = (front.requester, front.kind, front.flags);
            let timeout = front.break_timeout.or(self.config.break_timeout);

            let outcome = match evaluate(self, requester, &kind, flags) {
                Decision::Grant(level) => {
                    let notify = front.notify.clone();
                    self.grant(requester, level, notify);
                    OplockOutcome::Granted(level)
                }
                Decision::Proceed => OplockOutcome::Proceed,
                Decision::Deny => {
                    self.stats.denied += 1;
                    OplockOutcome::Denied
                }
                Decision::MustBreak(to) => {
                    match self.begin_break(requester, &kind, to, timeout, now, work) {
                        BreakProgress::Pending => break,
                        BreakProgress::Completed => continue,
                    }
                }
            };

            if let Some(request) = self.waiters.pop_front() {
                debug!("{} for {} completed from queue: {:?}", request.id, requester, outcome);
                self.stats.waiters_completed += 1;
                work.complete(request, outcome);
            }
        }
    }

    /// Complete every queued waiter with `outcome`. Returns how many.
    pub(crate) fn fail_waiters(
        &mut self,
        outcome: OplockOutcome,
        work: &mut DeferredWork,
    ) -> usize {
        let waiters = self.waiters.take_all();
        let count = waiters.len();
        for request in waiters {
            self.stats.waiters_completed += 1;
            work.complete(request, outcome);
        }
        count
    }
}
