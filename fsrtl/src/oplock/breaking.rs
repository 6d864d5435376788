//! Break coordination
//!
//! # Break Notification Flow
//! 1. A request or I/O check evaluates to `MustBreak` and is queued
//! 2. `begin_break` notifies the holder; exclusive holders are left in
//!    place with `BREAK_IN_PROGRESS` set, shared holders are dropped at once
//! 3. The holder flushes its caches and calls `acknowledge` (or closes the
//!    handle, which releases it)
//! 4. Waiters are drained in arrival order; a waiter that still conflicts
//!    starts the next break cycle
//!
//! A break that is not acknowledged before its deadline is expired: the
//! holder is revoked to None and the waiters are failed or re-evaluated
//! according to the configured `TimeoutPolicy`.

use std::time::{Duration, Instant};

use log::{debug, warn};

use super::config::TimeoutPolicy;
use super::error::OplockError;
use super::flags::OplockFlags;
use super::state::{DeferredWork, Holder, OplockState, PendingBreak};
use super::types::{BreakNotice, OpenId, OplockLevel, OplockOutcome};
use super::waiters::WaitKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BreakProgress {
    /// Waiting for the holder to acknowledge
    Pending,
    /// Conflicting holders are gone; evaluate again
    Completed,
}

impl OplockState {
    /// Break whoever conflicts with `requester` down to at most `to`.
    pub(crate) fn begin_break(
        &mut self,
        requester: OpenId,
        kind: &WaitKind,
        to: OplockLevel,
        timeout: Option<Duration>,
        now: Instant,
        work: &mut DeferredWork,
    ) -> BreakProgress {
        if self.is_break_in_progress() {
            return BreakProgress::Pending;
        }

        if self.level.is_exclusive() {
            self.break_exclusive(requester, to, timeout, now, work)
        } else {
            self.break_shared(requester, kind, work)
        }
    }

    fn break_exclusive(
        &mut self,
        requester: OpenId,
        to: OplockLevel,
        timeout: Option<Duration>,
        now: Instant,
        work: &mut DeferredWork,
    ) -> BreakProgress {
        let Some(holder) = self.holders.first().cloned() else {
            return BreakProgress::Completed;
        };
        if holder.open == requester {
            return BreakProgress::Completed;
        }

        let epoch = self.next_epoch();
        let from = self.level;
        self.flags.insert(OplockFlags::BREAK_IN_PROGRESS);
        self.pending_break = Some(PendingBreak {
            target: holder.open,
            from,
            to,
            epoch,
            deadline: timeout.and_then(|t| now.checked_add(t)),
        });
        self.stats.record_break(to);

        debug!(
            "breaking {} oplock of {} to {} for {} (epoch {})",
            from, holder.open, to, requester, epoch
        );

        match holder.notify {
            Some(routine) => {
                self.flags.insert(OplockFlags::BREAK_NOTIFY_SENT);
                work.notify(
                    routine,
                    BreakNotice {
                        holder: holder.open,
                        from,
                        to,
                        epoch,
                        ack_required: true,
                    },
                );
            }
            None => warn!(
                "{} holds {} without a break notification routine; break relies on timeout",
                holder.open, from
            ),
        }

        BreakProgress::Pending
    }

    /// Level II style break: conflicting shared holders lose their oplock
    /// immediately, no acknowledgment.
    ///
    /// An oplock request breaks every other holder. An I/O operation only
    /// breaks the holders its break table names, so Filter holders survive.
    fn break_shared(
        &mut self,
        requester: OpenId,
        kind: &WaitKind,
        work: &mut DeferredWork,
    ) -> BreakProgress {
        let spared = |h: &Holder| match *kind {
            WaitKind::Operation(operation) => operation.required_break(h.level).is_none(),
            WaitKind::Oplock(_) | WaitKind::BreakWait => false,
        };
        let (kept, broken): (Vec<_>, Vec<_>) = self
            .holders
            .drain(..)
            .partition(|h| h.open == requester || spared(h));
        self.holders = kept;
        self.refresh_level();

        if broken.is_empty() {
            return BreakProgress::Completed;
        }

        let epoch = self.next_epoch();
        self.stats.record_break(OplockLevel::None);
        self.stats.shared_breaks += broken.len() as u64;
        debug!(
            "broke {} shared holder(s) to none for {} (epoch {})",
            broken.len(),
            requester,
            epoch
        );

        for holder in broken {
            if let Some(routine) = holder.notify {
                work.notify(
                    routine,
                    BreakNotice {
                        holder: holder.open,
                        from: holder.level,
                        to: OplockLevel::None,
                        epoch,
                        ack_required: false,
                    },
                );
            }
        }

        BreakProgress::Completed
    }

    /// Holder acknowledges the outstanding break, keeping `level`.
    pub(crate) fn acknowledge(
        &mut self,
        open: OpenId,
        level: OplockLevel,
        now: Instant,
        work: &mut DeferredWork,
    ) -> Result<(), OplockError> {
        let pending = match self.pending_break {
            Some(pending) if pending.target == open => pending,
            other => {
                self.stats.stale_acks += 1;
                if other.is_none() && self.last_expired == Some(open) {
                    warn!("{} acknowledged a break that already timed out", open);
                    return Err(OplockError::BreakTimeout { holder: open });
                }
                let expected = other.map(|p| p.target);
                warn!(
                    "ignoring stale break acknowledgment from {} (pending target {:?})",
                    open, expected
                );
                return Err(OplockError::StaleAcknowledgment { open, expected });
            }
        };

        let valid = match level {
            OplockLevel::None => true,
            OplockLevel::Level2 => pending.to == OplockLevel::Level2,
            _ => false,
        };
        if !valid {
            warn!("{} acknowledged break to {}, allowed {}", open, level, pending.to);
            return Err(OplockError::InvalidAcknowledgment {
                open,
                level,
                allowed: pending.to,
            });
        }

        self.stats.break_acks += 1;
        debug!("{} acknowledged break to {} (epoch {})", open, level, pending.epoch);
        self.finish_break(open, level, now, work);
        Ok(())
    }

    /// Batch holder announces it will close rather than downgrade.
    pub(crate) fn acknowledge_close_pending(&mut self, open: OpenId) -> Result<(), OplockError> {
        match self.pending_break {
            Some(pending) if pending.target == open && pending.from == OplockLevel::Batch => {
                self.flags.insert(OplockFlags::CLOSE_PENDING);
                debug!("{} acknowledged batch break with close pending", open);
                Ok(())
            }
            other => {
                self.stats.stale_acks += 1;
                Err(OplockError::StaleAcknowledgment {
                    open,
                    expected: other.map(|p| p.target),
                })
            }
        }
    }

    /// Open released its oplock (handle closed or voluntary release).
    pub(crate) fn release(&mut self, open: OpenId, now: Instant, work: &mut DeferredWork) -> bool {
        if matches!(self.pending_break, Some(pending) if pending.target == open) {
            debug!("{} released its oplock while being broken", open);
            self.finish_break(open, OplockLevel::None, now, work);
            return true;
        }

        if !self.remove_holder(open) {
            return false;
        }
        debug!("{} released its oplock, now {}", open, self.level);
        self.drain(now, work);
        true
    }

    fn finish_break(
        &mut self,
        open: OpenId,
        level: OplockLevel,
        now: Instant,
        work: &mut DeferredWork,
    ) {
        self.pending_break = None;
        self.flags.remove(
            OplockFlags::BREAK_IN_PROGRESS
                | OplockFlags::BREAK_NOTIFY_SENT
                | OplockFlags::CLOSE_PENDING,
        );
        if self.last_expired == Some(open) {
            self.last_expired = None;
        }

        if level == OplockLevel::None {
            self.remove_holder(open);
        } else {
            for holder in self.holders.iter_mut().filter(|h| h.open == open) {
                holder.level = level;
            }
            self.refresh_level();
        }

        self.drain(now, work);
    }

    /// Revoke the holder if the outstanding break is past its deadline.
    pub(crate) fn expire_break(&mut self, now: Instant, work: &mut DeferredWork) -> Option<OpenId> {
        let pending = self.pending_break?;
        if !pending.deadline.is_some_and(|deadline| deadline <= now) {
            return None;
        }

        self.pending_break = None;
        self.flags.remove(
            OplockFlags::BREAK_IN_PROGRESS
                | OplockFlags::BREAK_NOTIFY_SENT
                | OplockFlags::CLOSE_PENDING,
        );
        self.remove_holder(pending.target);
        self.last_expired = Some(pending.target);
        self.stats.break_timeouts += 1;

        warn!(
            "break of {} ({} to {}, epoch {}) timed out; oplock revoked",
            pending.target, pending.from, pending.to, pending.epoch
        );

        match self.config.timeout_policy {
            TimeoutPolicy::FailWaiters => {
                let failed = self.fail_waiters(OplockOutcome::BreakFailed, work);
                if failed > 0 {
                    warn!("{} waiter(s) failed after break timeout", failed);
                }
            }
            TimeoutPolicy::Reevaluate => self.drain(now, work),
        }

        Some(pending.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplock::flags::RequestFlags;
    use crate::oplock::types::{BreakNotifyRoutine, IoOperation, RequestId};
    use crate::oplock::waiters::{PendingRequest, WaitKind};
    use std::sync::{Arc, Mutex};

    const X: OpenId = OpenId(1);
    const Y: OpenId = OpenId(2);
    const Z: OpenId = OpenId(3);

    fn notices() -> (BreakNotifyRoutine, Arc<Mutex<Vec<BreakNotice>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let routine: BreakNotifyRoutine =
            Arc::new(move |notice: BreakNotice| sink.lock().unwrap().push(notice));
        (routine, seen)
    }

    fn break_for_request(
        state: &mut OplockState,
        requester: OpenId,
        to: OplockLevel,
        timeout: Option<Duration>,
        now: Instant,
        work: &mut DeferredWork,
    ) -> BreakProgress {
        let kind = WaitKind::Oplock(OplockLevel::Level1);
        state.begin_break(requester, &kind, to, timeout, now, work)
    }

    fn waiter(state: &mut OplockState, open: OpenId, level: OplockLevel) -> RequestId {
        let id = state.next_request_id();
        state.waiters.enqueue(PendingRequest {
            id,
            requester: open,
            kind: WaitKind::Oplock(level),
            flags: RequestFlags::empty(),
            notify: None,
            break_timeout: None,
            completion: Box::new(|_, _| {}),
        });
        id
    }

    #[test]
    fn test_exclusive_break_waits_for_ack() {
        let (routine, seen) = notices();
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Batch, Some(routine));
        let y = waiter(&mut state, Y, OplockLevel::Level1);

        let now = Instant::now();
        let mut work = DeferredWork::new();
        let progress = break_for_request(&mut state, Y, OplockLevel::None, None, now, &mut work);
        assert_eq!(progress, BreakProgress::Pending);
        assert!(state.is_break_in_progress());
        assert!(state.flags.contains(OplockFlags::BREAK_NOTIFY_SENT));

        // A second begin_break must not notify again
        assert_eq!(
            break_for_request(&mut state, Z, OplockLevel::None, None, now, &mut work),
            BreakProgress::Pending
        );
        work.run();
        assert_eq!(seen.lock().unwrap().len(), 1);

        let mut work = DeferredWork::new();
        state.acknowledge(X, OplockLevel::None, now, &mut work).unwrap();
        assert_eq!(work.outcome_of(y), Some(OplockOutcome::Granted(OplockLevel::Level1)));
        assert_eq!(state.holder(), Some(Y));
        assert!(state.invariants_hold());
    }

    #[test]
    fn test_shared_break_is_immediate() {
        let (routine, seen) = notices();
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level2, Some(routine.clone()));
        state.grant(Y, OplockLevel::Level2, Some(routine.clone()));
        state.grant(Z, OplockLevel::Filter, Some(routine));

        let mut work = DeferredWork::new();
        let now = Instant::now();
        let progress = break_for_request(&mut state, Y, OplockLevel::None, None, now, &mut work);
        assert_eq!(progress, BreakProgress::Completed);
        assert_eq!(state.holders.len(), 1);
        assert_eq!(state.holder(), Some(Y));
        assert!(!state.is_break_in_progress());

        work.run();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|n| !n.ack_required && n.to == OplockLevel::None));
    }

    #[test]
    fn test_io_break_spares_filter_holder() {
        let (routine, seen) = notices();
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level2, Some(routine.clone()));
        state.grant(Z, OplockLevel::Filter, Some(routine));

        let mut work = DeferredWork::new();
        let write = WaitKind::Operation(IoOperation::Write);
        let now = Instant::now();
        let progress = state.begin_break(Y, &write, OplockLevel::None, None, now, &mut work);
        assert_eq!(progress, BreakProgress::Completed);
        assert_eq!(state.holder(), Some(Z));
        assert_eq!(state.level, OplockLevel::Filter);
        assert_eq!(state.stats.shared_breaks, 1);
        assert!(state.invariants_hold());

        work.run();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].holder, X);
    }

    #[test]
    fn test_ack_validation() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);
        let now = Instant::now();
        let mut work = DeferredWork::new();
        break_for_request(&mut state, Y, OplockLevel::None, None, now, &mut work);

        assert_eq!(
            state.acknowledge(Y, OplockLevel::None, now, &mut work),
            Err(OplockError::StaleAcknowledgment { open: Y, expected: Some(X) })
        );
        assert_eq!(
            state.acknowledge(X, OplockLevel::Level2, now, &mut work),
            Err(OplockError::InvalidAcknowledgment {
                open: X,
                level: OplockLevel::Level2,
                allowed: OplockLevel::None,
            })
        );
        assert!(state.is_break_in_progress());
        assert_eq!(state.stats.stale_acks, 1);
    }

    #[test]
    fn test_ack_to_level2_keeps_holder_shared() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Batch, None);
        let z = waiter(&mut state, Z, OplockLevel::Level2);
        let now = Instant::now();
        let mut work = DeferredWork::new();
        break_for_request(&mut state, Z, OplockLevel::Level2, None, now, &mut work);
        state.acknowledge(X, OplockLevel::Level2, now, &mut work).unwrap();

        assert_eq!(state.level, OplockLevel::Level2);
        assert_eq!(state.holders.len(), 2);
        assert_eq!(work.outcome_of(z), Some(OplockOutcome::Granted(OplockLevel::Level2)));
    }

    #[test]
    fn test_expire_fails_waiters() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);
        let y = waiter(&mut state, Y, OplockLevel::Level1);
        let now = Instant::now();
        let mut work = DeferredWork::new();
        let timeout = Some(Duration::from_secs(5));
        break_for_request(&mut state, Y, OplockLevel::None, timeout, now, &mut work);

        assert_eq!(state.expire_break(now, &mut work), None);
        assert_eq!(state.expire_break(now + Duration::from_secs(5), &mut work), Some(X));
        assert_eq!(state.level, OplockLevel::None);
        assert_eq!(work.outcome_of(y), Some(OplockOutcome::BreakFailed));

        assert_eq!(
            state.acknowledge(X, OplockLevel::None, now, &mut work),
            Err(OplockError::BreakTimeout { holder: X })
        );
    }

    #[test]
    fn test_regrant_after_timeout_clears_expired_holder() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);
        let now = Instant::now();
        let mut work = DeferredWork::new();
        let timeout = Some(Duration::from_secs(1));
        break_for_request(&mut state, Y, OplockLevel::None, timeout, now, &mut work);
        assert_eq!(state.expire_break(now + Duration::from_secs(1), &mut work), Some(X));

        state.grant(X, OplockLevel::Level2, None);
        assert_eq!(state.last_expired, None);
        assert_eq!(
            state.acknowledge(X, OplockLevel::None, now, &mut work),
            Err(OplockError::StaleAcknowledgment { open: X, expected: None })
        );
    }

    #[test]
    fn test_release_by_break_target_completes_break() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Batch, None);
        let y = waiter(&mut state, Y, OplockLevel::Batch);
        let now = Instant::now();
        let mut work = DeferredWork::new();
        break_for_request(&mut state, Y, OplockLevel::None, None, now, &mut work);
        state.acknowledge_close_pending(X).unwrap();
        assert!(state.flags.contains(OplockFlags::CLOSE_PENDING));

        assert!(state.release(X, now, &mut work));
        assert!(!state.flags.contains(OplockFlags::CLOSE_PENDING));
        assert_eq!(work.outcome_of(y), Some(OplockOutcome::Granted(OplockLevel::Batch)));
        assert!(!state.release(X, now, &mut work));
    }
}
