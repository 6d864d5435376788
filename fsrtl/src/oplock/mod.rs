//! Opportunistic Lock (Oplock) Support
//!
//! Oplocks allow clients to cache file data locally for improved performance.
//! When another client requests access that would invalidate the cache,
//! the oplock is "broken" and the caching client must flush/invalidate.
//!
//! Oplock types:
//! - Level 1 (Exclusive): Client has exclusive access, can cache reads and writes
//! - Level 2 (Shared): Multiple readers, can cache reads only
//! - Batch: Exclusive, also caches open/close
//! - Filter: Shared read for filter drivers, not broken by I/O
//!
//! One `Oplock` lives in each stream's control block. All state changes
//! happen under its own mutex; completion and break notification routines
//! are always invoked after that mutex is released, so they may call back
//! into the same `Oplock`.

mod breaking;
mod config;
mod error;
mod evaluate;
mod flags;
pub mod fsctl;
mod state;
mod stats;
mod types;
mod waiters;

use core::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error};

pub use config::{OplockConfig, TimeoutPolicy, DEFAULT_BREAK_TIMEOUT_MS};
pub use error::OplockError;
pub use evaluate::Decision;
pub use flags::RequestFlags;
pub use fsctl::{fsctl_oplock, fsrtl_oplock_fsctrl, oplock_status, FsctlContext};
pub use stats::OplockStats;
pub use types::{
    BreakNotice, BreakNotifyRoutine, CompletionRoutine, IoOperation, OpenId, OplockBreakStatus,
    OplockLevel, OplockOutcome, RequestId, RequestStatus,
};

use evaluate::evaluate;
use state::{DeferredWork, Lifecycle, OplockState};
use waiters::{PendingRequest, WaitKind};

/// Oplock request from one open
#[derive(Clone)]
pub struct OplockRequest {
    pub requester: OpenId,
    pub level: OplockLevel,
    pub flags: RequestFlags,
    /// Overrides the configured acknowledgment timeout for a break this
    /// request starts
    pub break_timeout: Option<Duration>,
    /// Invoked when the granted oplock is later broken
    pub notify: Option<BreakNotifyRoutine>,
}

impl OplockRequest {
    pub fn new(requester: OpenId, level: OplockLevel) -> Self {
        Self {
            requester,
            level,
            flags: RequestFlags::empty(),
            break_timeout: None,
            notify: None,
        }
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_break_timeout(mut self, timeout: Duration) -> Self {
        self.break_timeout = Some(timeout);
        self
    }

    pub fn with_notify(mut self, routine: BreakNotifyRoutine) -> Self {
        self.notify = Some(routine);
        self
    }
}

/// Oplock structure
///
/// Manages opportunistic locks for a single file stream.
pub struct Oplock {
    state: spin::Mutex<OplockState>,
    /// Snapshot of `fast_io_allowed`, written under the state lock
    fast_io: AtomicBool,
}

impl Oplock {
    /// Create an uninitialized oplock
    pub const fn new() -> Self {
        Self {
            state: spin::Mutex::new(OplockState::new()),
            fast_io: AtomicBool::new(false),
        }
    }

    /// Initialize the oplock. Fails if called twice.
    pub fn initialize(&self, config: OplockConfig) -> Result<(), OplockError> {
        let mut state = self.state.lock();
        match state.lifecycle {
            Lifecycle::Uninitialized => {
                state.config = config;
                state.lifecycle = Lifecycle::Active;
                Ok(())
            }
            Lifecycle::Active => Err(OplockError::InvalidState("oplock already initialized")),
            Lifecycle::TornDown => Err(OplockError::TornDown),
        }
    }

    /// Tear the oplock down, completing every waiter with `TornDown`.
    ///
    /// Returns the number of waiters that were still queued.
    pub fn uninitialize(&self) -> Result<usize, OplockError> {
        let mut work = DeferredWork::new();
        let failed = {
            let mut state = self.state.lock();
            state.ensure_active()?;

            let failed = state.fail_waiters(OplockOutcome::TornDown, &mut work);
            state.pending_break = None;
            state.holders.clear();
            state.refresh_level();
            state.flags = flags::OplockFlags::empty();
            state.lifecycle = Lifecycle::TornDown;
            self.fast_io.store(false, Ordering::Release);
            failed
        };

        if failed > 0 {
            debug!("oplock torn down with {} waiter(s) pending", failed);
        }
        work.run();
        Ok(failed)
    }

    /// Request an oplock.
    ///
    /// A compatible request is granted and completed before returning. A
    /// conflicting one is queued and breaks the current holder unless a
    /// break is already outstanding.
    pub fn request_oplock(
        &self,
        request: OplockRequest,
        completion: CompletionRoutine,
    ) -> Result<RequestStatus, OplockError> {
        self.submit(
            request.requester,
            WaitKind::Oplock(request.level),
            request.flags,
            request.notify,
            request.break_timeout,
            completion,
        )
    }

    /// Check whether an I/O operation by `open` conflicts with an oplock
    /// held by another open, breaking it and waiting if so.
    pub fn check_oplock(
        &self,
        open: OpenId,
        operation: IoOperation,
        flags: RequestFlags,
        completion: CompletionRoutine,
    ) -> Result<RequestStatus, OplockError> {
        self.submit(open, WaitKind::Operation(operation), flags, None, None, completion)
    }

    /// Complete once no break is outstanding. Never starts a break.
    pub fn wait_for_break(
        &self,
        open: OpenId,
        completion: CompletionRoutine,
    ) -> Result<RequestStatus, OplockError> {
        self.submit(open, WaitKind::BreakWait, RequestFlags::empty(), None, None, completion)
    }

    /// Acknowledge the outstanding break, keeping `level` (None or Level2).
    pub fn acknowledge_break(&self, open: OpenId, level: OplockLevel) -> Result<(), OplockError> {
        self.with_active(|state, work| state.acknowledge(open, level, Instant::now(), work))
    }

    /// Batch holder will close the handle instead of downgrading.
    pub fn acknowledge_close_pending(&self, open: OpenId) -> Result<(), OplockError> {
        self.with_active(|state, _| state.acknowledge_close_pending(open))
    }

    /// Release whatever oplock `open` holds. Returns false if it held none.
    pub fn release(&self, open: OpenId) -> Result<bool, OplockError> {
        self.with_active(|state, work| Ok(state.release(open, Instant::now(), work)))
    }

    /// Cancel a queued request. Returns false if it already completed.
    pub fn cancel(&self, id: RequestId) -> Result<bool, OplockError> {
        self.with_active(|state, work| match state.waiters.remove(id) {
            Some(request) => {
                debug!("{} cancelled", id);
                state.stats.waiters_cancelled += 1;
                work.complete(request, OplockOutcome::Cancelled);
                Ok(true)
            }
            None => Ok(false),
        })
    }

    /// Expire the outstanding break if its deadline is at or before `now`.
    ///
    /// Returns the revoked holder.
    pub fn expire_break(&self, now: Instant) -> Result<Option<OpenId>, OplockError> {
        self.locked(|state, work| Ok(state.expire_break(now, work)))
    }

    /// Timer entry point: `expire_break` at the current time.
    pub fn poll_break_timeout(&self) -> Result<Option<OpenId>, OplockError> {
        self.expire_break(Instant::now())
    }

    /// Dry-run evaluation of a request without changing anything
    pub fn evaluate(&self, open: OpenId, level: OplockLevel) -> Result<Decision, OplockError> {
        let state = self.state.lock();
        state.ensure_active()?;
        Ok(evaluate(&state, open, &WaitKind::Oplock(level), RequestFlags::empty()))
    }

    /// Fast I/O is possible while an oplock is held and not being broken
    pub fn is_fast_io_possible(&self) -> bool {
        self.fast_io.load(Ordering::Acquire)
    }

    /// A Batch oplock is held and not being broken
    pub fn current_batch_oplock(&self) -> bool {
        let state = self.state.lock();
        state.level == OplockLevel::Batch && !state.is_break_in_progress()
    }

    pub fn level(&self) -> OplockLevel {
        self.state.lock().level
    }

    pub fn is_oplock_held(&self) -> bool {
        self.level() != OplockLevel::None
    }

    pub fn is_break_in_progress(&self) -> bool {
        self.state.lock().is_break_in_progress()
    }

    pub fn break_status(&self) -> OplockBreakStatus {
        self.state.lock().break_status()
    }

    pub fn holder(&self) -> Option<OpenId> {
        self.state.lock().holder()
    }

    pub fn holders(&self) -> Vec<(OpenId, OplockLevel)> {
        self.state.lock().holders.iter().map(|h| (h.open, h.level)).collect()
    }

    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn stats(&self) -> OplockStats {
        self.state.lock().stats
    }

    /// Change the acknowledgment timeout for breaks started from now on.
    ///
    /// Only valid while active; use `OplockConfig` to set it up front.
    pub fn set_break_timeout(&self, timeout: Option<Duration>) -> Result<(), OplockError> {
        self.locked(|state, _| {
            state.config.break_timeout = timeout;
            Ok(())
        })
    }

    fn submit(
        &self,
        requester: OpenId,
        kind: WaitKind,
        flags: RequestFlags,
        notify: Option<BreakNotifyRoutine>,
        break_timeout: Option<Duration>,
        completion: CompletionRoutine,
    ) -> Result<RequestStatus, OplockError> {
        self.with_active(move |state, work| {
            let id = state.next_request_id();
            let outcome = match evaluate(state, requester, &kind, flags) {
                Decision::Grant(level) => {
                    state.grant(requester, level, notify);
                    OplockOutcome::Granted(level)
                }
                Decision::Proceed => OplockOutcome::Proceed,
                Decision::Deny => {
                    state.stats.denied += 1;
                    OplockOutcome::Denied
                }
                Decision::MustBreak(to) => {
                    let now = Instant::now();
                    let timeout = break_timeout.or(state.config.break_timeout);
                    debug!("{} from {} queued ({:?}), needs break to {}", id, requester, kind, to);
                    state.stats.waiters_queued += 1;
                    state.waiters.enqueue(PendingRequest {
                        id,
                        requester,
                        kind,
                        flags,
                        notify,
                        break_timeout,
                        completion,
                    });
                    if !state.is_break_in_progress() {
                        state.begin_break(requester, &kind, to, timeout, now, work);
                        state.drain(now, work);
                    }

                    return Ok(match work.outcome_of(id) {
                        Some(outcome) => RequestStatus::Complete(id, outcome),
                        None => RequestStatus::Pending(id),
                    });
                }
            };

            work.complete_routine(id, outcome, completion);
            Ok(RequestStatus::Complete(id, outcome))
        })
    }

    /// Run `f` on an active state, expiring an overdue break first.
    fn with_active<R>(
        &self,
        f: impl FnOnce(&mut OplockState, &mut DeferredWork) -> Result<R, OplockError>,
    ) -> Result<R, OplockError> {
        self.locked(|state, work| {
            state.expire_break(Instant::now(), work);
            f(state, work)
        })
    }

    fn locked<R>(
        &self,
        f: impl FnOnce(&mut OplockState, &mut DeferredWork) -> Result<R, OplockError>,
    ) -> Result<R, OplockError> {
        let mut work = DeferredWork::new();
        let result = {
            let mut state = self.state.lock();
            state.ensure_active()?;
            let result = f(&mut state, &mut work);
            self.fast_io.store(state.fast_io_allowed(), Ordering::Release);
            debug_assert!(state.invariants_hold());
            result
        };
        work.run();
        result
    }
}

impl Default for Oplock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Oplock {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.waiters.is_empty() {
            return;
        }

        error!(
            "oplock dropped without uninitialize; waiters still pending: {:?}",
            state.waiters.ids()
        );
        let mut work = DeferredWork::new();
        state.fail_waiters(OplockOutcome::TornDown, &mut work);
        work.run();
    }
}
