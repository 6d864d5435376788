//! Request evaluation
//!
//! Pure decision function over the current state: it never mutates the
//! state and never issues a break itself. Callers apply a `Grant`, queue on
//! `MustBreak`, and start the break when none is outstanding.

use super::flags::RequestFlags;
use super::state::OplockState;
use super::types::{IoOperation, OpenId, OplockLevel};
use super::waiters::WaitKind;

/// Evaluation result
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Grant at this level (the held level for idempotent re-requests)
    Grant(OplockLevel),
    /// I/O check or break wait may continue
    Proceed,
    /// Refuse without breaking anyone
    Deny,
    /// Conflicting holder(s) must first be broken to this level
    MustBreak(OplockLevel),
}

pub(crate) fn evaluate(
    state: &OplockState,
    requester: OpenId,
    kind: &WaitKind,
    flags: RequestFlags,
) -> Decision {
    let decision = match *kind {
        WaitKind::Oplock(level) => evaluate_request(state, requester, level),
        WaitKind::Operation(operation) => evaluate_operation(state, requester, operation),
        WaitKind::BreakWait => match state.pending_break {
            Some(pending) => Decision::MustBreak(pending.to),
            None => Decision::Proceed,
        },
    };

    match decision {
        Decision::MustBreak(_) if flags.contains(RequestFlags::FAIL_IMMEDIATELY) => Decision::Deny,
        decision => decision,
    }
}

fn evaluate_request(state: &OplockState, requester: OpenId, level: OplockLevel) -> Decision {
    if level == OplockLevel::None {
        return Decision::Grant(OplockLevel::None);
    }

    // Queue behind the outstanding break, never start a second one
    if state.is_break_in_progress() {
        return Decision::MustBreak(level.break_target());
    }

    if let Some(held) = state.holding_of(requester) {
        if level.rank() <= held.level.rank() {
            return Decision::Grant(held.level);
        }
    }

    let conflict = state
        .holders
        .iter()
        .filter(|h| h.open != requester)
        .any(|h| !h.level.is_compatible_with(level));

    if conflict {
        Decision::MustBreak(level.break_target())
    } else {
        Decision::Grant(level)
    }
}

fn evaluate_operation(state: &OplockState, requester: OpenId, operation: IoOperation) -> Decision {
    // An open's own oplock never blocks its I/O
    let needed = state
        .holders
        .iter()
        .filter(|h| h.open != requester)
        .filter_map(|h| operation.required_break(h.level))
        .min_by_key(|level| level.rank());

    match needed {
        Some(to) => Decision::MustBreak(to),
        None => Decision::Proceed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplock::flags::OplockFlags;
    use crate::oplock::state::PendingBreak;

    const X: OpenId = OpenId(1);
    const Y: OpenId = OpenId(2);
    const Z: OpenId = OpenId(3);

    fn request(state: &OplockState, open: OpenId, level: OplockLevel) -> Decision {
        evaluate(state, open, &WaitKind::Oplock(level), RequestFlags::empty())
    }

    fn start_break(state: &mut OplockState, to: OplockLevel) {
        let target = state.holder().expect("holder");
        state.flags.insert(OplockFlags::BREAK_IN_PROGRESS);
        state.pending_break = Some(PendingBreak {
            target,
            from: state.level,
            to,
            epoch: 1,
            deadline: None,
        });
    }

    #[test]
    fn test_empty_state_grants_anything() {
        let state = OplockState::new();
        let levels = [
            OplockLevel::Level1,
            OplockLevel::Batch,
            OplockLevel::Level2,
            OplockLevel::Filter,
        ];
        for level in levels {
            assert_eq!(request(&state, X, level), Decision::Grant(level));
        }
    }

    #[test]
    fn test_exclusive_conflicts_with_other_opener() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Batch, None);

        assert_eq!(request(&state, Y, OplockLevel::Level1), Decision::MustBreak(OplockLevel::None));
        assert_eq!(
            request(&state, Y, OplockLevel::Level2),
            Decision::MustBreak(OplockLevel::Level2)
        );
        assert_eq!(request(&state, Y, OplockLevel::None), Decision::Grant(OplockLevel::None));
    }

    #[test]
    fn test_holder_rerequest_is_idempotent() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);

        assert_eq!(request(&state, X, OplockLevel::Level1), Decision::Grant(OplockLevel::Level1));
        assert_eq!(request(&state, X, OplockLevel::Level2), Decision::Grant(OplockLevel::Level1));
        // Sole holder may upgrade
        assert_eq!(request(&state, X, OplockLevel::Batch), Decision::Grant(OplockLevel::Batch));
    }

    #[test]
    fn test_shared_levels_coexist() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level2, None);
        state.grant(Y, OplockLevel::Filter, None);

        assert_eq!(request(&state, Z, OplockLevel::Level2), Decision::Grant(OplockLevel::Level2));
        assert_eq!(request(&state, Z, OplockLevel::Level1), Decision::MustBreak(OplockLevel::None));
        // X shares with Y, so it cannot upgrade alone
        assert_eq!(request(&state, X, OplockLevel::Level1), Decision::MustBreak(OplockLevel::None));
    }

    #[test]
    fn test_break_in_progress_queues_everything() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Batch, None);
        start_break(&mut state, OplockLevel::None);

        assert_eq!(
            request(&state, Z, OplockLevel::Level2),
            Decision::MustBreak(OplockLevel::Level2)
        );
        assert_eq!(request(&state, X, OplockLevel::Batch), Decision::MustBreak(OplockLevel::None));
        assert_eq!(
            evaluate(&state, Z, &WaitKind::BreakWait, RequestFlags::empty()),
            Decision::MustBreak(OplockLevel::None)
        );
    }

    #[test]
    fn test_fail_immediately_denies() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);

        let decision = evaluate(
            &state,
            Y,
            &WaitKind::Oplock(OplockLevel::Batch),
            RequestFlags::FAIL_IMMEDIATELY,
        );
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn test_operations() {
        let mut state = OplockState::new();
        state.grant(X, OplockLevel::Level1, None);

        let op = |state: &OplockState, open, operation| {
            evaluate(state, open, &WaitKind::Operation(operation), RequestFlags::empty())
        };

        assert_eq!(op(&state, X, IoOperation::Write), Decision::Proceed);
        assert_eq!(op(&state, Y, IoOperation::Write), Decision::MustBreak(OplockLevel::None));
        assert_eq!(op(&state, Y, IoOperation::Read), Decision::MustBreak(OplockLevel::Level2));
        assert_eq!(op(&state, Y, IoOperation::Flush), Decision::Proceed);
        assert_eq!(
            evaluate(&state, Y, &WaitKind::BreakWait, RequestFlags::empty()),
            Decision::Proceed
        );
    }
}
