//! Oplock levels, identities and the completion contract
//!
//! Everything a file system driver hands to (or receives from) the oplock
//! package is defined here: the levels an open can hold, the identity of an
//! open, the I/O operations that can break an oplock, and the callback
//! types used to complete waiting operations and to notify holders.

use std::fmt;
use std::sync::Arc;

/// Oplock levels
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OplockLevel {
    /// No oplock held
    None = 0,
    /// Level 1 - exclusive, can cache reads and writes
    Level1 = 1,
    /// Batch oplock - exclusive with delayed close
    Batch = 2,
    /// Filter oplock - shared read for filter drivers
    Filter = 3,
    /// Level 2 - shared, can cache reads
    Level2 = 4,
}

impl OplockLevel {
    /// Level 1 or Batch
    pub fn is_exclusive(self) -> bool {
        matches!(self, OplockLevel::Level1 | OplockLevel::Batch)
    }

    /// Level 2 or Filter
    pub fn is_shared(self) -> bool {
        matches!(self, OplockLevel::Level2 | OplockLevel::Filter)
    }

    /// Strength ordering: None < Level2 = Filter < Level1 < Batch
    pub fn rank(self) -> u8 {
        match self {
            OplockLevel::None => 0,
            OplockLevel::Level2 | OplockLevel::Filter => 1,
            OplockLevel::Level1 => 2,
            OplockLevel::Batch => 3,
        }
    }

    /// Whether a grant of `self` to one open can coexist with a grant of
    /// `other` to a different open.
    pub fn is_compatible_with(self, other: OplockLevel) -> bool {
        self == OplockLevel::None
            || other == OplockLevel::None
            || (self.is_shared() && other.is_shared())
    }

    /// The level a conflicting holder is broken to so that a request for
    /// `self` can be granted.
    pub fn break_target(self) -> OplockLevel {
        if self.is_shared() {
            OplockLevel::Level2
        } else {
            OplockLevel::None
        }
    }
}

impl fmt::Display for OplockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OplockLevel::None => "none",
            OplockLevel::Level1 => "level1",
            OplockLevel::Batch => "batch",
            OplockLevel::Filter => "filter",
            OplockLevel::Level2 => "level2",
        };
        f.write_str(name)
    }
}

/// Oplock break status
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockBreakStatus {
    /// No break in progress
    None = 0,
    /// Breaking to Level 2
    ToLevel2 = 1,
    /// Breaking to None
    ToNone = 2,
}

impl From<OplockLevel> for OplockBreakStatus {
    fn from(target: OplockLevel) -> Self {
        match target {
            OplockLevel::Level2 | OplockLevel::Filter => OplockBreakStatus::ToLevel2,
            _ => OplockBreakStatus::ToNone,
        }
    }
}

/// I/O operations that can break an oplock held by another open
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOperation {
    /// Read request
    Read = 0,
    /// Write request
    Write = 1,
    /// Handle create with write access
    HandleCreate = 2,
    /// Lock request
    Lock = 3,
    /// Flush request
    Flush = 4,
    /// Close handle (for batch)
    Close = 5,
}

impl IoOperation {
    /// Level the holder must be broken to before this operation may
    /// proceed, or `None` when `held` does not conflict.
    pub fn required_break(self, held: OplockLevel) -> Option<OplockLevel> {
        use IoOperation::*;

        match (held, self) {
            (OplockLevel::Level1 | OplockLevel::Batch, Write | HandleCreate | Lock) => {
                Some(OplockLevel::None)
            }
            (OplockLevel::Level1 | OplockLevel::Batch, Read) => Some(OplockLevel::Level2),
            (OplockLevel::Batch, Close) => Some(OplockLevel::None),
            (OplockLevel::Level2, Write | Lock) => Some(OplockLevel::None),
            // Filter oplocks are not broken by I/O
            _ => None,
        }
    }
}

/// Identity of one open instance of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpenId(pub u64);

impl fmt::Display for OpenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "open#{}", self.0)
    }
}

/// Sequence number assigned to every request, check and wait
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// How a waiting operation was finally completed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OplockOutcome {
    /// Oplock granted at the given level
    Granted(OplockLevel),
    /// I/O check or break wait may continue
    Proceed,
    /// Request refused without breaking anyone
    Denied,
    /// Removed by the caller before it completed
    Cancelled,
    /// The break it was waiting on timed out
    BreakFailed,
    /// The oplock was uninitialized while the operation waited
    TornDown,
}

/// Completion routine for a pending operation
///
/// Invoked exactly once, never while the oplock's state lock is held.
pub type CompletionRoutine = Box<dyn FnOnce(RequestId, OplockOutcome) + Send>;

/// Break notification routine registered by a holder at grant time
pub type BreakNotifyRoutine = Arc<dyn Fn(BreakNotice) + Send + Sync>;

/// Delivered to a holder when its oplock is being broken
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakNotice {
    /// Open being broken
    pub holder: OpenId,
    /// Level it currently holds
    pub from: OplockLevel,
    /// Strongest level it may keep
    pub to: OplockLevel,
    /// Break sequence number on this stream
    pub epoch: u64,
    /// Whether `acknowledge_break` is expected; shared breaks take effect
    /// immediately
    pub ack_required: bool,
}

/// Result of an entry point that may complete synchronously or later
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Completed before returning; the completion routine has run
    Complete(RequestId, OplockOutcome),
    /// Queued; the completion routine runs later
    Pending(RequestId),
}

impl RequestStatus {
    pub fn id(&self) -> RequestId {
        match *self {
            RequestStatus::Complete(id, _) | RequestStatus::Pending(id) => id,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, RequestStatus::Pending(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_is_symmetric() {
        let levels = [
            OplockLevel::None,
            OplockLevel::Level1,
            OplockLevel::Batch,
            OplockLevel::Filter,
            OplockLevel::Level2,
        ];
        for a in levels {
            for b in levels {
                assert_eq!(a.is_compatible_with(b), b.is_compatible_with(a));
            }
        }
        assert!(OplockLevel::Level2.is_compatible_with(OplockLevel::Filter));
        assert!(!OplockLevel::Level1.is_compatible_with(OplockLevel::Level2));
        assert!(!OplockLevel::Batch.is_compatible_with(OplockLevel::Batch));
    }

    #[test]
    fn test_break_table() {
        use IoOperation::*;

        assert_eq!(Write.required_break(OplockLevel::Batch), Some(OplockLevel::None));
        assert_eq!(Read.required_break(OplockLevel::Level1), Some(OplockLevel::Level2));
        assert_eq!(Close.required_break(OplockLevel::Batch), Some(OplockLevel::None));
        assert_eq!(Close.required_break(OplockLevel::Level1), None);
        assert_eq!(Read.required_break(OplockLevel::Level2), None);
        assert_eq!(Lock.required_break(OplockLevel::Level2), Some(OplockLevel::None));
        assert_eq!(Write.required_break(OplockLevel::Filter), None);
        assert_eq!(Flush.required_break(OplockLevel::Batch), None);
    }
}
