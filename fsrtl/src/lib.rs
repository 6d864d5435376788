//! File System Runtime Library (FSRTL)
//!
//! Runtime support shared by file system drivers. This crate provides the
//! opportunistic lock package:
//!
//! - **Oplocks**: per-stream caching leases, broken before a conflicting
//!   open or I/O operation proceeds
//! - **FSCTL dispatch**: raw oplock file system control codes mapped onto
//!   the oplock operations
//!
//! The design follows the NT 5.2 (Windows Server 2003) FsRtl oplock model.

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod oplock;

// Re-export key types
pub use oplock::{
    // Types
    BreakNotice, BreakNotifyRoutine, CompletionRoutine, Decision, IoOperation, OpenId, Oplock,
    OplockBreakStatus, OplockConfig, OplockError, OplockLevel, OplockOutcome, OplockRequest,
    OplockStats, RequestFlags, RequestId, RequestStatus, TimeoutPolicy,
    // FSCTL
    fsctl_oplock, fsrtl_oplock_fsctrl, oplock_status, FsctlContext,
    // Constants
    DEFAULT_BREAK_TIMEOUT_MS,
};
