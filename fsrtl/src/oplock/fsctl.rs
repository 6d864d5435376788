//! FSCTL handler
//!
//! Maps the oplock file system control codes onto `Oplock` operations and
//! NTSTATUS-style return values for drivers that dispatch raw FSCTLs.

use log::debug;

use super::error::OplockError;
use super::flags::RequestFlags;
use super::types::{
    BreakNotifyRoutine, CompletionRoutine, OpenId, OplockLevel, OplockOutcome, RequestStatus,
};
use super::{Oplock, OplockRequest};

/// FSCTL codes for oplock operations
pub mod fsctl_oplock {
    /// Request a Level 1 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_1: u32 = 0x00090000;
    /// Request a Level 2 oplock
    pub const FSCTL_REQUEST_OPLOCK_LEVEL_2: u32 = 0x00090004;
    /// Request a Batch oplock
    pub const FSCTL_REQUEST_BATCH_OPLOCK: u32 = 0x00090008;
    /// Request a Filter oplock
    pub const FSCTL_REQUEST_FILTER_OPLOCK: u32 = 0x0009000C;
    /// Acknowledge an oplock break
    pub const FSCTL_OPLOCK_BREAK_ACKNOWLEDGE: u32 = 0x00090010;
    /// Close pending (Batch oplock)
    pub const FSCTL_OPBATCH_ACK_CLOSE_PENDING: u32 = 0x00090014;
    /// Notify when oplock break occurs
    pub const FSCTL_OPLOCK_BREAK_NOTIFY: u32 = 0x00090018;
    /// Acknowledge break to no oplock
    pub const FSCTL_OPLOCK_BREAK_ACK_NO_2: u32 = 0x00090050;
}

/// NT Status codes for oplock operations
pub mod oplock_status {
    /// Success
    pub const STATUS_SUCCESS: i32 = 0;
    /// IRP is pending
    pub const STATUS_PENDING: i32 = 0x00000103u32 as i32;
    /// Oplock not granted
    pub const STATUS_OPLOCK_NOT_GRANTED: i32 = 0xC00000E2u32 as i32;
    /// Invalid oplock protocol
    pub const STATUS_INVALID_OPLOCK_PROTOCOL: i32 = 0xC00000E3u32 as i32;
    /// Cancelled
    pub const STATUS_CANCELLED: i32 = 0xC0000120u32 as i32;
    /// Handle closed / oplock torn down
    pub const STATUS_FILE_CLOSED: i32 = 0xC0000128u32 as i32;
    /// Oplock used before initialization
    pub const STATUS_INVALID_DEVICE_STATE: i32 = 0xC0000184u32 as i32;
}

/// Caller context for one FSCTL
pub struct FsctlContext {
    /// Open issuing the FSCTL
    pub open: OpenId,
    /// Number of open handles to the stream
    pub open_count: u32,
    /// Break notification routine for oplock requests
    pub notify: Option<BreakNotifyRoutine>,
    /// Completion for requests and break-notify waits
    pub completion: Option<CompletionRoutine>,
}

impl FsctlContext {
    pub fn new(open: OpenId, open_count: u32) -> Self {
        Self {
            open,
            open_count,
            notify: None,
            completion: None,
        }
    }

    pub fn with_notify(mut self, routine: BreakNotifyRoutine) -> Self {
        self.notify = Some(routine);
        self
    }

    pub fn with_completion(mut self, completion: CompletionRoutine) -> Self {
        self.completion = Some(completion);
        self
    }
}

/// Handle FSCTL oplock operations
///
/// Oplock requests issued through FSCTLs never break another open's oplock:
/// they are granted or refused with STATUS_OPLOCK_NOT_GRANTED. Level 1,
/// Batch and Filter requests also require that the caller is the only open.
///
/// # Returns
/// NTSTATUS code
pub fn fsrtl_oplock_fsctrl(oplock: &Oplock, fsctl_code: u32, context: FsctlContext) -> i32 {
    use fsctl_oplock::*;

    let FsctlContext {
        open,
        open_count,
        notify,
        completion,
    } = context;
    let completion: CompletionRoutine = match completion {
        Some(completion) => completion,
        None => Box::new(|_, _| {}),
    };

    let level = match fsctl_code {
        FSCTL_REQUEST_OPLOCK_LEVEL_1 => Some(OplockLevel::Level1),
        FSCTL_REQUEST_BATCH_OPLOCK => Some(OplockLevel::Batch),
        FSCTL_REQUEST_FILTER_OPLOCK => Some(OplockLevel::Filter),
        FSCTL_REQUEST_OPLOCK_LEVEL_2 => Some(OplockLevel::Level2),
        _ => None,
    };

    if let Some(level) = level {
        if level != OplockLevel::Level2 && open_count != 1 {
            debug!("{} oplock refused for {}: {} opens", level, open, open_count);
            return oplock_status::STATUS_OPLOCK_NOT_GRANTED;
        }

        let mut request =
            OplockRequest::new(open, level).with_flags(RequestFlags::FAIL_IMMEDIATELY);
        request.notify = notify;

        return match oplock.request_oplock(request, completion) {
            Ok(RequestStatus::Complete(_, OplockOutcome::Granted(_))) => {
                oplock_status::STATUS_SUCCESS
            }
            Ok(_) => oplock_status::STATUS_OPLOCK_NOT_GRANTED,
            Err(err) => error_status(&err),
        };
    }

    let result = match fsctl_code {
        FSCTL_OPLOCK_BREAK_ACKNOWLEDGE => oplock.acknowledge_break(open, OplockLevel::Level2),
        FSCTL_OPLOCK_BREAK_ACK_NO_2 => oplock.acknowledge_break(open, OplockLevel::None),
        FSCTL_OPBATCH_ACK_CLOSE_PENDING => oplock.acknowledge_close_pending(open),
        FSCTL_OPLOCK_BREAK_NOTIFY => {
            return match oplock.wait_for_break(open, completion) {
                Ok(RequestStatus::Pending(_)) => oplock_status::STATUS_PENDING,
                Ok(RequestStatus::Complete(..)) => oplock_status::STATUS_SUCCESS,
                Err(err) => error_status(&err),
            };
        }
        _ => return oplock_status::STATUS_INVALID_OPLOCK_PROTOCOL,
    };

    match result {
        Ok(()) => oplock_status::STATUS_SUCCESS,
        Err(err) => error_status(&err),
    }
}

fn error_status(err: &OplockError) -> i32 {
    match err {
        OplockError::TornDown => oplock_status::STATUS_FILE_CLOSED,
        OplockError::InvalidState(_) => oplock_status::STATUS_INVALID_DEVICE_STATE,
        OplockError::StaleAcknowledgment { .. }
        | OplockError::InvalidAcknowledgment { .. }
        | OplockError::BreakTimeout { .. } => oplock_status::STATUS_INVALID_OPLOCK_PROTOCOL,
    }
}
