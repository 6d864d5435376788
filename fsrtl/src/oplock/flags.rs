//! Oplock state and request flags

bitflags::bitflags! {
    /// Internal oplock state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OplockFlags: u32 {
        /// Pending oplock break
        const BREAK_IN_PROGRESS = 0x0001;
        /// Break notification has been sent
        const BREAK_NOTIFY_SENT = 0x0004;
        /// Oplock is exclusive (Level1 or Batch)
        const EXCLUSIVE = 0x0010;
        /// Pending close for batch oplock
        const CLOSE_PENDING = 0x0020;
    }
}

bitflags::bitflags! {
    /// Caller flags for requests and I/O checks
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RequestFlags: u32 {
        /// Deny instead of waiting for a break
        const FAIL_IMMEDIATELY = 0x0002;
    }
}
