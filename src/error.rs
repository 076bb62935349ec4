//! Shared error codes for the command/config surface.
//!
//! Every JSON-facing failure is reported with one of these codes plus a
//! `where` context string and a `retryable` hint, so remote clients can
//! distinguish transient conditions (service not wired yet, bus busy)
//! from permanent ones (bad arguments, unknown command).

use core::fmt;
use core::fmt::Write as _;

/// Closed set of error codes reported on the JSON command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    UnknownCmd = 0,
    BadCmdJson,
    MissingCmd,
    CmdServiceUnavailable,
    ArgsTooLarge,
    CmdHandlerFailed,
    BadCfgJson,
    CfgServiceUnavailable,
    CfgApplyFailed,
    UnknownTopic,
    InternalAckOverflow,
    CfgTruncated,
    MissingArgs,
    MissingSlot,
    BadSlot,
    MissingValue,
    UnknownSlot,
    NotReady,
    Disabled,
    InterlockBlocked,
    IoError,
    Failed,
    InvalidSlot,
    UnusedSlot,
    ReservedSlot,
    InvalidEventId,
    MissingEventId,
    InvalidMode,
    InvalidBool,
    InvalidWeekdayMask,
    InvalidStartHour,
    InvalidStartMinute,
    InvalidEndHour,
    InvalidEndMinute,
    InvalidStartEpoch,
    InvalidEndEpoch,
    InvalidLabel,
    SetFailed,
    ClearFailed,
    ClearAllFailed,
}

impl ErrorCode {
    /// Stable string name used in JSON error payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownCmd => "UnknownCmd",
            Self::BadCmdJson => "BadCmdJson",
            Self::MissingCmd => "MissingCmd",
            Self::CmdServiceUnavailable => "CmdServiceUnavailable",
            Self::ArgsTooLarge => "ArgsTooLarge",
            Self::CmdHandlerFailed => "CmdHandlerFailed",
            Self::BadCfgJson => "BadCfgJson",
            Self::CfgServiceUnavailable => "CfgServiceUnavailable",
            Self::CfgApplyFailed => "CfgApplyFailed",
            Self::UnknownTopic => "UnknownTopic",
            Self::InternalAckOverflow => "InternalAckOverflow",
            Self::CfgTruncated => "CfgTruncated",
            Self::MissingArgs => "MissingArgs",
            Self::MissingSlot => "MissingSlot",
            Self::BadSlot => "BadSlot",
            Self::MissingValue => "MissingValue",
            Self::UnknownSlot => "UnknownSlot",
            Self::NotReady => "NotReady",
            Self::Disabled => "Disabled",
            Self::InterlockBlocked => "InterlockBlocked",
            Self::IoError => "IoError",
            Self::Failed => "Failed",
            Self::InvalidSlot => "InvalidSlot",
            Self::UnusedSlot => "UnusedSlot",
            Self::ReservedSlot => "ReservedSlot",
            Self::InvalidEventId => "InvalidEventId",
            Self::MissingEventId => "MissingEventId",
            Self::InvalidMode => "InvalidMode",
            Self::InvalidBool => "InvalidBool",
            Self::InvalidWeekdayMask => "InvalidWeekdayMask",
            Self::InvalidStartHour => "InvalidStartHour",
            Self::InvalidStartMinute => "InvalidStartMinute",
            Self::InvalidEndHour => "InvalidEndHour",
            Self::InvalidEndMinute => "InvalidEndMinute",
            Self::InvalidStartEpoch => "InvalidStartEpoch",
            Self::InvalidEndEpoch => "InvalidEndEpoch",
            Self::InvalidLabel => "InvalidLabel",
            Self::SetFailed => "SetFailed",
            Self::ClearFailed => "ClearFailed",
            Self::ClearAllFailed => "ClearAllFailed",
        }
    }

    /// Whether a client may usefully retry the failed request.
    pub const fn retryable(self) -> bool {
        matches!(
            self,
            Self::CmdServiceUnavailable
                | Self::CfgServiceUnavailable
                | Self::NotReady
                | Self::IoError
                | Self::InternalAckOverflow
                | Self::CfgTruncated
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Write the standard error object into a bounded reply buffer.
///
/// Falls back to a minimal `{"ok":false}` if the buffer cannot hold the
/// full payload.
pub fn write_error_json<const N: usize>(
    out: &mut heapless::String<N>,
    code: ErrorCode,
    where_: &str,
) {
    out.clear();
    let w = if where_.is_empty() { "unknown" } else { where_ };
    if write!(
        out,
        "{{\"ok\":false,\"err\":{{\"code\":\"{}\",\"where\":\"{}\",\"retryable\":{}}}}}",
        code.as_str(),
        w,
        code.retryable()
    )
    .is_err()
    {
        out.clear();
        let _ = out.push_str("{\"ok\":false}");
    }
}

/// Same as [`write_error_json`] with a slot field for slot-scoped errors.
pub fn write_error_json_slot<const N: usize>(
    out: &mut heapless::String<N>,
    code: ErrorCode,
    where_: &str,
    slot: u8,
) {
    out.clear();
    let w = if where_.is_empty() { "unknown" } else { where_ };
    if write!(
        out,
        "{{\"ok\":false,\"slot\":{},\"err\":{{\"code\":\"{}\",\"where\":\"{}\",\"retryable\":{}}}}}",
        slot,
        code.as_str(),
        w,
        code.retryable()
    )
    .is_err()
    {
        out.clear();
        let _ = out.push_str("{\"ok\":false}");
    }
}
