//! The two error vocabularies the engine speaks.
//!
//! [`CtapHidError`] is the wire taxonomy of the CTAPHID transport: a single
//! byte that rides back to the host inside an `ERROR` frame. [`EngineError`]
//! never reaches the wire — it's returned by the upward API (`declare`,
//! `configure`) when the embedding application has misused it.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Transport error codes, wire-fixed by the CTAPHID protocol.
///
/// The numeric value is what gets sent as the single-byte payload of an
/// `ERROR` response; see `CommandDispatcher::emit_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CtapHidError {
    /// Sentinel value; never sent over the wire.
    None = 0x00,
    /// Unknown or disallowed command.
    InvalidCmd = 0x01,
    /// Validation failure: bad length, reserved cid, etc.
    InvalidPar = 0x02,
    /// `bcnt` exceeds `MAX_PAYLOAD` or is inconsistent with what was received.
    InvalidLen = 0x03,
    /// Continuation sequence number out of order.
    InvalidSeq = 0x04,
    /// Transaction exceeded `TXN_TIMEOUT`.
    MsgTimeout = 0x05,
    /// Second transaction attempted, table full, or unknown cid.
    ChannelBusy = 0x06,
    LockRequired = 0x0A,
    /// cid = 0, or broadcast used for a non-INIT command.
    InvalidChannel = 0x0B,
    Other = 0x7F,
}

impl CtapHidError {
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Failures of the upward API (`CtapHid::declare`/`configure`/`run_once`).
///
/// These never travel on the wire; they indicate the embedding application
/// has misused the engine (a null callback, a table with no free slot) or
/// that the HID collaborator itself failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineError {
    /// A required callback/collaborator was not supplied.
    NullCallback,
    /// The channel table has no free (or evictable) slot.
    NoCapacity,
    /// The HID transport collaborator reported an error.
    HidError,
}
