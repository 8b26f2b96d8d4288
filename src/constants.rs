//! Wire-fixed constants (spec §3).

use crate::time::{millis, Duration};

/// Size of every HID report this engine reads or writes.
pub const FRAME_LEN: usize = 64;
/// `cid(4) | cmd(1) | bcnth(1) | bcntl(1)`.
pub const INIT_HDR_LEN: usize = 7;
/// `cid(4) | seq(1)`.
pub const CONT_HDR_LEN: usize = 5;
/// Payload bytes an INIT frame can carry.
pub const INIT_DATA_LEN: usize = FRAME_LEN - INIT_HDR_LEN;
/// Payload bytes a CONT frame can carry.
pub const CONT_DATA_LEN: usize = FRAME_LEN - CONT_HDR_LEN;

/// FIDO-spec upper bound on a single logical message.
pub const MAX_PAYLOAD: usize = 7609;

/// Reserved cid used only for channel allocation via INIT.
pub const BROADCAST_CID: u32 = 0xFFFF_FFFF;
/// Invalid cid; never assigned, never accepted.
pub const RESERVED_CID: u32 = 0x0000_0000;

/// High bit of the frame's command/seq byte: set on INIT frames, clear on
/// CONT frames.
pub const CMD_BIT: u8 = 0x80;

/// Default channel table capacity. Within the spec's recommended 5–32
/// range; see DESIGN.md for why 8 was picked over the historical 5/12/32
/// variants.
pub const DEFAULT_MAX_CHANNELS: usize = 8;

/// Inactivity eviction window for an allocated but otherwise idle channel.
pub const CID_IDLE_LIFETIME: Duration = millis(4_500);
/// Deadline for an in-progress transaction to complete.
pub const TXN_TIMEOUT: Duration = millis(600);

/// Length of the INIT command's nonce.
pub const NONCE_LEN: usize = 8;

/// Duration hint passed to the user-presence signal on `WINK`.
pub const WINK_DURATION_MS: u16 = 500;

/// Maximum legal continuation sequence number (7 bits).
pub const MAX_SEQ: u8 = 0x7F;
