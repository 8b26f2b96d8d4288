//! Splits an outbound logical message into the INIT+CONT report sequence
//! (spec §4.3), the mirror image of `reassemble.rs`.
//!
//! Grounded in `examples/original_source/ctap_protocol.c`'s
//! `ctaphid_send_response`, which walks the same union of "first INIT frame,
//! then CONT frames until the declared length is exhausted" — but expressed
//! here as a pull-based iterator instead of a function that owns the USB
//! write loop, so the HID collaborator decides the pacing.

use crate::constants::{CONT_DATA_LEN, INIT_DATA_LEN, MAX_SEQ};
use crate::frame::{encode_cont, encode_init, RawReport};

/// Yields the frame sequence for one outbound message, one report at a
/// time. The caller drives it: call [`Fragmenter::next_report`] once per
/// HID IN transaction until it returns `None`.
pub struct Fragmenter {
    cid: u32,
    cmd: u8,
    total_len: u16,
    sent: u16,
    seq: u8,
    done: bool,
}

impl Fragmenter {
    /// `payload.len()` must fit in a `u16` (it's bounded by `MAX_PAYLOAD`
    /// upstream). `cmd` is the bare command byte, without `CMD_BIT`.
    pub fn new(cid: u32, cmd: u8, payload_len: u16) -> Self {
        Fragmenter {
            cid,
            cmd,
            total_len: payload_len,
            sent: 0,
            seq: 0,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The total payload length this fragmenter was constructed for.
    pub fn declared_len(&self) -> usize {
        self.total_len as usize
    }

    /// Produces the next report of the sequence, reading the corresponding
    /// slice out of `payload`. Returns `None` once every byte (including
    /// the `payload.len() == 0` case, which still emits one INIT frame) has
    /// been sent.
    pub fn next_report(&mut self, payload: &[u8]) -> Option<RawReport> {
        if self.done {
            return None;
        }
        debug_assert_eq!(payload.len(), self.total_len as usize);

        if self.sent == 0 {
            let take = (self.total_len as usize).min(INIT_DATA_LEN);
            let report = encode_init(self.cid, self.cmd, self.total_len, &payload[0..take]);
            self.sent = take as u16;
            if self.sent >= self.total_len {
                self.done = true;
            }
            Some(report)
        } else {
            let remaining = (self.total_len - self.sent) as usize;
            let take = remaining.min(CONT_DATA_LEN);
            let start = self.sent as usize;
            let report = encode_cont(self.cid, self.seq, &payload[start..start + take]);
            self.sent += take as u16;
            self.seq = if self.seq == MAX_SEQ { 0 } else { self.seq + 1 };
            if self.sent >= self.total_len {
                self.done = true;
            }
            Some(report)
        }
    }
}
