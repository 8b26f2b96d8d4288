//! The reassembly state machine (spec §4.2): turns a stream of inbound
//! frames into complete logical messages, one channel at a time.
//!
//! This is the part of the engine with no analogue in the teacher at all —
//! `not-webusb`'s `ContinuationState` only ever tracked one in-flight
//! message for the one cid it cared about. The algorithm instead follows
//! `examples/original_source/ctap_protocol.c`'s `ctap_handle_request`
//! preamble and `ctap_control.c`'s `ctap_extract_pkt` buffering states,
//! generalized to the channel table built in `channel.rs`.

use crate::channel::{ChannelState, ChannelTable};
use crate::constants::{BROADCAST_CID, MAX_PAYLOAD, MAX_SEQ, RESERVED_CID, TXN_TIMEOUT};
use crate::error::CtapHidError;
use crate::frame::{CommandCode, ParsedFrame};
use crate::time::Instant;

/// What happened after feeding one frame into the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReceiveOutcome {
    /// The frame was accepted; the message isn't complete yet.
    None,
    /// `cid`'s message is fully reassembled and ready for dispatch.
    Complete(u32),
    /// `cid` (or, for cid-less failures, the offending frame's declared cid)
    /// must be answered with an ERROR frame carrying this code.
    Err(CtapHidError, u32),
}

/// Drives channel-table transitions from parsed frames. Holds no state of
/// its own beyond the table it's given — the table *is* the reassembly
/// state, one row per channel, including a transient row for `BROADCAST_CID`
/// while an INIT request is in flight on it.
pub struct Reassembler;

impl Reassembler {
    /// Feeds one already-parsed frame into `table`, per spec §4.2 steps
    /// 1–11. `now` is used both for activity refresh and the transaction
    /// timeout check.
    pub fn feed<const N: usize>(
        table: &mut ChannelTable<N>,
        frame: ParsedFrame<'_>,
        now: Instant,
    ) -> ReceiveOutcome {
        let cid = frame.cid();

        // Step 1.
        if cid == RESERVED_CID {
            warn!("rejected frame on reserved cid {:08x}", cid);
            return ReceiveOutcome::Err(CtapHidError::InvalidChannel, cid);
        }

        let is_init = matches!(frame, ParsedFrame::Init { .. });
        let cmd_byte = match &frame {
            ParsedFrame::Init { cmd, .. } => Some(*cmd),
            ParsedFrame::Cont { .. } => None,
        };

        if cid == BROADCAST_CID {
            // Step 4: broadcast only ever carries a bare INIT request; it
            // gets a table row of its own, same as any other cid, but the
            // row is transient — the dispatcher removes it once the INIT
            // response has been composed (§4.4).
            if cmd_byte != Some(CommandCode::Init.to_byte()) {
                warn!("rejected non-init frame on broadcast cid");
                return ReceiveOutcome::Err(CtapHidError::InvalidChannel, cid);
            }
            if !table.exists(BROADCAST_CID) && table.add(BROADCAST_CID, now).is_err() {
                warn!("rejected broadcast init, no free channel slot");
                return ReceiveOutcome::Err(CtapHidError::ChannelBusy, cid);
            }
        } else if !table.exists(cid) {
            // Step 2: any other unrecognized cid is busy, not invalid — the
            // host is expected to INIT first.
            warn!("rejected frame on unknown cid {:08x}", cid);
            return ReceiveOutcome::Err(CtapHidError::ChannelBusy, cid);
        }

        // Step 5: a fully-reassembled, not-yet-dispatched message on this
        // channel can't accept more frames until the dispatcher drains it.
        if table.get(cid).map(|row| row.state) == Some(ChannelState::Complete) {
            warn!("rejected frame on {:08x}, previous message still undispatched", cid);
            return ReceiveOutcome::Err(CtapHidError::Other, cid);
        }

        // Step 6: at most one channel is ever IN_PROGRESS globally.
        let in_progress_elsewhere = table
            .find_in_progress()
            .map(|row| row.cid != cid)
            .unwrap_or(false);
        if in_progress_elsewhere {
            warn!("rejected frame on {:08x}, another channel is in progress", cid);
            return ReceiveOutcome::Err(CtapHidError::ChannelBusy, cid);
        }

        let row = table.get_mut(cid).expect("existence ensured above");

        if row.state == ChannelState::InProgress {
            let is_sync = cmd_byte == Some(CommandCode::Sync.to_byte());
            if is_init || is_sync {
                // Step 7: a fresh INIT (or an explicit SYNC) on a busy
                // channel aborts the old transaction and starts over.
                debug!("channel {:08x} resynced mid-transaction", cid);
                row.reset_counters();
            } else if let Some(elapsed) = now.checked_duration_since(row.last_activity) {
                // Step 8.
                if elapsed > TXN_TIMEOUT {
                    warn!("transaction on {:08x} timed out", cid);
                    row.reset_counters();
                    row.last_activity = now;
                    return ReceiveOutcome::Err(CtapHidError::MsgTimeout, cid);
                }
            }
        }

        // Step 9.
        row.last_activity = now;

        match frame {
            ParsedFrame::Init { cmd, bcnt, data, .. } => {
                // Step 10.
                if bcnt as usize > MAX_PAYLOAD {
                    warn!("rejected init on {:08x}, bcnt {} exceeds max payload", cid, bcnt);
                    row.reset_counters();
                    return ReceiveOutcome::Err(CtapHidError::InvalidLen, cid);
                }
                row.cmd = cmd;
                row.expected_len = bcnt;
                row.received_len = 0;
                row.next_seq = 0;
                row.state = ChannelState::InProgress;

                let take = (bcnt as usize).min(data.len());
                row.payload[0..take].copy_from_slice(&data[0..take]);
                row.received_len = take as u16;

                if row.received_len >= row.expected_len {
                    row.state = ChannelState::Complete;
                    debug!("message on {:08x} complete after init frame", cid);
                    ReceiveOutcome::Complete(cid)
                } else {
                    trace!("init frame accepted on {:08x}, {} of {} bytes", cid, row.received_len, row.expected_len);
                    ReceiveOutcome::None
                }
            }
            ParsedFrame::Cont { seq, data, .. } => {
                // Step 11.
                if row.state != ChannelState::InProgress {
                    warn!("rejected cont frame on {:08x}, channel not in progress", cid);
                    return ReceiveOutcome::Err(CtapHidError::InvalidSeq, cid);
                }
                if row.received_len >= row.expected_len {
                    warn!("rejected cont frame on {:08x}, message already complete", cid);
                    row.reset_counters();
                    return ReceiveOutcome::Err(CtapHidError::InvalidLen, cid);
                }
                if seq > MAX_SEQ || seq != row.next_seq {
                    warn!("rejected cont frame on {:08x}, seq {} expected {}", cid, seq, row.next_seq);
                    row.reset_counters();
                    return ReceiveOutcome::Err(CtapHidError::InvalidSeq, cid);
                }

                let remaining = row.remaining() as usize;
                let take = remaining.min(data.len());
                let start = row.received_len as usize;
                row.payload[start..start + take].copy_from_slice(&data[0..take]);
                row.received_len += take as u16;
                row.next_seq += 1;

                if row.received_len >= row.expected_len {
                    row.state = ChannelState::Complete;
                    debug!("message on {:08x} complete after cont frame", cid);
                    ReceiveOutcome::Complete(cid)
                } else {
                    trace!("cont frame accepted on {:08x}, {} of {} bytes", cid, row.received_len, row.expected_len);
                    ReceiveOutcome::None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn table_with_channel(cid: u32) -> ChannelTable<4> {
        let mut table = ChannelTable::new();
        table.add(cid, Instant::from_ticks(0)).unwrap();
        table
    }

    #[test]
    fn unknown_cid_is_channel_busy() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        let report = frame::encode_init(1, CommandCode::Ping.to_byte(), 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::ChannelBusy, 1));
    }

    #[test]
    fn reserved_cid_is_always_invalid_channel() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        let report = frame::encode_init(RESERVED_CID, CommandCode::Ping.to_byte(), 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::InvalidChannel, RESERVED_CID));
    }

    #[test]
    fn cont_on_broadcast_is_rejected() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        let report = frame::encode_cont(BROADCAST_CID, 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::InvalidChannel, BROADCAST_CID));
    }

    #[test]
    fn broadcast_init_frame_with_non_init_cmd_is_invalid_channel() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        let report = frame::encode_init(BROADCAST_CID, CommandCode::Ping.to_byte(), 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::InvalidChannel, BROADCAST_CID));
    }

    #[test]
    fn broadcast_init_allocates_a_transient_row_and_captures_the_nonce() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        let nonce = [1, 2, 3, 4, 5, 6, 7, 8];
        let report = frame::encode_init(BROADCAST_CID, CommandCode::Init.to_byte(), 8, &nonce);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Complete(BROADCAST_CID));
        let row = table.get(BROADCAST_CID).unwrap();
        assert_eq!(&row.payload[0..8], &nonce);
    }

    #[test]
    fn single_frame_message_completes_immediately() {
        let mut table = table_with_channel(7);
        let report = frame::encode_init(7, CommandCode::Ping.to_byte(), 3, &[1, 2, 3]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Complete(7));
        let row = table.get(7).unwrap();
        assert_eq!(&row.payload[0..3], &[1, 2, 3]);
    }

    #[test]
    fn zero_length_message_completes_on_the_init_frame() {
        let mut table = table_with_channel(7);
        let report = frame::encode_init(7, CommandCode::Ping.to_byte(), 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&report), Instant::from_ticks(0));
        assert_eq!(outcome, ReceiveOutcome::Complete(7));
    }

    #[test]
    fn multi_frame_message_reassembles_in_order() {
        let mut table = table_with_channel(7);
        let init = frame::encode_init(7, CommandCode::Msg.to_byte(), 5, &[1, 2, 3]);
        let cont = frame::encode_cont(7, 0, &[4, 5]);
        assert_eq!(
            Reassembler::feed(&mut table, frame::parse(&init), Instant::from_ticks(0)),
            ReceiveOutcome::None
        );
        assert_eq!(
            Reassembler::feed(&mut table, frame::parse(&cont), Instant::from_ticks(1)),
            ReceiveOutcome::Complete(7)
        );
        let row = table.get(7).unwrap();
        assert_eq!(&row.payload[0..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn out_of_order_seq_is_invalid_seq_and_aborts() {
        let mut table = table_with_channel(7);
        let init = frame::encode_init(7, CommandCode::Msg.to_byte(), 100, &[0; 3]);
        Reassembler::feed(&mut table, frame::parse(&init), Instant::from_ticks(0));
        let bad_cont = frame::encode_cont(7, 5, &[0; 4]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&bad_cont), Instant::from_ticks(1));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::InvalidSeq, 7));
        assert_eq!(table.get(7).unwrap().state, ChannelState::Idle);
    }

    #[test]
    fn second_channel_busy_while_first_in_progress() {
        let mut table: ChannelTable<4> = ChannelTable::new();
        table.add(1, Instant::from_ticks(0)).unwrap();
        table.add(2, Instant::from_ticks(0)).unwrap();
        let init1 = frame::encode_init(1, CommandCode::Msg.to_byte(), 100, &[0; 3]);
        Reassembler::feed(&mut table, frame::parse(&init1), Instant::from_ticks(0));
        let init2 = frame::encode_init(2, CommandCode::Msg.to_byte(), 10, &[0; 3]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&init2), Instant::from_ticks(1));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::ChannelBusy, 2));
    }

    #[test]
    fn fresh_init_resyncs_a_busy_channel() {
        let mut table = table_with_channel(7);
        let init1 = frame::encode_init(7, CommandCode::Msg.to_byte(), 100, &[0; 3]);
        Reassembler::feed(&mut table, frame::parse(&init1), Instant::from_ticks(0));
        let init2 = frame::encode_init(7, CommandCode::Ping.to_byte(), 2, &[9, 9]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&init2), Instant::from_ticks(1));
        assert_eq!(outcome, ReceiveOutcome::Complete(7));
        assert_eq!(&table.get(7).unwrap().payload[0..2], &[9, 9]);
    }

    #[test]
    fn transaction_timeout_fires_on_stale_continuation() {
        let mut table = table_with_channel(7);
        let init = frame::encode_init(7, CommandCode::Msg.to_byte(), 100, &[0; 3]);
        Reassembler::feed(&mut table, frame::parse(&init), Instant::from_ticks(0));
        let cont = frame::encode_cont(7, 0, &[0; 4]);
        let late = Instant::from_ticks(0) + TXN_TIMEOUT + TXN_TIMEOUT;
        let outcome = Reassembler::feed(&mut table, frame::parse(&cont), late);
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::MsgTimeout, 7));
        assert_eq!(table.get(7).unwrap().state, ChannelState::Idle);
    }

    #[test]
    fn complete_channel_rejects_further_frames_with_other_until_drained() {
        let mut table = table_with_channel(7);
        let init = frame::encode_init(7, CommandCode::Ping.to_byte(), 0, &[]);
        Reassembler::feed(&mut table, frame::parse(&init), Instant::from_ticks(0));
        let next = frame::encode_init(7, CommandCode::Ping.to_byte(), 0, &[]);
        let outcome = Reassembler::feed(&mut table, frame::parse(&next), Instant::from_ticks(1));
        assert_eq!(outcome, ReceiveOutcome::Err(CtapHidError::Other, 7));
    }
}
