#![cfg_attr(not(test), no_std)]

#[macro_use]
pub(crate) mod fmt;

pub mod channel;
pub mod constants;
pub mod dispatch;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod hid;
pub mod reassemble;
pub mod rng;
pub mod time;

use crate::channel::ChannelTable;
use crate::constants::{CID_IDLE_LIFETIME, DEFAULT_MAX_CHANNELS, TXN_TIMEOUT};
use crate::dispatch::{ApduBackend, CborBackend, CommandDispatcher, DispatchOutcome, WinkSignal};
use crate::error::CtapHidError;
use crate::fragment::Fragmenter;
use crate::frame::{CommandCode, RawReport};
use crate::hid::HidTransport;
use crate::reassemble::{ReceiveOutcome, Reassembler};
use crate::rng::Random;
use crate::time::Clock;

pub use crate::dispatch::{Capabilities, DeviceVersion};

/// The CTAPHID transport engine: reassembles inbound HID reports into
/// messages, dispatches them, and fragments the response back out.
///
/// Generalizes `not-webusb`'s single-channel `NotWebUsb` struct into a
/// proper multi-channel engine; `MAX_CHANNELS` plays the same tuning role
/// `not-webusb`'s `MAX_MESSAGE_LEN` const generic did.
pub struct CtapHid<const MAX_CHANNELS: usize = DEFAULT_MAX_CHANNELS> {
    table: ChannelTable<MAX_CHANNELS>,
    dispatcher: CommandDispatcher,
    outbound: Option<Outbound>,
}

/// A response still being pushed out report by report. `pending` caches a
/// report that was already pulled from `fragmenter` but that `send_report`
/// rejected — `Fragmenter::next_report` can't be un-called, so a failed send
/// is retried with the same bytes rather than advancing past them.
struct Outbound {
    cid: u32,
    fragmenter: Fragmenter,
    pending: Option<RawReport>,
}

impl<const MAX_CHANNELS: usize> CtapHid<MAX_CHANNELS> {
    /// Declares a new engine with the given advertised capabilities and
    /// firmware version (spec §6 `declare`/`configure`).
    pub fn new(capabilities: Capabilities, version: DeviceVersion) -> Self {
        CtapHid {
            table: ChannelTable::new(),
            dispatcher: CommandDispatcher::new(capabilities, version),
            outbound: None,
        }
    }

    /// Runs one iteration of the engine loop (spec §4.5 scheduler):
    ///
    /// 1. If a response is still being sent, push its next report and
    ///    return — nothing else happens until it's drained, mirroring
    ///    `not-webusb`'s `UserDataState::SendingResponse`.
    /// 2. Otherwise, read one inbound report (if any) and feed it to the
    ///    reassembler.
    /// 3. If that completed a message, or a previously completed message
    ///    is still waiting (the host stopped polling mid-dispatch), dispatch
    ///    it and start fragmenting the response.
    /// 4. If reassembly produced an error, fragment an ERROR frame instead.
    #[allow(clippy::too_many_arguments)]
    pub fn run_once(
        &mut self,
        clock: &dyn Clock,
        rng: &mut dyn Random,
        hid: &mut dyn HidTransport,
        apdu: &mut dyn ApduBackend,
        cbor: Option<&mut dyn CborBackend>,
        wink: &mut dyn WinkSignal,
    ) {
        if self.outbound.is_some() {
            self.continue_response(hid);
            return;
        }

        let now = clock.now();

        if let Some(report) = hid.recv_report() {
            match Reassembler::feed(&mut self.table, frame::parse(&report), now) {
                ReceiveOutcome::None => {}
                ReceiveOutcome::Complete(cid) => self.begin_response(cid, clock, rng, apdu, cbor, wink, hid),
                ReceiveOutcome::Err(code, cid) => self.begin_error(cid, code, hid),
            }
            return;
        }

        if let Some(row) = self.table.find_complete() {
            let cid = row.cid;
            self.begin_response(cid, clock, rng, apdu, cbor, wink, hid);
            return;
        }

        // No frame arrived this tick. A non-blocking transport can't give us
        // the wait-then-timeout behavior literally, so the stalled-channel
        // check that would otherwise fire when the wait expires runs here
        // instead, on every frame-less poll (spec §4.5).
        if let Some(row) = self.table.find_in_progress() {
            let cid = row.cid;
            if let Some(elapsed) = now.checked_duration_since(row.last_activity) {
                if elapsed > TXN_TIMEOUT {
                    warn!("transaction on {:08x} timed out waiting for next frame", cid);
                    self.begin_error(cid, CtapHidError::MsgTimeout, hid);
                }
            }
        }
    }

    /// Housekeeping independent of any particular report: evicts idle
    /// channels and releases an expired lock. Call this on a steady cadence
    /// (spec §4.1 `periodic_cleanup`, §4.4 lock expiry).
    pub fn periodic_tick(&mut self, clock: &dyn Clock) {
        let now = clock.now();
        self.table.periodic_cleanup(now, CID_IDLE_LIFETIME);
        self.dispatcher.expire_lock(now);
    }

    fn continue_response(&mut self, hid: &mut dyn HidTransport) {
        let report = match self.next_outbound_report() {
            Some(report) => report,
            None => return,
        };

        if hid.send_report(&report) {
            let done = self.outbound.as_ref().map(|out| out.fragmenter.is_done()).unwrap_or(true);
            if done {
                self.outbound = None;
                hid.response_done();
            }
        } else if let Some(out) = self.outbound.as_mut() {
            out.pending = Some(report);
        }
    }

    /// The next report to push for the in-progress response: a cached one
    /// left over from a failed `send_report`, or a freshly fragmented one
    /// read out of the channel's row.
    fn next_outbound_report(&mut self) -> Option<RawReport> {
        if let Some(report) = self.outbound.as_mut()?.pending.take() {
            return Some(report);
        }
        let cid = self.outbound.as_ref()?.cid;
        let payload_len = self.outbound.as_ref()?.fragmenter.declared_len();
        let row = self.table.get(cid)?;
        let payload = &row.payload[0..payload_len];
        self.outbound.as_mut()?.fragmenter.next_report(payload)
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_response(
        &mut self,
        cid: u32,
        clock: &dyn Clock,
        rng: &mut dyn Random,
        apdu: &mut dyn ApduBackend,
        cbor: Option<&mut dyn CborBackend>,
        wink: &mut dyn WinkSignal,
        hid: &mut dyn HidTransport,
    ) {
        match self.dispatcher.dispatch(&mut self.table, cid, clock, rng, apdu, cbor, wink) {
            DispatchOutcome::Respond { cmd, len, payload } => {
                let mut fragmenter = Fragmenter::new(cid, cmd, len);
                // `payload` was copied out of the row before dispatch tore it
                // down (removed outright for BROADCAST_CID), so this never
                // reads through a row that's already gone.
                let report = fragmenter.next_report(&payload[0..len as usize]);
                let done = fragmenter.is_done();
                let mut out = Outbound { cid, fragmenter, pending: None };
                if let Some(report) = report {
                    if hid.send_report(&report) {
                        if done {
                            hid.response_done();
                            return;
                        }
                    } else {
                        out.pending = Some(report);
                    }
                }
                self.outbound = Some(out);
            }
            DispatchOutcome::Error(code) => self.begin_error(cid, code, hid),
        }
    }

    fn begin_error(&mut self, cid: u32, code: CtapHidError, hid: &mut dyn HidTransport) {
        self.table.clear(cid);
        let byte = [code.to_byte()];
        let mut fragmenter = Fragmenter::new(cid, CommandCode::Error.to_byte(), 1);
        let report = fragmenter.next_report(&byte);
        // A single error byte always fits in the INIT frame alone.
        debug_assert!(fragmenter.is_done());
        let report = match report {
            Some(report) => report,
            None => return,
        };
        if hid.send_report(&report) {
            hid.response_done();
        } else {
            self.outbound = Some(Outbound { cid, fragmenter, pending: Some(report) });
        }
    }
}
