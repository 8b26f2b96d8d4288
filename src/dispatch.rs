//! Command dispatch (spec §4.4): once a channel's message is fully
//! reassembled, this turns `(cid, cmd, payload)` into a response, or an
//! error code to report back to the host.
//!
//! The actual CTAP1/CTAP2 message semantics are out of scope (see
//! SPEC_FULL.md's Non-goals) — `ApduBackend`/`CborBackend` are the
//! downward collaborators that own them, the same pattern `not-webusb`
//! uses for its `web_origin_filter` callback and its `UserDataState`
//! request/response handoff, generalized to CTAPHID's larger command set.

use crate::channel::{ChannelState, ChannelTable};
use crate::constants::{BROADCAST_CID, MAX_PAYLOAD, NONCE_LEN, RESERVED_CID, WINK_DURATION_MS};
use crate::error::CtapHidError;
use crate::frame::CommandCode;
use crate::rng::Random;
use crate::time::{millis, Clock, Instant};

/// Device capability bits advertised in the INIT response (spec §4.4,
/// GLOSSARY). Values per
/// `examples/original_source/ctap_protocol.h`'s `ctap_capa_id_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Capabilities(u8);

impl Capabilities {
    pub const WINK: Capabilities = Capabilities(0x01);
    pub const LOCK: Capabilities = Capabilities(0x02);
    pub const CBOR: Capabilities = Capabilities(0x04);
    /// Device speaks CBOR only; CTAP1/U2F `MSG` is unsupported.
    pub const NMSG: Capabilities = Capabilities(0x08);

    pub const fn none() -> Self {
        Capabilities(0)
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, flag: Capabilities) -> bool {
        self.0 & flag.0 == flag.0
    }

    pub const fn to_byte(self) -> u8 {
        self.0
    }
}

/// Firmware version triple reported in the INIT response.
#[derive(Debug, Clone, Copy)]
pub struct DeviceVersion {
    pub major: u8,
    pub minor: u8,
    pub build: u8,
}

/// The CTAPHID channel lock (spec §4.4 `LOCK`): while held, every message
/// from a channel that isn't `cid` is rejected with `ChannelBusy`.
#[derive(Debug, Clone, Copy)]
struct Lock {
    cid: u32,
    expires_at: Instant,
}

/// A downward collaborator (backend or user-presence signal) failed to
/// produce a response. Folded to [`CtapHidError::InvalidCmd`] at the
/// transport boundary (spec §7 propagation policy) — this crate never
/// inspects why a collaborator failed, only that it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendError;

/// Handles CTAP1 `MSG` payloads. Opaque to this crate: it only knows the
/// byte string it was handed and the byte string to send back.
pub trait ApduBackend {
    /// Writes the response into `response` and returns its length.
    fn handle(&mut self, cid: u32, request: &[u8], response: &mut [u8; MAX_PAYLOAD]) -> Result<u16, BackendError>;
}

/// Handles `CBOR` payloads, when [`Capabilities::CBOR`] is advertised.
pub trait CborBackend {
    fn handle(&mut self, cid: u32, request: &[u8], response: &mut [u8; MAX_PAYLOAD]) -> Result<u16, BackendError>;
}

/// Drives the user-presence indicator for `WINK`.
pub trait WinkSignal {
    /// `duration_ms` is a hint, not a guarantee — hardware that can't time
    /// itself that precisely is free to round up.
    fn wink(&mut self, duration_ms: u16) -> Result<(), BackendError>;
}

/// Result of dispatching one reassembled message.
pub enum DispatchOutcome {
    /// Send `cmd` back to the host; the first `len` bytes of `payload` are
    /// the response body. Copied out of the channel's row before dispatch
    /// tears it down (removed outright for `BROADCAST_CID`, cleared
    /// otherwise) so the caller never reads through a row that's already
    /// gone.
    Respond { cmd: u8, len: u16, payload: [u8; MAX_PAYLOAD] },
    Error(CtapHidError),
}

/// Stateful dispatcher: owns the advertised capability set, device version,
/// and the (at most one) outstanding channel lock.
pub struct CommandDispatcher {
    capabilities: Capabilities,
    version: DeviceVersion,
    lock: Option<Lock>,
}

impl CommandDispatcher {
    /// `WINK` and `LOCK` are mandatory capabilities (spec §6: "byte 16 ...
    /// MUST include WINK and LOCK"), so they're folded into the advertised
    /// byte regardless of what the caller passes. Only `CBOR`/`NMSG` are
    /// actually configuration-dependent.
    pub fn new(capabilities: Capabilities, version: DeviceVersion) -> Self {
        CommandDispatcher {
            capabilities: capabilities.union(Capabilities::WINK).union(Capabilities::LOCK),
            version,
            lock: None,
        }
    }

    /// Releases an expired lock; called once per `periodic_tick`.
    pub fn expire_lock(&mut self, now: Instant) {
        if let Some(lock) = self.lock {
            if now >= lock.expires_at {
                debug!("lock held by {:08x} expired", lock.cid);
                self.lock = None;
            }
        }
    }

    fn lock_blocks(&self, cid: u32) -> bool {
        matches!(self.lock, Some(lock) if lock.cid != cid)
    }

    /// Dispatches the completed message on `cid`. `table[cid]` must be in
    /// `Complete` state (including a transient `BROADCAST_CID` row created
    /// by the reassembler for an in-flight INIT). The row is freed
    /// afterwards: removed outright for `BROADCAST_CID`, reset to `Idle`
    /// otherwise.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch<const N: usize>(
        &mut self,
        table: &mut ChannelTable<N>,
        cid: u32,
        clock: &dyn Clock,
        rng: &mut dyn Random,
        apdu: &mut dyn ApduBackend,
        cbor: Option<&mut dyn CborBackend>,
        wink: &mut dyn WinkSignal,
    ) -> DispatchOutcome {
        let now = clock.now();

        let (cmd, len) = match table.get(cid) {
            Some(row) if row.state == ChannelState::Complete => (row.cmd, row.received_len),
            _ => return DispatchOutcome::Error(CtapHidError::Other),
        };

        if self.lock_blocks(cid) {
            warn!("rejected cmd {:02x} on {:08x}, channel lock held elsewhere", cmd, cid);
            if cid == BROADCAST_CID {
                table.remove(cid);
            } else {
                table.clear(cid);
            }
            return DispatchOutcome::Error(CtapHidError::ChannelBusy);
        }

        debug!("dispatching cmd {:02x} on {:08x}, {} byte payload", cmd, cid, len);

        // (cmd, response_len), with the response bytes already sitting in
        // the row's payload buffer. Resolved to a `DispatchOutcome` only
        // after the response is copied out, below — the row is torn down
        // (removed for BROADCAST_CID, cleared otherwise) as the very last
        // step, never before the caller has its own copy of the bytes.
        let outcome: Result<(u8, u16), CtapHidError> = if cmd == CommandCode::Init.to_byte() {
            if len as usize != NONCE_LEN {
                Err(CtapHidError::InvalidPar)
            } else {
                let nonce = {
                    let row = table.get(cid).unwrap();
                    let mut nonce = [0u8; NONCE_LEN];
                    nonce.copy_from_slice(&row.payload[0..NONCE_LEN]);
                    nonce
                };
                self.handle_init(table, cid, rng, now, &nonce)
            }
        } else if cmd == CommandCode::Ping.to_byte() {
            Ok((cmd, len))
        } else if cmd == CommandCode::Msg.to_byte() {
            if self.capabilities.contains(Capabilities::NMSG) {
                Err(CtapHidError::InvalidCmd)
            } else if (len as usize) < 4 {
                Err(CtapHidError::InvalidPar)
            } else {
                let row = table.get_mut(cid).unwrap();
                let mut request = [0u8; MAX_PAYLOAD];
                request[0..len as usize].copy_from_slice(&row.payload[0..len as usize]);
                let mut response = [0u8; MAX_PAYLOAD];
                match apdu.handle(cid, &request[0..len as usize], &mut response) {
                    Ok(response_len) => {
                        row.payload[0..response_len as usize].copy_from_slice(&response[0..response_len as usize]);
                        Ok((cmd, response_len))
                    }
                    Err(BackendError) => Err(CtapHidError::InvalidCmd),
                }
            }
        } else if cmd == CommandCode::Cbor.to_byte() {
            match (self.capabilities.contains(Capabilities::CBOR), cbor) {
                (true, Some(cbor)) if (len as usize) >= 4 => {
                    let row = table.get_mut(cid).unwrap();
                    let mut request = [0u8; MAX_PAYLOAD];
                    request[0..len as usize].copy_from_slice(&row.payload[0..len as usize]);
                    let mut response = [0u8; MAX_PAYLOAD];
                    match cbor.handle(cid, &request[0..len as usize], &mut response) {
                        Ok(response_len) => {
                            row.payload[0..response_len as usize].copy_from_slice(&response[0..response_len as usize]);
                            Ok((cmd, response_len))
                        }
                        Err(BackendError) => Err(CtapHidError::InvalidCmd),
                    }
                }
                (true, Some(_)) => Err(CtapHidError::InvalidPar),
                _ => Err(CtapHidError::InvalidCmd),
            }
        } else if cmd == CommandCode::Wink.to_byte() {
            if len != 0 {
                Err(CtapHidError::InvalidLen)
            } else {
                match wink.wink(WINK_DURATION_MS) {
                    Ok(()) => Ok((cmd, 0)),
                    Err(BackendError) => Err(CtapHidError::InvalidCmd),
                }
            }
        } else if cmd == CommandCode::Lock.to_byte() {
            if len != 1 {
                Err(CtapHidError::InvalidLen)
            } else {
                let seconds = table.get(cid).unwrap().payload[0];
                if seconds > 10 {
                    Err(CtapHidError::InvalidPar)
                } else {
                    self.lock = if seconds == 0 {
                        None
                    } else {
                        Some(Lock {
                            cid,
                            expires_at: now + millis(seconds as u64 * 1_000),
                        })
                    };
                    Ok((cmd, 0))
                }
            }
        } else if cmd == CommandCode::Sync.to_byte() {
            // Resync: the reassembler already tore down whatever was
            // in-flight on this channel the moment the SYNC frame arrived.
            // The response body is empty; SYNC is an acknowledgement, not
            // an echo.
            Ok((cmd, 0))
        } else {
            Err(CtapHidError::InvalidCmd)
        };

        let result = match outcome {
            Ok((cmd, len)) => {
                let mut payload = [0u8; MAX_PAYLOAD];
                if let Some(row) = table.get(cid) {
                    payload[0..len as usize].copy_from_slice(&row.payload[0..len as usize]);
                }
                DispatchOutcome::Respond { cmd, len, payload }
            }
            Err(code) => {
                warn!("cmd {:02x} on {:08x} rejected with {:02x}", cmd, cid, code.to_byte());
                DispatchOutcome::Error(code)
            }
        };

        if cid == BROADCAST_CID {
            table.remove(cid);
        } else {
            table.clear(cid);
        }
        result
    }

    fn handle_init<const N: usize>(
        &mut self,
        table: &mut ChannelTable<N>,
        cid: u32,
        rng: &mut dyn Random,
        now: Instant,
        nonce: &[u8; NONCE_LEN],
    ) -> Result<(u8, u16), CtapHidError> {
        let assigned_cid = if cid == BROADCAST_CID {
            match self.allocate_cid(table, rng, now) {
                Some(new_cid) => {
                    debug!("assigned new channel {:08x}", new_cid);
                    new_cid
                }
                None => {
                    warn!("broadcast init failed, no free channel slot");
                    return Err(CtapHidError::ChannelBusy);
                }
            }
        } else {
            // INIT on an existing channel resyncs it but keeps its cid.
            cid
        };

        if let Some(row) = table.get_mut(cid) {
            let mut response = [0u8; NONCE_LEN + 4 + 1 + 1 + 1 + 1 + 1];
            response[0..NONCE_LEN].copy_from_slice(nonce);
            // The assigned cid is little-endian in the response payload,
            // unlike the opaque, wire-order cid carried in every frame
            // header (spec §4.4, §6).
            response[NONCE_LEN..NONCE_LEN + 4].copy_from_slice(&assigned_cid.to_le_bytes());
            response[NONCE_LEN + 4] = 2; // USBHID_PROTO_VERSION
            response[NONCE_LEN + 5] = self.version.major;
            response[NONCE_LEN + 6] = self.version.minor;
            response[NONCE_LEN + 7] = self.version.build;
            response[NONCE_LEN + 8] = self.capabilities.to_byte();
            row.payload[0..response.len()].copy_from_slice(&response);
            Ok((CommandCode::Init.to_byte(), response.len() as u16))
        } else {
            Err(CtapHidError::Other)
        }
    }

    /// Generates a fresh, non-reserved, not-already-assigned cid and adds a
    /// row for it. Mirrors
    /// `examples/original_source/ctap_chan.c`'s `ctap_cid_generate`
    /// retry-until-unique loop.
    fn allocate_cid<const N: usize>(&self, table: &mut ChannelTable<N>, rng: &mut dyn Random, now: Instant) -> Option<u32> {
        for _ in 0..64 {
            let candidate = rng.next_u32();
            if candidate != RESERVED_CID && candidate != BROADCAST_CID && !table.exists(candidate) {
                return table.add(candidate, now).ok().map(|_| candidate);
            }
        }
        None
    }
}
