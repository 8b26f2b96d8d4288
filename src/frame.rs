//! Wire framing: the 64-byte INIT/CONT report shapes of spec §3, and their
//! encode/decode. Generalizes the teacher's `ctaphid.rs`, which hand-rolled
//! the same byte slicing with `copy_from_slice`/`to_be_bytes`; here the fixed
//! 7- and 5-byte headers are `packed_struct`s instead, so the header layout
//! is declared once as data rather than twice as matching encode/decode code.

use packed_struct::prelude::*;

use crate::constants::{CMD_BIT, CONT_HDR_LEN, CONT_DATA_LEN, FRAME_LEN, INIT_DATA_LEN, INIT_HDR_LEN};

/// A raw 64-byte HID report, exactly as handed over by the USB HID
/// collaborator in either direction.
pub type RawReport = [u8; FRAME_LEN];

#[derive(PackedStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[packed_struct(endian = "msb")]
struct InitHeader {
    cid: u32,
    cmd: u8,
    bcnt: u16,
}

#[derive(PackedStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[packed_struct(endian = "msb")]
struct ContHeader {
    cid: u32,
    seq: u8,
}

/// A frame, decoded just far enough to route it: which cid it's addressed
/// to, whether it starts a message or continues one, and a borrowed view of
/// its payload bytes (still padded to the frame's data capacity — the caller
/// trims to the declared/remaining length).
#[derive(Debug, Clone, Copy)]
pub enum ParsedFrame<'a> {
    Init {
        cid: u32,
        /// Command byte with the high bit already stripped.
        cmd: u8,
        bcnt: u16,
        data: &'a [u8; INIT_DATA_LEN],
    },
    Cont {
        cid: u32,
        seq: u8,
        data: &'a [u8; CONT_DATA_LEN],
    },
}

impl<'a> ParsedFrame<'a> {
    pub fn cid(&self) -> u32 {
        match self {
            ParsedFrame::Init { cid, .. } => *cid,
            ParsedFrame::Cont { cid, .. } => *cid,
        }
    }
}

/// Parses a raw 64-byte report into an [`ParsedFrame`], per spec §4.2 steps
/// 1–3. This never fails: any 64-byte report is a syntactically valid INIT
/// or CONT frame, the semantic checks (unknown cid, bad cmd, ...) happen in
/// `Reassembler::feed`.
pub fn parse(report: &RawReport) -> ParsedFrame<'_> {
    let is_init = report[4] & CMD_BIT != 0;
    if is_init {
        let header_bytes: [u8; INIT_HDR_LEN] = report[0..INIT_HDR_LEN].try_into().unwrap();
        let header = InitHeader::unpack(&header_bytes).expect("fixed-width header unpack is infallible");
        let data: &[u8; INIT_DATA_LEN] = report[INIT_HDR_LEN..].try_into().unwrap();
        ParsedFrame::Init {
            cid: header.cid,
            cmd: header.cmd & !CMD_BIT,
            bcnt: header.bcnt,
            data,
        }
    } else {
        let header_bytes: [u8; CONT_HDR_LEN] = report[0..CONT_HDR_LEN].try_into().unwrap();
        let header = ContHeader::unpack(&header_bytes).expect("fixed-width header unpack is infallible");
        let data: &[u8; CONT_DATA_LEN] = report[CONT_HDR_LEN..].try_into().unwrap();
        ParsedFrame::Cont {
            cid: header.cid,
            seq: header.seq,
            data,
        }
    }
}

/// Encodes one outbound INIT frame: `cid | cmd|CMD_BIT | bcnt | data`,
/// zero-padded to 64 bytes. `data.len()` must be `<= INIT_DATA_LEN`.
pub fn encode_init(cid: u32, cmd: u8, bcnt: u16, data: &[u8]) -> RawReport {
    debug_assert!(data.len() <= INIT_DATA_LEN);
    let header = InitHeader {
        cid,
        cmd: cmd | CMD_BIT,
        bcnt,
    }
    .pack()
    .expect("fixed-width header pack is infallible");

    let mut report = [0u8; FRAME_LEN];
    report[0..INIT_HDR_LEN].copy_from_slice(&header);
    report[INIT_HDR_LEN..INIT_HDR_LEN + data.len()].copy_from_slice(data);
    report
}

/// Encodes one outbound CONT frame: `cid | seq | data`, zero-padded to 64
/// bytes. `data.len()` must be `<= CONT_DATA_LEN` and `seq <= MAX_SEQ`.
pub fn encode_cont(cid: u32, seq: u8, data: &[u8]) -> RawReport {
    debug_assert!(data.len() <= CONT_DATA_LEN);
    debug_assert!(seq & CMD_BIT == 0);
    let header = ContHeader { cid, seq }.pack().expect("fixed-width header pack is infallible");

    let mut report = [0u8; FRAME_LEN];
    report[0..CONT_HDR_LEN].copy_from_slice(&header);
    report[CONT_HDR_LEN..CONT_HDR_LEN + data.len()].copy_from_slice(data);
    report
}

/// CTAPHID control-command codes (spec §4.4, GLOSSARY). Values per
/// `examples/original_source/ctap_protocol.h`'s `ctaphid_cmd_id_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CommandCode {
    Ping = 0x01,
    Msg = 0x03,
    Lock = 0x04,
    Init = 0x06,
    Wink = 0x08,
    Cbor = 0x10,
    Sync = 0x3C,
    Error = 0x3F,
}

impl CommandCode {
    pub const fn to_byte(self) -> u8 {
        self as u8
    }
}
