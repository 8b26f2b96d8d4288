//! The downward USB HID collaborator (spec §2, §5, §6) and the static
//! report descriptor the embedder registers with its USB HID class driver.
//!
//! `not-webusb` wires this straight into `usbd-human-interface-device`; this
//! crate treats USB enumeration as out of scope (see SPEC_FULL.md's
//! Non-goals) and instead asks the embedder for raw 64-byte reports through
//! a trait, the same shape as the `Clock`/`Random` collaborators.

use crate::frame::RawReport;

/// Raw HID I/O, supplied by the embedder. One report in, one report out;
/// no framing knowledge lives here.
pub trait HidTransport {
    /// Returns the next report the host has sent, if one is queued.
    /// Non-blocking: `None` means "nothing to do this tick".
    fn recv_report(&mut self) -> Option<RawReport>;

    /// Queues one report for transmission to the host. Returns `false` if
    /// the transport's outbound buffer is full and the caller should retry
    /// next tick instead of dropping the report.
    fn send_report(&mut self, report: &RawReport) -> bool;

    /// Called once the last report of a response (or error) has been
    /// handed to [`HidTransport::send_report`]. Most embedders have
    /// nothing to do here; the hook exists for transports that batch or
    /// flush writes only at message boundaries.
    fn response_done(&mut self) {}
}

/// The HID report descriptor for a CTAPHID interface (spec §6): vendor
/// usage page `0xF1D0`, usage `0x01`, one 64-byte INPUT report (usage
/// `0x20`) and one 64-byte OUTPUT report (usage `0x21`), logical range
/// 0..=255, 8-bit fields, 64 of them per report. Verbatim from the FIDO
/// HID binding, not something this crate derives.
#[rustfmt::skip]
pub const REPORT_DESCRIPTOR: [u8; 34] = [
    0x06, 0xD0, 0xF1, // Usage Page (FIDO Alliance)
    0x09, 0x01,       // Usage (CTAPHID)
    0xA1, 0x01,       // Collection (Application)
    0x09, 0x20,       //   Usage (Input Report Data)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x40,       //   Report Count (64)
    0x81, 0x02,       //   Input (Data, Var, Abs)
    0x09, 0x21,       //   Usage (Output Report Data)
    0x15, 0x00,       //   Logical Minimum (0)
    0x26, 0xFF, 0x00, //   Logical Maximum (255)
    0x75, 0x08,       //   Report Size (8)
    0x95, 0x40,       //   Report Count (64)
    0x91, 0x02,       //   Output (Data, Var, Abs)
    0xC0,             // End Collection
];


#[cfg(test)]
mod tests {
    use super::test_support::FakeHid;
    use super::*;

    #[test]
    fn fake_hid_round_trips_a_report() {
        let mut hid = FakeHid::new();
        let report: RawReport = [0xAB; 64];
        hid.host_sends(report);
        assert_eq!(hid.recv_report(), Some(report));
        assert!(hid.send_report(&report));
        assert_eq!(hid.outbox.pop_front(), Some(report));
    }

    #[test]
    fn descriptor_declares_two_64_byte_reports() {
        assert_eq!(REPORT_DESCRIPTOR[17], 0x40);
        assert_eq!(REPORT_DESCRIPTOR[30], 0x40);
    }
}
