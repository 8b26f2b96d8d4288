//! The channel table (spec §3, §4.1): a fixed-capacity set of concurrently
//! open logical conversations between host and authenticator, keyed by cid.
//!
//! Generalizes the teacher's single `InProgressMessage` (which only ever
//! tracked one cid, since `not-webusb` doesn't multiplex channels) into a
//! proper table, the way `examples/original_source/ctap_chan.c`'s
//! `chan_ctx_t chans[MAX_CIDS]` does.

use heapless::Vec;

use crate::constants::{DEFAULT_MAX_CHANNELS, MAX_PAYLOAD, RESERVED_CID};
use crate::time::Instant;

/// A channel's reassembly state (spec §3 `state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelState {
    Idle,
    InProgress,
    Complete,
}

/// One row of the channel table (spec §3 `Channel`).
#[derive(Debug, Clone, Copy)]
pub struct Channel {
    pub cid: u32,
    pub in_use: bool,
    pub last_activity: Instant,
    pub state: ChannelState,
    /// Command byte of the in-progress message, high bit already stripped.
    /// Only meaningful when `state != Idle`.
    pub cmd: u8,
    pub expected_len: u16,
    pub received_len: u16,
    pub next_seq: u8,
    pub payload: [u8; MAX_PAYLOAD],
}

impl Channel {
    const fn empty() -> Self {
        Channel {
            cid: RESERVED_CID,
            in_use: false,
            last_activity: Instant::from_ticks(0),
            state: ChannelState::Idle,
            cmd: 0,
            expected_len: 0,
            received_len: 0,
            next_seq: 0,
            payload: [0u8; MAX_PAYLOAD],
        }
    }

    pub(crate) fn reset_counters(&mut self) {
        self.state = ChannelState::Idle;
        self.cmd = 0;
        self.expected_len = 0;
        self.received_len = 0;
        self.next_seq = 0;
    }

    /// Remaining, not-yet-received bytes of the in-progress message.
    pub fn remaining(&self) -> u16 {
        self.expected_len - self.received_len
    }
}

/// Reason [`ChannelTable::add`] couldn't produce a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NoSlot;

/// The fixed-capacity channel table (spec §4.1).
///
/// `N` is the table's capacity (spec's `MAX_CHANNELS`); see DESIGN.md for why
/// the default is 8.
pub struct ChannelTable<const N: usize = DEFAULT_MAX_CHANNELS> {
    rows: Vec<Channel, N>,
}

impl<const N: usize> ChannelTable<N> {
    pub fn new() -> Self {
        let mut rows = Vec::new();
        for _ in 0..N {
            // Capacity is exactly N, so this can never fail.
            let _ = rows.push(Channel::empty());
        }
        ChannelTable { rows }
    }

    fn find_index(&self, cid: u32) -> Option<usize> {
        self.rows.iter().position(|row| row.in_use && row.cid == cid)
    }

    pub fn exists(&self, cid: u32) -> bool {
        self.find_index(cid).is_some()
    }

    pub fn get(&self, cid: u32) -> Option<&Channel> {
        self.find_index(cid).map(|i| &self.rows[i])
    }

    pub fn get_mut(&mut self, cid: u32) -> Option<&mut Channel> {
        self.find_index(cid).map(move |i| &mut self.rows[i])
    }

    /// Allocates a row for `cid`, evicting the oldest row if the table is
    /// full (spec §4.1: "a busy host should not be able to permanently deny
    /// new INITs by leaving stale cids").
    pub fn add(&mut self, cid: u32, now: Instant) -> Result<(), NoSlot> {
        let index = match self.rows.iter().position(|row| !row.in_use) {
            Some(index) => index,
            None => {
                let index = self.oldest_index().ok_or(NoSlot)?;
                let evicted = self.rows[index].cid;
                warn!("channel table full, evicted {:08x} to admit {:08x}", evicted, cid);
                index
            }
        };
        let row = &mut self.rows[index];
        *row = Channel::empty();
        row.in_use = true;
        row.cid = cid;
        row.last_activity = now;
        debug!("channel {:08x} allocated", cid);
        Ok(())
    }

    /// Index of the row with the smallest `last_activity`, ties broken by
    /// lowest index. `None` only if `N == 0`.
    fn oldest_index(&self) -> Option<usize> {
        self.rows
            .iter()
            .enumerate()
            .min_by_key(|(_, row)| row.last_activity)
            .map(|(index, _)| index)
    }

    pub fn refresh(&mut self, cid: u32, now: Instant) -> Result<(), NotFound> {
        let row = self.get_mut(cid).ok_or(NotFound)?;
        row.last_activity = now;
        Ok(())
    }

    /// Resets the row to `Idle` and zeroes its reassembly counters; the row
    /// stays allocated.
    pub fn clear(&mut self, cid: u32) {
        if let Some(row) = self.get_mut(cid) {
            row.reset_counters();
        }
    }

    /// Frees the row outright, regardless of its state.
    pub fn remove(&mut self, cid: u32) {
        if let Some(row) = self.get_mut(cid) {
            row.in_use = false;
        }
    }

    /// Frees every row whose inactivity window has elapsed, regardless of
    /// state (spec §4.1 `periodic_cleanup`).
    pub fn periodic_cleanup(&mut self, now: Instant, idle_lifetime: crate::time::Duration) {
        for row in self.rows.iter_mut() {
            if row.in_use {
                if let Some(elapsed) = now.checked_duration_since(row.last_activity) {
                    if elapsed > idle_lifetime {
                        info!("channel {:08x} evicted, idle for {}ms", row.cid, elapsed.ticks());
                        row.in_use = false;
                    }
                }
            }
        }
    }

    pub fn find_in_progress(&mut self) -> Option<&mut Channel> {
        self.rows
            .iter_mut()
            .find(|row| row.in_use && row.state == ChannelState::InProgress)
    }

    pub fn find_complete(&mut self) -> Option<&mut Channel> {
        self.rows
            .iter_mut()
            .find(|row| row.in_use && row.state == ChannelState::Complete)
    }

    /// Debug-time assertion of invariant I2: at most one channel is
    /// `InProgress` at any instant.
    pub fn sanity_in_progress_unique(&self) -> bool {
        self.rows
            .iter()
            .filter(|row| row.in_use && row.state == ChannelState::InProgress)
            .count()
            <= 1
    }
}

impl<const N: usize> Default for ChannelTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by [`ChannelTable::refresh`] when the cid has no row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotFound;
