//! Wrapping packet/octet counters with a sliding-window bitrate estimate.

use std::time::{Duration, Instant};

/// Width of the rate window.
const WINDOW: Duration = Duration::from_millis(1000);
/// Number of slots the window is divided into.
const SLOTS: usize = 10;
/// Width of one slot.
const SLOT: Duration = Duration::from_millis(100);

/// Counts RTP packets and payload octets for one direction of one stream.
///
/// The packet and octet counters wrap at 32 bits, matching the fields of an
/// RTCP Sender Report. The bitrate is estimated over a one-second sliding
/// window.
#[derive(Debug, Default)]
pub struct RtpDataCounter {
    packets: u32,
    octets: u32,
    rate: RateCalculator,
}

impl RtpDataCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, now: Instant, payload_len: usize) {
        self.packets = self.packets.wrapping_add(1);
        self.octets = self.octets.wrapping_add(payload_len as u32);
        self.rate.update(now, payload_len as u32);
    }

    pub fn packet_count(&self) -> u32 {
        self.packets
    }

    pub fn octet_count(&self) -> u32 {
        self.octets
    }

    /// Bits per second over the last second.
    pub fn bitrate(&mut self, now: Instant) -> u32 {
        self.rate.rate(now)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Byte-rate estimator over a fixed window of fixed-width slots.
#[derive(Debug)]
struct RateCalculator {
    slots: [u32; SLOTS],
    head: usize,
    head_start: Option<Instant>,
    total: u32,
}

impl Default for RateCalculator {
    fn default() -> Self {
        Self {
            slots: [0; SLOTS],
            head: 0,
            head_start: None,
            total: 0,
        }
    }
}

impl RateCalculator {
    fn update(&mut self, now: Instant, bytes: u32) {
        self.roll(now);
        self.slots[self.head] = self.slots[self.head].saturating_add(bytes);
        self.total = self.total.saturating_add(bytes);
    }

    fn rate(&mut self, now: Instant) -> u32 {
        self.roll(now);
        let window_secs = WINDOW.as_secs_f64();
        ((self.total as f64) * 8.0 / window_secs) as u32
    }

    /// Advances the head slot until it covers `now`, expiring old slots.
    fn roll(&mut self, now: Instant) {
        let Some(start) = self.head_start else {
            self.head_start = Some(now);
            return;
        };

        let mut elapsed = now.saturating_duration_since(start);
        if elapsed >= WINDOW {
            // The whole window expired at once.
            self.slots = [0; SLOTS];
            self.total = 0;
            self.head_start = Some(now);
            return;
        }

        let mut start = start;
        while elapsed >= SLOT {
            self.head = (self.head + 1) % SLOTS;
            self.total -= self.slots[self.head];
            self.slots[self.head] = 0;
            start += SLOT;
            elapsed -= SLOT;
        }
        self.head_start = Some(start);
    }
}
