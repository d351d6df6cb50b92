//! Ring of recently sent RTP packets retained for retransmission.

use std::time::Instant;

/// Half of u16 max value, used for sequence number wraparound detection.
const UINT16_SIZE_HALF: u16 = 1 << 15;

/// Maximum ring capacity.
const MAX_SIZE: u16 = 32768;

/// One retained packet plus its retransmission bookkeeping.
#[derive(Debug)]
pub(crate) struct StoredPacket {
    pub(crate) packet: rtp::packet::Packet,
    /// Last time this packet was resent.
    pub(crate) resent_at: Option<Instant>,
    /// Number of times this packet was resent.
    pub(crate) sent_times: u8,
}

/// Circular buffer of sent packets indexed by sequence number.
///
/// The capacity does not have to be a power of two; the stored sequence
/// number is checked on every lookup, so slot collisions around the 16-bit
/// wrap simply miss instead of returning the wrong packet.
pub(crate) struct SendBuffer {
    slots: Vec<Option<StoredPacket>>,
    size: u16,
    /// Highest sequence number added.
    highest_added: u16,
    /// Whether any packet has been added yet.
    started: bool,
}

impl SendBuffer {
    /// `size` must be between 1 and 32768 (inclusive).
    pub(crate) fn new(size: u16) -> Option<Self> {
        if size == 0 || size > MAX_SIZE {
            return None;
        }

        let mut slots = Vec::new();
        slots.resize_with(size as usize, || None);

        Some(Self {
            slots,
            size,
            highest_added: 0,
            started: false,
        })
    }

    /// Stores a sent packet, overwriting the slot it maps to.
    pub(crate) fn add(&mut self, packet: rtp::packet::Packet) {
        let seq = packet.header.sequence_number;
        let stored = StoredPacket {
            packet,
            resent_at: None,
            sent_times: 0,
        };

        if !self.started {
            self.slots[(seq % self.size) as usize] = Some(stored);
            self.highest_added = seq;
            self.started = true;
            return;
        }

        let diff = seq.wrapping_sub(self.highest_added);
        if diff == 0 {
            // Duplicate, ignore.
            return;
        } else if diff < UINT16_SIZE_HALF {
            // Clear the slots skipped over between highest_added and seq.
            let gap = (diff - 1).min(self.size);
            let mut i = seq.wrapping_sub(gap);
            while i != seq {
                let idx = (i % self.size) as usize;
                self.slots[idx] = None;
                i = i.wrapping_add(1);
            }
            self.highest_added = seq;
        }
        // Out-of-order packets are stored without updating highest_added.

        let idx = (seq % self.size) as usize;
        self.slots[idx] = Some(stored);
    }

    /// Looks up a packet by sequence number.
    ///
    /// Returns `None` if the packet is too old, was never stored, or its slot
    /// has since been reused.
    pub(crate) fn get_mut(&mut self, seq: u16) -> Option<&mut StoredPacket> {
        if !self.started {
            return None;
        }

        let diff = self.highest_added.wrapping_sub(seq);
        if diff >= UINT16_SIZE_HALF {
            // seq is ahead of highest_added.
            return None;
        }
        if diff >= self.size {
            // Too old, outside the ring.
            return None;
        }

        let idx = (seq % self.size) as usize;
        let stored = self.slots[idx].as_mut()?;
        if stored.packet.header.sequence_number != seq {
            return None;
        }

        Some(stored)
    }

    /// Discards every retained packet.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.started = false;
        self.highest_added = 0;
    }
}
