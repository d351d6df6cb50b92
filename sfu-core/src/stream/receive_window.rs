//! Bounded reorder/loss window over received sequence numbers.

/// Half of u16 max value, used for sequence number wraparound detection.
const UINT16_SIZE_HALF: u16 = 1 << 15;

/// What happened to the window when a sequence number was recorded.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SlotUpdate {
    /// First packet of the stream.
    Started,
    /// The highest sequence advanced; the listed sequences were skipped over
    /// and are now missing.
    Advanced { newly_missing: Vec<u16> },
    /// An out-of-order arrival filled a previously missing slot.
    Filled,
    /// The sequence was already marked received.
    Duplicate,
    /// The sequence is too far behind the window to be tracked.
    Stale,
}

/// Tracks received sequence numbers in a circular bitmap.
///
/// The window records which of the most recent `size` sequence numbers have
/// arrived. Gaps created when the highest sequence advances are reported so
/// the owner can schedule NACKs; arrivals that fill a gap are reported so
/// pending NACKs can be cancelled.
pub(crate) struct ReceiveWindow {
    /// Bitmap of received packets. Each u64 tracks 64 sequence numbers.
    packets: Vec<u64>,
    /// Size of the tracking window in packets (power of two, minimum 64).
    size: u16,
    /// Highest sequence number received.
    end: u16,
    /// Whether any packet has been received yet.
    started: bool,
}

impl ReceiveWindow {
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    pub(crate) fn new(size: u16) -> Option<Self> {
        let is_valid = (6..=15).any(|i| size == 1 << i);
        if !is_valid {
            return None;
        }

        Some(Self {
            packets: vec![0u64; (size / 64) as usize],
            size,
            end: 0,
            started: false,
        })
    }

    /// Records a received sequence number.
    pub(crate) fn add(&mut self, seq: u16) -> SlotUpdate {
        if !self.started {
            self.started = true;
            self.set_received(seq);
            self.end = seq;
            return SlotUpdate::Started;
        }

        let diff = seq.wrapping_sub(self.end);
        if diff == 0 {
            return SlotUpdate::Duplicate;
        }

        if diff < UINT16_SIZE_HALF {
            // The highest sequence advances. Slots in between may hold stale
            // window data; clear them and report them missing.
            let gap = (diff - 1).min(self.size);
            let mut newly_missing = Vec::with_capacity(gap as usize);
            let mut i = self.end.wrapping_add(1);
            while i != seq {
                self.del_received(i);
                // Only sequences still inside the window are worth a NACK.
                if seq.wrapping_sub(i) <= self.size {
                    newly_missing.push(i);
                }
                i = i.wrapping_add(1);
            }
            self.end = seq;
            self.set_received(seq);
            return SlotUpdate::Advanced { newly_missing };
        }

        // Behind the highest sequence.
        if self.end.wrapping_sub(seq) >= self.size {
            return SlotUpdate::Stale;
        }
        if self.get_received(seq) {
            return SlotUpdate::Duplicate;
        }
        self.set_received(seq);
        SlotUpdate::Filled
    }

    /// Whether `seq` is marked received. Sequences outside the window report
    /// `false`.
    pub(crate) fn received(&self, seq: u16) -> bool {
        if !self.started {
            return false;
        }
        let diff = self.end.wrapping_sub(seq);
        if diff >= UINT16_SIZE_HALF || diff >= self.size {
            return false;
        }
        self.get_received(seq)
    }

    pub(crate) fn end(&self) -> u16 {
        self.end
    }

    fn set_received(&mut self, seq: u16) {
        let pos = seq % self.size;
        self.packets[(pos / 64) as usize] |= 1 << (pos % 64);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = seq % self.size;
        self.packets[(pos / 64) as usize] &= !(1u64 << (pos % 64));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = seq % self.size;
        (self.packets[(pos / 64) as usize] & (1 << (pos % 64))) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sizes() {
        assert!(ReceiveWindow::new(0).is_none());
        assert!(ReceiveWindow::new(32).is_none());
        assert!(ReceiveWindow::new(100).is_none());
        assert!(ReceiveWindow::new(2048).is_some());
    }

    #[test]
    fn test_in_order_stream() {
        let mut window = ReceiveWindow::new(128).unwrap();

        assert_eq!(window.add(10), SlotUpdate::Started);
        for seq in 11..20 {
            assert_eq!(window.add(seq), SlotUpdate::Advanced { newly_missing: vec![] });
            assert!(window.received(seq));
        }
        assert_eq!(window.end(), 19);
    }

    #[test]
    fn test_gap_reports_missing() {
        let mut window = ReceiveWindow::new(128).unwrap();

        window.add(10);
        assert_eq!(
            window.add(14),
            SlotUpdate::Advanced {
                newly_missing: vec![11, 12, 13]
            }
        );
        assert!(!window.received(12));
    }

    #[test]
    fn test_fill_gap() {
        let mut window = ReceiveWindow::new(128).unwrap();

        window.add(10);
        window.add(13);
        assert_eq!(window.add(11), SlotUpdate::Filled);
        assert!(window.received(11));
        assert_eq!(window.add(11), SlotUpdate::Duplicate);
    }

    #[test]
    fn test_duplicate_of_end() {
        let mut window = ReceiveWindow::new(128).unwrap();

        window.add(10);
        assert_eq!(window.add(10), SlotUpdate::Duplicate);
    }

    #[test]
    fn test_stale_sequence() {
        let mut window = ReceiveWindow::new(64).unwrap();

        window.add(1000);
        assert_eq!(window.add(1000 - 64), SlotUpdate::Stale);
    }

    #[test]
    fn test_wraparound() {
        let mut window = ReceiveWindow::new(128).unwrap();

        window.add(65534);
        assert_eq!(window.add(65535), SlotUpdate::Advanced { newly_missing: vec![] });
        assert_eq!(
            window.add(1),
            SlotUpdate::Advanced {
                newly_missing: vec![0]
            }
        );
        assert!(window.received(65534));
        assert!(window.received(1));
        assert!(!window.received(0));
        assert_eq!(window.add(0), SlotUpdate::Filled);
    }

    #[test]
    fn test_large_jump_reports_window_only() {
        let mut window = ReceiveWindow::new(64).unwrap();

        window.add(0);
        let update = window.add(1000);
        match update {
            SlotUpdate::Advanced { newly_missing } => {
                // Only sequences inside the window are reported.
                assert_eq!(newly_missing.len(), 64);
                assert_eq!(*newly_missing.first().unwrap(), 1000 - 64);
                assert_eq!(*newly_missing.last().unwrap(), 999);
            }
            other => panic!("unexpected update: {other:?}"),
        }
        // Old data fell out of the window.
        assert!(!window.received(0));
    }
}
