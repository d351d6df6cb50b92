//! Inbound stream state: reorder window, loss accounting, NACK scheduling
//! and Receiver Report generation.

use super::counter::RtpDataCounter;
use super::receive_window::{ReceiveWindow, SlotUpdate};
use super::{RtpStream, RtpStreamParams};
use log::debug;
use rtcp::receiver_report::ReceiverReport;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// NACK generation tuning. The thresholds are deliberately configuration:
/// how long a gap must persist before the first NACK, and how old a gap may
/// become before a retransmission would no longer be useful.
#[derive(Debug, Clone)]
pub struct NackConfig {
    /// Gap age before the first NACK is sent.
    pub delay: Duration,
    /// Minimum interval between NACKs for the same sequence.
    pub retry_interval: Duration,
    /// Gap age beyond which the sequence is given up on.
    pub horizon: Duration,
    /// Maximum NACKs sent per missing sequence.
    pub max_retries: u8,
    /// Size of the reorder window in packets (power of two).
    pub window_size: u16,
}

impl Default for NackConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(20),
            retry_interval: Duration::from_millis(100),
            horizon: Duration::from_millis(1000),
            max_retries: 8,
            window_size: 2048,
        }
    }
}

#[derive(Debug)]
struct NackItem {
    missing_since: Instant,
    retries: u8,
    last_nacked_at: Option<Instant>,
}

/// Tracks one inbound SSRC.
pub struct RtpStreamRecv {
    stream: RtpStream,
    window: ReceiveWindow,
    nack_config: NackConfig,
    pending_nacks: BTreeMap<u16, NackItem>,

    /// SSRC this receiver reports as.
    receiver_ssrc: u32,
    max_rtcp_interval: Duration,

    received: RtpDataCounter,
    rtx_received: RtpDataCounter,
    packets_discarded: u64,
    packets_duplicated: u64,

    /// RFC 3550 interarrival jitter, in clock-rate units.
    jitter: f64,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,

    /// 16-bit sequence wrap epochs observed.
    cycles: u16,
    last_report_seq: u16,
    total_lost: u32,

    /// Middle 32 bits of the NTP timestamp of the most recent Sender Report.
    last_sr_ntp: u32,
    last_sr_time: Option<Instant>,
    last_rr_sent: Option<Instant>,

    health_flip: Option<bool>,
}

impl RtpStreamRecv {
    pub fn new(params: RtpStreamParams, max_rtcp_interval: Duration, nack: NackConfig) -> Self {
        let window = ReceiveWindow::new(nack.window_size)
            .unwrap_or_else(|| ReceiveWindow::new(2048).expect("valid default window size"));

        Self {
            stream: RtpStream::new(params),
            window,
            nack_config: nack,
            pending_nacks: BTreeMap::new(),
            receiver_ssrc: rand::random::<u32>(),
            max_rtcp_interval,
            received: RtpDataCounter::new(),
            rtx_received: RtpDataCounter::new(),
            packets_discarded: 0,
            packets_duplicated: 0,
            jitter: 0.0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            cycles: 0,
            last_report_seq: 0,
            total_lost: 0,
            last_sr_ntp: 0,
            last_sr_time: None,
            last_rr_sent: None,
            health_flip: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.stream.params.ssrc
    }

    pub fn params(&self) -> &RtpStreamParams {
        &self.stream.params
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.is_healthy()
    }

    /// Processes a received media packet. Returns `false` when the packet is
    /// a duplicate or falls outside the reorder window.
    pub fn receive_packet(&mut self, now: Instant, packet: &rtp::packet::Packet) -> bool {
        let seq = packet.header.sequence_number;
        let prev_end = self.window.end();

        match self.window.add(seq) {
            SlotUpdate::Started => {
                self.last_report_seq = seq.wrapping_sub(1);
            }
            SlotUpdate::Advanced { newly_missing } => {
                // Wrap of the 16-bit sequence space.
                if seq < prev_end {
                    self.cycles = self.cycles.wrapping_add(1);
                }
                if self.stream.params.use_nack {
                    for missing in newly_missing {
                        self.pending_nacks.insert(
                            missing,
                            NackItem {
                                missing_since: now,
                                retries: 0,
                                last_nacked_at: None,
                            },
                        );
                    }
                }
            }
            SlotUpdate::Filled => {
                self.pending_nacks.remove(&seq);
            }
            SlotUpdate::Duplicate => {
                self.packets_duplicated += 1;
                return false;
            }
            SlotUpdate::Stale => {
                debug!(
                    "packet out of reorder window [ssrc:{}, seq:{}]",
                    self.stream.params.ssrc, seq
                );
                self.packets_discarded += 1;
                return false;
            }
        }

        // Interarrival jitter, RFC 3550 page 39.
        if let Some(last_time) = self.last_rtp_time_time {
            let clock_rate = self.stream.params.clock_rate as f64;
            let d = now.duration_since(last_time).as_secs_f64() * clock_rate
                - (packet.header.timestamp as f64 - self.last_rtp_time_rtp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }
        self.last_rtp_time_rtp = packet.header.timestamp;
        self.last_rtp_time_time = Some(now);

        self.received.update(now, packet.payload.len());
        self.stream.last_activity = Some(now);
        true
    }

    /// Unwraps an RFC 4588 retransmission arriving on the RTX SSRC and feeds
    /// the recovered packet into the stream.
    pub fn receive_rtx_packet(&mut self, now: Instant, packet: &mut rtp::packet::Packet) -> bool {
        if self.stream.params.rtx_ssrc != Some(packet.header.ssrc)
            || self.stream.params.rtx_payload_type != Some(packet.header.payload_type)
        {
            self.packets_discarded += 1;
            return false;
        }

        if packet.payload.len() < 2 {
            // Padding-only RTX probe.
            self.packets_discarded += 1;
            return false;
        }

        let original_seq = u16::from_be_bytes([packet.payload[0], packet.payload[1]]);
        packet.header.ssrc = self.stream.params.ssrc;
        packet.header.payload_type = self.stream.params.payload_type;
        packet.header.sequence_number = original_seq;
        packet.payload = packet.payload.slice(2..);

        self.rtx_received.update(now, packet.payload.len());
        self.receive_packet(now, packet)
    }

    /// Collects the NACK feedback due at `now`, if any.
    pub fn get_nacks(&mut self, now: Instant) -> Option<TransportLayerNack> {
        if !self.stream.params.use_nack || self.pending_nacks.is_empty() {
            return None;
        }

        let config = &self.nack_config;
        let mut due: Vec<u16> = Vec::new();
        let mut expired: Vec<u16> = Vec::new();

        for (&seq, item) in self.pending_nacks.iter_mut() {
            let age = now.saturating_duration_since(item.missing_since);
            if age >= config.horizon || item.retries >= config.max_retries {
                expired.push(seq);
                continue;
            }
            if age < config.delay {
                continue;
            }
            let rearmed = match item.last_nacked_at {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= config.retry_interval,
            };
            if rearmed {
                item.retries += 1;
                item.last_nacked_at = Some(now);
                due.push(seq);
            }
        }

        for seq in expired {
            self.pending_nacks.remove(&seq);
        }

        if due.is_empty() {
            return None;
        }

        Some(TransportLayerNack {
            sender_ssrc: self.receiver_ssrc,
            media_ssrc: self.stream.params.ssrc,
            nacks: nack_pairs_from_sequence_numbers(&due),
        })
    }

    /// Records an inbound Sender Report from the source.
    pub fn receive_sender_report(&mut self, now: Instant, sr: &SenderReport) {
        self.last_sr_ntp = (sr.ntp_time >> 16) as u32;
        self.last_sr_time = Some(now);
    }

    /// Generates a Receiver Report when the RTCP interval has elapsed.
    pub fn get_receiver_report(&mut self, now: Instant) -> Option<ReceiverReport> {
        if let Some(last) = self.last_rr_sent {
            let elapsed = now.saturating_duration_since(last);
            if elapsed.as_secs_f64() * 1.15 < self.max_rtcp_interval.as_secs_f64() {
                return None;
            }
        }
        // Nothing received yet, nothing to report on.
        self.last_rtp_time_time?;

        let end = self.window.end();
        let total_since_report = end.wrapping_sub(self.last_report_seq);
        let mut lost_since_report: u32 = 0;
        if total_since_report != 0 {
            let mut i = self.last_report_seq.wrapping_add(1);
            while i != end {
                if !self.window.received(i) {
                    lost_since_report += 1;
                }
                i = i.wrapping_add(1);
            }
        }

        self.total_lost = self.total_lost.saturating_add(lost_since_report);
        // Both fields allow up to 24 bits.
        let lost_since_report = lost_since_report.min(0xFFFFFF);
        if self.total_lost > 0xFFFFFF {
            self.total_lost = 0xFFFFFF;
        }

        let delay = match self.last_sr_time {
            Some(sr_time) => (now.duration_since(sr_time).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            ((lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        if let Some(flip) = self.stream.push_loss_sample(fraction_lost) {
            self.health_flip = Some(flip);
        }

        let report = ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![ReceptionReport {
                ssrc: self.stream.params.ssrc,
                last_sequence_number: (u32::from(self.cycles) << 16) | u32::from(end),
                last_sender_report: self.last_sr_ntp,
                fraction_lost,
                total_lost: self.total_lost,
                delay,
                jitter: self.jitter as u32,
            }],
            ..Default::default()
        };

        self.last_report_seq = end;
        self.last_rr_sent = Some(now);

        Some(report)
    }

    /// Returns and clears the latest health transition, if one happened.
    pub fn take_health_flip(&mut self) -> Option<bool> {
        self.health_flip.take()
    }

    pub fn stats(&mut self, now: Instant) -> serde_json::Value {
        serde_json::json!({
            "ssrc": self.stream.params.ssrc,
            "mimeType": self.stream.params.mime_type,
            "packetCount": self.received.packet_count(),
            "octetCount": self.received.octet_count(),
            "bitrate": self.received.bitrate(now),
            "rtxPacketCount": self.rtx_received.packet_count(),
            "packetsDiscarded": self.packets_discarded,
            "packetsDuplicated": self.packets_duplicated,
            "packetsLost": self.total_lost,
            "jitter": self.jitter as u32,
            "score": self.stream.score(),
            "healthy": self.stream.is_healthy(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RtpStreamParams {
        RtpStreamParams {
            ssrc: 1000,
            payload_type: 96,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            use_nack: true,
            use_pli: true,
            rtx_payload_type: Some(97),
            rtx_ssrc: Some(1001),
        }
    }

    fn make_stream() -> RtpStreamRecv {
        RtpStreamRecv::new(params(), super::super::RTCP_MAX_VIDEO_INTERVAL, NackConfig::default())
    }

    fn make_packet(seq: u16, timestamp: u32) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 1000,
                payload_type: 96,
                sequence_number: seq,
                timestamp,
                ..Default::default()
            },
            payload: vec![0u8; 100].into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_report_after_clean_run() {
        let mut stream = make_stream();
        let now = Instant::now();

        for i in 0..10u16 {
            assert!(stream.receive_packet(now, &make_packet(i, 0)));
        }

        let rr = stream.get_receiver_report(now).unwrap();
        assert_eq!(rr.reports.len(), 1);
        assert_eq!(rr.reports[0].ssrc, 1000);
        assert_eq!(rr.reports[0].last_sequence_number, 9);
        assert_eq!(rr.reports[0].fraction_lost, 0);
        assert_eq!(rr.reports[0].total_lost, 0);
    }

    #[test]
    fn test_report_counts_loss() {
        let mut stream = make_stream();
        let now = Instant::now();

        stream.receive_packet(now, &make_packet(1, 0));
        stream.receive_packet(now, &make_packet(3, 0));

        let rr = stream.get_receiver_report(now).unwrap();
        assert_eq!(rr.reports[0].total_lost, 1);
        assert_eq!(rr.reports[0].fraction_lost, (256u32 / 3) as u8);
    }

    #[test]
    fn test_report_cycles_on_wrap() {
        let mut stream = make_stream();
        let now = Instant::now();

        stream.receive_packet(now, &make_packet(0xffff, 0));
        stream.receive_packet(now, &make_packet(0x00, 0));
        // Out-of-order packet behind the wrap.
        stream.receive_packet(now, &make_packet(0xfffe, 0));

        let rr = stream.get_receiver_report(now).unwrap();
        assert_eq!(rr.reports[0].last_sequence_number, 1 << 16);
        assert_eq!(rr.reports[0].total_lost, 0);
    }

    #[test]
    fn test_reordered_arrival_is_not_loss() {
        let mut stream = make_stream();
        let now = Instant::now();

        for seq in [1u16, 3, 2, 4] {
            stream.receive_packet(now, &make_packet(seq, 0));
        }

        let rr = stream.get_receiver_report(now).unwrap();
        assert_eq!(rr.reports[0].total_lost, 0);
        assert_eq!(rr.reports[0].fraction_lost, 0);
    }

    #[test]
    fn test_jitter_estimation() {
        let mut stream = make_stream();
        let base = Instant::now();

        stream.receive_packet(base, &make_packet(1, 42378934));
        // One second later, but the RTP clock only advanced 60000 of 90000.
        stream.receive_packet(
            base + Duration::from_secs(1),
            &make_packet(2, 42378934 + 60000),
        );

        let rr = stream
            .get_receiver_report(base + Duration::from_secs(1))
            .unwrap();
        assert_eq!(rr.reports[0].jitter, 30000 / 16);
    }

    #[test]
    fn test_dlsr_from_sender_report() {
        let mut stream = make_stream();
        let base = Instant::now();

        stream.receive_packet(base, &make_packet(1, 0));

        let sr = SenderReport {
            ssrc: 1000,
            ntp_time: 0x1234_5678_0000_0000,
            ..Default::default()
        };
        stream.receive_sender_report(base, &sr);

        let rr = stream
            .get_receiver_report(base + Duration::from_secs(1))
            .unwrap();
        assert_eq!(rr.reports[0].last_sender_report, 0x5678_0000);
        assert_eq!(rr.reports[0].delay, 65536);
    }

    #[test]
    fn test_report_cadence_guard() {
        let mut stream = make_stream();
        let now = Instant::now();

        stream.receive_packet(now, &make_packet(1, 0));
        assert!(stream.get_receiver_report(now).is_some());
        // Too soon for another report.
        assert!(stream
            .get_receiver_report(now + Duration::from_millis(100))
            .is_none());
        assert!(stream
            .get_receiver_report(now + Duration::from_secs(2))
            .is_some());
    }

    #[test]
    fn test_duplicate_and_stale_are_dropped() {
        let mut stream = make_stream();
        let now = Instant::now();

        assert!(stream.receive_packet(now, &make_packet(5000, 0)));
        assert!(!stream.receive_packet(now, &make_packet(5000, 0)));
        assert!(!stream.receive_packet(now, &make_packet(100, 0)));
        assert_eq!(stream.packets_duplicated, 1);
        assert_eq!(stream.packets_discarded, 1);
    }

    #[test]
    fn test_nack_scheduling() {
        let mut stream = make_stream();
        let base = Instant::now();

        stream.receive_packet(base, &make_packet(10, 0));
        stream.receive_packet(base, &make_packet(13, 0));

        // Before the delay threshold: nothing yet.
        assert!(stream.get_nacks(base).is_none());

        // After the delay: NACK for 11 and 12.
        let nack = stream.get_nacks(base + Duration::from_millis(30)).unwrap();
        assert_eq!(nack.media_ssrc, 1000);
        let mut missing: Vec<u16> = Vec::new();
        for pair in &nack.nacks {
            missing.push(pair.packet_id);
            for bit in 0..16 {
                if pair.lost_packets & (1 << bit) != 0 {
                    missing.push(pair.packet_id.wrapping_add(bit + 1));
                }
            }
        }
        assert_eq!(missing, vec![11, 12]);

        // Within the retry interval nothing new is sent.
        assert!(stream.get_nacks(base + Duration::from_millis(40)).is_none());

        // After the retry interval the NACK repeats.
        assert!(stream
            .get_nacks(base + Duration::from_millis(140))
            .is_some());
    }

    #[test]
    fn test_nack_cancelled_by_arrival() {
        let mut stream = make_stream();
        let base = Instant::now();

        stream.receive_packet(base, &make_packet(10, 0));
        stream.receive_packet(base, &make_packet(12, 0));
        stream.receive_packet(base, &make_packet(11, 0));

        assert!(stream.get_nacks(base + Duration::from_millis(30)).is_none());
    }

    #[test]
    fn test_nack_gives_up_at_horizon() {
        let mut stream = make_stream();
        let base = Instant::now();

        stream.receive_packet(base, &make_packet(10, 0));
        stream.receive_packet(base, &make_packet(12, 0));

        // Way past the horizon: the gap is abandoned silently.
        assert!(stream.get_nacks(base + Duration::from_secs(5)).is_none());
        assert!(stream.pending_nacks.is_empty());
    }

    #[test]
    fn test_rtx_unwrap() {
        let mut stream = make_stream();
        let now = Instant::now();

        stream.receive_packet(now, &make_packet(10, 0));
        stream.receive_packet(now, &make_packet(12, 0));

        // RTX packet recovering seq 11.
        let mut payload = vec![0u8; 102];
        payload[..2].copy_from_slice(&11u16.to_be_bytes());
        let mut rtx = rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 1001,
                payload_type: 97,
                sequence_number: 7,
                ..Default::default()
            },
            payload: payload.into(),
            ..Default::default()
        };

        assert!(stream.receive_rtx_packet(now, &mut rtx));
        assert_eq!(rtx.header.ssrc, 1000);
        assert_eq!(rtx.header.sequence_number, 11);
        assert_eq!(rtx.payload.len(), 100);
        // The gap is gone.
        assert!(stream.get_nacks(now + Duration::from_millis(30)).is_none());
    }

    #[test]
    fn test_rtx_padding_probe_discarded() {
        let mut stream = make_stream();
        let now = Instant::now();

        let mut rtx = rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 1001,
                payload_type: 97,
                ..Default::default()
            },
            payload: vec![0u8; 1].into(),
            ..Default::default()
        };
        assert!(!stream.receive_rtx_packet(now, &mut rtx));
        assert_eq!(stream.packets_discarded, 1);
    }
}
