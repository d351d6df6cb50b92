//! Outbound stream state: retransmission ring, RTX encoding and Sender
//! Report generation.

use super::counter::RtpDataCounter;
use super::send_buffer::SendBuffer;
use super::{RtpStream, RtpStreamParams};
use log::debug;
use rtcp::reception_report::ReceptionReport;
use rtcp::sender_report::SenderReport;
use rtcp::source_description::{
    SdesType, SourceDescriptionChunk, SourceDescriptionItem,
};
use rtp::extension::abs_send_time_extension::unix2ntp;
use std::time::{Duration, Instant};

/// A packet is not resent more often than this.
const RETRANSMISSION_GUARD: Duration = Duration::from_millis(50);

/// Tracks one outbound SSRC.
pub struct RtpStreamSend {
    stream: RtpStream,
    /// Retransmission ring. `None` when the stream was built without a
    /// buffer (audio, or no NACK support).
    buffer: Option<SendBuffer>,
    rtx_seq: u16,
    transmission: RtpDataCounter,

    started: bool,
    max_seq: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Option<Instant>,

    /// Estimated round-trip time from the last Receiver Report.
    rtt: Option<Duration>,
    /// Scratch container reused across retransmission requests.
    retransmission_scratch: Vec<rtp::packet::Packet>,
    health_flip: Option<bool>,
}

impl RtpStreamSend {
    /// `buffer_size` of zero disables the retransmission ring.
    pub fn new(params: RtpStreamParams, buffer_size: u16) -> Self {
        Self {
            stream: RtpStream::new(params),
            buffer: SendBuffer::new(buffer_size),
            rtx_seq: rand::random::<u16>(),
            transmission: RtpDataCounter::new(),
            started: false,
            max_seq: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: None,
            rtt: None,
            retransmission_scratch: Vec::with_capacity(17),
            health_flip: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.stream.params.ssrc
    }

    pub fn params(&self) -> &RtpStreamParams {
        &self.stream.params
    }

    pub fn has_rtx(&self) -> bool {
        self.stream.params.rtx_payload_type.is_some() && self.stream.params.rtx_ssrc.is_some()
    }

    pub fn is_healthy(&self) -> bool {
        self.stream.is_healthy()
    }

    /// Accounts an outbound packet and retains a copy for retransmission.
    /// Returns `false` when the packet regresses the sequence space
    /// incoherently and should not be transmitted.
    pub fn receive_packet(&mut self, now: Instant, packet: &rtp::packet::Packet) -> bool {
        let seq = packet.header.sequence_number;

        if !self.started {
            self.started = true;
            self.max_seq = seq;
        } else {
            let diff = seq.wrapping_sub(self.max_seq);
            if diff != 0 && diff < (1 << 15) {
                self.max_seq = seq;
            } else if self.max_seq.wrapping_sub(seq) > u16::MAX / 4 {
                // A regression this large means the caller lost sync.
                return false;
            }
        }

        self.last_rtp_time_rtp = packet.header.timestamp;
        self.last_rtp_time_time = Some(now);
        self.transmission.update(now, packet.payload.len());
        self.stream.last_activity = Some(now);

        if let Some(buffer) = &mut self.buffer {
            buffer.add(packet.clone());
        }
        true
    }

    /// Walks the 17-bit NACK window (`packet_id` plus the bitmask) and
    /// returns the retransmittable packets in order, RTX-encoded when RTX is
    /// configured. Sequences outside the ring are silently skipped.
    pub fn request_retransmission(
        &mut self,
        now: Instant,
        packet_id: u16,
        bitmask: u16,
    ) -> &[rtp::packet::Packet] {
        self.retransmission_scratch.clear();

        let Some(buffer) = &mut self.buffer else {
            return &self.retransmission_scratch;
        };

        let mut requested = vec![packet_id];
        for bit in 0..16u16 {
            if bitmask & (1 << bit) != 0 {
                requested.push(packet_id.wrapping_add(bit + 1));
            }
        }

        for seq in requested {
            let Some(stored) = buffer.get_mut(seq) else {
                continue;
            };

            if let Some(resent_at) = stored.resent_at {
                if now.saturating_duration_since(resent_at) < RETRANSMISSION_GUARD {
                    continue;
                }
            }
            stored.resent_at = Some(now);
            stored.sent_times = stored.sent_times.saturating_add(1);
            self.retransmission_scratch.push(stored.packet.clone());
        }

        // RTX-encode outside the ring borrow.
        if self.stream.params.rtx_payload_type.is_some() && self.stream.params.rtx_ssrc.is_some() {
            let params = self.stream.params.clone();
            for packet in &mut self.retransmission_scratch {
                rtx_encode(&params, &mut self.rtx_seq, packet);
            }
        }

        &self.retransmission_scratch
    }

    /// Re-encodes a packet as its RFC 4588 retransmission.
    pub fn rtx_encode(&mut self, packet: &mut rtp::packet::Packet) {
        let params = self.stream.params.clone();
        rtx_encode(&params, &mut self.rtx_seq, packet);
    }

    /// Discards the retransmission ring. Used on pause and profile change:
    /// resending the old stream would be harmful.
    pub fn clear_retransmission_buffer(&mut self) {
        if let Some(buffer) = &mut self.buffer {
            buffer.clear();
        }
    }

    /// Generates a Sender Report, or `None` before the first packet.
    pub fn get_sender_report(&mut self, now: Instant) -> Option<SenderReport> {
        let last_time = self.last_rtp_time_time?;
        let clock_rate = self.stream.params.clock_rate as f64;

        Some(SenderReport {
            ssrc: self.stream.params.ssrc,
            ntp_time: unix2ntp(std::time::SystemTime::now()),
            rtp_time: self.last_rtp_time_rtp.wrapping_add(
                (now.saturating_duration_since(last_time).as_secs_f64() * clock_rate) as u32,
            ),
            packet_count: self.transmission.packet_count(),
            octet_count: self.transmission.octet_count(),
            ..Default::default()
        })
    }

    /// Builds the SDES chunk carrying the sender's CNAME.
    pub fn get_sdes_chunk(&self, cname: &str) -> SourceDescriptionChunk {
        SourceDescriptionChunk {
            source: self.stream.params.ssrc,
            items: vec![SourceDescriptionItem {
                sdes_type: SdesType::SdesCname,
                text: cname.as_bytes().to_vec().into(),
            }],
        }
    }

    /// Feeds back a Receiver Report for this stream: updates RTT and the
    /// loss-based health score.
    pub fn receive_receiver_report(&mut self, now: Instant, report: &ReceptionReport) {
        if report.last_sender_report != 0 {
            let now_ntp = (unix2ntp(std::time::SystemTime::now()) >> 16) as u32;
            let rtt_q16 = now_ntp
                .wrapping_sub(report.last_sender_report)
                .wrapping_sub(report.delay);
            // Only believable values; clock skew can produce nonsense.
            if rtt_q16 < (30 << 16) {
                self.rtt = Some(Duration::from_secs_f64(f64::from(rtt_q16) / 65536.0));
            }
        }

        if let Some(flip) = self.stream.push_loss_sample(report.fraction_lost) {
            debug!(
                "send stream health changed [ssrc:{}, healthy:{}]",
                self.stream.params.ssrc, flip
            );
            self.health_flip = Some(flip);
        }
    }

    /// Returns and clears the latest health transition, if one happened.
    pub fn take_health_flip(&mut self) -> Option<bool> {
        self.health_flip.take()
    }

    pub fn transmitted_packet_count(&self) -> u32 {
        self.transmission.packet_count()
    }

    pub fn stats(&mut self, now: Instant) -> serde_json::Value {
        serde_json::json!({
            "ssrc": self.stream.params.ssrc,
            "mimeType": self.stream.params.mime_type,
            "packetCount": self.transmission.packet_count(),
            "octetCount": self.transmission.octet_count(),
            "bitrate": self.transmission.bitrate(now),
            "rtt": self.rtt.map(|rtt| rtt.as_millis() as u64),
            "score": self.stream.score(),
            "healthy": self.stream.is_healthy(),
        })
    }
}

/// RFC 4588: clone-in-place RTX encoding. The RTX stream has its own SSRC,
/// payload type and sequence space; the original sequence number travels in
/// the first two payload bytes.
fn rtx_encode(params: &RtpStreamParams, rtx_seq: &mut u16, packet: &mut rtp::packet::Packet) {
    let (Some(rtx_pt), Some(rtx_ssrc)) = (params.rtx_payload_type, params.rtx_ssrc) else {
        return;
    };

    let original_seq = packet.header.sequence_number;
    let mut rtx_payload = Vec::with_capacity(2 + packet.payload.len());
    rtx_payload.extend_from_slice(&original_seq.to_be_bytes());
    rtx_payload.extend_from_slice(&packet.payload);

    packet.header.ssrc = rtx_ssrc;
    packet.header.payload_type = rtx_pt;
    packet.header.sequence_number = *rtx_seq;
    packet.payload = rtx_payload.into();
    *rtx_seq = rtx_seq.wrapping_add(1);
}
