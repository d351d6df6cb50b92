//! Consumer: the server-side representation of one media stream delivered
//! to an endpoint.
//!
//! Splices packets of its source producer onto a single outbound stream:
//! SSRC, sequence number and timestamp are rewritten so that the emitted
//! stream stays monotonic across simulcast profile switches, pauses and
//! source renegotiations.

use crate::codecs::EncodingContext;
use crate::packet::MediaPacket;
use crate::parameters::{ConsumerId, MediaKind, ProducerId, Profile, RtpParameters, TransportId};
use crate::stream::{
    RtpStreamParams, RtpStreamSend, RTCP_MAX_AUDIO_INTERVAL, RTCP_MAX_VIDEO_INTERVAL,
};
use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use rtcp::source_description::SourceDescription;
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;
use sfu_shared::{Error, Result};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

/// Retransmission ring size for video streams with NACK support.
const VIDEO_RETRANSMISSION_BUFFER_SIZE: u16 = 750;

/// Boxed RTCP packets queued toward the receiving endpoint.
type RtcpBatch = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

/// Something a consumer produced for the router to act on.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ConsumerEvent {
    SourcePaused,
    SourceResumed,
    EffectiveProfileChange(Profile),
    /// The source producer renegotiated its parameters.
    ParametersChange,
    /// The consumer needs a key frame from its source producer.
    FullFrameRequired,
}

/// An outbound packet queued on the consumer's transport.
pub(crate) enum ConsumerOut {
    Rtp(rtp::packet::Packet),
    Rtcp(RtcpBatch),
}

pub struct Consumer {
    id: ConsumerId,
    kind: MediaKind,
    source_producer_id: ProducerId,

    transport: Option<TransportId>,
    rtp_parameters: Option<RtpParameters>,
    rtp_stream: Option<RtpStreamSend>,
    supported_codec_payload_types: BTreeSet<u8>,
    encoding_context: Option<EncodingContext>,

    paused: bool,
    source_paused: bool,

    preferred_profile: Profile,
    effective_profile: Profile,
    profiles: BTreeSet<Profile>,

    sync_required: bool,
    seq_num: u16,
    rtp_timestamp: u32,
    last_recv_seq_num: u16,
    last_recv_rtp_timestamp: u32,

    /// Anchor for the wall-clock-based timestamp jump on sync.
    created_at: Instant,
    max_rtcp_interval: Duration,
    last_rtcp_sent: Option<Instant>,

    transmitted_bytes: u64,
    retransmitted_packets: u64,

    events: VecDeque<ConsumerEvent>,
    write_queue: VecDeque<ConsumerOut>,
}

impl Consumer {
    pub fn new(
        id: ConsumerId,
        kind: MediaKind,
        source_producer_id: ProducerId,
        now: Instant,
    ) -> Self {
        let max_rtcp_interval = match kind {
            MediaKind::Audio => RTCP_MAX_AUDIO_INTERVAL,
            _ => RTCP_MAX_VIDEO_INTERVAL,
        };

        Self {
            id,
            kind,
            source_producer_id,
            transport: None,
            rtp_parameters: None,
            rtp_stream: None,
            supported_codec_payload_types: BTreeSet::new(),
            encoding_context: None,
            paused: false,
            source_paused: false,
            preferred_profile: Profile::None,
            effective_profile: Profile::None,
            profiles: BTreeSet::from([Profile::None]),
            sync_required: true,
            seq_num: rand::thread_rng().gen_range(0x00FF..=0xFFFF),
            rtp_timestamp: 0,
            last_recv_seq_num: 0,
            last_recv_rtp_timestamp: 0,
            created_at: now,
            max_rtcp_interval,
            last_rtcp_sent: None,
            transmitted_bytes: 0,
            retransmitted_packets: 0,
            events: VecDeque::new(),
            write_queue: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn source_producer_id(&self) -> ProducerId {
        self.source_producer_id
    }

    pub fn transport(&self) -> Option<TransportId> {
        self.transport
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.paused || self.source_paused
    }

    pub fn effective_profile(&self) -> Profile {
        self.effective_profile
    }

    pub fn preferred_profile(&self) -> Profile {
        self.preferred_profile
    }

    /// Outbound SSRCs (media and RTX) this consumer emits on.
    pub fn ssrcs(&self) -> Vec<u32> {
        let Some(stream) = &self.rtp_stream else {
            return Vec::new();
        };
        let params = stream.params();
        let mut ssrcs = vec![params.ssrc];
        if let Some(rtx_ssrc) = params.rtx_ssrc {
            ssrcs.push(rtx_ssrc);
        }
        ssrcs
    }

    /// A transport has been assigned, and hence sending RTP parameters.
    pub fn enable(&mut self, transport: TransportId, rtp_parameters: RtpParameters) -> Result<()> {
        // Must have a single encoding with a usable SSRC.
        if rtp_parameters.encodings.is_empty() {
            return Err(Error::ErrEmptyEncodings);
        }
        if rtp_parameters.encodings[0].ssrc == 0 {
            return Err(Error::ErrMissingEncodingSsrc);
        }
        let encoding = rtp_parameters.encodings[0].clone();
        let codec = rtp_parameters
            .codec_for_encoding(&encoding)
            .ok_or(Error::ErrNoMatchingCodec)?
            .clone();

        if self.is_enabled() {
            self.disable();
        }

        let mut use_nack = false;
        let mut use_pli = false;
        for fb in &codec.rtcp_feedback {
            if fb.typ == "nack" && fb.parameter.is_empty() {
                use_nack = true;
            }
            if fb.typ == "nack" && fb.parameter == "pli" {
                use_pli = true;
            }
        }

        let rtx_codec = rtp_parameters.rtx_codec_for_encoding(&encoding);
        let (rtx_payload_type, rtx_ssrc) = match (&encoding.rtx, rtx_codec) {
            (Some(rtx), Some(codec)) if rtx.ssrc != 0 => (Some(codec.payload_type), Some(rtx.ssrc)),
            _ => (None, None),
        };

        let params = RtpStreamParams {
            ssrc: encoding.ssrc,
            payload_type: codec.payload_type,
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            use_nack,
            use_pli,
            rtx_payload_type,
            rtx_ssrc,
        };

        let buffer_size = if use_nack && self.kind != MediaKind::Audio {
            VIDEO_RETRANSMISSION_BUFFER_SIZE
        } else {
            0
        };
        self.rtp_stream = Some(RtpStreamSend::new(params, buffer_size));

        self.supported_codec_payload_types = rtp_parameters
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .map(|c| c.payload_type)
            .collect();

        self.encoding_context = match codec.mime_type.to_ascii_lowercase().as_str() {
            "video/vp8" | "video/h264" => Some(EncodingContext::new()),
            _ => None,
        };

        self.rtp_parameters = Some(rtp_parameters);
        self.transport = Some(transport);
        self.sync_required = true;

        debug!("consumer enabled [consumer_id:{}]", self.id.0);
        Ok(())
    }

    /// The transport assigned to this consumer is gone; it becomes
    /// unhandled. The RTP parameters survive for a later re-enable.
    pub fn disable(&mut self) {
        self.transport = None;
        self.supported_codec_payload_types.clear();
        self.rtp_stream = None;
        self.encoding_context = None;

        self.last_rtcp_sent = None;
        self.transmitted_bytes = 0;
        self.retransmitted_packets = 0;
        // Pending retransmissions die with the transport.
        self.write_queue.clear();

        debug!("consumer disabled [consumer_id:{}]", self.id.0);
    }

    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        debug!("consumer paused [consumer_id:{}]", self.id.0);

        if self.is_enabled() && !self.source_paused {
            if let Some(stream) = &mut self.rtp_stream {
                stream.clear_retransmission_buffer();
            }
        }
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        debug!("consumer resumed [consumer_id:{}]", self.id.0);

        if self.is_enabled() && !self.source_paused {
            self.request_full_frame();
        }
    }

    /// Mirrors a pause of the source producer.
    pub fn source_pause(&mut self) {
        if self.source_paused {
            return;
        }
        self.source_paused = true;
        debug!("consumer source paused [consumer_id:{}]", self.id.0);

        self.events.push_back(ConsumerEvent::SourcePaused);

        if self.is_enabled() && !self.paused {
            if let Some(stream) = &mut self.rtp_stream {
                stream.clear_retransmission_buffer();
            }
        }
    }

    /// Mirrors a resume of the source producer.
    pub fn source_resume(&mut self) {
        if !self.source_paused {
            return;
        }
        self.source_paused = false;
        debug!("consumer source resumed [consumer_id:{}]", self.id.0);

        self.events.push_back(ConsumerEvent::SourceResumed);

        if self.is_enabled() && !self.paused {
            self.request_full_frame();
        }
    }

    /// The source producer renegotiated its parameters: resync on the next
    /// packet and drop stale retransmissions.
    pub fn source_rtp_parameters_updated(&mut self) {
        if !self.is_enabled() {
            return;
        }
        self.sync_required = true;
        if let Some(context) = &mut self.encoding_context {
            context.require_sync();
        }
        if let Some(stream) = &mut self.rtp_stream {
            stream.clear_retransmission_buffer();
        }
        self.events.push_back(ConsumerEvent::ParametersChange);
    }

    /// A producer profile became available.
    pub fn add_profile(&mut self, profile: Profile) {
        // The first real profile displaces the NONE sentinel.
        if self.profiles.len() == 1 && self.profiles.contains(&Profile::None) {
            self.profiles.clear();
        }
        self.profiles.insert(profile);

        debug!(
            "profile added [consumer_id:{}, profile:{profile}]",
            self.id.0
        );
        self.recalculate_effective_profile();
    }

    /// A producer profile went away.
    pub fn remove_profile(&mut self, profile: Profile) {
        self.profiles.remove(&profile);
        if self.profiles.is_empty() {
            self.profiles.insert(Profile::None);
        }

        debug!(
            "profile removed [consumer_id:{}, profile:{profile}]",
            self.id.0
        );
        self.recalculate_effective_profile();
    }

    pub fn set_preferred_profile(&mut self, profile: Profile) {
        if self.preferred_profile == profile {
            return;
        }
        self.preferred_profile = profile;
        self.recalculate_effective_profile();
    }

    /// Forwards one producer packet, rewriting SSRC, sequence number and
    /// timestamp onto this consumer's outbound stream.
    pub fn send_rtp_packet(&mut self, now: Instant, packet: &mut MediaPacket, profile: Profile) {
        if !self.is_enabled() || self.is_paused() {
            return;
        }

        // An effective profile of NONE forwards nothing.
        if self.effective_profile == Profile::None {
            return;
        }

        // This consumer may support only a subset of the producer codecs.
        if !self
            .supported_codec_payload_types
            .contains(&packet.payload_type())
        {
            debug!(
                "payload type not supported [consumer_id:{}, payload_type:{}]",
                self.id.0,
                packet.payload_type()
            );
            return;
        }

        // Packets of a profile other than the effective one are dropped.
        if profile != self.effective_profile {
            return;
        }

        // Codec-level selection and field remapping, per consumer.
        let mut processed = false;
        if let (Some(descriptor), Some(context)) =
            (&packet.descriptor, &mut self.encoding_context)
        {
            if self.sync_required {
                context.require_sync();
            }
            if !descriptor.process(context, &mut packet.payload) {
                return;
            }
            processed = true;
        }

        // Whether sequence number and timestamp sync is required.
        if self.sync_required {
            self.seq_num = self.seq_num.wrapping_add(1);

            let elapsed_ms = now.saturating_duration_since(self.created_at).as_millis() as u32;
            if elapsed_ms > self.rtp_timestamp {
                self.rtp_timestamp = elapsed_ms;
            }

            self.sync_required = false;
        } else {
            self.seq_num = self
                .seq_num
                .wrapping_add(packet.sequence_number().wrapping_sub(self.last_recv_seq_num));
            self.rtp_timestamp = self
                .rtp_timestamp
                .wrapping_add(packet.timestamp().wrapping_sub(self.last_recv_rtp_timestamp));
        }

        self.last_recv_seq_num = packet.sequence_number();
        self.last_recv_rtp_timestamp = packet.timestamp();

        // Stamp this consumer's own header; the borrowed packet keeps the
        // original one for the remaining consumers.
        let stream = self.rtp_stream.as_mut().expect("enabled consumer has a stream");
        let mut header = packet.header.clone();
        header.ssrc = stream.params().ssrc;
        header.sequence_number = self.seq_num;
        header.timestamp = self.rtp_timestamp;

        let out = rtp::packet::Packet {
            header,
            payload: Bytes::copy_from_slice(&packet.payload),
            ..Default::default()
        };

        if stream.receive_packet(now, &out) {
            self.transmitted_bytes += out.payload.len() as u64;
            self.write_queue.push_back(ConsumerOut::Rtp(out));
        } else {
            warn!(
                "outbound stream rejected packet [consumer_id:{}, seq:{}]",
                self.id.0, self.seq_num
            );
        }

        // Undo the in-place payload rewrite for the next consumer.
        if processed {
            if let Some(descriptor) = &packet.descriptor {
                descriptor.restore(&mut packet.payload);
            }
        }
    }

    /// Appends this consumer's Sender Report and SDES chunk when the RTCP
    /// interval elapsed.
    pub fn get_rtcp(&mut self, now: Instant) {
        if let Some(last) = self.last_rtcp_sent {
            let elapsed = now.saturating_duration_since(last);
            if elapsed.as_secs_f64() * 1.15 < self.max_rtcp_interval.as_secs_f64() {
                return;
            }
        }

        let Some(stream) = &mut self.rtp_stream else {
            return;
        };
        let Some(report) = stream.get_sender_report(now) else {
            return;
        };

        let cname = self
            .rtp_parameters
            .as_ref()
            .map(|p| p.rtcp.cname.clone())
            .unwrap_or_default();
        let sdes = SourceDescription {
            chunks: vec![stream.get_sdes_chunk(&cname)],
        };

        self.write_queue
            .push_back(ConsumerOut::Rtcp(vec![Box::new(report), Box::new(sdes)]));
        self.last_rtcp_sent = Some(now);
    }

    /// Answers a NACK from the receiving endpoint out of the retransmission
    /// ring.
    pub fn receive_nack(&mut self, now: Instant, nack: &TransportLayerNack) {
        if !self.is_enabled() {
            return;
        }
        let Some(stream) = &mut self.rtp_stream else {
            return;
        };

        let mut retransmissions: Vec<rtp::packet::Packet> = Vec::new();
        for item in &nack.nacks {
            let packets = stream.request_retransmission(now, item.packet_id, item.lost_packets);
            retransmissions.extend(packets.iter().cloned());
        }

        for packet in retransmissions {
            debug!(
                "retransmitting packet [consumer_id:{}, ssrc:{}, seq:{}]",
                self.id.0, packet.header.ssrc, packet.header.sequence_number
            );
            self.retransmitted_packets += 1;
            self.write_queue.push_back(ConsumerOut::Rtp(packet));
        }
    }

    /// Feeds back a Receiver Report for the outbound stream.
    pub fn receive_receiver_report(
        &mut self,
        now: Instant,
        report: &rtcp::reception_report::ReceptionReport,
    ) {
        if let Some(stream) = &mut self.rtp_stream {
            stream.receive_receiver_report(now, report);
        }
    }

    /// Requests a full frame of the source (video only, when forwarding).
    pub fn request_full_frame(&mut self) {
        if !self.is_enabled() || !self.kind.is_key_frame_capable() || self.is_paused() {
            return;
        }
        self.events.push_back(ConsumerEvent::FullFrameRequired);
    }

    fn recalculate_effective_profile(&mut self) {
        let new_profile = if self.profiles.len() == 1 && self.profiles.contains(&Profile::None) {
            Profile::None
        } else if self.preferred_profile == Profile::None {
            // No preference: the best available.
            *self.profiles.iter().next_back().expect("profiles is never empty")
        } else {
            // The highest profile at or below the preference, else the
            // lowest available.
            self.profiles
                .range(..=self.preferred_profile)
                .next_back()
                .or_else(|| self.profiles.iter().next())
                .copied()
                .expect("profiles is never empty")
        };

        if new_profile == self.effective_profile {
            return;
        }

        self.effective_profile = new_profile;
        debug!(
            "new effective profile [consumer_id:{}, profile:{new_profile}]",
            self.id.0
        );

        self.events
            .push_back(ConsumerEvent::EffectiveProfileChange(new_profile));

        if self.is_enabled() && !self.is_paused() {
            if let Some(stream) = &mut self.rtp_stream {
                stream.clear_retransmission_buffer();
            }
            self.request_full_frame();
        }

        self.sync_required = true;
        if let Some(context) = &mut self.encoding_context {
            context.require_sync();
        }
    }

    pub(crate) fn pop_event(&mut self) -> Option<ConsumerEvent> {
        self.events.pop_front()
    }

    pub(crate) fn pop_out(&mut self) -> Option<ConsumerOut> {
        self.write_queue.pop_front()
    }

    pub fn dump(&mut self, now: Instant) -> serde_json::Value {
        let rtp_stream = self.rtp_stream.as_mut().map(|s| s.stats(now));
        let rtp_parameters = self
            .transport
            .is_some()
            .then(|| self.rtp_parameters.clone());

        serde_json::json!({
            "consumerId": self.id,
            "kind": self.kind,
            "sourceProducerId": self.source_producer_id,
            "rtpParameters": rtp_parameters,
            "rtpStream": rtp_stream,
            "paused": self.paused,
            "sourcePaused": self.source_paused,
            "preferredProfile": self.preferred_profile,
            "effectiveProfile": self.effective_profile,
            "profiles": self.profiles,
            "supportedCodecPayloadTypes": self.supported_codec_payload_types,
            "transmittedBytes": self.transmitted_bytes,
            "retransmittedPackets": self.retransmitted_packets,
        })
    }
}
