//! Producer: the server-side representation of one media source.
//!
//! Owns one `RtpStreamRecv` per inbound SSRC, classifies every packet to a
//! simulcast profile, parses the codec descriptor once and hands the packet
//! to the router for fan-out. RTCP toward the source (Receiver Reports,
//! NACKs, coalesced PLIs) is queued here and drained by the router.

use crate::codecs;
use crate::packet::MediaPacket;
use crate::parameters::{MediaKind, Profile, ProducerId, RtpParameters, TransportId};
use crate::stream::{
    NackConfig, RtpStreamParams, RtpStreamRecv, RTCP_MAX_AUDIO_INTERVAL, RTCP_MAX_VIDEO_INTERVAL,
};
use bytes::BytesMut;
use log::debug;
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use rtcp::sender_report::SenderReport;
use sfu_shared::{Error, Result};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// No more than one PLI per SSRC within this window.
const PLI_COALESCE_WINDOW: Duration = Duration::from_millis(2000);

/// Boxed RTCP packets queued toward the source endpoint.
pub(crate) type RtcpBatch = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

/// Profile availability changes the router fans out to subscribed consumers.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ProducerEvent {
    ProfileEnabled(Profile),
    ProfileDisabled(Profile),
}

pub struct Producer {
    id: ProducerId,
    kind: MediaKind,
    transport: TransportId,
    rtp_parameters: RtpParameters,

    streams: HashMap<u32, RtpStreamRecv>,
    rtx_ssrc_to_media: HashMap<u32, u32>,
    profile_by_ssrc: HashMap<u32, Profile>,
    /// Profiles with a live, healthy stream behind them.
    active_profiles: BTreeSet<Profile>,

    paused: bool,
    feedback_ssrc: u32,
    last_pli_sent: HashMap<u32, Instant>,

    max_rtcp_interval: Duration,
    nack_config: NackConfig,

    events: VecDeque<ProducerEvent>,
    rtcp_queue: VecDeque<RtcpBatch>,
}

/// Stream construction data derived from one encoding.
struct StreamEntry {
    params: RtpStreamParams,
    profile: Profile,
}

impl Producer {
    pub fn new(
        id: ProducerId,
        kind: MediaKind,
        transport: TransportId,
        rtp_parameters: RtpParameters,
        paused: bool,
        nack_config: NackConfig,
    ) -> Result<Self> {
        let max_rtcp_interval = match kind {
            MediaKind::Audio => RTCP_MAX_AUDIO_INTERVAL,
            _ => RTCP_MAX_VIDEO_INTERVAL,
        };

        let entries = Self::stream_entries(&rtp_parameters)?;

        let mut producer = Self {
            id,
            kind,
            transport,
            rtp_parameters,
            streams: HashMap::new(),
            rtx_ssrc_to_media: HashMap::new(),
            profile_by_ssrc: HashMap::new(),
            active_profiles: BTreeSet::new(),
            paused,
            feedback_ssrc: rand::random::<u32>(),
            last_pli_sent: HashMap::new(),
            max_rtcp_interval,
            nack_config,
            events: VecDeque::new(),
            rtcp_queue: VecDeque::new(),
        };
        producer.install_streams(entries);
        Ok(producer)
    }

    /// Validates the encodings and derives the per-stream construction data.
    fn stream_entries(rtp_parameters: &RtpParameters) -> Result<Vec<StreamEntry>> {
        if rtp_parameters.encodings.is_empty() {
            return Err(Error::ErrEmptyEncodings);
        }

        let mut entries = Vec::with_capacity(rtp_parameters.encodings.len());
        let mut seen = std::collections::HashSet::new();

        for encoding in &rtp_parameters.encodings {
            if encoding.ssrc == 0 {
                return Err(Error::ErrMissingEncodingSsrc);
            }
            if !seen.insert(encoding.ssrc) {
                return Err(Error::ErrDuplicatedSsrc);
            }
            let codec = rtp_parameters
                .codec_for_encoding(encoding)
                .ok_or(Error::ErrNoMatchingCodec)?;

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

            let rtx_codec = rtp_parameters.rtx_codec_for_encoding(encoding);
            let (rtx_payload_type, rtx_ssrc) = match (&encoding.rtx, rtx_codec) {
                (Some(rtx), Some(codec)) if rtx.ssrc != 0 => {
                    (Some(codec.payload_type), Some(rtx.ssrc))
                }
                _ => (None, None),
            };

            entries.push(StreamEntry {
                params: RtpStreamParams {
                    ssrc: encoding.ssrc,
                    payload_type: codec.payload_type,
                    mime_type: codec.mime_type.clone(),
                    clock_rate: codec.clock_rate,
                    use_nack,
                    use_pli,
                    rtx_payload_type,
                    rtx_ssrc,
                },
                profile: encoding.profile.unwrap_or(Profile::Default),
            });
        }

        Ok(entries)
    }

    /// Installs streams for the given entries, keeping streams whose SSRC
    /// survives and rebuilding the lookup maps.
    fn install_streams(&mut self, entries: Vec<StreamEntry>) {
        let keep: std::collections::HashSet<u32> =
            entries.iter().map(|e| e.params.ssrc).collect();

        // Profiles whose stream disappears stop being active.
        let removed: Vec<(u32, Profile)> = self
            .profile_by_ssrc
            .iter()
            .filter(|&(ssrc, _)| !keep.contains(ssrc))
            .map(|(&ssrc, &profile)| (ssrc, profile))
            .collect();
        for (ssrc, profile) in removed {
            self.streams.remove(&ssrc);
            self.last_pli_sent.remove(&ssrc);
            if self.active_profiles.remove(&profile) {
                self.events.push_back(ProducerEvent::ProfileDisabled(profile));
            }
        }

        self.rtx_ssrc_to_media.clear();
        self.profile_by_ssrc.clear();

        let max_rtcp_interval = self.max_rtcp_interval;
        for entry in entries {
            let StreamEntry { params, profile } = entry;
            let ssrc = params.ssrc;

            if let Some(rtx_ssrc) = params.rtx_ssrc {
                self.rtx_ssrc_to_media.insert(rtx_ssrc, ssrc);
            }
            self.profile_by_ssrc.insert(ssrc, profile);

            let nack_config = self.nack_config.clone();
            self.streams
                .entry(ssrc)
                .or_insert_with(|| RtpStreamRecv::new(params, max_rtcp_interval, nack_config));
        }
    }

    /// Renegotiation: replaces the RTP parameters, keeping streams whose
    /// SSRC is unchanged. On failure the producer stays in its prior state.
    pub fn update_rtp_parameters(&mut self, rtp_parameters: RtpParameters) -> Result<()> {
        let entries = Self::stream_entries(&rtp_parameters)?;
        self.install_streams(entries);
        self.rtp_parameters = rtp_parameters;
        debug!("producer parameters updated [producer_id:{}]", self.id.0);
        Ok(())
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn active_profiles(&self) -> &BTreeSet<Profile> {
        &self.active_profiles
    }

    /// Whether this producer owns the given inbound SSRC (media or RTX).
    pub fn handles_ssrc(&self, ssrc: u32) -> bool {
        self.streams.contains_key(&ssrc) || self.rtx_ssrc_to_media.contains_key(&ssrc)
    }

    /// Processes one inbound RTP packet. Returns the packet prepared for
    /// fan-out together with its profile, or `None` when it was consumed by
    /// stream health only (dropped, duplicate, paused).
    pub fn receive_rtp_packet(
        &mut self,
        now: Instant,
        mut packet: rtp::packet::Packet,
    ) -> Option<(MediaPacket, Profile)> {
        let ssrc = packet.header.ssrc;
        let (media_ssrc, is_rtx) = match self.rtx_ssrc_to_media.get(&ssrc) {
            Some(&media) => (media, true),
            None => (ssrc, false),
        };

        let Some(stream) = self.streams.get_mut(&media_ssrc) else {
            debug!(
                "no stream for received packet [producer_id:{}, ssrc:{ssrc}]",
                self.id.0
            );
            return None;
        };

        let accepted = if is_rtx {
            stream.receive_rtx_packet(now, &mut packet)
        } else {
            stream.receive_packet(now, &packet)
        };
        if !accepted {
            return None;
        }

        let profile = *self
            .profile_by_ssrc
            .get(&media_ssrc)
            .unwrap_or(&Profile::Default);
        if self.active_profiles.insert(profile) {
            debug!(
                "profile became active [producer_id:{}, profile:{profile}]",
                self.id.0
            );
            self.events.push_back(ProducerEvent::ProfileEnabled(profile));
        }

        if self.paused {
            return None;
        }

        let mime_type = stream.params().mime_type.clone();
        let mut payload = BytesMut::from(&packet.payload[..]);
        let descriptor = codecs::prepare(&mime_type, &mut payload);

        Some((
            MediaPacket {
                header: packet.header,
                payload,
                descriptor,
            },
            profile,
        ))
    }

    /// Asks the source for a key frame on the given profile (all profiles
    /// when `Profile::None`). PLIs are coalesced per SSRC.
    pub fn request_key_frame(&mut self, now: Instant, profile: Profile) {
        if !self.kind.is_key_frame_capable() {
            return;
        }

        let ssrcs: Vec<u32> = self
            .profile_by_ssrc
            .iter()
            .filter(|(_, &p)| profile == Profile::None || p == profile)
            .map(|(&ssrc, _)| ssrc)
            .collect();

        for ssrc in ssrcs {
            let Some(stream) = self.streams.get(&ssrc) else {
                continue;
            };
            if !stream.params().use_pli {
                continue;
            }
            if let Some(&sent_at) = self.last_pli_sent.get(&ssrc) {
                if now.saturating_duration_since(sent_at) < PLI_COALESCE_WINDOW {
                    continue;
                }
            }
            self.last_pli_sent.insert(ssrc, now);

            debug!("sending PLI [producer_id:{}, ssrc:{ssrc}]", self.id.0);
            let pli = PictureLossIndication {
                sender_ssrc: self.feedback_ssrc,
                media_ssrc: ssrc,
            };
            self.rtcp_queue.push_back(vec![Box::new(pli)]);
        }
    }

    /// Feeds a Sender Report from the source into the owning stream.
    pub fn receive_sender_report(&mut self, now: Instant, sr: &SenderReport) {
        if let Some(stream) = self.streams.get_mut(&sr.ssrc) {
            stream.receive_sender_report(now, sr);
        }
    }

    /// Returns whether the pause state changed.
    pub fn pause(&mut self) -> bool {
        if self.paused {
            return false;
        }
        self.paused = true;
        debug!("producer paused [producer_id:{}]", self.id.0);
        true
    }

    /// Returns whether the pause state changed.
    pub fn resume(&mut self) -> bool {
        if !self.paused {
            return false;
        }
        self.paused = false;
        debug!("producer resumed [producer_id:{}]", self.id.0);
        true
    }

    /// Periodic work: NACK generation, Receiver Reports and stream health.
    pub fn handle_timeout(&mut self, now: Instant) {
        for (ssrc, stream) in &mut self.streams {
            if let Some(nack) = stream.get_nacks(now) {
                self.rtcp_queue.push_back(vec![Box::new(nack)]);
            }
            if let Some(rr) = stream.get_receiver_report(now) {
                self.rtcp_queue.push_back(vec![Box::new(rr)]);
            }
            if let Some(healthy) = stream.take_health_flip() {
                let profile = *self.profile_by_ssrc.get(ssrc).unwrap_or(&Profile::Default);
                if healthy {
                    if self.active_profiles.insert(profile) {
                        self.events.push_back(ProducerEvent::ProfileEnabled(profile));
                    }
                } else if self.active_profiles.remove(&profile) {
                    self.events.push_back(ProducerEvent::ProfileDisabled(profile));
                }
            }
        }
    }

    pub(crate) fn pop_event(&mut self) -> Option<ProducerEvent> {
        self.events.pop_front()
    }

    pub(crate) fn pop_rtcp(&mut self) -> Option<RtcpBatch> {
        self.rtcp_queue.pop_front()
    }

    pub fn dump(&mut self, now: Instant) -> serde_json::Value {
        let mut streams: Vec<serde_json::Value> = Vec::new();
        for stream in self.streams.values_mut() {
            streams.push(stream.stats(now));
        }
        let profiles: HashMap<String, Profile> = self
            .profile_by_ssrc
            .iter()
            .map(|(ssrc, profile)| (ssrc.to_string(), *profile))
            .collect();

        serde_json::json!({
            "producerId": self.id,
            "kind": self.kind,
            "rtpParameters": self.rtp_parameters,
            "paused": self.paused,
            "profiles": profiles,
            "activeProfiles": self.active_profiles,
            "rtpStreams": streams,
        })
    }
}
