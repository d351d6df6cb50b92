//! RTP parameters model: codecs, encodings, header extensions and the
//! simulcast profile tags carried by them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Router identifier, allocated by the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouterId(pub u32);

/// Producer identifier, allocated by the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProducerId(pub u32);

/// Consumer identifier, allocated by the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsumerId(pub u32);

/// Opaque handle of the transport an endpoint sends and receives on. The
/// core never interprets it; outbound packets are tagged with it so the
/// embedder can deliver them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportId(pub u32);

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    #[default]
    Video,
    Depth,
}

impl MediaKind {
    /// Whether PLI/FIR key frame requests make sense for this kind.
    pub fn is_key_frame_capable(&self) -> bool {
        !matches!(self, MediaKind::Audio)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
            MediaKind::Depth => write!(f, "depth"),
        }
    }
}

/// Simulcast profile tier. Ordered: `None < Default < Low < Medium < High`.
///
/// `None` is a sentinel meaning "no profile available"; it never tags a real
/// stream.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    None,
    Default,
    Low,
    Medium,
    High,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::None => write!(f, "none"),
            Profile::Default => write!(f, "default"),
            Profile::Low => write!(f, "low"),
            Profile::Medium => write!(f, "medium"),
            Profile::High => write!(f, "high"),
        }
    }
}

/// A single entry of a codec's negotiated `rtcp-fb` list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub parameter: String,
}

/// One negotiated codec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    /// Format parameters (`apt` for RTX codecs and similar).
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl RtpCodecParameters {
    pub fn is_rtx(&self) -> bool {
        self.mime_type.to_ascii_lowercase().ends_with("/rtx")
    }

    fn apt(&self) -> Option<u8> {
        self.parameters
            .get("apt")
            .and_then(|v| v.as_u64())
            .map(|v| v as u8)
    }
}

/// RTX companion stream of an encoding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

/// One encoding (one simulcast stream) of the parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    pub ssrc: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
}

/// A negotiated RTP header extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u8,
}

/// RTCP-related parameters of the session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default)]
    pub cname: String,
    #[serde(default)]
    pub reduced_size: bool,
}

/// A list of negotiated codecs, header extensions and encodings. Immutable
/// once bound to a producer or consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_id: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The media codec an encoding refers to: the one matching its
    /// `codecPayloadType`, otherwise the first non-RTX codec.
    pub fn codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        match encoding.codec_payload_type {
            Some(pt) => self.codecs.iter().find(|c| c.payload_type == pt),
            None => self.codecs.iter().find(|c| !c.is_rtx()),
        }
    }

    /// The RTX codec associated to an encoding's media codec, matched via the
    /// `apt` format parameter.
    pub fn rtx_codec_for_encoding(
        &self,
        encoding: &RtpEncodingParameters,
    ) -> Option<&RtpCodecParameters> {
        let media = self.codec_for_encoding(encoding)?;
        self.codecs
            .iter()
            .find(|c| c.is_rtx() && c.apt() == Some(media.payload_type))
    }
}
