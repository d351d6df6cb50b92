//! Codec-specific payload descriptors.
//!
//! A producer parses each packet's descriptor once; every consumer then runs
//! it through its own [`EncodingContext`] to decide whether the packet
//! survives temporal-layer selection and to rewrite the remappable fields
//! (VP8 pictureId / tl0PictureIndex) in place. [`PayloadDescriptor::restore`]
//! undoes the rewrite so the borrowed payload can be handed to the next
//! consumer.

use crate::sequence::SeqManager;
use bytes::BytesMut;

pub mod h264;
pub mod vp8;

/// Highest VP8 temporal layer index (2-bit field).
pub const MAX_TEMPORAL_LAYER: u8 = 3;

/// Per-consumer rewrite state for codecs with remappable fields.
pub struct EncodingContext {
    pub(crate) picture_id_manager: SeqManager<u16>,
    pub(crate) tl0_picture_index_manager: SeqManager<u8>,
    /// Set when the consumer spliced onto a new source stream; the next
    /// processed packet re-anchors both managers.
    pub sync_required: bool,
    current_temporal_layer: u8,
    target_temporal_layer: u8,
}

impl Default for EncodingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodingContext {
    pub fn new() -> Self {
        Self {
            picture_id_manager: SeqManager::new(),
            tl0_picture_index_manager: SeqManager::new(),
            sync_required: true,
            current_temporal_layer: 0,
            target_temporal_layer: MAX_TEMPORAL_LAYER,
        }
    }

    pub fn with_target_temporal_layer(mut self, layer: u8) -> Self {
        self.target_temporal_layer = layer.min(MAX_TEMPORAL_LAYER);
        self
    }

    pub fn set_target_temporal_layer(&mut self, layer: u8) {
        self.target_temporal_layer = layer.min(MAX_TEMPORAL_LAYER);
    }

    pub fn target_temporal_layer(&self) -> u8 {
        self.target_temporal_layer
    }

    pub fn current_temporal_layer(&self) -> u8 {
        self.current_temporal_layer
    }

    pub fn require_sync(&mut self) {
        self.sync_required = true;
    }
}

/// Parsed per-packet codec metadata.
#[derive(Debug, Clone)]
pub enum PayloadDescriptor {
    Vp8(vp8::PayloadDescriptor),
    H264(h264::PayloadDescriptor),
}

impl PayloadDescriptor {
    pub fn is_key_frame(&self) -> bool {
        match self {
            PayloadDescriptor::Vp8(d) => d.is_key_frame,
            PayloadDescriptor::H264(d) => d.is_key_frame,
        }
    }

    /// Runs the packet through a consumer's encoding context. Returns `false`
    /// when the packet must not be forwarded to this consumer; on `true` the
    /// remappable fields have been rewritten in `payload`.
    pub fn process(&self, context: &mut EncodingContext, payload: &mut [u8]) -> bool {
        match self {
            PayloadDescriptor::Vp8(d) => d.process(context, payload),
            PayloadDescriptor::H264(d) => d.process(context),
        }
    }

    /// Writes the original field values back into `payload`.
    pub fn restore(&self, payload: &mut [u8]) {
        if let PayloadDescriptor::Vp8(d) = self {
            d.restore(payload);
        }
    }
}

/// Parses (and, for VP8, normalises) the payload of a freshly received
/// packet. Returns `None` for codecs without a descriptor or when the
/// payload is malformed.
pub fn prepare(mime_type: &str, payload: &mut BytesMut) -> Option<PayloadDescriptor> {
    let mime = mime_type.to_ascii_lowercase();
    match mime.as_str() {
        "video/vp8" => vp8::prepare(payload).map(PayloadDescriptor::Vp8),
        "video/h264" => h264::parse(payload).map(PayloadDescriptor::H264),
        _ => None,
    }
}
