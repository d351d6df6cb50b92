//! The packet shape flowing from a producer to its consumers.

use crate::codecs::PayloadDescriptor;
use bytes::BytesMut;

/// A received media packet, borrowed by every subscribed consumer for the
/// duration of one fan-out.
///
/// The payload is mutable: a consumer rewrites the codec's remappable fields
/// in place before copying the packet out, then restores them so the next
/// consumer sees the original values. Header rewrites never touch this
/// struct; each consumer stamps its own copy of the header.
pub struct MediaPacket {
    pub header: rtp::header::Header,
    pub payload: BytesMut,
    pub descriptor: Option<PayloadDescriptor>,
}

impl MediaPacket {
    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.header.payload_type
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn timestamp(&self) -> u32 {
        self.header.timestamp
    }

    pub fn is_key_frame(&self) -> bool {
        self.descriptor
            .as_ref()
            .map(|d| d.is_key_frame())
            .unwrap_or(false)
    }
}
