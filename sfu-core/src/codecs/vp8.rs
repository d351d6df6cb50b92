//! VP8 payload descriptor, RFC 7741.
//!
//! ```text
//!        0 1 2 3 4 5 6 7
//!       +-+-+-+-+-+-+-+-+
//!       |X|R|N|S|R| PID | (REQUIRED)
//!       +-+-+-+-+-+-+-+-+
//!  X:   |I|L|T|K| RSV   | (OPTIONAL)
//!       +-+-+-+-+-+-+-+-+
//!  I:   |M| PictureID   | (OPTIONAL)
//!       +-+-+-+-+-+-+-+-+
//!  L:   |   TL0PICIDX   | (OPTIONAL)
//!       +-+-+-+-+-+-+-+-+
//!  T/K: |TID|Y| KEYIDX  | (OPTIONAL)
//!       +-+-+-+-+-+-+-+-+
//! ```

use super::EncodingContext;
use crate::sequence::SequenceNumber;
use bytes::BytesMut;

#[derive(Debug, Clone, Default)]
pub struct PayloadDescriptor {
    pub extended: bool,
    pub non_reference: bool,
    pub start: bool,
    pub partition_index: u8,

    pub i: bool,
    pub l: bool,
    pub t: bool,
    pub k: bool,

    pub has_picture_id: bool,
    pub has_one_byte_picture_id: bool,
    pub has_two_bytes_picture_id: bool,
    pub picture_id: u16,

    pub has_tl0_picture_index: bool,
    pub tl0_picture_index: u8,

    pub has_tl_index: bool,
    pub tl_index: u8,
    pub y: bool,
    pub key_index: u8,

    pub is_key_frame: bool,
}

/// Parses the 1..6 byte VP8 payload descriptor. Descriptors without the
/// extension byte carry nothing remappable and are rejected.
pub fn parse(data: &[u8]) -> Option<PayloadDescriptor> {
    if data.is_empty() {
        return None;
    }

    let mut descriptor = PayloadDescriptor::default();

    let mut offset = 0usize;
    let mut byte = data[offset];

    descriptor.extended = (byte >> 7) & 0x01 != 0;
    descriptor.non_reference = (byte >> 5) & 0x01 != 0;
    descriptor.start = (byte >> 4) & 0x01 != 0;
    descriptor.partition_index = byte & 0x07;

    if !descriptor.extended {
        return None;
    }

    offset += 1;
    if data.len() < offset + 1 {
        return None;
    }
    byte = data[offset];

    descriptor.i = (byte >> 7) & 0x01 != 0;
    descriptor.l = (byte >> 6) & 0x01 != 0;
    descriptor.t = (byte >> 5) & 0x01 != 0;
    descriptor.k = (byte >> 4) & 0x01 != 0;

    if descriptor.i {
        offset += 1;
        if data.len() < offset + 1 {
            return None;
        }
        byte = data[offset];

        if (byte >> 7) & 0x01 != 0 {
            offset += 1;
            if data.len() < offset + 1 {
                return None;
            }
            descriptor.has_two_bytes_picture_id = true;
            descriptor.picture_id = u16::from(byte & 0x7F) << 8;
            descriptor.picture_id += u16::from(data[offset]);
        } else {
            descriptor.has_one_byte_picture_id = true;
            descriptor.picture_id = u16::from(byte & 0x7F);
        }

        descriptor.has_picture_id = true;
    }

    if descriptor.l {
        offset += 1;
        if data.len() < offset + 1 {
            return None;
        }
        descriptor.has_tl0_picture_index = true;
        descriptor.tl0_picture_index = data[offset];
    }

    if descriptor.t || descriptor.k {
        offset += 1;
        if data.len() < offset + 1 {
            return None;
        }
        byte = data[offset];

        descriptor.has_tl_index = true;
        descriptor.tl_index = (byte >> 6) & 0x03;
        descriptor.y = (byte >> 5) & 0x01 != 0;
        descriptor.key_index = byte & 0x1F;
    }

    // First byte of the VP8 payload header: P bit clear means key frame.
    offset += 1;
    if data.len() >= offset + 1
        && descriptor.start
        && descriptor.partition_index == 0
        && data[offset] & 0x01 == 0
    {
        descriptor.is_key_frame = true;
    }

    Some(descriptor)
}

/// Parses the descriptor and normalises a one-byte pictureId to the
/// two-byte form in place, so later rewrites always have room.
pub(crate) fn prepare(payload: &mut BytesMut) -> Option<PayloadDescriptor> {
    let mut descriptor = parse(payload)?;

    if descriptor.has_one_byte_picture_id {
        // Shift the payload one byte from the beginning of the pictureId
        // field and set the two-byte marker bit.
        let old_len = payload.len();
        payload.resize(old_len + 1, 0);
        payload.copy_within(2..old_len, 3);
        payload[2] = 0x80;

        descriptor.has_one_byte_picture_id = false;
        descriptor.has_two_bytes_picture_id = true;
    }

    Some(descriptor)
}

impl PayloadDescriptor {
    /// Writes `picture_id` and `tl0_picture_index` into the descriptor
    /// region of `data`.
    pub fn encode(&self, data: &mut [u8], picture_id: u16, tl0_picture_index: u8) {
        if !self.extended {
            return;
        }

        let mut offset = 2usize;

        if self.i {
            if self.has_two_bytes_picture_id {
                data[offset] = ((picture_id >> 8) as u8 & 0x7F) | 0x80;
                data[offset + 1] = (picture_id & 0xFF) as u8;
                offset += 2;
            } else if self.has_one_byte_picture_id {
                data[offset] = (picture_id & 0x7F) as u8;
                offset += 1;
            }
        }

        if self.l {
            data[offset] = tl0_picture_index;
        }
    }

    /// Temporal-layer selection and field remapping for one consumer.
    pub(crate) fn process(&self, context: &mut EncodingContext, data: &mut [u8]) -> bool {
        // Re-anchor both managers when the consumer spliced streams.
        if context.sync_required && self.has_picture_id && self.has_tl0_picture_index {
            context
                .picture_id_manager
                .sync(self.picture_id.wrapping_sub(1));
            context
                .tl0_picture_index_manager
                .sync(self.tl0_picture_index.wrapping_sub(1));

            context.sync_required = false;
        }

        // A key frame carries every layer; jump straight to the target.
        if self.is_key_frame {
            context.current_temporal_layer = context.target_temporal_layer;
        }

        // Incremental pictureId: apply the temporal-layer filter.
        if self.has_picture_id
            && self.has_tl_index
            && self.has_tl0_picture_index
            && self
                .picture_id
                .is_higher_than(context.picture_id_manager.max_input())
        {
            if self.tl_index > context.target_temporal_layer {
                context.picture_id_manager.drop_input(self.picture_id);
                context
                    .tl0_picture_index_manager
                    .drop_input(self.tl0_picture_index);

                return false;
            } else if self.tl_index > context.current_temporal_layer && !self.y {
                // Upgrade required but this packet is not a layer-sync point.
                context.picture_id_manager.drop_input(self.picture_id);
                context
                    .tl0_picture_index_manager
                    .drop_input(self.tl0_picture_index);

                return false;
            }
        }

        let mut picture_id = self.picture_id;
        let mut tl0_picture_index = self.tl0_picture_index;

        // Do not send a dropped pictureId.
        if self.has_picture_id {
            match context.picture_id_manager.input(self.picture_id) {
                Some(mapped) => picture_id = mapped,
                None => return false,
            }
        }

        // Do not send a dropped tl0PictureIndex.
        if self.has_tl0_picture_index {
            match context.tl0_picture_index_manager.input(self.tl0_picture_index) {
                Some(mapped) => tl0_picture_index = mapped,
                None => return false,
            }
        }

        // Update/fix the current temporal layer.
        if self.has_tl_index && self.tl_index > context.current_temporal_layer {
            context.current_temporal_layer = self.tl_index;
        }
        if context.current_temporal_layer > context.target_temporal_layer {
            context.current_temporal_layer = context.target_temporal_layer;
        }

        if self.has_picture_id && self.has_tl0_picture_index {
            self.encode(data, picture_id, tl0_picture_index);
        }

        true
    }

    /// Writes the original pictureId and tl0PictureIndex back.
    pub(crate) fn restore(&self, data: &mut [u8]) {
        if self.has_picture_id && self.has_tl0_picture_index {
            self.encode(data, self.picture_id, self.tl0_picture_index);
        }
    }
}
