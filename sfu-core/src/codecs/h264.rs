//! H264 payload inspection, RFC 6184.
//!
//! H264 carries nothing the SFU needs to remap, so the descriptor only
//! classifies the packet: NAL unit type and key-frame detection across the
//! single-NAL, STAP-A and FU-A packetisation modes.

use super::EncodingContext;

/// NAL unit type of an IDR slice.
const NAL_IDR: u8 = 5;
/// NAL unit type of a sequence parameter set.
const NAL_SPS: u8 = 7;
/// Single-time aggregation packet.
const NAL_STAP_A: u8 = 24;
/// Fragmentation unit.
const NAL_FU_A: u8 = 28;

#[derive(Debug, Clone, Default)]
pub struct PayloadDescriptor {
    /// Type of the (outer) NAL unit.
    pub nal_unit_type: u8,
    pub is_key_frame: bool,
}

fn nal_starts_key_frame(nal_type: u8) -> bool {
    nal_type == NAL_IDR || nal_type == NAL_SPS
}

pub fn parse(data: &[u8]) -> Option<PayloadDescriptor> {
    if data.is_empty() {
        return None;
    }

    let nal_unit_type = data[0] & 0x1F;
    let mut descriptor = PayloadDescriptor {
        nal_unit_type,
        is_key_frame: false,
    };

    match nal_unit_type {
        1..=23 => {
            descriptor.is_key_frame = nal_starts_key_frame(nal_unit_type);
        }
        NAL_STAP_A => {
            // Walk the aggregated NAL units: 2-byte size then the unit.
            let mut offset = 1usize;
            while offset + 2 < data.len() {
                let size = usize::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
                let nal = data[offset + 2] & 0x1F;
                if nal_starts_key_frame(nal) {
                    descriptor.is_key_frame = true;
                    break;
                }
                offset += 2 + size;
            }
        }
        NAL_FU_A => {
            if data.len() < 2 {
                return None;
            }
            let fu_header = data[1];
            let start = fu_header & 0x80 != 0;
            let fragmented_type = fu_header & 0x1F;
            descriptor.is_key_frame = start && nal_starts_key_frame(fragmented_type);
        }
        _ => {}
    }

    Some(descriptor)
}

impl PayloadDescriptor {
    /// H264 has no remappable fields; the context sync just waits for a key
    /// frame to consider the splice settled.
    pub(crate) fn process(&self, context: &mut EncodingContext) -> bool {
        if context.sync_required && self.is_key_frame {
            context.sync_required = false;
        }
        true
    }
}
