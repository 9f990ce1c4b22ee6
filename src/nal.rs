//! Annex-B byte stream helpers
//!
//! Splits H.264/HEVC elementary streams into NAL units, groups them into
//! access units and tells keyframes apart from delta frames.

use crate::decoder::CodecKind;
use bytes::{BufMut, Bytes, BytesMut};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Split an Annex-B byte stream into NAL unit payloads (start codes removed)
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;

    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if let Some(s) = start {
                units.push(trim_trailing_zeros(&data[s..i]));
            }
            i += 3;
            start = Some(i);
        } else {
            i += 1;
        }
    }

    if let Some(s) = start {
        if s < data.len() {
            units.push(trim_trailing_zeros(&data[s..]));
        }
    }

    units.retain(|nal| !nal.is_empty());
    units
}

// A 4-byte start code leaves its leading zero on the previous unit
fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &nal[..end]
}

/// NAL unit type from the first header byte(s)
pub fn nal_type(codec: CodecKind, nal: &[u8]) -> Option<u8> {
    let header = *nal.first()?;
    Some(match codec {
        CodecKind::H264 => header & 0x1F,
        CodecKind::Hevc => (header >> 1) & 0x3F,
    })
}

/// NAL unit that makes the access unit decodable on its own
pub fn is_keyframe_nal(codec: CodecKind, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        // 5 = IDR, 7 = SPS
        (CodecKind::H264, Some(t)) => t == 5 || t == 7,
        // 16..=21 = IRAP (BLA/IDR/CRA), 32 = VPS
        (CodecKind::Hevc, Some(t)) => (16..=21).contains(&t) || t == 32,
        _ => false,
    }
}

/// Check if an Annex-B payload contains a keyframe
pub fn is_keyframe(codec: CodecKind, data: &[u8]) -> bool {
    split_annexb(data)
        .into_iter()
        .any(|nal| is_keyframe_nal(codec, nal))
}

fn is_vcl(codec: CodecKind, t: u8) -> bool {
    match codec {
        CodecKind::H264 => (1..=5).contains(&t),
        CodecKind::Hevc => t < 32,
    }
}

fn is_access_unit_delimiter(codec: CodecKind, t: u8) -> bool {
    match codec {
        CodecKind::H264 => t == 9,
        CodecKind::Hevc => t == 35,
    }
}

/// Non-VCL units that may only appear before the first slice of a picture
fn starts_new_picture_prefix(codec: CodecKind, t: u8) -> bool {
    match codec {
        // SEI, SPS, PPS
        CodecKind::H264 => matches!(t, 6..=8),
        // VPS, SPS, PPS, prefix SEI
        CodecKind::Hevc => matches!(t, 32..=34 | 39),
    }
}

/// First slice of a picture: first_mb_in_slice == 0 for H.264,
/// first_slice_segment_in_pic_flag for HEVC. Both are the first bit after
/// the NAL header.
fn is_first_slice(codec: CodecKind, nal: &[u8]) -> bool {
    let header_len = match codec {
        CodecKind::H264 => 1,
        CodecKind::Hevc => 2,
    };
    nal.get(header_len).is_some_and(|b| b & 0x80 != 0)
}

/// One decodable unit: every NAL of a single picture
#[derive(Debug, Clone, PartialEq)]
pub struct AccessUnit {
    /// Annex-B bytes with 4-byte start codes
    pub data: Bytes,
    pub is_keyframe: bool,
}

/// Group an Annex-B stream into access units
pub fn access_units(codec: CodecKind, data: &[u8]) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current = BytesMut::new();
    let mut has_vcl = false;
    let mut keyframe = false;

    for nal in split_annexb(data) {
        let Some(t) = nal_type(codec, nal) else {
            continue;
        };

        let boundary = has_vcl
            && (is_access_unit_delimiter(codec, t)
                || starts_new_picture_prefix(codec, t)
                || (is_vcl(codec, t) && is_first_slice(codec, nal)));

        if boundary {
            units.push(AccessUnit {
                data: current.split().freeze(),
                is_keyframe: keyframe,
            });
            has_vcl = false;
            keyframe = false;
        }

        current.put_slice(&START_CODE);
        current.put_slice(nal);
        has_vcl |= is_vcl(codec, t);
        keyframe |= is_keyframe_nal(codec, nal);
    }

    if !current.is_empty() {
        units.push(AccessUnit {
            data: current.freeze(),
            is_keyframe: keyframe,
        });
    }

    units
}
