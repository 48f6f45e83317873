//! HDLC framing (IEC 62056-46 frame format type 3).
//!
//! ```text
//! Flag | Format(2) | Dest addr | Src addr | Ctrl | HCS(2) | LLC(3) | Info | FCS(2) | Flag
//! ```
//!
//! The format field holds the type nibble 0xA, the segmentation bit and an
//! 11-bit length counting every byte between the flags. Both check sequences
//! are CRC-16/X.25, transmitted least significant byte first.

use crate::crc16;
use crate::error::DecodeError;

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

pub const FORMAT_TYPE_3: u8 = 0xA0;
const FORMAT_TYPE_MASK: u8 = 0xF0;
const SEGMENTATION_BIT: u8 = 0x08;

/// Format(2) + one-byte addresses + Ctrl + FCS(2).
pub const MIN_FRAME_LEN: usize = 7;
/// Largest length the 11-bit format field can express.
pub const MAX_FRAME_LEN: usize = 0x7FF;

const MAX_ADDRESS_LEN: usize = 4;
const LLC_HEADER: [u8; 3] = [0xE6, 0xE7, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdlcHeader {
    pub length: usize,
    pub segmented: bool,
    pub destination: u32,
    pub source: u32,
    pub control: u8,
    /// Bytes from the format field through the control field.
    pub header_len: usize,
}

/// The frame length declared by a format field at the start of `content`,
/// or `None` when the bytes don't look like a type 3 format field.
pub fn declared_length(content: &[u8]) -> Option<usize> {
    match content {
        [f0, f1, ..] if f0 & FORMAT_TYPE_MASK == FORMAT_TYPE_3 => {
            Some((((f0 & 0x07) as usize) << 8) | *f1 as usize)
        }
        _ => None,
    }
}

pub fn parse_header(content: &[u8]) -> Result<HdlcHeader, DecodeError> {
    let length = declared_length(content)
        .ok_or_else(|| DecodeError::structure("not an HDLC type 3 format field"))?;
    let segmented = content[0] & SEGMENTATION_BIT != 0;

    let (destination, dest_len) = parse_address(&content[2..])?;
    let (source, src_len) = parse_address(&content[2 + dest_len..])?;
    let ctrl_at = 2 + dest_len + src_len;
    let control = *content.get(ctrl_at).ok_or(DecodeError::TruncatedFrame {
        needed: ctrl_at + 1,
        available: content.len(),
    })?;

    Ok(HdlcHeader {
        length,
        segmented,
        destination,
        source,
        control,
        header_len: ctrl_at + 1,
    })
}

// Addresses are 1-4 bytes; the low bit marks the last byte.
fn parse_address(bytes: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut value = 0u32;
    for (i, b) in bytes.iter().take(MAX_ADDRESS_LEN).enumerate() {
        value = (value << 7) | (b >> 1) as u32;
        if b & 0x01 == 1 {
            return Ok((value, i + 1));
        }
    }
    if bytes.len() < MAX_ADDRESS_LEN {
        Err(DecodeError::TruncatedFrame {
            needed: bytes.len() + 1,
            available: bytes.len(),
        })
    } else {
        Err(DecodeError::structure("HDLC address longer than 4 bytes"))
    }
}

/// Validates that the header check sequence following the header matches.
/// Returns `Ok(false)` when the frame is too short to carry one.
pub fn header_check_ok(content: &[u8], header: &HdlcHeader) -> bool {
    let end = header.header_len + 2;
    match content.get(header.header_len..end) {
        Some(hcs) => {
            u16::from_le_bytes([hcs[0], hcs[1]]) == crc16::x25(&content[..header.header_len])
        }
        None => false,
    }
}

/// Validates a frame (flags removed, unescaped) and returns its information
/// field with the LLC header stripped.
pub fn decode_frame(content: &[u8]) -> Result<&[u8], DecodeError> {
    if content.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TruncatedFrame {
            needed: MIN_FRAME_LEN,
            available: content.len(),
        });
    }

    let header = parse_header(content)?;
    if header.length > content.len() {
        return Err(DecodeError::TruncatedFrame {
            needed: header.length,
            available: content.len(),
        });
    }
    if header.length < content.len() {
        return Err(DecodeError::structure(format!(
            "frame declares {} bytes but carries {}",
            header.length,
            content.len()
        )));
    }

    let body_end = content.len() - 2;
    let expected = u16::from_le_bytes([content[body_end], content[body_end + 1]]);
    let calculated = crc16::x25(&content[..body_end]);
    if expected != calculated {
        return Err(DecodeError::ChecksumMismatch {
            expected,
            calculated,
        });
    }

    if header.segmented {
        return Err(DecodeError::structure("segmented HDLC frames are not supported"));
    }

    let info_start = header.header_len + 2;
    if info_start > body_end {
        return Err(DecodeError::structure("frame has no information field"));
    }
    let hcs_expected = u16::from_le_bytes([
        content[header.header_len],
        content[header.header_len + 1],
    ]);
    let hcs_calculated = crc16::x25(&content[..header.header_len]);
    if hcs_expected != hcs_calculated {
        return Err(DecodeError::ChecksumMismatch {
            expected: hcs_expected,
            calculated: hcs_calculated,
        });
    }

    let info = &content[info_start..body_end];
    Ok(info.strip_prefix(&LLC_HEADER[..]).unwrap_or(info))
}

/// Removes octet stuffing (0x7D escapes) from frame content.
pub fn unstuff(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut escaped = false;
    for &b in bytes {
        if escaped {
            out.push(b ^ ESCAPE_XOR);
            escaped = false;
        } else if b == ESCAPE {
            escaped = true;
        } else {
            out.push(b);
        }
    }
    out
}

/// Builds a complete flagged frame around a DLMS APDU. Used to fabricate
/// test telegrams with correct check sequences.
#[cfg(test)]
pub(crate) fn encode_frame(apdu: &[u8], stuffed: bool) -> Vec<u8> {
    let mut header = vec![0u8, 0u8, 0x03, 0x41, 0x13];
    let mut info = LLC_HEADER.to_vec();
    info.extend_from_slice(apdu);
    let length = header.len() + 2 + info.len() + 2;
    header[0] = FORMAT_TYPE_3 | ((length >> 8) as u8 & 0x07);
    header[1] = length as u8;

    let mut content = header.clone();
    content.extend_from_slice(&crc16::x25(&header).to_le_bytes());
    content.extend_from_slice(&info);
    let fcs = crc16::x25(&content);
    content.extend_from_slice(&fcs.to_le_bytes());

    let mut out = vec![FLAG];
    for b in content {
        if stuffed && (b == FLAG || b == ESCAPE) {
            out.push(ESCAPE);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
    }
    out.push(FLAG);
    out
}
