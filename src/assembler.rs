//! Turns an arbitrarily chunked byte stream into candidate frames.
//!
//! The assembler owns the rolling buffer for one connection. Every
//! candidate it returns has been removed from the buffer, so a candidate
//! that later fails validation is never offered again; scanning resumes
//! from its closing boundary.

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use std::collections::VecDeque;

use crate::config::FramingMode;
use crate::crc16;
use crate::error::DecodeError;
use crate::hdlc::{self, FLAG};
use crate::p1;

/// Which decoder a candidate belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// HDLC frame content, flags removed and unescaped.
    Hdlc,
    /// A bare DLMS APDU.
    Dlms,
    /// A complete ASCII telegram including its checksum line.
    P1,
}

/// A delimited byte range that has not been validated yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFrame {
    pub kind: FrameKind,
    pub bytes: Bytes,
}

enum Boundary {
    /// Closing marker found at this index.
    At(usize),
    Incomplete,
}

pub struct FrameAssembler {
    mode: FramingMode,
    octet_stuffing: bool,
    max_span: usize,
    buf: BytesMut,
    messages: VecDeque<Bytes>,
    /// Bytes skipped while hunting for a frame start since the last candidate.
    skipped: usize,
    sync_lost: usize,
}

impl FrameAssembler {
    pub fn new(mode: FramingMode, octet_stuffing: bool, max_span: usize) -> Self {
        FrameAssembler {
            mode,
            octet_stuffing,
            max_span,
            buf: BytesMut::with_capacity(max_span.min(4096)),
            messages: VecDeque::new(),
            skipped: 0,
            sync_lost: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        match self.mode {
            FramingMode::DlmsPayload => self.messages.push_back(Bytes::copy_from_slice(chunk)),
            _ => self.buf.extend_from_slice(chunk),
        }
    }

    /// Removes and returns the next complete candidate, or `None` once the
    /// buffer holds at most one partial frame.
    pub fn try_extract(&mut self) -> Option<CandidateFrame> {
        let frame = match self.mode {
            FramingMode::Hdlc => self.extract_flagged(),
            FramingMode::HdlcNoFlags => self.extract_length_prefixed(),
            FramingMode::DlmsPayload => self.messages.pop_front().map(|bytes| CandidateFrame {
                kind: FrameKind::Dlms,
                bytes,
            }),
            FramingMode::P1 => self.extract_telegram(),
        };
        if frame.is_none() {
            self.enforce_bound();
        }
        frame
    }

    /// Bytes discarded without ever forming a candidate since the last call.
    pub fn take_sync_lost(&mut self) -> Option<usize> {
        match std::mem::take(&mut self.sync_lost) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn extract_flagged(&mut self) -> Option<CandidateFrame> {
        loop {
            let start = self.buf.iter().position(|&b| b == FLAG)?;
            if start > 0 {
                self.discard(start);
            }
            // Back-to-back flags: the first one closes nothing.
            if self.buf.get(1) == Some(&FLAG) {
                self.buf.advance(1);
                continue;
            }
            let end = match self.closing_flag() {
                Boundary::At(end) => end,
                Boundary::Incomplete => return None,
            };
            self.synced();
            let mut span = self.buf.split_to(end);
            span.advance(1);
            let bytes = if self.octet_stuffing {
                Bytes::from(hdlc::unstuff(&span))
            } else {
                span.freeze()
            };
            return Some(CandidateFrame {
                kind: FrameKind::Hdlc,
                bytes,
            });
        }
    }

    // buf[0] is the opening flag. Without octet stuffing a 0x7E may be
    // frame content, so a flag inside the declared length only ends the
    // frame when a valid header follows it.
    fn closing_flag(&self) -> Boundary {
        let mut flags = self
            .buf
            .iter()
            .enumerate()
            .skip(1)
            .filter(|&(_, &b)| b == FLAG)
            .map(|(i, _)| i);
        if self.octet_stuffing {
            return flags.next().map_or(Boundary::Incomplete, Boundary::At);
        }

        let declared = hdlc::declared_length(&self.buf[1..])
            .filter(|&len| (hdlc::MIN_FRAME_LEN..=hdlc::MAX_FRAME_LEN).contains(&len));
        if let Some(len) = declared {
            if self.buf.get(len + 1) == Some(&FLAG) && fcs_matches(&self.buf[1..=len]) {
                return Boundary::At(len + 1);
            }
        }

        for at in flags {
            match declared {
                Some(len) if at - 1 < len => match self.header_follows(at) {
                    Some(true) => return Boundary::At(at),
                    Some(false) => continue,
                    None => return Boundary::Incomplete,
                },
                _ => return Boundary::At(at),
            }
        }
        Boundary::Incomplete
    }

    /// Whether a valid HDLC header starts after the flag at `at`. `None`
    /// until enough bytes have arrived to tell.
    fn header_follows(&self, at: usize) -> Option<bool> {
        let rest = &self.buf[at + 1..];
        let rest = match rest.iter().position(|&b| b != FLAG) {
            Some(first) => &rest[first..],
            None => return None,
        };
        header_state(rest)
    }

    fn extract_length_prefixed(&mut self) -> Option<CandidateFrame> {
        loop {
            let candidate_len = match header_state(&self.buf) {
                None => return None,
                Some(true) => hdlc::declared_length(&self.buf)?,
                Some(false) => {
                    self.discard(1);
                    continue;
                }
            };
            if self.buf.len() < candidate_len {
                return None;
            }
            self.synced();
            let bytes = self.buf.split_to(candidate_len).freeze();
            return Some(CandidateFrame {
                kind: FrameKind::Hdlc,
                bytes,
            });
        }
    }

    // A telegram runs from `/` to the first line end after its `!`. A `/`
    // seen before that closes the current candidate early, so a damaged
    // telegram never swallows the next one. Bytes between telegrams become
    // their own candidate unless they are blank.
    fn extract_telegram(&mut self) -> Option<CandidateFrame> {
        loop {
            let start = self.buf.iter().position(|&b| b == p1::START)?;
            if start > 0 {
                if self.buf[..start].iter().all(u8::is_ascii_whitespace) {
                    self.discard(start);
                    continue;
                }
                return Some(self.telegram_candidate(start));
            }

            let next_start = self.buf[1..]
                .iter()
                .position(|&b| b == p1::START)
                .map(|at| at + 1);
            let limit = next_start.unwrap_or(self.buf.len());
            let end = match self.buf[..limit].iter().position(|&b| b == p1::END) {
                Some(bang) => match self.buf[bang..limit].iter().position(|&b| b == b'\n') {
                    Some(newline) => bang + newline + 1,
                    None => next_start?,
                },
                None => next_start?,
            };
            return Some(self.telegram_candidate(end));
        }
    }

    fn telegram_candidate(&mut self, len: usize) -> CandidateFrame {
        self.synced();
        CandidateFrame {
            kind: FrameKind::P1,
            bytes: self.buf.split_to(len).freeze(),
        }
    }

    /// Drops `n` leading bytes that belong to no frame. A long enough run
    /// of them without a frame in between counts as lost sync.
    fn discard(&mut self, n: usize) {
        self.buf.advance(n);
        self.skipped += n;
        if self.skipped > self.max_span {
            self.sync_lost += std::mem::take(&mut self.skipped);
        }
    }

    fn synced(&mut self) {
        if self.skipped > 0 {
            debug!("Skipped {} bytes before frame start", self.skipped);
            self.skipped = 0;
        }
    }

    // Keeps the newest possible frame start; everything older is dropped.
    fn enforce_bound(&mut self) {
        if self.buf.len() <= self.max_span {
            return;
        }
        let marker = match self.mode {
            FramingMode::Hdlc => FLAG,
            FramingMode::P1 => p1::START,
            FramingMode::HdlcNoFlags | FramingMode::DlmsPayload => return,
        };
        let keep_from = match self.buf.iter().rposition(|&b| b == marker) {
            Some(at) if at > 0 && self.buf.len() - at <= self.max_span => at,
            _ => self.buf.len(),
        };
        self.buf.advance(keep_from);
        self.sync_lost += keep_from;
    }
}

/// Classifies the bytes at a would-be frame start: `Some(true)` for a
/// type 3 header with a matching HCS, `Some(false)` when the bytes cannot
/// be one, `None` when more bytes are needed.
fn header_state(bytes: &[u8]) -> Option<bool> {
    let first = *bytes.first()?;
    if first & 0xF0 != hdlc::FORMAT_TYPE_3 {
        return Some(false);
    }
    let len = hdlc::declared_length(bytes)?;
    if !(hdlc::MIN_FRAME_LEN..=hdlc::MAX_FRAME_LEN).contains(&len) {
        return Some(false);
    }
    match hdlc::parse_header(bytes) {
        Ok(header) if bytes.len() >= header.header_len + 2 => {
            Some(hdlc::header_check_ok(bytes, &header))
        }
        Ok(_) | Err(DecodeError::TruncatedFrame { .. }) => None,
        Err(_) => Some(false),
    }
}

fn fcs_matches(content: &[u8]) -> bool {
    let body_end = content.len() - 2;
    u16::from_le_bytes([content[body_end], content[body_end + 1]])
        == crc16::x25(&content[..body_end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hdlc::encode_frame;

    const APDU: &[u8] = &[0x0F, 0x40, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x06, 0x00, 0x00, 0x05, 0xDC];

    fn drain(asm: &mut FrameAssembler) -> Vec<CandidateFrame> {
        std::iter::from_fn(|| asm.try_extract()).collect()
    }

    fn content_of(frame: &[u8]) -> &[u8] {
        &frame[1..frame.len() - 1]
    }

    #[test]
    fn extracts_single_frame() {
        let frame = encode_frame(APDU, false);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 8192);
        asm.feed(&frame);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, FrameKind::Hdlc);
        assert_eq!(&frames[0].bytes[..], content_of(&frame));
        // Closing flag stays as the next opening flag.
        assert_eq!(asm.buffered(), 1);
    }

    #[test]
    fn waits_for_split_frame() {
        let frame = encode_frame(APDU, false);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 8192);
        asm.feed(&frame[..10]);
        assert!(asm.try_extract().is_none());
        asm.feed(&frame[10..]);
        assert!(asm.try_extract().is_some());
    }

    #[test]
    fn skips_leading_partial_frame() {
        let frame = encode_frame(APDU, false);
        let mut stream = vec![0x12, 0x34, 0x56];
        stream.extend_from_slice(&frame);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 8192);
        asm.feed(&stream);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].bytes[..], content_of(&frame));
        assert_eq!(asm.take_sync_lost(), None);
    }

    #[test]
    fn flag_inside_unstuffed_content_is_data() {
        let apdu = [0x0F, 0x7E, 0x00, 0x00, 0x00, 0x00, 0x02, 0x01, 0x11, 0x7E];
        let frame = encode_frame(&apdu, false);
        let mut stream = frame.clone();
        stream.extend_from_slice(&frame);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 8192);
        asm.feed(&stream);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| &f.bytes[..] == content_of(&frame)));
    }

    #[test]
    fn stuffed_frames_are_unescaped() {
        let apdu = [0x0F, 0x7E, 0x7D, 0x00, 0x00, 0x00, 0x02, 0x00];
        let frame = encode_frame(&apdu, true);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, true, 8192);
        asm.feed(&frame);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 1);
        assert_eq!(hdlc::decode_frame(&frames[0].bytes).unwrap(), &apdu[..]);
    }

    #[test]
    fn garbage_between_frames_becomes_its_own_candidate() {
        let frame = encode_frame(APDU, false);
        let mut stream = frame.clone();
        stream.extend_from_slice(&[0x01, 0x02, 0x03]);
        stream.extend_from_slice(&frame);
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 8192);
        asm.feed(&stream);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1].bytes[..], &[0x01, 0x02, 0x03][..]);
        assert_eq!(&frames[2].bytes[..], content_of(&frame));
    }

    #[test]
    fn flagless_noise_reports_sync_lost() {
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 4096);
        asm.feed(&vec![0x55; 5000]);
        assert!(asm.try_extract().is_none());
        assert_eq!(asm.take_sync_lost(), Some(5000));
        assert_eq!(asm.take_sync_lost(), None);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn bound_keeps_latest_flag() {
        let mut asm = FrameAssembler::new(FramingMode::Hdlc, false, 4096);
        let mut noise = vec![0x55; 5000];
        noise[4990] = FLAG;
        asm.feed(&noise);
        // Noise after the first flag is a single unterminated candidate.
        assert!(asm.try_extract().is_none());
        assert_eq!(asm.take_sync_lost(), Some(4990));
        assert_eq!(asm.buffered(), 10);
    }

    #[test]
    fn length_prefixed_frames_without_flags() {
        let frame = encode_frame(APDU, false);
        let content = content_of(&frame);
        let mut stream = vec![0xA5, 0x00, 0x13];
        stream.extend_from_slice(content);
        stream.extend_from_slice(content);
        let mut asm = FrameAssembler::new(FramingMode::HdlcNoFlags, false, 8192);
        for chunk in stream.chunks(5) {
            asm.feed(chunk);
        }
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| &f.bytes[..] == content));
    }

    #[test]
    fn length_prefixed_tolerates_flags() {
        let frame = encode_frame(APDU, false);
        let mut asm = FrameAssembler::new(FramingMode::HdlcNoFlags, false, 8192);
        asm.feed(&frame);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].bytes[..], content_of(&frame));
    }

    #[test]
    fn dlms_payload_keeps_message_boundaries() {
        let mut asm = FrameAssembler::new(FramingMode::DlmsPayload, false, 8192);
        asm.feed(&[0x0F, 0x01]);
        asm.feed(&[]);
        asm.feed(&[0x0F, 0x02]);
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, FrameKind::Dlms);
        assert_eq!(&frames[1].bytes[..], &[0x0F, 0x02][..]);
    }

    const TELEGRAM_BODY: &str = "/ABC5\\2meter\r\n\r\n1-0:1.7.0(01.500*kW)\r\n!";

    #[test]
    fn garbage_before_telegram_is_its_own_candidate() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        let mut stream = b"1-0:2.7.0(00.000*kW)\r\n!0000\r\nxx".to_vec();
        stream.extend_from_slice(telegram.as_bytes());
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        for chunk in stream.chunks(7) {
            asm.feed(chunk);
        }
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].bytes[..], &stream[..stream.len() - telegram.len()]);
        assert_eq!(frames[1].kind, FrameKind::P1);
        assert_eq!(&frames[1].bytes[..], telegram.as_bytes());
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn blank_lines_between_telegrams_are_dropped() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        let stream = format!("{}\r\n\r\n{}", telegram, telegram);
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        asm.feed(stream.as_bytes());
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| &f.bytes[..] == telegram.as_bytes()));
    }

    #[test]
    fn stray_end_marker_does_not_swallow_next_telegram() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        let stream = format!("{}x!y{}", telegram, telegram);
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        for chunk in stream.as_bytes().chunks(5) {
            asm.feed(chunk);
        }
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0].bytes[..], telegram.as_bytes());
        assert_eq!(&frames[1].bytes[..], b"x!y");
        assert_eq!(&frames[2].bytes[..], telegram.as_bytes());
    }

    #[test]
    fn telegram_with_damaged_line_end_stops_at_next_start() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        // Final '\n' lost on the line.
        let damaged = format!("{}\r", telegram.trim_end());
        let stream = format!("{}{}{}", telegram, damaged, telegram);
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        asm.feed(stream.as_bytes());
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[1].bytes[..], damaged.as_bytes());
        assert_eq!(&frames[2].bytes[..], telegram.as_bytes());
    }

    #[test]
    fn truncated_telegram_stops_at_next_start() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        let stream = format!("/ABC5\\2met{}", telegram);
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        asm.feed(stream.as_bytes());
        let frames = drain(&mut asm);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0].bytes[..], b"/ABC5\\2met");
        assert_eq!(&frames[1].bytes[..], telegram.as_bytes());
    }

    #[test]
    fn telegram_waits_for_checksum_line() {
        let telegram = p1::with_checksum(TELEGRAM_BODY);
        let cut = telegram.len() - 3;
        let mut asm = FrameAssembler::new(FramingMode::P1, false, 8192);
        asm.feed(&telegram.as_bytes()[..cut]);
        assert!(asm.try_extract().is_none());
        asm.feed(&telegram.as_bytes()[cut..]);
        assert!(asm.try_extract().is_some());
    }
}
