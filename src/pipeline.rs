//! Per-connection decoding pipeline.
//!
//! A pipeline feeds chunks through the assembler, validates and decodes
//! each candidate frame and hands measurement sets and diagnostics to a
//! [`Dispatch`] sink. Decode failures never stop it; the only way out of
//! [`run`] is a transport error, after which the caller builds a new
//! pipeline for the next connection.

use log::{debug, info, warn};
use std::sync::mpsc;

use crate::assembler::{CandidateFrame, FrameAssembler, FrameKind};
use crate::config::PipelineConfig;
use crate::dlms;
use crate::error::{DecodeError, TransportError};
use crate::hdlc;
use crate::meter::{DecodedField, MeasurementSet, MeterVariant};
use crate::normalize::Normalizer;
use crate::p1;
use crate::source::ByteSource;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Measurements(MeasurementSet),
    FrameRejected { reason: DecodeError },
    SyncLost { bytes_dropped: usize },
    VariantDetected { variant: MeterVariant },
}

/// Receives pipeline output. Must not block the pipeline.
pub trait Dispatch {
    fn dispatch(&mut self, event: PipelineEvent);
}

impl Dispatch for Vec<PipelineEvent> {
    fn dispatch(&mut self, event: PipelineEvent) {
        self.push(event);
    }
}

impl Dispatch for mpsc::Sender<PipelineEvent> {
    fn dispatch(&mut self, event: PipelineEvent) {
        if self.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

pub struct Pipeline {
    assembler: FrameAssembler,
    normalizer: Normalizer,
    variant: Option<MeterVariant>,
}

impl Pipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Pipeline {
            assembler: FrameAssembler::new(
                config.framing(),
                config.octet_stuffing(),
                config.max_buffer_span(),
            ),
            normalizer: Normalizer::new(config.scale()),
            variant: None,
        }
    }

    /// The list layout locked in by the last decoded frame.
    pub fn variant(&self) -> Option<MeterVariant> {
        self.variant
    }

    pub fn process_chunk<D: Dispatch + ?Sized>(&mut self, chunk: &[u8], out: &mut D) {
        self.assembler.feed(chunk);
        while let Some(candidate) = self.assembler.try_extract() {
            self.report_sync_lost(out);
            self.handle(candidate, out);
        }
        self.report_sync_lost(out);
    }

    fn report_sync_lost<D: Dispatch + ?Sized>(&mut self, out: &mut D) {
        if let Some(bytes_dropped) = self.assembler.take_sync_lost() {
            warn!(
                "Lost frame sync, dropped {} bytes (check framing mode and line settings)",
                bytes_dropped
            );
            out.dispatch(PipelineEvent::SyncLost { bytes_dropped });
        }
    }

    fn handle<D: Dispatch + ?Sized>(&mut self, candidate: CandidateFrame, out: &mut D) {
        debug!(
            "{:?} candidate ({} bytes): {}",
            candidate.kind,
            candidate.bytes.len(),
            hex(&candidate.bytes)
        );
        let decoded = match candidate.kind {
            FrameKind::Hdlc => {
                hdlc::decode_frame(&candidate.bytes).and_then(|apdu| self.decode_apdu(apdu))
            }
            FrameKind::Dlms => self.decode_apdu(&candidate.bytes),
            FrameKind::P1 => {
                p1::decode_telegram(&candidate.bytes).map(|fields| (MeterVariant::P1Ascii, fields))
            }
        };

        match decoded {
            Ok((variant, fields)) => {
                if self.variant != Some(variant) {
                    info!("Detected meter list layout: {}", variant);
                    self.variant = Some(variant);
                    out.dispatch(PipelineEvent::VariantDetected { variant });
                }
                let set = self.normalizer.normalize(variant, fields);
                out.dispatch(PipelineEvent::Measurements(set));
            }
            Err(reason) => {
                warn!("Rejected {:?} frame: {}", candidate.kind, reason);
                out.dispatch(PipelineEvent::FrameRejected { reason });
            }
        }
    }

    // A checksum-valid payload that fails to decode means the meter may
    // have switched layouts, so the next frame is detected afresh.
    fn decode_apdu(
        &mut self,
        apdu: &[u8],
    ) -> Result<(MeterVariant, Vec<DecodedField>), DecodeError> {
        match dlms::decode_payload(apdu, self.variant) {
            Ok(telegram) => Ok((telegram.variant, telegram.fields)),
            Err(e) => {
                if e.is_structural() {
                    if let Some(previous) = self.variant.take() {
                        info!("Forgetting list layout {} after: {}", previous, e);
                    }
                }
                Err(e)
            }
        }
    }
}

/// Drives a fresh pipeline from `source` until the source fails.
pub fn run<S, D>(source: &mut S, config: &PipelineConfig, out: &mut D) -> Result<(), TransportError>
where
    S: ByteSource + ?Sized,
    D: Dispatch + ?Sized,
{
    let mut pipeline = Pipeline::new(config);
    info!("Pipeline started ({:?} framing)", config.framing());
    loop {
        let chunk = source.next_chunk()?;
        pipeline.process_chunk(&chunk, out);
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FramingMode;
    use crate::dlms::build::*;
    use crate::hdlc::{encode_frame, FLAG};
    use crate::obis::Quantity;
    use proptest::prelude::*;

    const POWER_IMPORT: [u8; 6] = [1, 0, 1, 7, 0, 255];
    const VOLTAGE_L1: [u8; 6] = [1, 0, 32, 7, 0, 255];

    fn register_list(power: u32) -> Vec<u8> {
        notification(
            Some(CLOCK),
            array(vec![
                structure(vec![obis(POWER_IMPORT), u32v(power), scaler_unit_struct(0, 27)]),
                structure(vec![obis(VOLTAGE_L1), u16v(2301), scaler_unit_struct(-1, 35)]),
            ]),
        )
    }

    fn pair_list(power: u32) -> Vec<u8> {
        notification(
            None,
            structure(vec![text("Kamstrup_V0001"), obis(POWER_IMPORT), u32v(power)]),
        )
    }

    fn p1_telegram(power: &str) -> String {
        p1::with_checksum(&format!(
            "/ELL5\\253833635_A\r\n\r\n0-0:1.0.0(210217184019W)\r\n1-0:1.7.0({}*kW)\r\n!",
            power
        ))
    }

    fn pipeline(framing: FramingMode, scale: f64) -> Pipeline {
        Pipeline::new(&PipelineConfig::new(framing, scale, 8192).unwrap())
    }

    fn sets(events: &[PipelineEvent]) -> Vec<&MeasurementSet> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Measurements(set) => Some(set),
                _ => None,
            })
            .collect()
    }

    fn powers(events: &[PipelineEvent]) -> Vec<f64> {
        sets(events)
            .iter()
            .filter_map(|s| s.get(Quantity::ActivePowerImport).and_then(|m| m.number()))
            .collect()
    }

    fn stream(powers: &[u32]) -> Vec<u8> {
        powers
            .iter()
            .flat_map(|&p| encode_frame(&register_list(p), false))
            .collect()
    }

    #[test]
    fn frame_yields_variant_and_measurements() {
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&encode_frame(&register_list(1500), false), &mut events);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            PipelineEvent::VariantDetected {
                variant: MeterVariant::VariantA
            }
        );
        let set = sets(&events)[0];
        assert_eq!(set.variant(), MeterVariant::VariantA);
        assert!((set.get(Quantity::VoltageL1).unwrap().number().unwrap() - 230.1).abs() < 0.001);
        assert!(set.get(Quantity::MeterClock).is_some());
        assert_eq!(p.variant(), Some(MeterVariant::VariantA));
    }

    #[test]
    fn variant_reported_once() {
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&stream(&[1, 2, 3]), &mut events);
        let detected = events
            .iter()
            .filter(|e| matches!(e, PipelineEvent::VariantDetected { .. }))
            .count();
        assert_eq!(detected, 1);
        assert_eq!(powers(&events), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn scale_factor_applies_to_power() {
        let mut p = pipeline(FramingMode::Hdlc, 0.5);
        let mut events = Vec::new();
        p.process_chunk(&stream(&[1500]), &mut events);
        assert_eq!(powers(&events), vec![750.0]);
    }

    #[test]
    fn garbage_between_frames_is_rejected_and_recovered() {
        let mut bytes = encode_frame(&register_list(100), false);
        bytes.extend_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        bytes.extend(encode_frame(&register_list(200), false));
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&bytes, &mut events);
        assert_eq!(powers(&events), vec![100.0, 200.0]);
        assert!(events
            .iter()
            .any(|e| matches!(e, PipelineEvent::FrameRejected { .. })));
        // Framing noise does not unlock the detected layout.
        assert_eq!(p.variant(), Some(MeterVariant::VariantA));
    }

    #[test]
    fn layout_change_resets_variant() {
        let mut bytes = encode_frame(&register_list(1), false);
        bytes.extend(encode_frame(&pair_list(2), false));
        bytes.extend(encode_frame(&pair_list(3), false));
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&bytes, &mut events);

        assert_eq!(powers(&events), vec![1.0, 3.0]);
        assert!(matches!(
            events[2],
            PipelineEvent::FrameRejected {
                reason: DecodeError::UnknownStructure(_)
            }
        ));
        assert_eq!(
            events[3],
            PipelineEvent::VariantDetected {
                variant: MeterVariant::VariantB
            }
        );
        assert_eq!(p.variant(), Some(MeterVariant::VariantB));
    }

    #[test]
    fn checksum_error_keeps_variant() {
        let mut bad = encode_frame(&register_list(5), false);
        let n = bad.len();
        bad[n - 3] ^= 0x01;
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&stream(&[4]), &mut events);
        p.process_chunk(&bad, &mut events);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::FrameRejected {
                reason: DecodeError::ChecksumMismatch { .. }
            })
        ));
        assert_eq!(p.variant(), Some(MeterVariant::VariantA));
    }

    #[test]
    fn flagless_noise_reports_sync_lost() {
        let mut p = pipeline(FramingMode::Hdlc, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&vec![0x42; 9000], &mut events);
        assert_eq!(
            events,
            vec![PipelineEvent::SyncLost {
                bytes_dropped: 9000
            }]
        );
        p.process_chunk(&stream(&[7]), &mut events);
        assert_eq!(powers(&events), vec![7.0]);
    }

    #[test]
    fn bare_dlms_messages() {
        let mut p = pipeline(FramingMode::DlmsPayload, 1.0);
        let mut events = Vec::new();
        p.process_chunk(&pair_list(42), &mut events);
        p.process_chunk(&[0x0F, 0x00], &mut events);
        assert_eq!(powers(&events), vec![42.0]);
        assert!(matches!(
            events.last(),
            Some(PipelineEvent::FrameRejected { .. })
        ));
    }

    #[test]
    fn flagless_hdlc_frames() {
        let content: Vec<u8> = [10u32, 20]
            .iter()
            .flat_map(|&p| {
                let frame = encode_frame(&register_list(p), false);
                frame[1..frame.len() - 1].to_vec()
            })
            .collect();
        let mut p = pipeline(FramingMode::HdlcNoFlags, 1.0);
        let mut events = Vec::new();
        for chunk in content.chunks(9) {
            p.process_chunk(chunk, &mut events);
        }
        assert_eq!(powers(&events), vec![10.0, 20.0]);
    }

    #[test]
    fn p1_telegrams() {
        let telegram = p1_telegram("01.500");
        let mut p = pipeline(FramingMode::P1, 2.0);
        let mut events = Vec::new();
        for chunk in telegram.as_bytes().chunks(16) {
            p.process_chunk(chunk, &mut events);
        }
        assert_eq!(powers(&events), vec![3.0]);
        let set = sets(&events)[0];
        assert_eq!(set.variant(), MeterVariant::P1Ascii);
        assert_eq!(set.meter_info().unwrap().manufacturer, "ELL");
    }

    #[test]
    fn sender_dispatch() {
        let (mut tx, rx) = mpsc::channel();
        let mut p = Pipeline::new(&PipelineConfig::default());
        p.process_chunk(&stream(&[9]), &mut tx);
        drop(tx);
        let events: Vec<_> = rx.iter().collect();
        assert_eq!(powers(&events), vec![9.0]);
    }

    #[test]
    fn hex_dump_format() {
        assert_eq!(hex(&[0x7E, 0xA0, 0x01]), "7E A0 01");
    }

    proptest! {
        #[test]
        fn chunking_does_not_change_output(cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12)) {
            let bytes = stream(&[1500, 1600, 1700]);
            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len())).collect();
            points.sort_unstable();
            points.dedup();

            let mut p = pipeline(FramingMode::Hdlc, 1.0);
            let mut events = Vec::new();
            let mut last = 0;
            for point in points.into_iter().chain(std::iter::once(bytes.len())) {
                p.process_chunk(&bytes[last..point], &mut events);
                last = point;
            }
            prop_assert_eq!(powers(&events), vec![1500.0, 1600.0, 1700.0]);
            prop_assert_eq!(sets(&events).len(), 3);
        }

        #[test]
        fn resync_after_noise(noise in prop::collection::vec(any::<u8>().prop_map(|b| if b == FLAG { 0 } else { b }), 1..64)) {
            let mut bytes = encode_frame(&register_list(11), false);
            bytes.extend_from_slice(&noise);
            bytes.extend(encode_frame(&register_list(22), false));

            let mut p = pipeline(FramingMode::Hdlc, 1.0);
            let mut events = Vec::new();
            p.process_chunk(&bytes, &mut events);
            prop_assert_eq!(powers(&events), vec![11.0, 22.0]);
            prop_assert!(
                events.iter().any(|e| matches!(
                    e,
                    PipelineEvent::FrameRejected { .. } | PipelineEvent::SyncLost { .. }
                )),
                "expected a rejected frame or lost sync"
            );
        }

        #[test]
        fn single_bit_flip_never_yields_measurements(bit in any::<prop::sample::Index>()) {
            let mut frame = encode_frame(&register_list(1234), false);
            let at = bit.index(frame.len() * 8);
            frame[at / 8] ^= 1 << (at % 8);

            let mut p = pipeline(FramingMode::Hdlc, 1.0);
            let mut events = Vec::new();
            p.process_chunk(&frame, &mut events);
            prop_assert!(sets(&events).is_empty());
        }

        #[test]
        fn p1_resync_after_noise(
            noise in prop::collection::vec(prop::sample::select(b"x0.!/(*)\r\n".to_vec()), 1..48)
                .prop_filter("blank noise is dropped silently", |n| n.iter().any(|b| !b.is_ascii_whitespace()))
        ) {
            let mut bytes = p1_telegram("01.100").into_bytes();
            bytes.extend_from_slice(&noise);
            bytes.extend(p1_telegram("02.200").into_bytes());

            let mut p = pipeline(FramingMode::P1, 1.0);
            let mut events = Vec::new();
            for chunk in bytes.chunks(11) {
                p.process_chunk(chunk, &mut events);
            }
            prop_assert_eq!(sets(&events).len(), 2);
            let got = powers(&events);
            prop_assert_eq!(got.len(), 2);
            prop_assert!((got[0] - 1.1).abs() < 0.001);
            prop_assert!((got[1] - 2.2).abs() < 0.001);
            prop_assert!(
                events.iter().any(|e| matches!(e, PipelineEvent::FrameRejected { .. })),
                "expected the noise to be rejected"
            );
        }

        #[test]
        fn p1_bit_flip_in_checksummed_bytes_never_yields_measurements(bit in any::<prop::sample::Index>()) {
            let mut telegram = p1_telegram("01.500").into_bytes();
            let bang = telegram.iter().position(|&b| b == p1::END).unwrap();
            let at = bit.index((bang + 1) * 8);
            telegram[at / 8] ^= 1 << (at % 8);

            let mut p = pipeline(FramingMode::P1, 1.0);
            let mut events = Vec::new();
            p.process_chunk(&telegram, &mut events);
            prop_assert!(sets(&events).is_empty());
        }
    }
}
