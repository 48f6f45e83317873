//! Decoding pipeline for smart meter HAN port telegrams: HDLC framed
//! DLMS/COSEM data notifications and P1 ASCII telegrams.

pub mod assembler;
pub mod config;
pub mod crc16;
pub mod dlms;
pub mod error;
pub mod hdlc;
pub mod meter;
pub mod normalize;
pub mod obis;
pub mod p1;
pub mod pipeline;
pub mod source;
