//! Error types for the decoding pipeline.
//!
//! Decode errors are local to one candidate frame: the frame is discarded,
//! a diagnostic event is raised and the pipeline keeps consuming bytes.
//! Transport errors end the pipeline run for that connection.

use thiserror::Error;

/// Reasons a candidate frame was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The frame check sequence (HDLC) or telegram CRC (P1) did not match.
    #[error("checksum mismatch: expected 0x{expected:04X}, calculated 0x{calculated:04X}")]
    ChecksumMismatch { expected: u16, calculated: u16 },

    /// A declared length runs past the end of the available bytes.
    #[error("truncated frame: needed {needed} bytes, {available} available")]
    TruncatedFrame { needed: usize, available: usize },

    /// The frame is well delimited but its content has an unexpected shape.
    #[error("unknown structure: {0}")]
    UnknownStructure(String),
}

impl DecodeError {
    pub fn structure(msg: impl Into<String>) -> Self {
        DecodeError::UnknownStructure(msg.into())
    }

    /// Whether this failure says something about the meter's list layout,
    /// as opposed to line noise.
    pub fn is_structural(&self) -> bool {
        !matches!(self, DecodeError::ChecksumMismatch { .. })
    }
}

/// Failure of the byte source feeding a pipeline.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// The source reached end of stream.
    #[error("connection closed by peer")]
    Closed,
}

/// Rejected configuration values.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("scale factor must be a positive number, got {0}")]
    InvalidScaleFactor(f64),

    #[error("maximum buffer span must be at least {min} bytes, got {got}")]
    BufferSpanTooSmall { min: usize, got: usize },
}
