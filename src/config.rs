use clap::{ArgGroup, Parser, ValueEnum};
use std::time::Duration;

use crate::error::ConfigError;
use crate::hdlc;
use crate::normalize::ScaleConfig;

/// Smallest rolling buffer that can still hold the longest HDLC frame
/// plus both flags.
pub const MIN_BUFFER_SPAN: usize = hdlc::MAX_FRAME_LEN + 2;
pub const DEFAULT_BUFFER_SPAN: usize = 8192;

/// How frames are delimited on a connection. Chosen per connection, never
/// guessed per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FramingMode {
    /// HDLC frames between 0x7E flags.
    Hdlc,
    /// HDLC frames without flags; length comes from the format field.
    HdlcNoFlags,
    /// One bare DLMS APDU per message.
    #[value(name = "dlms")]
    DlmsPayload,
    /// ASCII telegrams from `/` to `!` plus checksum line.
    P1,
}

/// Immutable settings for one decoding pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    framing: FramingMode,
    octet_stuffing: bool,
    scale: ScaleConfig,
    max_buffer_span: usize,
}

impl PipelineConfig {
    pub fn new(
        framing: FramingMode,
        scale_factor: f64,
        max_buffer_span: usize,
    ) -> Result<Self, ConfigError> {
        if max_buffer_span < MIN_BUFFER_SPAN {
            return Err(ConfigError::BufferSpanTooSmall {
                min: MIN_BUFFER_SPAN,
                got: max_buffer_span,
            });
        }
        Ok(PipelineConfig {
            framing,
            octet_stuffing: false,
            scale: ScaleConfig::new(scale_factor)?,
            max_buffer_span,
        })
    }

    /// Enables 0x7D escaping inside flagged HDLC frames.
    pub fn with_octet_stuffing(mut self, enabled: bool) -> Self {
        self.octet_stuffing = enabled;
        self
    }

    pub fn framing(&self) -> FramingMode {
        self.framing
    }

    pub fn octet_stuffing(&self) -> bool {
        self.octet_stuffing
    }

    pub fn scale(&self) -> ScaleConfig {
        self.scale
    }

    pub fn max_buffer_span(&self) -> usize {
        self.max_buffer_span
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            framing: FramingMode::Hdlc,
            octet_stuffing: false,
            scale: ScaleConfig::default(),
            max_buffer_span: DEFAULT_BUFFER_SPAN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Parity {
    #[value(name = "N")]
    None,
    #[value(name = "E")]
    Even,
    #[value(name = "O")]
    Odd,
}

#[derive(Parser, Debug)]
#[command(
    name = "hanport",
    about = "Smart meter HAN port reader (HDLC/DLMS and P1 telegrams)"
)]
#[command(group(
    ArgGroup::new("source")
        .required(true)
        .args(["serial", "tcp", "mqtt_host"])
))]
pub struct Config {
    /// Serial port path of the HAN adapter
    #[arg(long)]
    pub serial: Option<String>,

    /// TCP address (host:port) of a serial-to-network bridge
    #[arg(long)]
    pub tcp: Option<String>,

    /// MQTT broker hostname to subscribe to
    #[arg(long)]
    pub mqtt_host: Option<String>,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "hanport")]
    pub mqtt_client_id: String,

    /// MQTT topics carrying meter payloads (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "han/raw")]
    pub mqtt_topics: Vec<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 2400)]
    pub baud_rate: u32,

    /// Serial parity
    #[arg(long, value_enum, default_value = "N")]
    pub parity: Parity,

    /// Serial data bits
    #[arg(long, default_value_t = 8, value_parser = clap::value_parser!(u8).range(5..=8))]
    pub data_bits: u8,

    /// Serial stop bits
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    pub stop_bits: u8,

    /// Frame delimiting used by the source
    #[arg(long, value_enum, default_value = "hdlc")]
    pub framing: FramingMode,

    /// HDLC frames use 0x7D octet stuffing
    #[arg(long)]
    pub octet_stuffing: bool,

    /// Multiplier applied to power, current and energy values
    #[arg(long, default_value_t = 1.0)]
    pub scale_factor: f64,

    /// Bytes buffered without a frame boundary before resynchronising
    #[arg(long, default_value_t = DEFAULT_BUFFER_SPAN)]
    pub max_buffer_span: usize,

    /// Seconds to wait before reconnecting after a transport error
    #[arg(long, default_value_t = 5)]
    pub reconnect_secs: u64,
}

impl Config {
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        Ok(
            PipelineConfig::new(self.framing, self.scale_factor, self.max_buffer_span)?
                .with_octet_stuffing(self.octet_stuffing),
        )
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs)
    }
}
