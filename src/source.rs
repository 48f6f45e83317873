//! Byte sources feeding a pipeline: a serial HAN adapter, a TCP bridge or
//! an MQTT subscription.

use log::{debug, info};
use rumqttc::{Client, Connection, Event, MqttOptions, Packet, QoS};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::time::Duration;

use crate::config::{Config, Parity};
use crate::error::TransportError;

const READ_BUFFER: usize = 1024;
const SERIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Produces chunks of raw bytes. An empty chunk means nothing arrived
/// yet; any error ends the connection.
pub trait ByteSource {
    fn next_chunk(&mut self) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl From<&Config> for SerialSettings {
    fn from(config: &Config) -> Self {
        SerialSettings {
            baud_rate: config.baud_rate,
            parity: config.parity,
            data_bits: config.data_bits,
            stop_bits: config.stop_bits,
        }
    }
}

impl SerialSettings {
    fn data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        }
    }

    fn parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }

    fn stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        }
    }
}

pub struct SerialSource {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialSource {
    pub fn open(path: &str, settings: &SerialSettings) -> Result<Self, TransportError> {
        let port = serialport::new(path, settings.baud_rate)
            .data_bits(settings.data_bits())
            .parity(settings.parity())
            .stop_bits(settings.stop_bits())
            .timeout(SERIAL_TIMEOUT)
            .open()?;
        info!(
            "Opened serial port {} at {} baud ({:?})",
            path, settings.baud_rate, settings.parity
        );
        Ok(SerialSource { port })
    }
}

impl ByteSource for SerialSource {
    fn next_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; READ_BUFFER];
        match self.port.read(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            // Meters push a telegram every few seconds; quiet periods are normal.
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct TcpSource {
    stream: TcpStream,
}

impl TcpSource {
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        info!("Connected to {}", addr);
        Ok(TcpSource { stream })
    }
}

impl ByteSource for TcpSource {
    fn next_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0u8; READ_BUFFER];
        match self.stream.read(&mut buf)? {
            0 => Err(TransportError::Closed),
            n => Ok(buf[..n].to_vec()),
        }
    }
}

/// Each publish on a subscribed topic is one chunk.
pub struct MqttSource {
    // Kept alive so the subscription stays open.
    _client: Client,
    connection: Connection,
}

impl MqttSource {
    pub fn connect(
        host: &str,
        port: u16,
        client_id: &str,
        topics: &[String],
    ) -> Result<Self, TransportError> {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(60));

        let (client, connection) = Client::new(opts, 10);
        for topic in topics {
            client
                .subscribe(topic, QoS::AtMostOnce)
                .map_err(|e| TransportError::Mqtt(e.to_string()))?;
        }
        info!("Subscribing to {} on {}:{}", topics.join(", "), host, port);
        Ok(MqttSource {
            _client: client,
            connection,
        })
    }
}

impl ByteSource for MqttSource {
    fn next_chunk(&mut self) -> Result<Vec<u8>, TransportError> {
        // rumqttc requires driving the event loop to receive anything
        for event in self.connection.iter() {
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if is_json(&publish.payload) {
                        debug!("Ignoring JSON payload on {}", publish.topic);
                        continue;
                    }
                    return Ok(publish.payload.to_vec());
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => info!("Connected to MQTT broker"),
                Ok(_) => continue,
                Err(e) => return Err(TransportError::Mqtt(e.to_string())),
            }
        }
        Err(TransportError::Closed)
    }
}

// Some bridges publish their own decoded JSON on the raw topic.
fn is_json(payload: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<serde_json::Value>(payload),
        Ok(serde_json::Value::Object(_)) | Ok(serde_json::Value::Array(_))
    )
}
