use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use hanport::config::Config;
use hanport::meter::{MeasurementSet, MeterInfo};
use hanport::pipeline::{self, PipelineEvent};
use hanport::source::{ByteSource, MqttSource, SerialSettings, SerialSource, TcpSource};

#[derive(Serialize)]
struct Output<'a> {
    #[serde(flatten)]
    set: &'a MeasurementSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    meter: Option<MeterInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unique_id: Option<String>,
}

fn main() -> Result<()> {
    env_logger::init();

    let config = Config::parse();
    let pipeline_config = config
        .pipeline_config()
        .context("Invalid configuration")?;
    info!("Starting hanport");

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || print_measurements(rx));

    loop {
        match open_source(&config) {
            Ok(mut source) => {
                let mut tx = tx.clone();
                if let Err(e) = pipeline::run(source.as_mut(), &pipeline_config, &mut tx) {
                    error!("Connection lost: {}", e);
                }
            }
            Err(e) => error!("Failed to open source: {:#}", e),
        }
        info!("Reconnecting in {}s", config.reconnect_secs);
        thread::sleep(config.reconnect_delay());
    }
}

fn open_source(config: &Config) -> Result<Box<dyn ByteSource>> {
    if let Some(path) = &config.serial {
        let source = SerialSource::open(path, &SerialSettings::from(config))
            .with_context(|| format!("Failed to open serial port {}", path))?;
        return Ok(Box::new(source));
    }
    if let Some(addr) = &config.tcp {
        let source =
            TcpSource::connect(addr).with_context(|| format!("Failed to connect to {}", addr))?;
        return Ok(Box::new(source));
    }
    let host = config
        .mqtt_host
        .as_deref()
        .context("No byte source configured")?;
    let source = MqttSource::connect(
        host,
        config.mqtt_port,
        &config.mqtt_client_id,
        &config.mqtt_topics,
    )
    .with_context(|| format!("Failed to subscribe on {}:{}", host, config.mqtt_port))?;
    Ok(Box::new(source))
}

/// Prints each measurement set as one JSON line. Diagnostics are already
/// logged by the pipeline.
fn print_measurements(rx: Receiver<PipelineEvent>) {
    for event in rx {
        if let PipelineEvent::Measurements(set) = event {
            let meter = set.meter_info();
            let output = Output {
                unique_id: meter.as_ref().map(MeterInfo::unique_id),
                meter,
                set: &set,
            };
            match serde_json::to_string(&output) {
                Ok(line) => println!("{}", line),
                Err(e) => error!("Failed to serialize measurements: {}", e),
            }
        }
    }
}
