use std::path::PathBuf;

use amc_zenoh_driver::amc::protocol::MOTOR_COUNT;
use amc_zenoh_driver::config::{DriverConfig, DEFAULT_BAUDRATE, DEFAULT_CRC_POLY, DEFAULT_DEVICE};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Driver for the AMC four-channel motor controller
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON config file; other flags are ignored when given
    #[arg(long)]
    config: Option<PathBuf>,

    /// Serial port device
    #[arg(long, default_value = DEFAULT_DEVICE)]
    device: String,

    /// Serial port baud rate
    #[arg(long, default_value_t = DEFAULT_BAUDRATE)]
    baud: u32,

    /// Entity label for motors 0..3, in order
    #[arg(long = "label", num_args = 1)]
    labels: Vec<String>,

    /// Rpm conversion factor for motors 0..3, in order
    #[arg(long = "conversion", num_args = 1)]
    conversions: Vec<f64>,

    /// CRC8 polynomial of the board firmware
    #[arg(long, default_value_t = DEFAULT_CRC_POLY, value_parser = parse_u8)]
    crc_poly: u8,
}

fn parse_u8(s: &str) -> Result<u8, String> {
    match s.strip_prefix("0x") {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| e.to_string())
}

impl Args {
    fn into_config(self) -> Result<DriverConfig, Box<dyn std::error::Error + Send + Sync>> {
        if let Some(path) = &self.config {
            return DriverConfig::from_json_file(path);
        }
        if self.labels.len() > MOTOR_COUNT || self.conversions.len() > MOTOR_COUNT {
            return Err(format!("at most {} labels and conversions", MOTOR_COUNT).into());
        }

        let mut config = DriverConfig {
            device: self.device,
            baud: self.baud,
            crc_poly: self.crc_poly,
            ..DriverConfig::default()
        };
        for (slot, label) in config.labels.iter_mut().zip(self.labels) {
            *slot = label;
        }
        for (slot, factor) in config.conversion.iter_mut().zip(self.conversions) {
            *slot = factor;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let result = match Args::parse().into_config() {
        Ok(config) => amc_zenoh_driver::runtime::run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("Driver error: {}", e);
        std::process::exit(1);
    }
}
