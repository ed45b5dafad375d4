// Timeouts, topics, board configuration
use serde::Deserialize;
use std::time::Duration;

use crate::amc::protocol::MOTOR_COUNT;

// Pause after every write, the board has no flow control
pub const SETTLE_DELAY: Duration = Duration::from_millis(250);

// Startup: wait for a state reply after each query
pub const RESPONSE_WAIT: Duration = Duration::from_millis(500);

// Running: wait for inbound bytes before polling the next channel
pub const POLL_WAIT: Duration = Duration::from_millis(500);

// Running: wait for actuation requests after each poll
pub const BUS_WAIT: Duration = Duration::from_millis(750);

// Watchdog ceiling and restart backoff
pub const WATCHDOG_TOP: Duration = Duration::from_secs(10);
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);

// Serial defaults
pub const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 57_600;

// CRC8 polynomial of the board firmware (0x00 yields an all-zero checksum)
pub const DEFAULT_CRC_POLY: u8 = 0x00;

// Zenoh topics
pub const TOPIC_ACTUATION: &str = "amc/cmd/actuation"; // actuation requests
pub const TOPIC_RPM: &str = "amc/telemetry/rpm"; // rpm samples
pub const TOPIC_HEALTH: &str = "amc/state/health"; // health status
pub const TOPIC_RESTART: &str = "amc/state/restart"; // restart requests

/// Delays used by the control loop
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timing {
    #[serde(with = "millis")]
    pub settle: Duration,
    #[serde(with = "millis")]
    pub response_wait: Duration,
    #[serde(with = "millis")]
    pub poll_wait: Duration,
    #[serde(with = "millis")]
    pub bus_wait: Duration,
    #[serde(with = "millis")]
    pub watchdog: Duration,
    #[serde(with = "millis")]
    pub restart_backoff: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle: SETTLE_DELAY,
            response_wait: RESPONSE_WAIT,
            poll_wait: POLL_WAIT,
            bus_wait: BUS_WAIT,
            watchdog: WATCHDOG_TOP,
            restart_backoff: RESTART_BACKOFF,
        }
    }
}

/// Everything needed to bring up one driver instance
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    pub device: String,
    pub baud: u32,
    /// Entity label per channel, empty means "motor<N>"
    pub labels: [String; MOTOR_COUNT],
    /// Rpm conversion factor per channel
    pub conversion: [f64; MOTOR_COUNT],
    pub crc_poly: u8,
    pub timing: Timing,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud: DEFAULT_BAUDRATE,
            labels: Default::default(),
            conversion: [1.0; MOTOR_COUNT],
            crc_poly: DEFAULT_CRC_POLY,
            timing: Timing::default(),
        }
    }
}

impl DriverConfig {
    /// Load a JSON config file, missing fields fall back to defaults
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

// Durations are written as integer milliseconds in config files
mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
