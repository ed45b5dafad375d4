// Define message types exchanged with the bus

use serde::{Deserialize, Serialize};

// Actuation request from controllers -> driver
// id 0 drives channels {0,1}, id 1 drives channels {2,3}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ActuationRequest {
    pub id: u8,
    pub value: f64,
}

// Rpm telemetry from driver -> bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpmSample {
    pub label: String,
    pub value: i32,
}

/// Health status published by the driver
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Normal,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    pub state: HealthState,
    pub message: String,
}

impl HealthReport {
    pub fn normal(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Normal,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: HealthState::Error,
            message: message.into(),
        }
    }
}

/// Request for the supervisor to restart the driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartRequest {
    pub reason: String,
    pub backoff_secs: f64,
    /// false = eligible for automatic retry
    pub permanent: bool,
}
