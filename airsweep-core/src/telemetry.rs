//! Drone telemetry snapshots and the provider interface polled at sweep
//! boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Telemetry data sampled from the drone's sensors. All sensor fields are
/// optional; a snapshot carries whatever the telemetry feed had at the time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Timestamp of the telemetry measurement.
    pub timestamp: DateTime<Utc>,
    /// Barometric altitude in meters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    /// Roll angle in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll: Option<f64>,
    /// Pitch angle in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f64>,
    /// Yaw angle in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yaw: Option<f64>,
    /// X-axis acceleration in m/s².
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_x: Option<f64>,
    /// Y-axis acceleration in m/s².
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_y: Option<f64>,
    /// Z-axis acceleration in m/s².
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accel_z: Option<f64>,
    /// GPS latitude in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    /// GPS longitude in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Ground speed in m/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<f64>,
    /// Ground course (heading) in degrees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ground_course: Option<f64>,
    /// Radio link RSSI in dBm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radio_rssi: Option<i64>,
}

/// Source of telemetry snapshots. The orchestrator polls `get` once per
/// consumed sweep; there is no subscription mechanism.
pub trait Provider: Send + Sync {
    /// The most recent telemetry snapshot, or `None` if the feed has not
    /// produced one yet.
    fn get(&self) -> Option<Telemetry>;
}
