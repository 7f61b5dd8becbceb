//! Reader-side spectrum data model.

use chrono::{DateTime, Utc};

use crate::telemetry::Telemetry;

/// A single spectrum scanning session with a specific device.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSession {
    /// Unique identifier of the session.
    pub id: i64,
    /// When the scanning session began.
    pub start_time: DateTime<Utc>,
    /// Type of SDR device used ("rtl-sdr", "hackrf").
    pub device_type: String,
    /// Identifier of the specific device (configured name or serial).
    pub device_id: String,
    /// Opaque serialized device configuration, if one was recorded.
    pub config: Option<String>,
}

/// A single measurement at a specific frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralPoint {
    /// Bin center frequency in Hz.
    pub frequency: f64,
    /// Measured power level in dBm; `None` when the measurement was invalid.
    pub power: Option<f64>,
    /// Frequency bin width in Hz.
    pub bin_width: f64,
    /// Number of samples integrated into this measurement.
    pub num_samples: u32,
}

/// A spectral point enriched with the drone state captured alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralPointWithTelemetry {
    pub point: SpectralPoint,
    /// Telemetry snapshot linked to the measurement, if one exists.
    pub telemetry: Option<Telemetry>,
}

/// One complete sweep of the band reconstructed from storage: a contiguous,
/// monotonically increasing frequency run. A new span begins at each
/// frequency rollover.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralSpan<T> {
    /// When this span of measurements was taken.
    pub timestamp: DateTime<Utc>,
    /// Start frequency of the span in Hz.
    pub frequency_start: f64,
    /// End frequency of the span in Hz.
    pub frequency_end: f64,
    /// Ordered measurements, dense over the span's frequency range.
    pub samples: Vec<T>,
}
