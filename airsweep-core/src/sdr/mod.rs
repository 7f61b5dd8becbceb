//! SDR device handling: sweep data model, sweeper output parsing and the
//! handler interface implemented by each device family.
//!
//! Each supported device is driven through an external command-line sweeper
//! (`rtl_power`, `hackrf_sweep`) that emits CSV sweep chunks on stdout. The
//! [`Handler`] trait captures what a device family must provide: the
//! subprocess command and the line parser for its output format.

pub mod buffer;
pub mod device;
pub mod hackrf;
pub mod rtl;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tokio::process::Command;

/// Number of consecutive parse errors tolerated on a device's stdout before
/// sampling is aborted.
pub const PARSE_ERRORS_THRESHOLD: u8 = 5;

/// A single frequency power reading within a sweep chunk.
///
/// Invalid readings are kept with `is_valid = false` rather than dropped, so
/// that downstream storage can persist them as NULL power.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    /// Bin center frequency in Hz.
    pub frequency: f64,
    /// Power level (dBm for rtl-sdr, dB for hackrf). Zero when invalid.
    pub power: f64,
    /// Whether the power field parsed successfully.
    pub is_valid: bool,
}

/// One parsed sweep chunk: a contiguous sub-band of a sweep with per-bin
/// power readings.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepResult {
    /// Capture timestamp reported by the sweeper.
    pub timestamp: DateTime<Utc>,
    /// Start of the chunk's frequency range in Hz.
    pub start_frequency: f64,
    /// End of the chunk's frequency range in Hz.
    pub end_frequency: f64,
    /// Bin width in Hz.
    pub bin_width: f64,
    /// Number of raw samples integrated per bin.
    pub num_samples: u32,
    /// Per-bin power readings, in ascending frequency order.
    pub readings: Vec<PowerReading>,
    /// Device family ("rtl-sdr" or "hackrf").
    pub device: &'static str,
    /// Human-readable device identifier (configured name, serial or index).
    pub device_id: String,
}

impl SweepResult {
    /// Center frequency of the chunk's first bin offset, used as the
    /// ordering key by the reassembly buffer.
    pub fn center_frequency(&self) -> f64 {
        self.start_frequency + self.bin_width / 2.0
    }
}

/// A failure to parse one sweeper output line.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The line had fewer than the 7 mandatory CSV fields.
    #[error("not enough fields: expected at least 7, got {0}")]
    NotEnoughFields(usize),

    /// The date/time fields did not match the device family's format.
    #[error("invalid timestamp {value:?}: {source}")]
    InvalidTimestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    /// The low-frequency field failed numeric parsing.
    #[error("invalid start frequency {value:?}: {source}")]
    InvalidStartFrequency {
        value: String,
        #[source]
        source: std::num::ParseFloatError,
    },

    /// The high-frequency field failed numeric parsing.
    #[error("invalid end frequency {value:?}: {source}")]
    InvalidEndFrequency {
        value: String,
        #[source]
        source: std::num::ParseFloatError,
    },

    /// The bin-width field failed numeric parsing.
    #[error("invalid bin width {value:?}: {source}")]
    InvalidBinWidth {
        value: String,
        #[source]
        source: std::num::ParseFloatError,
    },

    /// The sample-count field failed numeric parsing.
    #[error("invalid sample count {value:?}: {source}")]
    InvalidNumSamples {
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },
}

/// A device or buffer configuration invariant violation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Frequency range start must be positive.
    #[error("frequency start must be positive: {0} given")]
    FrequencyStart(i64),

    /// Frequency range end must be positive.
    #[error("frequency end must be positive: {0} given")]
    FrequencyEnd(i64),

    /// Frequency range end must exceed the start.
    #[error("frequency end must be greater than start: {end} <= {start}")]
    FrequencyRange { start: i64, end: i64 },

    /// Bin width outside the sweeper's supported range.
    #[error("bin width must be between {min} and {max} Hz: {value} given")]
    BinWidth { value: i64, min: i64, max: i64 },

    /// Nonzero durations must be at least one second.
    #[error("duration must be at least 1 second: {0:?} given")]
    DurationTooShort(std::time::Duration),

    /// Crop fraction outside `[0, 1]`.
    #[error("crop must be between 0 and 1: {0:.2} given")]
    Crop(f32),

    /// FIR size is restricted to 0 or 9 taps.
    #[error("FIR size must be 0 or 9: {0} given")]
    FirSize(i32),

    /// LNA gain outside `[0, 40]` dB.
    #[error("LNA gain must be between 0 and {max} dB: {value} given")]
    LnaGainRange { value: i32, max: i32 },

    /// LNA gain must land on an 8 dB step.
    #[error("LNA gain must be a multiple of 8 dB: {0} given")]
    LnaGainStep(i32),

    /// VGA gain outside `[0, 62]` dB.
    #[error("VGA gain must be between 0 and {max} dB: {value} given")]
    VgaGainRange { value: i32, max: i32 },

    /// VGA gain must land on a 2 dB step.
    #[error("VGA gain must be a multiple of 2 dB: {0} given")]
    VgaGainStep(i32),
}

/// Failure to locate a sweeper binary on the target system.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The binary was not found anywhere in `PATH`.
    #[error("sweeper binary {0:?} not found in PATH")]
    NotFound(String),
}

/// Failure to construct a device handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Capabilities a device family must provide to be driven by a [`device::Device`].
pub trait Handler: Send + Sync {
    /// Parse one line of sweeper stdout into a [`SweepResult`].
    fn parse(&self, line: &str, device_id: &str) -> Result<SweepResult, ParseError>;

    /// Device family identifier ("rtl-sdr", "hackrf").
    fn device(&self) -> &'static str;

    /// Path to the sweeper binary.
    fn runtime(&self) -> &Path;

    /// Arguments the sweeper is invoked with.
    fn args(&self) -> &[String];

    /// Build the sweeper subprocess command with both output pipes captured.
    fn command(&self) -> Command {
        let mut cmd = Command::new(self.runtime());
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Locate a sweeper binary by searching `PATH`.
///
/// Callers that already know where the binary lives can bypass this and hand
/// the path to the handler constructor directly.
pub fn find_runtime(name: &str) -> Result<PathBuf, RuntimeError> {
    let path = std::env::var_os("PATH").ok_or_else(|| RuntimeError::NotFound(name.to_string()))?;
    for dir in std::env::split_paths(&path) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(RuntimeError::NotFound(name.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Parse one CSV sweep line shared by both device families.
///
/// Grammar: `date, time, lowHz, highHz, binHz, nSamples, p0, p1, ...` with
/// whitespace tolerated around every field. A power field that fails numeric
/// parsing becomes an invalid reading; it never aborts the line. Header field
/// failures abort the whole line.
fn parse_sweep_line(
    line: &str,
    device: &'static str,
    device_id: &str,
    timestamp_format: &str,
) -> Result<SweepResult, ParseError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 7 {
        return Err(ParseError::NotEnoughFields(fields.len()));
    }

    let stamp = format!("{} {}", fields[0], fields[1]);
    let timestamp = NaiveDateTime::parse_from_str(&stamp, timestamp_format)
        .map_err(|source| ParseError::InvalidTimestamp {
            value: stamp.clone(),
            source,
        })?
        .and_utc();

    let start_frequency: f64 =
        fields[2]
            .parse()
            .map_err(|source| ParseError::InvalidStartFrequency {
                value: fields[2].to_string(),
                source,
            })?;
    let end_frequency: f64 =
        fields[3]
            .parse()
            .map_err(|source| ParseError::InvalidEndFrequency {
                value: fields[3].to_string(),
                source,
            })?;
    let bin_width: f64 = fields[4]
        .parse()
        .map_err(|source| ParseError::InvalidBinWidth {
            value: fields[4].to_string(),
            source,
        })?;
    let num_samples: u32 = fields[5]
        .parse()
        .map_err(|source| ParseError::InvalidNumSamples {
            value: fields[5].to_string(),
            source,
        })?;

    let mut readings = Vec::with_capacity(fields.len() - 6);
    for (i, field) in fields[6..].iter().enumerate() {
        let frequency = start_frequency + i as f64 * bin_width + bin_width / 2.0;
        match field.parse::<f64>() {
            Ok(power) => readings.push(PowerReading {
                frequency,
                power,
                is_valid: true,
            }),
            Err(_) => readings.push(PowerReading {
                frequency,
                power: 0.0,
                is_valid: false,
            }),
        }
    }

    Ok(SweepResult {
        timestamp,
        start_frequency,
        end_frequency,
        bin_width,
        num_samples,
        readings,
        device,
        device_id: device_id.to_string(),
    })
}
