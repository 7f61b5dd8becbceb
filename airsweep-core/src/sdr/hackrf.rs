//! HackRF device family: `hackrf_sweep` configuration, argument building and
//! output parsing.
//!
//! See `man hackrf_sweep`:
//! https://manpages.debian.org/bookworm/hackrf/hackrf_sweep.1.en.html

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{
    find_runtime, parse_sweep_line, ConfigError, HandlerError, ParseError, SweepResult,
};

/// Name of the external sweeper binary.
pub const RUNTIME: &str = "hackrf_sweep";

/// Device family identifier, as persisted in session rows.
pub const DEVICE: &str = "hackrf";

/// `hackrf_sweep` emits microsecond-precision timestamps.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// LNA (IF) gain bounds: 0-40 dB in 8 dB steps.
pub const MAX_LNA_GAIN: i32 = 40;
pub const LNA_GAIN_STEP: i32 = 8;

/// VGA (baseband) gain bounds: 0-62 dB in 2 dB steps.
pub const MAX_VGA_GAIN: i32 = 62;
pub const VGA_GAIN_STEP: i32 = 2;

/// `hackrf_sweep` tool configuration.
///
/// Frequencies are configured in Hz and emitted to the sweeper as whole MHz;
/// the bin width travels separately in Hz.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Frequency range start in Hz (`-f` minimum, sent as MHz). Required.
    pub frequency_start: i64,
    /// Frequency range end in Hz (`-f` maximum, sent as MHz). Required.
    pub frequency_end: i64,

    /// LNA (IF) gain in dB (`-l`, 0-40 in 8 dB steps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lna_gain: Option<i32>,
    /// VGA (baseband) gain in dB (`-g`, 0-62 in 2 dB steps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vga_gain: Option<i32>,
    /// FFT bin width in Hz (`-w`).
    pub bin_width: i64,
    /// Keep the same timestamp within a sweep (`-n`).
    pub same_timestamp: bool,
    /// Serial number of the desired HackRF (`-d`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Enable the RX RF amplifier (`-a 1`).
    pub enable_amp: bool,
    /// Enable antenna port power (`-p 1`).
    pub antenna_power: bool,
    /// Number of sweeps to perform before exiting (`-N`).
    pub num_sweeps: u32,
}

impl Config {
    /// Check every invariant, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency_start <= 0 {
            return Err(ConfigError::FrequencyStart(self.frequency_start));
        }
        if self.frequency_end <= self.frequency_start {
            return Err(ConfigError::FrequencyRange {
                start: self.frequency_start,
                end: self.frequency_end,
            });
        }

        if let Some(lna_gain) = self.lna_gain {
            if !(0..=MAX_LNA_GAIN).contains(&lna_gain) {
                return Err(ConfigError::LnaGainRange {
                    value: lna_gain,
                    max: MAX_LNA_GAIN,
                });
            }
            if lna_gain % LNA_GAIN_STEP != 0 {
                return Err(ConfigError::LnaGainStep(lna_gain));
            }
        }

        if let Some(vga_gain) = self.vga_gain {
            if !(0..=MAX_VGA_GAIN).contains(&vga_gain) {
                return Err(ConfigError::VgaGainRange {
                    value: vga_gain,
                    max: MAX_VGA_GAIN,
                });
            }
            if vga_gain % VGA_GAIN_STEP != 0 {
                return Err(ConfigError::VgaGainStep(vga_gain));
            }
        }

        Ok(())
    }

    /// Build the `hackrf_sweep` argv. Flags appear in a stable order and the
    /// final arguments are always `-r -`, dumping sweep data to stdout.
    pub fn args(&self) -> Result<Vec<String>, ConfigError> {
        self.validate()?;

        let mut args = vec![
            "-f".to_string(),
            format!(
                "{}:{}",
                self.frequency_start / 1_000_000,
                self.frequency_end / 1_000_000
            ),
        ];

        if let Some(serial_number) = &self.serial_number {
            args.push("-d".to_string());
            args.push(serial_number.clone());
        }
        if self.bin_width > 0 {
            args.push("-w".to_string());
            args.push(self.bin_width.to_string());
        }
        if let Some(lna_gain) = self.lna_gain {
            args.push("-l".to_string());
            args.push(lna_gain.to_string());
        }
        if let Some(vga_gain) = self.vga_gain {
            args.push("-g".to_string());
            args.push(vga_gain.to_string());
        }
        if self.same_timestamp {
            args.push("-n".to_string());
        }
        if self.num_sweeps > 0 {
            args.push("-N".to_string());
            args.push(self.num_sweeps.to_string());
        }
        if self.enable_amp {
            args.push("-a".to_string());
            args.push("1".to_string());
        }
        if self.antenna_power {
            args.push("-p".to_string());
            args.push("1".to_string());
        }

        args.push("-r".to_string());
        args.push("-".to_string());
        Ok(args)
    }
}

/// HackRF handler binding a binary path and a validated argv.
pub struct Handler {
    bin_path: PathBuf,
    args: Vec<String>,
}

impl Handler {
    /// Create a handler, locating `hackrf_sweep` in `PATH`.
    pub fn new(config: &Config) -> Result<Self, HandlerError> {
        let bin_path = find_runtime(RUNTIME)?;
        Ok(Self::with_runtime(bin_path, config)?)
    }

    /// Create a handler with an explicit sweeper binary path.
    pub fn with_runtime(bin_path: PathBuf, config: &Config) -> Result<Self, ConfigError> {
        Ok(Handler {
            bin_path,
            args: config.args()?,
        })
    }
}

impl super::Handler for Handler {
    fn parse(&self, line: &str, device_id: &str) -> Result<SweepResult, ParseError> {
        parse_sweep_line(line, DEVICE, device_id, TIMESTAMP_FORMAT)
    }

    fn device(&self) -> &'static str {
        DEVICE
    }

    fn runtime(&self) -> &Path {
        &self.bin_path
    }

    fn args(&self) -> &[String] {
        &self.args
    }
}
