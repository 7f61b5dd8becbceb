//! RTL-SDR device family: `rtl_power` configuration, argument building and
//! output parsing.
//!
//! See `man rtl_power`:
//! https://manpages.debian.org/bookworm/rtl-sdr/rtl_power.1.en.html

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{
    find_runtime, parse_sweep_line, ConfigError, HandlerError, ParseError, SweepResult,
};

/// Name of the external sweeper binary.
pub const RUNTIME: &str = "rtl_power";

/// Device family identifier, as persisted in session rows.
pub const DEVICE: &str = "rtl-sdr";

/// `rtl_power` emits whole-second timestamps.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Supported bin width range in Hz.
pub const BIN_WIDTH_MIN: i64 = 1;
pub const BIN_WIDTH_MAX: i64 = 2_800_000;

/// FFT window function passed through to `rtl_power -w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowFunction {
    Rectangle,
    Hamming,
    Blackman,
    BlackmanHarris,
    HannPoisson,
    Bartlett,
    Youssef,
    Kaiser,
}

impl WindowFunction {
    fn as_str(self) -> &'static str {
        match self {
            WindowFunction::Rectangle => "rectangle",
            WindowFunction::Hamming => "hamming",
            WindowFunction::Blackman => "blackman",
            WindowFunction::BlackmanHarris => "blackman-harris",
            WindowFunction::HannPoisson => "hann-poisson",
            WindowFunction::Bartlett => "bartlett",
            WindowFunction::Youssef => "youssef",
            WindowFunction::Kaiser => "kaiser",
        }
    }
}

/// Smoothing method passed through to `rtl_power -s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Smoothing {
    Avg,
    Iir,
}

impl Smoothing {
    fn as_str(self) -> &'static str {
        match self {
            Smoothing::Avg => "avg",
            Smoothing::Iir => "iir",
        }
    }
}

/// A duration argument for `rtl_power` (`-i`, `-e`).
///
/// Renders as the shortest exact unit (`2h`, `15m`, `30s`) and parses
/// `"30s"` / `"15m"` / `"2h"` style strings, including compounds such as
/// `"1h30m"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval(Duration);

impl Interval {
    pub fn new(duration: Duration) -> Self {
        Interval(duration)
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Nonzero intervals must be at least one second; `rtl_power` takes no
    /// sub-second timing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.0.is_zero() && self.0 < Duration::from_secs(1) {
            return Err(ConfigError::DurationTooShort(self.0));
        }
        Ok(())
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs % 3600 == 0 && secs != 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs % 60 == 0 && secs != 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = Duration::ZERO;
        let mut digits = String::new();
        for c in s.chars() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid duration: {s:?}"))?;
            digits.clear();
            let unit = match c {
                'h' => Duration::from_secs(3600),
                'm' => Duration::from_secs(60),
                's' => Duration::from_secs(1),
                _ => return Err(format!("invalid duration unit {c:?} in {s:?}")),
            };
            total += unit * value as u32;
        }
        if !digits.is_empty() {
            // Bare number defaults to seconds, matching the sweeper.
            let value: u64 = digits
                .parse()
                .map_err(|_| format!("invalid duration: {s:?}"))?;
            total += Duration::from_secs(value);
        }
        Ok(Interval(total))
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

/// `rtl_power` tool configuration.
///
/// Only the options listed here are recognized; defaults are omitted from
/// the generated argv rather than emitted as zeroes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Frequency range start in Hz (`-f` lower bound). Required.
    pub frequency_start: i64,
    /// Frequency range end in Hz (`-f` upper bound). Required.
    pub frequency_end: i64,
    /// Bin size in Hz (`-f` bin size, 1 Hz - 2.8 MHz). Required.
    pub bin_width: i64,

    /// Integration interval (`-i`, default 10 seconds).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<Interval>,
    /// Device index (`-d`, always emitted; default 0).
    pub device_index: u32,
    /// Tuner gain (`-g`, default automatic).
    pub gain: i32,
    /// Crystal error correction in ppm (`-p`, default 0).
    pub ppm_error: i32,
    /// Self-exit timer (`-e`, default off).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_timer: Option<Interval>,
    /// Smoothing method (`-s`, default avg).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothing: Option<Smoothing>,
    /// Number of FFT threads (`-t`).
    pub fft_threads: u32,
    /// Window function (`-w`, default rectangle).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_function: Option<WindowFunction>,
    /// Edge crop fraction (`-c`, 0-1; recommended 0.2-0.5).
    pub crop: f32,
    /// FIR filter size (`-F`, 0 or 9 taps).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fir_size: Option<i32>,
    /// Enable peak hold (`-P`).
    pub peak_hold: bool,
    /// Enable direct sampling (`-D`).
    pub direct_sampling: bool,
    /// Enable offset tuning (`-O`).
    pub offset_tuning: bool,
    /// Enable bias tee power (`-T`).
    pub bias_tee: bool,
}

impl Config {
    /// Check every invariant, returning the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frequency_start <= 0 {
            return Err(ConfigError::FrequencyStart(self.frequency_start));
        }
        if self.frequency_end <= 0 {
            return Err(ConfigError::FrequencyEnd(self.frequency_end));
        }
        if self.frequency_end <= self.frequency_start {
            return Err(ConfigError::FrequencyRange {
                start: self.frequency_start,
                end: self.frequency_end,
            });
        }
        if !(BIN_WIDTH_MIN..=BIN_WIDTH_MAX).contains(&self.bin_width) {
            return Err(ConfigError::BinWidth {
                value: self.bin_width,
                min: BIN_WIDTH_MIN,
                max: BIN_WIDTH_MAX,
            });
        }
        if let Some(interval) = &self.interval {
            interval.validate()?;
        }
        if let Some(exit_timer) = &self.exit_timer {
            exit_timer.validate()?;
        }
        if !(0.0..=1.0).contains(&self.crop) {
            return Err(ConfigError::Crop(self.crop));
        }
        if let Some(fir_size) = self.fir_size {
            if fir_size != 0 && fir_size != 9 {
                return Err(ConfigError::FirSize(fir_size));
            }
        }
        Ok(())
    }

    /// Build the `rtl_power` argv. Flags appear in a stable order and the
    /// final argument is always `-`, dumping sweep data to stdout.
    pub fn args(&self) -> Result<Vec<String>, ConfigError> {
        self.validate()?;

        let mut args = vec![
            "-f".to_string(),
            format!(
                "{}:{}:{}",
                self.frequency_start, self.frequency_end, self.bin_width
            ),
        ];

        if let Some(interval) = &self.interval {
            if !interval.is_zero() {
                args.push("-i".to_string());
                args.push(interval.to_string());
            }
        }

        args.push("-d".to_string());
        args.push(self.device_index.to_string());

        if self.gain > 0 {
            args.push("-g".to_string());
            args.push(self.gain.to_string());
        }
        if self.ppm_error != 0 {
            args.push("-p".to_string());
            args.push(self.ppm_error.to_string());
        }
        if let Some(exit_timer) = &self.exit_timer {
            if !exit_timer.is_zero() {
                args.push("-e".to_string());
                args.push(exit_timer.to_string());
            }
        }
        if let Some(smoothing) = self.smoothing {
            args.push("-s".to_string());
            args.push(smoothing.as_str().to_string());
        }
        if self.fft_threads > 0 {
            args.push("-t".to_string());
            args.push(self.fft_threads.to_string());
        }
        if let Some(window) = self.window_function {
            args.push("-w".to_string());
            args.push(window.as_str().to_string());
        }
        if self.crop > 0.0 {
            args.push("-c".to_string());
            args.push(format!("{:.2}", self.crop));
        }
        if let Some(fir_size) = self.fir_size {
            args.push("-F".to_string());
            args.push(fir_size.to_string());
        }
        if self.peak_hold {
            args.push("-P".to_string());
        }
        if self.direct_sampling {
            args.push("-D".to_string());
        }
        if self.offset_tuning {
            args.push("-O".to_string());
        }
        if self.bias_tee {
            args.push("-T".to_string());
        }

        args.push("-".to_string());
        Ok(args)
    }
}

/// RTL-SDR handler binding a binary path and a validated argv.
pub struct Handler {
    bin_path: PathBuf,
    args: Vec<String>,
}

impl Handler {
    /// Create a handler, locating `rtl_power` in `PATH`.
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

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            frequency_start: 100_000_000,
            frequency_end: 200_000_000,
            bin_width: 100_000,
            ..Config::default()
        }
    }

    #[test]
    fn test_args_minimal() {
        let args = base_config().args().unwrap();
        assert_eq!(args, vec!["-f", "100000000:200000000:100000", "-d", "0", "-"]);
    }

    #[test]
    fn test_args_full_and_deterministic() {
        let config = Config {
            interval: Some("5m".parse().unwrap()),
            device_index: 1,
            gain: 28,
            ppm_error: -2,
            exit_timer: Some("2h".parse().unwrap()),
            smoothing: Some(Smoothing::Iir),
            fft_threads: 4,
            window_function: Some(WindowFunction::BlackmanHarris),
            crop: 0.25,
            fir_size: Some(9),
            peak_hold: true,
            direct_sampling: true,
            offset_tuning: true,
            bias_tee: true,
            ..base_config()
        };

        let args = config.args().unwrap();
        assert_eq!(
            args,
            vec![
                "-f", "100000000:200000000:100000", "-i", "5m", "-d", "1", "-g", "28", "-p",
                "-2", "-e", "2h", "-s", "iir", "-t", "4", "-w", "blackman-harris", "-c", "0.25",
                "-F", "9", "-P", "-D", "-O", "-T", "-",
            ]
        );
        // Pure function of the config.
        assert_eq!(args, config.args().unwrap());
    }

    #[test]
    fn test_validate_rejects_each_invariant() {
        let mut config = base_config();
        config.frequency_start = 0;
        assert_eq!(config.validate(), Err(ConfigError::FrequencyStart(0)));

        let mut config = base_config();
        config.frequency_end = config.frequency_start;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FrequencyRange { .. })
        ));

        let mut config = base_config();
        config.bin_width = 3_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::BinWidth { .. })));

        let mut config = base_config();
        config.interval = Some(Interval::new(Duration::from_millis(500)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DurationTooShort(_))
        ));

        let mut config = base_config();
        config.crop = 1.5;
        assert_eq!(config.validate(), Err(ConfigError::Crop(1.5)));

        let mut config = base_config();
        config.fir_size = Some(4);
        assert_eq!(config.validate(), Err(ConfigError::FirSize(4)));

        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_interval_display_shortest_unit() {
        assert_eq!("30s".parse::<Interval>().unwrap().to_string(), "30s");
        assert_eq!("90s".parse::<Interval>().unwrap().to_string(), "90s");
        assert_eq!("15m".parse::<Interval>().unwrap().to_string(), "15m");
        assert_eq!("2h".parse::<Interval>().unwrap().to_string(), "2h");
        assert_eq!("1h30m".parse::<Interval>().unwrap().to_string(), "90m");
        assert_eq!("60".parse::<Interval>().unwrap().to_string(), "1m");
    }

    #[test]
    fn test_interval_parse_rejects_garbage() {
        assert!("".parse::<Interval>().is_err());
        assert!("5x".parse::<Interval>().is_err());
        assert!("abc".parse::<Interval>().is_err());
    }
}
