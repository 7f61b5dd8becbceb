//! Core library for the airsweep airborne RF surveillance collector.
//!
//! This crate provides:
//! - SDR sweeper subprocess drivers and sweep-line parsing ([`sdr`])
//! - A frequency-ordered reassembly buffer for out-of-order sweep chunks
//!   ([`sdr::buffer`])
//! - Spectrum and telemetry data models ([`spectrum`], [`telemetry`])
//! - A per-flight SQLite store with a streaming spectral-span reader
//!   ([`storage`])
//!
//! The daemon binary (`airsweepd`) wires these together; this crate contains
//! no CLI, configuration-file or logging-sink setup.

pub mod sdr;
pub mod spectrum;
pub mod storage;
pub mod telemetry;
