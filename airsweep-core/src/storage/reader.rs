//! Streaming reconstruction of spectral spans from stored samples.
//!
//! The reader walks one session's samples in `(timestamp, frequency)` order
//! and groups them into [`SpectralSpan`]s: a new span begins whenever the
//! frequency rolls back below its predecessor. Frequency gaps — dropped
//! chunks, misaligned first/last rows — are filled with zero-power sentinel
//! points so every span is dense over the requested range. The sentinels are
//! synthesized here only; they are never persisted.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::models::scan_session;
use super::{schema, StorageError};
use crate::spectrum::{ScanSession, SpectralPoint, SpectralPointWithTelemetry, SpectralSpan};
use crate::telemetry::Telemetry;

/// Rows are consumed in pages of this many samples unless overridden.
const DEFAULT_BATCH_SIZE: usize = 1024;

/// A sample type the reader can stream: either a plain spectral point or one
/// joined with telemetry.
pub trait SpectralData: Clone + Sized {
    /// Bin center frequency in Hz.
    fn frequency(&self) -> f64;

    /// Bin width in Hz.
    fn bin_width(&self) -> f64;

    /// Synthesize a zero-power sentinel at `frequency`, copying measurement
    /// parameters (and any telemetry linkage) from `template`.
    fn zero_point(frequency: f64, template: &Self) -> Self;

    /// Paged range query for this sample type.
    fn query_sql() -> &'static str;

    /// Scan one query row into a timestamped sample.
    fn scan_row(row: &Row<'_>) -> rusqlite::Result<(DateTime<Utc>, Self)>;
}

impl SpectralData for SpectralPoint {
    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn bin_width(&self) -> f64 {
        self.bin_width
    }

    fn zero_point(frequency: f64, template: &Self) -> Self {
        SpectralPoint {
            frequency,
            power: Some(0.0),
            bin_width: template.bin_width,
            num_samples: template.num_samples,
        }
    }

    fn query_sql() -> &'static str {
        schema::SELECT_SAMPLES_SQL
    }

    fn scan_row(row: &Row<'_>) -> rusqlite::Result<(DateTime<Utc>, Self)> {
        Ok((
            row.get(0)?,
            SpectralPoint {
                frequency: row.get(1)?,
                power: row.get(2)?,
                bin_width: row.get(3)?,
                num_samples: row.get(4)?,
            },
        ))
    }
}

impl SpectralData for SpectralPointWithTelemetry {
    fn frequency(&self) -> f64 {
        self.point.frequency
    }

    fn bin_width(&self) -> f64 {
        self.point.bin_width
    }

    fn zero_point(frequency: f64, template: &Self) -> Self {
        SpectralPointWithTelemetry {
            point: SpectralPoint::zero_point(frequency, &template.point),
            telemetry: template.telemetry.clone(),
        }
    }

    fn query_sql() -> &'static str {
        schema::SELECT_SAMPLES_WITH_TELEMETRY_SQL
    }

    fn scan_row(row: &Row<'_>) -> rusqlite::Result<(DateTime<Utc>, Self)> {
        let (timestamp, point) = SpectralPoint::scan_row(row)?;

        let telemetry_id: Option<i64> = row.get(5)?;
        let telemetry = match telemetry_id {
            None => None,
            Some(_) => Some(Telemetry {
                timestamp: row
                    .get::<_, Option<DateTime<Utc>>>(6)?
                    .unwrap_or_default(),
                latitude: row.get(7)?,
                longitude: row.get(8)?,
                altitude: row.get(9)?,
                roll: row.get(10)?,
                pitch: row.get(11)?,
                yaw: row.get(12)?,
                accel_x: row.get(13)?,
                accel_y: row.get(14)?,
                accel_z: row.get(15)?,
                ground_speed: row.get(16)?,
                ground_course: row.get(17)?,
                radio_rssi: row.get(18)?,
            }),
        };

        Ok((timestamp, SpectralPointWithTelemetry { point, telemetry }))
    }
}

/// Filtering options for a spectrum reader. Bounds left unset are filled
/// from the session's sample extremes at initialization.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    min_freq: Option<f64>,
    max_freq: Option<f64>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    batch_size: Option<usize>,
}

impl ReadOptions {
    pub fn new() -> Self {
        ReadOptions::default()
    }

    /// Drop samples with center frequency below `f` Hz.
    pub fn with_min_freq(mut self, f: f64) -> Self {
        self.min_freq = Some(f);
        self
    }

    /// Drop samples with center frequency above `f` Hz.
    pub fn with_max_freq(mut self, f: f64) -> Self {
        self.max_freq = Some(f);
        self
    }

    /// Keep samples within `[min_freq, max_freq]` Hz. Inverted bounds are
    /// rejected when the reader initializes.
    pub fn with_freq_range(self, min_freq: f64, max_freq: f64) -> Self {
        self.with_min_freq(min_freq).with_max_freq(max_freq)
    }

    /// Drop samples captured before `t`.
    pub fn with_start_time(mut self, t: DateTime<Utc>) -> Self {
        self.start_time = Some(t);
        self
    }

    /// Drop samples captured after `t`.
    pub fn with_end_time(mut self, t: DateTime<Utc>) -> Self {
        self.end_time = Some(t);
        self
    }

    /// Keep samples within `[start, end]`. Inverted bounds are rejected when
    /// the reader initializes.
    pub fn with_time_range(self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.with_start_time(start).with_end_time(end)
    }

    /// Override the page size used when fetching sample rows.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size.max(1));
        self
    }
}

/// Iterator over one session's spectral spans.
///
/// Call [`next`](SpectrumReader::next) until it returns `false`, reading each
/// completed span via [`current`](SpectrumReader::current); then check
/// [`error`](SpectrumReader::error) to distinguish exhaustion from failure.
pub struct SpectrumReader<T: SpectralData> {
    conn: Option<Connection>,
    session: ScanSession,
    session_id: i64,

    min_freq: f64,
    max_freq: f64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,

    batch_size: usize,
    offset: usize,
    pending: VecDeque<(DateTime<Utc>, T)>,
    rows_exhausted: bool,

    num_chunks: usize,
    current_span: Option<SpectralSpan<T>>,
    deferred: Option<(DateTime<Utc>, T)>,
    err: Option<StorageError>,
}

impl<T: SpectralData> SpectrumReader<T> {
    pub(super) fn new(
        conn: Connection,
        session_id: i64,
        options: ReadOptions,
    ) -> Result<Self, StorageError> {
        let session = conn
            .query_row(schema::SELECT_SESSION_SQL, params![session_id], scan_session)
            .map_err(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => StorageError::SessionNotFound(session_id),
                other => other.into(),
            })?;

        if let (Some(start), Some(end)) = (options.start_time, options.end_time) {
            if start > end {
                return Err(StorageError::InvalidTimeRange { start, end });
            }
        }
        if let (Some(min), Some(max)) = (options.min_freq, options.max_freq) {
            if min > max {
                return Err(StorageError::InvalidFrequencyRange { min, max });
            }
        }

        let mut min_freq = options.min_freq;
        let mut max_freq = options.max_freq;
        let mut start_time = options.start_time;
        let mut end_time = options.end_time;
        let mut empty = false;

        if min_freq.is_none() || max_freq.is_none() || start_time.is_none() || end_time.is_none() {
            let bounds = conn.query_row(
                schema::SELECT_FILTER_VALUES_SQL,
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, Option<f64>>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<DateTime<Utc>>>(2)?,
                        row.get::<_, Option<DateTime<Utc>>>(3)?,
                    ))
                },
            )?;
            match bounds {
                (Some(f_min), Some(f_max), Some(t_min), Some(t_max)) => {
                    min_freq.get_or_insert(f_min);
                    max_freq.get_or_insert(f_max);
                    start_time.get_or_insert(t_min);
                    end_time.get_or_insert(t_max);
                }
                // Session has no samples at all; stream nothing.
                _ => empty = true,
            }
        }

        Ok(SpectrumReader {
            conn: Some(conn),
            session,
            session_id,
            min_freq: min_freq.unwrap_or(0.0),
            max_freq: max_freq.unwrap_or(0.0),
            start_time: start_time.unwrap_or_default(),
            end_time: end_time.unwrap_or_default(),
            batch_size: options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            offset: 0,
            pending: VecDeque::new(),
            rows_exhausted: empty,
            num_chunks: 0,
            current_span: None,
            deferred: None,
            err: None,
        })
    }

    /// Metadata of the session being read.
    pub fn session(&self) -> &ScanSession {
        &self.session
    }

    /// Advance to the next complete span. Returns `true` while a span is
    /// available through [`current`](SpectrumReader::current).
    pub fn next(&mut self) -> bool {
        if self.err.is_some() || self.conn.is_none() {
            return false;
        }

        if let Some((timestamp, sample)) = self.deferred.take() {
            if let Err(err) = self.start_span(timestamp, sample) {
                self.err = Some(err);
                return false;
            }
        }

        loop {
            let row = match self.next_row() {
                Ok(row) => row,
                Err(err) => {
                    self.err = Some(err);
                    return false;
                }
            };

            let (timestamp, sample) = match row {
                Some(row) => row,
                None => {
                    let has_samples = self
                        .current_span
                        .as_ref()
                        .is_some_and(|span| !span.samples.is_empty());
                    if !has_samples {
                        return false;
                    }
                    if let Err(err) = self.close_current_span() {
                        self.err = Some(err);
                        return false;
                    }
                    // The final span ends the stream; the sentinel keeps it
                    // distinguishable from a real failure.
                    self.err = Some(StorageError::NoData);
                    return true;
                }
            };

            let last = self
                .current_span
                .as_ref()
                .and_then(|span| span.samples.last().cloned());
            let last = match last {
                None => {
                    if let Err(err) = self.start_span(timestamp, sample) {
                        self.err = Some(err);
                        return false;
                    }
                    continue;
                }
                Some(last) => last,
            };

            // Frequency rolled over: the current span is complete and the
            // new sample seeds the next one.
            if sample.frequency() < last.frequency() {
                if let Err(err) = self.close_current_span() {
                    self.err = Some(err);
                    return false;
                }
                self.deferred = Some((timestamp, sample));
                return true;
            }

            // Interior gap wider than one bin.
            if freq_less(
                last.frequency() + last.bin_width(),
                sample.frequency(),
                last.bin_width(),
            ) {
                let gap = match fill_frequency_range(
                    last.frequency() + last.bin_width(),
                    sample.frequency(),
                    false,
                    &last,
                ) {
                    Ok(gap) => gap,
                    Err(err) => {
                        self.err = Some(err);
                        return false;
                    }
                };
                if let Some(span) = self.current_span.as_mut() {
                    span.samples.extend(gap);
                }
            }

            if let Some(span) = self.current_span.as_mut() {
                span.samples.push(sample);
            }
        }
    }

    /// The last completed span.
    pub fn current(&self) -> Option<&SpectralSpan<T>> {
        self.current_span.as_ref()
    }

    /// Terminal error, if any. End-of-stream is not an error: the
    /// [`StorageError::NoData`] sentinel is never reported here.
    pub fn error(&self) -> Option<&StorageError> {
        match &self.err {
            Some(StorageError::NoData) => None,
            other => other.as_ref(),
        }
    }

    /// Release the reader's database connection. Idempotent.
    pub fn close(&mut self) {
        self.conn = None;
        self.pending.clear();
        self.deferred = None;
        self.current_span = None;
    }

    fn next_row(&mut self) -> Result<Option<(DateTime<Utc>, T)>, StorageError> {
        if self.pending.is_empty() && !self.rows_exhausted {
            self.fetch_batch()?;
        }
        Ok(self.pending.pop_front())
    }

    fn fetch_batch(&mut self) -> Result<(), StorageError> {
        let conn = match &self.conn {
            Some(conn) => conn,
            None => {
                self.rows_exhausted = true;
                return Ok(());
            }
        };

        let mut stmt = conn.prepare_cached(T::query_sql())?;
        let rows = stmt.query_map(
            params![
                self.session_id,
                self.start_time,
                self.end_time,
                self.min_freq,
                self.max_freq,
                self.batch_size as i64,
                self.offset as i64,
            ],
            |row| T::scan_row(row),
        )?;

        let mut fetched = 0;
        for row in rows {
            self.pending.push_back(row?);
            fetched += 1;
        }
        self.offset += fetched;
        if fetched < self.batch_size {
            self.rows_exhausted = true;
        }
        Ok(())
    }

    fn start_span(&mut self, timestamp: DateTime<Utc>, sample: T) -> Result<(), StorageError> {
        if self.num_chunks == 0 && sample.bin_width() > 0.0 {
            // Padded by 10% to absorb rounding and bin width variation.
            let n = (self.max_freq - self.min_freq) / sample.bin_width();
            self.num_chunks = (n * 1.1).ceil() as usize;
        }

        let mut samples = Vec::with_capacity(self.num_chunks.max(1));
        let mut frequency_start = sample.frequency();

        if freq_greater(sample.frequency(), self.min_freq, sample.bin_width()) {
            let gap = fill_frequency_range(self.min_freq, sample.frequency(), false, &sample)?;
            samples.extend(gap);
            frequency_start = self.min_freq;
        }
        samples.push(sample);

        self.current_span = Some(SpectralSpan {
            timestamp,
            frequency_start,
            frequency_end: 0.0,
            samples,
        });
        Ok(())
    }

    fn close_current_span(&mut self) -> Result<(), StorageError> {
        let max_freq = self.max_freq;
        let Some(span) = self.current_span.as_mut() else {
            return Ok(());
        };
        let Some(last) = span.samples.last().cloned() else {
            return Ok(());
        };

        span.frequency_end = last.frequency();
        if freq_less(last.frequency(), max_freq, last.bin_width()) {
            let gap =
                fill_frequency_range(last.frequency() + last.bin_width(), max_freq, true, &last)?;
            span.samples.extend(gap);
            span.frequency_end = max_freq;
        }
        Ok(())
    }
}

impl<T: SpectralData> Drop for SpectrumReader<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fill `[start, end]` (or `[start, end)` when `include_end` is false) with
/// zero-power sentinel points one bin apart, copying parameters from
/// `template`. The synthesized run never exceeds `end`.
fn fill_frequency_range<T: SpectralData>(
    start: f64,
    end: f64,
    include_end: bool,
    template: &T,
) -> Result<Vec<T>, StorageError> {
    let bin_width = template.bin_width();
    if bin_width <= 0.0 {
        return Err(StorageError::InvalidBinWidth(bin_width));
    }

    let num_points = ((end - start) / bin_width).floor() as i64 + 1;
    if num_points <= 0 {
        return Ok(Vec::new());
    }

    let mut points = Vec::with_capacity(num_points as usize);
    for i in 0..num_points {
        let frequency = start + i as f64 * bin_width;
        let within = if include_end {
            !freq_greater(frequency, end, bin_width)
        } else {
            freq_less(frequency, end, bin_width)
        };
        if !within {
            break;
        }
        points.push(T::zero_point(frequency, template));
    }
    Ok(points)
}

/// Compare frequencies with a tolerance of 1% of the bin width, absorbing
/// float accumulation across long fills.
fn freq_compare(a: f64, b: f64, bin_width: f64) -> std::cmp::Ordering {
    let tolerance = bin_width * 0.01;
    let diff = a - b;
    if diff.abs() <= tolerance {
        std::cmp::Ordering::Equal
    } else if diff < 0.0 {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

fn freq_less(a: f64, b: f64, bin_width: f64) -> bool {
    freq_compare(a, b, bin_width) == std::cmp::Ordering::Less
}

fn freq_greater(a: f64, b: f64, bin_width: f64) -> bool {
    freq_compare(a, b, bin_width) == std::cmp::Ordering::Greater
}
