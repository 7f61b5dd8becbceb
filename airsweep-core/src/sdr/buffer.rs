//! Frequency-ordered reassembly buffer for sweep chunks.
//!
//! Sweeper chunks can arrive out of order within a sweep, interleaved across
//! the rollover into the next sweep, and with small timestamp inversions
//! between adjacent chunks. [`SweepsBuffer`] keeps them in
//! frequency-then-sweep order without knowing the configured band in
//! advance: it discovers the band edges from the chunks themselves.

use std::collections::VecDeque;

use chrono::Duration;
use parking_lot::Mutex;
use thiserror::Error;

use super::SweepResult;

/// Minimum number of chunks in a complete sweep required to reliably detect
/// frequency rollover. Below this, the half-band test degenerates and the
/// buffer falls back to strict frequency ordering with FIFO tie-breaks. The
/// value is empirical.
const MIN_SPECTRUM_CHUNKS_THRESHOLD: i64 = 5;

/// Invalid buffer construction parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Capacity must be at least one sweep.
    #[error("buffer capacity must be positive: {0} given")]
    InvalidCapacity(usize),

    /// Flush count must be in `[1, capacity]`.
    #[error("flush count must be between 1 and capacity {capacity}: {flush_count} given")]
    InvalidFlushCount { capacity: usize, flush_count: usize },
}

/// Relative placement of one chunk against another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Before,
    After,
}

struct Inner {
    /// Minimum observed start frequency in Hz.
    base_freq: f64,
    /// Maximum observed end frequency in Hz.
    max_freq: f64,
    /// Last observed bin width in Hz.
    bin_width: f64,
    sweeps: VecDeque<SweepResult>,
}

/// A bounded, thread-safe buffer holding sweep chunks in frequency-then-sweep
/// order while tolerating out-of-order arrival and sweep rollover.
pub struct SweepsBuffer {
    capacity: usize,
    flush_count: usize,
    inner: Mutex<Inner>,
}

impl SweepsBuffer {
    /// Create a buffer storing up to `capacity` sweeps; `flush` removes
    /// `flush_count` sweeps at a time.
    pub fn new(capacity: usize, flush_count: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::InvalidCapacity(capacity));
        }
        if flush_count == 0 || flush_count > capacity {
            return Err(BufferError::InvalidFlushCount {
                capacity,
                flush_count,
            });
        }
        Ok(SweepsBuffer {
            capacity,
            flush_count,
            inner: Mutex::new(Inner {
                base_freq: f64::MAX,
                max_freq: 0.0,
                bin_width: 0.0,
                sweeps: VecDeque::new(),
            }),
        })
    }

    /// Insert a sweep chunk at its frequency-ordered position, nudging its
    /// timestamp forward by one microsecond if it would otherwise run
    /// backwards against its predecessor. Runs in O(size).
    pub fn insert(&self, sweep: SweepResult) {
        self.inner.lock().insert(sweep);
    }

    /// Whether the buffer has reached its capacity.
    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.sweeps.len() >= self.capacity
    }

    /// Remove and return the oldest `flush_count` sweeps in order, plus any
    /// excess over capacity. Returns an empty vector when the buffer is
    /// empty.
    pub fn flush(&self) -> Vec<SweepResult> {
        let mut inner = self.inner.lock();
        if inner.sweeps.is_empty() {
            return Vec::new();
        }

        let mut count = self.flush_count;
        if inner.sweeps.len() > self.capacity {
            count += inner.sweeps.len() - self.capacity;
        }
        let count = count.min(inner.sweeps.len());

        inner.sweeps.drain(..count).collect()
    }

    /// Remove and return all sweeps in order.
    pub fn drain(&self) -> Vec<SweepResult> {
        let mut inner = self.inner.lock();
        inner.sweeps.drain(..).collect()
    }

    /// Current number of buffered sweeps.
    pub fn len(&self) -> usize {
        self.inner.lock().sweeps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all buffered sweeps, keeping the discovered band edges.
    pub fn clear(&self) {
        self.inner.lock().sweeps.clear();
    }
}

impl Inner {
    fn insert(&mut self, mut sweep: SweepResult) {
        self.update_frequency_range(&sweep);

        if self.sweeps.is_empty() {
            self.sweeps.push_front(sweep);
            return;
        }

        // Chunk belongs before the current head.
        if self.place(&sweep, &self.sweeps[0]) == Placement::Before {
            self.sweeps.push_front(sweep);
            return;
        }

        for i in 0..self.sweeps.len() {
            let at_tail = i + 1 == self.sweeps.len();
            if at_tail || self.place(&self.sweeps[i + 1], &sweep) == Placement::After {
                // Temporal consistency: keep time weakly monotone within a
                // sweep while preserving frequency order.
                if sweep.timestamp < self.sweeps[i].timestamp {
                    sweep.timestamp = self.sweeps[i].timestamp + Duration::microseconds(1);
                }
                self.sweeps.insert(i + 1, sweep);
                return;
            }
        }
    }

    /// Chunk position index relative to the discovered band start.
    fn chunk_order(&self, sweep: &SweepResult) -> i64 {
        ((sweep.center_frequency() - self.base_freq) / self.bin_width) as i64
    }

    /// Decide whether chunk `a` belongs before or after chunk `b`, treating a
    /// low-half chunk following a high-half chunk as the start of the next
    /// sweep. For bands narrower than [`MIN_SPECTRUM_CHUNKS_THRESHOLD`]
    /// chunks, rollover detection is unreliable and chunks are ordered
    /// strictly by frequency, ties FIFO.
    fn place(&self, a: &SweepResult, b: &SweepResult) -> Placement {
        let ac = self.chunk_order(a);
        let bc = self.chunk_order(b);

        let total_chunks = ((self.max_freq - self.base_freq) / self.bin_width) as i64;
        let rollover_threshold = total_chunks / 2;

        let (a_low, b_low) = if total_chunks > MIN_SPECTRUM_CHUNKS_THRESHOLD {
            (ac < rollover_threshold, bc < rollover_threshold)
        } else {
            (false, false)
        };

        match (a_low, b_low) {
            // 'a' starts the next sweep; 'b' is the tail of the previous.
            (true, false) => Placement::After,
            (false, true) => Placement::Before,
            _ => {
                if ac >= bc {
                    Placement::After
                } else {
                    Placement::Before
                }
            }
        }
    }

    /// Converge the band edges toward the actual sweep boundaries: only
    /// lower the base on a lower start, only raise the max on a higher end.
    /// The bin width follows the last observed chunk.
    fn update_frequency_range(&mut self, sweep: &SweepResult) {
        if sweep.start_frequency < self.base_freq {
            self.base_freq = sweep.start_frequency;
        }
        if sweep.end_frequency > self.max_freq {
            self.max_freq = sweep.end_frequency;
        }
        self.bin_width = sweep.bin_width;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sweep(start: f64, end: f64, bin: f64, offset_secs: i64) -> SweepResult {
        SweepResult {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 31, 16, 0, 0).unwrap()
                + Duration::seconds(offset_secs),
            start_frequency: start,
            end_frequency: end,
            bin_width: bin,
            num_samples: 20,
            readings: Vec::new(),
            device: "rtl-sdr",
            device_id: "test".to_string(),
        }
    }

    #[test]
    fn test_ordering_within_sweep() {
        let buffer = SweepsBuffer::new(10, 5).unwrap();
        for start in [100_200_000.0, 100_100_000.0, 100_300_000.0] {
            buffer.insert(sweep(start, start + 100_000.0, 100_000.0, 0));
        }

        let starts: Vec<f64> = buffer.drain().iter().map(|s| s.start_frequency).collect();
        assert_eq!(starts, vec![100_100_000.0, 100_200_000.0, 100_300_000.0]);
    }

    #[test]
    fn test_ordering_across_rollover() {
        let buffer = SweepsBuffer::new(10, 5).unwrap();

        let inserts = [
            (5_000_700_000.0, 0),
            (5_000_600_000.0, 0),
            (5_000_800_000.0, 0),
            (1_000_000.0, 1),
            (5_000_900_000.0, 2),
            (1_300_000.0, 3),
            (1_200_000.0, 3),
        ];
        for (start, offset) in inserts {
            buffer.insert(sweep(start, start + 100_000.0, 100_000.0, offset));
        }
        assert_eq!(buffer.len(), inserts.len());

        let results = buffer.drain();
        let starts: Vec<f64> = results.iter().map(|s| s.start_frequency).collect();
        assert_eq!(
            starts,
            vec![
                5_000_600_000.0,
                5_000_700_000.0,
                5_000_800_000.0,
                5_000_900_000.0,
                1_000_000.0,
                1_200_000.0,
                1_300_000.0,
            ]
        );
    }

    #[test]
    fn test_timestamps_weakly_monotone_within_sweep() {
        let buffer = SweepsBuffer::new(10, 5).unwrap();
        // The 100.3 MHz chunk arrives with an older timestamp than the
        // 100.2 MHz chunk already in place.
        buffer.insert(sweep(100_200_000.0, 100_300_000.0, 100_000.0, 5));
        buffer.insert(sweep(100_300_000.0, 100_400_000.0, 100_000.0, 2));

        let results = buffer.drain();
        assert!(results[0].timestamp <= results[1].timestamp);
        assert_eq!(
            results[1].timestamp,
            results[0].timestamp + Duration::microseconds(1)
        );
    }

    #[test]
    fn test_flush_behavior() {
        let buffer = SweepsBuffer::new(3, 2).unwrap();
        buffer.insert(sweep(5_000_600_000.0, 5_000_800_000.0, 200_000.0, 0));
        buffer.insert(sweep(5_000_800_000.0, 5_001_000_000.0, 200_000.0, 1));
        buffer.insert(sweep(1_000_000.0, 1_200_000.0, 200_000.0, 2));

        assert!(buffer.is_full());

        let flushed = buffer.flush();
        assert_eq!(flushed.len(), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(flushed[0].start_frequency, 5_000_600_000.0);
        assert_eq!(flushed[1].start_frequency, 5_000_800_000.0);
    }

    #[test]
    fn test_empty_buffer_operations() {
        let buffer = SweepsBuffer::new(5, 2).unwrap();
        assert!(buffer.flush().is_empty());
        assert!(buffer.drain().is_empty());
        assert!(!buffer.is_full());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_clear_discards_contents() {
        let buffer = SweepsBuffer::new(5, 2).unwrap();
        buffer.insert(sweep(100_100_000.0, 100_200_000.0, 100_000.0, 0));
        buffer.insert(sweep(100_200_000.0, 100_300_000.0, 100_000.0, 1));
        assert_eq!(buffer.len(), 2);

        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            SweepsBuffer::new(0, 1).err(),
            Some(BufferError::InvalidCapacity(0))
        );
        assert_eq!(
            SweepsBuffer::new(5, 6).err(),
            Some(BufferError::InvalidFlushCount {
                capacity: 5,
                flush_count: 6
            })
        );
        assert_eq!(
            SweepsBuffer::new(5, 0).err(),
            Some(BufferError::InvalidFlushCount {
                capacity: 5,
                flush_count: 0
            })
        );
    }

    #[test]
    fn test_narrow_band_falls_back_to_strict_order() {
        // Band of 3 chunks: below the rollover threshold, so a low chunk
        // after a high chunk is NOT treated as a new sweep.
        let buffer = SweepsBuffer::new(10, 5).unwrap();
        buffer.insert(sweep(100_200_000.0, 100_300_000.0, 100_000.0, 0));
        buffer.insert(sweep(100_000_000.0, 100_100_000.0, 100_000.0, 1));
        buffer.insert(sweep(100_100_000.0, 100_200_000.0, 100_000.0, 2));

        let starts: Vec<f64> = buffer.drain().iter().map(|s| s.start_frequency).collect();
        assert_eq!(starts, vec![100_000_000.0, 100_100_000.0, 100_200_000.0]);
    }
}
