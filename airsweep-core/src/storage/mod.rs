//! Per-flight spectrum store.
//!
//! One SQLite database per run holds session metadata, telemetry snapshots
//! and spectrum samples. The store keeps two lazily opened connections: a
//! durable write connection (WAL journaling, normal sync) and a read-only
//! connection for session queries. Span readers open their own read-only
//! connection so several may iterate concurrently.

mod models;
mod reader;
mod schema;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use thiserror::Error;

pub use models::SessionConfig;
pub use reader::{ReadOptions, SpectralData, SpectrumReader};

use crate::sdr::SweepResult;
use crate::spectrum::{ScanSession, SpectralPoint, SpectralPointWithTelemetry};
use crate::telemetry::Telemetry;

/// Errors produced by the store and its readers.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wrapped SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A connection could not be opened; the failure is cached and returned
    /// on every subsequent call.
    #[error("opening database connection: {0}")]
    Connection(String),

    /// Device configuration could not be serialized for persistence.
    #[error("serializing config: {0}")]
    ConfigSerialization(#[from] serde_json::Error),

    /// No session row exists with the requested id.
    #[error("session {0} not found")]
    SessionNotFound(i64),

    /// Reader filter bounds are inverted in time.
    #[error("start time {start} is after end time {end}")]
    InvalidTimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Reader filter bounds are inverted in frequency.
    #[error("min frequency {min} is greater than max frequency {max}")]
    InvalidFrequencyRange { min: f64, max: f64 },

    /// A gap-fill template carried a non-positive bin width.
    #[error("invalid bin width: {0}")]
    InvalidBinWidth(f64),

    /// End-of-stream sentinel: the final span was returned from a partially
    /// filled band. Distinguishable from a real error; reader `error()`
    /// never reports it.
    #[error("no data available")]
    NoData,

    /// The store has been closed.
    #[error("store is closed")]
    Closed,
}

/// A lazily opened connection whose open failure is cached.
struct LazyConn {
    conn: Option<Connection>,
    err: Option<String>,
}

impl LazyConn {
    const fn new() -> Self {
        LazyConn {
            conn: None,
            err: None,
        }
    }

    fn get_or_open(
        &mut self,
        open: impl FnOnce() -> Result<Connection, StorageError>,
    ) -> Result<&mut Connection, StorageError> {
        if let Some(err) = &self.err {
            return Err(StorageError::Connection(err.clone()));
        }
        if self.conn.is_none() {
            match open() {
                Ok(conn) => self.conn = Some(conn),
                Err(err) => {
                    let message = err.to_string();
                    self.err = Some(message.clone());
                    return Err(StorageError::Connection(message));
                }
            }
        }
        Ok(self.conn.as_mut().unwrap())
    }
}

/// Thread-safe writer and reader entry point over one flight database.
pub struct Store {
    db_path: PathBuf,
    write: Mutex<LazyConn>,
    read: Mutex<LazyConn>,
    closed: Mutex<bool>,
}

impl Store {
    /// Create a store over the given database path. Connections are opened
    /// on first use.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Store {
            db_path: db_path.into(),
            write: Mutex::new(LazyConn::new()),
            read: Mutex::new(LazyConn::new()),
            closed: Mutex::new(false),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_write(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(conn)
    }

    fn open_read(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(conn)
    }

    fn with_write<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if *self.closed.lock() {
            return Err(StorageError::Closed);
        }
        let mut guard = self.write.lock();
        let path = self.db_path.clone();
        let conn = guard.get_or_open(move || Self::open_write(&path))?;
        f(conn)
    }

    fn with_read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        if *self.closed.lock() {
            return Err(StorageError::Closed);
        }
        let mut guard = self.read.lock();
        let path = self.db_path.clone();
        let conn = guard.get_or_open(move || Self::open_read(&path))?;
        f(conn)
    }

    /// Create a new scanning session, returning its id. The start time is
    /// stamped by the database clock; `(device_id, start_time)` is unique.
    pub fn create_session(
        &self,
        device_type: &str,
        device_id: &str,
        config: Option<SessionConfig>,
    ) -> Result<i64, StorageError> {
        let config = match config {
            Some(config) => config.into_text()?,
            None => String::new(),
        };

        self.with_write(|conn| {
            conn.execute(
                schema::INSERT_SESSION_SQL,
                params![device_type, device_id, config],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Retrieve one session by id.
    pub fn session(&self, id: i64) -> Result<ScanSession, StorageError> {
        self.with_read(|conn| {
            conn.query_row(schema::SELECT_SESSION_SQL, params![id], models::scan_session)
                .map_err(|err| match err {
                    rusqlite::Error::QueryReturnedNoRows => StorageError::SessionNotFound(id),
                    other => other.into(),
                })
        })
    }

    /// All sessions in the database, oldest first.
    pub fn sessions(&self) -> Result<Vec<ScanSession>, StorageError> {
        self.with_read(|conn| {
            let mut stmt = conn.prepare(schema::SELECT_SESSIONS_SQL)?;
            let sessions = stmt
                .query_map([], models::scan_session)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
    }

    /// Append one telemetry snapshot, returning its id.
    pub fn store_telemetry(
        &self,
        session_id: i64,
        telemetry: &Telemetry,
    ) -> Result<i64, StorageError> {
        self.with_write(|conn| {
            conn.execute(
                schema::INSERT_TELEMETRY_SQL,
                params![
                    session_id,
                    telemetry.timestamp,
                    telemetry.latitude,
                    telemetry.longitude,
                    telemetry.altitude,
                    telemetry.roll,
                    telemetry.pitch,
                    telemetry.yaw,
                    telemetry.accel_x,
                    telemetry.accel_y,
                    telemetry.accel_z,
                    telemetry.ground_speed,
                    telemetry.ground_course,
                    telemetry.radio_rssi,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Persist all readings of one sweep inside a single transaction.
    /// Invalid readings are stored with NULL power; a sweep with no readings
    /// is a no-op.
    pub fn store_sweep_result(
        &self,
        session_id: i64,
        telemetry_id: Option<i64>,
        result: &SweepResult,
    ) -> Result<(), StorageError> {
        if result.readings.is_empty() {
            return Ok(());
        }

        self.with_write(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(schema::INSERT_SAMPLE_SQL)?;
                for reading in &result.readings {
                    let power = reading.is_valid.then_some(reading.power);
                    stmt.execute(params![
                        session_id,
                        result.timestamp,
                        reading.frequency,
                        result.bin_width,
                        power,
                        result.num_samples,
                        telemetry_id,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Every reader gets its own read-only connection so several may
    /// iterate concurrently; the store's closed state still applies.
    fn open_reader_conn(&self) -> Result<Connection, StorageError> {
        if *self.closed.lock() {
            return Err(StorageError::Closed);
        }
        Self::open_read(&self.db_path)
    }

    /// Stream plain spectral spans for one session.
    pub fn read_spectrum(
        &self,
        session_id: i64,
        options: ReadOptions,
    ) -> Result<SpectrumReader<SpectralPoint>, StorageError> {
        let conn = self.open_reader_conn()?;
        SpectrumReader::new(conn, session_id, options)
    }

    /// Stream telemetry-enriched spectral spans for one session.
    pub fn read_spectrum_with_telemetry(
        &self,
        session_id: i64,
        options: ReadOptions,
    ) -> Result<SpectrumReader<SpectralPointWithTelemetry>, StorageError> {
        let conn = self.open_reader_conn()?;
        SpectrumReader::new(conn, session_id, options)
    }

    /// Build the read-path indices and release both connections. Safe to
    /// call multiple times; subsequent calls are no-ops.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;

        let mut result = Ok(());
        let mut write = self.write.lock();
        if let Some(conn) = write.conn.take() {
            debug!("creating read indices on {:?}", self.db_path);
            if let Err(err) = conn.execute_batch(schema::INDEXES_SQL) {
                result = Err(err.into());
            }
        }
        self.read.lock().conn.take();
        result
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
