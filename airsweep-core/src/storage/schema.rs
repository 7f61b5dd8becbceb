//! Database schema and statement definitions for the per-flight spectrum
//! store.

/// Base schema, applied when the write connection is first opened.
pub const SCHEMA_SQL: &str = r#"
-- Capture sessions: one row per device per run
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time DATETIME NOT NULL,
    device_type TEXT NOT NULL,           -- 'rtl-sdr' or 'hackrf'
    device_id TEXT NOT NULL,             -- configured name, serial or index
    config TEXT NOT NULL,                -- opaque serialized device config
    UNIQUE(device_id, start_time)
);

-- Drone telemetry snapshots, appended as sweeps are consumed
CREATE TABLE IF NOT EXISTS telemetry (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    timestamp DATETIME NOT NULL,
    latitude REAL,
    longitude REAL,
    altitude REAL,
    roll REAL,
    pitch REAL,
    yaw REAL,
    accel_x REAL,
    accel_y REAL,
    accel_z REAL,
    ground_speed REAL,
    ground_course REAL,
    radio_rssi INTEGER,
    FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

-- Spectrum samples: one row per frequency bin per sweep chunk
CREATE TABLE IF NOT EXISTS samples (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    timestamp DATETIME NOT NULL,
    frequency REAL NOT NULL,             -- bin center in Hz
    bin_width REAL NOT NULL,
    power REAL,                          -- NULL when the reading was invalid
    num_samples INTEGER NOT NULL,
    telemetry_id INTEGER,
    FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE,
    FOREIGN KEY(telemetry_id) REFERENCES telemetry(id) ON DELETE SET NULL
);

-- Samples joined with their telemetry snapshot, for the enriched reader
CREATE VIEW IF NOT EXISTS v_samples_with_telemetry AS
SELECT
    s.id,
    s.session_id,
    s.timestamp,
    s.frequency,
    s.bin_width,
    s.power,
    s.num_samples,
    s.telemetry_id,
    t.timestamp AS telemetry_timestamp,
    t.latitude,
    t.longitude,
    t.altitude,
    t.roll,
    t.pitch,
    t.yaw,
    t.accel_x,
    t.accel_y,
    t.accel_z,
    t.ground_speed,
    t.ground_course,
    t.radio_rssi
FROM samples s
LEFT JOIN telemetry t ON s.telemetry_id = t.id;
"#;

/// Read-path indices, created once writing is finished (at `Store::close`)
/// so that inserts stay cheap during collection.
pub const INDEXES_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_samples_session_time_freq
    ON samples(session_id, timestamp, frequency);
CREATE INDEX IF NOT EXISTS idx_samples_session_freq_time
    ON samples(session_id, frequency, timestamp);
CREATE INDEX IF NOT EXISTS idx_samples_telemetry
    ON samples(telemetry_id) WHERE telemetry_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_telemetry_session
    ON telemetry(session_id);
"#;

/// Creates a capture session stamped with the database clock.
/// Parameters: device_type, device_id, config.
pub const INSERT_SESSION_SQL: &str = "
    INSERT INTO sessions (start_time, device_type, device_id, config)
    VALUES (CURRENT_TIMESTAMP, ?1, ?2, ?3)";

/// Retrieves one session by id.
pub const SELECT_SESSION_SQL: &str = "
    SELECT id, start_time, device_type, device_id, config
    FROM sessions
    WHERE id = ?1";

/// Retrieves all sessions, oldest first.
pub const SELECT_SESSIONS_SQL: &str = "
    SELECT id, start_time, device_type, device_id, config
    FROM sessions
    ORDER BY start_time, id";

/// Appends one telemetry snapshot.
pub const INSERT_TELEMETRY_SQL: &str = "
    INSERT INTO telemetry (
        session_id, timestamp,
        latitude, longitude, altitude,
        roll, pitch, yaw,
        accel_x, accel_y, accel_z,
        ground_speed, ground_course, radio_rssi
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

/// Appends one spectrum sample row.
pub const INSERT_SAMPLE_SQL: &str = "
    INSERT INTO samples (
        session_id, timestamp, frequency, bin_width, power, num_samples, telemetry_id
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// Frequency and time bounds over one session's samples, used to fill
/// absent reader filters.
pub const SELECT_FILTER_VALUES_SQL: &str = "
    SELECT MIN(frequency), MAX(frequency), MIN(timestamp), MAX(timestamp)
    FROM samples
    WHERE session_id = ?1";

/// One page of plain samples within the filter bounds, in span order.
pub const SELECT_SAMPLES_SQL: &str = "
    SELECT timestamp, frequency, power, bin_width, num_samples
    FROM samples
    WHERE session_id = ?1
        AND timestamp BETWEEN ?2 AND ?3
        AND frequency BETWEEN ?4 AND ?5
    ORDER BY timestamp, frequency
    LIMIT ?6 OFFSET ?7";

/// One page of telemetry-joined samples within the filter bounds.
pub const SELECT_SAMPLES_WITH_TELEMETRY_SQL: &str = "
    SELECT
        timestamp, frequency, power, bin_width, num_samples,
        telemetry_id, telemetry_timestamp,
        latitude, longitude, altitude,
        roll, pitch, yaw,
        accel_x, accel_y, accel_z,
        ground_speed, ground_course, radio_rssi
    FROM v_samples_with_telemetry
    WHERE session_id = ?1
        AND timestamp BETWEEN ?2 AND ?3
        AND frequency BETWEEN ?4 AND ?5
    ORDER BY timestamp, frequency
    LIMIT ?6 OFFSET ?7";

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(INDEXES_SQL).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"telemetry".to_string()));
        assert!(tables.contains(&"samples".to_string()));

        let views: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='view'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(views, vec!["v_samples_with_telemetry".to_string()]);
    }

    #[test]
    fn test_session_uniqueness_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();

        let insert = "INSERT INTO sessions (start_time, device_type, device_id, config)
                      VALUES ('2024-05-31 16:00:00', 'rtl-sdr', 'dev0', '{}')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
