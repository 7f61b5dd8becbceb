//! Row conversion helpers shared by the store and the span reader.

use chrono::{DateTime, Utc};
use rusqlite::Row;

use super::StorageError;
use crate::spectrum::ScanSession;

/// Opaque device configuration attached to a session row.
///
/// Strings are stored as-is, byte sequences as text, and structured values
/// as compact JSON; the store never interprets the content.
#[derive(Debug, Clone)]
pub enum SessionConfig {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl SessionConfig {
    pub(super) fn into_text(self) -> Result<String, StorageError> {
        match self {
            SessionConfig::Text(text) => Ok(text),
            SessionConfig::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            SessionConfig::Json(value) => Ok(serde_json::to_string(&value)?),
        }
    }
}

impl From<String> for SessionConfig {
    fn from(value: String) -> Self {
        SessionConfig::Text(value)
    }
}

impl From<&str> for SessionConfig {
    fn from(value: &str) -> Self {
        SessionConfig::Text(value.to_string())
    }
}

impl From<Vec<u8>> for SessionConfig {
    fn from(value: Vec<u8>) -> Self {
        SessionConfig::Bytes(value)
    }
}

impl From<serde_json::Value> for SessionConfig {
    fn from(value: serde_json::Value) -> Self {
        SessionConfig::Json(value)
    }
}

/// Scan a `sessions` row in `SELECT_SESSION_SQL` column order.
pub(super) fn scan_session(row: &Row<'_>) -> rusqlite::Result<ScanSession> {
    let config: String = row.get(4)?;
    Ok(ScanSession {
        id: row.get(0)?,
        start_time: row.get::<_, DateTime<Utc>>(1)?,
        device_type: row.get(2)?,
        device_id: row.get(3)?,
        config: if config.is_empty() { None } else { Some(config) },
    })
}
