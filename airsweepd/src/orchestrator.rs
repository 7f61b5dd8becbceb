//! Multi-device sweep orchestration: sessions, synchronized start, fan-in
//! and persistence.
//!
//! The orchestrator owns one [`Device`] per enabled configuration entry. On
//! `run` it creates a session row per device, releases every device loop
//! through a one-shot broadcast gate so sampling starts within a tight
//! window, and drains all sweep results through a single consumer that
//! attaches telemetry and writes to the store.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use airsweep_core::sdr::buffer::{BufferError, SweepsBuffer};
use airsweep_core::sdr::device::Device;
use airsweep_core::sdr::{hackrf, rtl, Handler, HandlerError, SweepResult};
use airsweep_core::storage::{SessionConfig, StorageError, Store};
use airsweep_core::telemetry::Provider;

use crate::config::{DeviceConfig, DeviceSettings};

/// Orchestration failures. Per-device sampling errors are logged, not
/// returned: one faulty device must not abort its peers.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no devices to sample")]
    NoDevices,

    #[error("device {0:?} already exists")]
    DuplicateDevice(String),

    #[error("creating device {name:?}: {source}")]
    CreateDevice {
        name: String,
        #[source]
        source: HandlerError,
    },

    #[error("creating buffer for device {name:?}: {source}")]
    CreateBuffer {
        name: String,
        #[source]
        source: BufferError,
    },

    #[error("serializing config for device {name:?}: {source}")]
    SerializeConfig {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("creating session for device {device_id:?}: {source}")]
    CreateSession {
        device_id: String,
        #[source]
        source: StorageError,
    },
}

/// Coordinates sampling across all configured devices and persists the
/// resulting spectrum.
pub struct Orchestrator {
    devices: Vec<Arc<Device>>,
    configs: HashMap<String, serde_json::Value>,
    store: Arc<Store>,
    telemetry: Option<Arc<dyn Provider>>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>) -> Self {
        Orchestrator {
            devices: Vec::new(),
            configs: HashMap::new(),
            store,
            telemetry: None,
        }
    }

    /// Attach a telemetry provider polled once per consumed sweep.
    pub fn with_telemetry(mut self, provider: Arc<dyn Provider>) -> Self {
        self.telemetry = Some(provider);
        self
    }

    /// Build and register the device described by `config`. Disabled
    /// entries are skipped; duplicate names are rejected.
    pub fn create_device(&mut self, config: &DeviceConfig) -> Result<(), OrchestratorError> {
        if !config.enabled {
            return Ok(());
        }

        let handler: Arc<dyn Handler> = match &config.settings {
            DeviceSettings::RtlSdr(settings) => Arc::new(
                rtl::Handler::new(settings).map_err(|source| OrchestratorError::CreateDevice {
                    name: config.name.clone(),
                    source,
                })?,
            ),
            DeviceSettings::HackRf(settings) => Arc::new(
                hackrf::Handler::new(settings).map_err(|source| {
                    OrchestratorError::CreateDevice {
                        name: config.name.clone(),
                        source,
                    }
                })?,
            ),
        };

        let mut device = Device::new(&config.name, handler);
        if let Some(buffer) = &config.buffer {
            let buffer = SweepsBuffer::new(buffer.capacity, buffer.flush_count).map_err(
                |source| OrchestratorError::CreateBuffer {
                    name: config.name.clone(),
                    source,
                },
            )?;
            device = device.with_buffer(buffer);
        }

        let serialized = serde_json::to_value(&config.settings).map_err(|source| {
            OrchestratorError::SerializeConfig {
                name: config.name.clone(),
                source,
            }
        })?;

        self.register(device, serialized)
    }

    fn register(
        &mut self,
        device: Device,
        config: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        if self.configs.contains_key(device.device_id()) {
            return Err(OrchestratorError::DuplicateDevice(
                device.device_id().to_string(),
            ));
        }
        self.configs
            .insert(device.device_id().to_string(), config);
        self.devices.push(Arc::new(device));
        Ok(())
    }

    /// Begin synchronized data collection across all registered devices and
    /// block until every device loop has stopped and all drained sweeps are
    /// persisted.
    ///
    /// A message on `shutdown` cancels every device. A device that fails to
    /// start cancels its peers; a device that fails while sampling is only
    /// logged.
    pub async fn run(
        &mut self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        if self.devices.is_empty() {
            return Err(OrchestratorError::NoDevices);
        }

        let mut sessions = HashMap::new();
        for device in &self.devices {
            let config = self.configs.get(device.device_id()).cloned();
            let session_id = self
                .store
                .create_session(
                    device.device(),
                    device.device_id(),
                    config.map(SessionConfig::from),
                )
                .map_err(|source| OrchestratorError::CreateSession {
                    device_id: device.device_id().to_string(),
                    source,
                })?;
            info!(
                "device {}: session {session_id} created",
                device.device_id()
            );
            sessions.insert(device.device_id().to_string(), session_id);
        }

        let (gate_tx, _) = broadcast::channel::<()>(1);
        let (cancel_tx, _) = broadcast::channel::<()>(1);
        let (samples_tx, samples_rx) = mpsc::channel::<SweepResult>(self.devices.len());

        // Forward the caller's shutdown signal to every device.
        let forward = tokio::spawn({
            let cancel_tx = cancel_tx.clone();
            let mut shutdown = shutdown;
            async move {
                if shutdown.recv().await.is_ok() {
                    info!("shutdown requested, stopping devices");
                    let _ = cancel_tx.send(());
                }
            }
        });

        let consumer = tokio::spawn(consume_sweeps(
            samples_rx,
            self.store.clone(),
            self.telemetry.clone(),
            sessions,
        ));

        let mut tasks = Vec::with_capacity(self.devices.len());
        for device in &self.devices {
            let device = device.clone();
            let samples = samples_tx.clone();
            let mut gate = gate_tx.subscribe();
            let cancel_rx = cancel_tx.subscribe();
            let cancel_peers = cancel_tx.clone();
            tasks.push(tokio::spawn(async move {
                let _ = gate.recv().await;

                match device.begin_sampling(samples, cancel_rx).await {
                    Err(err) => {
                        error!("device {}: {err}", device.device_id());
                        // A device that never started aborts the run.
                        let _ = cancel_peers.send(());
                    }
                    Ok(stopped) => {
                        if let Ok(Err(err)) = stopped.await {
                            error!("device {}: sampling stopped: {err}", device.device_id());
                        }
                    }
                }
            }));
        }
        drop(samples_tx);

        // Release every device loop at once.
        let _ = gate_tx.send(());

        for task in tasks {
            let _ = task.await;
        }
        forward.abort();
        let _ = consumer.await;

        Ok(())
    }
}

/// Drain the fan-in channel: attach the freshest telemetry snapshot to each
/// sweep and persist it. Telemetry loss is preferred over spectrum loss, so
/// a failed telemetry insert only downgrades the sweep to unlinked.
async fn consume_sweeps(
    mut samples: mpsc::Receiver<SweepResult>,
    store: Arc<Store>,
    telemetry: Option<Arc<dyn Provider>>,
    sessions: HashMap<String, i64>,
) {
    while let Some(sweep) = samples.recv().await {
        let Some(&session_id) = sessions.get(&sweep.device_id) else {
            warn!("dropping sweep from unknown device {:?}", sweep.device_id);
            continue;
        };

        let telemetry_id = match telemetry.as_ref().and_then(|provider| provider.get()) {
            None => None,
            Some(snapshot) => match store.store_telemetry(session_id, &snapshot) {
                Ok(id) => Some(id),
                Err(err) => {
                    error!("storing telemetry: {err}");
                    None
                }
            },
        };

        if let Err(err) = store.store_sweep_result(session_id, telemetry_id, &sweep) {
            error!("storing sweep result: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};

    use airsweep_core::sdr::ParseError;
    use airsweep_core::storage::ReadOptions;
    use airsweep_core::telemetry::Telemetry;

    use super::*;

    /// Runs `sh -c <script>`, parsing stdout in rtl_power format.
    struct ScriptHandler {
        bin: PathBuf,
        args: Vec<String>,
    }

    impl ScriptHandler {
        fn new(script: &str) -> Self {
            ScriptHandler {
                bin: PathBuf::from("/bin/sh"),
                args: vec!["-c".to_string(), script.to_string()],
            }
        }
    }

    impl Handler for ScriptHandler {
        fn parse(&self, line: &str, device_id: &str) -> Result<SweepResult, ParseError> {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            Ok(SweepResult {
                timestamp: Utc
                    .with_ymd_and_hms(2024, 5, 31, 16, 0, fields[0].parse().unwrap())
                    .unwrap(),
                start_frequency: fields[1].parse().unwrap(),
                end_frequency: fields[2].parse().unwrap(),
                bin_width: fields[3].parse().unwrap(),
                num_samples: 20,
                readings: fields[4..]
                    .iter()
                    .enumerate()
                    .map(|(i, p)| airsweep_core::sdr::PowerReading {
                        frequency: fields[1].parse::<f64>().unwrap()
                            + i as f64 * fields[3].parse::<f64>().unwrap()
                            + fields[3].parse::<f64>().unwrap() / 2.0,
                        power: p.parse().unwrap(),
                        is_valid: true,
                    })
                    .collect(),
                device: "rtl-sdr",
                device_id: device_id.to_string(),
            })
        }

        fn device(&self) -> &'static str {
            "rtl-sdr"
        }

        fn runtime(&self) -> &Path {
            &self.bin
        }

        fn args(&self) -> &[String] {
            &self.args
        }
    }

    struct StaticProvider {
        snapshots: Mutex<Vec<Telemetry>>,
    }

    impl Provider for StaticProvider {
        fn get(&self) -> Option<Telemetry> {
            self.snapshots.lock().unwrap().pop()
        }
    }

    fn temp_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::new(dir.path().join("flight.sqlite")));
        (dir, store)
    }

    fn script_device(name: &str, script: &str) -> Device {
        Device::new(name, Arc::new(ScriptHandler::new(script)))
    }

    #[tokio::test]
    async fn test_run_requires_devices() {
        let (_dir, store) = temp_store();
        let mut orchestrator = Orchestrator::new(store);
        let (_tx, rx) = broadcast::channel(1);
        assert!(matches!(
            orchestrator.run(rx).await,
            Err(OrchestratorError::NoDevices)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_device_rejected() {
        let (_dir, store) = temp_store();
        let mut orchestrator = Orchestrator::new(store);

        orchestrator
            .register(script_device("rtl0", "true"), serde_json::json!({}))
            .unwrap();
        assert!(matches!(
            orchestrator.register(script_device("rtl0", "true"), serde_json::json!({})),
            Err(OrchestratorError::DuplicateDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let (_dir, store) = temp_store();
        let mut orchestrator = Orchestrator::new(store.clone());

        // Ten sweeps over 100-200 MHz at 25 MHz bins, two chunks each.
        let mut lines = Vec::new();
        for sweep in 0..10 {
            lines.push(format!("{sweep}, 100000000, 150000000, 25000000, -40.0, -41.0"));
            lines.push(format!("{sweep}, 150000000, 200000000, 25000000, -42.0, -43.0"));
        }
        let script = format!("printf '{}\\n'", lines.join("\\n"));

        orchestrator
            .register(script_device("rtl0", &script), serde_json::json!({}))
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        orchestrator.run(shutdown_rx).await.unwrap();

        let sessions = store.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        let session_id = sessions[0].id;

        let mut reader = store.read_spectrum(session_id, ReadOptions::new()).unwrap();
        let mut spans = Vec::new();
        while reader.next() {
            spans.push(reader.current().unwrap().clone());
        }
        assert!(reader.error().is_none());

        // One span per sweep, each dense over the whole band.
        assert_eq!(spans.len(), 10);
        for span in &spans {
            assert_eq!(span.frequency_start, 112_500_000.0);
            assert_eq!(span.frequency_end, 187_500_000.0);
            let powers: Vec<Option<f64>> = span.samples.iter().map(|s| s.power).collect();
            assert_eq!(
                powers,
                vec![Some(-40.0), Some(-41.0), Some(-42.0), Some(-43.0)]
            );
        }
        // Spans arrive in time order.
        for pair in spans.windows(2) {
            assert!(pair[0].timestamp < pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn test_telemetry_attached_to_sweeps() {
        let (_dir, store) = temp_store();

        let provider = Arc::new(StaticProvider {
            snapshots: Mutex::new(vec![Telemetry {
                timestamp: Utc.with_ymd_and_hms(2024, 5, 31, 16, 0, 0).unwrap(),
                altitude: Some(80.0),
                ..Telemetry::default()
            }]),
        });

        let mut orchestrator = Orchestrator::new(store.clone()).with_telemetry(provider);
        orchestrator
            .register(
                script_device(
                    "rtl0",
                    "printf '0, 100000000, 150000000, 25000000, -40.0, -41.0\\n'",
                ),
                serde_json::json!({}),
            )
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        orchestrator.run(shutdown_rx).await.unwrap();

        let session_id = store.sessions().unwrap()[0].id;
        let mut reader = store
            .read_spectrum_with_telemetry(session_id, ReadOptions::new())
            .unwrap();
        assert!(reader.next());
        let span = reader.current().unwrap();
        let linked = span.samples[0].telemetry.as_ref().unwrap();
        assert_eq!(linked.altitude, Some(80.0));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_devices() {
        let (_dir, store) = temp_store();
        let mut orchestrator = Orchestrator::new(store);

        orchestrator
            .register(script_device("rtl0", "sleep 30"), serde_json::json!({}))
            .unwrap();
        orchestrator
            .register(script_device("rtl1", "sleep 30"), serde_json::json!({}))
            .unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            let _ = shutdown_tx.send(());
        });

        orchestrator.run(shutdown_rx).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_created_per_device() {
        let (_dir, store) = temp_store();
        let mut orchestrator = Orchestrator::new(store.clone());

        orchestrator
            .register(script_device("rtl0", "true"), serde_json::json!({"gain": 1}))
            .unwrap();
        orchestrator
            .register(script_device("rtl1", "true"), serde_json::json!({"gain": 2}))
            .unwrap();

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        orchestrator.run(shutdown_rx).await.unwrap();

        let sessions = store.sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let mut device_ids: Vec<String> =
            sessions.iter().map(|s| s.device_id.clone()).collect();
        device_ids.sort();
        assert_eq!(device_ids, vec!["rtl0", "rtl1"]);
        assert!(sessions.iter().all(|s| s.config.is_some()));
    }
}
