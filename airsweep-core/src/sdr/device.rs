//! Device sampling loop: drives an external sweeper subprocess, parses its
//! stdout into sweep results and reports its lifecycle.
//!
//! Each sampling run consists of three cooperating tasks — a stdout parse
//! loop, a stderr logger and a child exit waiter — feeding a capacity-3
//! completion channel, plus a coordinator that joins their outcomes into a
//! single result. The first fatal error cancels the run: the child is
//! killed, both pipes reach EOF and the remaining tasks drain.

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use super::buffer::SweepsBuffer;
use super::{Handler, SweepResult, PARSE_ERRORS_THRESHOLD};

/// A fatal device sampling error.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// `begin_sampling` was called while a previous run is still active.
    #[error("device is already sampling")]
    AlreadySampling,

    /// The sweeper subprocess could not be spawned.
    #[error("starting sweeper {runtime:?}: {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: io::Error,
    },

    /// A captured pipe was not available on the spawned child.
    #[error("{0} pipe unavailable")]
    PipeUnavailable(&'static str),

    /// The consecutive parse error budget was exhausted.
    #[error("too many consecutive parse errors")]
    TooManyParseErrors,

    /// A non-EOF I/O error occurred on one of the child's pipes.
    #[error("broken pipe reading {stream}: {source}")]
    BrokenPipe {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    /// Waiting on the child process failed.
    #[error("waiting for sweeper: {0}")]
    Wait(#[source] io::Error),

    /// The sweeper exited non-zero without being cancelled.
    #[error("sweeper exited with {0}")]
    ChildExit(ExitStatus),

    /// Multiple tasks of the same run failed; all errors are retained.
    #[error("{}", JoinedErrors(.0))]
    Sampling(Vec<DeviceError>),
}

struct JoinedErrors<'a>(&'a [DeviceError]);

impl fmt::Display for JoinedErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Outcome of a sampling run, delivered once the run has fully stopped.
pub type SamplingStopped = oneshot::Receiver<Result<(), DeviceError>>;

struct ActiveRun {
    cancel: Arc<Notify>,
    coordinator: JoinHandle<()>,
}

/// An SDR device that can begin and stop sweep collection.
pub struct Device {
    device_id: String,
    handler: Arc<dyn Handler>,
    buffer: Option<Arc<SweepsBuffer>>,
    parse_errors_threshold: u8,
    is_sampling: Arc<AtomicBool>,
    run: Mutex<Option<ActiveRun>>,
}

impl Device {
    pub fn new(device_id: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Device {
            device_id: device_id.into(),
            handler,
            buffer: None,
            parse_errors_threshold: PARSE_ERRORS_THRESHOLD,
            is_sampling: Arc::new(AtomicBool::new(false)),
            run: Mutex::new(None),
        }
    }

    /// Attach a reassembly buffer; sweeps are then emitted in
    /// frequency-then-sweep order instead of arrival order.
    pub fn with_buffer(mut self, buffer: SweepsBuffer) -> Self {
        self.buffer = Some(Arc::new(buffer));
        self
    }

    /// Override the consecutive parse error budget.
    pub fn with_parse_errors_threshold(mut self, threshold: u8) -> Self {
        self.parse_errors_threshold = threshold;
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Device family identifier of the underlying handler.
    pub fn device(&self) -> &'static str {
        self.handler.device()
    }

    pub fn is_sampling(&self) -> bool {
        self.is_sampling.load(Ordering::SeqCst)
    }

    /// Spawn the sweeper and start collecting samples into `samples`.
    ///
    /// Returns a receiver that yields the run's joined outcome once all
    /// tasks have stopped. `shutdown` cancels the run externally, as does
    /// [`Device::stop`]. Only one run may be active at a time; a spawn or
    /// pipe failure leaves the device idle.
    pub async fn begin_sampling(
        &self,
        samples: mpsc::Sender<SweepResult>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<SamplingStopped, DeviceError> {
        if self.is_sampling.swap(true, Ordering::SeqCst) {
            return Err(DeviceError::AlreadySampling);
        }

        let mut child = match self.handler.command().spawn() {
            Ok(child) => child,
            Err(source) => {
                self.is_sampling.store(false, Ordering::SeqCst);
                return Err(DeviceError::Spawn {
                    runtime: self.handler.runtime().display().to_string(),
                    source,
                });
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                self.is_sampling.store(false, Ordering::SeqCst);
                return Err(DeviceError::PipeUnavailable("stdout"));
            }
        };
        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                self.is_sampling.store(false, Ordering::SeqCst);
                return Err(DeviceError::PipeUnavailable("stderr"));
            }
        };

        info!(
            "device {}: started {} {}",
            self.device_id,
            self.handler.runtime().display(),
            self.handler.args().join(" ")
        );

        let cancel = Arc::new(Notify::new());
        let (done_tx, mut done_rx) = mpsc::channel::<Result<(), DeviceError>>(3);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        tokio::spawn(handle_stdout(
            stdout,
            self.handler.clone(),
            self.device_id.clone(),
            self.buffer.clone(),
            samples,
            self.parse_errors_threshold,
            done_tx.clone(),
        ));
        tokio::spawn(handle_stderr(
            stderr,
            self.handler.device(),
            self.device_id.clone(),
            done_tx.clone(),
        ));
        tokio::spawn(handle_child_exit(
            child,
            cancel.clone(),
            shutdown,
            done_tx,
        ));

        let coordinator = {
            let cancel = cancel.clone();
            let is_sampling = self.is_sampling.clone();
            let device_id = self.device_id.clone();
            tokio::spawn(async move {
                let mut errors = Vec::new();
                for _ in 0..3 {
                    match done_rx.recv().await {
                        Some(Ok(())) => {}
                        Some(Err(err)) => {
                            error!("device {device_id}: {err}");
                            cancel.notify_one();
                            errors.push(err);
                        }
                        None => break,
                    }
                }

                info!("device {device_id}: samples collection stopped");
                is_sampling.store(false, Ordering::SeqCst);

                let result = match errors.len() {
                    0 => Ok(()),
                    1 => Err(errors.pop().unwrap()),
                    _ => Err(DeviceError::Sampling(errors)),
                };
                let _ = stopped_tx.send(result);
            })
        };

        *self.run.lock().await = Some(ActiveRun { cancel, coordinator });
        Ok(stopped_rx)
    }

    /// Cancel the active run, if any, and wait for it to fully stop.
    /// Idempotent and safe to call from multiple tasks.
    pub async fn stop(&self) {
        let run = self.run.lock().await.take();
        if let Some(run) = run {
            run.cancel.notify_one();
            let _ = run.coordinator.await;
        }
    }
}

async fn handle_stdout(
    stdout: impl AsyncRead + Unpin,
    handler: Arc<dyn Handler>,
    device_id: String,
    buffer: Option<Arc<SweepsBuffer>>,
    samples: mpsc::Sender<SweepResult>,
    threshold: u8,
    done: mpsc::Sender<Result<(), DeviceError>>,
) {
    let mut parse_errors: u8 = 0;
    let mut lines = BufReader::new(stdout).lines();

    let result = loop {
        match lines.next_line().await {
            Ok(None) => break Ok(()),
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let sweep = match handler.parse(line, &device_id) {
                    Ok(sweep) => sweep,
                    Err(err) => {
                        parse_errors += 1;
                        warn!("device {device_id}: parsing samples: {err} (line: {line})");
                        if parse_errors >= threshold {
                            break Err(DeviceError::TooManyParseErrors);
                        }
                        continue;
                    }
                };
                parse_errors = 0;

                match &buffer {
                    None => {
                        if samples.send(sweep).await.is_err() {
                            // Sink is gone; nothing left to deliver to.
                            break Ok(());
                        }
                    }
                    Some(buffer) => {
                        buffer.insert(sweep);
                        if buffer.is_full() && !send_all(&samples, buffer.flush()).await {
                            break Ok(());
                        }
                    }
                }
            }
            Err(source) => {
                break Err(DeviceError::BrokenPipe {
                    stream: "stdout",
                    source,
                })
            }
        }
    };

    // Residual chunks are drained on EOF; a run that died on its parse
    // budget is not trusted to emit in-flight data.
    if !matches!(result, Err(DeviceError::TooManyParseErrors)) {
        if let Some(buffer) = &buffer {
            if !buffer.is_empty() {
                send_all(&samples, buffer.drain()).await;
            }
        }
    }

    let _ = done.send(result).await;
}

async fn send_all(samples: &mpsc::Sender<SweepResult>, sweeps: Vec<SweepResult>) -> bool {
    for sweep in sweeps {
        if samples.send(sweep).await.is_err() {
            return false;
        }
    }
    true
}

async fn handle_stderr(
    stderr: impl AsyncRead + Unpin,
    device: &'static str,
    device_id: String,
    done: mpsc::Sender<Result<(), DeviceError>>,
) {
    let mut lines = BufReader::new(stderr).lines();

    let result = loop {
        match lines.next_line().await {
            Ok(None) => break Ok(()),
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    warn!("device {device_id}: {device} >> {line}");
                }
            }
            Err(source) => {
                break Err(DeviceError::BrokenPipe {
                    stream: "stderr",
                    source,
                })
            }
        }
    };

    let _ = done.send(result).await;
}

async fn handle_child_exit(
    mut child: Child,
    cancel: Arc<Notify>,
    mut shutdown: broadcast::Receiver<()>,
    done: mpsc::Sender<Result<(), DeviceError>>,
) {
    let mut cancelled = false;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = cancel.notified() => {
            cancelled = true;
            let _ = child.start_kill();
            child.wait().await
        }
        _ = wait_for_shutdown(&mut shutdown) => {
            cancelled = true;
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let result = match status {
        Ok(status) if cancelled || status.success() => Ok(()),
        Ok(status) => Err(DeviceError::ChildExit(status)),
        Err(source) => Err(DeviceError::Wait(source)),
    };
    let _ = done.send(result).await;
}

/// Resolve when a shutdown broadcast arrives. A closed channel means no
/// shutdown can ever be signalled, so the future never resolves.
async fn wait_for_shutdown(shutdown: &mut broadcast::Receiver<()>) {
    loop {
        match shutdown.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::super::ParseError;
    use super::*;

    /// Drives `sh -c <script>` and parses lines with the rtl format.
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
            super::super::parse_sweep_line(line, "rtl-sdr", device_id, "%Y-%m-%d %H:%M:%S")
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

    const GOOD_LINE: &str = "2024-05-31, 16:05:22, 100000000, 101000000, 500000, 20, -14.2, -26.3";

    fn shutdown_pair() -> (broadcast::Sender<()>, broadcast::Receiver<()>) {
        broadcast::channel(1)
    }

    async fn run_script(script: &str) -> (Vec<SweepResult>, Result<(), DeviceError>) {
        let device = Device::new("test0", Arc::new(ScriptHandler::new(script)));
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = shutdown_pair();

        let stopped = device.begin_sampling(tx, shutdown_rx).await.unwrap();

        let mut sweeps = Vec::new();
        while let Some(sweep) = rx.recv().await {
            sweeps.push(sweep);
        }
        let result = stopped.await.unwrap();
        (sweeps, result)
    }

    #[tokio::test]
    async fn test_collects_parsed_sweeps() {
        let script = format!("printf '{GOOD_LINE}\\n{GOOD_LINE}\\n'");
        let (sweeps, result) = run_script(&script).await;

        assert!(result.is_ok());
        assert_eq!(sweeps.len(), 2);
        assert_eq!(sweeps[0].readings.len(), 2);
    }

    #[tokio::test]
    async fn test_parse_error_budget_exhausted() {
        let script = "printf 'bad\\nbad\\nbad\\nbad\\nbad\\n'; sleep 5";
        let (sweeps, result) = run_script(script).await;

        assert!(sweeps.is_empty());
        match result {
            Err(DeviceError::TooManyParseErrors) => {}
            Err(DeviceError::Sampling(errors)) => {
                assert!(errors
                    .iter()
                    .any(|e| matches!(e, DeviceError::TooManyParseErrors)));
            }
            other => panic!("expected parse error budget failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_good_line_resets_parse_error_counter() {
        let script = format!(
            "printf 'bad\\nbad\\nbad\\nbad\\n{GOOD_LINE}\\nbad\\nbad\\nbad\\nbad\\n'"
        );
        let (sweeps, result) = run_script(&script).await;

        assert!(result.is_ok(), "counter should reset on a good line: {result:?}");
        assert_eq!(sweeps.len(), 1);
    }

    #[tokio::test]
    async fn test_child_nonzero_exit_is_fatal() {
        let (_, result) = run_script("exit 3").await;
        match result {
            Err(DeviceError::ChildExit(status)) => assert_eq!(status.code(), Some(3)),
            other => panic!("expected child exit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_kills_child_and_is_idempotent() {
        let device = Device::new("test0", Arc::new(ScriptHandler::new("sleep 30")));
        let (tx, _rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = shutdown_pair();

        let stopped = device.begin_sampling(tx, shutdown_rx).await.unwrap();
        assert!(device.is_sampling());

        device.stop().await;
        device.stop().await; // second stop is a no-op

        assert!(stopped.await.unwrap().is_ok());
        assert!(!device.is_sampling());
    }

    #[tokio::test]
    async fn test_shutdown_broadcast_cancels() {
        let device = Device::new("test0", Arc::new(ScriptHandler::new("sleep 30")));
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = shutdown_pair();

        let stopped = device.begin_sampling(tx, shutdown_rx).await.unwrap();
        shutdown_tx.send(()).unwrap();

        assert!(stopped.await.unwrap().is_ok());
        assert!(!device.is_sampling());
    }

    #[tokio::test]
    async fn test_begin_sampling_rejects_concurrent_run() {
        let device = Device::new("test0", Arc::new(ScriptHandler::new("sleep 30")));
        let (tx, _rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = shutdown_pair();

        let _stopped = device.begin_sampling(tx.clone(), shutdown_rx).await.unwrap();

        let (_shutdown_tx2, shutdown_rx2) = shutdown_pair();
        match device.begin_sampling(tx, shutdown_rx2).await {
            Err(DeviceError::AlreadySampling) => {}
            other => panic!("expected AlreadySampling, got {other:?}"),
        }

        device.stop().await;
    }

    #[tokio::test]
    async fn test_buffered_device_reorders_and_drains() {
        let lines = [
            "2024-05-31, 16:05:22, 100200000, 100300000, 100000, 20, -20.0",
            "2024-05-31, 16:05:22, 100000000, 100100000, 100000, 20, -21.0",
            "2024-05-31, 16:05:22, 100100000, 100200000, 100000, 20, -22.0",
        ];
        let script = format!("printf '{}\\n'", lines.join("\\n"));

        let device = Device::new("test0", Arc::new(ScriptHandler::new(&script)))
            .with_buffer(SweepsBuffer::new(16, 4).unwrap());
        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = shutdown_pair();

        let stopped = device.begin_sampling(tx, shutdown_rx).await.unwrap();

        let mut starts = Vec::new();
        while let Some(sweep) = rx.recv().await {
            starts.push(sweep.start_frequency);
        }
        assert!(stopped.await.unwrap().is_ok());

        // EOF drains the residual buffer contents in frequency order.
        assert_eq!(starts, vec![100_000_000.0, 100_100_000.0, 100_200_000.0]);
    }
}
