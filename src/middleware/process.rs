use futures::{SinkExt, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BridgeState;
use crate::codec::{Decoded, FrameCodec};
use crate::config::MiddlewareConfig;
use crate::error::MiddlewareError;
use crate::message::Message;
use crate::metrics::Metrics;

const MALFORMED_ORIGIN: &str = "middleware";

/// Owns one middleware child process and the tasks pumping its pipes.
pub struct MiddlewareBridge {
    command: String,
    state: Arc<watch::Sender<BridgeState>>,
    outbound: mpsc::Sender<Arc<Message>>,
    inbound: Mutex<Option<mpsc::Receiver<Message>>>,
    stop_timeout: Duration,
    /// Tells the writer to flush its queue and close stdin
    drain_token: CancellationToken,
    close_token: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Move from `Closing` to `Closed`.
fn mark_closed(state: &watch::Sender<BridgeState>) {
    state.send_if_modified(|current| {
        if *current == BridgeState::Closing {
            *current = BridgeState::Closed;
            true
        } else {
            false
        }
    });
}

/// Move to `Failed` unless the bridge is already shutting down.
fn mark_failed(state: &watch::Sender<BridgeState>, metrics: &Metrics, reason: &str) {
    let changed = state.send_if_modified(|current| {
        if matches!(current, BridgeState::Starting | BridgeState::Running) {
            *current = BridgeState::Failed;
            true
        } else {
            false
        }
    });
    if changed {
        metrics.middleware_failures.inc();
        error!("Middleware failed: {}", reason);
    }
}

impl MiddlewareBridge {
    pub async fn spawn(
        config: &MiddlewareConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self, MiddlewareError> {
        let (state, _) = watch::channel(BridgeState::Starting);
        let state = Arc::new(state);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = config.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            state.send_replace(BridgeState::Failed);
            MiddlewareError::SpawnFailed(format!("{}: {}", config.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| MiddlewareError::SpawnFailed("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MiddlewareError::SpawnFailed("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MiddlewareError::SpawnFailed("stderr not captured".into()))?;
        let pid = child.id();

        let (outbound, outbound_rx) = mpsc::channel(config.queue_size.max(1));
        let (inbound_tx, inbound) = mpsc::channel(config.queue_size.max(1));
        let drain_token = CancellationToken::new();
        let close_token = CancellationToken::new();

        tokio::spawn(write_loop(
            stdin,
            outbound_rx,
            state.clone(),
            metrics.clone(),
            drain_token.clone(),
            close_token.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            stdout,
            inbound_tx,
            state.clone(),
            metrics.clone(),
            close_token.clone(),
        ));
        tokio::spawn(log_stderr(stderr, config.command.clone()));
        let supervisor = tokio::spawn(supervise(
            child,
            state.clone(),
            metrics,
            close_token.clone(),
            config.stop_timeout(),
        ));

        // The child may already have died; never overwrite `Failed`.
        state.send_if_modified(|current| {
            if *current == BridgeState::Starting {
                *current = BridgeState::Running;
                true
            } else {
                false
            }
        });
        info!(command = %config.command, pid = ?pid, "Middleware started");

        Ok(Self {
            command: config.command.clone(),
            state,
            outbound,
            inbound: Mutex::new(Some(inbound)),
            stop_timeout: config.stop_timeout(),
            drain_token,
            close_token,
            reader: Mutex::new(Some(reader)),
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    /// Watch state transitions, e.g. to react to `Failed`.
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    /// Queue a message for the child. Waits only for queue space.
    pub async fn send(&self, message: Arc<Message>) -> Result<(), MiddlewareError> {
        let state = self.state();
        if state != BridgeState::Running {
            return Err(MiddlewareError::NotRunning(state));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| MiddlewareError::StreamClosed("outbound queue closed".into()))
    }

    /// Messages produced by the child. Can be taken once.
    pub async fn receive(&self) -> Result<ReceiverStream<Message>, MiddlewareError> {
        self.inbound
            .lock()
            .await
            .take()
            .map(ReceiverStream::new)
            .ok_or(MiddlewareError::ReceiverTaken)
    }

    /// Resolves once the bridge has failed. Pending forever if it closes
    /// cleanly instead.
    pub async fn failed(&self) {
        let mut rx = self.subscribe();
        let failed = matches!(
            rx.wait_for(|s| s.is_terminal()).await.as_deref(),
            Ok(BridgeState::Failed)
        );
        if !failed {
            std::future::pending::<()>().await;
        }
    }

    fn begin_closing(&self) {
        self.state.send_if_modified(|current| {
            if matches!(current, BridgeState::Starting | BridgeState::Running) {
                *current = BridgeState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// End of input: write out everything queued, close the child's stdin
    /// and collect its remaining output for up to the stop timeout, then
    /// close.
    pub async fn finish(&self) {
        self.begin_closing();
        self.drain_token.cancel();

        if let Some(reader) = self.reader.lock().await.take() {
            if tokio::time::timeout(self.stop_timeout, reader).await.is_err() {
                debug!(command = %self.command, "Middleware kept its output open");
            }
        }
        self.close().await;
    }

    /// Terminate the child: SIGTERM, bounded wait, then kill.
    pub async fn close(&self) {
        self.begin_closing();
        self.close_token.cancel();

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            if let Err(e) = supervisor.await {
                warn!(command = %self.command, "Middleware supervisor panicked: {}", e);
            }
        }
    }
}

async fn write_loop(
    stdin: ChildStdin,
    mut rx: mpsc::Receiver<Arc<Message>>,
    state: Arc<watch::Sender<BridgeState>>,
    metrics: Arc<Metrics>,
    drain_token: CancellationToken,
    close_token: CancellationToken,
) {
    let mut framed = FramedWrite::new(stdin, FrameCodec::new());
    let mut draining = false;
    loop {
        let message = if draining {
            match rx.try_recv() {
                Ok(message) => message,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                _ = close_token.cancelled() => break,
                _ = drain_token.cancelled() => {
                    draining = true;
                    continue;
                }
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            }
        };
        if let Err(e) = framed.send(message).await {
            mark_failed(&state, &metrics, &format!("stdin write failed: {e}"));
            break;
        }
        metrics.middleware_sent.inc();
    }
    // Dropping the writer closes stdin so the child sees end of input.
}

async fn read_loop(
    stdout: ChildStdout,
    tx: mpsc::Sender<Message>,
    state: Arc<watch::Sender<BridgeState>>,
    metrics: Arc<Metrics>,
    close_token: CancellationToken,
) {
    let mut frames = FramedRead::new(stdout, FrameCodec::new());
    loop {
        let frame = tokio::select! {
            _ = close_token.cancelled() => return,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Decoded::Message(message))) => {
                metrics.middleware_received.inc();
                if tx.send(message).await.is_err() {
                    debug!("Middleware output no longer consumed");
                    return;
                }
            }
            Some(Ok(Decoded::Malformed(e))) => {
                warn!("Dropping malformed frame from middleware: {}", e);
                metrics.record_malformed(MALFORMED_ORIGIN);
            }
            Some(Err(e)) => {
                mark_failed(&state, &metrics, &format!("stdout read failed: {e}"));
                return;
            }
            None => {
                mark_failed(&state, &metrics, "stdout closed");
                return;
            }
        }
    }
}

async fn log_stderr(stderr: ChildStderr, command: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "middleware", command = %command, "{}", line);
    }
}

async fn supervise(
    mut child: Child,
    state: Arc<watch::Sender<BridgeState>>,
    metrics: Arc<Metrics>,
    close_token: CancellationToken,
    stop_timeout: Duration,
) {
    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("process exited with {status}"),
                Err(e) => format!("wait failed: {e}"),
            };
            mark_failed(&state, &metrics, &reason);
            mark_closed(&state);
            return;
        }
        _ = close_token.cancelled() => {}
    }

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed: {}", e);
        }
    }

    match tokio::time::timeout(stop_timeout, child.wait()).await {
        Ok(Ok(status)) => debug!("Middleware exited with {}", status),
        Ok(Err(e)) => warn!("Waiting for middleware failed: {}", e),
        Err(_) => {
            warn!(
                timeout_ms = stop_timeout.as_millis() as u64,
                "Middleware ignored SIGTERM, killing"
            );
            if let Err(e) = child.kill().await {
                warn!("Failed to kill middleware: {}", e);
            }
        }
    }

    mark_closed(&state);
}
