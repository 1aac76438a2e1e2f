//! Code-execution kernels.
//!
//! A session talks to its kernel through a narrow interface: it sends
//! [`ExecuteRequest`]s and receives [`KernelEvent`]s on a channel it handed to
//! the factory. Nothing waits for a reply; replies are matched to cells by
//! request id in the session's correlation table.
//!
//! Two implementations:
//!
//! - [`ProcessKernel`]: a child process speaking JSON lines on stdin/stdout
//! - [`EchoKernel`]: in-process, echoes code as stdout, for tests and demos
//!
//! # Process protocol
//!
//! ```text
//! stdin  ← {"requestId":"…","cellId":"…","code":"2+2"}
//! stdout → {"event":"kernelStatus","status":"busy"}
//! stdout → {"event":"outputData","requestId":"…","type":"result","mimetypeBundle":{"text/plain":"4"}}
//! stdout → {"event":"executeReply","requestId":"…","success":true,"executionCounter":1}
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use quire_types::{CellId, MimetypeBundle, OutputKind, RequestId, SessionId};

use crate::constants::{KERNEL_EVENT_BUFFER, KERNEL_STATE_DEAD};

/// Longest stdout line accepted from a kernel process.
const MAX_KERNEL_LINE: usize = 16 * 1024 * 1024;

/// Errors talking to a kernel.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("failed to spawn kernel `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The kernel's request queue is full.
    #[error("kernel request queue is full")]
    Busy,

    /// The kernel has exited or been shut down.
    #[error("kernel is not running")]
    Dead,

    #[error("kernel process has no {0} pipe")]
    MissingPipe(&'static str),
}

pub type KernelResult<T> = std::result::Result<T, KernelError>;

// ============================================================================
// Wire types
// ============================================================================

/// One execution dispatched to a kernel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub request_id: RequestId,
    pub cell_id: CellId,
    pub code: String,
}

/// Completion of an execution.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteReply {
    pub request_id: RequestId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
}

impl ExecuteReply {
    pub fn ok(request_id: RequestId, execution_counter: u64) -> Self {
        Self {
            request_id,
            success: true,
            execution_counter: Some(execution_counter),
            ..Default::default()
        }
    }

    pub fn error(
        request_id: RequestId,
        error_name: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            success: false,
            error_name: Some(error_name.into()),
            error_message: Some(error_message.into()),
            ..Default::default()
        }
    }

    /// `errorName: errorMessage`, the plain-text rendering of a failure.
    pub fn error_text(&self) -> String {
        format!(
            "{}: {}",
            self.error_name.as_deref().unwrap_or("Error"),
            self.error_message.as_deref().unwrap_or("")
        )
    }
}

/// One output produced while an execution runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputData {
    pub request_id: RequestId,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    #[serde(default)]
    pub mimetype_bundle: MimetypeBundle,
}

/// Events a kernel sends back to its session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum KernelEvent {
    ExecuteReply(ExecuteReply),
    KernelStatus { status: String },
    OutputData(OutputData),
}

impl KernelEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelEvent::ExecuteReply(_) => "executeReply",
            KernelEvent::KernelStatus { .. } => "kernelStatus",
            KernelEvent::OutputData(_) => "outputData",
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        KernelEvent::KernelStatus {
            status: status.into(),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A running kernel bound to one session.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Kernel flavor, for status updates and logs.
    fn name(&self) -> &str;

    /// Queue an execution. Must not block; the reply arrives as an event.
    fn execute(&self, request: ExecuteRequest) -> KernelResult<()>;

    /// Stop the kernel. Idempotent.
    async fn shutdown(&self);
}

/// Creates a kernel for a new session.
#[async_trait]
pub trait KernelFactory: Send + Sync {
    /// Start a kernel that reports its events on `events`.
    async fn spawn(
        &self,
        session: &SessionId,
        events: mpsc::Sender<KernelEvent>,
    ) -> KernelResult<Arc<dyn Kernel>>;
}

// ============================================================================
// Process kernel
// ============================================================================

/// Spawns [`ProcessKernel`]s from a command line.
#[derive(Clone, Debug)]
pub struct ProcessKernelFactory {
    command: String,
    args: Vec<String>,
}

impl ProcessKernelFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

#[async_trait]
impl KernelFactory for ProcessKernelFactory {
    async fn spawn(
        &self,
        session: &SessionId,
        events: mpsc::Sender<KernelEvent>,
    ) -> KernelResult<Arc<dyn Kernel>> {
        let kernel = ProcessKernel::spawn(&self.command, &self.args, session, events)?;
        Ok(Arc::new(kernel))
    }
}

/// Kernel running as a child process.
///
/// Three tasks per kernel: a writer feeding stdin, a reader decoding stdout
/// into events, and a supervisor that owns the child and kills it on
/// shutdown. When stdout closes the reader reports `kernelStatus: dead`.
pub struct ProcessKernel {
    name: String,
    requests: mpsc::Sender<ExecuteRequest>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessKernel {
    pub fn spawn(
        command: &str,
        args: &[String],
        session: &SessionId,
        events: mpsc::Sender<KernelEvent>,
    ) -> KernelResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| KernelError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(KernelError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(KernelError::MissingPipe("stdout"))?;

        tracing::info!(session = %session.short(), command, pid = ?child.id(), "kernel process started");

        let (requests, mut request_rx) = mpsc::channel::<ExecuteRequest>(KERNEL_EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        // Writer: requests → stdin
        let session_id = session.clone();
        tokio::spawn(async move {
            let mut sink = FramedWrite::new(stdin, LinesCodec::new());
            while let Some(request) = request_rx.recv().await {
                let line = match serde_json::to_string(&request) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(session = %session_id.short(), error = %e, "failed to encode execute request");
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    tracing::warn!(session = %session_id.short(), error = %e, "kernel stdin closed");
                    break;
                }
            }
        });

        // Reader: stdout → events
        let session_id = session.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_KERNEL_LINE));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(session = %session_id.short(), error = %e, "unreadable kernel output line");
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<KernelEvent>(&line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session = %session_id.short(), error = %e, "malformed kernel event, skipping");
                    }
                }
            }
            let _ = events.send(KernelEvent::status(KERNEL_STATE_DEAD)).await;
        });

        // Supervisor: owns the child
        let session_id = session.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    tracing::info!(session = %session_id.short(), ?status, "kernel process exited");
                }
                _ = shutdown_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(session = %session_id.short(), error = %e, "failed to kill kernel process");
                    }
                }
            }
        });

        Ok(Self {
            name: command.to_string(),
            requests,
            shutdown: Mutex::new(Some(shutdown_tx)),
        })
    }
}

#[async_trait]
impl Kernel for ProcessKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, request: ExecuteRequest) -> KernelResult<()> {
        self.requests.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => KernelError::Busy,
            mpsc::error::TrySendError::Closed(_) => KernelError::Dead,
        })
    }

    async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

// ============================================================================
// Echo kernel
// ============================================================================

/// Builds [`EchoKernel`]s.
#[derive(Clone, Debug, Default)]
pub struct EchoKernelFactory;

#[async_trait]
impl KernelFactory for EchoKernelFactory {
    async fn spawn(
        &self,
        _session: &SessionId,
        events: mpsc::Sender<KernelEvent>,
    ) -> KernelResult<Arc<dyn Kernel>> {
        let _ = events.try_send(KernelEvent::status("idle"));
        Ok(Arc::new(EchoKernel::new(events)))
    }
}

/// In-process kernel that prints each cell's code to stdout.
///
/// Code starting with `raise ` fails with the rest of the line as message.
pub struct EchoKernel {
    events: Mutex<Option<mpsc::Sender<KernelEvent>>>,
    counter: AtomicU64,
}

impl EchoKernel {
    pub fn new(events: mpsc::Sender<KernelEvent>) -> Self {
        Self {
            events: Mutex::new(Some(events)),
            counter: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Kernel for EchoKernel {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, request: ExecuteRequest) -> KernelResult<()> {
        let events = self.events.lock().clone().ok_or(KernelError::Dead)?;
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;

        let mut batch = Vec::with_capacity(2);
        let reply = match request.code.strip_prefix("raise ") {
            Some(message) => ExecuteReply::error(request.request_id, "RuntimeError", message.trim()),
            None => {
                if !request.code.is_empty() {
                    let mut bundle = MimetypeBundle::new();
                    bundle.insert(quire_types::MIME_TEXT_PLAIN.to_string(), request.code.clone());
                    batch.push(KernelEvent::OutputData(OutputData {
                        request_id: request.request_id.clone(),
                        kind: OutputKind::Stdout,
                        mimetype_bundle: bundle,
                    }));
                }
                ExecuteReply::ok(request.request_id, counter)
            }
        };
        let reply = ExecuteReply {
            execution_counter: Some(counter),
            ..reply
        };
        batch.push(KernelEvent::ExecuteReply(reply));

        tokio::spawn(async move {
            for event in batch {
                if events.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(events) = self.events.lock().take() {
            let _ = events.try_send(KernelEvent::status(KERNEL_STATE_DEAD));
        }
    }
}
