//! Process channel: one child process plus its framed stdin/stdout pair.
//!
//! The parent writes the serialized request exactly once at launch and may later
//! write a single cancellation frame. Child frames (heartbeats and the response)
//! are decoded by a reader task and delivered through [`ProcessChannel::next_event`],
//! which also reports the process exit once every frame written before exit has
//! been drained.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::command::child_command;
use crate::error::{ChildProcessError, Result};
use crate::wire::{ChildFrame, ChildProcessOutput, ParentFrame, decode_frame, encode_frame};

/// Number of stderr lines kept for crash diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for buffered stdout frames once the process has exited.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for the OS to reap a killed process.
const KILL_WAIT: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 64;

/// Identity of a launched child.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub correlation_id: String,
}

/// Something observed on the channel.
#[derive(Debug)]
pub enum ChannelEvent {
    Heartbeat { seq: u64 },
    Response(ChildProcessOutput<Value>),
    /// A frame that could not be decoded or carried the wrong correlation id.
    ProtocolViolation(String),
    /// The process exited. Always the last event.
    Exited(ExitStatus),
}

/// Result of [`ProcessChannel::await_result`].
#[derive(Debug)]
pub enum AwaitOutcome {
    Response(ChildProcessOutput<Value>),
    Exited(ExitStatus),
    TimedOut,
}

pub struct ProcessChannel {
    handle: ProcessHandle,
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::Receiver<ChannelEvent>,
    stdout_closed: bool,
    pending: VecDeque<ChannelEvent>,
    exit_status: Option<ExitStatus>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    started_at: Instant,
    last_activity: Instant,
    heartbeats: u64,
}

impl ProcessChannel {
    /// Start the child and write the serialized request frame.
    ///
    /// A failed request write is not fatal here: a child that died on startup is
    /// reported through its exit status instead.
    pub async fn launch<S: AsRef<OsStr>>(
        executable: &Path,
        args: &[S],
        correlation_id: impl Into<String>,
        serialized_input: String,
    ) -> Result<Self> {
        let correlation_id = correlation_id.into();
        let mut child = child_command(executable, args)
            .spawn()
            .map_err(ChildProcessError::Spawn)?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChildProcessError::protocol("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ChildProcessError::protocol("child stderr was not captured"))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChildProcessError::protocol("child stdin was not captured"))?;

        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(read_frames(stdout, tx, correlation_id.clone(), pid));

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        tokio::spawn(read_stderr(stderr, stderr_tail.clone(), pid));

        if let Err(e) = write_line(&mut stdin, &serialized_input).await {
            warn!(pid = ?pid, error = %e, "Failed to deliver request to child process");
        }

        let now = Instant::now();
        Ok(Self {
            handle: ProcessHandle {
                pid,
                start_time: Utc::now(),
                correlation_id,
            },
            child,
            stdin: Some(stdin),
            events,
            stdout_closed: false,
            pending: VecDeque::new(),
            exit_status: None,
            stderr_tail,
            started_at: now,
            last_activity: now,
            heartbeats: 0,
        })
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// When the last frame arrived (launch time if none yet).
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats
    }

    /// Last lines the child wrote to stderr, oldest first.
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Ask the child to stop cooperatively.
    pub async fn send_cancellation_signal(&mut self) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        let line = encode_frame(&ParentFrame::<Value>::Cancel)?;
        write_line(stdin, &line).await?;
        Ok(())
    }

    /// Wait for the next event. Cancel-safe.
    pub async fn next_event(&mut self) -> Result<ChannelEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(event);
            }
            if let Some(status) = self.exit_status {
                return Ok(ChannelEvent::Exited(status));
            }

            tokio::select! {
                biased;
                event = self.events.recv(), if !self.stdout_closed => match event {
                    Some(event) => self.record(event),
                    None => self.stdout_closed = true,
                },
                status = self.child.wait() => {
                    let status = status?;
                    self.drain_after_exit().await;
                    self.exit_status = Some(status);
                }
            }
        }
    }

    /// Wait up to `timeout` for the response or the process exit.
    pub async fn await_result(&mut self, timeout: Duration) -> Result<AwaitOutcome> {
        let wait = async {
            loop {
                match self.next_event().await? {
                    ChannelEvent::Heartbeat { .. } => continue,
                    ChannelEvent::Response(outcome) => return Ok(AwaitOutcome::Response(outcome)),
                    ChannelEvent::ProtocolViolation(msg) => {
                        return Err(ChildProcessError::Protocol(msg));
                    }
                    ChannelEvent::Exited(status) => return Ok(AwaitOutcome::Exited(status)),
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(AwaitOutcome::TimedOut),
        }
    }

    /// Wait up to `timeout` for the process to exit, skipping any other events.
    pub async fn await_exit(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let wait = async {
            loop {
                if let ChannelEvent::Exited(status) = self.next_event().await? {
                    return Ok(status);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(status) => status.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Kill the process at the OS level and reap it.
    pub async fn kill(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Some(status);
        }
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.handle.pid, error = %e, "Kill request failed (process may have exited)");
        }
        match tokio::time::timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(pid = ?self.handle.pid, error = %e, "Failed to reap killed child process");
                None
            }
            Err(_) => {
                warn!(pid = ?self.handle.pid, "Killed child process did not exit within {:?}", KILL_WAIT);
                None
            }
        }
    }

    fn record(&mut self, event: ChannelEvent) {
        match &event {
            ChannelEvent::Heartbeat { seq } => {
                self.heartbeats += 1;
                self.last_activity = Instant::now();
                trace!(pid = ?self.handle.pid, seq, "Child heartbeat");
            }
            ChannelEvent::Response(_) => self.last_activity = Instant::now(),
            ChannelEvent::ProtocolViolation(_) | ChannelEvent::Exited(_) => {}
        }
        self.pending.push_back(event);
    }

    /// Collect frames still buffered in the pipe after the process exited.
    async fn drain_after_exit(&mut self) {
        if self.stdout_closed {
            return;
        }
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Ok(Some(event)) => self.record(event),
                Ok(None) => {
                    self.stdout_closed = true;
                    break;
                }
                Err(_) => {
                    debug!(pid = ?self.handle.pid, "Child stdout still open after exit; giving up drain");
                    break;
                }
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

async fn read_frames(
    stdout: ChildStdout,
    tx: mpsc::Sender<ChannelEvent>,
    correlation_id: String,
    pid: Option<u32>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(pid = ?pid, error = %e, "Child stdout read failed");
                break;
            }
        };

        let event = match decode_frame::<ChildFrame<Value>>(&line) {
            None => {
                debug!(pid = ?pid, "child stdout: {}", line);
                continue;
            }
            Some(Err(e)) => ChannelEvent::ProtocolViolation(format!("malformed frame: {e}")),
            Some(Ok(ChildFrame::Heartbeat { seq })) => ChannelEvent::Heartbeat { seq },
            Some(Ok(ChildFrame::Response {
                correlation_id: received,
                outcome,
            })) => {
                if received == correlation_id {
                    ChannelEvent::Response(outcome)
                } else {
                    ChannelEvent::ProtocolViolation(format!(
                        "response correlation id '{received}' does not match '{correlation_id}'"
                    ))
                }
            }
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
}

async fn read_stderr(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "child_process::child", pid = ?pid, "{}", line);
        let mut tail = tail.lock();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
