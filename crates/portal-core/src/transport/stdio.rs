//! Child-process stdio carrier.
//!
//! Spawns the normalized command with piped stdio. Frames are
//! newline-delimited JSON: one object per stdout line, one line with a
//! trailing newline per outbound frame. Stderr is copied to the log sink
//! with the last 4 KiB retained for diagnostics.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use super::Carrier;
use crate::command::SpawnSpec;
use crate::protocol::Frame;
use crate::{PortalError, PortalResult};

/// Bytes of stderr retained for `last_error` reporting.
const STDERR_TAIL_BYTES: usize = 4096;

/// Grace period between stdin EOF and force kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Rolling tail of a child's stderr.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    buf: Arc<Mutex<VecDeque<u8>>>,
}

impl StderrTail {
    fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().expect("stderr tail poisoned");
        for b in line.bytes().chain(std::iter::once(b'\n')) {
            if buf.len() == STDERR_TAIL_BYTES {
                buf.pop_front();
            }
            buf.push_back(b);
        }
    }

    /// Current tail contents, lossily decoded.
    pub fn snapshot(&self) -> String {
        let buf = self.buf.lock().expect("stderr tail poisoned");
        String::from_utf8_lossy(&buf.iter().copied().collect::<Vec<u8>>())
            .trim()
            .to_string()
    }
}

/// Carrier over a spawned child process.
pub struct StdioCarrier {
    server_name: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: tokio::io::Lines<BufReader<ChildStdout>>,
    stderr_tail: StderrTail,
}

impl StdioCarrier {
    /// Spawn the command and wire up stdio.
    ///
    /// The declared env is merged over the inherited environment, declared
    /// keys winning. A stderr pump task runs for the life of the child.
    pub fn spawn(server_name: &str, spec: &SpawnSpec) -> PortalResult<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PortalError::SpawnFailed {
            command: spec.program.to_string_lossy().into_owned(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| PortalError::SpawnFailed {
            command: spec.program.to_string_lossy().into_owned(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| PortalError::SpawnFailed {
            command: spec.program.to_string_lossy().into_owned(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take();

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = stderr {
            let tail = stderr_tail.clone();
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                    tail.push_line(&line);
                }
            });
        }

        Ok(Self {
            server_name: server_name.to_string(),
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_tail,
        })
    }

    /// Handle to the rolling stderr tail.
    pub fn stderr_tail(&self) -> StderrTail {
        self.stderr_tail.clone()
    }
}

#[async_trait]
impl Carrier for StdioCarrier {
    async fn send(&mut self, frame: Frame) -> PortalResult<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PortalError::Transport("stdin already closed".into()))?;

        let mut line = serde_json::to_string(&frame.to_json())
            .map_err(|e| PortalError::Transport(format!("serialize: {e}")))?;
        line.push('\n');

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| PortalError::Transport(format!("write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| PortalError::Transport(format!("flush stdin: {e}")))
    }

    async fn recv(&mut self) -> Option<PortalResult<Frame>> {
        loop {
            match self.stdout.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(Frame::from_line(trimmed).map_err(|reason| {
                        warn!(server = %self.server_name, %reason, "malformed frame");
                        PortalError::Transport(reason)
                    }));
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(PortalError::Transport(format!("read stdout: {e}")))),
            }
        }
    }

    async fn close(&mut self) {
        // Drop stdin first so well-behaved servers exit on EOF.
        self.stdin.take();

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(server = %self.server_name, %status, "child exited");
                }
                _ => {
                    warn!(server = %self.server_name, "child did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
    }
}
