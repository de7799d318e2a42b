/// Tracer session lifecycle: spawn strace against a pid, stream its combined
/// stdout+stderr line by line, reap or stop it.
use crate::config::TracerConfig;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// Errors that can occur while running the tracer. All of them are fatal.
#[derive(Debug)]
pub enum TracerError {
    /// Failed to spawn the tracer subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// Failed to read from the tracer's stdout/stderr or to reap it.
    Io { source: std::io::Error },
}

impl std::fmt::Display for TracerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracerError::Spawn { command, source } => {
                write!(f, "failed to spawn tracer {command}: {source}")
            }
            TracerError::Io { source } => write!(f, "I/O error reading tracer output: {source}"),
        }
    }
}

impl std::error::Error for TracerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TracerError::Spawn { source, .. } => Some(source),
            TracerError::Io { source } => Some(source),
        }
    }
}

/// Build the command arguments, replacing `{pid}` and `{string_limit}` placeholders.
fn build_args(config: &TracerConfig, pid: u32) -> Vec<String> {
    let pid = pid.to_string();
    let limit = config.string_limit.to_string();
    config
        .args
        .iter()
        .map(|arg| arg.replace("{pid}", &pid).replace("{string_limit}", &limit))
        .collect()
}

/// A running tracer and its two output streams.
///
/// strace reports on stderr and leaves stdout empty; both are read so the
/// session sees one combined stream, as a shell `2>&1` would give.
pub struct TracerSession {
    child: Child,
    pid: u32,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<BufReader<ChildStderr>>,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
}

impl TracerSession {
    /// Spawn the tracer against `target_pid`.
    ///
    /// The tracer gets its own process group so a terminal Ctrl-C only
    /// reaches us; we then detach it with SIGTERM.
    pub fn spawn(config: &TracerConfig, target_pid: u32) -> Result<Self, TracerError> {
        let args = build_args(config, target_pid);
        tracing::info!(
            command = %config.command,
            args = ?args,
            target_pid,
            "spawning tracer"
        );

        let mut child = Command::new(&config.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TracerError::Spawn {
                command: config.command.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        tracing::debug!(pid, "tracer subprocess started");

        Ok(Self {
            stdout: child.stdout.take().map(BufReader::new),
            stderr: child.stderr.take().map(BufReader::new),
            child,
            pid,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Next line from either stream, in arrival order.
    ///
    /// Returns `None` once both streams are closed. Invalid UTF-8 is
    /// replaced rather than treated as an error. Cancel safe: a partially
    /// read line stays buffered for the next call.
    pub async fn next_line(&mut self) -> Result<Option<String>, TracerError> {
        loop {
            let (stream, n) = match (self.stdout.as_mut(), self.stderr.as_mut()) {
                (None, None) => return Ok(None),
                (Some(out), None) => (Stream::Stdout, out.read_until(b'\n', &mut self.stdout_buf).await),
                (None, Some(err)) => (Stream::Stderr, err.read_until(b'\n', &mut self.stderr_buf).await),
                (Some(out), Some(err)) => tokio::select! {
                    n = out.read_until(b'\n', &mut self.stdout_buf) => (Stream::Stdout, n),
                    n = err.read_until(b'\n', &mut self.stderr_buf) => (Stream::Stderr, n),
                },
            };
            let n = n.map_err(|e| TracerError::Io { source: e })?;

            let buf = match stream {
                Stream::Stdout => &mut self.stdout_buf,
                Stream::Stderr => &mut self.stderr_buf,
            };

            if n == 0 {
                // EOF. A final line without a newline is still a line.
                let last = (!buf.is_empty()).then(|| take_line(buf));
                match stream {
                    Stream::Stdout => self.stdout = None,
                    Stream::Stderr => self.stderr = None,
                }
                if last.is_some() {
                    return Ok(last);
                }
                continue;
            }

            if buf.ends_with(b"\n") {
                return Ok(Some(take_line(buf)));
            }
        }
    }

    /// Reap the tracer after its output has closed. Returns its exit code
    /// (`None` if it was killed by a signal).
    pub async fn finish(mut self) -> Result<Option<i32>, TracerError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| TracerError::Io { source: e })?;
        Ok(status.code())
    }

    /// Detach the tracer: SIGTERM, then SIGKILL if it hasn't exited within `grace`.
    pub async fn terminate(mut self, grace: Duration) -> Result<Option<i32>, TracerError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Ok(status.code());
        }

        if let Ok(raw) = i32::try_from(self.pid) {
            if raw > 0 {
                if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
                    tracing::debug!(pid = self.pid, error = %e, "SIGTERM to tracer failed");
                }
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status.map_err(|e| TracerError::Io { source: e })?.code()),
            Err(_) => {
                tracing::warn!(pid = self.pid, "tracer ignored SIGTERM, killing");
                self.child
                    .kill()
                    .await
                    .map_err(|e| TracerError::Io { source: e })?;
                Ok(None)
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
