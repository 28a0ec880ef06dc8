//! Command execution primitives with consistent error handling.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long output is still collected after the child exits when no
/// deadline applies.
const DETACH_GRACE: Duration = Duration::from_secs(2);

/// How long the pipes get to close after the group was killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

fn pick_error_text(stdout: &str, stderr: &str) -> String {
    if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    }
}

/// Captured result of a finished (or killed) child process.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessOutput {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut text = String::with_capacity(self.stdout.len() + self.stderr.len());
        text.push_str(&self.stdout);
        text.push_str(&self.stderr);
        text
    }

    pub fn error_text(&self) -> String {
        pick_error_text(&self.stdout, &self.stderr)
    }
}

/// Spawn `command`, capture both streams and wait for it, killing the whole
/// process group once `timeout` elapses.
///
/// The deadline covers the output pipes as well as the direct child: a
/// background process that keeps the pipes open past the deadline is killed
/// with the rest of the group. Without a deadline, capture stops
/// `DETACH_GRACE` after the child exits and such processes keep running.
///
/// Only a spawn failure is an `Err`; a non-zero exit or a timeout is reported
/// through the returned [`ProcessOutput`] so callers can map it to their own
/// error kind.
pub fn run_captured(
    mut command: Command,
    timeout: Option<Duration>,
    context: &str,
) -> Result<ProcessOutput> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|e| {
        Error::internal_io(
            format!("Failed to run {}: {}", context, e),
            Some(context.to_string()),
        )
    })?;
    let pgid = child.id();

    let mut collector = OutputCollector::attach(&mut child);
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut timed_out = false;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                kill_process_group(pgid);
                return Err(Error::internal_io(
                    format!("Failed to wait for {}: {}", context, e),
                    Some(context.to_string()),
                ));
            }
        }

        if deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            kill_process_group(pgid);
            let _ = child.kill();
            break child.wait().ok();
        }

        thread::sleep(POLL_INTERVAL);
    };

    if !timed_out {
        let until = deadline.unwrap_or_else(|| Instant::now() + DETACH_GRACE);
        if !collector.drain(until) {
            if deadline.is_some() {
                timed_out = true;
                kill_process_group(pgid);
            } else {
                tracing::warn!(context, "Background processes still hold the output pipes, capture stopped");
            }
        }
    }
    if timed_out {
        collector.drain(Instant::now() + KILL_GRACE);
    }

    let success = !timed_out && status.map(|s| s.success()).unwrap_or(false);
    let exit_code = status.and_then(|s| s.code());
    let (stdout, stderr) = collector.into_strings();

    Ok(ProcessOutput {
        success,
        exit_code: if timed_out { None } else { exit_code },
        stdout,
        stderr,
        timed_out,
    })
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Chunk {
    Data(Stream, Vec<u8>),
    Closed,
}

/// Reader threads forward pipe contents over a channel so the caller can
/// stop waiting at any time and keep what arrived so far.
struct OutputCollector {
    rx: mpsc::Receiver<Chunk>,
    open: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl OutputCollector {
    fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel();
        let mut open = 0;
        if let Some(stream) = child.stdout.take() {
            spawn_reader(stream, Stream::Stdout, tx.clone());
            open += 1;
        }
        if let Some(stream) = child.stderr.take() {
            spawn_reader(stream, Stream::Stderr, tx);
            open += 1;
        }
        Self {
            rx,
            open,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Collect until both pipes close or `until` passes. True when closed.
    fn drain(&mut self, until: Instant) -> bool {
        while self.open > 0 {
            let left = until.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok(Chunk::Data(Stream::Stdout, bytes)) => self.stdout.extend_from_slice(&bytes),
                Ok(Chunk::Data(Stream::Stderr, bytes)) => self.stderr.extend_from_slice(&bytes),
                Ok(Chunk::Closed) => self.open -= 1,
                Err(mpsc::RecvTimeoutError::Timeout) => return false,
                Err(mpsc::RecvTimeoutError::Disconnected) => self.open = 0,
            }
        }
        true
    }

    fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R, kind: Stream, tx: mpsc::Sender<Chunk>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Chunk::Data(kind, buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(Chunk::Closed);
    });
}

/// The child leads its own process group (see `run_captured`), so this
/// reaches the shell and everything it spawned, even after the shell exited.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pgid, error = %e, "Failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}
