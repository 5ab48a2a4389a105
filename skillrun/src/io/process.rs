//! Spawning `run_command` steps: shell choice, deadlines, capped capture.

use std::env;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8 * 1024;

/// How long pipe readers may keep draining once the shell itself is gone.
///
/// Background processes started by the command can hold the pipes open long
/// after the shell exits or is killed; their later output is abandoned.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Bytes kept from one child stream and how many were dropped past the cap.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capture {
    pub kept: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    fn push(&mut self, bytes: &[u8], cap: usize) {
        let room = cap.saturating_sub(self.kept.len()).min(bytes.len());
        self.kept.extend_from_slice(&bytes[..room]);
        self.dropped += bytes.len() - room;
    }

    /// Lossy UTF-8 text, with a marker line when bytes were dropped.
    pub fn render(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.kept).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

/// Drain `reader` to EOF into `sink`, keeping at most `cap` bytes.
///
/// The pipe is always read to the end so a chatty child never blocks on a
/// full buffer after the cap is reached.
fn drain_into<R: Read>(mut reader: R, cap: usize, sink: &Mutex<Capture>) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            return Ok(());
        }
        sink.lock()
            .map_err(|_| io::Error::other("capture lock poisoned"))?
            .push(&chunk[..read], cap);
    }
}

/// A stream drained on its own thread into a shared capture.
struct StreamReader {
    capture: Arc<Mutex<Capture>>,
    done: Receiver<io::Result<()>>,
}

impl StreamReader {
    fn spawn<R: Read + Send + 'static>(pipe: R, cap: usize) -> Self {
        let capture = Arc::new(Mutex::new(Capture::default()));
        let sink = Arc::clone(&capture);
        let (tx, done) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(drain_into(pipe, cap, &sink));
        });
        Self { capture, done }
    }

    /// Wait up to `grace` for EOF, then take whatever has been captured.
    fn finish(self, grace: Duration, stream: &str) -> Result<Capture> {
        match self.done.recv_timeout(grace) {
            Ok(result) => result.with_context(|| format!("read {stream}"))?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(stream, "pipe still held open after exit, abandoning reader");
            }
            Err(RecvTimeoutError::Disconnected) => bail!("{stream} reader panicked"),
        }
        let capture = self
            .capture
            .lock()
            .map_err(|_| anyhow!("{stream} capture lock poisoned"))?
            .clone();
        Ok(capture)
    }
}

/// What happened to one spawned step command.
#[derive(Debug)]
pub struct ChildRun {
    /// `None` when the child was killed by a signal or by the deadline.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: Capture,
    pub stderr: Capture,
}

/// Shell that wraps each step command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    pub program: String,
    pub flags: Vec<String>,
}

impl Shell {
    /// Login shell on Unix (`-lc`), PowerShell without a profile on Windows.
    pub fn for_platform(unix_shell: &str, windows_shell: &str) -> Self {
        let (program, flags): (&str, &[&str]) = if cfg!(windows) {
            (windows_shell, &["-NoProfile", "-Command"])
        } else {
            (unix_shell, &["-lc"])
        };
        Self {
            program: program.to_string(),
            flags: flags.iter().map(|flag| flag.to_string()).collect(),
        }
    }

    pub fn wrap(&self, command_line: &str, workdir: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.flags)
            .arg(command_line)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Whether some directory on `PATH` holds `program`.
pub fn on_path(program: &str) -> bool {
    let Some(search) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&search).any(|dir| {
        let candidate = dir.join(program);
        candidate.is_file() || (cfg!(windows) && candidate.with_extension("exe").is_file())
    })
}

/// Spawn `command`, wait up to `deadline`, and capture both streams.
///
/// Each stream is drained on its own thread while the child runs. A child
/// still alive at the deadline is killed and reported with `timed_out`. Once
/// the child is gone the readers get [`DRAIN_GRACE`] to reach EOF, so
/// processes it left behind cannot stretch the call past the deadline.
#[instrument(skip_all, fields(deadline_secs = deadline.as_secs(), cap))]
pub fn run_captured(mut command: Command, deadline: Duration, cap: usize) -> Result<ChildRun> {
    let started = Instant::now();
    let mut child = command.spawn().context("spawn shell")?;
    debug!(pid = child.id(), "child spawned");

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("stdout not piped"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("stderr not piped"))?;
    let stdout = StreamReader::spawn(stdout, cap);
    let stderr = StreamReader::spawn(stderr, cap);

    let (status, timed_out) = match child.wait_timeout(deadline).context("wait for child")? {
        Some(status) => (status, false),
        None => {
            warn!(deadline_secs = deadline.as_secs(), "deadline passed, killing child");
            child.kill().context("kill child")?;
            (child.wait().context("reap killed child")?, true)
        }
    };

    let stdout = stdout.finish(DRAIN_GRACE, "stdout")?;
    let stderr = stderr.finish(DRAIN_GRACE, "stderr")?;
    if stdout.dropped + stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output capped"
        );
    }

    let exit_code = if timed_out { None } else { status.code() };
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(?exit_code, timed_out, elapsed_ms, "child finished");
    Ok(ChildRun {
        exit_code,
        timed_out,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(bytes: &[u8], cap: usize) -> Capture {
        let sink = Mutex::new(Capture::default());
        drain_into(bytes, cap, &sink).expect("drain");
        sink.into_inner().expect("capture")
    }

    #[test]
    fn capture_keeps_prefix_and_counts_the_rest() {
        let capture = drain(b"abcdefghij", 4);
        assert_eq!(capture.kept, b"abcd");
        assert_eq!(capture.dropped, 6);
        assert_eq!(capture.render("stdout"), "abcd\n[stdout truncated 6 bytes]\n");
    }

    #[test]
    fn render_without_drops_is_plain_text() {
        let capture = drain(b"hello", 100);
        assert_eq!(capture.render("stderr"), "hello");
    }

    #[cfg(unix)]
    fn sh(script: &str) -> Command {
        Shell::for_platform("/bin/sh", "pwsh").wrap(script, Path::new("."))
    }

    #[cfg(unix)]
    #[test]
    fn reports_exit_code_and_both_streams() {
        let run = run_captured(sh("echo out; echo err >&2; exit 3"), Duration::from_secs(5), 1000)
            .expect("run");
        assert_eq!(run.exit_code, Some(3));
        assert_eq!(run.stdout.render("stdout").trim(), "out");
        assert_eq!(run.stderr.render("stderr").trim(), "err");
        assert!(!run.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn deadline_kills_the_child() {
        let run = run_captured(sh("sleep 2"), Duration::from_millis(100), 1000).expect("run");
        assert!(run.timed_out);
        assert_eq!(run.exit_code, None);
    }

    /// Verifies a killed shell returns near its deadline even if its child keeps the pipes.
    #[cfg(unix)]
    #[test]
    fn deadline_holds_when_a_grandchild_keeps_the_pipes_open() {
        let started = Instant::now();
        let run = run_captured(sh("sleep 5; echo done"), Duration::from_millis(200), 1000)
            .expect("run");
        assert!(run.timed_out);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!run.stdout.render("stdout").contains("done"));
    }

    /// Verifies a shell that exits normally is not held up by a background job it started.
    #[cfg(unix)]
    #[test]
    fn background_jobs_do_not_block_a_finished_shell() {
        let started = Instant::now();
        let run = run_captured(sh("echo ready; sleep 5 &"), Duration::from_secs(10), 1000)
            .expect("run");
        assert!(!run.timed_out);
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.stdout.render("stdout").trim(), "ready");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn unix_shell_runs_as_login_shell() {
        let shell = Shell::for_platform("/bin/bash", "pwsh");
        assert_eq!(shell.program, "/bin/bash");
        assert_eq!(shell.flags, ["-lc"]);
    }
}
