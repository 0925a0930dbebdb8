//! Pseudo-terminal wrapper
//!
//! [`PtyHandle`] owns a child process attached to a pty. The platform
//! implementation (Unix pty pair or Windows ConPTY) is picked by
//! `portable_pty::native_pty_system()` at creation time.
//!
//! Writes, resizes and termination share one lock so input bytes are never
//! interleaved with a resize or a kill.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use super::lock;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("PTY is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Exit status of a session's process; `None` when the OS gave none
pub type ExitCode = Option<u32>;

/// Terminal dimensions in character cells
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl TermSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
        }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Everything needed to start a process on a pty
#[derive(Clone, Debug, PartialEq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Merged over the inherited environment
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub size: TermSize,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            size: TermSize::default(),
        }
    }

    /// Spawn spec for the user's default shell
    pub fn shell() -> Self {
        Self::new(default_shell())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, size: TermSize) -> Self {
        self.size = size;
        self
    }

    /// Program and arguments as one display string
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if !self.env.contains_key("LANG") && std::env::var_os("LANG").is_none() {
            cmd.env("LANG", "C.UTF-8");
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// Returns the user's default shell
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

/// A child process attached to a pseudo-terminal
pub struct PtyHandle {
    /// Single-writer serialization point for write, resize and terminate
    io: Mutex<PtyIo>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    pid: Option<u32>,
    size: Mutex<TermSize>,
    alive: AtomicBool,
    terminated: AtomicBool,
}

impl PtyHandle {
    /// Open a pty and spawn the process described by `spec` on it
    pub fn create(spec: &SpawnSpec) -> Result<Self> {
        let spawn_error = |source: anyhow::Error| PtyError::Spawn {
            command: spec.command_line(),
            source: into_io_error(source),
        };

        let pair = native_pty_system()
            .openpty(spec.size.into())
            .map_err(spawn_error)?;

        let child = pair
            .slave
            .spawn_command(spec.to_command())
            .map_err(spawn_error)?;
        // Keep no slave fd in this process so reads end when the child does
        drop(pair.slave);

        let writer = pair.master.take_writer().map_err(spawn_error)?;
        let pid = child.process_id();

        tracing::info!(
            command = %spec.command_line(),
            pid = ?pid,
            rows = spec.size.rows,
            cols = spec.size.cols,
            "Spawned process on pty"
        );

        Ok(Self {
            io: Mutex::new(PtyIo {
                master: pair.master,
                writer,
            }),
            child: Mutex::new(child),
            pid,
            size: Mutex::new(spec.size),
            alive: AtomicBool::new(true),
            terminated: AtomicBool::new(false),
        })
    }

    /// A blocking reader over the pty's output side
    pub fn reader(&self) -> Result<PtyReader> {
        let inner = lock(&self.io)
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Io(into_io_error(e)))?;
        Ok(PtyReader::new(inner))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> TermSize {
        *lock(&self.size)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Record that the output side reached end of stream
    pub(crate) fn mark_closed(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Write bytes to the process's input
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(PtyError::Closed);
        }
        let mut io = lock(&self.io);
        io.writer.write_all(data)?;
        io.writer.flush()?;
        Ok(())
    }

    /// Change the pty dimensions; the child receives SIGWINCH (or the ConPTY equivalent)
    pub fn resize(&self, size: TermSize) -> Result<()> {
        if !self.is_alive() {
            return Err(PtyError::Closed);
        }
        let io = lock(&self.io);
        io.master
            .resize(size.into())
            .map_err(|e| PtyError::Io(into_io_error(e)))?;
        *lock(&self.size) = size;
        tracing::debug!(pid = ?self.pid, rows = size.rows, cols = size.cols, "Resized pty");
        Ok(())
    }

    /// Exit code if the process has exited, `None` while it is running
    pub fn try_wait(&self) -> Result<Option<u32>> {
        let status = lock(&self.child).try_wait()?;
        Ok(status.map(|s| s.exit_code()))
    }

    /// Wait up to `timeout` for the process to exit
    pub fn wait_timeout(&self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_wait() {
                Ok(Some(code)) => return Some(code),
                Ok(None) if Instant::now() < deadline => thread::sleep(WAIT_POLL_INTERVAL),
                Ok(None) => return None,
                Err(e) => {
                    tracing::debug!(pid = ?self.pid, error = %e, "Failed to query exit status");
                    return None;
                }
            }
        }
    }

    /// Ask the process to exit, killing it if it is still running after `grace`.
    ///
    /// Calling this more than once has no further effect.
    pub fn terminate(&self, grace: Duration) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);

        let _io = lock(&self.io);
        if matches!(self.try_wait(), Ok(Some(_))) {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // SAFETY: plain signal delivery to our own child's pid
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGHUP);
            }
        }

        if self.wait_timeout(grace).is_some() {
            tracing::debug!(pid = ?self.pid, "Process exited after hangup");
            return;
        }

        tracing::warn!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "Process ignored hangup, killing");
        if let Err(e) = lock(&self.child).kill() {
            tracing::debug!(pid = ?self.pid, error = %e, "Kill failed");
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.terminate(Duration::ZERO);
    }
}

/// Result of one blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    EndOfStream,
}

/// Blocking reader for pty output
pub struct PtyReader {
    inner: Box<dyn Read + Send>,
}

impl PtyReader {
    pub(crate) fn new(inner: impl Read + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    /// Read the next chunk into `buf`.
    ///
    /// End of stream is reported once the child has exited and its output
    /// is drained. Linux reports that as EIO on the master side.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        match self.inner.read(buf) {
            Ok(0) => Ok(ReadOutcome::EndOfStream),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_hangup(&e) => Ok(ReadOutcome::EndOfStream),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(not(unix))]
fn is_hangup(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}

fn into_io_error(err: anyhow::Error) -> io::Error {
    err.downcast::<io::Error>()
        .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Read everything until end of stream on a helper thread
    fn drain(handle: &PtyHandle) -> mpsc::Receiver<Vec<u8>> {
        let mut reader = handle.reader().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut output = Vec::new();
            let mut buf = [0u8; 4096];
            while let Ok(ReadOutcome::Data(n)) = reader.read(&mut buf) {
                output.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(output);
        });
        rx
    }

    #[test]
    fn test_spawn_reads_output_until_end_of_stream() {
        let spec = SpawnSpec::new("/bin/sh").arg("-c").arg("echo DESKTERM_OK");
        let handle = PtyHandle::create(&spec).unwrap();
        assert!(handle.pid().is_some());

        let output = drain(&handle).recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(String::from_utf8_lossy(&output).contains("DESKTERM_OK"));
        assert_eq!(handle.wait_timeout(Duration::from_secs(5)), Some(0));
    }

    #[test]
    fn test_exit_code_is_reported() {
        let spec = SpawnSpec::new("/bin/sh").arg("-c").arg("exit 3");
        let handle = PtyHandle::create(&spec).unwrap();
        assert_eq!(handle.wait_timeout(Duration::from_secs(10)), Some(3));
    }

    #[test]
    fn test_environment_and_size_reach_the_child() {
        let spec = SpawnSpec::new("/bin/sh")
            .arg("-c")
            .arg("echo \"$DESKTERM_VAR:$TERM\"; stty size")
            .env("DESKTERM_VAR", "value")
            .size(TermSize::new(30, 100));
        let handle = PtyHandle::create(&spec).unwrap();

        let output = drain(&handle).recv_timeout(Duration::from_secs(10)).unwrap();
        let output = String::from_utf8_lossy(&output);
        assert!(output.contains("value:xterm-256color"), "{output}");
        assert!(output.contains("30 100"), "{output}");
    }

    #[test]
    fn test_write_is_echoed() {
        let handle = PtyHandle::create(&SpawnSpec::new("/bin/sh")).unwrap();
        let rx = drain(&handle);

        handle.write(b"echo ROUND_$((20+1))\n").unwrap();
        handle.write(b"exit\n").unwrap();

        let output = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert!(String::from_utf8_lossy(&output).contains("ROUND_21"));
    }

    #[test]
    fn test_resize_updates_size() {
        let handle = PtyHandle::create(&SpawnSpec::new("/bin/sh")).unwrap();
        handle.resize(TermSize::new(40, 120)).unwrap();
        assert_eq!(handle.size(), TermSize::new(40, 120));
        handle.terminate(Duration::from_millis(500));
    }

    #[test]
    fn test_terminate_is_idempotent_and_closes_handle() {
        let handle = PtyHandle::create(&SpawnSpec::new("/bin/sh")).unwrap();
        handle.terminate(Duration::from_millis(500));
        handle.terminate(Duration::from_millis(500));

        assert!(!handle.is_alive());
        assert!(handle.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(matches!(handle.write(b"echo\n"), Err(PtyError::Closed)));
        assert!(matches!(
            handle.resize(TermSize::new(10, 10)),
            Err(PtyError::Closed)
        ));
    }

    #[test]
    fn test_terminate_escalates_when_hangup_is_ignored() {
        let spec = SpawnSpec::new("/bin/sh")
            .arg("-c")
            .arg("trap '' HUP; while :; do sleep 1; done");
        let handle = PtyHandle::create(&spec).unwrap();
        // Give the shell time to install the trap
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        handle.terminate(Duration::from_millis(100));
        assert!(handle.wait_timeout(Duration::from_secs(5)).is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
