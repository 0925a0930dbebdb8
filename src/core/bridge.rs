//! Session I/O bridge
//!
//! One thread per session reads the pty, feeds each chunk to the terminal
//! before asking for the next, writes parser replies back to the pty and
//! publishes the resulting screen update. The loop ends at end of stream or
//! after two consecutive read failures. However the thread ends, including
//! by panic, the pty is marked closed and the session reports its exit.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::lock;
use super::pty::{ExitCode, PtyHandle, PtyReader, ReadOutcome};
use super::session::SessionShared;

const READ_BUFFER_SIZE: usize = 8192;

/// Consecutive failed reads tolerated before the process is presumed dead
const MAX_READ_RETRIES: u32 = 1;

/// How long to wait for an exit status after end of stream
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

struct Bridge {
    reader: PtyReader,
    pty: Arc<PtyHandle>,
    shared: Arc<SessionShared>,
}

/// Start the read loop for one session
pub(crate) fn spawn(
    reader: PtyReader,
    pty: Arc<PtyHandle>,
    shared: Arc<SessionShared>,
) -> io::Result<JoinHandle<()>> {
    let bridge = Bridge {
        reader,
        pty,
        shared,
    };
    thread::Builder::new()
        .name(format!("deskterm-session-{}", bridge.shared.id))
        .spawn(move || bridge.run())
}

/// Ends the session when the read loop stops, whether it returned or unwound
struct ExitGuard {
    pty: Arc<PtyHandle>,
    shared: Arc<SessionShared>,
    code: ExitCode,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!(session_id = self.shared.id, "Session bridge panicked, ending session");
            // Nothing reads the pty any more
            self.pty.terminate(Duration::ZERO);
        }
        self.pty.mark_closed();
        self.shared.finish(self.code);
    }
}

impl Bridge {
    fn run(mut self) {
        let mut exit = ExitGuard {
            pty: self.pty.clone(),
            shared: self.shared.clone(),
            code: None,
        };
        exit.code = self.pump();
    }

    /// Read until the output ends; returns the exit code if one was observed
    fn pump(&mut self) -> ExitCode {
        let id = self.shared.id;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut failures = 0;

        loop {
            match self.reader.read(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    failures = 0;
                    self.process(&buf[..n]);
                }
                Ok(ReadOutcome::EndOfStream) => {
                    tracing::debug!(session_id = id, "End of pty output");
                    break self.exit_status();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failures += 1;
                    if failures > MAX_READ_RETRIES {
                        tracing::warn!(session_id = id, error = %e, "Pty read failed again, treating process as dead");
                        break None;
                    }
                    tracing::debug!(session_id = id, error = %e, "Pty read failed, retrying");
                }
            }
        }
    }

    /// Feed one chunk and publish what changed
    fn process(&self, bytes: &[u8]) {
        let responses = {
            let mut terminal = lock(&self.shared.terminal);
            let responses = terminal.feed(bytes);
            self.shared.publish(&mut terminal);
            responses
        };

        for response in responses {
            if let Err(e) = self.pty.write(&response.to_bytes()) {
                tracing::debug!(session_id = self.shared.id, ?response, error = %e, "Failed to send terminal reply");
            }
        }
    }

    fn exit_status(&self) -> ExitCode {
        let code = self.pty.wait_timeout(EXIT_STATUS_TIMEOUT);
        if code.is_none() {
            tracing::debug!(session_id = self.shared.id, "No exit status available");
        }
        code
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::events::SessionEvent;
    use crate::core::pty::SpawnSpec;
    use crate::core::session::SessionState;
    use crate::core::term::TerminalState;
    use std::collections::VecDeque;
    use std::io::Read;

    /// Replays a fixed sequence of reads, then reports end of stream
    struct ScriptedReader(VecDeque<io::Result<&'static [u8]>>);

    impl Read for ScriptedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    struct PanickingReader;

    impl Read for PanickingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            panic!("reader blew up");
        }
    }

    fn failed() -> io::Result<&'static [u8]> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "read failed"))
    }

    fn interrupted() -> io::Result<&'static [u8]> {
        Err(io::Error::new(io::ErrorKind::Interrupted, "signal"))
    }

    fn bridge(script: &str, reader: PtyReader) -> Bridge {
        let spec = SpawnSpec::new("/bin/sh").arg("-c").arg(script);
        Bridge {
            reader,
            pty: Arc::new(PtyHandle::create(&spec).unwrap()),
            shared: Arc::new(SessionShared::new(1, TerminalState::new(20, 4), 64)),
        }
    }

    fn scripted(reads: Vec<io::Result<&'static [u8]>>) -> PtyReader {
        PtyReader::new(ScriptedReader(reads.into()))
    }

    fn exits(events: Vec<SessionEvent>) -> Vec<ExitCode> {
        events
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::Exited(code) => Some(code),
                _ => None,
            })
            .collect()
    }

    fn first_row(shared: &SessionShared) -> String {
        lock(&shared.terminal).snapshot().row_text(0).trim_end().to_string()
    }

    #[test]
    fn test_two_consecutive_read_failures_end_the_session() {
        let reads = vec![failed(), Ok(&b"a"[..]), failed(), failed(), Ok(&b"never"[..])];
        let bridge = bridge("sleep 5", scripted(reads));
        let (pty, shared) = (bridge.pty.clone(), bridge.shared.clone());
        let events = shared.hub.subscribe();

        bridge.run();

        assert_eq!(exits(events.collect()), vec![None]);
        assert!(!pty.is_alive());
        assert_eq!(shared.state(), SessionState::Exited(None));
        assert_eq!(first_row(&shared), "a");
    }

    #[test]
    fn test_successful_read_resets_failure_count() {
        let reads = vec![
            failed(),
            Ok(&b"a"[..]),
            failed(),
            Ok(&b"b"[..]),
            failed(),
            Ok(&b"c"[..]),
        ];
        let bridge = bridge("exit 3", scripted(reads));
        let shared = bridge.shared.clone();

        bridge.run();

        assert_eq!(first_row(&shared), "abc");
        assert_eq!(shared.state(), SessionState::Exited(Some(3)));
    }

    #[test]
    fn test_interrupted_reads_are_not_failures() {
        let reads = vec![failed(), interrupted(), interrupted(), interrupted(), Ok(&b"ok"[..])];
        let bridge = bridge("exit 0", scripted(reads));
        let shared = bridge.shared.clone();
        let events = shared.hub.subscribe();

        bridge.run();

        assert_eq!(first_row(&shared), "ok");
        assert_eq!(exits(events.collect()), vec![Some(0)]);
    }

    #[test]
    fn test_panicking_bridge_still_ends_session() {
        let bridge = bridge("sleep 5", PtyReader::new(PanickingReader));
        let (pty, shared) = (bridge.pty.clone(), bridge.shared.clone());
        let events = shared.hub.subscribe();

        let handle = thread::spawn(move || bridge.run());
        assert!(handle.join().is_err());

        assert_eq!(exits(events.collect()), vec![None]);
        assert!(!pty.is_alive());
        assert_eq!(shared.state(), SessionState::Exited(None));
        assert!(pty.wait_timeout(Duration::from_secs(5)).is_some());
    }
}
