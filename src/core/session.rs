//! Session management
//!
//! A [`Session`] ties one pty-backed process to one terminal state. Output
//! is pumped by a dedicated bridge thread (see [`super::bridge`]); callers
//! send input, resize and close through the session and observe the
//! screen through snapshots or a [`Subscription`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use super::bridge;
use super::events::{ScreenUpdate, SessionEvent, SubscriberHub, Subscription, DEFAULT_QUEUE_CAPACITY};
use super::lock;
use super::pty::{ExitCode, PtyError, PtyHandle, SpawnSpec, TermSize};
use super::term::{ScreenSnapshot, TerminalState, DEFAULT_SCROLLBACK_LIMIT};

/// Process-lifetime unique session identifier
pub type SessionId = u64;

/// How long `close` waits for the bridge to observe the exit, beyond the grace period
const CLOSE_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session {0} not found")]
    NotFound(SessionId),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Session {0} has exited")]
    Exited(SessionId),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Lifecycle state; only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Exited(ExitCode),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Starting => 0,
            SessionState::Running => 1,
            SessionState::Exited(_) => 2,
        }
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, SessionState::Exited(_))
    }
}

/// Resolved settings for one session
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub spawn: SpawnSpec,
    pub scrollback_limit: usize,
    /// Time between the hangup signal and a forced kill
    pub terminate_grace: Duration,
    pub event_queue_capacity: usize,
    /// Treat LF as CR LF. The pty line discipline normally does this already.
    pub newline_mode: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            spawn: SpawnSpec::shell(),
            scrollback_limit: DEFAULT_SCROLLBACK_LIMIT,
            terminate_grace: Duration::from_millis(500),
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            newline_mode: false,
        }
    }
}

impl SessionOptions {
    pub fn new(spawn: SpawnSpec) -> Self {
        Self {
            spawn,
            ..Self::default()
        }
    }
}

/// State shared between a session and its bridge thread
pub(crate) struct SessionShared {
    pub(crate) id: SessionId,
    pub(crate) terminal: Mutex<TerminalState>,
    snapshot: Mutex<Arc<ScreenSnapshot>>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    pub(crate) hub: SubscriberHub,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, terminal: TerminalState, queue_capacity: usize) -> Self {
        let snapshot = Arc::new(terminal.snapshot());
        Self {
            id,
            terminal: Mutex::new(terminal),
            snapshot: Mutex::new(snapshot),
            state: Mutex::new(SessionState::Starting),
            state_changed: Condvar::new(),
            hub: SubscriberHub::new(queue_capacity),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `next` if it is later in the lifecycle; returns whether it moved
    fn advance(&self, next: SessionState) -> bool {
        let mut state = lock(&self.state);
        if next.rank() <= state.rank() {
            return false;
        }
        *state = next;
        self.state_changed.notify_all();
        true
    }

    /// Snapshot the terminal and publish the change.
    ///
    /// Called with the terminal lock held so updates reach subscribers in
    /// mutation order.
    pub(crate) fn publish(&self, terminal: &mut TerminalState) {
        let region = terminal.take_damage();
        let title = terminal.take_title_change();
        let snapshot = Arc::new(terminal.snapshot());
        *lock(&self.snapshot) = snapshot.clone();

        self.hub
            .publish(SessionEvent::OutputUpdated(ScreenUpdate { region, snapshot }));
        if let Some(title) = title {
            self.hub.publish(SessionEvent::TitleChanged(title));
        }
    }

    /// Record the exit; only the first call emits `Exited`
    pub(crate) fn finish(&self, code: ExitCode) -> bool {
        if !self.advance(SessionState::Exited(code)) {
            return false;
        }
        tracing::info!(session_id = self.id, exit_code = ?code, "Session exited");
        self.hub.publish(SessionEvent::Exited(code));
        self.hub.close();
        true
    }

    fn wait_exited(&self, timeout: Duration) -> Option<ExitCode> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let SessionState::Exited(code) = *state {
                return Some(code);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .state_changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// A shell session
pub struct Session {
    id: SessionId,
    created_at: SystemTime,
    spawn: SpawnSpec,
    terminate_grace: Duration,
    pty: Arc<PtyHandle>,
    shared: Arc<SessionShared>,
    bridge: Mutex<Option<JoinHandle<()>>>,
    close_requested: AtomicBool,
}

impl Session {
    /// Spawn the process and start pumping its output
    pub fn start(id: SessionId, options: SessionOptions) -> Result<Self> {
        let size = options.spawn.size;
        let mut terminal =
            TerminalState::with_scrollback(size.cols, size.rows, options.scrollback_limit);
        terminal.set_newline_mode(options.newline_mode);
        let shared = Arc::new(SessionShared::new(id, terminal, options.event_queue_capacity));

        let pty = Arc::new(PtyHandle::create(&options.spawn)?);
        let reader = pty.reader()?;
        let handle = bridge::spawn(reader, pty.clone(), shared.clone())
            .map_err(PtyError::Io)?;
        shared.advance(SessionState::Running);

        tracing::info!(
            session_id = id,
            command = %options.spawn.command_line(),
            rows = size.rows,
            cols = size.cols,
            "Session started"
        );

        Ok(Self {
            id,
            created_at: SystemTime::now(),
            spawn: options.spawn,
            terminate_grace: options.terminate_grace,
            pty,
            shared,
            bridge: Mutex::new(Some(handle)),
            close_requested: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The spec this session was started from
    pub fn spawn_spec(&self) -> &SpawnSpec {
        &self.spawn
    }

    pub fn size(&self) -> TermSize {
        self.pty.size()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Latest published screen state
    pub fn snapshot(&self) -> Arc<ScreenSnapshot> {
        lock(&self.shared.snapshot).clone()
    }

    pub fn title(&self) -> String {
        self.snapshot().title.clone()
    }

    /// Rows scrolled off the primary screen, oldest first, one per line
    pub fn scrollback_text(&self) -> String {
        lock(&self.shared.terminal).scrollback_lines().join("\n")
    }

    /// Events from now on; ends after `Exited`
    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    /// Write input bytes to the process
    pub fn send_input(&self, data: &[u8]) -> Result<()> {
        if self.state().is_exited() {
            return Err(SessionError::Exited(self.id));
        }
        self.pty.write(data).map_err(|e| match e {
            PtyError::Closed => SessionError::Exited(self.id),
            other => SessionError::Pty(other),
        })
    }

    /// Resize the pty, then the grid, and publish a full redraw.
    ///
    /// Both happen under the terminal lock, so concurrent resizes cannot
    /// leave the pty and the grid at different sizes, and output written
    /// after the size change is never fed into the old grid.
    pub fn resize(&self, size: TermSize) -> Result<()> {
        if self.state().is_exited() {
            return Err(SessionError::Exited(self.id));
        }
        let mut terminal = lock(&self.shared.terminal);
        self.pty.resize(size)?;
        terminal.resize(size.cols, size.rows);
        self.shared.publish(&mut terminal);
        Ok(())
    }

    /// True once `close` has been called
    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Wait until the session has exited, up to `timeout`
    pub fn wait(&self, timeout: Duration) -> Option<ExitCode> {
        self.shared.wait_exited(timeout)
    }

    /// Terminate the process and stop the bridge.
    ///
    /// Safe to call any number of times; `Exited` is published at most once.
    pub fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        if !self.state().is_exited() {
            tracing::info!(session_id = self.id, "Closing session");
            self.pty.terminate(self.terminate_grace);

            if self
                .shared
                .wait_exited(self.terminate_grace + CLOSE_SETTLE_TIMEOUT)
                .is_none()
            {
                tracing::warn!(session_id = self.id, "Bridge did not observe exit, forcing");
                self.shared.finish(self.pty.try_wait().ok().flatten());
            }
        }
        self.join_bridge();
    }

    /// Join the bridge if it has finished; a thread still blocked in read is detached
    fn join_bridge(&self) {
        let mut bridge = lock(&self.bridge);
        if bridge.as_ref().map_or(false, |h| h.is_finished()) {
            if let Some(handle) = bridge.take() {
                if handle.join().is_err() {
                    tracing::error!(session_id = self.id, "Bridge thread panicked");
                }
            }
        } else {
            bridge.take();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state().is_exited() {
            self.pty.terminate(Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("command", &self.spawn.command_line())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::term::DiffRegion;

    fn sh(script: &str) -> SessionOptions {
        SessionOptions::new(
            SpawnSpec::new("/bin/sh")
                .arg("-c")
                .arg(script)
                .size(TermSize::new(24, 80)),
        )
    }

    fn wait_for_text(session: &Session, needle: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let snapshot = session.snapshot();
            if (0..snapshot.rows).any(|r| snapshot.row_text(r).contains(needle)) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_output_reaches_snapshot() {
        let session = Session::start(1, sh("printf 'hello\\n'; sleep 5")).unwrap();
        assert!(wait_for_text(&session, "hello"));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.row_text(0).trim_end(), "hello");
        assert_eq!((snapshot.cursor_row, snapshot.cursor_col), (1, 0));
        session.close();
    }

    #[test]
    fn test_natural_exit_reports_code_once() {
        let session = Session::start(2, sh("sleep 0.3; exit 7")).unwrap();
        let events = session.subscribe();

        assert_eq!(session.wait(Duration::from_secs(10)), Some(Some(7)));
        assert_eq!(session.state(), SessionState::Exited(Some(7)));

        session.close();
        session.close();

        let exits = events
            .filter(|e| matches!(e, SessionEvent::Exited(_)))
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn test_close_is_idempotent_and_emits_single_exit() {
        let session = Session::start(3, SessionOptions::new(SpawnSpec::new("/bin/sh"))).unwrap();
        let events = session.subscribe();

        session.close();
        assert!(session.state().is_exited());
        session.close();

        let exits = events
            .filter(|e| matches!(e, SessionEvent::Exited(_)))
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn test_input_after_close_is_an_error() {
        let session = Session::start(4, SessionOptions::new(SpawnSpec::new("/bin/sh"))).unwrap();
        session.close();

        assert!(matches!(session.send_input(b"echo hi\n"), Err(SessionError::Exited(4))));
        assert!(matches!(
            session.resize(TermSize::new(10, 10)),
            Err(SessionError::Exited(4))
        ));
    }

    #[test]
    fn test_input_round_trips_through_shell() {
        let session = Session::start(5, SessionOptions::new(SpawnSpec::new("/bin/sh"))).unwrap();
        session.send_input(b"echo SUM_$((40+2))\n").unwrap();
        assert!(wait_for_text(&session, "SUM_42"));
        session.close();
    }

    #[test]
    fn test_resize_updates_grid_and_publishes_full_redraw() {
        let session = Session::start(6, sh("sleep 5")).unwrap();
        let events = session.subscribe();

        session.resize(TermSize::new(30, 100)).unwrap();
        let snapshot = session.snapshot();
        assert_eq!((snapshot.rows, snapshot.cols), (30, 100));
        assert_eq!(session.size(), TermSize::new(30, 100));

        let resized = events.recv_timeout(Duration::from_secs(5));
        assert!(matches!(
            resized,
            Some(SessionEvent::OutputUpdated(ScreenUpdate { region: DiffRegion::Full, .. }))
        ));
        session.close();
    }

    #[test]
    fn test_concurrent_resizes_leave_pty_and_grid_agreeing() {
        let session = Session::start(10, sh("sleep 5")).unwrap();
        let sizes = [TermSize::new(20, 60), TermSize::new(40, 120)];

        for _ in 0..50 {
            std::thread::scope(|scope| {
                for size in sizes {
                    let session = &session;
                    scope.spawn(move || session.resize(size).unwrap());
                }
            });
            let snapshot = session.snapshot();
            let size = session.size();
            assert_eq!((snapshot.rows, snapshot.cols), (size.rows, size.cols));
        }
        session.close();
    }

    #[test]
    fn test_device_status_query_is_answered() {
        // The shell asks for the cursor position and prints the reply it reads back
        let script = "stty raw -echo; printf '\\033[6n'; \
                      reply=$(dd bs=1 count=6 2>/dev/null); \
                      stty sane; printf 'GOT:%s\\n' \"$reply\" | tr -d '\\033'";
        let session = Session::start(7, sh(script)).unwrap();
        assert!(wait_for_text(&session, "GOT:[1;1R"));
        session.close();
    }

    #[test]
    fn test_title_change_event() {
        let session = Session::start(8, sh("sleep 0.3; printf '\\033]0;deskterm\\007'; sleep 5")).unwrap();
        let events = session.subscribe();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut title = None;
        while title.is_none() && Instant::now() < deadline {
            if let Some(SessionEvent::TitleChanged(t)) = events.recv_timeout(Duration::from_millis(100)) {
                title = Some(t);
            }
        }
        assert_eq!(title.as_deref(), Some("deskterm"));
        assert_eq!(session.title(), "deskterm");
        session.close();
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let options = SessionOptions::new(SpawnSpec::new("/nonexistent/deskterm-shell"));
        match Session::start(9, options) {
            Err(SessionError::Pty(PtyError::Spawn { command, .. })) => {
                assert_eq!(command, "/nonexistent/deskterm-shell");
            }
            Ok(session) => {
                // Some platforms report exec failure only through the exit status
                assert!(session.wait(Duration::from_secs(10)).is_some());
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
