//! Session registry
//!
//! [`SessionManager`] assigns ids, routes requests to sessions and collects
//! exit notifications. The registry lock is held only for map lookups and
//! updates, never while a session does I/O.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use super::events::Subscription;
use super::lock;
use super::pty::{ExitCode, SpawnSpec, TermSize};
use super::session::{Result, Session, SessionError, SessionId, SessionOptions, SessionState};
use super::term::ScreenSnapshot;

/// What `list_sessions` reports per session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub title: String,
    pub created_at: SystemTime,
}

/// A session that exited on its own
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitNotice {
    pub id: SessionId,
    pub code: ExitCode,
    /// New session started in its place when restart-on-exit is enabled
    pub replacement: Option<SessionId>,
}

/// Owns every live session
pub struct SessionManager {
    /// Ids are allocated in increasing order, so map order is creation order
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
    focused: Mutex<Option<SessionId>>,
    defaults: SessionOptions,
    restart_on_exit: bool,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl SessionManager {
    /// Create a manager whose sessions start from `defaults`
    pub fn new(defaults: SessionOptions) -> Self {
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            focused: Mutex::new(None),
            defaults,
            restart_on_exit: false,
        }
    }

    /// Replace sessions whose process exits on its own (see [`reap_exited`](Self::reap_exited))
    pub fn with_restart_on_exit(mut self, restart: bool) -> Self {
        self.restart_on_exit = restart;
        self
    }

    pub fn defaults(&self) -> &SessionOptions {
        &self.defaults
    }

    /// Start a session running the default command at the default size
    pub fn create_default_session(&self) -> Result<SessionId> {
        self.create_session_with(self.defaults.clone())
    }

    /// Start a session running `spawn`, other settings from the defaults
    pub fn create_session(&self, spawn: SpawnSpec) -> Result<SessionId> {
        self.create_session_with(SessionOptions {
            spawn,
            ..self.defaults.clone()
        })
    }

    pub fn create_session_with(&self, options: SessionOptions) -> Result<SessionId> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = match Session::start(id, options) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                tracing::error!(session_id = id, error = %e, "Failed to create session");
                return Err(e);
            }
        };

        lock(&self.sessions).insert(id, session);
        let mut focused = lock(&self.focused);
        if focused.is_none() {
            *focused = Some(id);
        }
        tracing::info!(session_id = id, "Session registered");
        Ok(id)
    }

    /// Close a session and drop it from the registry
    pub fn close_session(&self, id: SessionId) -> Result<()> {
        let session = self.get(id)?;
        session.close();
        self.remove(id);
        tracing::info!(session_id = id, "Session closed");
        Ok(())
    }

    pub fn dispatch_input(&self, id: SessionId, data: &[u8]) -> Result<()> {
        self.get(id)?.send_input(data)
    }

    pub fn dispatch_resize(&self, id: SessionId, size: TermSize) -> Result<()> {
        self.get(id)?.resize(size)
    }

    /// Sessions in creation order
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.all()
            .iter()
            .map(|session| SessionSummary {
                id: session.id(),
                state: session.state(),
                title: session.title(),
                created_at: session.created_at(),
            })
            .collect()
    }

    /// Look up a session by id
    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        lock(&self.sessions)
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    pub fn subscribe(&self, id: SessionId) -> Result<Subscription> {
        Ok(self.get(id)?.subscribe())
    }

    pub fn snapshot(&self, id: SessionId) -> Result<Arc<ScreenSnapshot>> {
        Ok(self.get(id)?.snapshot())
    }

    pub fn focus(&self, id: SessionId) -> Result<()> {
        if !lock(&self.sessions).contains_key(&id) {
            return Err(SessionError::NotFound(id));
        }
        *lock(&self.focused) = Some(id);
        Ok(())
    }

    pub fn focused(&self) -> Option<SessionId> {
        *lock(&self.focused)
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    /// Collect sessions whose process exited on its own.
    ///
    /// A session counts once its bridge has drained the output and
    /// published `Exited`; sessions being closed through
    /// [`close_session`](Self::close_session) are left alone. Each one is
    /// removed from the registry and, with restart-on-exit enabled, replaced
    /// by a new session running the same command at the same size.
    pub fn reap_exited(&self) -> Vec<ExitNotice> {
        let exited: Vec<(Arc<Session>, ExitCode)> = self
            .all()
            .into_iter()
            .filter(|session| !session.close_requested())
            .filter_map(|session| match session.state() {
                SessionState::Exited(code) => Some((session, code)),
                _ => None,
            })
            .collect();

        let mut notices = Vec::new();
        for (session, code) in exited {
            let id = session.id();
            let was_focused = self.focused() == Some(id);
            if !self.remove(id) {
                continue;
            }
            tracing::info!(session_id = id, exit_code = ?code, "Reaped exited session");

            let replacement = if self.restart_on_exit {
                self.restart(&session, was_focused)
            } else {
                None
            };
            notices.push(ExitNotice {
                id,
                code,
                replacement,
            });
        }
        notices
    }

    fn restart(&self, session: &Session, focus: bool) -> Option<SessionId> {
        let spawn = SpawnSpec {
            size: session.size(),
            ..session.spawn_spec().clone()
        };
        match self.create_session(spawn) {
            Ok(new_id) => {
                tracing::info!(session_id = session.id(), replacement = new_id, "Restarted session");
                if focus {
                    *lock(&self.focused) = Some(new_id);
                }
                Some(new_id)
            }
            Err(e) => {
                tracing::error!(session_id = session.id(), error = %e, "Failed to restart session");
                None
            }
        }
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = lock(&self.sessions);
            std::mem::take(&mut *map).into_values().collect()
        };
        *lock(&self.focused) = None;
        for session in sessions {
            session.close();
        }
    }

    fn all(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Drop a session from the registry, moving focus to a neighbour
    fn remove(&self, id: SessionId) -> bool {
        let mut sessions = lock(&self.sessions);
        if sessions.remove(&id).is_none() {
            return false;
        }
        let mut focused = lock(&self.focused);
        if *focused == Some(id) {
            *focused = sessions
                .range(id..)
                .next()
                .or_else(|| sessions.range(..id).next_back())
                .map(|(&next, _)| next);
        }
        true
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn manager() -> SessionManager {
        SessionManager::new(SessionOptions::new(
            SpawnSpec::new("/bin/sh").size(TermSize::new(24, 80)),
        ))
    }

    fn reap_until(manager: &SessionManager, count: usize) -> Vec<ExitNotice> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut notices = Vec::new();
        while notices.len() < count && Instant::now() < deadline {
            notices.extend(manager.reap_exited());
            thread::sleep(Duration::from_millis(20));
        }
        notices
    }

    #[test]
    fn test_close_one_of_two_sessions() {
        let manager = manager();
        let first = manager.create_default_session().unwrap();
        let second = manager.create_default_session().unwrap();
        assert!(first < second);

        manager.close_session(first).unwrap();

        let listed = manager.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[0].state, SessionState::Running);
        assert_eq!(manager.focused(), Some(second));
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let manager = manager();
        assert!(matches!(manager.close_session(42), Err(SessionError::NotFound(42))));
        assert!(matches!(manager.dispatch_input(42, b"x"), Err(SessionError::NotFound(42))));
        assert!(matches!(
            manager.dispatch_resize(42, TermSize::new(10, 10)),
            Err(SessionError::NotFound(42))
        ));
        assert!(matches!(manager.focus(42), Err(SessionError::NotFound(42))));
    }

    #[test]
    fn test_input_to_closed_session_is_an_error() {
        let manager = manager();
        let id = manager.create_default_session().unwrap();
        let session = manager.get(id).unwrap();

        manager.close_session(id).unwrap();

        assert!(matches!(session.send_input(b"ls\n"), Err(SessionError::Exited(_))));
        assert!(matches!(manager.dispatch_input(id, b"ls\n"), Err(SessionError::NotFound(_))));
        // The manager keeps working
        let other = manager.create_default_session().unwrap();
        manager.dispatch_input(other, b"true\n").unwrap();
    }

    #[test]
    fn test_list_preserves_creation_order() {
        let manager = manager();
        let ids: Vec<_> = (0..3)
            .map(|_| manager.create_default_session().unwrap())
            .collect();
        let listed: Vec<_> = manager.list_sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_reap_removes_exited_sessions() {
        let manager = manager();
        let id = manager
            .create_session(SpawnSpec::new("/bin/sh").arg("-c").arg("exit 5"))
            .unwrap();

        let notices = reap_until(&manager, 1);
        assert_eq!(
            notices,
            vec![ExitNotice {
                id,
                code: Some(5),
                replacement: None
            }]
        );
        assert!(manager.is_empty());
        assert_eq!(manager.focused(), None);
    }

    #[test]
    fn test_restart_on_exit_spawns_replacement() {
        let manager = manager().with_restart_on_exit(true);
        let id = manager
            .create_session(SpawnSpec::new("/bin/sh").arg("-c").arg("sleep 0.2"))
            .unwrap();

        let notices = reap_until(&manager, 1);
        assert_eq!(notices.len(), 1);
        let replacement = notices[0].replacement.unwrap();
        assert_ne!(replacement, id);
        assert_eq!(manager.focused(), Some(replacement));
        assert!(manager.get(replacement).is_ok());

        // Stop the cycle before the manager is dropped
        manager.close_all();
        assert!(manager.is_empty());
    }

    #[test]
    fn test_explicit_close_is_not_reaped() {
        let manager = manager().with_restart_on_exit(true);
        let id = manager.create_default_session().unwrap();
        manager.close_session(id).unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(manager.reap_exited().is_empty());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_focus_moves_between_sessions() {
        let manager = manager();
        let a = manager.create_default_session().unwrap();
        let b = manager.create_default_session().unwrap();
        let c = manager.create_default_session().unwrap();
        assert_eq!(manager.focused(), Some(a));

        manager.focus(c).unwrap();
        manager.close_session(c).unwrap();
        assert_eq!(manager.focused(), Some(b));

        manager.close_all();
        assert_eq!(manager.focused(), None);
    }

    #[test]
    fn test_subscribe_routes_to_session() {
        let manager = manager();
        let id = manager.create_default_session().unwrap();
        let events = manager.subscribe(id).unwrap();

        manager.dispatch_resize(id, TermSize::new(12, 40)).unwrap();
        let event = events.recv_timeout(Duration::from_secs(5));
        assert!(matches!(event, Some(crate::core::events::SessionEvent::OutputUpdated(_))));
        assert_eq!(manager.snapshot(id).unwrap().cols, 40);
    }
}
