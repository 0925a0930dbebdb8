//! Core terminal session components.
//!
//! This module contains everything below the host UI:
//!
//! - **pty**: pseudo-terminal wrapper (Unix pty pairs / Windows ConPTY)
//! - **term**: VT100/VT220 terminal state and ANSI escape sequence parser
//! - **bridge**: per-session read loop feeding pty output into the terminal
//! - **events**: update notifications and per-subscriber queues
//! - **session**: one pty + bridge + terminal state
//! - **manager**: registry of sessions keyed by id
//!
//! # Architecture
//!
//! ```text
//! SessionManager
//! └── Session (one per id)
//!     ├── PtyHandle (shell process I/O)
//!     ├── bridge thread ──feed──> TerminalState
//!     │                              ├── ScreenBuffer (cells + scrollback)
//!     │                              ├── CursorState
//!     │                              └── VtParser
//!     └── SubscriberHub ──> Subscription (one per renderer)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

mod bridge;
pub mod events;
pub mod manager;
pub mod pty;
pub mod session;
pub mod term;

/// Lock a mutex, recovering the data if another thread panicked while holding it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
