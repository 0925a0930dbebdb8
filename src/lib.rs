//! deskterm - pty-backed terminal sessions with a built-in VT emulator
//!
//! The [`core`] module owns everything below the screen: pseudo-terminals,
//! the escape sequence parser and screen model, per-session read loops and
//! the session registry. [`ui`] is a crossterm front end that draws the
//! published snapshots, and [`config`] loads the TOML settings both use.
//!
//! ```no_run
//! use deskterm::core::manager::SessionManager;
//! use deskterm::core::session::SessionOptions;
//!
//! let manager = SessionManager::new(SessionOptions::default());
//! let id = manager.create_default_session()?;
//! let updates = manager.subscribe(id)?;
//! manager.dispatch_input(id, b"echo hi\r")?;
//! if let Some(event) = updates.recv() {
//!     println!("{:?}", event);
//! }
//! manager.close_session(id)?;
//! # Ok::<(), deskterm::core::session::SessionError>(())
//! ```

pub mod config;
pub mod core;
pub mod ui;

pub use crate::config::Config;
pub use crate::core::events::{ScreenUpdate, SessionEvent, Subscription};
pub use crate::core::manager::{ExitNotice, SessionManager, SessionSummary};
pub use crate::core::pty::{SpawnSpec, TermSize};
pub use crate::core::session::{Session, SessionError, SessionId, SessionOptions, SessionState};
pub use crate::core::term::{DiffRegion, ScreenSnapshot, TerminalState};
