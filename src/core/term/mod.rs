//! VT100/VT220 terminal emulation.
//!
//! - **state**: screen grid, cursor, scrollback, snapshots and damage
//! - **parser**: byte-level escape sequence state machine

pub mod parser;
pub mod state;

pub use parser::{Response, VtParser};
pub use state::{
    AttrFlags, Cell, CellAttrs, Color, CursorShape, DiffRegion, Row, ScreenSnapshot,
    TerminalModes, TerminalState, DEFAULT_SCROLLBACK_LIMIT,
};
