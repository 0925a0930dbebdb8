//! Host terminal front end.
//!
//! - **renderer**: draws session screen updates with crossterm
//! - **keymapper**: host key and paste events to pty input bytes

pub mod keymapper;
pub mod renderer;

pub use keymapper::{KeyMapper, Modifiers};
pub use renderer::Renderer;
