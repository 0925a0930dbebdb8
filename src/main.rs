//! deskterm - terminal sessions hosted inside your terminal
//!
//! Runs one or more shells on pseudo-terminals, emulates their screens with
//! the deskterm core and draws the focused one onto the host terminal.
//!
//! # Quick Start
//!
//! ```text
//! deskterm                  # Start with $SHELL
//! deskterm -s "bash -l"     # Custom command
//! deskterm --no-restart     # Quit when the last shell exits
//! ```
//!
//! # Keybindings (Ctrl+B prefix)
//!
//! | Key | Action |
//! |-----|--------|
//! | c | New session |
//! | n/p | Next/Previous session |
//! | x | Close session |
//! | d | Quit |
//! | Ctrl+B | Send a literal Ctrl+B |

use std::env;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use deskterm::config::{self, Config};
use deskterm::core::events::{SessionEvent, Subscription};
use deskterm::core::manager::SessionManager;
use deskterm::core::pty::TermSize;
use deskterm::core::session::{SessionId, SessionOptions};
use deskterm::core::term::TerminalModes;
use deskterm::ui::{KeyMapper, Renderer};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the main loop waits for host input before checking sessions
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ctrl+B
const PREFIX_BYTE: u8 = 0x02;

/// Command line options
#[derive(Debug, Default)]
struct CliOptions {
    /// Custom shell command line
    shell: Option<String>,
    /// Alternative config file
    config_path: Option<PathBuf>,
    no_restart: bool,
}

fn print_version() {
    eprintln!("deskterm {}", VERSION);
}

fn print_help() {
    eprintln!("deskterm {} - pty-backed terminal sessions", VERSION);
    eprintln!();
    eprintln!("Usage: deskterm [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Command to run (default: from config or $SHELL)");
    eprintln!("  -c, --config <PATH>   Read configuration from PATH");
    eprintln!("      --no-restart      Do not respawn shells that exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keybindings (Ctrl+B prefix):");
    eprintln!("  Ctrl+B, c             New session");
    eprintln!("  Ctrl+B, n             Next session");
    eprintln!("  Ctrl+B, p             Previous session");
    eprintln!("  Ctrl+B, x             Close session");
    eprintln!("  Ctrl+B, d             Quit");
    eprintln!("  Ctrl+B, Ctrl+B        Send Ctrl+B");
    eprintln!();
    eprintln!("Configuration: ~/.deskterm/config.toml");
    eprintln!("Log file:      ~/.deskterm/deskterm.log (level from RUST_LOG)");
}

fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-s" | "--shell" => {
                i += 1;
                let shell = args.get(i).ok_or("Missing shell argument")?;
                options.shell = Some(shell.clone());
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing config path")?;
                options.config_path = Some(PathBuf::from(path));
            }
            "--no-restart" => {
                options.no_restart = true;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(options)
}

/// Apply command line overrides on top of the loaded configuration
fn apply_cli(config: &mut Config, cli: &CliOptions) {
    if let Some(shell) = &cli.shell {
        let mut words = shell.split_whitespace().map(str::to_string);
        if let Some(program) = words.next() {
            config.shell = Some(program);
            config.args = words.collect();
        }
    }
    if cli.no_restart {
        config.restart_on_exit = false;
    }
}

/// Send logs to `~/.deskterm/deskterm.log`; the host terminal is in raw mode
fn init_logging() {
    let log_path = config::config_dir()
        .map(|dir| dir.join("deskterm.log"))
        .unwrap_or_else(|_| PathBuf::from("deskterm.log"));

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    init_logging();
    info!(version = VERSION, "deskterm starting");

    let mut config = match &cli.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(),
    };
    apply_cli(&mut config, &cli);

    let palette = config.palette.resolve().context("Invalid colour palette")?;
    let (cols, rows) = Renderer::size().context("Failed to query host terminal size")?;
    config.default_size = TermSize::new(rows, cols);
    info!(shell = %config.shell_program(), cols, rows, "Host terminal ready");

    let manager =
        SessionManager::new(config.session_options()).with_restart_on_exit(config.restart_on_exit);
    manager
        .create_default_session()
        .context("Failed to start the first session")?;

    let mut renderer = Renderer::new(palette);
    renderer.init().context("Failed to initialize host terminal")?;

    let events = spawn_input_thread().context("Failed to start input thread")?;
    let mut host = Host {
        manager: &manager,
        renderer: &mut renderer,
        view: None,
        prefix_pending: false,
        size: TermSize::new(rows, cols),
    };
    let result = host.run(&events);

    let _ = renderer.cleanup();
    manager.close_all();
    info!("deskterm exiting");

    if let Err(e) = &result {
        error!(error = %e, "Main loop failed");
    }
    result
}

/// Read host events on their own thread so rendering never waits on input
fn spawn_input_thread() -> std::io::Result<Receiver<Event>> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("deskterm-input".into())
        .spawn(move || loop {
            match event::read() {
                Ok(evt) => {
                    if tx.send(evt).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read host input");
                    break;
                }
            }
        })?;
    Ok(rx)
}

/// The focused session and its event stream
struct View {
    id: SessionId,
    events: Subscription,
}

/// What a key press asks the host to do
enum Action {
    Continue,
    Quit,
}

struct Host<'a> {
    manager: &'a SessionManager,
    renderer: &'a mut Renderer,
    view: Option<View>,
    prefix_pending: bool,
    size: TermSize,
}

impl Host<'_> {
    fn run(&mut self, input: &Receiver<Event>) -> anyhow::Result<()> {
        loop {
            if !self.sync_focus()? {
                info!("No sessions left");
                return Ok(());
            }
            self.drain_updates()?;

            for notice in self.manager.reap_exited() {
                info!(session_id = notice.id, code = ?notice.code, replacement = ?notice.replacement, "Session exited");
            }

            match input.recv_timeout(POLL_INTERVAL) {
                Ok(evt) => {
                    if let Action::Quit = self.handle_event(evt)? {
                        return Ok(());
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Host input closed");
                    return Ok(());
                }
            }
        }
    }

    /// Follow the manager's focus. `false` once there is nothing to show.
    fn sync_focus(&mut self) -> anyhow::Result<bool> {
        let Some(focused) = self.manager.focused() else {
            return Ok(false);
        };
        if self.view.as_ref().map(|view| view.id) == Some(focused) {
            return Ok(true);
        }

        let session = match self.manager.get(focused) {
            Ok(session) => session,
            Err(e) => {
                debug!(session_id = focused, error = %e, "Focused session vanished");
                self.view = None;
                return Ok(true);
            }
        };
        // Subscribe before reading the snapshot so no update falls between them
        let events = session.subscribe();
        if session.size() != self.size {
            if let Err(e) = session.resize(self.size) {
                debug!(session_id = focused, error = %e, "Resize on focus failed");
            }
        }
        self.renderer.render_full(&session.snapshot())?;
        self.view = Some(View { id: focused, events });
        debug!(session_id = focused, "Focus changed");
        Ok(true)
    }

    fn drain_updates(&mut self) -> anyhow::Result<()> {
        let Some(view) = &self.view else {
            return Ok(());
        };
        while let Some(event) = view.events.try_recv() {
            match event {
                SessionEvent::OutputUpdated(update) => self.renderer.render(&update)?,
                SessionEvent::TitleChanged(title) => {
                    debug!(session_id = view.id, %title, "Title changed");
                }
                SessionEvent::Exited(code) => {
                    let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                    self.renderer
                        .render_notice(&format!("[process exited with status {}]", code))?;
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, evt: Event) -> anyhow::Result<Action> {
        match evt {
            Event::Key(key) if key.kind != KeyEventKind::Release => return self.handle_key(key),
            Event::Paste(text) => {
                if let Some((id, modes)) = self.focused_modes() {
                    self.send(id, &KeyMapper::paste(&text, &modes));
                }
            }
            Event::Resize(cols, rows) => {
                self.size = TermSize::new(rows, cols);
                info!(cols, rows, "Host terminal resized");
                for summary in self.manager.list_sessions() {
                    if let Err(e) = self.manager.dispatch_resize(summary.id, self.size) {
                        debug!(session_id = summary.id, error = %e, "Resize skipped");
                    }
                }
                if let Some(view) = &self.view {
                    if let Ok(snapshot) = self.manager.snapshot(view.id) {
                        self.renderer.render_full(&snapshot)?;
                    }
                }
            }
            _ => {}
        }
        Ok(Action::Continue)
    }

    fn handle_key(&mut self, key: KeyEvent) -> anyhow::Result<Action> {
        let is_prefix = key.code == KeyCode::Char('b') && key.modifiers == KeyModifiers::CONTROL;

        if self.prefix_pending {
            self.prefix_pending = false;
            return self.handle_command(key, is_prefix);
        }
        if is_prefix {
            self.prefix_pending = true;
            return Ok(Action::Continue);
        }

        if let Some((id, modes)) = self.focused_modes() {
            if let Some(bytes) = KeyMapper::map(&key, &modes) {
                self.send(id, &bytes);
            }
        }
        Ok(Action::Continue)
    }

    /// Modes of the focused session, which decide how keys are encoded
    fn focused_modes(&self) -> Option<(SessionId, TerminalModes)> {
        let id = self.view.as_ref()?.id;
        let snapshot = self.manager.snapshot(id).ok()?;
        Some((id, snapshot.modes.clone()))
    }

    /// Keys following the prefix
    fn handle_command(&mut self, key: KeyEvent, is_prefix: bool) -> anyhow::Result<Action> {
        if is_prefix {
            if let Some(view) = &self.view {
                self.send(view.id, &[PREFIX_BYTE]);
            }
            return Ok(Action::Continue);
        }

        match key.code {
            KeyCode::Char('c') => {
                let defaults = self.manager.defaults();
                let options = SessionOptions {
                    spawn: defaults.spawn.clone().size(self.size),
                    ..defaults.clone()
                };
                match self.manager.create_session_with(options) {
                    Ok(id) => self.manager.focus(id)?,
                    Err(e) => {
                        self.renderer
                            .render_notice(&format!("[failed to start session: {}]", e))?;
                    }
                }
            }
            KeyCode::Char('n') => self.cycle_focus(1)?,
            KeyCode::Char('p') => self.cycle_focus(-1)?,
            KeyCode::Char('x') => {
                if let Some(view) = self.view.take() {
                    if let Err(e) = self.manager.close_session(view.id) {
                        debug!(session_id = view.id, error = %e, "Close skipped");
                    }
                }
            }
            KeyCode::Char('d') => return Ok(Action::Quit),
            _ => {}
        }
        Ok(Action::Continue)
    }

    fn cycle_focus(&mut self, step: isize) -> anyhow::Result<()> {
        let ids: Vec<SessionId> = self.manager.list_sessions().iter().map(|s| s.id).collect();
        let Some(current) = self.manager.focused() else {
            return Ok(());
        };
        let Some(index) = ids.iter().position(|&id| id == current) else {
            return Ok(());
        };
        let next = (index as isize + step).rem_euclid(ids.len() as isize) as usize;
        self.manager.focus(ids[next])?;
        Ok(())
    }

    fn send(&self, id: SessionId, bytes: &[u8]) {
        if let Err(e) = self.manager.dispatch_input(id, bytes) {
            debug!(session_id = id, error = %e, "Input dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("deskterm")
            .chain(list.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_parse_args() {
        let cli = parse_args(&args(&["-s", "bash -l", "--config", "/tmp/x.toml", "--no-restart"])).unwrap();
        assert_eq!(cli.shell.as_deref(), Some("bash -l"));
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/x.toml")));
        assert!(cli.no_restart);

        assert!(parse_args(&args(&["--shell"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let mut config = Config::default();
        let cli = CliOptions {
            shell: Some("zsh -l -i".into()),
            config_path: None,
            no_restart: true,
        };
        apply_cli(&mut config, &cli);

        assert_eq!(config.shell.as_deref(), Some("zsh"));
        assert_eq!(config.args, vec!["-l".to_string(), "-i".to_string()]);
        assert!(!config.restart_on_exit);
    }
}
