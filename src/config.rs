//! Configuration management for deskterm.
//!
//! Settings are read from `~/.deskterm/config.toml`. Every key is optional;
//! missing keys take their defaults.
//!
//! ```toml
//! # Program to run (defaults to $SHELL, or %COMSPEC% on Windows)
//! shell = "/bin/bash"
//! args = ["-l"]
//!
//! # Respawn the shell when it exits on its own
//! restart_on_exit = true
//! scrollback_limit = 10000
//!
//! [default_size]
//! rows = 24
//! cols = 80
//!
//! [env]
//! EDITOR = "vim"
//!
//! # Colours: "#rrggbb", "rgb(r, g, b)" or "rgba(r, g, b, a)"
//! [palette]
//! foreground = "#ffffff"
//! bright_blue = "rgb(70, 130, 180)"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::pty::{default_shell, SpawnSpec, TermSize};
use crate::core::session::SessionOptions;

const CONFIG_DIR: &str = ".deskterm";
const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid color `{0}`")]
    InvalidColor(String),

    #[error("Could not determine home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program to run in new sessions
    pub shell: Option<String>,
    /// Arguments for the program
    pub args: Vec<String>,
    /// Working directory for new sessions
    pub cwd: Option<PathBuf>,
    /// Extra environment on top of the inherited one
    pub env: BTreeMap<String, String>,
    /// Rows kept after scrolling off the top
    pub scrollback_limit: usize,
    pub default_size: TermSize,
    /// Start a fresh session when the process exits by itself
    pub restart_on_exit: bool,
    /// Milliseconds between the hangup signal and a forced kill
    pub terminate_grace_ms: u64,
    /// Pending updates per subscriber before they are merged
    pub event_queue_capacity: usize,
    /// Treat a bare LF as CR LF
    pub newline_mode: bool,
    pub palette: Palette,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            scrollback_limit: 10_000,
            default_size: TermSize::default(),
            restart_on_exit: true,
            terminate_grace_ms: 500,
            event_queue_capacity: 64,
            newline_mode: false,
            palette: Palette::default(),
        }
    }
}

impl Config {
    /// Load `~/.deskterm/config.toml`, falling back to defaults
    pub fn load() -> Self {
        let path = match config_path() {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(error = %e, "Using default configuration");
                return Self::default();
            }
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid configuration");
                Self::default()
            }
        }
    }

    /// Load and validate a configuration file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        config.palette.resolve()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save to `~/.deskterm/config.toml`
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(write_error)?;
        }
        fs::write(path, content).map_err(write_error)
    }

    /// Program used for new sessions
    pub fn shell_program(&self) -> String {
        self.shell.clone().unwrap_or_else(default_shell)
    }

    /// Resolve the settings the session core consumes
    pub fn session_options(&self) -> SessionOptions {
        let spawn = SpawnSpec {
            program: self.shell_program(),
            args: self.args.clone(),
            env: self.env.clone(),
            cwd: self.cwd.clone(),
            size: TermSize::new(self.default_size.rows, self.default_size.cols),
        };
        SessionOptions {
            spawn,
            scrollback_limit: self.scrollback_limit,
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            event_queue_capacity: self.event_queue_capacity.max(1),
            newline_mode: self.newline_mode,
        }
    }
}

/// `~/.deskterm`
pub fn config_dir() -> Result<PathBuf> {
    home_dir()
        .map(|home| home.join(CONFIG_DIR))
        .ok_or(ConfigError::NoHomeDir)
}

/// `~/.deskterm/config.toml`
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Colour as written in the config file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 255 }
    }

    /// Parse `#rrggbb`, `#rgb`, `rgb(r, g, b)` or `rgba(r, g, b, a)`
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || ConfigError::InvalidColor(value.to_string());
        let value = value.trim();

        if let Some(hex) = value.strip_prefix('#') {
            let digits: Vec<u8> = hex
                .chars()
                .map(|c| c.to_digit(16).map(|d| d as u8))
                .collect::<Option<_>>()
                .ok_or_else(invalid)?;
            return match digits.as_slice() {
                [r, g, b] => Ok(Self::rgb(r * 17, g * 17, b * 17)),
                [r1, r2, g1, g2, b1, b2] => Ok(Self::rgb(r1 * 16 + r2, g1 * 16 + g2, b1 * 16 + b2)),
                _ => Err(invalid()),
            };
        }

        let (body, with_alpha) = if let Some(body) = value.strip_prefix("rgba(") {
            (body, true)
        } else if let Some(body) = value.strip_prefix("rgb(") {
            (body, false)
        } else {
            return Err(invalid());
        };
        let components = body
            .strip_suffix(')')
            .ok_or_else(invalid)?
            .split(',')
            .map(|part| part.trim().parse::<u8>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;

        match (components.as_slice(), with_alpha) {
            ([r, g, b], false) => Ok(Self::rgb(*r, *g, *b)),
            ([r, g, b, a], true) => Ok(Self { r: *r, g: *g, b: *b, a: *a }),
            _ => Err(invalid()),
        }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

/// ANSI palette plus default colours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Palette {
    pub foreground: String,
    pub background: String,
    pub black: String,
    pub red: String,
    pub green: String,
    pub yellow: String,
    pub blue: String,
    pub magenta: String,
    pub cyan: String,
    pub white: String,
    pub bright_black: String,
    pub bright_red: String,
    pub bright_green: String,
    pub bright_yellow: String,
    pub bright_blue: String,
    pub bright_magenta: String,
    pub bright_cyan: String,
    pub bright_white: String,
}

impl Default for Palette {
    fn default() -> Self {
        let s = |v: &str| v.to_string();
        Self {
            foreground: s("#ffffff"),
            background: s("rgba(0, 0, 0, 1)"),
            black: s("#000000"),
            red: s("#800000"),
            green: s("#008000"),
            yellow: s("#808000"),
            blue: s("#000080"),
            magenta: s("#800080"),
            cyan: s("#008080"),
            white: s("#c0c0c0"),
            bright_black: s("#808080"),
            bright_red: s("#ff0000"),
            bright_green: s("#00ff00"),
            bright_yellow: s("#ffff00"),
            bright_blue: s("#4682b4"),
            bright_magenta: s("#ff00ff"),
            bright_cyan: s("#00ffff"),
            bright_white: s("#ffffff"),
        }
    }
}

impl Palette {
    /// Parse every colour
    pub fn resolve(&self) -> Result<ResolvedPalette> {
        let ansi = [
            &self.black,
            &self.red,
            &self.green,
            &self.yellow,
            &self.blue,
            &self.magenta,
            &self.cyan,
            &self.white,
            &self.bright_black,
            &self.bright_red,
            &self.bright_green,
            &self.bright_yellow,
            &self.bright_blue,
            &self.bright_magenta,
            &self.bright_cyan,
            &self.bright_white,
        ];
        let mut resolved = [Rgba::rgb(0, 0, 0); 16];
        for (slot, value) in resolved.iter_mut().zip(ansi) {
            *slot = Rgba::parse(value)?;
        }
        Ok(ResolvedPalette {
            foreground: Rgba::parse(&self.foreground)?,
            background: Rgba::parse(&self.background)?,
            ansi: resolved,
        })
    }
}

/// Palette with every colour parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPalette {
    pub foreground: Rgba,
    pub background: Rgba,
    pub ansi: [Rgba; 16],
}

impl Default for ResolvedPalette {
    fn default() -> Self {
        Palette::default().resolve().unwrap_or(Self {
            foreground: Rgba::rgb(255, 255, 255),
            background: Rgba::rgb(0, 0, 0),
            ansi: [Rgba::rgb(0, 0, 0); 16],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_color_formats() {
        assert_eq!(Rgba::parse("#4682b4").unwrap(), Rgba::rgb(70, 130, 180));
        assert_eq!(Rgba::parse("#fff").unwrap(), Rgba::rgb(255, 255, 255));
        assert_eq!(Rgba::parse("rgb(1, 2, 3)").unwrap(), Rgba::rgb(1, 2, 3));
        assert_eq!(
            Rgba::parse(" rgba(10,20,30,40) ").unwrap(),
            Rgba { r: 10, g: 20, b: 30, a: 40 }
        );
    }

    #[test]
    fn test_parse_color_rejects_garbage() {
        for bad in ["", "red", "#12345", "#gggggg", "rgb(1,2)", "rgb(1,2,3,4)", "rgba(1,2,3)", "rgb(256,0,0)", "rgb(1,2,3"] {
            assert!(
                matches!(Rgba::parse(bad), Err(ConfigError::InvalidColor(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_default_palette_resolves() {
        let palette = Palette::default().resolve().unwrap();
        assert_eq!(palette.ansi[1], Rgba::rgb(0x80, 0, 0));
        assert_eq!(palette.ansi[12], Rgba::rgb(0x46, 0x82, 0xb4));
        assert_eq!(palette.background.a, 1);
        assert_eq!(ResolvedPalette::default(), palette);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.shell = Some("/bin/zsh".into());
        config.args = vec!["-l".into()];
        config.env.insert("EDITOR".into(), "vim".into());
        config.default_size = TermSize::new(40, 120);
        config.restart_on_exit = false;
        config.palette.red = "rgb(200, 0, 0)".into();

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "scrollback_limit = 50\n[palette]\nblue = \"#0000ff\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.scrollback_limit, 50);
        assert_eq!(config.default_size, TermSize::new(24, 80));
        assert!(config.restart_on_exit);
        assert_eq!(config.palette.blue, "#0000ff");
        assert_eq!(config.palette.red, Palette::default().red);
    }

    #[test]
    fn test_invalid_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();

        let bad_color = dir.path().join("color.toml");
        fs::write(&bad_color, "[palette]\ngreen = \"chartreuse\"\n").unwrap();
        assert!(matches!(
            Config::load_from(&bad_color),
            Err(ConfigError::InvalidColor(c)) if c == "chartreuse"
        ));

        let bad_toml = dir.path().join("syntax.toml");
        fs::write(&bad_toml, "scrollback_limit = [").unwrap();
        assert!(matches!(Config::load_from(&bad_toml), Err(ConfigError::Parse(_))));

        let missing = dir.path().join("missing.toml");
        assert!(matches!(Config::load_from(&missing), Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_session_options_follow_config() {
        let mut config = Config::default();
        config.shell = Some("/bin/sh".into());
        config.args = vec!["-i".into()];
        config.cwd = Some(PathBuf::from("/tmp"));
        config.scrollback_limit = 123;
        config.default_size = TermSize::new(30, 90);
        config.terminate_grace_ms = 250;
        config.event_queue_capacity = 0;

        let options = config.session_options();
        assert_eq!(options.spawn.program, "/bin/sh");
        assert_eq!(options.spawn.args, vec!["-i".to_string()]);
        assert_eq!(options.spawn.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(options.spawn.size, TermSize::new(30, 90));
        assert_eq!(options.scrollback_limit, 123);
        assert_eq!(options.terminate_grace, Duration::from_millis(250));
        assert_eq!(options.event_queue_capacity, 1);
        assert!(!options.newline_mode);
    }
}
