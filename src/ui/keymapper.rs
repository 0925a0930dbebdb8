//! Host key events to pty input
//!
//! Encodes crossterm key and paste events as the bytes an xterm-compatible
//! terminal would send, following the session's current terminal modes.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::core::term::TerminalModes;

bitflags! {
    /// Modifier keys as xterm encodes them
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl Modifiers {
    /// xterm modifier parameter (`1 + bits`)
    fn param(self) -> u8 {
        1 + self.bits()
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

/// Key mapper for converting host events to pty bytes
pub struct KeyMapper;

impl KeyMapper {
    /// Encode a key press. Releases and keys with no encoding give `None`.
    pub fn map(event: &KeyEvent, modes: &TerminalModes) -> Option<Vec<u8>> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let mods = Modifiers::from(event.modifiers);

        let bytes = match event.code {
            KeyCode::Char(ch) => Self::char_key(ch, mods),
            KeyCode::Enter if modes.linefeed_newline => b"\r\n".to_vec(),
            KeyCode::Enter => Self::with_alt(b"\r", mods),
            KeyCode::Backspace => Self::with_alt(b"\x7f", mods),
            KeyCode::Tab if mods.contains(Modifiers::SHIFT) => b"\x1b[Z".to_vec(),
            KeyCode::BackTab => b"\x1b[Z".to_vec(),
            KeyCode::Tab => b"\t".to_vec(),
            KeyCode::Esc => b"\x1b".to_vec(),

            KeyCode::Up => Self::cursor_key(b'A', mods, modes),
            KeyCode::Down => Self::cursor_key(b'B', mods, modes),
            KeyCode::Right => Self::cursor_key(b'C', mods, modes),
            KeyCode::Left => Self::cursor_key(b'D', mods, modes),
            KeyCode::Home => Self::cursor_key(b'H', mods, modes),
            KeyCode::End => Self::cursor_key(b'F', mods, modes),

            KeyCode::Insert => Self::tilde_key(2, mods),
            KeyCode::Delete => Self::tilde_key(3, mods),
            KeyCode::PageUp => Self::tilde_key(5, mods),
            KeyCode::PageDown => Self::tilde_key(6, mods),

            KeyCode::F(n) => Self::function_key(n, mods)?,
            _ => return None,
        };
        Some(bytes)
    }

    /// Encode pasted text, bracketing it when the program asked for that
    pub fn paste(text: &str, modes: &TerminalModes) -> Vec<u8> {
        // Host line endings become CR, as if typed
        let text = text.replace("\r\n", "\r").replace('\n', "\r");
        if !modes.bracketed_paste {
            return text.into_bytes();
        }
        // A pasted end marker would let the text escape the bracket
        let text = text.replace("\x1b[201~", "");
        let mut bytes = Vec::with_capacity(text.len() + 12);
        bytes.extend_from_slice(b"\x1b[200~");
        bytes.extend_from_slice(text.as_bytes());
        bytes.extend_from_slice(b"\x1b[201~");
        bytes
    }

    fn char_key(ch: char, mods: Modifiers) -> Vec<u8> {
        if mods.contains(Modifiers::CTRL) {
            if let Some(control) = Self::control_code(ch) {
                return Self::with_alt(&[control], mods);
            }
        }
        let mut buf = [0u8; 4];
        Self::with_alt(ch.encode_utf8(&mut buf).as_bytes(), mods)
    }

    /// C0 code produced by Ctrl plus `ch`
    fn control_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | ' ' | '2' | '`' => Some(0x00),
            '[' | '3' => Some(0x1b),
            '\\' | '4' => Some(0x1c),
            ']' | '5' => Some(0x1d),
            '^' | '~' | '6' => Some(0x1e),
            '_' | '?' | '7' => Some(0x1f),
            _ => None,
        }
    }

    /// Meta sends ESC first
    fn with_alt(bytes: &[u8], mods: Modifiers) -> Vec<u8> {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        if mods.contains(Modifiers::ALT) {
            out.push(0x1b);
        }
        out.extend_from_slice(bytes);
        out
    }

    /// Arrows, Home and End: SS3 in application cursor mode, CSI otherwise
    fn cursor_key(key: u8, mods: Modifiers, modes: &TerminalModes) -> Vec<u8> {
        if !mods.is_empty() {
            format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
        } else if modes.application_cursor {
            vec![0x1b, b'O', key]
        } else {
            vec![0x1b, b'[', key]
        }
    }

    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            format!("\x1b[{};{}~", code, mods.param()).into_bytes()
        }
    }

    fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
        let code = match n {
            1..=4 => {
                let key = b"PQRS"[usize::from(n - 1)] as char;
                return Some(if mods.is_empty() {
                    format!("\x1bO{}", key).into_bytes()
                } else {
                    format!("\x1b[1;{}{}", mods.param(), key).into_bytes()
                });
            }
            5 => 15,
            6..=10 => n + 11,
            11 | 12 => n + 12,
            _ => return None,
        };
        Some(Self::tilde_key(code, mods))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyEventState;

    fn modes() -> TerminalModes {
        TerminalModes {
            linefeed_newline: false,
            ..TerminalModes::default()
        }
    }

    fn press(code: KeyCode, mods: KeyModifiers) -> Option<Vec<u8>> {
        KeyMapper::map(&KeyEvent::new(code, mods), &modes())
    }

    #[test]
    fn test_char_keys() {
        assert_eq!(press(KeyCode::Char('a'), KeyModifiers::NONE), Some(b"a".to_vec()));
        assert_eq!(press(KeyCode::Char('c'), KeyModifiers::CONTROL), Some(vec![0x03]));
        assert_eq!(press(KeyCode::Char('x'), KeyModifiers::ALT), Some(b"\x1bx".to_vec()));
        assert_eq!(
            press(KeyCode::Char('b'), KeyModifiers::CONTROL | KeyModifiers::ALT),
            Some(vec![0x1b, 0x02])
        );
        assert_eq!(press(KeyCode::Char('['), KeyModifiers::CONTROL), Some(vec![0x1b]));
        assert_eq!(press(KeyCode::Char('é'), KeyModifiers::NONE), Some("é".as_bytes().to_vec()));
    }

    #[test]
    fn test_enter_follows_newline_mode() {
        let enter = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&enter, &modes()), Some(b"\r".to_vec()));

        let lnm = TerminalModes {
            linefeed_newline: true,
            ..modes()
        };
        assert_eq!(KeyMapper::map(&enter, &lnm), Some(b"\r\n".to_vec()));
    }

    #[test]
    fn test_cursor_keys_follow_application_mode() {
        assert_eq!(press(KeyCode::Up, KeyModifiers::NONE), Some(b"\x1b[A".to_vec()));
        assert_eq!(press(KeyCode::Up, KeyModifiers::CONTROL), Some(b"\x1b[1;5A".to_vec()));
        assert_eq!(
            press(KeyCode::Left, KeyModifiers::SHIFT | KeyModifiers::ALT),
            Some(b"\x1b[1;4D".to_vec())
        );

        let app = TerminalModes {
            application_cursor: true,
            ..modes()
        };
        let up = KeyEvent::new(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&up, &app), Some(b"\x1bOA".to_vec()));
        let home = KeyEvent::new(KeyCode::Home, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&home, &app), Some(b"\x1bOH".to_vec()));
    }

    #[test]
    fn test_editing_and_function_keys() {
        assert_eq!(press(KeyCode::Delete, KeyModifiers::NONE), Some(b"\x1b[3~".to_vec()));
        assert_eq!(press(KeyCode::PageUp, KeyModifiers::SHIFT), Some(b"\x1b[5;2~".to_vec()));
        assert_eq!(press(KeyCode::BackTab, KeyModifiers::SHIFT), Some(b"\x1b[Z".to_vec()));
        assert_eq!(press(KeyCode::F(1), KeyModifiers::NONE), Some(b"\x1bOP".to_vec()));
        assert_eq!(press(KeyCode::F(4), KeyModifiers::CONTROL), Some(b"\x1b[1;5S".to_vec()));
        assert_eq!(press(KeyCode::F(5), KeyModifiers::NONE), Some(b"\x1b[15~".to_vec()));
        assert_eq!(press(KeyCode::F(6), KeyModifiers::NONE), Some(b"\x1b[17~".to_vec()));
        assert_eq!(press(KeyCode::F(10), KeyModifiers::NONE), Some(b"\x1b[21~".to_vec()));
        assert_eq!(press(KeyCode::F(11), KeyModifiers::NONE), Some(b"\x1b[23~".to_vec()));
        assert_eq!(press(KeyCode::F(12), KeyModifiers::ALT), Some(b"\x1b[24;3~".to_vec()));
        assert_eq!(press(KeyCode::F(13), KeyModifiers::NONE), None);
    }

    #[test]
    fn test_release_events_are_ignored() {
        let release = KeyEvent {
            code: KeyCode::Char('a'),
            modifiers: KeyModifiers::NONE,
            kind: KeyEventKind::Release,
            state: KeyEventState::NONE,
        };
        assert_eq!(KeyMapper::map(&release, &modes()), None);
    }

    #[test]
    fn test_paste() {
        assert_eq!(KeyMapper::paste("a\nb\r\nc", &modes()), b"a\rb\rc".to_vec());

        let bracketed = TerminalModes {
            bracketed_paste: true,
            ..modes()
        };
        assert_eq!(
            KeyMapper::paste("x\x1b[201~y", &bracketed),
            b"\x1b[200~xy\x1b[201~".to_vec()
        );
    }
}
