//! VT sequence parser
//!
//! Parses ANSI/VT escape sequences and updates terminal state. CSI and ESC
//! sequences are dispatched through lookup tables keyed on their private
//! marker, intermediate and final bytes; anything without an entry is
//! consumed and dropped.

use super::state::{AttrFlags, Color, CursorShape, TerminalState};

const MAX_PARAMS: usize = 16;
const MAX_OSC_LEN: usize = 4096;

/// Response that needs to be sent back to the PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Operating status report: ESC [ 0 n
    OperatingStatus,
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::OperatingStatus => b"\x1b[0n".to_vec(),
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            // VT220 with ANSI colour
            Response::DeviceAttributes => b"\x1b[?62;22c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>1;10;0c".to_vec(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    /// Malformed CSI, swallowed up to its final byte
    CsiIgnore,
    OscString,
    /// ESC received within OSC, waiting for backslash
    OscEscape,
    /// DCS/SOS/PM/APC payloads are not interpreted
    IgnoredString,
    IgnoredStringEscape,
}

/// Actions reachable from a CSI sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CsiAction {
    CursorUp,
    CursorDown,
    CursorForward,
    CursorBackward,
    CursorNextLine,
    CursorPrevLine,
    CursorColumn,
    CursorPosition,
    LinePosition,
    TabForward,
    TabBackward,
    EraseInDisplay,
    EraseInLine,
    InsertLines,
    DeleteLines,
    InsertChars,
    DeleteChars,
    EraseChars,
    ScrollUp,
    ScrollDown,
    SetScrollRegion,
    Sgr,
    SaveCursor,
    RestoreCursor,
    DeviceStatus,
    DeviceAttributes,
    SecondaryDeviceAttributes,
    SetMode,
    ResetMode,
    SetPrivateMode,
    ResetPrivateMode,
    CursorStyle,
}

/// (private marker, intermediate, final) -> action
fn csi_action(marker: Option<u8>, intermediate: Option<u8>, final_byte: u8) -> Option<CsiAction> {
    use CsiAction::*;

    let action = match (marker, intermediate, final_byte) {
        (None, None, b'A') => CursorUp,
        (None, None, b'B' | b'e') => CursorDown,
        (None, None, b'C' | b'a') => CursorForward,
        (None, None, b'D') => CursorBackward,
        (None, None, b'E') => CursorNextLine,
        (None, None, b'F') => CursorPrevLine,
        (None, None, b'G' | b'`') => CursorColumn,
        (None, None, b'H' | b'f') => CursorPosition,
        (None, None, b'd') => LinePosition,
        (None, None, b'I') => TabForward,
        (None, None, b'Z') => TabBackward,
        (None, None, b'J') => EraseInDisplay,
        (None, None, b'K') => EraseInLine,
        (None, None, b'L') => InsertLines,
        (None, None, b'M') => DeleteLines,
        (None, None, b'@') => InsertChars,
        (None, None, b'P') => DeleteChars,
        (None, None, b'X') => EraseChars,
        (None, None, b'S') => ScrollUp,
        (None, None, b'T') => ScrollDown,
        (None, None, b'r') => SetScrollRegion,
        (None, None, b'm') => Sgr,
        (None, None, b's') => SaveCursor,
        (None, None, b'u') => RestoreCursor,
        (None, None, b'n') => DeviceStatus,
        (None, None, b'c') => DeviceAttributes,
        (Some(b'>'), None, b'c') => SecondaryDeviceAttributes,
        (None, None, b'h') => SetMode,
        (None, None, b'l') => ResetMode,
        (Some(b'?'), None, b'h') => SetPrivateMode,
        (Some(b'?'), None, b'l') => ResetPrivateMode,
        (None, Some(b' '), b'q') => CursorStyle,
        _ => return None,
    };
    Some(action)
}

/// Actions reachable from a two-byte ESC sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EscAction {
    SaveCursor,
    RestoreCursor,
    Index,
    NextLine,
    ReverseIndex,
    FullReset,
    /// Charset designation and similar sequences with no visible effect
    Ignore,
}

fn esc_action(intermediate: Option<u8>, final_byte: u8) -> Option<EscAction> {
    use EscAction::*;

    let action = match (intermediate, final_byte) {
        (None, b'7') => SaveCursor,
        (None, b'8') => RestoreCursor,
        (None, b'D') => Index,
        (None, b'E') => NextLine,
        (None, b'M') => ReverseIndex,
        (None, b'c') => FullReset,
        (None, b'=' | b'>') => Ignore, // keypad modes
        (Some(b'(' | b')' | b'*' | b'+'), _) => Ignore,
        (Some(b'#'), b'8') => Ignore, // DECALN
        _ => return None,
    };
    Some(action)
}

/// Parser state machine
#[derive(Default)]
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    /// Parallel to `params`: true when the parameter followed a ':'
    subparams: Vec<bool>,
    current_param: Option<u16>,
    next_is_subparam: bool,
    marker: Option<u8>,
    intermediate: Option<u8>,
    /// Set when a sequence has more intermediates than we can dispatch on
    overflow: bool,
    osc: Vec<u8>,
    utf8: Utf8Decoder,
}

impl VtParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single byte to the parser
    pub fn advance(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match self.state {
            ParserState::OscString => return self.osc_string(byte, state),
            ParserState::OscEscape => return self.osc_escape(byte, state),
            ParserState::IgnoredString => {
                if byte == 0x1B {
                    self.state = ParserState::IgnoredStringEscape;
                } else if byte == 0x07 {
                    self.state = ParserState::Ground;
                }
                return None;
            }
            ParserState::IgnoredStringEscape => {
                self.state = if byte == b'\\' {
                    ParserState::Ground
                } else {
                    ParserState::IgnoredString
                };
                return None;
            }
            _ => {}
        }

        // C0 controls are executed from any state, even mid-sequence
        if byte < 0x20 || byte == 0x7F {
            self.flush_utf8(state);
            return self.control(byte, state);
        }

        match self.state {
            ParserState::Ground => {
                self.ground(byte, state);
                None
            }
            ParserState::Escape => {
                self.escape(byte, state);
                None
            }
            ParserState::EscapeIntermediate => {
                self.escape_intermediate(byte, state);
                None
            }
            ParserState::CsiEntry => self.csi_entry(byte, state),
            ParserState::CsiParam => self.csi_param(byte, state),
            ParserState::CsiIntermediate => self.csi_intermediate(byte, state),
            ParserState::CsiIgnore => {
                if (0x40..=0x7E).contains(&byte) {
                    tracing::trace!(final_byte = byte, "Discarded malformed CSI");
                    self.state = ParserState::Ground;
                }
                None
            }
            _ => None,
        }
    }

    fn control(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match byte {
            0x1B => self.enter_escape(),
            // CAN and SUB abort any sequence in progress
            0x18 | 0x1A => self.state = ParserState::Ground,
            0x07 => {} // BEL
            0x08 => state.backspace(),
            0x09 => state.horizontal_tab(1),
            0x0A..=0x0C => state.linefeed(),
            0x0D => state.carriage_return(),
            _ => {}
        }
        None
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.params.clear();
        self.subparams.clear();
        self.current_param = None;
        self.next_is_subparam = false;
        self.marker = None;
        self.intermediate = None;
        self.overflow = false;
    }

    fn ground(&mut self, byte: u8, state: &mut TerminalState) {
        if byte < 0x80 {
            self.flush_utf8(state);
            state.put_char(byte as char);
            return;
        }
        for ch in self.utf8.push(byte) {
            state.put_char(ch);
        }
    }

    /// Emit a replacement for a UTF-8 sequence cut short by a control byte
    fn flush_utf8(&mut self, state: &mut TerminalState) {
        if self.utf8.pending() {
            self.utf8.reset();
            state.put_char(char::REPLACEMENT_CHARACTER);
        }
    }

    fn escape(&mut self, byte: u8, state: &mut TerminalState) {
        match byte {
            b'[' => self.state = ParserState::CsiEntry,
            b']' => {
                self.osc.clear();
                self.state = ParserState::OscString;
            }
            b'P' | b'X' | b'^' | b'_' => self.state = ParserState::IgnoredString,
            0x20..=0x2F => {
                self.intermediate = Some(byte);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => self.execute_esc(byte, state),
        }
    }

    fn escape_intermediate(&mut self, byte: u8, state: &mut TerminalState) {
        match byte {
            0x20..=0x2F => self.overflow = true,
            _ => self.execute_esc(byte, state),
        }
    }

    fn execute_esc(&mut self, final_byte: u8, state: &mut TerminalState) {
        self.state = ParserState::Ground;
        let action = if self.overflow {
            None
        } else {
            esc_action(self.intermediate, final_byte)
        };

        match action {
            Some(EscAction::SaveCursor) => state.save_cursor(),
            Some(EscAction::RestoreCursor) => state.restore_cursor(),
            Some(EscAction::Index) => state.index(),
            Some(EscAction::NextLine) => {
                state.carriage_return();
                state.index();
            }
            Some(EscAction::ReverseIndex) => state.reverse_index(),
            Some(EscAction::FullReset) => state.reset(),
            Some(EscAction::Ignore) => {}
            None => tracing::debug!(
                intermediate = ?self.intermediate.map(char::from),
                final_byte = ?char::from(final_byte),
                "Unknown ESC sequence"
            ),
        }
    }

    fn csi_entry(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match byte {
            b'<'..=b'?' => {
                self.marker = Some(byte);
                self.state = ParserState::CsiParam;
                None
            }
            _ => {
                self.state = ParserState::CsiParam;
                self.csi_param(byte, state)
            }
        }
    }

    fn csi_param(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match byte {
            b'0'..=b'9' => {
                let digit = (byte - b'0') as u16;
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit),
                );
            }
            b';' => {
                self.push_param();
                self.next_is_subparam = false;
            }
            b':' => {
                self.push_param();
                self.next_is_subparam = true;
            }
            // A private marker after parameters is malformed
            b'<'..=b'?' => self.state = ParserState::CsiIgnore,
            0x20..=0x2F => {
                self.finish_params();
                self.intermediate = Some(byte);
                self.state = ParserState::CsiIntermediate;
            }
            0x40..=0x7E => {
                self.finish_params();
                return self.execute_csi(byte, state);
            }
            _ => self.state = ParserState::CsiIgnore,
        }
        None
    }

    fn csi_intermediate(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match byte {
            0x20..=0x2F => self.overflow = true,
            0x40..=0x7E => return self.execute_csi(byte, state),
            _ => self.state = ParserState::CsiIgnore,
        }
        None
    }

    fn push_param(&mut self) {
        let value = self.current_param.take().unwrap_or(0);
        if self.params.len() < MAX_PARAMS {
            self.params.push(value);
            self.subparams.push(self.next_is_subparam);
        }
    }

    fn finish_params(&mut self) {
        if self.current_param.is_some() || !self.params.is_empty() {
            self.push_param();
        }
    }

    /// Parameter at `index`, `default` when absent
    fn param(&self, index: usize, default: u16) -> u16 {
        self.params.get(index).copied().unwrap_or(default)
    }

    /// Count parameter: absent or zero means one
    fn count(&self, index: usize) -> u16 {
        self.param(index, 1).max(1)
    }

    fn execute_csi(&mut self, final_byte: u8, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;
        let action = if self.overflow {
            None
        } else {
            csi_action(self.marker, self.intermediate, final_byte)
        };

        let Some(action) = action else {
            tracing::debug!(
                marker = ?self.marker.map(char::from),
                intermediate = ?self.intermediate.map(char::from),
                params = ?self.params,
                final_byte = ?char::from(final_byte),
                "Unknown CSI sequence"
            );
            return None;
        };

        match action {
            CsiAction::CursorUp => state.cursor_up(self.count(0)),
            CsiAction::CursorDown => state.cursor_down(self.count(0)),
            CsiAction::CursorForward => state.cursor_forward(self.count(0)),
            CsiAction::CursorBackward => state.cursor_backward(self.count(0)),
            CsiAction::CursorNextLine => {
                state.cursor_down(self.count(0));
                state.carriage_return();
            }
            CsiAction::CursorPrevLine => {
                state.cursor_up(self.count(0));
                state.carriage_return();
            }
            CsiAction::CursorColumn => state.set_cursor_col(self.count(0)),
            CsiAction::CursorPosition => state.move_cursor_to(self.count(0), self.count(1)),
            CsiAction::LinePosition => state.set_cursor_row(self.count(0)),
            CsiAction::TabForward => state.horizontal_tab(self.count(0)),
            CsiAction::TabBackward => state.backward_tab(self.count(0)),
            CsiAction::EraseInDisplay => state.erase_in_display(self.param(0, 0)),
            CsiAction::EraseInLine => state.erase_in_line(self.param(0, 0)),
            CsiAction::InsertLines => state.insert_lines(self.count(0)),
            CsiAction::DeleteLines => state.delete_lines(self.count(0)),
            CsiAction::InsertChars => state.insert_chars(self.count(0)),
            CsiAction::DeleteChars => state.delete_chars(self.count(0)),
            CsiAction::EraseChars => state.erase_chars(self.count(0)),
            CsiAction::ScrollUp => state.scroll_up(self.count(0)),
            CsiAction::ScrollDown => state.scroll_down(self.count(0)),
            CsiAction::SetScrollRegion => state.set_scroll_region(self.param(0, 1), self.param(1, 0)),
            CsiAction::Sgr => self.execute_sgr(state),
            CsiAction::SaveCursor => state.save_cursor(),
            CsiAction::RestoreCursor => state.restore_cursor(),
            CsiAction::DeviceStatus => {
                return match self.param(0, 0) {
                    5 => Some(Response::OperatingStatus),
                    6 => {
                        let (row, col) = state.cursor_position();
                        Some(Response::CursorPosition(row + 1, col + 1))
                    }
                    _ => None,
                };
            }
            CsiAction::DeviceAttributes => {
                if self.param(0, 0) == 0 {
                    return Some(Response::DeviceAttributes);
                }
            }
            CsiAction::SecondaryDeviceAttributes => {
                if self.param(0, 0) == 0 {
                    return Some(Response::SecondaryDeviceAttributes);
                }
            }
            CsiAction::SetMode | CsiAction::ResetMode => {
                let enable = action == CsiAction::SetMode;
                for &mode in &self.params {
                    state.set_mode(mode, enable);
                }
            }
            CsiAction::SetPrivateMode | CsiAction::ResetPrivateMode => {
                let enable = action == CsiAction::SetPrivateMode;
                for &mode in &self.params {
                    state.set_private_mode(mode, enable);
                }
            }
            CsiAction::CursorStyle => {
                state.active_cursor_mut().shape = CursorShape::from_decscusr(self.param(0, 0));
            }
        }
        None
    }

    fn execute_sgr(&self, state: &mut TerminalState) {
        if self.params.is_empty() {
            state.current_attrs.reset();
            return;
        }

        let attrs = &mut state.current_attrs;
        let mut i = 0;
        while i < self.params.len() {
            let param = self.params[i];
            // Colon-joined subparameters belonging to this parameter
            let mut end = i + 1;
            while end < self.params.len() && self.subparams[end] {
                end += 1;
            }
            let group = &self.params[i + 1..end];

            match param {
                0 => attrs.reset(),
                1 => attrs.flags |= AttrFlags::BOLD,
                2 => attrs.flags |= AttrFlags::DIM,
                3 => attrs.flags |= AttrFlags::ITALIC,
                4 => match group.first() {
                    Some(0) => attrs.flags &= !AttrFlags::UNDERLINE,
                    _ => attrs.flags |= AttrFlags::UNDERLINE,
                },
                5 | 6 => attrs.flags |= AttrFlags::BLINK,
                7 => attrs.flags |= AttrFlags::INVERSE,
                8 => attrs.flags |= AttrFlags::HIDDEN,
                9 => attrs.flags |= AttrFlags::STRIKETHROUGH,

                21 => attrs.flags |= AttrFlags::UNDERLINE,
                22 => attrs.flags &= !(AttrFlags::BOLD | AttrFlags::DIM),
                23 => attrs.flags &= !AttrFlags::ITALIC,
                24 => attrs.flags &= !AttrFlags::UNDERLINE,
                25 => attrs.flags &= !AttrFlags::BLINK,
                27 => attrs.flags &= !AttrFlags::INVERSE,
                28 => attrs.flags &= !AttrFlags::HIDDEN,
                29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,

                30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
                39 => attrs.fg = Color::Default,
                40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
                49 => attrs.bg = Color::Default,
                90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),

                38 | 48 => {
                    let (color, consumed) = if group.is_empty() {
                        extended_color(&self.params[i + 1..], false)
                    } else {
                        (extended_color(group, true).0, group.len())
                    };
                    if let Some(color) = color {
                        if param == 38 {
                            attrs.fg = color;
                        } else {
                            attrs.bg = color;
                        }
                    }
                    i += 1 + consumed;
                    continue;
                }

                _ => tracing::trace!(param, "Ignoring unsupported SGR parameter"),
            }
            i = end;
        }
    }

    fn osc_string(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        match byte {
            0x07 => {
                self.execute_osc(state);
                self.state = ParserState::Ground;
            }
            0x1B => self.state = ParserState::OscEscape,
            0x18 | 0x1A => self.state = ParserState::Ground,
            _ => {
                if self.osc.len() < MAX_OSC_LEN {
                    self.osc.push(byte);
                }
            }
        }
        None
    }

    fn osc_escape(&mut self, byte: u8, state: &mut TerminalState) -> Option<Response> {
        self.execute_osc(state);
        if byte == b'\\' {
            self.state = ParserState::Ground;
            None
        } else {
            // Not ST: the ESC starts a new sequence
            self.enter_escape();
            self.advance(byte, state)
        }
    }

    fn execute_osc(&mut self, state: &mut TerminalState) {
        let payload = String::from_utf8_lossy(&self.osc).into_owned();
        let (code, text) = payload.split_once(';').unwrap_or((payload.as_str(), ""));

        match code {
            "0" | "1" | "2" => {
                let title: String = text.chars().filter(|c| !c.is_control()).collect();
                if title != state.title {
                    state.set_title(title);
                }
            }
            _ => tracing::debug!(code, "Ignoring unsupported OSC"),
        }
    }
}

/// Decode the colour following SGR 38/48.
///
/// Returns the colour and how many parameters it used. Colon-separated
/// truecolor may carry a colour-space id before the components.
fn extended_color(params: &[u16], colon_form: bool) -> (Option<Color>, usize) {
    match params.first() {
        Some(5) => match params.get(1) {
            Some(&n) => (Some(Color::Indexed(n.min(255) as u8)), 2),
            None => (None, params.len()),
        },
        Some(2) => {
            let components = if colon_form && params.len() >= 5 {
                &params[2..5]
            } else {
                &params[1..params.len().min(4)]
            };
            match components {
                [r, g, b] => (
                    Some(Color::Rgb(
                        (*r).min(255) as u8,
                        (*g).min(255) as u8,
                        (*b).min(255) as u8,
                    )),
                    4,
                ),
                _ => (None, params.len()),
            }
        }
        Some(_) => (None, 1),
        None => (None, 0),
    }
}

/// Incremental UTF-8 decoder that survives chunk boundaries
#[derive(Default)]
struct Utf8Decoder {
    buf: [u8; 4],
    len: usize,
    need: usize,
}

impl Utf8Decoder {
    fn pending(&self) -> bool {
        self.len > 0
    }

    fn reset(&mut self) {
        self.len = 0;
        self.need = 0;
    }

    /// Push one byte (>= 0x80); yields up to two characters
    fn push(&mut self, byte: u8) -> impl Iterator<Item = char> {
        let mut out = [None, None];

        if self.len == 0 {
            self.start(byte, &mut out[0]);
        } else if byte & 0xC0 == 0x80 {
            self.buf[self.len] = byte;
            self.len += 1;
            if self.len == self.need {
                out[0] = Some(
                    std::str::from_utf8(&self.buf[..self.len])
                        .ok()
                        .and_then(|s| s.chars().next())
                        .unwrap_or(char::REPLACEMENT_CHARACTER),
                );
                self.reset();
            }
        } else {
            // Interrupted sequence: replace it, then restart with this byte
            out[0] = Some(char::REPLACEMENT_CHARACTER);
            self.reset();
            self.start(byte, &mut out[1]);
        }

        out.into_iter().flatten()
    }

    fn start(&mut self, byte: u8, out: &mut Option<char>) {
        let need = match byte {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => {
                *out = Some(char::REPLACEMENT_CHARACTER);
                return;
            }
        };
        self.buf[0] = byte;
        self.len = 1;
        self.need = need;
    }
}
