//! Terminal state management
//!
//! This module defines the terminal's screen buffers, cursor state and cell
//! attributes, plus the byte-stream entry point ([`TerminalState::feed`])
//! that drives the VT parser over them.

use std::collections::{BTreeSet, VecDeque};

use bitflags::bitflags;
use unicode_width::UnicodeWidthChar;

use super::parser::{Response, VtParser};

/// Default number of rows retained in scrollback
pub const DEFAULT_SCROLLBACK_LIMIT: usize = 10_000;

const TAB_WIDTH: u16 = 8;

/// Terminal state holding all screen data
pub struct TerminalState {
    pub cols: u16,
    pub rows: u16,
    pub primary_screen: ScreenBuffer,
    pub alternate_screen: ScreenBuffer,
    pub using_alternate: bool,
    pub primary_cursor: CursorState,
    pub alternate_cursor: CursorState,
    pub current_attrs: CellAttrs,
    pub modes: TerminalModes,
    pub title: String,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    pub scroll_region: (u16, u16),
    /// Modes restored by a full reset (RIS)
    default_modes: TerminalModes,
    title_changed: bool,
    parser: VtParser,
}

impl TerminalState {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK_LIMIT)
    }

    /// Create a terminal whose primary screen keeps at most `scrollback_limit` rows of history
    pub fn with_scrollback(cols: u16, rows: u16, scrollback_limit: usize) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            primary_screen: ScreenBuffer::new(cols, rows, scrollback_limit),
            alternate_screen: ScreenBuffer::new(cols, rows, 0),
            using_alternate: false,
            primary_cursor: CursorState::default(),
            alternate_cursor: CursorState::default(),
            current_attrs: CellAttrs::default(),
            modes: TerminalModes::default(),
            title: String::new(),
            scroll_region: (0, rows - 1),
            default_modes: TerminalModes::default(),
            title_changed: false,
            parser: VtParser::new(),
        }
    }

    /// Choose whether LF also returns the carriage (LNM).
    ///
    /// The choice survives a full reset.
    pub fn set_newline_mode(&mut self, enabled: bool) {
        self.modes.linefeed_newline = enabled;
        self.default_modes.linefeed_newline = enabled;
    }

    /// Interpret a chunk of raw pty output.
    ///
    /// Parser state carries over between calls, so escape sequences and
    /// UTF-8 characters may be split across chunks. Returns the replies the
    /// stream asked for (device status, device attributes), in order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Response> {
        let mut parser = std::mem::take(&mut self.parser);
        let mut responses = Vec::new();
        for &byte in bytes {
            if let Some(response) = parser.advance(byte, self) {
                responses.push(response);
            }
        }
        self.parser = parser;
        responses
    }

    pub fn active_screen(&self) -> &ScreenBuffer {
        if self.using_alternate {
            &self.alternate_screen
        } else {
            &self.primary_screen
        }
    }

    pub fn active_screen_mut(&mut self) -> &mut ScreenBuffer {
        if self.using_alternate {
            &mut self.alternate_screen
        } else {
            &mut self.primary_screen
        }
    }

    pub fn active_cursor(&self) -> &CursorState {
        if self.using_alternate {
            &self.alternate_cursor
        } else {
            &self.primary_cursor
        }
    }

    pub fn active_cursor_mut(&mut self) -> &mut CursorState {
        if self.using_alternate {
            &mut self.alternate_cursor
        } else {
            &mut self.primary_cursor
        }
    }

    /// Current cursor position as (row, col)
    pub fn cursor_position(&self) -> (u16, u16) {
        let cursor = self.active_cursor();
        (cursor.row, cursor.col)
    }

    /// Full reset (RIS). Scrollback is kept.
    pub fn reset(&mut self) {
        let (cols, rows) = (self.cols, self.rows);
        self.primary_screen.rows = (0..rows).map(|_| Row::new(cols)).collect();
        self.alternate_screen = ScreenBuffer::new(cols, rows, 0);
        self.using_alternate = false;
        self.primary_cursor = CursorState::default();
        self.alternate_cursor = CursorState::default();
        self.current_attrs = CellAttrs::default();
        self.modes = self.default_modes.clone();
        self.scroll_region = (0, rows - 1);
        if !self.title.is_empty() {
            self.set_title(String::new());
        }
        self.primary_screen.mark_all_dirty();
    }

    /// Resize the terminal
    ///
    /// Cells keep their coordinates where those remain valid. When rows
    /// shrink, blank rows below the cursor are dropped first and any
    /// remaining excess moves from the top into scrollback.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        if cols == self.cols && rows == self.rows {
            return;
        }

        resize_screen(&mut self.primary_screen, &mut self.primary_cursor, cols, rows, true);
        resize_screen(&mut self.alternate_screen, &mut self.alternate_cursor, cols, rows, false);

        self.cols = cols;
        self.rows = rows;
        self.scroll_region = (0, rows - 1);

        for cursor in [&mut self.primary_cursor, &mut self.alternate_cursor] {
            cursor.col = cursor.col.min(cols - 1);
            cursor.row = cursor.row.min(rows - 1);
            if let Some(saved) = cursor.saved.as_mut() {
                saved.col = saved.col.min(cols - 1);
                saved.row = saved.row.min(rows - 1);
            }
        }
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        let width = match ch.width() {
            Some(0) | None => return,
            Some(w) => (w as u16).min(self.cols),
        };

        // A wide character that doesn't fit in the remaining columns wraps first
        let (_, col) = self.cursor_position();
        if col + width > self.cols {
            if self.modes.auto_wrap {
                self.wrap_line();
            } else {
                self.active_cursor_mut().col = self.cols - width;
            }
        }

        if self.modes.insert_mode {
            self.insert_chars(width);
        }

        let (row, col) = self.cursor_position();
        let (row, col) = (row as usize, col as usize);
        self.handle_wide_char_overwrite(row, col);

        let attrs = self.current_attrs;
        let screen = self.active_screen_mut();
        screen.rows[row].cells[col] = Cell {
            ch,
            width: width as u8,
            attrs,
        };
        if width == 2 {
            screen.rows[row].cells[col + 1] = Cell::continuation(attrs);
        }
        screen.mark_dirty(row as u16);

        let next = col as u16 + width;
        if next >= self.cols {
            if self.modes.auto_wrap {
                self.wrap_line();
            } else {
                self.active_cursor_mut().col = self.cols - 1;
            }
        } else {
            self.active_cursor_mut().col = next;
        }
    }

    /// Mark the cursor row as soft-wrapped and continue on the next line
    fn wrap_line(&mut self) {
        let row = self.active_cursor().row as usize;
        self.active_screen_mut().rows[row].wrapped = true;
        self.active_cursor_mut().col = 0;
        self.index();
    }

    fn handle_wide_char_overwrite(&mut self, row: usize, col: usize) {
        let blank = Cell::blank(self.current_attrs);
        let cols = self.cols as usize;
        let cells = &mut self.active_screen_mut().rows[row].cells;

        // Overwriting the right half of a wide char
        if col > 0 && cells[col].is_continuation() {
            cells[col - 1] = blank;
        }
        // Overwriting the left half of a wide char
        if cells[col].width == 2 && col + 1 < cols {
            cells[col + 1] = blank;
        }
    }

    /// Carriage return - move cursor to column 0
    pub fn carriage_return(&mut self) {
        self.active_cursor_mut().col = 0;
    }

    /// Line feed, honouring LNM
    pub fn linefeed(&mut self) {
        if self.modes.linefeed_newline {
            self.carriage_return();
        }
        self.index();
    }

    /// Index - cursor down, scroll if at the bottom margin
    pub fn index(&mut self) {
        let cursor_row = self.active_cursor().row;
        let scroll_bottom = self.scroll_region.1;

        if cursor_row == scroll_bottom {
            self.scroll_up(1);
        } else if cursor_row < self.rows - 1 {
            self.active_cursor_mut().row += 1;
        }
    }

    /// Reverse index - cursor up, scroll if at the top margin
    pub fn reverse_index(&mut self) {
        let cursor_row = self.active_cursor().row;
        let scroll_top = self.scroll_region.0;

        if cursor_row == scroll_top {
            self.scroll_down(1);
        } else if cursor_row > 0 {
            self.active_cursor_mut().row -= 1;
        }
    }

    /// Backspace - move cursor left
    pub fn backspace(&mut self) {
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_sub(1);
    }

    /// Horizontal tab (every 8 columns)
    pub fn horizontal_tab(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        let target = (u32::from(cursor.col / TAB_WIDTH) + u32::from(n.max(1))) * u32::from(TAB_WIDTH);
        cursor.col = target.min(u32::from(cols - 1)) as u16;
    }

    /// Backward tab (CBT)
    pub fn backward_tab(&mut self, n: u16) {
        let cursor = self.active_cursor_mut();
        for _ in 0..n {
            if cursor.col == 0 {
                break;
            }
            cursor.col = ((cursor.col - 1) / TAB_WIDTH) * TAB_WIDTH;
        }
    }

    /// Scroll the scroll region up by n lines
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let n = n.min(bottom - top + 1);
        let cols = self.cols;
        let blank = self.blank_attrs();
        let keep_history = !self.using_alternate && top == 0;

        let screen = self.active_screen_mut();
        for _ in 0..n {
            let removed = screen.rows.remove(top as usize);
            if keep_history {
                screen.push_to_scrollback(removed);
            }
            screen.rows.insert(bottom as usize, Row::filled(cols, blank));
        }
        screen.mark_range(top, bottom);
    }

    /// Scroll the scroll region down by n lines
    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let n = n.min(bottom - top + 1);
        let cols = self.cols;
        let blank = self.blank_attrs();

        let screen = self.active_screen_mut();
        for _ in 0..n {
            screen.rows.remove(bottom as usize);
            screen.rows.insert(top as usize, Row::filled(cols, blank));
        }
        screen.mark_range(top, bottom);
    }

    /// Cursor up, stopping at the top margin when inside the scroll region
    pub fn cursor_up(&mut self, n: u16) {
        let top = self.scroll_region.0;
        let cursor = self.active_cursor_mut();
        let limit = if cursor.row >= top { top } else { 0 };
        cursor.row = cursor.row.saturating_sub(n).max(limit);
    }

    /// Cursor down, stopping at the bottom margin when inside the scroll region
    pub fn cursor_down(&mut self, n: u16) {
        let bottom = self.scroll_region.1;
        let last = self.rows - 1;
        let cursor = self.active_cursor_mut();
        let limit = if cursor.row <= bottom { bottom } else { last };
        cursor.row = cursor.row.saturating_add(n).min(limit);
    }

    /// Cursor forward (right)
    pub fn cursor_forward(&mut self, n: u16) {
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_add(n).min(cols - 1);
    }

    /// Cursor backward (left)
    pub fn cursor_backward(&mut self, n: u16) {
        let cursor = self.active_cursor_mut();
        cursor.col = cursor.col.saturating_sub(n);
    }

    /// Set cursor position (1-indexed parameters, origin mode aware)
    pub fn move_cursor_to(&mut self, row: u16, col: u16) {
        let (top, bottom) = if self.modes.origin_mode {
            self.scroll_region
        } else {
            (0, self.rows - 1)
        };
        let cols = self.cols;
        let cursor = self.active_cursor_mut();
        cursor.row = top.saturating_add(row.saturating_sub(1)).min(bottom);
        cursor.col = col.saturating_sub(1).min(cols - 1);
    }

    /// Cursor Character Absolute (1-indexed)
    pub fn set_cursor_col(&mut self, col: u16) {
        let cols = self.cols;
        self.active_cursor_mut().col = col.saturating_sub(1).min(cols - 1);
    }

    /// Line Position Absolute (1-indexed)
    pub fn set_cursor_row(&mut self, row: u16) {
        let col = self.active_cursor().col + 1;
        self.move_cursor_to(row, col);
    }

    /// Erase in display
    pub fn erase_in_display(&mut self, mode: u16) {
        let cursor_row = self.active_cursor().row;
        let rows = self.rows;
        let blank = self.blank_attrs();

        match mode {
            0 => {
                self.erase_in_line(0);
                let screen = self.active_screen_mut();
                for r in (cursor_row + 1)..rows {
                    screen.rows[r as usize].clear(blank);
                    screen.mark_dirty(r);
                }
            }
            1 => {
                let screen = self.active_screen_mut();
                for r in 0..cursor_row {
                    screen.rows[r as usize].clear(blank);
                    screen.mark_dirty(r);
                }
                self.erase_in_line(1);
            }
            2 => {
                let screen = self.active_screen_mut();
                for row in &mut screen.rows {
                    row.clear(blank);
                }
                screen.mark_all_dirty();
            }
            3 => {
                // Only the primary screen keeps history
                self.primary_screen.scrollback.clear();
            }
            _ => tracing::debug!(mode, "Unsupported erase-in-display mode"),
        }
    }

    /// Erase in line
    pub fn erase_in_line(&mut self, mode: u16) {
        let (row, col) = self.cursor_position();
        let cols = self.cols as usize;
        let blank = Cell::blank(self.blank_attrs());

        let screen = self.active_screen_mut();
        let line = &mut screen.rows[row as usize];
        let range = match mode {
            0 => col as usize..cols,
            1 => 0..col as usize + 1,
            2 => 0..cols,
            _ => {
                tracing::debug!(mode, "Unsupported erase-in-line mode");
                return;
            }
        };
        for cell in &mut line.cells[range] {
            *cell = blank;
        }
        if mode != 1 {
            line.wrapped = false;
        }
        screen.mark_dirty(row);
    }

    /// Insert blank lines at the cursor row (IL)
    pub fn insert_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let cursor_row = self.active_cursor().row;
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        let n = n.min(bottom - cursor_row + 1);
        let cols = self.cols;
        let blank = self.blank_attrs();

        let screen = self.active_screen_mut();
        for _ in 0..n {
            screen.rows.remove(bottom as usize);
            screen.rows.insert(cursor_row as usize, Row::filled(cols, blank));
        }
        screen.mark_range(cursor_row, bottom);
        self.carriage_return();
    }

    /// Delete lines at the cursor row (DL)
    pub fn delete_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let cursor_row = self.active_cursor().row;
        if cursor_row < top || cursor_row > bottom {
            return;
        }
        let n = n.min(bottom - cursor_row + 1);
        let cols = self.cols;
        let blank = self.blank_attrs();

        let screen = self.active_screen_mut();
        for _ in 0..n {
            screen.rows.remove(cursor_row as usize);
            screen.rows.insert(bottom as usize, Row::filled(cols, blank));
        }
        screen.mark_range(cursor_row, bottom);
        self.carriage_return();
    }

    /// Insert blank characters at the cursor, shifting the rest right (ICH)
    pub fn insert_chars(&mut self, n: u16) {
        let (row, col) = self.cursor_position();
        let blank = Cell::blank(self.blank_attrs());
        let screen = self.active_screen_mut();
        let cells = &mut screen.rows[row as usize].cells;
        let n = (n as usize).min(cells.len() - col as usize);
        for _ in 0..n {
            cells.pop();
            cells.insert(col as usize, blank);
        }
        screen.mark_dirty(row);
    }

    /// Delete characters at the cursor, shifting the rest left (DCH)
    pub fn delete_chars(&mut self, n: u16) {
        let (row, col) = self.cursor_position();
        let blank = Cell::blank(self.blank_attrs());
        let screen = self.active_screen_mut();
        let cells = &mut screen.rows[row as usize].cells;
        let n = (n as usize).min(cells.len() - col as usize);
        for _ in 0..n {
            cells.remove(col as usize);
            cells.push(blank);
        }
        screen.mark_dirty(row);
    }

    /// Erase characters from the cursor without shifting (ECH)
    pub fn erase_chars(&mut self, n: u16) {
        let (row, col) = self.cursor_position();
        let blank = Cell::blank(self.blank_attrs());
        let screen = self.active_screen_mut();
        let cells = &mut screen.rows[row as usize].cells;
        let end = (col as usize + n as usize).min(cells.len());
        for cell in &mut cells[col as usize..end] {
            *cell = blank;
        }
        screen.mark_dirty(row);
    }

    /// Set scroll region (1-indexed, 0 = default)
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let rows = self.rows;
        let top = top.max(1) - 1;
        let bottom = if bottom == 0 { rows } else { bottom.min(rows) } - 1;
        if top < bottom {
            self.scroll_region = (top, bottom);
            self.move_cursor_to(1, 1);
        }
    }

    /// Save cursor position and attributes
    pub fn save_cursor(&mut self) {
        let (row, col) = self.cursor_position();
        let attrs = self.current_attrs;
        let origin_mode = self.modes.origin_mode;
        self.active_cursor_mut().saved = Some(SavedCursor {
            col,
            row,
            attrs,
            origin_mode,
        });
    }

    /// Restore cursor position and attributes
    pub fn restore_cursor(&mut self) {
        let saved = self.active_cursor().saved.clone();
        match saved {
            Some(saved) => {
                let (rows, cols) = (self.rows, self.cols);
                let cursor = self.active_cursor_mut();
                cursor.col = saved.col.min(cols - 1);
                cursor.row = saved.row.min(rows - 1);
                self.current_attrs = saved.attrs;
                self.modes.origin_mode = saved.origin_mode;
            }
            None => {
                self.move_cursor_to(1, 1);
                self.current_attrs.reset();
            }
        }
    }

    /// Set or reset a DEC private mode
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            6 => {
                self.modes.origin_mode = enable;
                self.move_cursor_to(1, 1);
            }
            7 => self.modes.auto_wrap = enable,
            12 => {} // cursor blink, rendering only
            25 => self.active_cursor_mut().visible = enable,
            47 | 1047 => self.switch_screen(enable, mode == 1047),
            1048 => {
                if enable {
                    self.save_cursor();
                } else {
                    self.restore_cursor();
                }
            }
            1049 => {
                if enable {
                    self.save_cursor();
                    self.switch_screen(true, true);
                } else {
                    self.switch_screen(false, true);
                    self.restore_cursor();
                }
            }
            2004 => self.modes.bracketed_paste = enable,
            _ => tracing::debug!(mode, enable, "Ignoring unsupported private mode"),
        }
    }

    /// Set or reset an ANSI mode
    pub fn set_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            4 => self.modes.insert_mode = enable,
            20 => self.modes.linefeed_newline = enable,
            _ => tracing::debug!(mode, enable, "Ignoring unsupported mode"),
        }
    }

    fn switch_screen(&mut self, alternate: bool, clear: bool) {
        if alternate == self.using_alternate {
            return;
        }
        if alternate {
            if clear {
                self.alternate_screen = ScreenBuffer::new(self.cols, self.rows, 0);
            }
            self.alternate_cursor = self.primary_cursor.clone();
            self.alternate_cursor.saved = None;
        } else {
            self.primary_cursor.visible = self.alternate_cursor.visible;
        }
        self.using_alternate = alternate;
        self.active_screen_mut().mark_all_dirty();
    }

    pub(crate) fn set_title(&mut self, title: String) {
        self.title = title;
        self.title_changed = true;
    }

    /// Returns the new title if an OSC sequence changed it since the last call
    pub fn take_title_change(&mut self) -> Option<String> {
        if std::mem::take(&mut self.title_changed) {
            Some(self.title.clone())
        } else {
            None
        }
    }

    /// Collect and clear the rows changed since the last call
    pub fn take_damage(&mut self) -> DiffRegion {
        let damage = self.active_screen_mut().take_damage();
        // Damage on a hidden screen is irrelevant: a switch marks everything dirty
        if self.using_alternate {
            self.primary_screen.clear_dirty();
        } else {
            self.alternate_screen.clear_dirty();
        }
        damage
    }

    /// Immutable copy of everything a renderer needs
    pub fn snapshot(&self) -> ScreenSnapshot {
        let cursor = self.active_cursor();
        ScreenSnapshot {
            cols: self.cols,
            rows: self.rows,
            lines: self
                .active_screen()
                .rows
                .iter()
                .map(|row| row.cells.clone())
                .collect(),
            cursor_row: cursor.row,
            cursor_col: cursor.col,
            cursor_visible: cursor.visible,
            cursor_shape: cursor.shape,
            title: self.title.clone(),
            alternate: self.using_alternate,
            scrollback_len: self.primary_screen.scrollback.len(),
            modes: self.modes.clone(),
        }
    }

    /// Text of the retained history, oldest first, trailing blanks trimmed
    pub fn scrollback_lines(&self) -> Vec<String> {
        self.primary_screen
            .scrollback
            .iter()
            .map(|row| row.text().trim_end().to_string())
            .collect()
    }

    /// Attributes used for erased cells: current background only
    fn blank_attrs(&self) -> CellAttrs {
        CellAttrs {
            bg: self.current_attrs.bg,
            ..CellAttrs::default()
        }
    }
}

fn resize_screen(
    screen: &mut ScreenBuffer,
    cursor: &mut CursorState,
    cols: u16,
    rows: u16,
    keep_history: bool,
) {
    let current = screen.rows.len();
    let target = rows as usize;

    if target < current {
        let mut excess = current - target;

        // Drop blank rows below the cursor before pushing content into history
        while excess > 0
            && screen.rows.len() - 1 > cursor.row as usize
            && screen.rows.last().map_or(false, Row::is_blank)
        {
            screen.rows.pop();
            excess -= 1;
        }

        let evicted: Vec<Row> = screen.rows.drain(..excess).collect();
        if keep_history {
            for row in evicted {
                screen.push_to_scrollback(row);
            }
        }
        cursor.row = cursor.row.saturating_sub(excess as u16);
        if let Some(saved) = cursor.saved.as_mut() {
            saved.row = saved.row.saturating_sub(excess as u16);
        }
    }

    while screen.rows.len() < target {
        screen.rows.push(Row::new(cols));
    }

    for row in &mut screen.rows {
        row.resize(cols);
    }
    for row in &mut screen.scrollback {
        row.resize(cols);
    }

    screen.mark_all_dirty();
}

/// Screen buffer with scrollback
pub struct ScreenBuffer {
    /// Visible rows
    pub rows: Vec<Row>,
    /// Scrollback history, oldest first
    pub scrollback: VecDeque<Row>,
    /// Maximum scrollback lines
    pub scrollback_limit: usize,
    pub dirty_lines: BTreeSet<u16>,
    pub full_redraw: bool,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16, scrollback_limit: usize) -> Self {
        Self {
            rows: (0..rows).map(|_| Row::new(cols)).collect(),
            scrollback: VecDeque::new(),
            scrollback_limit,
            dirty_lines: BTreeSet::new(),
            full_redraw: true,
        }
    }

    /// Add a row to scrollback, evicting the oldest beyond the limit
    pub fn push_to_scrollback(&mut self, row: Row) {
        if self.scrollback_limit == 0 {
            return;
        }
        self.scrollback.push_back(row);
        while self.scrollback.len() > self.scrollback_limit {
            self.scrollback.pop_front();
        }
    }

    pub fn mark_dirty(&mut self, line: u16) {
        if !self.full_redraw {
            self.dirty_lines.insert(line);
        }
    }

    fn mark_range(&mut self, top: u16, bottom: u16) {
        if top == 0 && bottom as usize + 1 >= self.rows.len() {
            self.mark_all_dirty();
        } else {
            for line in top..=bottom {
                self.mark_dirty(line);
            }
        }
    }

    pub fn mark_all_dirty(&mut self) {
        self.full_redraw = true;
        self.dirty_lines.clear();
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_lines.clear();
        self.full_redraw = false;
    }

    fn take_damage(&mut self) -> DiffRegion {
        let damage = if self.full_redraw {
            DiffRegion::Full
        } else {
            DiffRegion::Rows(std::mem::take(&mut self.dirty_lines))
        };
        self.clear_dirty();
        damage
    }
}

/// A single row
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    pub cells: Vec<Cell>,
    /// Set when text continued onto the next row by auto-wrap
    pub wrapped: bool,
}

impl Row {
    pub fn new(cols: u16) -> Self {
        Self::filled(cols, CellAttrs::default())
    }

    fn filled(cols: u16, attrs: CellAttrs) -> Self {
        Self {
            cells: vec![Cell::blank(attrs); cols as usize],
            wrapped: false,
        }
    }

    pub fn resize(&mut self, new_cols: u16) {
        let new_cols = new_cols as usize;
        if new_cols < self.cells.len() {
            self.cells.truncate(new_cols);
            // Never leave half of a wide character at the edge
            if let Some(last) = self.cells.last_mut() {
                if last.width == 2 {
                    *last = Cell::blank(last.attrs);
                }
            }
            self.wrapped = false;
        } else {
            self.cells.resize(new_cols, Cell::default());
        }
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        for cell in &mut self.cells {
            *cell = Cell::blank(attrs);
        }
        self.wrapped = false;
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|cell| *cell == Cell::default())
    }

    /// Row contents as text (continuation cells skipped, blanks as spaces)
    pub fn text(&self) -> String {
        cells_text(&self.cells)
    }
}

pub(crate) fn cells_text(cells: &[Cell]) -> String {
    cells
        .iter()
        .filter(|cell| !cell.is_continuation())
        .map(|cell| cell.ch)
        .collect()
}

/// A single cell
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    /// Display width; 0 marks the right half of a wide character
    pub width: u8,
    pub attrs: CellAttrs,
}

impl Default for Cell {
    fn default() -> Self {
        Self::blank(CellAttrs::default())
    }
}

impl Cell {
    pub fn blank(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            width: 1,
            attrs,
        }
    }

    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            width: 0,
            attrs,
        }
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }
}

/// Cell attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Color definition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u16 {
        const BOLD          = 0b0000_0000_0001;
        const DIM           = 0b0000_0000_0010;
        const ITALIC        = 0b0000_0000_0100;
        const UNDERLINE     = 0b0000_0000_1000;
        const BLINK         = 0b0000_0001_0000;
        const INVERSE       = 0b0000_0010_0000;
        const HIDDEN        = 0b0000_0100_0000;
        const STRIKETHROUGH = 0b0000_1000_0000;
    }
}

/// Cursor shape
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CursorShape {
    /// Default (terminal dependent)
    #[default]
    Default,
    BlinkingBlock,
    SteadyBlock,
    BlinkingUnderline,
    SteadyUnderline,
    /// Blinking bar (|)
    BlinkingBar,
    /// Steady bar (|)
    SteadyBar,
}

impl CursorShape {
    /// Create from DECSCUSR parameter
    pub fn from_decscusr(n: u16) -> Self {
        match n {
            1 => CursorShape::BlinkingBlock,
            2 => CursorShape::SteadyBlock,
            3 => CursorShape::BlinkingUnderline,
            4 => CursorShape::SteadyUnderline,
            5 => CursorShape::BlinkingBar,
            6 => CursorShape::SteadyBar,
            _ => CursorShape::Default,
        }
    }
}

/// Cursor state
#[derive(Clone, Debug)]
pub struct CursorState {
    pub col: u16,
    pub row: u16,
    pub visible: bool,
    pub shape: CursorShape,
    pub saved: Option<SavedCursor>,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            col: 0,
            row: 0,
            visible: true,
            shape: CursorShape::Default,
            saved: None,
        }
    }
}

/// Saved cursor state (DECSC)
#[derive(Clone, Debug)]
pub struct SavedCursor {
    pub col: u16,
    pub row: u16,
    pub attrs: CellAttrs,
    pub origin_mode: bool,
}

/// Terminal modes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub origin_mode: bool,
    pub insert_mode: bool,
    pub linefeed_newline: bool,
    pub bracketed_paste: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            origin_mode: false,
            insert_mode: false,
            linefeed_newline: true,
            bracketed_paste: false,
        }
    }
}

/// Rows changed by a mutation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiffRegion {
    /// Everything must be redrawn (resize, screen switch, full scroll)
    Full,
    /// Only these rows changed
    Rows(BTreeSet<u16>),
}

impl DiffRegion {
    pub fn is_empty(&self) -> bool {
        matches!(self, DiffRegion::Rows(rows) if rows.is_empty())
    }

    pub fn contains(&self, row: u16) -> bool {
        match self {
            DiffRegion::Full => true,
            DiffRegion::Rows(rows) => rows.contains(&row),
        }
    }

    /// Union with a later region
    pub fn merge(&mut self, other: DiffRegion) {
        match (&mut *self, other) {
            (DiffRegion::Full, _) => {}
            (this, DiffRegion::Full) => *this = DiffRegion::Full,
            (DiffRegion::Rows(rows), DiffRegion::Rows(more)) => rows.extend(more),
        }
    }
}

/// Immutable view of the visible screen, published after each mutation
#[derive(Clone, Debug)]
pub struct ScreenSnapshot {
    pub cols: u16,
    pub rows: u16,
    pub lines: Vec<Vec<Cell>>,
    pub cursor_row: u16,
    pub cursor_col: u16,
    pub cursor_visible: bool,
    pub cursor_shape: CursorShape,
    pub title: String,
    pub alternate: bool,
    pub scrollback_len: usize,
    pub modes: TerminalModes,
}

impl ScreenSnapshot {
    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.lines.get(row as usize)?.get(col as usize)
    }

    /// Row contents as text (blanks as spaces)
    pub fn row_text(&self, row: u16) -> String {
        self.lines
            .get(row as usize)
            .map(|cells| cells_text(cells))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn row_text(state: &TerminalState, row: usize) -> String {
        state.active_screen().rows[row].text()
    }

    #[test]
    fn test_hello_newline() {
        let mut state = TerminalState::new(80, 24);
        state.feed(b"hello\n");

        assert_eq!(row_text(&state, 0), format!("{:<80}", "hello"));
        assert_eq!(state.cursor_position(), (1, 0));
    }

    #[test]
    fn test_printable_wraps_and_advances() {
        let mut state = TerminalState::new(10, 5);
        state.feed(b"abcdefghijklm");

        assert_eq!(state.cursor_position(), (1, 3));
        assert_eq!(row_text(&state, 0), "abcdefghij");
        assert_eq!(row_text(&state, 1).trim_end(), "klm");
        assert!(state.active_screen().rows[0].wrapped);
    }

    #[test]
    fn test_exact_width_moves_to_next_line() {
        let mut state = TerminalState::new(4, 3);
        state.feed(b"abcd");
        assert_eq!(state.cursor_position(), (1, 0));
    }

    #[test]
    fn test_bottom_row_scrolls_into_scrollback() {
        let mut state = TerminalState::new(5, 2);
        state.feed(b"one\ntwo\nsix");

        assert_eq!(state.scrollback_lines(), vec!["one".to_string()]);
        assert_eq!(row_text(&state, 0).trim_end(), "two");
        assert_eq!(row_text(&state, 1).trim_end(), "six");
        assert_eq!(state.cursor_position(), (1, 3));
    }

    #[test]
    fn test_scrollback_evicts_oldest_first() {
        let mut state = TerminalState::with_scrollback(5, 1, 2);
        state.feed(b"a\nb\nc\nd");

        assert_eq!(state.scrollback_lines(), vec!["b", "c"]);
        assert_eq!(row_text(&state, 0).trim_end(), "d");
    }

    #[test]
    fn test_wide_char_wraps_when_it_does_not_fit() {
        let mut state = TerminalState::new(3, 2);
        state.feed("ab漢".as_bytes());

        let screen = state.active_screen();
        assert_eq!(screen.rows[1].cells[0].ch, '漢');
        assert_eq!(screen.rows[1].cells[0].width, 2);
        assert!(screen.rows[1].cells[1].is_continuation());
        assert_eq!(state.cursor_position(), (1, 2));
    }

    #[test]
    fn test_resize_preserves_cells_in_place() {
        let mut state = TerminalState::new(10, 4);
        state.feed(b"abc\r\ndef");
        state.resize(20, 6);

        assert_eq!(row_text(&state, 0).trim_end(), "abc");
        assert_eq!(row_text(&state, 1).trim_end(), "def");
        assert_eq!(state.active_screen().rows.len(), 6);
        assert!(state.active_screen().rows.iter().all(|r| r.cells.len() == 20));
        assert_eq!(state.cursor_position(), (1, 3));
    }

    #[test]
    fn test_resize_shrink_drops_blank_rows_first() {
        let mut state = TerminalState::new(10, 5);
        state.feed(b"top");
        state.resize(10, 2);

        assert_eq!(row_text(&state, 0).trim_end(), "top");
        assert!(state.scrollback_lines().is_empty());
    }

    #[test]
    fn test_resize_shrink_moves_rows_into_scrollback() {
        let mut state = TerminalState::new(10, 4);
        state.feed(b"1\n2\n3\n4");
        state.resize(10, 2);

        assert_eq!(state.scrollback_lines(), vec!["1", "2"]);
        assert_eq!(row_text(&state, 0).trim_end(), "3");
        assert_eq!(row_text(&state, 1).trim_end(), "4");
        assert_eq!(state.cursor_position(), (1, 1));
    }

    #[test]
    fn test_resize_truncates_columns_and_clamps_cursor() {
        let mut state = TerminalState::new(10, 2);
        state.feed(b"abcdefgh");
        state.resize(4, 2);

        assert_eq!(row_text(&state, 0), "abcd");
        assert_eq!(state.cursor_position(), (0, 3));
    }

    #[test]
    fn test_damage_tracks_rows_and_full_redraw() {
        let mut state = TerminalState::new(10, 5);
        assert_eq!(state.take_damage(), DiffRegion::Full);

        state.feed(b"\x1b[3;1Hx");
        assert_eq!(state.take_damage(), DiffRegion::Rows(BTreeSet::from([2])));
        assert!(state.take_damage().is_empty());

        state.resize(12, 5);
        assert_eq!(state.take_damage(), DiffRegion::Full);
    }

    #[test]
    fn test_diff_region_merge() {
        let mut region = DiffRegion::Rows(BTreeSet::from([1]));
        region.merge(DiffRegion::Rows(BTreeSet::from([4])));
        assert_eq!(region, DiffRegion::Rows(BTreeSet::from([1, 4])));
        region.merge(DiffRegion::Full);
        assert_eq!(region, DiffRegion::Full);
    }

    #[test]
    fn test_alternate_screen_has_no_scrollback() {
        let mut state = TerminalState::new(5, 2);
        state.feed(b"main");
        state.feed(b"\x1b[?1049h");
        assert!(state.using_alternate);
        state.feed(b"a\nb\nc\nd");
        assert!(state.scrollback_lines().is_empty());

        state.feed(b"\x1b[?1049l");
        assert!(!state.using_alternate);
        assert_eq!(row_text(&state, 0).trim_end(), "main");
        assert_eq!(state.cursor_position(), (0, 4));
    }

    #[test]
    fn test_scroll_region_confines_scrolling() {
        let mut state = TerminalState::new(5, 4);
        state.feed(b"head\r\n");
        state.feed(b"\x1b[2;3r");
        state.feed(b"\x1b[3;1Hx\ny\nz");

        assert_eq!(row_text(&state, 0).trim_end(), "head");
        assert_eq!(row_text(&state, 1).trim_end(), "y");
        assert_eq!(row_text(&state, 2).trim_end(), "z");
        assert!(state.scrollback_lines().is_empty());
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut state = TerminalState::new(8, 3);
        state.feed(b"\x1b]0;my title\x07hi");
        let snapshot = state.snapshot();

        assert_eq!(snapshot.row_text(0).trim_end(), "hi");
        assert_eq!((snapshot.cursor_row, snapshot.cursor_col), (0, 2));
        assert_eq!(snapshot.title, "my title");
        assert_eq!(state.take_title_change().as_deref(), Some("my title"));
        assert_eq!(state.take_title_change(), None);
    }

    #[test]
    fn test_huge_tab_count_clamps_to_last_column() {
        let mut state = TerminalState::new(80, 24);
        state.feed(b"\x1b[65535I");
        assert_eq!(state.cursor_position(), (0, 79));

        state.feed(b"\r\x1b[9000I");
        assert_eq!(state.cursor_position(), (0, 79));

        state.feed(b"\r\x1b[2I");
        assert_eq!(state.cursor_position(), (0, 16));
    }

    #[test]
    fn test_erase_scrollback_from_alternate_screen() {
        let mut state = TerminalState::new(5, 2);
        state.feed(b"a\nb\n");
        assert_eq!(state.scrollback_lines(), vec!["a".to_string()]);

        state.feed(b"\x1b[?1049h\x1b[3J\x1b[?1049l");
        assert!(state.scrollback_lines().is_empty());
    }

    proptest! {
        #[test]
        fn prop_cursor_stays_in_bounds(
            bytes in proptest::collection::vec(any::<u8>(), 0..512),
            cols in 1u16..40,
            rows in 1u16..20,
        ) {
            let mut state = TerminalState::new(cols, rows);
            state.feed(&bytes);
            let (row, col) = state.cursor_position();
            prop_assert!(row < rows);
            prop_assert!(col < cols);
            prop_assert_eq!(state.active_screen().rows.len(), rows as usize);
            prop_assert!(state.active_screen().rows.iter().all(|r| r.cells.len() == cols as usize));
        }

        #[test]
        fn prop_ascii_advances_with_wraparound(len in 0usize..200, cols in 1u16..30) {
            let rows = 20u16;
            prop_assume!(len / (cols as usize) < rows as usize);
            let mut state = TerminalState::new(cols, rows);
            let text = "x".repeat(len);
            state.feed(text.as_bytes());

            let expected = ((len / cols as usize) as u16, (len % cols as usize) as u16);
            prop_assert_eq!(state.cursor_position(), expected);
            let written: usize = state
                .active_screen()
                .rows
                .iter()
                .map(|r| r.cells.iter().filter(|c| c.ch == 'x').count())
                .sum();
            prop_assert_eq!(written, len);
        }

        #[test]
        fn prop_same_size_resize_is_idempotent(
            bytes in proptest::collection::vec(any::<u8>(), 0..256),
            cols in 1u16..40,
            rows in 1u16..20,
        ) {
            let mut state = TerminalState::new(cols, rows);
            state.feed(&bytes);
            state.resize(cols + 3, rows + 2);
            let before = state.snapshot();
            state.resize(cols + 3, rows + 2);
            let after = state.snapshot();

            prop_assert_eq!(before.lines, after.lines);
            prop_assert_eq!(
                (before.cursor_row, before.cursor_col),
                (after.cursor_row, after.cursor_col)
            );
        }
    }
}
