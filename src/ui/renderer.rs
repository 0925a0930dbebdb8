//! Terminal renderer using crossterm
//!
//! Draws published screen updates onto the host terminal. Only the rows
//! named by the update's region are rewritten.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, SetCursorStyle, Show},
    queue,
    style::{
        Attribute, Color as HostColor, Print, ResetColor, SetAttribute, SetBackgroundColor,
        SetForegroundColor,
    },
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen, SetTitle,
    },
};

use crate::config::ResolvedPalette;
use crate::core::events::ScreenUpdate;
use crate::core::term::{AttrFlags, Cell, CellAttrs, Color, CursorShape, DiffRegion, ScreenSnapshot};

/// Terminal renderer
pub struct Renderer {
    palette: ResolvedPalette,
    /// Whether the host terminal is in raw mode on the alternate screen
    initialized: bool,
    last_title: Option<String>,
    last_shape: Option<CursorShape>,
}

impl Renderer {
    pub fn new(palette: ResolvedPalette) -> Self {
        Self {
            palette,
            initialized: false,
            last_title: None,
            last_shape: None,
        }
    }

    /// Enter raw mode and the alternate screen
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        queue!(
            stdout,
            EnterAlternateScreen,
            crossterm::event::EnableBracketedPaste,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;
        stdout.flush()?;
        self.initialized = true;
        tracing::debug!("Host terminal initialized");
        Ok(())
    }

    /// Restore the host terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = queue!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            SetCursorStyle::DefaultUserShape,
            Show,
            EnableLineWrap,
            crossterm::event::DisableBracketedPaste,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();
        terminal::disable_raw_mode()
    }

    /// Get terminal size as (cols, rows)
    pub fn size() -> io::Result<(u16, u16)> {
        terminal::size()
    }

    /// Draw one update to stdout
    pub fn render(&mut self, update: &ScreenUpdate) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());
        self.draw(&mut out, &update.region, &update.snapshot)?;
        out.flush()
    }

    /// Redraw everything, e.g. after the host window changed size
    pub fn render_full(&mut self, snapshot: &ScreenSnapshot) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());
        queue!(out, ResetColor, Clear(ClearType::All))?;
        self.draw(&mut out, &DiffRegion::Full, snapshot)?;
        out.flush()
    }

    /// Write a notice on the bottom row
    pub fn render_notice(&mut self, message: &str) -> io::Result<()> {
        let (_, rows) = Self::size()?;
        let mut stdout = io::stdout();
        queue!(
            stdout,
            MoveTo(0, rows.saturating_sub(1)),
            ResetColor,
            SetAttribute(Attribute::Reset),
            Clear(ClearType::CurrentLine),
            SetAttribute(Attribute::Reverse),
            Print(message),
            SetAttribute(Attribute::Reset)
        )?;
        stdout.flush()
    }

    /// Queue the rows in `region`, then the cursor and title
    pub fn draw<W: Write>(
        &mut self,
        out: &mut W,
        region: &DiffRegion,
        snapshot: &ScreenSnapshot,
    ) -> io::Result<()> {
        // Synchronized update
        write!(out, "\x1b[?2026h")?;
        queue!(out, Hide)?;

        match region {
            DiffRegion::Full => {
                for row in 0..snapshot.rows {
                    self.draw_row(out, snapshot, row)?;
                }
            }
            DiffRegion::Rows(rows) => {
                for &row in rows.iter().filter(|&&row| row < snapshot.rows) {
                    self.draw_row(out, snapshot, row)?;
                }
            }
        }
        queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;

        if self.last_title.as_deref() != Some(snapshot.title.as_str()) {
            queue!(out, SetTitle(&snapshot.title))?;
            self.last_title = Some(snapshot.title.clone());
        }
        if self.last_shape != Some(snapshot.cursor_shape) {
            queue!(out, cursor_style(snapshot.cursor_shape))?;
            self.last_shape = Some(snapshot.cursor_shape);
        }
        if snapshot.cursor_visible {
            queue!(out, MoveTo(snapshot.cursor_col, snapshot.cursor_row), Show)?;
        }

        write!(out, "\x1b[?2026l")
    }

    fn draw_row<W: Write>(&self, out: &mut W, snapshot: &ScreenSnapshot, row: u16) -> io::Result<()> {
        queue!(
            out,
            MoveTo(0, row),
            ResetColor,
            SetAttribute(Attribute::Reset),
            Clear(ClearType::UntilNewLine)
        )?;
        let Some(cells) = snapshot.lines.get(usize::from(row)) else {
            return Ok(());
        };

        // Runs of equal attributes are written in one go
        let mut run = String::with_capacity(usize::from(snapshot.cols));
        let mut run_attrs: Option<CellAttrs> = None;
        for cell in cells.iter().filter(|cell| !cell.is_continuation()) {
            if run_attrs != Some(cell.attrs) {
                if let Some(attrs) = run_attrs {
                    self.flush_run(out, &attrs, &run)?;
                    run.clear();
                }
                run_attrs = Some(cell.attrs);
            }
            run.push(display_char(cell));
        }
        if let Some(attrs) = run_attrs {
            self.flush_run(out, &attrs, &run)?;
        }
        Ok(())
    }

    fn flush_run<W: Write>(&self, out: &mut W, attrs: &CellAttrs, text: &str) -> io::Result<()> {
        queue!(out, SetAttribute(Attribute::Reset))?;
        for (flag, attribute) in [
            (AttrFlags::BOLD, Attribute::Bold),
            (AttrFlags::DIM, Attribute::Dim),
            (AttrFlags::ITALIC, Attribute::Italic),
            (AttrFlags::UNDERLINE, Attribute::Underlined),
            (AttrFlags::BLINK, Attribute::SlowBlink),
            (AttrFlags::INVERSE, Attribute::Reverse),
            (AttrFlags::HIDDEN, Attribute::Hidden),
            (AttrFlags::STRIKETHROUGH, Attribute::CrossedOut),
        ] {
            if attrs.flags.contains(flag) {
                queue!(out, SetAttribute(attribute))?;
            }
        }
        queue!(
            out,
            SetForegroundColor(self.host_color(attrs.fg, true)),
            SetBackgroundColor(self.host_color(attrs.bg, false)),
            Print(text)
        )
    }

    /// Resolve a cell colour through the palette
    pub fn host_color(&self, color: Color, foreground: bool) -> HostColor {
        match color {
            Color::Default if foreground => self.palette.foreground.to_crossterm(),
            Color::Default if self.palette.background.a < 255 => HostColor::Reset,
            Color::Default => self.palette.background.to_crossterm(),
            Color::Indexed(n) if n < 16 => self.palette.ansi[usize::from(n)].to_crossterm(),
            Color::Indexed(n) => HostColor::AnsiValue(n),
            Color::Rgb(r, g, b) => HostColor::Rgb { r, g, b },
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

fn display_char(cell: &Cell) -> char {
    if cell.ch.is_control() {
        ' '
    } else {
        cell.ch
    }
}

fn cursor_style(shape: CursorShape) -> SetCursorStyle {
    match shape {
        CursorShape::Default => SetCursorStyle::DefaultUserShape,
        CursorShape::BlinkingBlock => SetCursorStyle::BlinkingBlock,
        CursorShape::SteadyBlock => SetCursorStyle::SteadyBlock,
        CursorShape::BlinkingUnderline => SetCursorStyle::BlinkingUnderScore,
        CursorShape::SteadyUnderline => SetCursorStyle::SteadyUnderScore,
        CursorShape::BlinkingBar => SetCursorStyle::BlinkingBar,
        CursorShape::SteadyBar => SetCursorStyle::SteadyBar,
    }
}
