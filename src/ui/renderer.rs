//! Terminal renderer using crossterm
//!
//! Draws a [`Snapshot`] onto the host console. Colours come from the
//! configured 16-entry palette as 24-bit RGB so ANSI art looks the same
//! whatever the host terminal's own palette is.

use std::io::{self, Write};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{
        Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor,
    },
    terminal::{
        self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen,
        LeaveAlternateScreen,
    },
};
use tracing::debug;

use crate::config::{Palette, Rgb};
use crate::core::term::{Cell, Snapshot};

/// Resolved appearance of one cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellStyle {
    pub fg: Rgb,
    pub bg: Rgb,
    pub underline: bool,
    pub blink: bool,
}

impl CellStyle {
    /// Bold brightens the foreground. With iCE colours the blink bit brightens
    /// the background instead of blinking. Reverse swaps the final pair.
    pub fn of(cell: &Cell, palette: &Palette, ice_colors: bool) -> Self {
        let mut fg = palette.get(cell.display_fg());
        let mut bg = palette.get(cell.display_bg(ice_colors));
        if cell.is_reverse() {
            std::mem::swap(&mut fg, &mut bg);
        }
        Self {
            fg,
            bg,
            underline: cell.is_underline(),
            blink: cell.is_blink() && !ice_colors,
        }
    }
}

/// Terminal renderer
pub struct Renderer {
    palette: Palette,
    /// Whether the terminal has been initialized
    initialized: bool,
    /// Last frame drawn, for row-level diffing
    prev: Option<Snapshot>,
}

impl Renderer {
    pub fn new(palette: Palette) -> Self {
        Self {
            palette,
            initialized: false,
            prev: None,
        }
    }

    /// Initialize the terminal for rendering
    pub fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(
            stdout,
            EnterAlternateScreen,
            crossterm::event::EnableMouseCapture,
            DisableLineWrap,
            Clear(ClearType::All),
            MoveTo(0, 0)
        )?;

        stdout.flush()?;
        self.initialized = true;
        self.prev = None;
        debug!("renderer initialized");
        Ok(())
    }

    /// Cleanup the terminal
    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(
            stdout,
            ResetColor,
            SetAttribute(Attribute::Reset),
            Show,
            EnableLineWrap,
            crossterm::event::DisableMouseCapture,
            LeaveAlternateScreen
        );
        let _ = stdout.flush();

        terminal::disable_raw_mode()
    }

    /// Force the next render to redraw every row
    pub fn invalidate(&mut self) {
        self.prev = None;
    }

    /// Render a snapshot to stdout
    pub fn render(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        let stdout = io::stdout();
        let mut stdout = io::BufWriter::with_capacity(65536, stdout.lock());
        let visible = terminal::size().unwrap_or((snapshot.cols, snapshot.rows));
        self.render_to(&mut stdout, snapshot, visible)?;
        stdout.flush()
    }

    /// Render changed rows to `out`, clipped to `visible` (cols, rows)
    pub fn render_to<W: Write>(
        &mut self,
        out: &mut W,
        snapshot: &Snapshot,
        visible: (u16, u16),
    ) -> io::Result<()> {
        let cols = snapshot.cols.min(visible.0);
        let rows = snapshot.rows.min(visible.1);

        let full = match &self.prev {
            Some(prev) => prev.cols != snapshot.cols || prev.rows != snapshot.rows,
            None => true,
        };

        // Begin synchronized update (reduces flicker)
        write!(out, "\x1b[?2026h")?;
        queue!(out, Hide)?;
        if full {
            queue!(out, ResetColor, Clear(ClearType::All))?;
        }

        for row in 0..rows {
            let changed = full
                || self
                    .prev
                    .as_ref()
                    .map_or(true, |prev| prev.row(row) != snapshot.row(row));
            if changed {
                if let Some(cells) = snapshot.row(row) {
                    self.render_row(out, row, &cells[..cols as usize], snapshot.modes.ice_colors)?;
                }
            }
        }

        queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;
        let cursor = snapshot.cursor;
        if cursor.visible && cursor.row < rows && cursor.col < cols {
            queue!(out, MoveTo(cursor.col, cursor.row), Show)?;
        }

        // End synchronized update
        write!(out, "\x1b[?2026l")?;

        self.prev = Some(snapshot.clone());
        Ok(())
    }

    fn render_row<W: Write>(
        &self,
        out: &mut W,
        row: u16,
        cells: &[Cell],
        ice_colors: bool,
    ) -> io::Result<()> {
        queue!(out, MoveTo(0, row))?;

        let mut run = String::with_capacity(cells.len());
        let mut current: Option<CellStyle> = None;

        for (i, cell) in cells.iter().enumerate() {
            let Some(ch) = glyph(cells, i) else {
                continue;
            };
            let style = CellStyle::of(cell, &self.palette, ice_colors);
            if current != Some(style) {
                if let Some(prev) = current {
                    self.write_run(out, &prev, &run)?;
                    run.clear();
                }
                current = Some(style);
            }
            run.push(ch);
        }
        if let Some(style) = current {
            self.write_run(out, &style, &run)?;
        }
        Ok(())
    }

    fn write_run<W: Write>(&self, out: &mut W, style: &CellStyle, text: &str) -> io::Result<()> {
        queue!(
            out,
            SetAttribute(Attribute::Reset),
            SetForegroundColor(style.fg.to_crossterm()),
            SetBackgroundColor(style.bg.to_crossterm())
        )?;
        if style.underline {
            queue!(out, SetAttribute(Attribute::Underlined))?;
        }
        if style.blink {
            queue!(out, SetAttribute(Attribute::SlowBlink))?;
        }
        queue!(out, Print(text))
    }
}

/// Character to print for `cells[i]`, or `None` when the cell is covered by
/// the wide character to its left. A wide character without its right half
/// (split by an edit, or clipped by the host width) prints as a blank.
fn glyph(cells: &[Cell], i: usize) -> Option<char> {
    let cell = &cells[i];
    if cell.is_continuation() {
        let covered = i > 0 && cells[i - 1].is_wide();
        return if covered { None } else { Some(' ') };
    }
    if cell.is_wide() && !cells.get(i + 1).is_some_and(Cell::is_continuation) {
        return Some(' ');
    }
    Some(cell.ch)
}

impl Drop for Renderer {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}
