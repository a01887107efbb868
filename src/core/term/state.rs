//! Terminal state management
//!
//! This module defines the terminal's screen buffer, cursor state, and attributes.
//! Every mutation here is driven by [`VtParser`](super::VtParser); readers get an
//! immutable [`Snapshot`] instead of touching the live grid.

use std::collections::VecDeque;

use bitflags::bitflags;
use tracing::{debug, trace};
use unicode_width::UnicodeWidthChar;

use super::snapshot::{CursorSnapshot, Snapshot};

/// Default grid width
pub const DEFAULT_COLS: u16 = 80;
/// Default grid height
pub const DEFAULT_ROWS: u16 = 24;
/// Default number of rows kept in scrollback
pub const DEFAULT_SCROLLBACK: usize = 1000;

/// Tab stops every 8 columns
const TAB_WIDTH: u16 = 8;

/// Settings that survive a full reset (`ESC c`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOptions {
    pub cols: u16,
    pub rows: u16,
    pub scrollback_limit: usize,
    /// Treat the blink bit as a background-intensity bit
    pub ice_colors: bool,
    /// Initial state of LNM (Enter sends CR LF)
    pub newline_mode: bool,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            scrollback_limit: DEFAULT_SCROLLBACK,
            ice_colors: true,
            newline_mode: false,
        }
    }
}

/// Terminal state holding all screen data
#[derive(Debug, Clone)]
pub struct TerminalState {
    screen: ScreenBuffer,
    cursor: CursorState,
    saved: Option<SavedCursor>,
    /// Graphic rendition applied to subsequently written characters
    attrs: CellAttrs,
    modes: TerminalModes,
    /// Scroll region (top, bottom) - 0-indexed, inclusive
    scroll_region: (u16, u16),
    title: String,
    options: TerminalOptions,
}

impl TerminalState {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self::with_options(TerminalOptions {
            cols,
            rows,
            ..TerminalOptions::default()
        })
    }

    pub fn with_options(options: TerminalOptions) -> Self {
        let cols = options.cols.max(1);
        let rows = options.rows.max(1);
        let modes = TerminalModes {
            ice_colors: options.ice_colors,
            linefeed_newline: options.newline_mode,
            ..TerminalModes::default()
        };

        Self {
            screen: ScreenBuffer::new(cols, rows, options.scrollback_limit),
            cursor: CursorState::default(),
            saved: None,
            attrs: CellAttrs::default(),
            modes,
            scroll_region: (0, rows - 1),
            title: String::new(),
            options,
        }
    }

    pub fn cols(&self) -> u16 {
        self.screen.cols()
    }

    pub fn rows(&self) -> u16 {
        self.screen.rows()
    }

    pub fn screen(&self) -> &ScreenBuffer {
        &self.screen
    }

    pub fn cursor(&self) -> &CursorState {
        &self.cursor
    }

    pub fn current_attrs(&self) -> CellAttrs {
        self.attrs
    }

    pub fn modes(&self) -> &TerminalModes {
        &self.modes
    }

    pub fn scroll_region(&self) -> (u16, u16) {
        self.scroll_region
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn attrs_mut(&mut self) -> &mut CellAttrs {
        &mut self.attrs
    }

    pub(crate) fn set_title(&mut self, title: String) {
        self.title = title;
    }

    /// Full reset (RIS). Options given at construction are kept.
    pub fn reset(&mut self) {
        let mut options = self.options.clone();
        options.cols = self.cols();
        options.rows = self.rows();
        *self = Self::with_options(options);
    }

    /// Immutable copy of the visible grid plus cursor and mode flags
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.screen.snapshot(CursorSnapshot {
            row: self.cursor.row,
            col: self.cursor.col,
            visible: self.cursor.visible,
        });
        snapshot.modes = self.modes.clone();
        snapshot.title = self.title.clone();
        snapshot
    }

    /// Resize the terminal
    pub fn resize(&mut self, cols: u16, rows: u16) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        self.screen.resize(cols, rows);
        self.scroll_region = (0, rows - 1);

        self.cursor.col = self.cursor.col.min(cols - 1);
        self.cursor.row = self.cursor.row.min(rows - 1);
        self.cursor.pending_wrap = false;
    }

    /// Blank cells produced by erase and scroll carry the current background
    fn erase_attrs(&self) -> CellAttrs {
        let flags = if self.modes.ice_colors {
            self.attrs.flags & AttrFlags::BLINK
        } else {
            AttrFlags::empty()
        };
        CellAttrs {
            fg: Color::DEFAULT_FG,
            bg: self.attrs.bg,
            flags,
        }
    }

    /// Put a character at the current cursor position
    pub fn put_char(&mut self, ch: char) {
        let width: u16 = match ch.width() {
            Some(0) => {
                // One codepoint per cell: combining marks have nowhere to go
                trace!("dropping zero-width char {:?}", ch);
                return;
            }
            Some(2) => 2,
            _ => 1,
        };

        if self.cursor.pending_wrap {
            self.cursor.pending_wrap = false;
            if self.modes.auto_wrap {
                self.cursor.col = 0;
                self.linefeed();
            }
        }

        // A wide char never straddles the right margin
        if width == 2 && self.cursor.col > 0 && self.cursor.col + 1 >= self.cols() {
            if !self.modes.auto_wrap {
                trace!("no room for wide char {:?}", ch);
                return;
            }
            self.cursor.col = 0;
            self.linefeed();
        }

        let (row, col) = (self.cursor.row, self.cursor.col);
        self.screen.put(row, col, ch, self.attrs, width as u8);

        if col + width >= self.cols() {
            self.cursor.col = self.cols() - 1;
            self.cursor.pending_wrap = true;
        } else {
            self.cursor.col += width;
        }
    }

    /// Carriage return - move cursor to column 0
    pub fn carriage_return(&mut self) {
        self.cursor.col = 0;
        self.cursor.pending_wrap = false;
    }

    /// Line feed - move cursor down, scroll if needed
    pub fn linefeed(&mut self) {
        self.cursor.pending_wrap = false;
        let scroll_bottom = self.scroll_region.1;

        if self.cursor.row == scroll_bottom {
            self.scroll_up(1);
        } else if self.cursor.row + 1 < self.rows() {
            self.cursor.row += 1;
        }
    }

    /// Index - cursor down, scroll if at bottom
    pub fn index(&mut self) {
        self.linefeed();
    }

    /// Next line (NEL)
    pub fn next_line(&mut self) {
        self.carriage_return();
        self.linefeed();
    }

    /// Reverse index - cursor up, scroll if at top
    pub fn reverse_index(&mut self) {
        self.cursor.pending_wrap = false;
        if self.cursor.row == self.scroll_region.0 {
            self.scroll_down(1);
        } else {
            self.cursor.row = self.cursor.row.saturating_sub(1);
        }
    }

    /// Backspace - move cursor left
    pub fn backspace(&mut self) {
        self.cursor.pending_wrap = false;
        self.cursor.col = self.cursor.col.saturating_sub(1);
    }

    /// Horizontal tab
    pub fn horizontal_tab(&mut self) {
        self.cursor.pending_wrap = false;
        let next = (self.cursor.col / TAB_WIDTH + 1) * TAB_WIDTH;
        self.cursor.col = next.min(self.cols() - 1);
    }

    /// Scroll the region up by n lines
    pub fn scroll_up(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let fill = self.erase_attrs();
        for _ in 0..n.min(bottom - top + 1) {
            self.screen.scroll_up((top, bottom), fill);
        }
    }

    /// Scroll the region down by n lines
    pub fn scroll_down(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let fill = self.erase_attrs();
        for _ in 0..n.min(bottom - top + 1) {
            self.screen.scroll_down((top, bottom), fill);
        }
    }

    /// Cursor up
    pub fn cursor_up(&mut self, n: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.row = self.cursor.row.saturating_sub(n);
    }

    /// Cursor down
    pub fn cursor_down(&mut self, n: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.row = self.cursor.row.saturating_add(n).min(self.rows() - 1);
    }

    /// Cursor forward (right)
    pub fn cursor_forward(&mut self, n: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.col = self.cursor.col.saturating_add(n).min(self.cols() - 1);
    }

    /// Cursor backward (left)
    pub fn cursor_backward(&mut self, n: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.col = self.cursor.col.saturating_sub(n);
    }

    /// Set cursor position (1-indexed parameters)
    pub fn cursor_position(&mut self, row: u16, col: u16) {
        self.set_row(row);
        self.set_column(col);
    }

    /// Absolute column (1-indexed)
    pub fn set_column(&mut self, col: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.col = col.saturating_sub(1).min(self.cols() - 1);
    }

    /// Absolute row (1-indexed)
    pub fn set_row(&mut self, row: u16) {
        self.cursor.pending_wrap = false;
        self.cursor.row = row.saturating_sub(1).min(self.rows() - 1);
    }

    /// Erase in display
    pub fn erase_in_display(&mut self, mode: u16) {
        let fill = self.erase_attrs();
        let row = self.cursor.row;
        let rows = self.rows();

        match mode {
            0 => {
                self.erase_in_line(0);
                for r in (row + 1)..rows {
                    self.screen.clear_row(r, fill);
                }
            }
            1 => {
                for r in 0..row {
                    self.screen.clear_row(r, fill);
                }
                self.erase_in_line(1);
            }
            2 | 3 => {
                for r in 0..rows {
                    self.screen.clear_row(r, fill);
                }
            }
            _ => debug!("ignoring ED mode {}", mode),
        }
    }

    /// Erase in line
    pub fn erase_in_line(&mut self, mode: u16) {
        let fill = self.erase_attrs();
        let (row, col) = (self.cursor.row, self.cursor.col);
        let cols = self.cols();

        match mode {
            0 => self.screen.clear_cells(row, col, cols, fill),
            1 => self.screen.clear_cells(row, 0, col + 1, fill),
            2 => self.screen.clear_row(row, fill),
            _ => debug!("ignoring EL mode {}", mode),
        }
    }

    /// Insert lines at cursor position
    pub fn insert_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let row = self.cursor.row;
        if row < top || row > bottom {
            return;
        }
        let fill = self.erase_attrs();
        for _ in 0..n.min(bottom - row + 1) {
            self.screen.scroll_down((row, bottom), fill);
        }
        self.cursor.col = 0;
        self.cursor.pending_wrap = false;
    }

    /// Delete lines at cursor position
    pub fn delete_lines(&mut self, n: u16) {
        let (top, bottom) = self.scroll_region;
        let row = self.cursor.row;
        if row < top || row > bottom {
            return;
        }
        let fill = self.erase_attrs();
        for _ in 0..n.min(bottom - row + 1) {
            self.screen.remove_line((row, bottom), fill);
        }
        self.cursor.col = 0;
        self.cursor.pending_wrap = false;
    }

    /// Insert blank characters at the cursor, shifting the rest of the line right
    pub fn insert_chars(&mut self, n: u16) {
        let fill = self.erase_attrs();
        self.screen
            .insert_cells(self.cursor.row, self.cursor.col, n, fill);
        self.cursor.pending_wrap = false;
    }

    /// Delete characters at the cursor, shifting the rest of the line left
    pub fn delete_chars(&mut self, n: u16) {
        let fill = self.erase_attrs();
        self.screen
            .delete_cells(self.cursor.row, self.cursor.col, n, fill);
        self.cursor.pending_wrap = false;
    }

    /// Erase characters from the cursor without shifting
    pub fn erase_chars(&mut self, n: u16) {
        let fill = self.erase_attrs();
        let col = self.cursor.col;
        let end = col.saturating_add(n).min(self.cols());
        self.screen.clear_cells(self.cursor.row, col, end, fill);
    }

    /// Set scroll region (1-indexed, inclusive). A bottom of 0 means the last row.
    pub fn set_scroll_region(&mut self, top: u16, bottom: u16) {
        let rows = self.rows();
        let bottom = if bottom == 0 { rows } else { bottom };
        let top = top.saturating_sub(1).min(rows - 1);
        let bottom = bottom.saturating_sub(1).min(rows - 1);
        if top < bottom {
            self.scroll_region = (top, bottom);
        } else {
            debug!("ignoring invalid scroll region {}..{}", top, bottom);
        }
    }

    /// Save cursor position
    pub fn save_cursor(&mut self) {
        self.saved = Some(SavedCursor {
            row: self.cursor.row,
            col: self.cursor.col,
            pending_wrap: self.cursor.pending_wrap,
            attrs: self.attrs,
        });
    }

    /// Restore cursor position
    pub fn restore_cursor(&mut self) {
        match self.saved.clone() {
            Some(saved) => {
                self.cursor.row = saved.row.min(self.rows() - 1);
                self.cursor.col = saved.col.min(self.cols() - 1);
                self.cursor.pending_wrap = saved.pending_wrap;
                self.attrs = saved.attrs;
            }
            None => {
                self.cursor.row = 0;
                self.cursor.col = 0;
                self.cursor.pending_wrap = false;
            }
        }
    }

    /// Set private mode
    pub fn set_private_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            1 => self.modes.application_cursor = enable,
            7 => {
                self.modes.auto_wrap = enable;
                if !enable {
                    self.cursor.pending_wrap = false;
                }
            }
            25 => self.cursor.visible = enable,
            33 => self.modes.ice_colors = enable,
            1000 | 1002 | 1003 => {
                self.modes.mouse_tracking = if enable {
                    MouseTracking::from_mode(mode)
                } else {
                    MouseTracking::Off
                };
            }
            1006 => self.modes.mouse_sgr = enable,
            _ => debug!("ignoring private mode {} = {}", mode, enable),
        }
    }

    /// Set ANSI (non-private) mode
    pub fn set_ansi_mode(&mut self, mode: u16, enable: bool) {
        match mode {
            20 => self.modes.linefeed_newline = enable,
            _ => debug!("ignoring ANSI mode {} = {}", mode, enable),
        }
    }
}

/// Screen buffer with scrollback
///
/// The visible grid always holds exactly `cols * rows` cells. Rows evicted off
/// the top of an unrestricted scroll are kept in a bounded FIFO.
#[derive(Debug, Clone)]
pub struct ScreenBuffer {
    cols: u16,
    /// Visible rows
    rows: Vec<Row>,
    /// Scrollback history, oldest first
    scrollback: VecDeque<Row>,
    /// Maximum scrollback lines
    scrollback_limit: usize,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16, scrollback_limit: usize) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows: (0..rows).map(|_| Row::new(cols)).collect(),
            scrollback: VecDeque::new(),
            scrollback_limit,
        }
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows.len() as u16
    }

    pub fn row(&self, row: u16) -> Option<&Row> {
        self.rows.get(row as usize)
    }

    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        self.row(row).and_then(|r| r.cells.get(col as usize))
    }

    /// Scrollback history, oldest first
    pub fn scrollback(&self) -> impl DoubleEndedIterator<Item = &Row> + '_ {
        self.scrollback.iter()
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    pub fn scrollback_limit(&self) -> usize {
        self.scrollback_limit
    }

    /// Write a cell. Positions outside the grid are ignored.
    pub fn write(&mut self, row: u16, col: u16, cell: Cell) -> bool {
        match self
            .rows
            .get_mut(row as usize)
            .and_then(|r| r.cells.get_mut(col as usize))
        {
            Some(slot) => {
                *slot = cell;
                true
            }
            None => {
                trace!("write outside grid at ({}, {})", row, col);
                false
            }
        }
    }

    /// Write a character of `width` columns at a position, splitting any
    /// wide pair it lands on. A wide char in the last column has no right half.
    pub fn put(&mut self, row: u16, col: u16, ch: char, attrs: CellAttrs, width: u8) {
        let Some(r) = self.rows.get_mut(row as usize) else {
            trace!("put outside grid at ({}, {})", row, col);
            return;
        };
        let col = col as usize;
        if col >= r.cells.len() {
            return;
        }
        let span = (width.max(1) as usize).min(r.cells.len() - col);
        for c in col..col + span {
            r.break_wide(c);
        }
        r.cells[col] = Cell { ch, attrs, width };
        if width == 2 {
            if let Some(next) = r.cells.get_mut(col + 1) {
                *next = Cell::continuation(attrs);
            }
        }
    }

    /// Scroll `region` up one line. The top row goes to scrollback only when
    /// the region spans the whole grid; otherwise it is discarded.
    pub fn scroll_up(&mut self, region: (u16, u16), fill: CellAttrs) {
        let Some((top, bottom)) = self.clamp_region(region) else {
            return;
        };
        let evicted = self.rows.remove(top);
        self.rows.insert(bottom, Row::blank(self.cols, fill));

        if top == 0 && bottom + 1 == self.rows.len() {
            self.push_to_scrollback(evicted);
        }
    }

    /// Scroll `region` down one line, inserting a blank row at the top
    pub fn scroll_down(&mut self, region: (u16, u16), fill: CellAttrs) {
        let Some((top, bottom)) = self.clamp_region(region) else {
            return;
        };
        self.rows.remove(bottom);
        self.rows.insert(top, Row::blank(self.cols, fill));
    }

    /// Like `scroll_up` but never captures into scrollback (DL)
    fn remove_line(&mut self, region: (u16, u16), fill: CellAttrs) {
        let Some((top, bottom)) = self.clamp_region(region) else {
            return;
        };
        self.rows.remove(top);
        self.rows.insert(bottom, Row::blank(self.cols, fill));
    }

    fn clamp_region(&self, (top, bottom): (u16, u16)) -> Option<(usize, usize)> {
        let last = self.rows.len() - 1;
        let bottom = (bottom as usize).min(last);
        let top = top as usize;
        (top <= bottom).then_some((top, bottom))
    }

    fn push_to_scrollback(&mut self, row: Row) {
        if self.scrollback_limit == 0 {
            return;
        }
        self.scrollback.push_back(row);
        while self.scrollback.len() > self.scrollback_limit {
            self.scrollback.pop_front();
        }
    }

    /// Resize, anchored at the top-left. New cells get default attributes.
    pub fn resize(&mut self, new_cols: u16, new_rows: u16) {
        let new_cols = new_cols.max(1);
        let new_rows = new_rows.max(1) as usize;

        self.rows.truncate(new_rows);
        while self.rows.len() < new_rows {
            self.rows.push(Row::new(new_cols));
        }
        for row in self.rows.iter_mut().chain(self.scrollback.iter_mut()) {
            row.resize(new_cols);
        }
        self.cols = new_cols;
    }

    fn clear_row(&mut self, row: u16, fill: CellAttrs) {
        if let Some(r) = self.rows.get_mut(row as usize) {
            r.clear(fill);
        }
    }

    /// Clear cells `[start, end)` of a row
    fn clear_cells(&mut self, row: u16, start: u16, end: u16, fill: CellAttrs) {
        if let Some(r) = self.rows.get_mut(row as usize) {
            let end = (end as usize).min(r.cells.len());
            let start = (start as usize).min(end);
            for cell in &mut r.cells[start..end] {
                *cell = Cell::blank(fill);
            }
        }
    }

    fn insert_cells(&mut self, row: u16, col: u16, n: u16, fill: CellAttrs) {
        let cols = self.cols as usize;
        if let Some(r) = self.rows.get_mut(row as usize) {
            let col = col as usize;
            if col >= cols {
                return;
            }
            let n = (n as usize).min(cols - col);
            r.cells.splice(col..col, std::iter::repeat(Cell::blank(fill)).take(n));
            r.cells.truncate(cols);
        }
    }

    fn delete_cells(&mut self, row: u16, col: u16, n: u16, fill: CellAttrs) {
        let cols = self.cols as usize;
        if let Some(r) = self.rows.get_mut(row as usize) {
            let col = col as usize;
            if col >= cols {
                return;
            }
            let n = (n as usize).min(cols - col);
            r.cells.drain(col..col + n);
            r.cells.resize(cols, Cell::blank(fill));
        }
    }

    /// Copy of the visible grid; `cursor` is supplied by the owner
    pub fn snapshot(&self, cursor: CursorSnapshot) -> Snapshot {
        Snapshot {
            cols: self.cols,
            rows: self.rows(),
            cells: self.rows.iter().flat_map(|r| r.cells.iter().copied()).collect(),
            cursor,
            modes: TerminalModes::default(),
            title: String::new(),
            scrollback_len: self.scrollback.len(),
            version: 0,
        }
    }
}

/// A single row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(cols: u16) -> Self {
        Self::blank(cols, CellAttrs::default())
    }

    pub fn blank(cols: u16, attrs: CellAttrs) -> Self {
        Self {
            cells: vec![Cell::blank(attrs); cols as usize],
        }
    }

    pub fn resize(&mut self, new_cols: u16) {
        self.cells.resize(new_cols as usize, Cell::default());
    }

    pub fn clear(&mut self, attrs: CellAttrs) {
        for cell in &mut self.cells {
            *cell = Cell::blank(attrs);
        }
    }

    /// Row text with trailing blanks trimmed
    pub fn text(&self) -> String {
        let s: String = self
            .cells
            .iter()
            .filter(|c| !c.is_continuation())
            .map(|c| c.ch)
            .collect();
        s.trim_end().to_string()
    }

    /// Blank the other half of a wide pair that `col` belongs to
    fn break_wide(&mut self, col: usize) {
        let Some(cell) = self.cells.get(col).copied() else {
            return;
        };
        if cell.is_continuation() && col > 0 && self.cells[col - 1].is_wide() {
            let lead = &mut self.cells[col - 1];
            *lead = Cell::blank(lead.attrs);
        }
        if cell.is_wide() {
            if let Some(next) = self.cells.get_mut(col + 1) {
                if next.is_continuation() {
                    *next = Cell::blank(next.attrs);
                }
            }
        }
    }
}

/// A single cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell {
    pub ch: char,
    pub attrs: CellAttrs,
    /// Display columns: 2 for the left half of a wide char, 0 for its right half
    pub width: u8,
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
            attrs,
            width: 1,
        }
    }

    /// Right half of a wide character
    pub fn continuation(attrs: CellAttrs) -> Self {
        Self {
            ch: ' ',
            attrs,
            width: 0,
        }
    }

    pub fn is_wide(&self) -> bool {
        self.width == 2
    }

    pub fn is_continuation(&self) -> bool {
        self.width == 0
    }

    pub fn is_bold(&self) -> bool {
        self.attrs.flags.contains(AttrFlags::BOLD)
    }

    pub fn is_underline(&self) -> bool {
        self.attrs.flags.contains(AttrFlags::UNDERLINE)
    }

    pub fn is_blink(&self) -> bool {
        self.attrs.flags.contains(AttrFlags::BLINK)
    }

    pub fn is_reverse(&self) -> bool {
        self.attrs.flags.contains(AttrFlags::REVERSE)
    }

    /// Foreground index a renderer should use: bold brightens the low eight
    pub fn display_fg(&self) -> Color {
        if self.is_bold() {
            self.attrs.fg.bright()
        } else {
            self.attrs.fg
        }
    }

    /// Background index a renderer should use. In iCE colour mode the blink
    /// bit selects the bright half of the palette instead of blinking.
    pub fn display_bg(&self, ice_colors: bool) -> Color {
        if ice_colors && self.is_blink() {
            self.attrs.bg.bright()
        } else {
            self.attrs.bg
        }
    }
}

/// Cell attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl Default for CellAttrs {
    fn default() -> Self {
        Self {
            fg: Color::DEFAULT_FG,
            bg: Color::DEFAULT_BG,
            flags: AttrFlags::empty(),
        }
    }
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One of the 16 indexed colours
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(u8);

/// Reference RGB values used to fold 256-colour and truecolour SGR down to 16
const VGA_RGB: [(u8, u8, u8); 16] = [
    (0, 0, 0),
    (170, 0, 0),
    (0, 170, 0),
    (170, 85, 0),
    (0, 0, 170),
    (170, 0, 170),
    (0, 170, 170),
    (170, 170, 170),
    (85, 85, 85),
    (255, 85, 85),
    (85, 255, 85),
    (255, 255, 85),
    (85, 85, 255),
    (255, 85, 255),
    (85, 255, 255),
    (255, 255, 255),
];

impl Color {
    pub const BLACK: Color = Color(0);
    pub const RED: Color = Color(1);
    pub const GREEN: Color = Color(2);
    pub const YELLOW: Color = Color(3);
    pub const BLUE: Color = Color(4);
    pub const MAGENTA: Color = Color(5);
    pub const CYAN: Color = Color(6);
    pub const WHITE: Color = Color(7);

    pub const DEFAULT_FG: Color = Color::WHITE;
    pub const DEFAULT_BG: Color = Color::BLACK;

    /// Indices above 15 wrap into range
    pub const fn indexed(n: u8) -> Self {
        Color(n & 0x0F)
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    pub const fn bright(self) -> Self {
        Color(self.0 | 0x08)
    }

    pub const fn is_bright(self) -> bool {
        self.0 & 0x08 != 0
    }

    /// Map an xterm 256-colour index onto the 16-colour palette
    pub fn from_ansi256(n: u8) -> Self {
        const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
        match n {
            0..=15 => Color(n),
            16..=231 => {
                let n = n - 16;
                let r = LEVELS[(n / 36) as usize];
                let g = LEVELS[((n / 6) % 6) as usize];
                let b = LEVELS[(n % 6) as usize];
                Self::nearest_rgb(r, g, b)
            }
            232..=255 => {
                let v = 8 + 10 * (n - 232);
                Self::nearest_rgb(v, v, v)
            }
        }
    }

    /// Closest palette entry by squared RGB distance
    pub fn nearest_rgb(r: u8, g: u8, b: u8) -> Self {
        let dist = |&(pr, pg, pb): &(u8, u8, u8)| {
            let dr = i32::from(pr) - i32::from(r);
            let dg = i32::from(pg) - i32::from(g);
            let db = i32::from(pb) - i32::from(b);
            dr * dr + dg * dg + db * db
        };
        let index = VGA_RGB
            .iter()
            .enumerate()
            .min_by_key(|(_, rgb)| dist(rgb))
            .map_or(0, |(i, _)| i);
        Color(index as u8)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u8 {
        const BOLD      = 0b0001;
        const UNDERLINE = 0b0010;
        const BLINK     = 0b0100;
        const REVERSE   = 0b1000;
    }
}

/// Cursor state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
    /// A character was written in the last column; the wrap happens on the next one
    pub pending_wrap: bool,
}

impl Default for CursorState {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            visible: true,
            pending_wrap: false,
        }
    }
}

/// Saved cursor state
#[derive(Debug, Clone)]
struct SavedCursor {
    row: u16,
    col: u16,
    pending_wrap: bool,
    attrs: CellAttrs,
}

/// Which mouse events the remote application asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MouseTracking {
    #[default]
    Off,
    /// 1000: press and release
    Click,
    /// 1002: plus motion while a button is held
    Drag,
    /// 1003: all motion
    Motion,
}

impl MouseTracking {
    fn from_mode(mode: u16) -> Self {
        match mode {
            1000 => MouseTracking::Click,
            1002 => MouseTracking::Drag,
            1003 => MouseTracking::Motion,
            _ => MouseTracking::Off,
        }
    }
}

/// Terminal modes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalModes {
    pub application_cursor: bool,
    pub auto_wrap: bool,
    pub linefeed_newline: bool,
    pub ice_colors: bool,
    pub mouse_tracking: MouseTracking,
    pub mouse_sgr: bool,
}

impl Default for TerminalModes {
    fn default() -> Self {
        Self {
            application_cursor: false,
            auto_wrap: true,
            linefeed_newline: false,
            ice_colors: false,
            mouse_tracking: MouseTracking::Off,
            mouse_sgr: false,
        }
    }
}

impl TerminalModes {
    /// Mouse events should be reported as `ESC [ < b ; x ; y M/m`
    pub fn sgr_mouse_reporting(&self) -> bool {
        self.mouse_sgr && self.mouse_tracking != MouseTracking::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_str(state: &mut TerminalState, s: &str) {
        for ch in s.chars() {
            state.put_char(ch);
        }
    }

    #[test]
    fn test_put_char_advances_cursor() {
        let mut state = TerminalState::new(80, 24);
        write_str(&mut state, "Hello");

        assert_eq!(state.cursor().col, 5);
        assert_eq!(state.screen().row(0).map(Row::text), Some("Hello".to_string()));
        assert_eq!(state.screen().cell(0, 5), Some(&Cell::default()));
    }

    #[test]
    fn test_deferred_wrap() {
        let mut state = TerminalState::new(10, 3);
        write_str(&mut state, "0123456789");

        // Cursor parks on the last column until the next character arrives
        assert_eq!(state.cursor().row, 0);
        assert_eq!(state.cursor().col, 9);
        assert!(state.cursor().pending_wrap);

        state.put_char('X');
        assert_eq!(state.cursor().row, 1);
        assert_eq!(state.cursor().col, 1);
        assert_eq!(state.screen().cell(1, 0).map(|c| c.ch), Some('X'));
        assert_eq!(state.screen().cell(0, 9).map(|c| c.ch), Some('9'));
    }

    #[test]
    fn test_pending_wrap_cleared_by_carriage_return() {
        let mut state = TerminalState::new(4, 2);
        write_str(&mut state, "abcd");
        state.carriage_return();
        state.put_char('Z');

        assert_eq!(state.screen().row(0).map(Row::text), Some("Zbcd".to_string()));
        assert_eq!(state.cursor().row, 0);
    }

    #[test]
    fn test_no_autowrap_overwrites_last_column() {
        let mut state = TerminalState::new(4, 2);
        state.set_private_mode(7, false);
        write_str(&mut state, "abcdef");

        assert_eq!(state.screen().row(0).map(Row::text), Some("abcf".to_string()));
        assert_eq!(state.cursor().row, 0);
    }

    #[test]
    fn test_wrap_at_bottom_scrolls() {
        let mut state = TerminalState::new(3, 2);
        write_str(&mut state, "abcdefg");

        assert_eq!(state.screen().scrollback_len(), 1);
        assert_eq!(state.screen().row(0).map(Row::text), Some("def".to_string()));
        assert_eq!(state.screen().row(1).map(Row::text), Some("g".to_string()));
    }

    #[test]
    fn test_scrollback_fifo_eviction() {
        let mut state = TerminalState::with_options(TerminalOptions {
            cols: 10,
            rows: 2,
            scrollback_limit: 3,
            ..TerminalOptions::default()
        });
        state.set_row(2);
        for i in 0..5 {
            write_str(&mut state, &format!("line{}", i));
            state.next_line();
        }

        let history: Vec<String> = state.screen().scrollback().map(Row::text).collect();
        assert_eq!(history, vec!["line1", "line2", "line3"]);
        assert_eq!(state.screen().row(0).map(Row::text), Some("line4".to_string()));
    }

    #[test]
    fn test_restricted_region_discards_rows() {
        let mut state = TerminalState::new(10, 5);
        state.set_scroll_region(2, 4);
        state.set_row(4);
        write_str(&mut state, "bottom");
        state.linefeed();

        assert_eq!(state.screen().scrollback_len(), 0);
        assert_eq!(state.screen().row(2).map(Row::text), Some("bottom".to_string()));
        assert_eq!(state.screen().row(3).map(Row::text), Some(String::new()));
    }

    #[test]
    fn test_scroll_fills_with_current_background() {
        let mut state = TerminalState::new(5, 2);
        state.attrs_mut().bg = Color::BLUE;
        state.set_row(2);
        state.linefeed();

        let bottom = state.screen().row(1).cloned().unwrap_or_else(|| Row::new(0));
        assert!(bottom.cells.iter().all(|c| c.attrs.bg == Color::BLUE && c.ch == ' '));
        assert!(bottom.cells.iter().all(|c| c.attrs.fg == Color::DEFAULT_FG));
    }

    #[test]
    fn test_erase_in_line_modes() {
        let mut state = TerminalState::new(6, 1);
        write_str(&mut state, "abcdef");
        state.set_column(3);

        let mut left = state.clone();
        left.erase_in_line(1);
        assert_eq!(left.screen().row(0).map(Row::text), Some("   def".to_string()));

        let mut right = state.clone();
        right.erase_in_line(0);
        assert_eq!(right.screen().row(0).map(Row::text), Some("ab".to_string()));

        state.erase_in_line(2);
        assert_eq!(state.screen().row(0).map(Row::text), Some(String::new()));
    }

    #[test]
    fn test_erase_in_display_to_start() {
        let mut state = TerminalState::new(3, 3);
        write_str(&mut state, "abcdefghi");
        state.cursor_position(2, 2);
        state.erase_in_display(1);

        let text: Vec<String> = (0..3)
            .filter_map(|r| state.screen().row(r).map(Row::text))
            .collect();
        assert_eq!(text, vec!["".to_string(), "  f".to_string(), "ghi".to_string()]);
    }

    #[test]
    fn test_write_out_of_bounds_is_noop() {
        let mut buffer = ScreenBuffer::new(4, 2, 10);
        let before = buffer.clone().snapshot(CursorSnapshot::default());
        assert!(!buffer.write(5, 0, Cell::default()));
        assert!(!buffer.write(0, 4, Cell::default()));
        assert_eq!(buffer.snapshot(CursorSnapshot::default()).cells, before.cells);
    }

    #[test]
    fn test_resize_smaller_truncates() {
        let mut state = TerminalState::new(10, 5);
        write_str(&mut state, "abcdefghij");
        state.cursor_position(5, 10);
        state.resize(4, 2);

        assert_eq!(state.cols(), 4);
        assert_eq!(state.rows(), 2);
        assert_eq!(state.screen().row(0).map(Row::text), Some("abcd".to_string()));
        assert_eq!(state.cursor().row, 1);
        assert_eq!(state.cursor().col, 3);
        assert_eq!(state.snapshot().cells.len(), 8);
    }

    #[test]
    fn test_resize_larger_pads_with_defaults() {
        let mut state = TerminalState::new(3, 2);
        state.attrs_mut().fg = Color::RED;
        write_str(&mut state, "abc");
        state.resize(6, 4);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.cells.len(), 24);
        assert_eq!(snapshot.line(0), Some("abc".to_string()));
        assert_eq!(snapshot.cell(0, 0).map(|c| c.attrs.fg), Some(Color::RED));
        assert_eq!(snapshot.cell(0, 5), Some(&Cell::default()));
        assert_eq!(snapshot.cell(3, 0), Some(&Cell::default()));
    }

    #[test]
    fn test_insert_and_delete_chars() {
        let mut state = TerminalState::new(6, 1);
        write_str(&mut state, "abcdef");
        state.set_column(2);
        state.insert_chars(2);
        assert_eq!(state.screen().row(0).map(Row::text), Some("a  bcd".to_string()));

        state.delete_chars(3);
        assert_eq!(state.screen().row(0).map(Row::text), Some("acd".to_string()));
    }

    #[test]
    fn test_insert_and_delete_lines_stay_in_region() {
        let mut state = TerminalState::new(3, 4);
        for (i, line) in ["aaa", "bbb", "ccc", "ddd"].iter().enumerate() {
            state.cursor_position(i as u16 + 1, 1);
            write_str(&mut state, line);
        }
        state.cursor_position(2, 1);
        state.insert_lines(1);
        let text: Vec<String> = (0..4)
            .filter_map(|r| state.screen().row(r).map(Row::text))
            .collect();
        assert_eq!(text, vec!["aaa", "", "bbb", "ccc"]);

        state.cursor_position(1, 1);
        state.delete_lines(2);
        let text: Vec<String> = (0..4)
            .filter_map(|r| state.screen().row(r).map(Row::text))
            .collect();
        assert_eq!(text, vec!["bbb", "ccc", "", ""]);
        assert_eq!(state.screen().scrollback_len(), 0);
    }

    #[test]
    fn test_save_restore_cursor_with_attrs() {
        let mut state = TerminalState::new(80, 24);
        state.cursor_position(5, 10);
        state.attrs_mut().fg = Color::GREEN;
        state.save_cursor();

        state.cursor_position(1, 1);
        state.attrs_mut().reset();
        state.restore_cursor();

        assert_eq!(state.cursor().row, 4);
        assert_eq!(state.cursor().col, 9);
        assert_eq!(state.current_attrs().fg, Color::GREEN);
    }

    #[test]
    fn test_ice_colors_display_bg() {
        let mut cell = Cell::default();
        cell.attrs.bg = Color::BLUE;
        cell.attrs.flags |= AttrFlags::BLINK;

        assert_eq!(cell.display_bg(true), Color::indexed(12));
        assert_eq!(cell.display_bg(false), Color::BLUE);
    }

    #[test]
    fn test_color_folding() {
        assert_eq!(Color::from_ansi256(9), Color::indexed(9));
        assert_eq!(Color::from_ansi256(196), Color::RED);
        assert_eq!(Color::from_ansi256(203), Color::indexed(9));
        assert_eq!(Color::from_ansi256(16), Color::BLACK);
        assert_eq!(Color::from_ansi256(231), Color::indexed(15));
        assert_eq!(Color::nearest_rgb(0, 0, 160), Color::BLUE);
    }

    #[test]
    fn test_reset_keeps_options() {
        let mut state = TerminalState::with_options(TerminalOptions {
            cols: 40,
            rows: 10,
            scrollback_limit: 5,
            ice_colors: true,
            newline_mode: true,
        });
        state.set_private_mode(33, false);
        write_str(&mut state, "junk");
        state.reset();

        assert!(state.modes().ice_colors);
        assert!(state.modes().linefeed_newline);
        assert_eq!(state.cols(), 40);
        assert_eq!(state.screen().row(0).map(Row::text), Some(String::new()));
    }

    #[test]
    fn test_wide_char_takes_two_cells() {
        let mut state = TerminalState::new(10, 2);
        write_str(&mut state, "a中b");

        assert_eq!(state.cursor().col, 4);
        assert!(state.screen().cell(0, 1).is_some_and(Cell::is_wide));
        assert!(state.screen().cell(0, 2).is_some_and(Cell::is_continuation));
        assert_eq!(state.screen().cell(0, 3).map(|c| c.ch), Some('b'));
        assert_eq!(state.snapshot().line(0), Some("a中b".to_string()));
    }

    #[test]
    fn test_wide_char_wraps_instead_of_splitting() {
        let mut state = TerminalState::new(4, 2);
        write_str(&mut state, "abc中");

        assert_eq!(state.screen().row(0).map(Row::text), Some("abc".to_string()));
        assert!(state.screen().cell(1, 0).is_some_and(Cell::is_wide));
        assert_eq!((state.cursor().row, state.cursor().col), (1, 2));
    }

    #[test]
    fn test_wide_char_filling_last_columns_defers_wrap() {
        let mut state = TerminalState::new(4, 2);
        write_str(&mut state, "ab中");

        assert_eq!((state.cursor().row, state.cursor().col), (0, 3));
        assert!(state.cursor().pending_wrap);
        write_str(&mut state, "x");
        assert_eq!(state.screen().cell(1, 0).map(|c| c.ch), Some('x'));
    }

    #[test]
    fn test_overwriting_half_of_wide_char_blanks_the_other() {
        let mut state = TerminalState::new(10, 1);
        write_str(&mut state, "中文");
        state.set_column(2);
        write_str(&mut state, "x");

        let row = state.screen().row(0).cloned().unwrap_or_else(|| Row::new(10));
        assert_eq!(row.cells[0], Cell::default());
        assert_eq!(row.cells[1].ch, 'x');
        assert!(row.cells[2].is_wide());
        assert_eq!(row.text(), " x文");
    }
}
