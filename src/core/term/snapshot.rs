//! Read-only copies of the screen handed to renderers and tests

use super::state::{Cell, TerminalModes};

/// Cursor position at the time of the snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub row: u16,
    pub col: u16,
    pub visible: bool,
}

/// Immutable copy of the visible grid.
///
/// `cells` is row-major and always holds exactly `cols * rows` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub cols: u16,
    pub rows: u16,
    pub cells: Vec<Cell>,
    pub cursor: CursorSnapshot,
    pub modes: TerminalModes,
    pub title: String,
    pub scrollback_len: usize,
    /// Screen version this copy was taken at
    pub version: u64,
}

impl Snapshot {
    pub fn cell(&self, row: u16, col: u16) -> Option<&Cell> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.cells.get(row as usize * self.cols as usize + col as usize)
    }

    pub fn row(&self, row: u16) -> Option<&[Cell]> {
        if row >= self.rows {
            return None;
        }
        let start = row as usize * self.cols as usize;
        self.cells.get(start..start + self.cols as usize)
    }

    /// Text of one row with trailing blanks trimmed
    pub fn line(&self, row: u16) -> Option<String> {
        self.row(row).map(|cells| {
            let s: String = cells
                .iter()
                .filter(|c| !c.is_continuation())
                .map(|c| c.ch)
                .collect();
            s.trim_end().to_string()
        })
    }

    /// Every row as text, top to bottom
    pub fn display(&self) -> Vec<String> {
        (0..self.rows).filter_map(|r| self.line(r)).collect()
    }
}
