//! VT320/ANSI terminal emulation: escape sequence parser, screen model and
//! read-only snapshots.

mod parser;
mod snapshot;
mod state;

pub use parser::{Response, VtParser};
pub use snapshot::{CursorSnapshot, Snapshot};
pub use state::{
    AttrFlags, Cell, CellAttrs, Color, CursorState, MouseTracking, Row, ScreenBuffer,
    TerminalModes, TerminalOptions, TerminalState, DEFAULT_COLS, DEFAULT_ROWS,
    DEFAULT_SCROLLBACK,
};
