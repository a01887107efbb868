//! Core terminal emulation components.
//!
//! This module contains everything between the socket and the screen model:
//!
//! - **connection**: TCP transport
//! - **telnet**: IAC filtering and option negotiation
//! - **decoder**: UTF-8 with CP437 fallback
//! - **term**: VT320/ANSI terminal state and escape sequence parser
//! - **output**: ordered outbound queue
//! - **session**: the pipeline and its I/O threads
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── Connection (reader thread, writer thread)
//! ├── TelnetFilter ──► CharDecoder ──► VtParser
//! │                                      │
//! └── TerminalState ◄────────────────────┘
//!     ├── ScreenBuffer (cell grid + scrollback)
//!     ├── Cursor (position, visibility, pending wrap)
//!     └── Modes (wrap, iCE colours, mouse reporting)
//! ```

pub mod connection;
pub mod decoder;
pub mod output;
pub mod session;
pub mod telnet;
pub mod term;

pub use connection::{Connection, ConnectionError};
pub use session::{Session, SessionEvent};
