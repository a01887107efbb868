//! twterm - a telnet client for BBS-era text game servers
//!
//! The library holds the terminal emulation core and its configuration; the
//! `twterm` binary adds a crossterm front end.

pub mod config;
pub mod core;
pub mod ui;

pub use crate::core::term::{Snapshot, TerminalOptions};
pub use crate::core::{Session, SessionEvent};
