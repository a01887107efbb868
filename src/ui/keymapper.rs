//! Key mapping for terminal input
//!
//! Converts crossterm key and mouse events to the byte sequences a remote
//! VT/ANSI application expects.

use bitflags::bitflags;
use crossterm::event::{
    KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};

use crate::core::term::{MouseTracking, TerminalModes};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// What the front end should do with a key press
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyAction {
    /// Bytes for the remote side
    Send(Vec<u8>),
    /// Ctrl+] escape: drop the connection
    Disconnect,
}

/// Key mapper for converting key events to bytes
pub struct KeyMapper;

impl KeyMapper {
    /// Decide what a key event means. Key releases and unmapped keys yield `None`.
    pub fn action(event: &KeyEvent, modes: &TerminalModes) -> Option<KeyAction> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        if Self::is_escape_key(event) {
            return Some(KeyAction::Disconnect);
        }
        Self::map(event, modes).map(KeyAction::Send)
    }

    /// The telnet escape character, Ctrl+]
    pub fn is_escape_key(event: &KeyEvent) -> bool {
        let mods = Modifiers::from(event.modifiers);
        matches!(event.code, KeyCode::Char(']') | KeyCode::Char('5'))
            && mods == Modifiers::CTRL
    }

    /// Map a crossterm KeyEvent to bytes
    pub fn map(event: &KeyEvent, modes: &TerminalModes) -> Option<Vec<u8>> {
        let mods = Modifiers::from(event.modifiers);

        match event.code {
            KeyCode::Char(ch) => Some(Self::map_char(ch, mods)),

            KeyCode::Enter => {
                if modes.linefeed_newline {
                    Some(vec![0x0D, 0x0A])
                } else {
                    Some(vec![0x0D])
                }
            }

            // BBS software expects BS, not DEL
            KeyCode::Backspace => {
                if mods.contains(Modifiers::ALT) {
                    Some(vec![0x1B, 0x08])
                } else {
                    Some(vec![0x08])
                }
            }

            KeyCode::Tab => Some(vec![0x09]),
            KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),

            KeyCode::Esc => Some(vec![0x1B]),

            // Arrow keys
            KeyCode::Up => Some(Self::arrow_key(b'A', mods, modes)),
            KeyCode::Down => Some(Self::arrow_key(b'B', mods, modes)),
            KeyCode::Right => Some(Self::arrow_key(b'C', mods, modes)),
            KeyCode::Left => Some(Self::arrow_key(b'D', mods, modes)),

            // Navigation keys
            KeyCode::Home => Some(Self::special_key(b'H', mods)),
            KeyCode::End => Some(Self::special_key(b'F', mods)),
            KeyCode::PageUp => Some(Self::tilde_key(5, mods)),
            KeyCode::PageDown => Some(Self::tilde_key(6, mods)),
            KeyCode::Insert => Some(Self::tilde_key(2, mods)),
            KeyCode::Delete => Some(Self::tilde_key(3, mods)),

            KeyCode::F(n) => Self::function_key(n, mods),

            _ => None,
        }
    }

    /// Map a character with modifiers
    fn map_char(ch: char, mods: Modifiers) -> Vec<u8> {
        let ctrl = mods.contains(Modifiers::CTRL);
        let alt = mods.contains(Modifiers::ALT);

        if ctrl {
            if let Some(code) = Self::control_code(ch) {
                return if alt { vec![0x1B, code] } else { vec![code] };
            }
        }

        let mut bytes = Vec::with_capacity(5);
        if alt {
            bytes.push(0x1B);
        }
        let mut buf = [0u8; 4];
        bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        bytes
    }

    /// C0 code produced by Ctrl + `ch`
    fn control_code(ch: char) -> Option<u8> {
        match ch {
            'a'..='z' => Some(ch as u8 - b'a' + 1),
            'A'..='Z' => Some(ch as u8 - b'A' + 1),
            '@' | '`' | ' ' | '2' => Some(0x00),
            '[' | '3' => Some(0x1B),
            '\\' | '4' => Some(0x1C),
            ']' | '5' => Some(0x1D),
            '^' | '~' | '6' => Some(0x1E),
            '_' | '?' | '7' => Some(0x1F),
            _ => None,
        }
    }

    /// Arrow key sequence
    fn arrow_key(key: u8, mods: Modifiers, modes: &TerminalModes) -> Vec<u8> {
        if !mods.is_empty() {
            let mod_code = Self::modifier_code(mods);
            format!("\x1b[1;{}{}", mod_code, key as char).into_bytes()
        } else if modes.application_cursor {
            vec![0x1B, b'O', key]
        } else {
            vec![0x1B, b'[', key]
        }
    }

    /// Special key (Home, End) sequence
    fn special_key(key: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            vec![0x1B, b'[', key]
        } else {
            let mod_code = Self::modifier_code(mods);
            format!("\x1b[1;{}{}", mod_code, key as char).into_bytes()
        }
    }

    /// Tilde key sequence (PageUp, PageDown, Insert, Delete)
    fn tilde_key(code: u8, mods: Modifiers) -> Vec<u8> {
        if mods.is_empty() {
            format!("\x1b[{}~", code).into_bytes()
        } else {
            let mod_code = Self::modifier_code(mods);
            format!("\x1b[{};{}~", code, mod_code).into_bytes()
        }
    }

    /// Function key sequence, F1-F12
    fn function_key(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
        let seq = match n {
            1..=4 => {
                let key = b"PQRS"[(n - 1) as usize] as char;
                if mods.is_empty() {
                    format!("\x1bO{}", key)
                } else {
                    format!("\x1b[1;{}{}", Self::modifier_code(mods), key)
                }
            }
            5..=12 => {
                let code = [15, 17, 18, 19, 20, 21, 23, 24][(n - 5) as usize];
                if mods.is_empty() {
                    format!("\x1b[{}~", code)
                } else {
                    format!("\x1b[{};{}~", code, Self::modifier_code(mods))
                }
            }
            _ => return None,
        };
        Some(seq.into_bytes())
    }

    /// Calculate xterm modifier code
    fn modifier_code(mods: Modifiers) -> u8 {
        1 + if mods.contains(Modifiers::SHIFT) { 1 } else { 0 }
            + if mods.contains(Modifiers::ALT) { 2 } else { 0 }
            + if mods.contains(Modifiers::CTRL) { 4 } else { 0 }
    }

    /// Encode a mouse event as an SGR (`?1006`) report.
    ///
    /// Returns `None` when the remote has not asked for SGR mouse reports, or
    /// when the event kind is outside the requested tracking level.
    pub fn encode_mouse_event(event: &MouseEvent, modes: &TerminalModes) -> Option<Vec<u8>> {
        if !modes.sgr_mouse_reporting() {
            return None;
        }

        let (button, pressed) = match event.kind {
            MouseEventKind::Down(btn) => (Self::mouse_button_code(btn), true),
            MouseEventKind::Up(btn) => (Self::mouse_button_code(btn), false),
            MouseEventKind::Drag(btn) => {
                if modes.mouse_tracking == MouseTracking::Click {
                    return None;
                }
                (Self::mouse_button_code(btn) + 32, true)
            }
            MouseEventKind::Moved => {
                if modes.mouse_tracking != MouseTracking::Motion {
                    return None;
                }
                (35, true)
            }
            MouseEventKind::ScrollUp => (64, true),
            MouseEventKind::ScrollDown => (65, true),
            MouseEventKind::ScrollLeft => (66, true),
            MouseEventKind::ScrollRight => (67, true),
        };

        let mut cb = button;
        if event.modifiers.contains(KeyModifiers::SHIFT) {
            cb += 4;
        }
        if event.modifiers.contains(KeyModifiers::ALT) {
            cb += 8;
        }
        if event.modifiers.contains(KeyModifiers::CONTROL) {
            cb += 16;
        }

        // 1-based coordinates
        let x = event.column.saturating_add(1);
        let y = event.row.saturating_add(1);
        let suffix = if pressed { 'M' } else { 'm' };
        Some(format!("\x1b[<{};{};{}{}", cb, x, y, suffix).into_bytes())
    }

    fn mouse_button_code(button: MouseButton) -> u8 {
        match button {
            MouseButton::Left => 0,
            MouseButton::Middle => 1,
            MouseButton::Right => 2,
        }
    }
}
