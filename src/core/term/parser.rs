//! VT sequence parser
//!
//! Parses ANSI/VT320 escape sequences and updates terminal state.
//!
//! The parser consumes already-decoded characters. Its state survives between
//! calls, so a sequence may be split anywhere across network reads. Anything
//! unexpected inside a sequence aborts it back to ground without applying
//! partial effects.

use tracing::{debug, trace};

use super::state::{AttrFlags, Color, TerminalState};

/// Upper bound on collected CSI parameters; extras are dropped
const MAX_PARAMS: usize = 16;
/// Upper bound on a collected OSC payload
const MAX_OSC_LEN: usize = 1024;

/// Response that needs to be sent back to the remote host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Cursor position report: ESC [ row ; col R
    CursorPosition(u16, u16),
    /// Operating status report: ESC [ 0 n
    StatusOk,
    /// Primary device attributes response
    DeviceAttributes,
    /// Secondary device attributes response
    SecondaryDeviceAttributes,
}

impl Response {
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::CursorPosition(row, col) => format!("\x1b[{};{}R", row, col).into_bytes(),
            Response::StatusOk => b"\x1b[0n".to_vec(),
            // VT100 with no options; what BBS door software asks for
            Response::DeviceAttributes => b"\x1b[?1;0c".to_vec(),
            Response::SecondaryDeviceAttributes => b"\x1b[>0;10;0c".to_vec(),
        }
    }
}

/// Parser state machine
#[derive(Debug, Clone)]
pub struct VtParser {
    state: ParserState,
    params: Vec<u16>,
    intermediates: Vec<char>,
    current_param: Option<u16>,
    osc_string: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    Ground,
    Escape,
    EscapeIntermediate,
    CsiEntry,
    CsiParam,
    CsiIntermediate,
    OscString,
    EscapeInOsc, // ESC received within OSC, waiting for backslash
    /// DCS, SOS, PM and APC payloads are consumed without effect
    IgnoreString,
    EscapeInIgnore,
}

impl Default for VtParser {
    fn default() -> Self {
        Self::new()
    }
}

impl VtParser {
    pub fn new() -> Self {
        Self {
            state: ParserState::Ground,
            params: Vec::with_capacity(MAX_PARAMS),
            intermediates: Vec::with_capacity(4),
            current_param: None,
            osc_string: String::new(),
        }
    }

    /// True when no sequence is in progress
    pub fn is_ground(&self) -> bool {
        self.state == ParserState::Ground
    }

    /// Drop any partially received sequence
    pub fn reset(&mut self) {
        self.state = ParserState::Ground;
        self.clear_sequence();
        self.osc_string.clear();
    }

    /// Feed a single character to the parser
    pub fn feed(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match self.state {
            ParserState::OscString => return self.osc_string_state(ch, state),
            ParserState::EscapeInOsc => return self.escape_in_osc(ch, state),
            ParserState::IgnoreString => return self.ignore_string(ch),
            ParserState::EscapeInIgnore => return self.escape_in_ignore(ch, state),
            _ => {}
        }

        // C0 controls act immediately, even in the middle of a sequence
        if (ch as u32) < 0x20 {
            self.execute_c0(ch, state);
            return None;
        }

        match self.state {
            ParserState::Ground => self.ground(ch, state),
            ParserState::Escape => self.escape(ch, state),
            ParserState::EscapeIntermediate => self.escape_intermediate(ch),
            ParserState::CsiEntry => self.csi_entry(ch, state),
            ParserState::CsiParam => self.csi_param(ch, state),
            ParserState::CsiIntermediate => self.csi_intermediate(ch, state),
            ParserState::OscString
            | ParserState::EscapeInOsc
            | ParserState::IgnoreString
            | ParserState::EscapeInIgnore => None,
        }
    }

    fn execute_c0(&mut self, ch: char, state: &mut TerminalState) {
        match ch {
            '\x1b' => self.enter_escape(),
            // CAN and SUB cancel the sequence in progress
            '\x18' | '\x1a' => self.abort(ch),
            '\x07' => {} // BEL
            '\x08' => state.backspace(),
            '\t' => state.horizontal_tab(),
            '\n' | '\x0b' | '\x0c' => {
                // LNM: a received line feed also returns the carriage
                if state.modes().linefeed_newline {
                    state.carriage_return();
                }
                state.linefeed();
            }
            '\r' => state.carriage_return(),
            _ => trace!("ignoring C0 {:#04x}", ch as u32),
        }
    }

    fn abort(&mut self, ch: char) {
        if self.state != ParserState::Ground {
            debug!("aborting sequence in {:?} on {:?}", self.state, ch);
        }
        self.state = ParserState::Ground;
        self.clear_sequence();
    }

    fn clear_sequence(&mut self) {
        self.params.clear();
        self.intermediates.clear();
        self.current_param = None;
    }

    /// Handle ESC received within OSC sequence
    fn escape_in_osc(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        // ST (ESC \) or the start of a new sequence; either way the OSC is over
        self.execute_osc(state);
        self.state = ParserState::Ground;
        if ch == '\\' {
            return None;
        }
        self.enter_escape();
        self.feed(ch, state)
    }

    fn escape_in_ignore(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;
        if ch == '\\' {
            return None;
        }
        self.enter_escape();
        self.feed(ch, state)
    }

    fn ignore_string(&mut self, ch: char) -> Option<Response> {
        match ch {
            '\x1b' => self.state = ParserState::EscapeInIgnore,
            '\x18' | '\x1a' | '\u{9c}' => self.state = ParserState::Ground,
            _ => {}
        }
        None
    }

    fn enter_escape(&mut self) {
        self.state = ParserState::Escape;
        self.clear_sequence();
    }

    fn ground(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '\x7f' => {}                       // DEL
            '\u{80}'..='\u{9f}' => trace!("ignoring C1 {:#04x}", ch as u32),
            _ => state.put_char(ch),
        }
        None
    }

    fn escape(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;
        match ch {
            '[' => {
                self.state = ParserState::CsiEntry;
                self.clear_sequence();
            }
            ']' => {
                self.state = ParserState::OscString;
                self.osc_string.clear();
            }
            'P' | 'X' | '^' | '_' => {
                // DCS, SOS, PM, APC
                self.state = ParserState::IgnoreString;
            }
            '7' => state.save_cursor(),    // DECSC
            '8' => state.restore_cursor(), // DECRC
            'D' => state.index(),          // IND
            'E' => state.next_line(),      // NEL
            'M' => state.reverse_index(),  // RI
            'c' => state.reset(),          // RIS
            '=' | '>' => {}                // keypad modes
            '\x20'..='\x2f' => {
                self.intermediates.push(ch);
                self.state = ParserState::EscapeIntermediate;
            }
            _ => debug!("unknown ESC {:?}", ch),
        }
        None
    }

    fn escape_intermediate(&mut self, ch: char) -> Option<Response> {
        match ch {
            '\x20'..='\x2f' => {
                if self.intermediates.len() < 4 {
                    self.intermediates.push(ch);
                }
            }
            '\x30'..='\x7e' => {
                // Charset designations; the cell model has one character set
                trace!("ignoring ESC {:?} {:?}", self.intermediates, ch);
                self.state = ParserState::Ground;
            }
            _ => self.abort(ch),
        }
        None
    }

    fn push_param(&mut self, value: u16) {
        if self.params.len() < MAX_PARAMS {
            self.params.push(value);
        }
    }

    fn csi_entry(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '0'..='9' => {
                self.current_param = Some(digit(ch));
                self.state = ParserState::CsiParam;
            }
            ';' | ':' => {
                self.push_param(0);
                self.state = ParserState::CsiParam;
            }
            '?' | '>' | '=' | '<' => self.push_intermediate(ch),
            '\x20'..='\x2f' => {
                self.push_intermediate(ch);
                self.state = ParserState::CsiIntermediate;
            }
            '\x40'..='\x7e' => return self.execute_csi(ch, state),
            '\x7f' => {}
            _ => self.abort(ch),
        }
        None
    }

    fn push_intermediate(&mut self, ch: char) {
        if self.intermediates.len() < 4 {
            self.intermediates.push(ch);
        }
    }

    fn csi_param(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '0'..='9' => {
                self.current_param = Some(
                    self.current_param
                        .unwrap_or(0)
                        .saturating_mul(10)
                        .saturating_add(digit(ch)),
                );
            }
            // ':' separates SGR subparameters; treated as a plain separator
            ';' | ':' => {
                let p = self.current_param.take().unwrap_or(0);
                self.push_param(p);
            }
            '\x20'..='\x2f' => {
                if let Some(p) = self.current_param.take() {
                    self.push_param(p);
                }
                self.intermediates.push(ch);
                self.state = ParserState::CsiIntermediate;
            }
            '\x40'..='\x7e' => {
                if let Some(p) = self.current_param.take() {
                    self.push_param(p);
                }
                return self.execute_csi(ch, state);
            }
            '\x7f' => {}
            _ => self.abort(ch),
        }
        None
    }

    fn csi_intermediate(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '\x20'..='\x2f' => {
                if self.intermediates.len() < 4 {
                    self.intermediates.push(ch);
                }
            }
            '\x40'..='\x7e' => return self.execute_csi(ch, state),
            '\x7f' => {}
            _ => self.abort(ch),
        }
        None
    }

    fn osc_string_state(&mut self, ch: char, state: &mut TerminalState) -> Option<Response> {
        match ch {
            '\x07' | '\u{9c}' => {
                // BEL or 8-bit ST terminates OSC
                self.execute_osc(state);
                self.state = ParserState::Ground;
            }
            '\x1b' => self.state = ParserState::EscapeInOsc,
            '\x18' | '\x1a' => {
                self.osc_string.clear();
                self.state = ParserState::Ground;
            }
            _ if (ch as u32) < 0x20 => {}
            _ => {
                if self.osc_string.len() < MAX_OSC_LEN {
                    self.osc_string.push(ch);
                }
            }
        }
        None
    }

    fn execute_csi(&mut self, final_char: char, state: &mut TerminalState) -> Option<Response> {
        self.state = ParserState::Ground;

        let is_private = self.intermediates.contains(&'?');
        let is_gt = self.intermediates.contains(&'>');
        let has_other = self
            .intermediates
            .iter()
            .any(|&c| c != '?' && c != '>');
        let params = std::mem::take(&mut self.params);

        // Count parameter with a floor of 1
        let count = |i: usize| params.get(i).copied().unwrap_or(1).max(1);
        // Plain parameter where 0 is meaningful
        let arg = |i: usize| params.get(i).copied().unwrap_or(0);

        if has_other {
            debug!(
                "unknown CSI: intermediates={:?}, params={:?}, final={:?}",
                self.intermediates, params, final_char
            );
            self.clear_sequence();
            return None;
        }

        let response = match (is_private, is_gt, final_char) {
            // Cursor movement
            (false, false, 'A') => {
                state.cursor_up(count(0));
                None
            }
            (false, false, 'B') | (false, false, 'e') => {
                state.cursor_down(count(0));
                None
            }
            (false, false, 'C') | (false, false, 'a') => {
                state.cursor_forward(count(0));
                None
            }
            (false, false, 'D') => {
                state.cursor_backward(count(0));
                None
            }
            (false, false, 'E') => {
                // CNL - Cursor Next Line
                state.cursor_down(count(0));
                state.carriage_return();
                None
            }
            (false, false, 'F') => {
                // CPL - Cursor Previous Line
                state.cursor_up(count(0));
                state.carriage_return();
                None
            }
            (false, false, 'G') | (false, false, '`') => {
                // CHA - Cursor Character Absolute
                state.set_column(count(0));
                None
            }
            (false, false, 'H') | (false, false, 'f') => {
                // CUP - Cursor Position
                state.cursor_position(count(0), count(1));
                None
            }
            (false, false, 'd') => {
                // VPA - Line Position Absolute
                state.set_row(count(0));
                None
            }

            // Erase
            (false, false, 'J') => {
                state.erase_in_display(arg(0));
                None
            }
            (false, false, 'K') => {
                state.erase_in_line(arg(0));
                None
            }

            // Line operations
            (false, false, 'L') => {
                state.insert_lines(count(0));
                None
            }
            (false, false, 'M') => {
                state.delete_lines(count(0));
                None
            }

            // Character operations
            (false, false, '@') => {
                state.insert_chars(count(0));
                None
            }
            (false, false, 'P') => {
                state.delete_chars(count(0));
                None
            }
            (false, false, 'X') => {
                state.erase_chars(count(0));
                None
            }

            // Scroll
            (false, false, 'S') => {
                state.scroll_up(count(0));
                None
            }
            (false, false, 'T') => {
                state.scroll_down(count(0));
                None
            }

            // Scroll region
            (false, false, 'r') => {
                state.set_scroll_region(count(0), arg(1));
                state.cursor_position(1, 1);
                None
            }

            // SGR - Select Graphic Rendition
            (false, false, 'm') => {
                execute_sgr(&params, state);
                None
            }

            // Save/restore cursor
            (false, false, 's') => {
                state.save_cursor();
                None
            }
            (false, false, 'u') => {
                state.restore_cursor();
                None
            }

            // Device Status Report
            (false, false, 'n') => match arg(0) {
                5 => Some(Response::StatusOk),
                6 => {
                    let cursor = state.cursor();
                    Some(Response::CursorPosition(cursor.row + 1, cursor.col + 1))
                }
                other => {
                    debug!("unknown DSR {}", other);
                    None
                }
            },

            // Device Attributes
            (false, false, 'c') if arg(0) == 0 => Some(Response::DeviceAttributes),
            (false, true, 'c') if arg(0) == 0 => Some(Response::SecondaryDeviceAttributes),

            // Private modes (DEC)
            (true, false, 'h') | (true, false, 'l') => {
                for &p in &params {
                    state.set_private_mode(p, final_char == 'h');
                }
                None
            }

            // Standard modes
            (false, false, 'h') | (false, false, 'l') => {
                for &p in &params {
                    state.set_ansi_mode(p, final_char == 'h');
                }
                None
            }

            _ => {
                debug!(
                    "unknown CSI: intermediates={:?}, params={:?}, final={:?}",
                    self.intermediates, params, final_char
                );
                None
            }
        };

        self.params = params;
        self.clear_sequence();
        response
    }

    fn execute_osc(&mut self, state: &mut TerminalState) {
        let payload = std::mem::take(&mut self.osc_string);
        // Parse OSC: "code;text"
        match payload.split_once(';') {
            Some(("0" | "1" | "2", text)) => state.set_title(text.to_string()),
            _ => trace!("ignoring OSC {:?}", payload),
        }
    }
}

fn digit(ch: char) -> u16 {
    ch.to_digit(10).map_or(0, |d| d as u16)
}

fn execute_sgr(params: &[u16], state: &mut TerminalState) {
    if params.is_empty() {
        state.attrs_mut().reset();
        return;
    }

    let mut iter = params.iter().copied();
    while let Some(param) = iter.next() {
        let attrs = state.attrs_mut();
        match param {
            0 => attrs.reset(),
            1 => attrs.flags |= AttrFlags::BOLD,
            4 => attrs.flags |= AttrFlags::UNDERLINE,
            5 | 6 => attrs.flags |= AttrFlags::BLINK,
            7 => attrs.flags |= AttrFlags::REVERSE,

            21 | 22 => attrs.flags &= !AttrFlags::BOLD,
            24 => attrs.flags &= !AttrFlags::UNDERLINE,
            25 => attrs.flags &= !AttrFlags::BLINK,
            27 => attrs.flags &= !AttrFlags::REVERSE,

            30..=37 => attrs.fg = Color::indexed((param - 30) as u8),
            39 => attrs.fg = Color::DEFAULT_FG,
            40..=47 => attrs.bg = Color::indexed((param - 40) as u8),
            49 => attrs.bg = Color::DEFAULT_BG,
            90..=97 => attrs.fg = Color::indexed((param - 90 + 8) as u8),
            100..=107 => attrs.bg = Color::indexed((param - 100 + 8) as u8),

            38 | 48 => {
                let color = match iter.next() {
                    Some(5) => iter.next().map(|n| Color::from_ansi256(n.min(255) as u8)),
                    Some(2) => {
                        let r = iter.next().unwrap_or(0).min(255) as u8;
                        let g = iter.next().unwrap_or(0).min(255) as u8;
                        let b = iter.next().unwrap_or(0).min(255) as u8;
                        Some(Color::nearest_rgb(r, g, b))
                    }
                    _ => None,
                };
                if let Some(color) = color {
                    if param == 38 {
                        attrs.fg = color;
                    } else {
                        attrs.bg = color;
                    }
                }
            }

            _ => trace!("ignoring SGR {}", param),
        }
    }
}
