//! Telnet protocol filter
//!
//! Separates terminal content from IAC-prefixed telnet commands, answers
//! option negotiation according to a [`TelnetPolicy`], and tracks which
//! options are enabled on each side of the connection.
//!
//! The filter is a byte-level state machine whose state survives between
//! chunks, so a command split across reads (an IAC as the last byte of one
//! chunk, say) is interpreted exactly as if it had arrived whole.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const GA: u8 = 249;
pub const NOP: u8 = 241;
pub const SE: u8 = 240;

/// Telnet option codes
pub mod opt {
    pub const BINARY: u8 = 0;
    pub const ECHO: u8 = 1;
    pub const SGA: u8 = 3;
    pub const TTYPE: u8 = 24;
    pub const NAWS: u8 = 31;
}

/// TTYPE subnegotiation verbs
const TTYPE_IS: u8 = 0;
const TTYPE_SEND: u8 = 1;

/// Upper bound on a buffered subnegotiation payload
const MAX_SUBNEG_LEN: usize = 256;

/// Option negotiation verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Will,
    Wont,
    Do,
    Dont,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            WILL => Some(Command::Will),
            WONT => Some(Command::Wont),
            DO => Some(Command::Do),
            DONT => Some(Command::Dont),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Command::Will => WILL,
            Command::Wont => WONT,
            Command::Do => DO,
            Command::Dont => DONT,
        }
    }
}

/// Which end of the connection an option applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Options we perform (answered with WILL/WONT)
    Local,
    /// Options the server performs (answered with DO/DONT)
    Remote,
}

/// Side-channel events produced while filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    Negotiation { command: Command, option: u8 },
    Subnegotiation { option: u8, payload: Vec<u8> },
    /// Any other two-byte IAC command (NOP, GA, AYT, ...)
    Command(u8),
}

/// Result of filtering one chunk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filtered {
    /// Terminal content, in original order
    pub data: Vec<u8>,
    pub events: Vec<TelnetEvent>,
    /// Negotiation replies to send verbatim
    pub replies: Vec<u8>,
}

/// Which options we agree to, and on which side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelnetPolicy {
    local: HashSet<u8>,
    remote: HashSet<u8>,
    terminal_type: String,
}

impl Default for TelnetPolicy {
    fn default() -> Self {
        Self::from_names(["binary", "echo", "sga"], "ANSI")
    }
}

impl TelnetPolicy {
    /// Build a policy from option names as written in the config file.
    /// Unknown names are logged and skipped.
    pub fn from_names<I, S>(names: I, terminal_type: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self {
            local: HashSet::new(),
            remote: HashSet::new(),
            terminal_type: terminal_type.to_string(),
        };

        for name in names {
            match name.as_ref().to_ascii_lowercase().as_str() {
                "binary" => {
                    policy.local.insert(opt::BINARY);
                    policy.remote.insert(opt::BINARY);
                }
                "sga" => {
                    policy.local.insert(opt::SGA);
                    policy.remote.insert(opt::SGA);
                }
                // The server echoes; we never echo back to it
                "echo" => {
                    policy.remote.insert(opt::ECHO);
                }
                "ttype" => {
                    policy.local.insert(opt::TTYPE);
                }
                "naws" => {
                    policy.local.insert(opt::NAWS);
                }
                other => warn!("unknown telnet option {:?} in config", other),
            }
        }
        policy
    }

    pub fn supports(&self, side: Side, option: u8) -> bool {
        match side {
            Side::Local => self.local.contains(&option),
            Side::Remote => self.remote.contains(&option),
        }
    }

    pub fn terminal_type(&self) -> &str {
        &self.terminal_type
    }
}

/// Negotiated option state per direction
#[derive(Debug, Clone, Default)]
pub struct OptionState {
    local: HashMap<u8, bool>,
    remote: HashMap<u8, bool>,
}

impl OptionState {
    pub fn is_enabled(&self, side: Side, option: u8) -> bool {
        let map = match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        };
        map.get(&option).copied().unwrap_or(false)
    }

    fn set(&mut self, side: Side, option: u8, enabled: bool) {
        let map = match side {
            Side::Local => &mut self.local,
            Side::Remote => &mut self.remote,
        };
        map.insert(option, enabled);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum FilterState {
    #[default]
    Data,
    Iac,
    Negotiate(Command),
    Subneg,
    SubnegIac,
}

/// Streaming telnet filter
#[derive(Debug, Clone)]
pub struct TelnetFilter {
    state: FilterState,
    subneg: Vec<u8>,
    options: OptionState,
    policy: TelnetPolicy,
    window: (u16, u16),
}

impl TelnetFilter {
    pub fn new(policy: TelnetPolicy, cols: u16, rows: u16) -> Self {
        Self {
            state: FilterState::Data,
            subneg: Vec::new(),
            options: OptionState::default(),
            policy,
            window: (cols, rows),
        }
    }

    pub fn options(&self) -> &OptionState {
        &self.options
    }

    pub fn policy(&self) -> &TelnetPolicy {
        &self.policy
    }

    /// Forget all negotiated options and any partial command
    pub fn reset(&mut self) {
        self.state = FilterState::Data;
        self.subneg.clear();
        self.options = OptionState::default();
    }

    /// Record a new window size. Returns a NAWS update to send if the server
    /// has asked for window sizes.
    pub fn set_window_size(&mut self, cols: u16, rows: u16) -> Option<Vec<u8>> {
        self.window = (cols, rows);
        if self.options.is_enabled(Side::Local, opt::NAWS) {
            Some(naws_bytes(cols, rows))
        } else {
            None
        }
    }

    /// Filter one chunk of raw bytes
    pub fn feed(&mut self, chunk: &[u8]) -> Filtered {
        let mut out = Filtered {
            data: Vec::with_capacity(chunk.len()),
            ..Filtered::default()
        };
        for &byte in chunk {
            self.feed_byte(byte, &mut out);
        }
        out
    }

    fn feed_byte(&mut self, byte: u8, out: &mut Filtered) {
        match self.state {
            FilterState::Data => {
                if byte == IAC {
                    self.state = FilterState::Iac;
                } else {
                    out.data.push(byte);
                }
            }
            FilterState::Iac => self.after_iac(byte, out),
            FilterState::Negotiate(command) => {
                self.state = FilterState::Data;
                out.events.push(TelnetEvent::Negotiation {
                    command,
                    option: byte,
                });
                self.negotiate(command, byte, &mut out.replies);
            }
            FilterState::Subneg => {
                if byte == IAC {
                    self.state = FilterState::SubnegIac;
                } else if self.subneg.len() < MAX_SUBNEG_LEN {
                    self.subneg.push(byte);
                }
            }
            FilterState::SubnegIac => match byte {
                SE => {
                    self.state = FilterState::Data;
                    self.finish_subnegotiation(out);
                }
                IAC => {
                    self.state = FilterState::Subneg;
                    if self.subneg.len() < MAX_SUBNEG_LEN {
                        self.subneg.push(IAC);
                    }
                }
                _ => {
                    debug!("subnegotiation interrupted by IAC {}", byte);
                    self.subneg.clear();
                    self.after_iac(byte, out);
                }
            },
        }
    }

    fn after_iac(&mut self, byte: u8, out: &mut Filtered) {
        self.state = FilterState::Data;
        if let Some(command) = Command::from_byte(byte) {
            self.state = FilterState::Negotiate(command);
            return;
        }
        match byte {
            IAC => out.data.push(IAC),
            SB => {
                self.subneg.clear();
                self.state = FilterState::Subneg;
            }
            SE => trace!("stray IAC SE"),
            _ => out.events.push(TelnetEvent::Command(byte)),
        }
    }

    fn negotiate(&mut self, command: Command, option: u8, replies: &mut Vec<u8>) {
        let (side, enable) = match command {
            Command::Do => (Side::Local, true),
            Command::Dont => (Side::Local, false),
            Command::Will => (Side::Remote, true),
            Command::Wont => (Side::Remote, false),
        };
        let enabled = self.options.is_enabled(side, option);

        if !enable {
            // Only acknowledge a change; repeating ourselves would loop
            if enabled {
                self.options.set(side, option, false);
                replies.extend_from_slice(&[IAC, refuse(side).to_byte(), option]);
            }
            return;
        }

        if !self.policy.supports(side, option) {
            debug!("refusing telnet option {} ({:?})", option, side);
            replies.extend_from_slice(&[IAC, refuse(side).to_byte(), option]);
            return;
        }

        if enabled {
            return;
        }
        self.options.set(side, option, true);
        replies.extend_from_slice(&[IAC, accept(side).to_byte(), option]);
        debug!("enabled telnet option {} ({:?})", option, side);

        if side == Side::Local && option == opt::NAWS {
            replies.extend(naws_bytes(self.window.0, self.window.1));
        }
    }

    fn finish_subnegotiation(&mut self, out: &mut Filtered) {
        let buffer = std::mem::take(&mut self.subneg);
        let Some((&option, payload)) = buffer.split_first() else {
            return;
        };

        if option == opt::TTYPE
            && payload.first() == Some(&TTYPE_SEND)
            && self.options.is_enabled(Side::Local, opt::TTYPE)
        {
            out.replies.extend_from_slice(&[IAC, SB, opt::TTYPE, TTYPE_IS]);
            out.replies
                .extend(escape_iac(self.policy.terminal_type.as_bytes()));
            out.replies.extend_from_slice(&[IAC, SE]);
        }

        out.events.push(TelnetEvent::Subnegotiation {
            option,
            payload: payload.to_vec(),
        });
    }
}

fn accept(side: Side) -> Command {
    match side {
        Side::Local => Command::Will,
        Side::Remote => Command::Do,
    }
}

fn refuse(side: Side) -> Command {
    match side {
        Side::Local => Command::Wont,
        Side::Remote => Command::Dont,
    }
}

/// `IAC SB NAWS <width16> <height16> IAC SE`
pub fn naws_bytes(cols: u16, rows: u16) -> Vec<u8> {
    let mut bytes = vec![IAC, SB, opt::NAWS];
    let mut size = Vec::with_capacity(4);
    size.extend_from_slice(&cols.to_be_bytes());
    size.extend_from_slice(&rows.to_be_bytes());
    bytes.extend(escape_iac(&size));
    bytes.extend_from_slice(&[IAC, SE]);
    bytes
}

/// Double every 0xFF so it travels as data
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len());
    for &byte in data {
        escaped.push(byte);
        if byte == IAC {
            escaped.push(IAC);
        }
    }
    escaped
}
