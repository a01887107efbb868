//! Configuration and colour palette management for twterm.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.twterm/config.toml`
//! - The built-in 16-colour palettes used to render cell colour indices
//!
//! # Configuration File
//!
//! ```toml
//! log_level = "info"
//! # Palette: syncterm, vga
//! palette = "syncterm"
//!
//! [connection]
//! host = "localhost"
//! port = 23
//! connect_timeout_secs = 30
//!
//! [terminal]
//! cols = 80
//! rows = 24
//! scrollback = 1000
//! ice_colors = true
//! newline_mode = true
//!
//! [telnet]
//! # binary, echo, sga, ttype, naws
//! options = ["binary", "echo", "sga"]
//! terminal_type = "ANSI"
//!
//! [display]
//! frame_rate = 60
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::core::telnet::TelnetPolicy;
use crate::core::term::{TerminalOptions, DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_SCROLLBACK};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[source] toml::ser::Error),
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fallback tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Palette name
    pub palette: String,
    pub connection: ConnectionConfig,
    pub terminal: TerminalConfig,
    pub telnet: TelnetConfig,
    pub display: DisplayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            palette: "syncterm".to_string(),
            connection: ConnectionConfig::default(),
            terminal: TerminalConfig::default(),
            telnet: TelnetConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

/// Remote host settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 23,
            connect_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// Emulator settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
    pub scrollback: usize,
    /// Blink bit selects a bright background instead of blinking
    pub ice_colors: bool,
    /// Enter sends CR LF
    pub newline_mode: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            scrollback: DEFAULT_SCROLLBACK,
            ice_colors: true,
            newline_mode: true,
        }
    }
}

/// Telnet negotiation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub options: Vec<String>,
    pub terminal_type: String,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            options: vec!["binary".to_string(), "echo".to_string(), "sga".to_string()],
            terminal_type: "ANSI".to_string(),
        }
    }
}

/// Renderer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub frame_rate: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self { frame_rate: 60 }
    }
}

impl DisplayConfig {
    /// Minimum time between two redraws
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.frame_rate.clamp(1, 240)
    }
}

impl Config {
    /// Load configuration from the default location. A missing file gives
    /// defaults; an unreadable one is logged and also gives defaults.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("{}; using defaults", e);
                Self::default()
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `~/.twterm`
    pub fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".twterm"))
    }

    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn log_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("twterm.log"))
    }

    pub fn terminal_options(&self) -> TerminalOptions {
        TerminalOptions {
            cols: self.terminal.cols.max(1),
            rows: self.terminal.rows.max(1),
            scrollback_limit: self.terminal.scrollback,
            ice_colors: self.terminal.ice_colors,
            newline_mode: self.terminal.newline_mode,
        }
    }

    pub fn telnet_policy(&self) -> TelnetPolicy {
        TelnetPolicy::from_names(&self.telnet.options, &self.telnet.terminal_type)
    }

    pub fn get_palette(&self) -> Palette {
        Palette::by_name(&self.palette)
    }
}

/// Color definition (RGB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Convert to crossterm Color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        crossterm::style::Color::Rgb {
            r: self.r,
            g: self.g,
            b: self.b,
        }
    }
}

/// RGB values for the 16 cell colour indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Palette {
    pub name: &'static str,
    pub colors: [Rgb; 16],
}

impl Default for Palette {
    fn default() -> Self {
        Self::syncterm()
    }
}

impl Palette {
    /// SyncTERM's palette, the usual reference for ANSI art
    pub fn syncterm() -> Self {
        Self {
            name: "syncterm",
            colors: [
                Rgb::new(0, 0, 0),
                Rgb::new(168, 0, 0),
                Rgb::new(0, 168, 0),
                Rgb::new(168, 84, 0),
                Rgb::new(0, 0, 168),
                Rgb::new(168, 0, 168),
                Rgb::new(0, 168, 168),
                Rgb::new(168, 168, 168),
                Rgb::new(84, 84, 84),
                Rgb::new(255, 84, 84),
                Rgb::new(84, 255, 84),
                Rgb::new(255, 255, 84),
                Rgb::new(84, 84, 255),
                Rgb::new(255, 84, 255),
                Rgb::new(84, 255, 255),
                Rgb::new(255, 255, 255),
            ],
        }
    }

    /// IBM VGA text-mode palette
    pub fn vga() -> Self {
        Self {
            name: "vga",
            colors: [
                Rgb::new(0, 0, 0),
                Rgb::new(170, 0, 0),
                Rgb::new(0, 170, 0),
                Rgb::new(170, 85, 0),
                Rgb::new(0, 0, 170),
                Rgb::new(170, 0, 170),
                Rgb::new(0, 170, 170),
                Rgb::new(170, 170, 170),
                Rgb::new(85, 85, 85),
                Rgb::new(255, 85, 85),
                Rgb::new(85, 255, 85),
                Rgb::new(255, 255, 85),
                Rgb::new(85, 85, 255),
                Rgb::new(255, 85, 255),
                Rgb::new(85, 255, 255),
                Rgb::new(255, 255, 255),
            ],
        }
    }

    /// Get palette by name, falling back to SyncTERM
    pub fn by_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "vga" | "ibm" => Self::vga(),
            "syncterm" => Self::syncterm(),
            other => {
                warn!("unknown palette {:?}, using syncterm", other);
                Self::syncterm()
            }
        }
    }

    /// List available palettes
    pub fn list() -> Vec<&'static str> {
        vec!["syncterm", "vga"]
    }

    pub fn get(&self, index: crate::core::term::Color) -> Rgb {
        self.colors[index.index() as usize & 0x0F]
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telnet::{opt, Side};
    use crate::core::term::Color;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            palette = "vga"

            [connection]
            host = "bbs.example.org"

            [terminal]
            ice_colors = false
            "#,
        )
        .unwrap();

        assert_eq!(config.connection.host, "bbs.example.org");
        assert_eq!(config.connection.port, 23);
        assert_eq!(config.terminal.cols, 80);
        assert!(!config.terminal.ice_colors);
        assert!(config.terminal.newline_mode);
        assert_eq!(config.get_palette().name, "vga");
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("twterm-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = Config::default();
        config.telnet.options.push("naws".to_string());
        config.display.frame_rate = 30;

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("twterm-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "port = \"twenty-three\"\n[terminal\n").unwrap();

        let result = Config::load_from(&path);
        let _ = fs::remove_dir_all(&dir);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_terminal_options_and_policy() {
        let mut config = Config::default();
        config.terminal.rows = 0;
        config.telnet.options = vec!["sga".to_string(), "ttype".to_string()];

        let options = config.terminal_options();
        assert_eq!(options.rows, 1);
        assert!(options.newline_mode);

        let policy = config.telnet_policy();
        assert!(policy.supports(Side::Local, opt::TTYPE));
        assert!(!policy.supports(Side::Remote, opt::ECHO));
    }

    #[test]
    fn test_frame_interval() {
        let display = DisplayConfig { frame_rate: 50 };
        assert_eq!(display.frame_interval(), Duration::from_millis(20));
        assert_eq!(
            DisplayConfig { frame_rate: 0 }.frame_interval(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_palette_lookup() {
        let palette = Palette::by_name("SyncTERM");
        assert_eq!(palette.get(Color::YELLOW), Rgb::new(168, 84, 0));
        assert_eq!(palette.get(Color::indexed(15)), Rgb::new(255, 255, 255));
        assert_eq!(Palette::by_name("nope").name, "syncterm");
    }

    #[test]
    fn test_listed_palettes_resolve_to_themselves() {
        for name in Palette::list() {
            assert_eq!(Palette::by_name(name).name, name);
        }
    }
}
