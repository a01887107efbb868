//! twterm - a telnet client for BBS-era game servers
//!
//! Connects to a telnet server and renders the remote VT320/ANSI screen in
//! the host terminal, using CP437 box art and iCE colours where the server
//! sends them.
//!
//! # Quick Start
//!
//! ```text
//! twterm bbs.example.net          # port 23
//! twterm bbs.example.net 2002     # explicit port
//! twterm --no-ice localhost 2323  # blink instead of bright backgrounds
//! ```
//!
//! Press `Ctrl+]` to disconnect and quit.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use crossterm::event::{self, Event};
use crossterm::{execute, terminal::SetTitle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use twterm::config::{Config, Palette};
use twterm::core::{Session, SessionEvent};
use twterm::ui::{KeyAction, KeyMapper, Renderer};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long to wait for terminal input per loop iteration
const POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Command line arguments
#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    cols: Option<u16>,
    rows: Option<u16>,
    ice_colors: Option<bool>,
}

impl Args {
    /// CLI values win over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.connection.host = host.clone();
        }
        if let Some(port) = self.port {
            config.connection.port = port;
        }
        if let Some(cols) = self.cols {
            config.terminal.cols = cols;
        }
        if let Some(rows) = self.rows {
            config.terminal.rows = rows;
        }
        if let Some(ice) = self.ice_colors {
            config.terminal.ice_colors = ice;
        }
    }
}

fn print_version() {
    eprintln!("twterm {}", VERSION);
}

fn print_help() {
    eprintln!("twterm {} - telnet client for BBS-era game servers", VERSION);
    eprintln!();
    eprintln!("Usage: twterm [OPTIONS] [HOST] [PORT]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>   Use this config file instead of ~/.twterm/config.toml");
    eprintln!("      --cols <N>        Terminal width (default 80)");
    eprintln!("      --rows <N>        Terminal height (default 24)");
    eprintln!("      --ice             Blink attribute selects bright backgrounds");
    eprintln!("      --no-ice          Blink attribute blinks");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys:");
    eprintln!("  Ctrl+]                Disconnect and quit");
    eprintln!();
    eprintln!("Palettes: {}", Palette::list().join(", "));
    eprintln!("Configuration: ~/.twterm/config.toml");
    eprintln!("Log file:      ~/.twterm/twterm.log (RUST_LOG overrides log_level)");
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> Result<T, String> {
    let value = value.ok_or_else(|| format!("Missing value for {}", flag))?;
    value
        .parse()
        .map_err(|_| format!("Invalid value for {}: {}", flag, value))
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut positional = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing config path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "--cols" => {
                i += 1;
                parsed.cols = Some(parse_number("--cols", args.get(i))?);
            }
            "--rows" => {
                i += 1;
                parsed.rows = Some(parse_number("--rows", args.get(i))?);
            }
            "--ice" => parsed.ice_colors = Some(true),
            "--no-ice" => parsed.ice_colors = Some(false),
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    parsed.host = positional.next();
    if let Some(port) = positional.next() {
        parsed.port = Some(parse_number("PORT", Some(&port))?);
    }
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {}", extra));
    }

    Ok(parsed)
}

/// Log to ~/.twterm/twterm.log; the console belongs to the remote screen
fn init_logging(level: &str) {
    let log_path = Config::log_path().unwrap_or_else(|| PathBuf::from("twterm.log"));
    if let Some(parent) = log_path.parent() {
        let _ = fs::create_dir_all(parent);
    }

    let Ok(file) = OpenOptions::new().create(true).append(true).open(&log_path) else {
        return;
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let args = match parse_args(&args) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config_path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::load(),
    };
    args.apply(&mut config);

    init_logging(&config.log_level);
    info!("twterm {} starting", VERSION);

    if config.connection.host.is_empty() {
        bail!("no host given; pass one on the command line or set connection.host");
    }

    let mut session = Session::new(config.terminal_options(), config.telnet_policy());
    let host = config.connection.host.clone();
    let port = config.connection.port;

    eprintln!("Connecting to {}:{}...", host, port);
    session
        .connect(&host, port, config.connection.connect_timeout())
        .with_context(|| format!("connecting to {}:{}", host, port))?;

    let mut renderer = Renderer::new(config.get_palette());
    renderer.init().context("initializing terminal")?;

    let result = run_main_loop(&mut session, &mut renderer, &config);

    let _ = renderer.cleanup();
    session.disconnect();

    match result {
        Ok(Some(reason)) => {
            eprintln!("Connection lost: {}", reason);
            Ok(())
        }
        Ok(None) => {
            eprintln!("Connection closed.");
            Ok(())
        }
        Err(e) => {
            error!("{:#}", e);
            Err(e)
        }
    }
}

/// Pump the session and the console until the connection ends.
///
/// Returns the error text when the connection dropped uncleanly.
fn run_main_loop(
    session: &mut Session,
    renderer: &mut Renderer,
    config: &Config,
) -> anyhow::Result<Option<String>> {
    let frame_interval = config.display.frame_interval();
    let mut last_draw: Option<Instant> = None;
    let mut drawn_version: Option<u64> = None;
    let mut title = String::new();

    loop {
        for event in session.process_output() {
            match event {
                SessionEvent::Disconnected(reason) => {
                    info!("session ended: {:?}", reason);
                    return Ok(reason);
                }
                SessionEvent::Telnet(ev) => debug!("telnet: {:?}", ev),
                SessionEvent::ScreenChanged { .. } => {}
            }
        }

        let due = last_draw.map_or(true, |t| t.elapsed() >= frame_interval);
        if due && drawn_version != Some(session.version()) {
            let snapshot = session.snapshot();
            renderer.render(&snapshot).context("rendering screen")?;
            if snapshot.title != title {
                title = snapshot.title.clone();
                let _ = execute!(std::io::stdout(), SetTitle(&title));
            }
            drawn_version = Some(snapshot.version);
            last_draw = Some(Instant::now());
        }

        if !event::poll(POLL_TIMEOUT)? {
            continue;
        }

        let input = match event::read()? {
            Event::Key(key) => match KeyMapper::action(&key, session.state().modes()) {
                Some(KeyAction::Disconnect) => {
                    info!("disconnect requested");
                    return Ok(None);
                }
                Some(KeyAction::Send(bytes)) => Some(bytes),
                None => None,
            },
            Event::Mouse(mouse) => {
                let state = session.state();
                if mouse.column < state.cols() && mouse.row < state.rows() {
                    KeyMapper::encode_mouse_event(&mouse, state.modes())
                } else {
                    None
                }
            }
            Event::Paste(text) => Some(text.into_bytes()),
            Event::Resize(cols, rows) => {
                debug!("host terminal resized to {}x{}", cols, rows);
                renderer.invalidate();
                drawn_version = None;
                None
            }
            _ => None,
        };

        if let Some(bytes) = input {
            if let Err(e) = session.send_input(&bytes) {
                warn!("input dropped: {}", e);
            }
        }
        let _ = std::io::stdout().flush();
    }
}
