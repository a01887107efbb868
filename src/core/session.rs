//! Session management
//!
//! Owns the inbound pipeline (telnet filter, character decoder, VT parser,
//! terminal state) and the two I/O threads of a connection.
//!
//! A reader thread blocks on the socket and forwards each chunk over a
//! channel. [`Session::process_output`] drains that channel on the caller's
//! thread and runs every chunk through the pipeline to completion before
//! looking at the next. A writer thread drains the [`OutboundQueue`] and is
//! the only code that writes to the socket. Renderers read the screen through
//! [`Session::snapshot`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionError};
use super::decoder::CharDecoder;
use super::output::{self, OutboundQueue, OutputChannel};
use super::telnet::{TelnetEvent, TelnetFilter, TelnetPolicy};
use super::term::{Response, Snapshot, TerminalOptions, TerminalState, VtParser};

const READ_BUFFER_SIZE: usize = 4096;
/// How often the writer thread checks whether it should stop
const WRITER_POLL: Duration = Duration::from_millis(100);
/// How long a partial UTF-8 sequence may wait for its next byte before it
/// is shown as CP437
const DECODER_IDLE_FLUSH: Duration = Duration::from_millis(100);

/// Session events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk changed the screen; at most one per chunk
    ScreenChanged { version: u64 },
    /// Telnet command seen on the wire
    Telnet(TelnetEvent),
    /// Connection ended. Carries the error text if it was not a clean close.
    Disconnected(Option<String>),
}

/// Messages from the reader thread
#[derive(Debug)]
enum Inbound {
    Data(Vec<u8>),
    Closed,
    Error(ConnectionError),
}

/// A telnet terminal session
pub struct Session {
    state: TerminalState,
    parser: VtParser,
    decoder: CharDecoder,
    telnet: TelnetFilter,
    /// Bumped whenever the screen may have changed
    version: u64,
    output: OutputChannel,
    /// Held here while no writer thread owns it
    queue: Option<OutboundQueue>,
    connection: Option<Arc<Connection>>,
    running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<OutboundQueue>>,
    inbound_rx: Option<Receiver<Inbound>>,
    /// Scratch buffer for decoded characters
    decoded: Vec<char>,
    /// When the decoder last received bytes while holding a partial sequence
    held_since: Option<Instant>,
}

impl Session {
    /// Create a disconnected session
    pub fn new(options: TerminalOptions, policy: TelnetPolicy) -> Self {
        let (output, queue) = output::channel();
        let telnet = TelnetFilter::new(policy, options.cols, options.rows);
        Self {
            state: TerminalState::with_options(options),
            parser: VtParser::new(),
            decoder: CharDecoder::new(),
            telnet,
            version: 0,
            output,
            queue: Some(queue),
            connection: None,
            running: Arc::new(AtomicBool::new(false)),
            reader_thread: None,
            writer_thread: None,
            inbound_rx: None,
            decoded: Vec::with_capacity(READ_BUFFER_SIZE),
            held_since: None,
        }
    }

    /// Connect to `host:port` and start the I/O threads
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<(), ConnectionError> {
        self.disconnect();
        let connection = Connection::connect(host, port, timeout)?;
        self.attach(connection);
        Ok(())
    }

    /// Start the I/O threads on an established connection
    pub fn attach(&mut self, connection: Connection) {
        self.disconnect();
        info!("session attached to {}", connection.peer_addr());

        let connection = Arc::new(connection);
        self.connection = Some(connection.clone());
        self.running.store(true, Ordering::SeqCst);

        let queue = match self.queue.take() {
            Some(queue) => queue,
            None => {
                let (output, queue) = output::channel();
                self.output = output;
                queue
            }
        };
        let stale = queue.try_drain();
        if !stale.is_empty() {
            debug!("discarding {} writes queued while disconnected", stale.len());
        }

        let (tx, rx) = mpsc::channel();
        self.inbound_rx = Some(rx);

        self.reader_thread = Some(spawn_reader(
            connection.clone(),
            self.running.clone(),
            tx.clone(),
        ));
        self.writer_thread = Some(spawn_writer(connection, self.running.clone(), queue, tx));
    }

    /// Close the connection. Unread inbound data and any partial escape
    /// sequence are dropped; bytes the decoder was holding are shown first.
    pub fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(connection) = self.connection.take() {
            // Unblocks the reader's pending read
            connection.shutdown();
            info!("disconnected from {}", connection.peer_addr());
        }
        if let Some(handle) = self.reader_thread.take() {
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
        if let Some(handle) = self.writer_thread.take() {
            match handle.join() {
                Ok(queue) => self.queue = Some(queue),
                Err(_) => warn!("writer thread panicked"),
            }
        }

        self.inbound_rx = None;
        // Bytes already received still belong on the screen
        self.flush_decoder();
        self.parser.reset();
        self.decoder.reset();
        self.telnet.reset();
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some() && self.running.load(Ordering::SeqCst)
    }

    /// Drain data received since the last call and run it through the pipeline
    pub fn process_output(&mut self) -> Vec<SessionEvent> {
        let Some(rx) = &self.inbound_rx else {
            return Vec::new();
        };

        // Collect first; a close tears down the receiver
        let mut messages = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(message) => messages.push(message),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    messages.push(Inbound::Closed);
                    break;
                }
            }
        }

        let mut events = Vec::new();
        for message in messages {
            match message {
                Inbound::Data(bytes) => events.extend(self.feed_bytes(&bytes)),
                Inbound::Closed => {
                    info!("connection closed by remote host");
                    events.extend(self.flush_decoder());
                    self.disconnect();
                    events.push(SessionEvent::Disconnected(None));
                    break;
                }
                Inbound::Error(e) => {
                    warn!("connection error: {}", e);
                    events.extend(self.flush_decoder());
                    self.disconnect();
                    events.push(SessionEvent::Disconnected(Some(e.to_string())));
                    break;
                }
            }
        }

        if self.held_since.is_some_and(|t| t.elapsed() >= DECODER_IDLE_FLUSH) {
            events.extend(self.flush_decoder());
        }
        events
    }

    /// Show bytes the decoder is holding for an unfinished UTF-8 sequence.
    ///
    /// Called when the stream goes idle or closes; returns the screen change
    /// if anything was held.
    pub fn flush_decoder(&mut self) -> Option<SessionEvent> {
        self.held_since = None;
        if !self.decoder.is_pending() {
            return None;
        }

        let mut decoded = std::mem::take(&mut self.decoded);
        decoded.clear();
        self.decoder.flush(&mut decoded);
        self.parse(&decoded);
        self.decoded = decoded;

        self.version += 1;
        Some(SessionEvent::ScreenChanged {
            version: self.version,
        })
    }

    /// Run one inbound chunk through filter, decoder and parser
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<SessionEvent> {
        let filtered = self.telnet.feed(bytes);
        if let Err(e) = self.output.send(filtered.replies) {
            debug!("dropping telnet reply: {}", e);
        }

        let mut events: Vec<SessionEvent> = filtered
            .events
            .into_iter()
            .map(SessionEvent::Telnet)
            .collect();

        if filtered.data.is_empty() {
            return events;
        }

        let mut decoded = std::mem::take(&mut self.decoded);
        decoded.clear();
        self.decoder.decode_all(&filtered.data, &mut decoded);
        self.parse(&decoded);
        self.decoded = decoded;
        self.held_since = self.decoder.is_pending().then(Instant::now);

        self.version += 1;
        events.push(SessionEvent::ScreenChanged {
            version: self.version,
        });
        events
    }

    fn parse(&mut self, chars: &[char]) {
        for &ch in chars {
            if let Some(response) = self.parser.feed(ch, &mut self.state) {
                self.send_response(response);
            }
        }
    }

    /// Send a terminal report back to the remote host
    fn send_response(&self, response: Response) {
        debug!("answering terminal query: {:?}", response);
        if let Err(e) = self.output.send(response.to_bytes()) {
            debug!("dropping terminal report: {}", e);
        }
    }

    /// Queue user input (keystrokes, mouse reports) for sending
    pub fn send_input(&self, data: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.output.send_data(data)
    }

    /// A handle other threads can submit input through
    pub fn output(&self) -> OutputChannel {
        self.output.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.state.snapshot();
        snapshot.version = self.version;
        snapshot
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &TerminalState {
        &self.state
    }

    pub fn telnet(&self) -> &TelnetFilter {
        &self.telnet
    }

    /// Resize the terminal, telling the server if it asked for window sizes
    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.state.resize(cols, rows);
        if let Some(naws) = self.telnet.set_window_size(self.state.cols(), self.state.rows()) {
            if let Err(e) = self.output.send(naws) {
                debug!("dropping window size update: {}", e);
            }
        }
        self.version += 1;
    }

    /// Full terminal reset, keeping configuration and the connection
    pub fn clear(&mut self) {
        self.parser.reset();
        self.state.reset();
        self.version += 1;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_reader(
    connection: Arc<Connection>,
    running: Arc<AtomicBool>,
    tx: Sender<Inbound>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let message = match connection.read(&mut buffer) {
                Ok(n) => Inbound::Data(buffer[..n].to_vec()),
                Err(_) if !running.load(Ordering::SeqCst) => break,
                Err(ConnectionError::Closed) => Inbound::Closed,
                Err(e) => Inbound::Error(e),
            };
            let last = !matches!(message, Inbound::Data(_));
            if tx.send(message).is_err() || last {
                break;
            }
        }
        running.store(false, Ordering::SeqCst);
    })
}

fn spawn_writer(
    connection: Arc<Connection>,
    running: Arc<AtomicBool>,
    queue: OutboundQueue,
    tx: Sender<Inbound>,
) -> JoinHandle<OutboundQueue> {
    thread::spawn(move || {
        loop {
            match queue.recv_timeout(WRITER_POLL) {
                Ok(bytes) => {
                    if let Err(e) = connection.write_all(&bytes) {
                        if running.swap(false, Ordering::SeqCst) {
                            let _ = tx.send(Inbound::Error(e));
                            connection.shutdown();
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        queue
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telnet::{opt, Command, DO, IAC, WILL};
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session::new(TerminalOptions::default(), TelnetPolicy::default())
    }

    fn queued(session: &Session) -> Vec<Vec<u8>> {
        session
            .queue
            .as_ref()
            .map(OutboundQueue::try_drain)
            .unwrap_or_default()
    }

    #[test]
    fn test_feed_updates_screen_and_version() {
        let mut session = session();
        let events = session.feed_bytes(b"Hello\r\nWorld");

        assert_eq!(events, vec![SessionEvent::ScreenChanged { version: 1 }]);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.line(0), Some("Hello".to_string()));
        assert_eq!(snapshot.line(1), Some("World".to_string()));
    }

    #[test]
    fn test_negotiation_only_chunk_does_not_change_screen() {
        let mut session = session();
        let events = session.feed_bytes(&[IAC, WILL, opt::ECHO]);

        assert_eq!(
            events,
            vec![SessionEvent::Telnet(TelnetEvent::Negotiation {
                command: Command::Will,
                option: opt::ECHO
            })]
        );
        assert_eq!(session.version(), 0);
        assert_eq!(queued(&session), vec![vec![IAC, DO, opt::ECHO]]);
    }

    #[test]
    fn test_query_replies_are_queued() {
        let mut session = session();
        session.feed_bytes(b"ab\x1b[6n\x1b[c");
        assert_eq!(
            queued(&session),
            vec![b"\x1b[1;3R".to_vec(), b"\x1b[?1;0c".to_vec()]
        );
    }

    #[test]
    fn test_iac_split_across_chunks_contributes_no_content() {
        let mut session = session();
        session.feed_bytes(&[b'A', IAC]);
        session.feed_bytes(&[WILL, opt::SGA, b'B']);
        assert_eq!(session.snapshot().line(0), Some("AB".to_string()));
    }

    #[test]
    fn test_escaped_iac_reaches_decoder() {
        let mut session = session();
        session.feed_bytes(&[IAC, IAC]);
        // 0xFF alone is CP437 non-breaking space
        assert_eq!(
            session.snapshot().cell(0, 0).map(|c| c.ch),
            Some('\u{a0}')
        );
    }

    #[test]
    fn test_cp437_art() {
        let mut session = session();
        session.feed_bytes(&[0xC9, 0xCD, b'\r', b'\n', 0xBA]);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.line(0), Some("╔═".to_string()));
        assert_eq!(snapshot.line(1), Some("║".to_string()));
    }

    #[test]
    fn test_resize_and_clear_bump_version() {
        let mut session = session();
        session.feed_bytes(b"text");
        session.resize(40, 10);
        assert_eq!(session.version(), 2);
        assert_eq!(session.snapshot().cols, 40);

        session.clear();
        assert_eq!(session.version(), 3);
        assert_eq!(session.snapshot().line(0), Some(String::new()));
    }

    #[test]
    fn test_send_input_requires_connection() {
        let session = session();
        assert!(matches!(
            session.send_input(b"x"),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_drops_partial_sequence() {
        let mut session = session();
        session.feed_bytes(b"\x1b[3");
        session.disconnect();
        session.feed_bytes(b"1mX");

        let snapshot = session.snapshot();
        assert_eq!(snapshot.line(0), Some("1mX".to_string()));
        assert_eq!(
            snapshot.cell(0, 2).map(|c| c.attrs.fg),
            Some(crate::core::term::Color::DEFAULT_FG)
        );
    }

    #[test]
    fn test_held_lead_byte_is_shown_on_flush() {
        let mut session = session();
        session.feed_bytes(b"Menu\xdb");
        assert_eq!(session.snapshot().line(0), Some("Menu".to_string()));

        assert_eq!(
            session.flush_decoder(),
            Some(SessionEvent::ScreenChanged { version: 2 })
        );
        let snapshot = session.snapshot();
        assert_eq!(snapshot.line(0), Some("Menu█".to_string()));
        assert_eq!(snapshot.cursor.col, 5);

        assert_eq!(session.flush_decoder(), None);
    }

    #[test]
    fn test_utf8_split_across_chunks_still_decodes() {
        let mut session = session();
        session.feed_bytes(b"a\xe2\x94");
        session.feed_bytes(b"\x80");
        assert_eq!(session.snapshot().line(0), Some("a─".to_string()));
        assert_eq!(session.flush_decoder(), None);
    }

    #[test]
    fn test_disconnect_keeps_held_glyph() {
        let mut session = session();
        session.feed_bytes(b"bye\xc9");
        session.disconnect();
        assert_eq!(session.snapshot().line(0), Some("bye╔".to_string()));
    }
}
