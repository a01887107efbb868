//! End-to-end session tests against a loopback telnet server

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use twterm::core::telnet::{opt, TelnetPolicy, DO, IAC, SB, SE, WILL, WONT};
use twterm::core::{Connection, ConnectionError, Session, SessionEvent};
use twterm::TerminalOptions;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a one-shot server running `script` on the accepted socket
fn serve<F, T>(script: F) -> (u16, JoinHandle<T>)
where
    F: FnOnce(TcpStream) -> T + Send + 'static,
    T: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        script(stream)
    });
    (port, handle)
}

fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

fn connect(port: u16, policy: TelnetPolicy) -> Session {
    let mut session = Session::new(TerminalOptions::default(), policy);
    session
        .connect("127.0.0.1", port, Duration::from_secs(2))
        .unwrap();
    session
}

/// Pump the session until `done` holds, collecting events
fn pump_until(session: &mut Session, mut done: impl FnMut(&Session, &[SessionEvent]) -> bool) -> Vec<SessionEvent> {
    let start = Instant::now();
    let mut events = Vec::new();
    while start.elapsed() < TIMEOUT {
        events.extend(session.process_output());
        if done(session, &events) {
            return events;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out; events so far: {:?}", events);
}

fn line0_is(text: &'static str) -> impl FnMut(&Session, &[SessionEvent]) -> bool {
    move |session, _| session.snapshot().line(0).as_deref() == Some(text)
}

#[test]
fn test_unsupported_option_is_refused_and_text_rendered() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(&[IAC, DO, opt::TTYPE]).unwrap();
        stream.write_all(b"Welcome\r\n").unwrap();
        read_n(&mut stream, 3)
    });

    let mut session = connect(port, TelnetPolicy::default());
    pump_until(&mut session, line0_is("Welcome"));

    assert_eq!(server.join().unwrap(), vec![IAC, WONT, opt::TTYPE]);
    let cursor = session.snapshot().cursor;
    assert_eq!((cursor.row, cursor.col), (1, 0));
}

#[test]
fn test_terminal_type_exchange() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(&[IAC, DO, opt::TTYPE]).unwrap();
        let accepted = read_n(&mut stream, 3);
        stream.write_all(&[IAC, SB, opt::TTYPE, 1, IAC, SE]).unwrap();
        let reply = read_n(&mut stream, 10);
        stream.write_all(b"ok").unwrap();
        (accepted, reply)
    });

    let policy = TelnetPolicy::from_names(["binary", "sga", "ttype"], "ANSI");
    let mut session = connect(port, policy);
    pump_until(&mut session, line0_is("ok"));

    let (accepted, reply) = server.join().unwrap();
    assert_eq!(accepted, vec![IAC, WILL, opt::TTYPE]);
    assert_eq!(
        reply,
        vec![IAC, SB, opt::TTYPE, 0, b'A', b'N', b'S', b'I', IAC, SE]
    );
}

#[test]
fn test_cursor_query_is_answered() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(b"abc\x1b[6n").unwrap();
        let report = read_n(&mut stream, 6);
        stream.write_all(b"!").unwrap();
        report
    });

    let mut session = connect(port, TelnetPolicy::default());
    pump_until(&mut session, line0_is("abc!"));
    assert_eq!(server.join().unwrap(), b"\x1b[1;4R".to_vec());
}

#[test]
fn test_user_input_is_iac_escaped() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(b">").unwrap();
        read_n(&mut stream, 4)
    });

    let mut session = connect(port, TelnetPolicy::default());
    pump_until(&mut session, line0_is(">"));
    session.send_input(b"hi\xff").unwrap();

    assert_eq!(server.join().unwrap(), vec![b'h', b'i', IAC, IAC]);
}

#[test]
fn test_remote_close_reports_disconnect() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(b"bye").unwrap();
    });

    let mut session = connect(port, TelnetPolicy::default());
    server.join().unwrap();

    let events = pump_until(&mut session, |_, events| {
        events.iter().any(|e| matches!(e, SessionEvent::Disconnected(_)))
    });
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected(None)));
    assert!(!session.is_connected());

    // Screen survives the disconnect
    assert_eq!(session.snapshot().line(0), Some("bye".to_string()));
    assert!(matches!(
        session.send_input(b"x"),
        Err(ConnectionError::NotConnected)
    ));
}

#[test]
fn test_glyph_before_close_is_kept() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(b"bye\xc9").unwrap();
    });

    let mut session = connect(port, TelnetPolicy::default());
    server.join().unwrap();

    pump_until(&mut session, |_, events| {
        events.iter().any(|e| matches!(e, SessionEvent::Disconnected(_)))
    });
    assert_eq!(session.snapshot().line(0), Some("bye╔".to_string()));
}

#[test]
fn test_glyph_before_idle_is_shown() {
    let (port, server) = serve(|mut stream| {
        stream.write_all(b"Menu\xdb").unwrap();
        read_n(&mut stream, 1)
    });

    let mut session = connect(port, TelnetPolicy::default());
    pump_until(&mut session, line0_is("Menu█"));
    assert!(session.is_connected());

    session.send_input(b"q").unwrap();
    assert_eq!(server.join().unwrap(), b"q".to_vec());
}

#[test]
fn test_reattach_after_disconnect() {
    let (first_port, first) = serve(|mut stream| {
        stream.write_all(b"one").unwrap();
        // Wait for the client to hang up
        let mut buf = [0u8; 16];
        let _ = stream.read(&mut buf);
    });
    let mut session = connect(first_port, TelnetPolicy::default());
    pump_until(&mut session, line0_is("one"));
    session.disconnect();
    first.join().unwrap();

    let (second_port, second) = serve(|mut stream| {
        stream.write_all(b"\r\ntwo").unwrap();
        read_n(&mut stream, 1)
    });
    let stream = TcpStream::connect(("127.0.0.1", second_port)).unwrap();
    session.attach(Connection::from_stream(stream).unwrap());
    assert!(session.is_connected());

    pump_until(&mut session, |session, _| {
        session.snapshot().line(1).as_deref() == Some("two")
    });
    session.send_input(b"y").unwrap();
    assert_eq!(second.join().unwrap(), b"y".to_vec());
}

#[test]
fn test_refused_connection_is_an_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut session = Session::new(TerminalOptions::default(), TelnetPolicy::default());
    let result = session.connect("127.0.0.1", port, Duration::from_secs(2));
    assert!(result.is_err());
    assert!(!session.is_connected());
}
