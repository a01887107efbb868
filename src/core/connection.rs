//! TCP transport for a telnet session
//!
//! A thin wrapper over [`TcpStream`] that maps I/O failures onto
//! [`ConnectionError`] and lets one thread block in `read` while another
//! writes or shuts the socket down.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Failed to read from connection: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to write to connection: {0}")]
    Write(#[source] io::Error),

    #[error("Connection closed by remote host")]
    Closed,

    #[error("Not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

/// An open TCP connection
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    /// Resolve `host` and connect to the first address that answers
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let target = format!("{}:{}", host, port);
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| ConnectionError::Resolve {
                host: host.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectionError::Resolve {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            });
        }

        let mut last_error = None;
        for addr in addrs {
            debug!("connecting to {}", addr);
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    info!("connected to {} ({})", target, addr);
                    return Self::from_stream(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    last_error = Some(ConnectionError::Timeout(target.clone()));
                }
                Err(source) => {
                    last_error = Some(ConnectionError::Connect {
                        addr: addr.to_string(),
                        source,
                    });
                }
            }
        }

        Err(last_error.unwrap_or(ConnectionError::NotConnected))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr().map_err(|source| ConnectionError::Connect {
            addr: "<unknown>".to_string(),
            source,
        })?;
        // Keystrokes are tiny; don't let Nagle hold them back
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Blocking read. End of stream is reported as [`ConnectionError::Closed`].
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Read(e)),
            }
        }
    }

    /// Write the whole buffer
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        (&self.stream)
            .write_all(data)
            .and_then(|_| (&self.stream).flush())
            .map_err(ConnectionError::Write)
    }

    /// Close both directions, unblocking any thread waiting in `read`
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown of {} failed: {}", self.peer, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        let conn = Connection::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 4 {
            let n = conn.read(&mut buf).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"ping");

        conn.write_all(b"pong").unwrap();
        assert_eq!(&server.join().unwrap(), b"pong");
        assert!(matches!(conn.read(&mut buf), Err(ConnectionError::Closed)));
    }

    #[test]
    fn test_refused_connection() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = Connection::connect("127.0.0.1", port, Duration::from_secs(2));
        assert!(matches!(result, Err(ConnectionError::Connect { .. })));
    }

    #[test]
    fn test_shutdown_unblocks_reader() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || listener.accept().unwrap());

        let conn = std::sync::Arc::new(
            Connection::connect("127.0.0.1", port, Duration::from_secs(2)).unwrap(),
        );
        let _peer = server.join().unwrap();

        let reader = {
            let conn = conn.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                conn.read(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(50));
        conn.shutdown();
        assert!(reader.join().unwrap().is_err());
    }
}
