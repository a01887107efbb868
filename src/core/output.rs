//! Output/command channel
//!
//! User input and protocol replies are queued here in submission order and
//! drained by the session's writer thread, which is the only code that
//! writes to the socket.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use super::connection::{ConnectionError, Result};
use super::telnet::escape_iac;

/// Create a connected sender/queue pair
pub fn channel() -> (OutputChannel, OutboundQueue) {
    let (tx, rx) = mpsc::channel();
    (OutputChannel { tx }, OutboundQueue { rx })
}

/// Cloneable handle for submitting outbound bytes
#[derive(Debug, Clone)]
pub struct OutputChannel {
    tx: Sender<Vec<u8>>,
}

impl OutputChannel {
    /// Queue bytes exactly as given (negotiation replies, terminal reports)
    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Ok(());
        }
        self.tx
            .send(bytes)
            .map_err(|_| ConnectionError::NotConnected)
    }

    /// Queue user data. A literal 0xFF is doubled so the server reads it as data.
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        self.send(escape_iac(data))
    }
}

/// Receiving end, owned by whoever writes to the transport
#[derive(Debug)]
pub struct OutboundQueue {
    rx: Receiver<Vec<u8>>,
}

impl OutboundQueue {
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Vec<u8>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Everything queued so far, oldest first
    pub fn try_drain(&self) -> Vec<Vec<u8>> {
        self.rx.try_iter().collect()
    }
}
