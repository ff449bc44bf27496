//! Per-socket I/O state
//!
//! A tunnel endpoint is modeled as two small state machines, one for
//! reading and one for writing. Each is, when active, in one of three
//! states: busy, done or stop:
//!
//! ```text
//!              busy                        done              stop
//!  readable  | waiting for incoming data | have incoming data | idle |
//!  writable  | busy writing out data     | completed write    | idle |
//! ```
//!
//! Reads are discrete rather than continuous: when a read completes, the
//! socket stops reading until it is re-armed, because the receive buffer
//! is reused. The arming methods here only record intent; the driver
//! performs the actual I/O and records completions, and the stage machine
//! latches `done` back to `stop` when it consumes the event.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;

use veiltunnel_core::SSR_BUFF_SIZE;

/// Which endpoint of the tunnel a socket is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Toward the SOCKS client
    Incoming,
    /// Toward the forwarding server
    Outgoing,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Incoming => Side::Outgoing,
            Side::Outgoing => Side::Incoming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    Busy,
    Done,
    Stop,
}

/// An in-flight write. The source buffer stays owned here, valid and
/// immutable, until the completion is recorded.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub buf: Bytes,
    pub written: usize,
}

pub struct SocketCtx {
    pub side: Side,
    pub rdstate: SockState,
    pub wrstate: SockState,
    /// Outcome of the most recent completion: bytes read for reads,
    /// bytes flushed for writes, `Ok(0)` for connects and resolves.
    pub result: io::Result<usize>,
    /// Receive buffer; a completed read's payload is `buf[..n]`.
    pub buf: Vec<u8>,
    /// Peer address, populated by resolution or taken from config.
    pub addr: Option<SocketAddr>,
    pub(crate) pending_read: Option<bool>,
    pub(crate) pending_write: Option<PendingWrite>,
    pub(crate) pending_connect: bool,
    pub(crate) pending_resolve: Option<String>,
}

impl SocketCtx {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            rdstate: SockState::Stop,
            wrstate: SockState::Stop,
            result: Ok(0),
            buf: vec![0u8; SSR_BUFF_SIZE],
            addr: None,
            pending_read: None,
            pending_write: None,
            pending_connect: false,
            pending_resolve: None,
        }
    }

    /// Arm a single read. `allow_partial` is advisory: reads are discrete
    /// and deliver whatever the transport has in either mode.
    pub fn read(&mut self, allow_partial: bool) {
        assert!(
            self.pending_read.is_none() && self.rdstate != SockState::Busy,
            "{:?}: read already in flight",
            self.side
        );
        self.rdstate = SockState::Busy;
        self.pending_read = Some(allow_partial);
    }

    /// Arm a single write of `data`.
    pub fn write(&mut self, data: impl Into<Bytes>) {
        assert!(
            self.pending_write.is_none() && self.wrstate != SockState::Busy,
            "{:?}: write already in flight",
            self.side
        );
        self.wrstate = SockState::Busy;
        self.pending_write = Some(PendingWrite {
            buf: data.into(),
            written: 0,
        });
    }

    /// Arm a TCP connect toward `self.addr`.
    pub fn connect(&mut self) {
        assert!(self.addr.is_some(), "connect armed without an address");
        assert!(!self.pending_connect, "connect already in flight");
        self.pending_connect = true;
    }

    /// Arm a DNS lookup for `host`; the result lands in `self.addr`.
    pub fn resolve(&mut self, host: impl Into<String>) {
        assert!(self.pending_resolve.is_none(), "resolve already in flight");
        self.pending_resolve = Some(host.into());
    }

    /// Record a read completion. Called by the driver (or a test harness)
    /// right before re-entering the stage machine.
    pub(crate) fn complete_read(&mut self, result: io::Result<usize>) {
        debug_assert_eq!(self.rdstate, SockState::Busy);
        self.pending_read = None;
        self.rdstate = SockState::Done;
        self.result = result;
    }

    /// Record a write completion.
    pub(crate) fn complete_write(&mut self, result: io::Result<usize>) {
        debug_assert_eq!(self.wrstate, SockState::Busy);
        self.pending_write = None;
        self.wrstate = SockState::Done;
        self.result = result;
    }

    /// Record a connect completion. Connects do not use the rd/wr state
    /// machines; the stage itself knows a connect was in flight.
    pub(crate) fn complete_connect(&mut self, result: io::Result<usize>) {
        debug_assert!(self.pending_connect);
        self.pending_connect = false;
        self.result = result;
    }

    /// Record a resolve completion; `addr` holds the answer on success.
    pub(crate) fn complete_resolve(&mut self, result: io::Result<usize>) {
        debug_assert!(self.pending_resolve.is_some());
        self.pending_resolve = None;
        self.result = result;
    }

    /// Payload of the most recent completed read.
    pub fn payload(&self) -> &[u8] {
        let nread = match &self.result {
            Ok(n) => *n,
            Err(_) => 0,
        };
        &self.buf[..nread]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_idle() {
        let sock = SocketCtx::new(Side::Incoming);
        assert_eq!(sock.rdstate, SockState::Stop);
        assert_eq!(sock.wrstate, SockState::Stop);
        assert_eq!(sock.buf.len(), SSR_BUFF_SIZE);
    }

    #[test]
    fn test_read_write_independent() {
        let mut sock = SocketCtx::new(Side::Incoming);
        sock.read(true);
        sock.write(vec![1, 2, 3]);
        assert_eq!(sock.rdstate, SockState::Busy);
        assert_eq!(sock.wrstate, SockState::Busy);
    }

    #[test]
    fn test_completion_latches_done() {
        let mut sock = SocketCtx::new(Side::Outgoing);
        sock.read(true);
        sock.complete_read(Ok(5));
        assert_eq!(sock.rdstate, SockState::Done);
        assert!(sock.pending_read.is_none());
    }

    #[test]
    fn test_payload_window() {
        let mut sock = SocketCtx::new(Side::Incoming);
        sock.buf[..3].copy_from_slice(b"abc");
        sock.read(true);
        sock.complete_read(Ok(3));
        assert_eq!(sock.payload(), b"abc");
    }

    #[test]
    #[should_panic(expected = "read already in flight")]
    fn test_double_read_panics() {
        let mut sock = SocketCtx::new(Side::Incoming);
        sock.read(true);
        sock.read(true);
    }

    #[test]
    #[should_panic(expected = "write already in flight")]
    fn test_double_write_panics() {
        let mut sock = SocketCtx::new(Side::Incoming);
        sock.write(vec![0]);
        sock.write(vec![1]);
    }

    #[test]
    #[should_panic(expected = "without an address")]
    fn test_connect_needs_address() {
        let mut sock = SocketCtx::new(Side::Outgoing);
        sock.connect();
    }
}
