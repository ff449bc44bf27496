//! SOCKS5 server-side protocol (RFC 1928)
//!
//! Incremental parser for the client greeting and the CONNECT/UDP-ASSOC
//! request, plus the fixed reply frames this client emits. The parser
//! consumes from a cursor and reports `NeedMore` when a record is cut by a
//! short read; residual bytes after a completed record are the caller's
//! protocol-violation signal.

use std::net::IpAddr;

use bitflags::bitflags;
use thiserror::Error;

use veiltunnel_core::Address;

pub const SOCKS5_VERSION: u8 = 0x05;

/// Method-selection reply: no authentication required.
pub const METHOD_SELECT_NONE: [u8; 2] = [0x05, 0x00];
/// Method-selection reply: no acceptable methods.
pub const METHOD_SELECT_REJECT: [u8; 2] = [0x05, 0xFF];

pub const REPLY_CONNECTION_NOT_ALLOWED: [u8; 10] = [5, 2, 0, 1, 0, 0, 0, 0, 0, 0];
pub const REPLY_HOST_UNREACHABLE: [u8; 10] = [5, 4, 0, 1, 0, 0, 0, 0, 0, 0];
pub const REPLY_CONNECTION_REFUSED: [u8; 10] = [5, 5, 0, 1, 0, 0, 0, 0, 0, 0];
pub const REPLY_COMMAND_NOT_SUPPORTED: [u8; 10] = [5, 7, 0, 1, 0, 0, 0, 0, 0, 0];

bitflags! {
    /// Authentication methods offered in the client greeting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AuthMethods: u8 {
        const NONE = 1 << 0;
        const GSSAPI = 1 << 1;
        const PASSWD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    TcpConnect,
    TcpBind,
    UdpAssoc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atyp {
    Ipv4,
    Host,
    Ipv6,
}

/// Parse outcome for a complete call; `Err` carries the protocol fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// Input exhausted mid-record; re-arm the read.
    NeedMore,
    /// Greeting complete; select an auth method and reply.
    AuthSelect,
    /// Request complete; `cmd`/`atyp`/`daddr`/`dport` are populated.
    ExecCmd,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("Bad protocol version: {0:#04x}")]
    BadVersion(u8),

    #[error("Bad command: {0:#04x}")]
    BadCommand(u8),

    #[error("Nonzero reserved field: {0:#04x}")]
    BadReserved(u8),

    #[error("Bad address type: {0:#04x}")]
    BadAtyp(u8),

    #[error("Bad destination address")]
    BadAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    NMethods,
    Methods,
    ReqVersion,
    ReqCmd,
    ReqReserved,
    ReqAtyp,
    ReqDaddrLen,
    ReqDaddr,
    ReqDportHi,
    ReqDportLo,
}

/// Incremental SOCKS5 parser. One instance lives for the lifetime of a
/// tunnel, parsing the greeting first and the request afterward.
pub struct Socks5Parser {
    state: State,
    methods: AuthMethods,
    methods_left: usize,
    selected: Option<AuthMethods>,
    cmd: Option<Cmd>,
    atyp: Option<Atyp>,
    daddr: Vec<u8>,
    daddr_left: usize,
    dport: u16,
}

impl Default for Socks5Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Socks5Parser {
    pub fn new() -> Self {
        Self {
            state: State::Version,
            methods: AuthMethods::empty(),
            methods_left: 0,
            selected: None,
            cmd: None,
            atyp: None,
            daddr: Vec::new(),
            daddr_left: 0,
            dport: 0,
        }
    }

    /// Consume bytes from the front of `cursor`, advancing it past
    /// everything parsed. Returns `NeedMore` when the cursor runs dry
    /// mid-record; any bytes left after `AuthSelect`/`ExecCmd` were not
    /// consumed and are the caller's to judge.
    pub fn parse(&mut self, cursor: &mut &[u8]) -> Result<ParseStatus, ParseError> {
        while let Some((&byte, rest)) = cursor.split_first() {
            *cursor = rest;
            match self.state {
                State::Version => {
                    if byte != SOCKS5_VERSION {
                        return Err(ParseError::BadVersion(byte));
                    }
                    self.state = State::NMethods;
                }
                State::NMethods => {
                    self.methods_left = byte as usize;
                    if self.methods_left == 0 {
                        self.state = State::ReqVersion;
                        return Ok(ParseStatus::AuthSelect);
                    }
                    self.state = State::Methods;
                }
                State::Methods => {
                    match byte {
                        0x00 => self.methods |= AuthMethods::NONE,
                        0x01 => self.methods |= AuthMethods::GSSAPI,
                        0x02 => self.methods |= AuthMethods::PASSWD,
                        _ => {}
                    }
                    self.methods_left -= 1;
                    if self.methods_left == 0 {
                        self.state = State::ReqVersion;
                        return Ok(ParseStatus::AuthSelect);
                    }
                }
                State::ReqVersion => {
                    if byte != SOCKS5_VERSION {
                        return Err(ParseError::BadVersion(byte));
                    }
                    self.state = State::ReqCmd;
                }
                State::ReqCmd => {
                    self.cmd = Some(match byte {
                        0x01 => Cmd::TcpConnect,
                        0x02 => Cmd::TcpBind,
                        0x03 => Cmd::UdpAssoc,
                        _ => return Err(ParseError::BadCommand(byte)),
                    });
                    self.state = State::ReqReserved;
                }
                State::ReqReserved => {
                    if byte != 0 {
                        return Err(ParseError::BadReserved(byte));
                    }
                    self.state = State::ReqAtyp;
                }
                State::ReqAtyp => match byte {
                    0x01 => {
                        self.atyp = Some(Atyp::Ipv4);
                        self.daddr_left = 4;
                        self.state = State::ReqDaddr;
                    }
                    0x03 => {
                        self.atyp = Some(Atyp::Host);
                        self.state = State::ReqDaddrLen;
                    }
                    0x04 => {
                        self.atyp = Some(Atyp::Ipv6);
                        self.daddr_left = 16;
                        self.state = State::ReqDaddr;
                    }
                    _ => return Err(ParseError::BadAtyp(byte)),
                },
                State::ReqDaddrLen => {
                    self.daddr_left = byte as usize;
                    self.state = if self.daddr_left == 0 {
                        State::ReqDportHi
                    } else {
                        State::ReqDaddr
                    };
                }
                State::ReqDaddr => {
                    self.daddr.push(byte);
                    self.daddr_left -= 1;
                    if self.daddr_left == 0 {
                        self.state = State::ReqDportHi;
                    }
                }
                State::ReqDportHi => {
                    self.dport = (byte as u16) << 8;
                    self.state = State::ReqDportLo;
                }
                State::ReqDportLo => {
                    self.dport |= byte as u16;
                    return Ok(ParseStatus::ExecCmd);
                }
            }
        }
        Ok(ParseStatus::NeedMore)
    }

    /// The methods the client offered in its greeting.
    pub fn auth_methods(&self) -> AuthMethods {
        self.methods
    }

    /// Record the method chosen for the selection reply.
    pub fn select_auth(&mut self, method: AuthMethods) {
        debug_assert!(self.methods.contains(method));
        self.selected = Some(method);
    }

    pub fn selected_auth(&self) -> Option<AuthMethods> {
        self.selected
    }

    pub fn cmd(&self) -> Option<Cmd> {
        self.cmd
    }

    pub fn atyp(&self) -> Option<Atyp> {
        self.atyp
    }

    pub fn dport(&self) -> u16 {
        self.dport
    }

    /// The request destination as an [`Address`], once `ExecCmd` was
    /// returned.
    pub fn dest_address(&self) -> Result<Address, ParseError> {
        match self.atyp {
            Some(Atyp::Ipv4) => {
                let octets: [u8; 4] =
                    self.daddr[..].try_into().map_err(|_| ParseError::BadAddress)?;
                Ok(Address::Ipv4(octets.into(), self.dport))
            }
            Some(Atyp::Ipv6) => {
                let octets: [u8; 16] =
                    self.daddr[..].try_into().map_err(|_| ParseError::BadAddress)?;
                Ok(Address::Ipv6(octets.into(), self.dport))
            }
            Some(Atyp::Host) => {
                let host = std::str::from_utf8(&self.daddr)
                    .map_err(|_| ParseError::BadAddress)?;
                Ok(Address::Domain(host.to_string(), self.dport))
            }
            None => Err(ParseError::BadAddress),
        }
    }
}

/// Build the UDP-ASSOCIATE reply.
///
/// With UDP relay enabled the reply names the local endpoint the client
/// should send datagrams to; with it disabled the request is answered
/// with "command not supported". The tunnel closes once the reply write
/// completes either way.
pub fn build_udp_assoc_package(
    udp_enabled: bool,
    listen_host: &str,
    listen_port: u16,
) -> Vec<u8> {
    if !udp_enabled {
        return REPLY_COMMAND_NOT_SUPPORTED.to_vec();
    }
    let relay = match listen_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Address::Ipv4(ip, listen_port),
        Ok(IpAddr::V6(ip)) => Address::Ipv6(ip, listen_port),
        Err(_) => Address::Domain(listen_host.to_string(), listen_port),
    };
    let mut reply = vec![SOCKS5_VERSION, 0x00, 0x00];
    reply.extend_from_slice(&relay.encode());
    reply
}
