//! Per-connection tunnel stage machine
//!
//! A tunnel owns two sockets: `incoming` toward the SOCKS client and
//! `outgoing` toward the forwarding server. Every I/O completion re-enters
//! the machine through [`Tunnel::advance`], which checks the completion
//! against the current stage's preconditions, latches the `done` state
//! back to `stop`, and performs exactly one forward action: arming new
//! I/O or moving to the next stage.
//!
//! The session walks through the SOCKS5 handshake, the request, DNS and
//! connect toward the forwarding server, the obfuscation auth exchange
//! (with an optional feedback round trip), and then settles into piping
//! data back and forth with the cipher transform applied to every byte
//! in each direction. When TLS wrapping is enabled the upstream leg is
//! driven by transport callbacks instead of raw socket completions.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use veiltunnel_cipher::{CipherError, TunnelCipher};
use veiltunnel_core::{s5_head_size, Address, SSR_BUFF_SIZE, TUNNEL_MTU};

use crate::env::Env;
use crate::socket::{Side, SockState, SocketCtx};
use crate::socks5::{
    build_udp_assoc_package, AuthMethods, Cmd, ParseStatus, Socks5Parser, SOCKS5_VERSION,
    METHOD_SELECT_NONE, METHOD_SELECT_REJECT, REPLY_CONNECTION_NOT_ALLOWED,
    REPLY_CONNECTION_REFUSED, REPLY_HOST_UNREACHABLE,
};
use crate::tls::TlsEvent;

/// Session stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Wait for the client greeting
    Handshake,
    /// Wait for client authentication data (reserved, never armed)
    HandshakeAuth,
    /// Method-selection reply write pending
    HandshakeReplied,
    /// Wait for the CONNECT/UDP-ASSOC request
    S5Request,
    /// UDP-ASSOC reply write pending, then close
    S5UdpAssoc,
    /// TLS transport handshake in progress
    TlsConnecting,
    /// Obfuscation auth sent over TLS, awaiting the first reply
    TlsFirstPackage,
    /// TLS path bidirectional streaming
    TlsStreaming,
    /// Upstream hostname DNS lookup completing
    ResolveSsrServerHostDone,
    /// Raw TCP connect to the forwarding server pending
    ConnectingSsrServer,
    /// Obfuscation auth write completing
    SsrAuthSent,
    /// Awaiting the server feedback frame
    SsrWaitingFeedback,
    /// Feedback receipt write completing
    SsrReceiptOfFeedbackSent,
    /// SOCKS5 success reply write completing
    AuthCompletionDone,
    /// Raw path bidirectional streaming
    Streaming,
    /// Tear down the session
    Kill,
}

pub struct Tunnel {
    pub(crate) id: u64,
    pub(crate) incoming: SocketCtx,
    pub(crate) outgoing: SocketCtx,
    pub(crate) stage: Stage,
    parser: Socks5Parser,
    pub(crate) cipher: Option<TunnelCipher>,
    init_pkg: Option<Bytes>,
    desired_addr: Option<Address>,
    env: Arc<Env>,
    shutting_down: bool,
    torn_down: bool,
    /// Set when the stage machine wants the TLS transport launched.
    pub(crate) tls_launch: bool,
    /// Outbound payloads queued for the TLS transport.
    pub(crate) tls_out: VecDeque<Bytes>,
    /// Set when the TLS transport should be closed.
    pub(crate) tls_close: bool,
}

impl Tunnel {
    /// Build a session for a freshly accepted client, with the first
    /// greeting read already armed.
    pub fn new(id: u64, env: Arc<Env>) -> Self {
        let mut incoming = SocketCtx::new(Side::Incoming);
        incoming.read(true);
        Self {
            id,
            incoming,
            outgoing: SocketCtx::new(Side::Outgoing),
            stage: Stage::Handshake,
            parser: Socks5Parser::new(),
            cipher: None,
            init_pkg: None,
            desired_addr: None,
            env,
            shutting_down: false,
            torn_down: false,
            tls_launch: false,
            tls_out: VecDeque::new(),
            tls_close: false,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn config(&self) -> &veiltunnel_core::Config {
        &self.env.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down
    }

    fn sock(&self, side: Side) -> &SocketCtx {
        match side {
            Side::Incoming => &self.incoming,
            Side::Outgoing => &self.outgoing,
        }
    }

    fn sock_mut(&mut self, side: Side) -> &mut SocketCtx {
        match side {
            Side::Incoming => &mut self.incoming,
            Side::Outgoing => &mut self.outgoing,
        }
    }

    /// Single entry point for every completion: read, write, connect and
    /// resolve all land here with the socket that fired.
    pub fn advance(&mut self, side: Side) {
        match self.stage {
            Stage::Handshake => {
                assert_eq!(self.incoming.rdstate, SockState::Done);
                self.incoming.rdstate = SockState::Stop;
                self.do_handshake();
            }
            Stage::HandshakeAuth => self.do_handshake_auth(),
            Stage::HandshakeReplied => {
                assert_eq!(self.incoming.wrstate, SockState::Done);
                self.incoming.wrstate = SockState::Stop;
                self.do_wait_s5_request();
            }
            Stage::S5Request => {
                assert_eq!(self.incoming.rdstate, SockState::Done);
                self.incoming.rdstate = SockState::Stop;
                self.do_parse_s5_request();
            }
            Stage::S5UdpAssoc => {
                assert_eq!(self.incoming.wrstate, SockState::Done);
                self.incoming.wrstate = SockState::Stop;
                self.shutdown();
            }
            Stage::ResolveSsrServerHostDone => self.do_resolve_host_aftercare(),
            Stage::ConnectingSsrServer => self.do_connect_ssr_server_done(),
            Stage::SsrAuthSent => {
                assert_eq!(self.outgoing.wrstate, SockState::Done);
                self.outgoing.wrstate = SockState::Stop;
                self.do_ssr_auth_sent();
            }
            Stage::SsrWaitingFeedback => {
                assert_eq!(self.outgoing.rdstate, SockState::Done);
                self.outgoing.rdstate = SockState::Stop;
                if !self.do_ssr_receipt_for_feedback() && !self.shutting_down {
                    self.do_socks5_reply_success();
                }
            }
            Stage::SsrReceiptOfFeedbackSent => {
                assert_eq!(self.outgoing.wrstate, SockState::Done);
                self.outgoing.wrstate = SockState::Stop;
                if let Err(e) = &self.outgoing.result {
                    error!("tunnel {}: write error: {}", self.id, e);
                    self.shutdown();
                    return;
                }
                self.do_socks5_reply_success();
            }
            Stage::AuthCompletionDone => {
                assert_eq!(self.incoming.wrstate, SockState::Done);
                self.incoming.wrstate = SockState::Stop;
                if self.env.config.over_tls_enable {
                    self.tls_do_launch_streaming();
                } else {
                    self.do_launch_streaming();
                }
            }
            Stage::TlsStreaming => self.tls_incoming_streaming(side),
            Stage::Streaming => self.streaming(side),
            Stage::Kill => self.shutdown(),
            Stage::TlsConnecting | Stage::TlsFirstPackage => {
                unreachable!("socket completion during TLS stage {:?}", self.stage)
            }
        }
    }

    /// Idle-timeout event. Termination is decided upstream; nothing to do.
    pub fn on_timeout(&mut self) {}

    /// Begin an orderly teardown. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.stage = Stage::Kill;
        debug!("tunnel {}: shutting down", self.id);
    }

    /// Final release: deregister and drop the per-session state. Idempotent.
    pub(crate) fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.env.registry.remove(self.id);
        self.cipher.take();
        self.init_pkg.take();
        debug!("tunnel {}: closed", self.id);
    }

    fn do_handshake(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: read error: {}", self.id, e);
            self.shutdown();
            return;
        }

        let (status, residual) = {
            let Tunnel {
                ref incoming,
                ref mut parser,
                ..
            } = *self;
            let mut cursor = incoming.payload();
            let status = parser.parse(&mut cursor);
            (status, cursor.len())
        };

        match status {
            Ok(ParseStatus::NeedMore) => {
                self.incoming.read(true);
            }
            Ok(ParseStatus::AuthSelect) => {
                if residual != 0 {
                    error!("tunnel {}: junk in handshake", self.id);
                    self.shutdown();
                    return;
                }
                let methods = self.parser.auth_methods();
                if methods.contains(AuthMethods::NONE) && self.env.policy.can_auth_none() {
                    self.parser.select_auth(AuthMethods::NONE);
                    self.incoming.write(METHOD_SELECT_NONE.to_vec());
                    self.stage = Stage::HandshakeReplied;
                } else if methods.contains(AuthMethods::PASSWD)
                    && self.env.policy.can_auth_passwd()
                {
                    // Username/password auth is not implemented.
                    self.shutdown();
                } else {
                    self.incoming.write(METHOD_SELECT_REJECT.to_vec());
                    self.stage = Stage::Kill;
                }
            }
            Ok(ParseStatus::ExecCmd) => {
                error!("tunnel {}: request before method selection", self.id);
                self.shutdown();
            }
            Err(e) => {
                error!("tunnel {}: handshake error: {}", self.id, e);
                self.shutdown();
            }
        }
    }

    /// Reserved for username/password auth; nothing arms this stage.
    fn do_handshake_auth(&mut self) {
        unreachable!("username/password auth is not implemented");
    }

    fn do_wait_s5_request(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: write error: {}", self.id, e);
            self.shutdown();
            return;
        }

        self.incoming.read(true);
        self.stage = Stage::S5Request;
    }

    fn do_parse_s5_request(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: read error: {}", self.id, e);
            self.shutdown();
            return;
        }

        // Capture the destination for logging before full validation.
        if self.desired_addr.is_none() {
            if let Some(tail) = self.incoming.payload().get(3..) {
                if let Ok((addr, _)) = Address::parse(tail) {
                    self.desired_addr = Some(addr);
                }
            }
        }

        let (status, residual) = {
            let Tunnel {
                ref incoming,
                ref mut parser,
                ..
            } = *self;
            let mut cursor = incoming.payload();
            let status = parser.parse(&mut cursor);
            (status, cursor.len())
        };

        match status {
            Ok(ParseStatus::NeedMore) => {
                self.incoming.read(true);
            }
            Ok(ParseStatus::ExecCmd) => {
                if residual != 0 {
                    error!("tunnel {}: junk in request ({} bytes)", self.id, residual);
                    self.shutdown();
                    return;
                }
                match self.parser.cmd() {
                    Some(Cmd::TcpBind) => {
                        // Not supported but relatively straightforward to implement.
                        warn!("tunnel {}: BIND requests are not supported", self.id);
                        self.shutdown();
                    }
                    Some(Cmd::UdpAssoc) => {
                        let config = &self.env.config;
                        let reply = build_udp_assoc_package(
                            config.udp,
                            &config.listen_host,
                            config.listen_port,
                        );
                        self.incoming.write(reply);
                        self.stage = Stage::S5UdpAssoc;
                    }
                    Some(Cmd::TcpConnect) => self.do_prepare_connect(),
                    None => unreachable!("ExecCmd without a command"),
                }
            }
            Ok(ParseStatus::AuthSelect) => {
                error!("tunnel {}: greeting repeated after method selection", self.id);
                self.shutdown();
            }
            Err(e) => {
                error!("tunnel {}: request error: {}", self.id, e);
                self.shutdown();
            }
        }
    }

    /// CONNECT accepted: build the init package, create the cipher, and
    /// head for the forwarding server over TLS or raw TCP.
    fn do_prepare_connect(&mut self) {
        let dest = match self.parser.dest_address() {
            Ok(dest) => dest,
            Err(e) => {
                error!("tunnel {}: request error: {}", self.id, e);
                self.shutdown();
                return;
            }
        };
        debug!("tunnel {}: CONNECT to {}", self.id, dest);

        let init_pkg = dest.encode().freeze();
        let mut cipher = TunnelCipher::new(&self.env.config, TUNNEL_MTU);
        if let Some(info) = cipher.server_info_mut() {
            info.buffer_size = SSR_BUFF_SIZE;
            info.head_len = s5_head_size(&init_pkg, 30);
        }
        self.init_pkg = Some(init_pkg);
        self.cipher = Some(cipher);
        self.desired_addr = Some(dest);

        if self.env.config.over_tls_enable {
            self.stage = Stage::TlsConnecting;
            self.tls_launch = true;
            return;
        }

        match self.env.config.remote_literal_ip() {
            Some(addr) => {
                self.outgoing.addr = Some(addr);
                self.do_connect_ssr_server();
            }
            None => {
                let host = self.env.config.remote_host.clone();
                self.outgoing.resolve(host);
                self.stage = Stage::ResolveSsrServerHostDone;
            }
        }
    }

    fn do_resolve_host_aftercare(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.outgoing.result {
            error!(
                "tunnel {}: lookup error for \"{}\": {}",
                self.id, self.env.config.remote_host, e
            );
            self.incoming.write(REPLY_HOST_UNREACHABLE.to_vec());
            self.stage = Stage::Kill;
            return;
        }

        // The resolver answers with port 0; patch in the configured port.
        let port = self.env.config.remote_port;
        if let Some(addr) = self.outgoing.addr.as_mut() {
            addr.set_port(port);
        }

        self.do_connect_ssr_server();
    }

    /// Assumes `outgoing.addr` holds a valid upstream address.
    fn do_connect_ssr_server(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        let addr = self.outgoing.addr.expect("upstream address present");
        if !self.env.policy.can_access(&addr) {
            warn!("tunnel {}: connection not allowed by ruleset", self.id);
            self.incoming.write(REPLY_CONNECTION_NOT_ALLOWED.to_vec());
            self.stage = Stage::Kill;
            return;
        }

        self.outgoing.connect();
        self.stage = Stage::ConnectingSsrServer;
    }

    fn do_connect_ssr_server_done(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.outgoing.result {
            error!("tunnel {}: upstream connection failed: {}", self.id, e);
            self.incoming.write(REPLY_CONNECTION_REFUSED.to_vec());
            self.stage = Stage::Kill;
            return;
        }

        match self.encrypt_init_pkg() {
            Ok(auth) => {
                self.outgoing.write(auth);
                self.stage = Stage::SsrAuthSent;
            }
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.shutdown();
            }
        }
    }

    fn do_ssr_auth_sent(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.outgoing.result {
            error!("tunnel {}: write error: {}", self.id, e);
            self.shutdown();
            return;
        }

        let need_feedback = self
            .cipher
            .as_ref()
            .expect("cipher exists after CONNECT")
            .need_feedback();
        if need_feedback {
            self.outgoing.read(true);
            self.stage = Stage::SsrWaitingFeedback;
        } else {
            self.do_socks5_reply_success();
        }
    }

    /// Decrypt the server's feedback frame; returns true when a receipt
    /// was queued and the reply must wait for its completion.
    fn do_ssr_receipt_for_feedback(&mut self) -> bool {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.outgoing.result {
            error!("tunnel {}: read error: {}", self.id, e);
            self.shutdown();
            return false;
        }

        let (decrypted, remaining) = {
            let Tunnel {
                ref outgoing,
                ref mut cipher,
                ..
            } = *self;
            let mut buf = BytesMut::from(outgoing.payload());
            let result = cipher
                .as_mut()
                .expect("cipher exists after CONNECT")
                .decrypt(&mut buf);
            (result, buf.len())
        };

        match decrypted {
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.shutdown();
                false
            }
            Ok(feedback) => {
                debug_assert_eq!(remaining, 0, "feedback frame not fully consumed");
                if let Some(receipt) = feedback {
                    self.outgoing.write(receipt);
                    self.stage = Stage::SsrReceiptOfFeedbackSent;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn do_socks5_reply_success(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        let init_pkg = self.init_pkg.as_ref().expect("init package present");
        let mut reply = Vec::with_capacity(3 + init_pkg.len());
        reply.extend_from_slice(&[SOCKS5_VERSION, 0x00, 0x00]);
        reply.extend_from_slice(init_pkg);
        self.incoming.write(reply);
        self.stage = Stage::AuthCompletionDone;
    }

    fn do_launch_streaming(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: write error: {}", self.id, e);
            self.shutdown();
            return;
        }

        if let Some(dest) = &self.desired_addr {
            info!("tunnel {}: streaming to {}", self.id, dest);
        }
        self.incoming.read(false);
        self.outgoing.read(true);
        self.stage = Stage::Streaming;
    }

    /// Raw-path piping: a completed read is transformed and written to the
    /// opposite socket; a completed write re-arms the read it drained.
    fn streaming(&mut self, side: Side) {
        if let Err(e) = self.sock(side).result.as_ref() {
            error!("tunnel {}: stream error on {:?}: {}", self.id, side, e);
            self.shutdown();
            return;
        }

        if self.sock(side).wrstate == SockState::Done {
            self.sock_mut(side).wrstate = SockState::Stop;
            let source = side.opposite();
            self.sock_mut(source).read(source == Side::Outgoing);
        } else if self.sock(side).rdstate == SockState::Done {
            self.sock_mut(side).rdstate = SockState::Stop;

            let transformed = {
                let Tunnel {
                    ref incoming,
                    ref outgoing,
                    ref mut cipher,
                    ..
                } = *self;
                let sock = match side {
                    Side::Incoming => incoming,
                    Side::Outgoing => outgoing,
                };
                let cipher = cipher.as_mut().expect("cipher exists while streaming");
                transform_payload(cipher, side, sock.payload())
            };

            match transformed {
                Ok(data) if !data.is_empty() => {
                    self.sock_mut(side.opposite()).write(data.freeze());
                }
                Ok(_) => {
                    // Partial cipher record: nothing to forward yet.
                    self.sock_mut(side).read(side == Side::Outgoing);
                }
                Err(e) => {
                    error!("tunnel {}: cipher error: {}", self.id, e);
                    self.shutdown();
                }
            }
        } else {
            unreachable!("streaming entered without a completed event");
        }
    }

    // --- TLS-wrapped variant -------------------------------------------

    /// Route a TLS transport callback into the stage machine.
    pub fn on_tls_event(&mut self, event: TlsEvent) {
        match event {
            TlsEvent::Established => self.on_tls_connection_established(),
            TlsEvent::Data(data) => {
                if self.stage == Stage::TlsStreaming {
                    self.tls_forward_to_client(&data);
                } else {
                    self.on_tls_data_received(&data);
                }
            }
            TlsEvent::ShuttingDown => self.on_tls_shutting_down(),
        }
    }

    fn on_tls_connection_established(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        match self.encrypt_init_pkg() {
            Ok(auth) => {
                self.stage = Stage::TlsFirstPackage;
                self.tls_out.push_back(auth);
            }
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.tls_client_shutdown();
            }
        }
    }

    /// Handshake-phase TLS data. Streaming-phase data takes the
    /// forward-to-client path instead and must not arrive here.
    fn on_tls_data_received(&mut self, data: &[u8]) {
        debug_assert_eq!(
            self.stage,
            Stage::TlsFirstPackage,
            "TLS data in stage {:?}",
            self.stage
        );
        if self.stage != Stage::TlsFirstPackage {
            return;
        }

        let decrypted = {
            let mut buf = BytesMut::from(data);
            self.cipher
                .as_mut()
                .expect("cipher exists after CONNECT")
                .decrypt(&mut buf)
        };
        match decrypted {
            Ok(feedback) => {
                debug_assert!(feedback.is_none(), "feedback on the TLS path");
                self.do_socks5_reply_success();
            }
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.tls_client_shutdown();
            }
        }
    }

    fn on_tls_shutting_down(&mut self) {
        self.shutdown();
    }

    fn tls_do_launch_streaming(&mut self) {
        assert_eq!(self.incoming.rdstate, SockState::Stop);
        assert_eq!(self.incoming.wrstate, SockState::Stop);
        assert_eq!(self.outgoing.rdstate, SockState::Stop);
        assert_eq!(self.outgoing.wrstate, SockState::Stop);

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: write error: {}", self.id, e);
            self.tls_client_shutdown();
            return;
        }

        if let Some(dest) = &self.desired_addr {
            info!("tunnel {}: streaming to {} over TLS", self.id, dest);
        }
        self.incoming.read(true);
        self.stage = Stage::TlsStreaming;
    }

    /// TLS-path handler for the incoming socket. Reads are encrypted and
    /// handed to the transport; write completions just go idle, because
    /// transport-to-client writes are initiated by the TLS callback path.
    fn tls_incoming_streaming(&mut self, side: Side) {
        assert_eq!(side, Side::Incoming);
        assert!(
            (self.incoming.wrstate == SockState::Done)
                != (self.incoming.rdstate == SockState::Done),
            "exactly one completion expected"
        );

        if self.incoming.wrstate == SockState::Done {
            self.incoming.wrstate = SockState::Stop;
            return;
        }

        self.incoming.rdstate = SockState::Stop;

        if let Err(e) = &self.incoming.result {
            error!("tunnel {}: read error: {}", self.id, e);
            self.tls_client_shutdown();
            return;
        }

        let transformed = {
            let Tunnel {
                ref incoming,
                ref mut cipher,
                ..
            } = *self;
            let cipher = cipher.as_mut().expect("cipher exists while streaming");
            transform_payload(cipher, Side::Incoming, incoming.payload())
        };
        match transformed {
            Ok(data) => {
                if !data.is_empty() {
                    self.tls_out.push_back(data.freeze());
                }
                self.incoming.read(false);
            }
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.tls_client_shutdown();
            }
        }
    }

    /// Streaming-phase TLS data: decrypt and queue a write to the client.
    fn tls_forward_to_client(&mut self, data: &[u8]) {
        let decrypted = {
            let mut buf = BytesMut::from(data);
            let result = self
                .cipher
                .as_mut()
                .expect("cipher exists while streaming")
                .decrypt(&mut buf);
            result.map(|feedback| (buf, feedback))
        };
        match decrypted {
            Ok((plaintext, feedback)) => {
                debug_assert!(feedback.is_none(), "feedback mid-stream");
                if !plaintext.is_empty() {
                    self.incoming.write(plaintext.freeze());
                }
            }
            Err(e) => {
                error!("tunnel {}: cipher error: {}", self.id, e);
                self.tls_client_shutdown();
            }
        }
    }

    fn tls_client_shutdown(&mut self) {
        self.tls_close = true;
        self.shutdown();
    }

    fn encrypt_init_pkg(&mut self) -> Result<Bytes, CipherError> {
        let Tunnel {
            ref init_pkg,
            ref mut cipher,
            ..
        } = *self;
        let mut buf = BytesMut::from(init_pkg.as_ref().expect("init package present").as_ref());
        cipher
            .as_mut()
            .expect("cipher exists after CONNECT")
            .encrypt(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Apply the per-direction transform: client bytes are encrypted toward
/// the server, server bytes are decrypted toward the client.
fn transform_payload(
    cipher: &mut TunnelCipher,
    side: Side,
    payload: &[u8],
) -> Result<BytesMut, CipherError> {
    let mut buf = BytesMut::from(payload);
    match side {
        Side::Incoming => cipher.encrypt(&mut buf)?,
        Side::Outgoing => {
            let feedback = cipher.decrypt(&mut buf)?;
            debug_assert!(feedback.is_none(), "feedback mid-stream");
        }
    }
    Ok(buf)
}
