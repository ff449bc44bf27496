//! Tokio execution of the stage machine's armed I/O
//!
//! One driver task per tunnel. Each loop iteration performs whatever the
//! stage machine armed: at most one read and one write per socket run
//! concurrently; DNS resolution and the upstream connect are exclusive,
//! nothing else is armed in those stages. Completions are recorded on the
//! socket and dispatched through [`Tunnel::advance`] one at a time.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;

use crate::socket::{PendingWrite, Side, SocketCtx};
use crate::tls::{self, TlsEvent, TlsHandle};
use crate::tunnel::Tunnel;

struct Endpoint {
    rd: Option<OwnedReadHalf>,
    wr: Option<OwnedWriteHalf>,
}

impl Endpoint {
    fn from_stream(stream: TcpStream) -> Self {
        let (rd, wr) = stream.into_split();
        Self {
            rd: Some(rd),
            wr: Some(wr),
        }
    }

    fn empty() -> Self {
        Self { rd: None, wr: None }
    }
}

enum Event {
    IncRead(io::Result<usize>),
    IncWrite(io::Result<usize>),
    OutRead(io::Result<usize>),
    OutWrite(io::Result<usize>),
    Tls(Option<TlsEvent>),
    Shutdown,
    IdleTick,
}

/// Run one tunnel to completion.
pub(crate) async fn drive(mut tunnel: Tunnel, client: TcpStream, shutdown: Arc<Notify>) {
    let mut inc_io = Endpoint::from_stream(client);
    let mut out_io = Endpoint::empty();
    let mut tls_handle: Option<TlsHandle> = None;
    let idle_timeout = Duration::from_secs(tunnel.config().idle_timeout_secs);

    loop {
        if tunnel.is_shutdown() {
            break;
        }

        // DNS resolution runs exclusively; no other I/O is armed.
        if let Some(host) = tunnel.outgoing.pending_resolve.clone() {
            let looked_up = tokio::select! {
                res = tokio::net::lookup_host((host.as_str(), 0u16)) => Some(res),
                _ = shutdown.notified() => None,
            };
            match looked_up {
                None => {
                    tunnel.shutdown();
                    break;
                }
                Some(Ok(mut addrs)) => match addrs.next() {
                    Some(addr) => {
                        tunnel.outgoing.addr = Some(addr);
                        tunnel.outgoing.complete_resolve(Ok(0));
                    }
                    None => tunnel.outgoing.complete_resolve(Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no addresses returned",
                    ))),
                },
                Some(Err(e)) => tunnel.outgoing.complete_resolve(Err(e)),
            }
            tunnel.advance(Side::Outgoing);
            continue;
        }

        // The upstream connect likewise.
        if tunnel.outgoing.pending_connect {
            let addr = tunnel.outgoing.addr.expect("connect armed without address");
            let timeout = Duration::from_secs(tunnel.config().connect_timeout_secs);
            let connected = tokio::select! {
                res = tokio::time::timeout(timeout, TcpStream::connect(addr)) => Some(res),
                _ = shutdown.notified() => None,
            };
            match connected {
                None => {
                    tunnel.shutdown();
                    break;
                }
                Some(Ok(Ok(stream))) => {
                    out_io = Endpoint::from_stream(stream);
                    tunnel.outgoing.complete_connect(Ok(0));
                }
                Some(Ok(Err(e))) => tunnel.outgoing.complete_connect(Err(e)),
                Some(Err(_elapsed)) => tunnel.outgoing.complete_connect(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream connect timed out",
                ))),
            }
            tunnel.advance(Side::Outgoing);
            continue;
        }

        if tunnel.tls_launch {
            tunnel.tls_launch = false;
            tls_handle = Some(tls::launch(tunnel.id, tunnel.config()));
        }
        if tunnel.tls_close && tls_handle.is_some() {
            // Dropping the handle closes the transport.
            tls_handle = None;
        }

        // Hand queued payloads to the transport without blocking event
        // processing; a full channel drains on a later iteration.
        while tls_handle.is_some() && !tunnel.tls_out.is_empty() {
            let chunk = tunnel.tls_out.pop_front().expect("queue non-empty");
            match tls_handle.as_ref().expect("handle present").outbound.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    tunnel.tls_out.push_front(chunk);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    tunnel.on_tls_event(TlsEvent::ShuttingDown);
                    break;
                }
            }
        }
        if tunnel.is_shutdown() {
            break;
        }

        let event = {
            let Tunnel {
                incoming, outgoing, ..
            } = &mut tunnel;
            let SocketCtx {
                buf: inc_buf,
                pending_read: inc_rd,
                pending_write: inc_wr,
                ..
            } = incoming;
            let SocketCtx {
                buf: out_buf,
                pending_read: out_rd,
                pending_write: out_wr,
                ..
            } = outgoing;
            let inc_rd_armed = inc_rd.is_some();
            let out_rd_armed = out_rd.is_some();
            // TLS events may arm a client write; hold them while one is
            // already in flight.
            let tls_deliverable = inc_wr.is_none();

            tokio::select! {
                res = read_op(inc_io.rd.as_mut(), inc_buf, inc_rd_armed) => Event::IncRead(res),
                res = write_op(inc_io.wr.as_mut(), &*inc_wr) => Event::IncWrite(res),
                res = read_op(out_io.rd.as_mut(), out_buf, out_rd_armed) => Event::OutRead(res),
                res = write_op(out_io.wr.as_mut(), &*out_wr) => Event::OutWrite(res),
                ev = recv_tls(tls_handle.as_mut(), tls_deliverable) => Event::Tls(ev),
                _ = shutdown.notified() => Event::Shutdown,
                _ = tokio::time::sleep(idle_timeout) => Event::IdleTick,
            }
        };

        match event {
            Event::IncRead(res) => finish_read(&mut tunnel, Side::Incoming, res),
            Event::OutRead(res) => finish_read(&mut tunnel, Side::Outgoing, res),
            Event::IncWrite(res) => finish_write(&mut tunnel, Side::Incoming, res),
            Event::OutWrite(res) => finish_write(&mut tunnel, Side::Outgoing, res),
            Event::Tls(Some(ev)) => tunnel.on_tls_event(ev),
            Event::Tls(None) => tunnel.on_tls_event(TlsEvent::ShuttingDown),
            Event::Shutdown => tunnel.shutdown(),
            Event::IdleTick => tunnel.on_timeout(),
        }
    }

    tunnel.teardown();
}

async fn read_op(
    rd: Option<&mut OwnedReadHalf>,
    buf: &mut [u8],
    armed: bool,
) -> io::Result<usize> {
    match (rd, armed) {
        (Some(rd), true) => rd.read(buf).await,
        _ => std::future::pending().await,
    }
}

async fn write_op(
    wr: Option<&mut OwnedWriteHalf>,
    pending: &Option<PendingWrite>,
) -> io::Result<usize> {
    match (wr, pending) {
        (Some(wr), Some(pw)) => wr.write(&pw.buf[pw.written..]).await,
        _ => std::future::pending().await,
    }
}

async fn recv_tls(handle: Option<&mut TlsHandle>, deliverable: bool) -> Option<TlsEvent> {
    match (handle, deliverable) {
        (Some(handle), true) => handle.events.recv().await,
        _ => std::future::pending().await,
    }
}

fn finish_read(tunnel: &mut Tunnel, side: Side, res: io::Result<usize>) {
    // EOF surfaces as an error so stage handlers treat it like any other
    // transport failure.
    let res = match res {
        Ok(0) => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        other => other,
    };
    sock_mut(tunnel, side).complete_read(res);
    tunnel.advance(side);
}

fn finish_write(tunnel: &mut Tunnel, side: Side, res: io::Result<usize>) {
    let sock = sock_mut(tunnel, side);
    match res {
        Ok(0) => {
            sock.complete_write(Err(io::ErrorKind::WriteZero.into()));
            tunnel.advance(side);
        }
        Ok(n) => {
            let pw = sock
                .pending_write
                .as_mut()
                .expect("write completion without pending write");
            pw.written += n;
            if pw.written == pw.buf.len() {
                let total = pw.written;
                sock.complete_write(Ok(total));
                tunnel.advance(side);
            }
            // A short write keeps flushing on the next iteration.
        }
        Err(e) => {
            sock.complete_write(Err(e));
            tunnel.advance(side);
        }
    }
}

fn sock_mut(tunnel: &mut Tunnel, side: Side) -> &mut SocketCtx {
    match side {
        Side::Incoming => &mut tunnel.incoming,
        Side::Outgoing => &mut tunnel.outgoing,
    }
}
