//! Obfuscation plugin seam
//!
//! A cipher context carries up to two plugins: a "protocol" transform and an
//! "obfs" transform. Both speak the same trait; which slots are populated
//! depends on the configured scheme. The first populated slot owns the
//! [`ServerInfo`] the session seeds at CONNECT time.

use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// Per-session parameters shared with the plugins.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Receive-buffer capacity of the hosting socket
    pub buffer_size: usize,
    /// Length of the plaintext address header at the front of the first payload
    pub head_len: usize,
    /// Path MTU the session was created with
    pub mtu: usize,
}

/// A pre/post transform over the ciphered stream.
///
/// `deobfuscate` may yield a feedback frame during the handshake; the tunnel
/// must write it back upstream before streaming starts.
pub trait Obfuscator: Send {
    fn server_info(&self) -> &ServerInfo;

    fn server_info_mut(&mut self) -> &mut ServerInfo;

    /// Transform outbound bytes in place.
    fn obfuscate(&mut self, buf: &mut BytesMut);

    /// Reverse the transform on inbound bytes in place, optionally emitting
    /// a feedback frame.
    fn deobfuscate(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>>;

    /// Whether the scheme expects a server feedback frame after the first
    /// outbound payload.
    fn need_feedback(&self) -> bool;
}

/// The identity transform.
#[derive(Debug, Default)]
pub struct PlainObfs {
    info: ServerInfo,
}

impl PlainObfs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Obfuscator for PlainObfs {
    fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    fn server_info_mut(&mut self) -> &mut ServerInfo {
        &mut self.info
    }

    fn obfuscate(&mut self, _buf: &mut BytesMut) {}

    fn deobfuscate(&mut self, _buf: &mut BytesMut) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn need_feedback(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_obfs_is_identity() {
        let mut obfs = PlainObfs::new();
        let mut buf = BytesMut::from(&b"payload"[..]);
        obfs.obfuscate(&mut buf);
        assert_eq!(buf.as_ref(), b"payload");
        let feedback = obfs.deobfuscate(&mut buf).unwrap();
        assert!(feedback.is_none());
        assert_eq!(buf.as_ref(), b"payload");
        assert!(!obfs.need_feedback());
    }

    #[test]
    fn test_server_info_seeding() {
        let mut obfs = PlainObfs::new();
        obfs.server_info_mut().buffer_size = 16 * 1024;
        obfs.server_info_mut().head_len = 7;
        assert_eq!(obfs.server_info().buffer_size, 16 * 1024);
        assert_eq!(obfs.server_info().head_len, 7);
    }
}
