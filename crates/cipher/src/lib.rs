//! Cipher + obfuscation context for tunnel sessions.
//!
//! One [`TunnelCipher`] is created per CONNECT tunnel and dropped exactly
//! once at teardown. Outbound bytes are sealed into AEAD records and then
//! obfuscated; inbound bytes take the reverse path. The obfuscation plugins
//! are fields of the context, selected by the configured scheme.

pub mod error;
pub mod obfs;
pub mod stream;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use veiltunnel_core::config::CipherMethod;
use veiltunnel_core::Config;

pub use error::{CipherError, Result};
pub use obfs::{Obfuscator, PlainObfs, ServerInfo};
pub use stream::AeadStream;

/// Derive the 32-byte session key from the configured password.
pub fn derive_key(password: &str) -> [u8; 32] {
    let digest = Sha256::digest(password.as_bytes());
    digest.into()
}

/// Per-tunnel cipher context.
pub struct TunnelCipher {
    aead: Option<AeadStream>,
    protocol: Option<Box<dyn Obfuscator>>,
    obfs: Option<Box<dyn Obfuscator>>,
}

impl TunnelCipher {
    /// Build a context from the client configuration.
    pub fn new(config: &Config, mtu: usize) -> Self {
        let aead = match config.method {
            CipherMethod::Plain => None,
            CipherMethod::Chacha20Poly1305 => {
                Some(AeadStream::new(&derive_key(&config.password)))
            }
        };
        let mut obfs = PlainObfs::new();
        obfs.server_info_mut().mtu = mtu;
        Self {
            aead,
            protocol: None,
            obfs: Some(Box::new(obfs)),
        }
    }

    /// Build a context with explicit plugins. This is the extension seam
    /// obfuscation schemes plug into.
    pub fn with_plugins(
        aead: Option<AeadStream>,
        protocol: Option<Box<dyn Obfuscator>>,
        obfs: Option<Box<dyn Obfuscator>>,
    ) -> Self {
        Self {
            aead,
            protocol,
            obfs,
        }
    }

    /// The server info of the first populated plugin slot, protocol first.
    pub fn server_info_mut(&mut self) -> Option<&mut ServerInfo> {
        match (&mut self.protocol, &mut self.obfs) {
            (Some(protocol), _) => Some(protocol.server_info_mut()),
            (None, Some(obfs)) => Some(obfs.server_info_mut()),
            (None, None) => None,
        }
    }

    /// Whether the scheme expects a server feedback frame after the first
    /// outbound payload.
    pub fn need_feedback(&self) -> bool {
        self.protocol.as_ref().is_some_and(|p| p.need_feedback())
            || self.obfs.as_ref().is_some_and(|o| o.need_feedback())
    }

    /// Transform outbound bytes in place: seal, then obfuscate.
    pub fn encrypt(&mut self, buf: &mut BytesMut) -> Result<()> {
        if let Some(aead) = &mut self.aead {
            aead.seal(buf)?;
        }
        if let Some(protocol) = &mut self.protocol {
            protocol.obfuscate(buf);
        }
        if let Some(obfs) = &mut self.obfs {
            obfs.obfuscate(buf);
        }
        Ok(())
    }

    /// Reverse the transform on inbound bytes in place.
    ///
    /// The whole input is always consumed; bytes of a partial AEAD record
    /// are buffered inside the context. A `Some` return is a feedback frame
    /// the tunnel must write back upstream.
    pub fn decrypt(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        let mut feedback = None;
        if let Some(obfs) = &mut self.obfs {
            feedback = obfs.deobfuscate(buf)?;
        }
        if let Some(protocol) = &mut self.protocol {
            if let Some(fb) = protocol.deobfuscate(buf)? {
                feedback = Some(fb);
            }
        }
        if let Some(aead) = &mut self.aead {
            aead.open(buf)?;
        }
        Ok(feedback)
    }
}
