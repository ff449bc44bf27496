//! AEAD record stream
//!
//! Frames a TCP byte stream into ChaCha20-Poly1305 records:
//!
//! ```text
//! len(2, big-endian) || nonce(12) || ciphertext+tag
//! ```
//!
//! `open` buffers partial records internally, so every call consumes its
//! whole input regardless of how the peer's writes were segmented by TCP.

use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{CipherError, Result};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Largest plaintext chunk sealed into a single record.
const MAX_PLAINTEXT: usize = 0x3FFF;

pub struct AeadStream {
    cipher: ChaCha20Poly1305,
    /// Inbound bytes not yet forming a complete record
    pending: BytesMut,
}

impl AeadStream {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            pending: BytesMut::new(),
        }
    }

    /// Replace `buf`'s plaintext with framed records.
    pub fn seal(&mut self, buf: &mut BytesMut) -> Result<()> {
        let plaintext = buf.split();
        buf.reserve(plaintext.len() + 2 + NONCE_LEN + TAG_LEN);

        for chunk in plaintext.chunks(MAX_PLAINTEXT) {
            let mut nonce_bytes = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let ciphertext = self
                .cipher
                .encrypt(nonce, chunk)
                .map_err(|_| CipherError::EncryptFailed)?;

            let record_len = NONCE_LEN + ciphertext.len();
            debug_assert!(record_len <= u16::MAX as usize);
            buf.put_u16(record_len as u16);
            buf.put_slice(&nonce_bytes);
            buf.put_slice(&ciphertext);
        }
        Ok(())
    }

    /// Replace `buf`'s ciphertext with the plaintext of every complete
    /// record; trailing partial records are kept for the next call.
    pub fn open(&mut self, buf: &mut BytesMut) -> Result<()> {
        self.pending.extend_from_slice(buf);
        buf.clear();

        while self.pending.len() >= 2 {
            let record_len =
                u16::from_be_bytes([self.pending[0], self.pending[1]]) as usize;
            if record_len < NONCE_LEN + TAG_LEN {
                return Err(CipherError::DecryptFailed);
            }
            if self.pending.len() < 2 + record_len {
                break;
            }

            self.pending.advance(2);
            let record = self.pending.split_to(record_len);
            let nonce = Nonce::from_slice(&record[..NONCE_LEN]);
            let plaintext = self
                .cipher
                .decrypt(nonce, &record[NONCE_LEN..])
                .map_err(|_| CipherError::DecryptFailed)?;
            buf.extend_from_slice(&plaintext);
        }
        Ok(())
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (AeadStream, AeadStream) {
        let key = [7u8; 32];
        (AeadStream::new(&key), AeadStream::new(&key))
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (mut tx, mut rx) = pair();
        let mut buf = BytesMut::from(&b"hello upstream"[..]);
        tx.seal(&mut buf).unwrap();
        assert_ne!(buf.as_ref(), b"hello upstream");
        rx.open(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"hello upstream");
        assert_eq!(rx.pending_len(), 0);
    }

    #[test]
    fn test_open_consumes_partial_input() {
        let (mut tx, mut rx) = pair();
        let mut sealed = BytesMut::from(&b"split across reads"[..]);
        tx.seal(&mut sealed).unwrap();

        let second_half = sealed.split_off(sealed.len() / 2);

        let mut buf = sealed;
        rx.open(&mut buf).unwrap();
        // Half a record: nothing decodable yet, but the input is consumed.
        assert!(buf.is_empty());
        assert!(rx.pending_len() > 0);

        let mut buf = BytesMut::from(&second_half[..]);
        rx.open(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"split across reads");
        assert_eq!(rx.pending_len(), 0);
    }

    #[test]
    fn test_open_multiple_records_in_one_read() {
        let (mut tx, mut rx) = pair();
        let mut first = BytesMut::from(&b"one "[..]);
        let mut second = BytesMut::from(&b"two"[..]);
        tx.seal(&mut first).unwrap();
        tx.seal(&mut second).unwrap();

        let mut buf = first;
        buf.extend_from_slice(&second);
        rx.open(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"one two");
    }

    #[test]
    fn test_tampered_record_rejected() {
        let (mut tx, mut rx) = pair();
        let mut buf = BytesMut::from(&b"integrity"[..]);
        tx.seal(&mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert!(rx.open(&mut buf).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let mut tx = AeadStream::new(&[1u8; 32]);
        let mut rx = AeadStream::new(&[2u8; 32]);
        let mut buf = BytesMut::from(&b"key mismatch"[..]);
        tx.seal(&mut buf).unwrap();
        assert!(rx.open(&mut buf).is_err());
    }

    #[test]
    fn test_large_payload_chunks() {
        let (mut tx, mut rx) = pair();
        let payload = vec![0xA5u8; MAX_PLAINTEXT * 2 + 17];
        let mut buf = BytesMut::from(&payload[..]);
        tx.seal(&mut buf).unwrap();
        rx.open(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), &payload[..]);
    }

    #[test]
    fn test_undersized_record_length_rejected() {
        let mut rx = AeadStream::new(&[7u8; 32]);
        let mut buf = BytesMut::from(&[0x00u8, 0x05, 1, 2, 3, 4, 5][..]);
        assert!(rx.open(&mut buf).is_err());
    }
}
