//! Destination-address wire record
//!
//! The same atyp/addr/port layout appears in three places: the SOCKS5
//! CONNECT request, the SOCKS5 success reply, and the first payload sent
//! upstream (the "init package"). One type covers all three:
//!
//! ```text
//! atyp(1) || [ ipv4(4) | ipv6(16) | len(1) host(len) ] || port(2, big-endian)
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};

use crate::error::{CoreError, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// A destination endpoint as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, port) | Address::Ipv6(_, port) | Address::Domain(_, port) => *port,
        }
    }

    /// The atyp byte this address encodes with.
    pub fn atyp(&self) -> u8 {
        match self {
            Address::Ipv4(..) => ATYP_IPV4,
            Address::Ipv6(..) => ATYP_IPV6,
            Address::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// Encode into the wire record.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(1 + 1 + 255 + 2);
        buf.put_u8(self.atyp());
        match self {
            Address::Ipv4(ip, _) => buf.put_slice(&ip.octets()),
            Address::Ipv6(ip, _) => buf.put_slice(&ip.octets()),
            Address::Domain(host, _) => {
                debug_assert!(host.len() <= 255);
                buf.put_u8(host.len() as u8);
                buf.put_slice(host.as_bytes());
            }
        }
        buf.put_u16(self.port());
        buf
    }

    /// Parse a wire record from the front of `data`.
    ///
    /// Returns the address and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Address, usize)> {
        let atyp = *data.first().ok_or(CoreError::MalformedAddress)?;
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 1 + 4 + 2 {
                    return Err(CoreError::MalformedAddress);
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ipv4(ip, port), 7))
            }
            ATYP_IPV6 => {
                if data.len() < 1 + 16 + 2 {
                    return Err(CoreError::MalformedAddress);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((Address::Ipv6(Ipv6Addr::from(octets), port), 19))
            }
            ATYP_DOMAIN => {
                let len = *data.get(1).ok_or(CoreError::MalformedAddress)? as usize;
                if data.len() < 2 + len + 2 {
                    return Err(CoreError::MalformedAddress);
                }
                let host = std::str::from_utf8(&data[2..2 + len])
                    .map_err(|_| CoreError::MalformedAddress)?
                    .to_string();
                let port = u16::from_be_bytes([data[2 + len], data[3 + len]]);
                Ok((Address::Domain(host, port), 2 + len + 2))
            }
            _ => Err(CoreError::MalformedAddress),
        }
    }

    /// The socket address, if this is a literal IP.
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            Address::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            Address::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Address::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::Ipv6(*v6.ip(), v6.port()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            Address::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            Address::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Length of the address record at the front of an init package.
///
/// The obfuscation layer needs to know how many leading plaintext bytes are
/// header rather than stream data. Falls back to `default` when the record
/// does not parse.
pub fn s5_head_size(pkg: &[u8], default: usize) -> usize {
    match Address::parse(pkg) {
        Ok((_, consumed)) => consumed,
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_round_trip() {
        let addr = Address::Ipv4(Ipv4Addr::new(8, 8, 4, 4), 443);
        let encoded = addr.encode();
        let (parsed, consumed) = Address::parse(&encoded).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_ipv6_round_trip() {
        let addr = Address::Ipv6("2001:db8::2:1".parse().unwrap(), 8080);
        let encoded = addr.encode();
        let (parsed, consumed) = Address::parse(&encoded).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_domain_round_trip() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let encoded = addr.encode();
        let (parsed, consumed) = Address::parse(&encoded).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_ipv4_wire_layout() {
        let addr = Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 0x1F90);
        assert_eq!(
            addr.encode().as_ref(),
            &[0x01, 127, 0, 0, 1, 0x1F, 0x90][..]
        );
    }

    #[test]
    fn test_domain_wire_layout() {
        let addr = Address::Domain("ab".to_string(), 80);
        assert_eq!(addr.encode().as_ref(), &[0x03, 2, b'a', b'b', 0, 80][..]);
    }

    #[test]
    fn test_parse_truncated() {
        assert!(Address::parse(&[0x01, 127, 0, 0]).is_err());
        assert!(Address::parse(&[0x03, 5, b'a']).is_err());
        assert!(Address::parse(&[]).is_err());
    }

    #[test]
    fn test_parse_bad_atyp() {
        assert!(Address::parse(&[0x02, 0, 0, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_head_size_fallback() {
        let addr = Address::Domain("example.com".to_string(), 80);
        let encoded = addr.encode();
        assert_eq!(s5_head_size(&encoded, 30), encoded.len());
        assert_eq!(s5_head_size(&[0xFF, 1, 2], 30), 30);
    }

    #[test]
    fn test_to_socket_addr() {
        let addr = Address::Ipv4(Ipv4Addr::new(1, 2, 3, 4), 9);
        assert_eq!(addr.to_socket_addr().unwrap().to_string(), "1.2.3.4:9");
        assert!(Address::Domain("x".into(), 1).to_socket_addr().is_none());
    }
}
