//! Authentication and access policy
//!
//! Consulted by the stage machine before replying to the greeting and
//! before any outbound connect.

use std::net::{IpAddr, SocketAddr};

/// Policy hooks evaluated per tunnel.
pub trait AccessPolicy: Send + Sync {
    /// Whether the no-auth method may be selected.
    fn can_auth_none(&self) -> bool {
        true
    }

    /// Whether username/password auth may be selected. The auth exchange
    /// itself is not implemented; a `true` here only shuts the tunnel
    /// down later in the handshake.
    fn can_auth_passwd(&self) -> bool {
        false
    }

    /// Whether the resolved upstream address may be dialed.
    fn can_access(&self, addr: &SocketAddr) -> bool;
}

/// Default policy: everything is reachable in debug builds; release
/// builds reject loopback destinations.
pub struct DefaultPolicy;

impl AccessPolicy for DefaultPolicy {
    fn can_access(&self, addr: &SocketAddr) -> bool {
        if cfg!(debug_assertions) {
            return true;
        }
        !is_loopback_destination(addr.ip())
    }
}

/// True for 127.0.0.0/8, `::1`, and v4-mapped `::ffff:127.x.x.x`.
pub fn is_loopback_destination(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 0x7F,
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            match v6.to_ipv4_mapped() {
                Some(mapped) => mapped.octets()[0] == 0x7F,
                None => false,
            }
        }
    }
}
