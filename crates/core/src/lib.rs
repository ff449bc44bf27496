//! Shared types for the VeilTunnel proxy client.
//!
//! Home of the destination-address wire record, the client configuration,
//! and the error type common to the workspace crates.

pub mod address;
pub mod config;
pub mod error;

pub use address::{s5_head_size, Address};
pub use config::Config;
pub use error::{CoreError, Result};

/// Capacity of every per-socket receive buffer.
///
/// Reads are discrete: a completed read parks the socket until the buffer
/// has been drained and the read is re-armed, so one buffer per direction
/// is enough.
pub const SSR_BUFF_SIZE: usize = 16 * 1024;

/// MTU handed to the cipher context when a CONNECT session is created.
pub const TUNNEL_MTU: usize = 1452;
