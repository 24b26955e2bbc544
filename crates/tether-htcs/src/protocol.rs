//! Socket RPC protocol riding the shared prelude.
//!
//! Requests carry the client-side task id in `params[4]`; responses echo it
//! so concurrently outstanding operations demultiplex on the one RPC
//! channel. `params[0]` of a response is the host errno (0 on success) and
//! `params[1]` the operation value (-1 on failure).

use strum::FromRepr;
use thiserror::Error;

pub const MAX_PROTOCOL_VERSION: u16 = 1;

/// Host errno values surfaced through the bridge.
pub const EINTR: i32 = 4;
pub const ENETDOWN: i32 = 100;
pub const ENOTCONN: i32 = 107;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum SocketPacketType {
    GetMaxProtocolVersion = 0,
    SetProtocolVersion = 1,
    Socket = 16,
    Close = 17,
    Connect = 18,
    Bind = 19,
    Listen = 20,
    Accept = 21,
    Recv = 22,
    Send = 23,
    Shutdown = 24,
    Fcntl = 25,
    Select = 26,
    RecvLarge = 27,
    SendLarge = 28,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtcsError {
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("transport channel closed mid-operation")]
    ChannelClosed,
    #[error("unexpected response")]
    UnexpectedResponse,
    #[error("unknown socket descriptor")]
    UnknownDescriptor,
    #[error("operation cancelled")]
    Cancelled,
    #[error("host errno {0}")]
    Host(i32),
}

/// Peer name: a target name plus a port name, both short ASCII strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SockAddrHtcs {
    pub peer_name: String,
    pub port_name: String,
}

impl SockAddrHtcs {
    pub const PEER_NAME_MAX: usize = 32;
    pub const PORT_NAME_MAX: usize = 32;
    pub const WIRE_SIZE: usize = Self::PEER_NAME_MAX + Self::PORT_NAME_MAX;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let peer = self.peer_name.as_bytes();
        let port = self.port_name.as_bytes();
        debug_assert!(peer.len() < Self::PEER_NAME_MAX && port.len() < Self::PORT_NAME_MAX);
        out[..peer.len().min(Self::PEER_NAME_MAX - 1)]
            .copy_from_slice(&peer[..peer.len().min(Self::PEER_NAME_MAX - 1)]);
        let port_off = Self::PEER_NAME_MAX;
        out[port_off..port_off + port.len().min(Self::PORT_NAME_MAX - 1)]
            .copy_from_slice(&port[..port.len().min(Self::PORT_NAME_MAX - 1)]);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        let cstr = |field: &[u8]| {
            let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
            String::from_utf8_lossy(&field[..end]).into_owned()
        };
        Some(Self {
            peer_name: cstr(&bytes[..Self::PEER_NAME_MAX]),
            port_name: cstr(&bytes[Self::PEER_NAME_MAX..Self::WIRE_SIZE]),
        })
    }
}
