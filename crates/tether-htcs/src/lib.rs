mod protocol;
mod service;

pub use protocol::{EINTR, ENETDOWN, ENOTCONN, HtcsError, SockAddrHtcs, SocketPacketType};
pub use service::HtcsService;
