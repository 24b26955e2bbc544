mod channel_id;
mod packet;
mod rpc;

pub use channel_id::{ChannelId, ModuleId};
pub use packet::{
    Command, HEADER_SIZE, MAX_BODY_SIZE, PacketHeader, WindowUpdate, WireError, fragment,
};
pub use rpc::{PacketCategory, RPC_HEADER_SIZE, RPC_PROTOCOL, RpcHeader};
