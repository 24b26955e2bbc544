use thiserror::Error;

/// Transport-layer results surfaced to channel consumers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("connection failure")]
    ConnectionFailure,
    #[error("channel does not exist")]
    ChannelNotExist,
    #[error("channel already exists")]
    ChannelAlreadyExist,
    #[error("operation invalid in current channel state")]
    InvalidChannelState,
    #[error("receive buffer empty")]
    ReceiveBufferEmpty,
    #[error("channel wait cancelled")]
    ChannelWaitCancelled,
    #[error("task queue not available")]
    TaskQueueNotAvailable,
    #[error("argument out of range")]
    InvalidArgument,
    #[error("transport suspended")]
    Suspended,
}
