//! HTCFS request/response protocol riding the RPC prelude.

use bitflags::bitflags;
use strum::FromRepr;
use thiserror::Error;

pub const HTCFS_PROTOCOL: u16 = 1;
pub const MAX_PROTOCOL_VERSION: u16 = 1;

/// Largest response body deliverable on the RPC channel; anything bigger
/// streams over a bulk data channel.
pub const MAX_RPC_BODY_SIZE: usize = 0x4000 - tether_wire::HEADER_SIZE;

/// Initial file payload cached from an open response.
pub const FILE_DATA_CACHE_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum FsPacketType {
    GetMaxProtocolVersion = 0,
    SetProtocolVersion = 1,
    GetEntryType = 16,
    OpenFile = 32,
    CloseFile = 33,
    GetPriorityForFile = 34,
    SetPriorityForFile = 35,
    CreateFile = 36,
    DeleteFile = 37,
    RenameFile = 38,
    FileExists = 39,
    ReadFile = 40,
    WriteFile = 41,
    FlushFile = 42,
    GetFileTimeStamp = 43,
    GetFileSize = 44,
    SetFileSize = 45,
    ReadFileLarge = 46,
    WriteFileLarge = 47,
    OpenDirectory = 48,
    CloseDirectory = 49,
    GetPriorityForDirectory = 50,
    SetPriorityForDirectory = 51,
    CreateDirectory = 52,
    DeleteDirectory = 53,
    RenameDirectory = 54,
    DirectoryExists = 55,
    ReadDirectory = 56,
    GetEntryCount = 57,
    GetWorkingDirectory = 58,
    GetWorkingDirectorySize = 59,
    GetCaseSensitivePath = 60,
    GetDiskFreeSpace = 61,
    ReadDirectoryLarge = 62,
}

/// Host-side status carried in `params[0]` of every response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum HtcfsResult {
    Success = 0,
    UnknownError = 1,
    UnsupportedProtocolVersion = 2,
    InvalidRequest = 3,
    InvalidHandle = 4,
    OutOfHandle = 5,
    Ready = 6,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtcfsError {
    #[error("connection failure")]
    ConnectionFailure,
    #[error("transport channel closed mid-operation")]
    HtclowChannelClosed,
    #[error("unexpected response protocol id")]
    UnexpectedResponseProtocolId,
    #[error("unexpected response packet category")]
    UnexpectedResponsePacketCategory,
    #[error("unexpected response packet type")]
    UnexpectedResponsePacketType,
    #[error("unexpected response protocol version")]
    UnexpectedResponseProtocolVersion,
    #[error("unexpected response body size")]
    UnexpectedResponseBodySize,
    #[error("unsupported protocol version")]
    UnsupportedProtocolVersion,
    #[error("host reported an unknown error")]
    UnknownError,
    #[error("host rejected the request")]
    InvalidRequest,
    #[error("host rejected the handle")]
    InvalidHandle,
    #[error("host is out of handles")]
    OutOfHandle,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("host filesystem result {0}")]
    HostResult(i64),
    #[error("internal error")]
    InternalError,
}

/// Converts a response's `params[0]` into a client result.
pub fn convert_htcfs_result(param: u64) -> Result<(), HtcfsError> {
    match HtcfsResult::from_repr(param as u16) {
        Some(HtcfsResult::Success) => Ok(()),
        Some(HtcfsResult::UnsupportedProtocolVersion) => Err(HtcfsError::UnsupportedProtocolVersion),
        Some(HtcfsResult::InvalidRequest) => Err(HtcfsError::InvalidRequest),
        Some(HtcfsResult::InvalidHandle) => Err(HtcfsError::InvalidHandle),
        Some(HtcfsResult::OutOfHandle) => Err(HtcfsError::OutOfHandle),
        Some(HtcfsResult::Ready) | Some(HtcfsResult::UnknownError) | None => {
            Err(HtcfsError::UnknownError)
        }
    }
}

/// Converts a response's `params[1]` (the host's native filesystem result).
pub fn convert_native_result(param: u64) -> Result<(), HtcfsError> {
    if param == 0 { Ok(()) } else { Err(HtcfsError::HostResult(param as i64)) }
}

/// Filesystem-layer error the embedding fs frontend reports to callers.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("target not found")]
    TargetNotFound,
    #[error("open count limit reached")]
    OpenCountLimit,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("internal error")]
    Internal,
    #[error(transparent)]
    Other(HtcfsError),
}

pub fn to_fs_result(e: HtcfsError) -> FsError {
    match e {
        HtcfsError::ConnectionFailure | HtcfsError::HtclowChannelClosed => FsError::TargetNotFound,
        HtcfsError::OutOfHandle => FsError::OpenCountLimit,
        HtcfsError::InvalidArgument => FsError::InvalidArgument,
        HtcfsError::InternalError => FsError::Internal,
        other => FsError::Other(other),
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenMode: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenDirectoryMode: u32 {
        const DIRECTORIES = 1 << 0;
        const FILES = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum DirectoryEntryType {
    Directory = 0,
    File = 1,
}

/// Fixed-size directory entry as exchanged with the host.
///
/// Layout: name (0x301 bytes, NUL-terminated), pad to 0x304, type (u8),
/// pad to 0x308, file size (i64); 0x310 bytes total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub entry_type: DirectoryEntryType,
    pub file_size: i64,
}

impl DirectoryEntry {
    pub const WIRE_SIZE: usize = 0x310;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        let name = self.name.as_bytes();
        debug_assert!(name.len() < 0x301);
        out[..name.len().min(0x300)].copy_from_slice(&name[..name.len().min(0x300)]);
        out[0x304] = self.entry_type as u8;
        out[0x308..0x310].copy_from_slice(&self.file_size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        let name_end = bytes[..0x301].iter().position(|&b| b == 0).unwrap_or(0x300);
        Some(Self {
            name: String::from_utf8_lossy(&bytes[..name_end]).into_owned(),
            entry_type: DirectoryEntryType::from_repr(bytes[0x304])?,
            file_size: i64::from_le_bytes(bytes[0x308..0x310].try_into().unwrap()),
        })
    }
}
