mod cache;
mod client;
pub mod protocol;

pub use client::HtcfsClient;
pub use protocol::{
    DirectoryEntry, DirectoryEntryType, FsError, HtcfsError, HtcfsResult, OpenDirectoryMode,
    OpenMode,
};
