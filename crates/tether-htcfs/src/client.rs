use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use tether_htclow::{
    Channel, ChannelConfig, ChannelError, ChannelId, ChannelState, HtclowManager, ModuleId,
    ReceiveOption,
};
use tether_utils::{ClearMode, Event, ThreadPriority, spawn_named};
use tether_wire::{PacketCategory, RPC_HEADER_SIZE, RPC_PROTOCOL, RpcHeader};
use tracing::{debug, info, warn};

use crate::{
    cache::CacheManager,
    protocol::{
        DirectoryEntry, DirectoryEntryType, FILE_DATA_CACHE_SIZE, FsPacketType, HtcfsError,
        HtcfsResult, MAX_PROTOCOL_VERSION, MAX_RPC_BODY_SIZE, OpenDirectoryMode, OpenMode,
        convert_htcfs_result, convert_native_result,
    },
};

const RPC_CHANNEL: u16 = 0;
const DATA_CHANNEL: u16 = 1;
const CHANNEL_BUFFER_SIZE: usize = 0x1C040;

fn map_channel_err(_: ChannelError) -> HtcfsError {
    HtcfsError::ConnectionFailure
}

struct RpcState {
    channel: Channel,
    version: u16,
}

struct Inner {
    manager: Arc<HtclowManager>,
    rpc: Mutex<RpcState>,
    connected: AtomicBool,
    cancel: Event,
    cache: CacheManager,
}

/// Remote-filesystem RPC client. A monitor thread keeps the RPC channel
/// alive and renegotiates the protocol across host reconnects; operations
/// serialize on the client mutex.
pub struct HtcfsClient {
    inner: Arc<Inner>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl HtcfsClient {
    pub fn new(manager: Arc<HtclowManager>) -> Arc<Self> {
        let rpc_channel =
            Channel::new(manager.clone(), ChannelId::new(ModuleId::Htcfs, RPC_CHANNEL));
        let inner = Arc::new(Inner {
            manager,
            rpc: Mutex::new(RpcState { channel: rpc_channel, version: 0 }),
            connected: AtomicBool::new(false),
            cancel: Event::new(ClearMode::Manual),
            cache: CacheManager::new(FILE_DATA_CACHE_SIZE),
        });

        let monitor_inner = inner.clone();
        let monitor = spawn_named("htcfs-monitor", ThreadPriority::Low, move || {
            monitor_body(&monitor_inner);
        })
        .expect("couldn't spawn htcfs monitor");

        Arc::new(Self { inner, monitor: Mutex::new(Some(monitor)) })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.inner.cancel.signal();
    }

    pub fn wait(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
    }

    fn ensure_ready(&self) -> Result<(), HtcfsError> {
        if self.inner.cancel.try_wait() || !self.is_connected() {
            return Err(HtcfsError::ConnectionFailure);
        }
        Ok(())
    }

    fn request(
        &self,
        rpc: &RpcState,
        packet_type: FsPacketType,
        body_size: u64,
        params: [u64; 5],
    ) -> RpcHeader {
        RpcHeader::request(rpc.version, packet_type as u16, body_size, params)
    }

    // ------------------------------------------------------------------
    // Path operations
    // ------------------------------------------------------------------

    pub fn open_file(
        &self,
        path: &str,
        mode: OpenMode,
        case_sensitive: bool,
    ) -> Result<i32, HtcfsError> {
        self.inner.cache.invalidate();
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;

        let request = self.request(
            &rpc,
            FsPacketType::OpenFile,
            path.len() as u64,
            [mode.bits() as u64, case_sensitive as u64, FILE_DATA_CACHE_SIZE as u64, 0, 0],
        );
        send_request(&rpc.channel, &request, path.as_bytes(), &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::OpenFile, None)?;
        let body = recv_bounded_body(&rpc.channel, &response)?;

        convert_htcfs_result(response.params[0])?;
        convert_native_result(response.params[1])?;

        let handle = response.params[2] as i32;
        if response.params[3] != 0 {
            self.inner.cache.record(response.params[4] as i64, &body, handle);
        }
        Ok(handle)
    }

    pub fn file_exists(&self, path: &str, case_sensitive: bool) -> Result<bool, HtcfsError> {
        self.query_path(FsPacketType::FileExists, path, case_sensitive)
            .map(|params| params[2] != 0)
    }

    pub fn delete_file(&self, path: &str, case_sensitive: bool) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate();
        self.query_path(FsPacketType::DeleteFile, path, case_sensitive).map(|_| ())
    }

    pub fn rename_file(
        &self,
        old_path: &str,
        new_path: &str,
        case_sensitive: bool,
    ) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate();
        self.rename(FsPacketType::RenameFile, old_path, new_path, case_sensitive)
    }

    pub fn get_entry_type(
        &self,
        path: &str,
        case_sensitive: bool,
    ) -> Result<DirectoryEntryType, HtcfsError> {
        let params = self.query_path(FsPacketType::GetEntryType, path, case_sensitive)?;
        DirectoryEntryType::from_repr(params[2] as u8).ok_or(HtcfsError::UnknownError)
    }

    pub fn create_file(&self, path: &str, size: i64, case_sensitive: bool) -> Result<(), HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            FsPacketType::CreateFile,
            path.len() as u64,
            [size as u64, case_sensitive as u64, 0, 0, 0],
        );
        self.roundtrip_no_body(&rpc, &request, FsPacketType::CreateFile, path.as_bytes(), &[])
            .map(|_| ())
    }

    pub fn get_file_timestamp(
        &self,
        path: &str,
        case_sensitive: bool,
    ) -> Result<(u64, u64, u64), HtcfsError> {
        let params = self.query_path(FsPacketType::GetFileTimeStamp, path, case_sensitive)?;
        Ok((params[2], params[3], params[4]))
    }

    pub fn get_case_sensitive_path(&self, path: &str) -> Result<String, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request =
            self.request(&rpc, FsPacketType::GetCaseSensitivePath, path.len() as u64, [0; 5]);
        send_request(&rpc.channel, &request, path.as_bytes(), &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::GetCaseSensitivePath, None)?;
        let body = recv_bounded_body(&rpc.channel, &response)?;

        convert_htcfs_result(response.params[0])?;
        convert_native_result(response.params[1])?;
        String::from_utf8(body).map_err(|_| HtcfsError::UnknownError)
    }

    pub fn get_disk_free_space(&self, path: &str) -> Result<(i64, i64, i64), HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request =
            self.request(&rpc, FsPacketType::GetDiskFreeSpace, path.len() as u64, [0; 5]);
        let params = self.roundtrip_no_body(
            &rpc,
            &request,
            FsPacketType::GetDiskFreeSpace,
            path.as_bytes(),
            &[],
        )?;
        Ok((params[2] as i64, params[3] as i64, params[4] as i64))
    }

    pub fn open_directory(
        &self,
        path: &str,
        mode: OpenDirectoryMode,
        case_sensitive: bool,
    ) -> Result<i32, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            FsPacketType::OpenDirectory,
            path.len() as u64,
            [mode.bits() as u64, case_sensitive as u64, 0, 0, 0],
        );
        let params = self.roundtrip_no_body(
            &rpc,
            &request,
            FsPacketType::OpenDirectory,
            path.as_bytes(),
            &[],
        )?;
        Ok(params[2] as i32)
    }

    pub fn directory_exists(&self, path: &str, case_sensitive: bool) -> Result<bool, HtcfsError> {
        self.query_path(FsPacketType::DirectoryExists, path, case_sensitive)
            .map(|params| params[2] != 0)
    }

    pub fn create_directory(&self, path: &str, case_sensitive: bool) -> Result<(), HtcfsError> {
        self.query_path(FsPacketType::CreateDirectory, path, case_sensitive).map(|_| ())
    }

    pub fn delete_directory(
        &self,
        path: &str,
        recursively: bool,
        case_sensitive: bool,
    ) -> Result<(), HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            FsPacketType::DeleteDirectory,
            path.len() as u64,
            [recursively as u64, case_sensitive as u64, 0, 0, 0],
        );
        self.roundtrip_no_body(&rpc, &request, FsPacketType::DeleteDirectory, path.as_bytes(), &[])
            .map(|_| ())
    }

    pub fn rename_directory(
        &self,
        old_path: &str,
        new_path: &str,
        case_sensitive: bool,
    ) -> Result<(), HtcfsError> {
        self.rename(FsPacketType::RenameDirectory, old_path, new_path, case_sensitive)
    }

    // ------------------------------------------------------------------
    // Directory handle operations
    // ------------------------------------------------------------------

    pub fn close_directory(&self, handle: i32) -> Result<(), HtcfsError> {
        self.handle_op(FsPacketType::CloseDirectory, [handle as u64, 0, 0, 0, 0]).map(|_| ())
    }

    pub fn get_entry_count(&self, handle: i32) -> Result<i64, HtcfsError> {
        self.handle_op(FsPacketType::GetEntryCount, [handle as u64, 0, 0, 0, 0])
            .map(|params| params[2] as i64)
    }

    pub fn read_directory(
        &self,
        handle: i32,
        max_entries: usize,
    ) -> Result<Vec<DirectoryEntry>, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            FsPacketType::ReadDirectory,
            0,
            [handle as u64, max_entries as u64, 0, 0, 0],
        );
        send_request(&rpc.channel, &request, &[], &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::ReadDirectory, None)?;
        let body = recv_bounded_body(&rpc.channel, &response)?;

        convert_htcfs_result(response.params[0])?;
        convert_native_result(response.params[1])?;
        decode_entries(&body, response.params[2] as usize)
    }

    /// Directory listing too large for the RPC channel; entries stream over
    /// a bulk data channel.
    pub fn read_directory_large(
        &self,
        handle: i32,
        max_entries: usize,
    ) -> Result<Vec<DirectoryEntry>, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;

        let byte_budget = max_entries.saturating_mul(DirectoryEntry::WIRE_SIZE);
        let data = self.open_data_channel_for_receive(byte_budget)?;
        let result = (|| {
            let request = self.request(
                &rpc,
                FsPacketType::ReadDirectoryLarge,
                0,
                [handle as u64, max_entries as u64, DATA_CHANNEL as u64, 0, 0],
            );
            let params = self.roundtrip_no_body(
                &rpc,
                &request,
                FsPacketType::ReadDirectoryLarge,
                &[],
                &[],
            )?;
            let count = params[2] as usize;
            if count > max_entries {
                return Err(HtcfsError::UnexpectedResponseBodySize);
            }
            let mut body = vec![0u8; count * DirectoryEntry::WIRE_SIZE];
            data.receive(&mut body, ReceiveOption::All).map_err(map_channel_err)?;
            decode_entries(&body, count)
        })();
        data.close();
        result
    }

    pub fn get_priority_for_directory(&self, handle: i32) -> Result<i32, HtcfsError> {
        self.handle_op(FsPacketType::GetPriorityForDirectory, [handle as u64, 0, 0, 0, 0])
            .map(|params| params[2] as i32)
    }

    pub fn set_priority_for_directory(&self, priority: i32, handle: i32) -> Result<(), HtcfsError> {
        self.handle_op(
            FsPacketType::SetPriorityForDirectory,
            [handle as u64, priority as u64, 0, 0, 0],
        )
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // File handle operations
    // ------------------------------------------------------------------

    pub fn close_file(&self, handle: i32) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate_handle(handle);
        self.handle_op(FsPacketType::CloseFile, [handle as u64, 0, 0, 0, 0]).map(|_| ())
    }

    pub fn read_file(&self, dst: &mut [u8], handle: i32, offset: i64) -> Result<usize, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;

        if offset >= 0 {
            if let Some(n) = self.inner.cache.read(dst, handle, offset as usize) {
                return Ok(n);
            }
        }

        let request = self.request(
            &rpc,
            FsPacketType::ReadFile,
            0,
            [handle as u64, offset as u64, dst.len() as u64, 0, 0],
        );
        send_request(&rpc.channel, &request, &[], &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::ReadFile, None)?;

        // Failures never carry a body.
        if let Err(e) = convert_htcfs_result(response.params[0]) {
            return if response.body_size == 0 {
                Err(e)
            } else {
                Err(HtcfsError::UnexpectedResponseBodySize)
            };
        }
        if let Err(e) = convert_native_result(response.params[1]) {
            return if response.body_size == 0 {
                Err(e)
            } else {
                Err(HtcfsError::UnexpectedResponseBodySize)
            };
        }

        let size = response.body_size as usize;
        if size > dst.len() {
            return Err(HtcfsError::UnexpectedResponseBodySize);
        }
        recv_exact(&rpc.channel, &mut dst[..size])?;
        Ok(size)
    }

    /// Read whose payload exceeds the RPC body budget: the host streams to a
    /// bulk-receive data channel opened for the duration of the call.
    pub fn read_file_large(
        &self,
        dst: &mut [u8],
        handle: i32,
        offset: i64,
    ) -> Result<usize, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;

        let data = self.open_data_channel_for_receive(dst.len())?;
        let result = (|| {
            let request = self.request(
                &rpc,
                FsPacketType::ReadFileLarge,
                0,
                [handle as u64, offset as u64, dst.len() as u64, DATA_CHANNEL as u64, 0],
            );
            let params = self.roundtrip_no_body(
                &rpc,
                &request,
                FsPacketType::ReadFileLarge,
                &[],
                &[],
            )?;

            let size = params[2] as usize;
            if size > dst.len() {
                return Err(HtcfsError::UnexpectedResponseBodySize);
            }
            data.receive(&mut dst[..size], ReceiveOption::All).map_err(map_channel_err)?;
            Ok(size)
        })();
        data.close();
        result
    }

    pub fn write_file(
        &self,
        buffer: &[u8],
        handle: i32,
        offset: i64,
        flush: bool,
    ) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate_handle(handle);
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            FsPacketType::WriteFile,
            buffer.len() as u64,
            [handle as u64, flush as u64, offset as u64, 0, 0],
        );
        self.roundtrip_no_body(&rpc, &request, FsPacketType::WriteFile, buffer, &[]).map(|_| ())
    }

    /// Large write: the host acknowledges readiness, the payload streams
    /// over a bulk-send data channel, and a second response closes out the
    /// operation.
    pub fn write_file_large(
        &self,
        buffer: &[u8],
        handle: i32,
        offset: i64,
        flush: bool,
    ) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate_handle(handle);
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;

        let request = self.request(
            &rpc,
            FsPacketType::WriteFileLarge,
            0,
            [handle as u64, flush as u64, offset as u64, buffer.len() as u64, DATA_CHANNEL as u64],
        );
        send_request(&rpc.channel, &request, &[], &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::WriteFileLarge, Some(0))?;
        if HtcfsResult::from_repr(response.params[0] as u16) != Some(HtcfsResult::Ready) {
            convert_htcfs_result(response.params[0])?;
            return Err(HtcfsError::UnknownError);
        }

        {
            let data = Channel::new(
                self.inner.manager.clone(),
                ChannelId::new(ModuleId::Htcfs, DATA_CHANNEL),
            );
            data.open().map_err(map_channel_err)?;
            let result = (|| {
                data.set_config(ChannelConfig::BULK_SEND).map_err(map_channel_err)?;
                data.set_send_buffer_with_data(buffer).map_err(map_channel_err)?;
                data.connect().map_err(map_channel_err)?;
                data.flush().map_err(map_channel_err)
            })();
            data.close();
            result?;
        }

        let final_response = recv_response(&rpc.channel)?;
        check_response(&rpc, &final_response, FsPacketType::WriteFileLarge, Some(0))?;
        convert_htcfs_result(final_response.params[0])?;
        convert_native_result(final_response.params[1])
    }

    pub fn get_file_size(&self, handle: i32) -> Result<i64, HtcfsError> {
        {
            let _rpc = self.inner.rpc.lock();
            self.ensure_ready()?;
            if let Some(size) = self.inner.cache.file_size(handle) {
                return Ok(size);
            }
        }
        self.handle_op(FsPacketType::GetFileSize, [handle as u64, 0, 0, 0, 0])
            .map(|params| params[2] as i64)
    }

    pub fn set_file_size(&self, size: i64, handle: i32) -> Result<(), HtcfsError> {
        self.inner.cache.invalidate_handle(handle);
        self.handle_op(FsPacketType::SetFileSize, [handle as u64, size as u64, 0, 0, 0])
            .map(|_| ())
    }

    pub fn flush_file(&self, handle: i32) -> Result<(), HtcfsError> {
        self.handle_op(FsPacketType::FlushFile, [handle as u64, 0, 0, 0, 0]).map(|_| ())
    }

    pub fn get_priority_for_file(&self, handle: i32) -> Result<i32, HtcfsError> {
        self.handle_op(FsPacketType::GetPriorityForFile, [handle as u64, 0, 0, 0, 0])
            .map(|params| params[2] as i32)
    }

    pub fn set_priority_for_file(&self, priority: i32, handle: i32) -> Result<(), HtcfsError> {
        self.handle_op(FsPacketType::SetPriorityForFile, [handle as u64, priority as u64, 0, 0, 0])
            .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Working directory
    // ------------------------------------------------------------------

    pub fn get_working_directory(&self) -> Result<String, HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(&rpc, FsPacketType::GetWorkingDirectory, 0, [0; 5]);
        send_request(&rpc.channel, &request, &[], &[])?;

        let response = recv_response(&rpc.channel)?;
        check_response(&rpc, &response, FsPacketType::GetWorkingDirectory, None)?;
        let body = recv_bounded_body(&rpc.channel, &response)?;
        convert_htcfs_result(response.params[0])?;
        convert_native_result(response.params[1])?;
        String::from_utf8(body).map_err(|_| HtcfsError::UnknownError)
    }

    pub fn get_working_directory_size(&self) -> Result<i32, HtcfsError> {
        self.handle_op(FsPacketType::GetWorkingDirectorySize, [0; 5])
            .map(|params| params[2] as i32)
    }

    // ------------------------------------------------------------------
    // Shared request shapes
    // ------------------------------------------------------------------

    /// Path-carrying request whose only variable params are the path and
    /// case sensitivity.
    fn query_path(
        &self,
        packet_type: FsPacketType,
        path: &str,
        case_sensitive: bool,
    ) -> Result<[u64; 5], HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            packet_type,
            path.len() as u64,
            [case_sensitive as u64, 0, 0, 0, 0],
        );
        self.roundtrip_no_body(&rpc, &request, packet_type, path.as_bytes(), &[])
    }

    fn rename(
        &self,
        packet_type: FsPacketType,
        old_path: &str,
        new_path: &str,
        case_sensitive: bool,
    ) -> Result<(), HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(
            &rpc,
            packet_type,
            (old_path.len() + new_path.len()) as u64,
            [old_path.len() as u64, new_path.len() as u64, case_sensitive as u64, 0, 0],
        );
        self.roundtrip_no_body(&rpc, &request, packet_type, old_path.as_bytes(), new_path.as_bytes())
            .map(|_| ())
    }

    /// Handle-carrying request with no body in either direction.
    fn handle_op(
        &self,
        packet_type: FsPacketType,
        params: [u64; 5],
    ) -> Result<[u64; 5], HtcfsError> {
        let rpc = self.inner.rpc.lock();
        self.ensure_ready()?;
        let request = self.request(&rpc, packet_type, 0, params);
        self.roundtrip_no_body(&rpc, &request, packet_type, &[], &[])
    }

    /// Sends a request and validates a body-less response, returning its
    /// params after both result slots check out.
    fn roundtrip_no_body(
        &self,
        rpc: &RpcState,
        request: &RpcHeader,
        packet_type: FsPacketType,
        arg1: &[u8],
        arg2: &[u8],
    ) -> Result<[u64; 5], HtcfsError> {
        send_request(&rpc.channel, request, arg1, arg2)?;
        let response = recv_response(&rpc.channel)?;
        check_response(rpc, &response, packet_type, Some(0))?;
        convert_htcfs_result(response.params[0])?;
        convert_native_result(response.params[1])?;
        Ok(response.params)
    }

    fn open_data_channel_for_receive(&self, size: usize) -> Result<Channel, HtcfsError> {
        let data = Channel::new(
            self.inner.manager.clone(),
            ChannelId::new(ModuleId::Htcfs, DATA_CHANNEL),
        );
        data.open().map_err(map_channel_err)?;
        let setup = (|| {
            data.set_config(ChannelConfig::BULK_RECEIVE).map_err(map_channel_err)?;
            data.set_receive_buffer_size(size.max(1)).map_err(map_channel_err)?;
            data.connect().map_err(map_channel_err)
        })();
        if let Err(e) = setup {
            data.close();
            return Err(e);
        }
        Ok(data)
    }
}

impl Drop for HtcfsClient {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

// ----------------------------------------------------------------------
// Wire helpers
// ----------------------------------------------------------------------

fn send_request(
    channel: &Channel,
    request: &RpcHeader,
    arg1: &[u8],
    arg2: &[u8],
) -> Result<(), HtcfsError> {
    let mut bytes = Vec::with_capacity(RPC_HEADER_SIZE + arg1.len() + arg2.len());
    bytes.extend_from_slice(&request.encode());
    bytes.extend_from_slice(arg1);
    bytes.extend_from_slice(arg2);

    let sent = channel.send(&bytes).map_err(map_channel_err)?;
    if sent != bytes.len() {
        return Err(HtcfsError::HtclowChannelClosed);
    }
    channel.flush().map_err(map_channel_err)
}

fn recv_exact(channel: &Channel, dst: &mut [u8]) -> Result<(), HtcfsError> {
    let received = channel.receive(dst, ReceiveOption::All).map_err(map_channel_err)?;
    if received != dst.len() {
        return Err(HtcfsError::HtclowChannelClosed);
    }
    Ok(())
}

fn recv_response(channel: &Channel) -> Result<RpcHeader, HtcfsError> {
    let mut bytes = [0u8; RPC_HEADER_SIZE];
    recv_exact(channel, &mut bytes)?;
    RpcHeader::decode(&bytes).ok_or(HtcfsError::UnexpectedResponsePacketCategory)
}

fn recv_bounded_body(channel: &Channel, response: &RpcHeader) -> Result<Vec<u8>, HtcfsError> {
    let size = response.body_size as usize;
    if response.body_size > MAX_RPC_BODY_SIZE as u64 {
        return Err(HtcfsError::UnexpectedResponseBodySize);
    }
    let mut body = vec![0u8; size];
    if size > 0 {
        recv_exact(channel, &mut body)?;
    }
    Ok(body)
}

fn check_response_without_version(
    response: &RpcHeader,
    packet_type: FsPacketType,
) -> Result<(), HtcfsError> {
    if response.protocol != RPC_PROTOCOL {
        return Err(HtcfsError::UnexpectedResponseProtocolId);
    }
    if response.category != PacketCategory::Response {
        return Err(HtcfsError::UnexpectedResponsePacketCategory);
    }
    if response.packet_type != packet_type as u16 {
        return Err(HtcfsError::UnexpectedResponsePacketType);
    }
    Ok(())
}

fn check_response(
    rpc: &RpcState,
    response: &RpcHeader,
    packet_type: FsPacketType,
    body_size: Option<u64>,
) -> Result<(), HtcfsError> {
    check_response_without_version(response, packet_type)?;
    if response.version != rpc.version {
        return Err(HtcfsError::UnexpectedResponseProtocolVersion);
    }
    if let Some(expected) = body_size {
        if response.body_size != expected {
            return Err(HtcfsError::UnexpectedResponseBodySize);
        }
    }
    Ok(())
}

fn decode_entries(body: &[u8], count: usize) -> Result<Vec<DirectoryEntry>, HtcfsError> {
    if body.len() < count * DirectoryEntry::WIRE_SIZE {
        return Err(HtcfsError::UnexpectedResponseBodySize);
    }
    (0..count)
        .map(|i| {
            DirectoryEntry::decode(&body[i * DirectoryEntry::WIRE_SIZE..])
                .ok_or(HtcfsError::UnknownError)
        })
        .collect()
}

// ----------------------------------------------------------------------
// Monitor
// ----------------------------------------------------------------------

/// Version negotiation, run once per connection: learn the host's maximum,
/// clamp to ours, and commit the choice.
fn setup_protocol(rpc: &mut RpcState) -> Result<(), HtcfsError> {
    let request = RpcHeader::request(rpc.version, FsPacketType::GetMaxProtocolVersion as u16, 0, [0; 5]);
    send_request(&rpc.channel, &request, &[], &[])?;
    let response = recv_response(&rpc.channel)?;
    check_response_without_version(&response, FsPacketType::GetMaxProtocolVersion)?;
    convert_htcfs_result(response.params[0])?;

    let host_max = response.params[1] as i64;
    if host_max < 0 {
        return Err(HtcfsError::UnsupportedProtocolVersion);
    }
    let use_version = MAX_PROTOCOL_VERSION.min(host_max as u16);

    let request = RpcHeader::request(
        rpc.version,
        FsPacketType::SetProtocolVersion as u16,
        0,
        [use_version as u64, 0, 0, 0, 0],
    );
    send_request(&rpc.channel, &request, &[], &[])?;
    let response = recv_response(&rpc.channel)?;
    check_response_without_version(&response, FsPacketType::SetProtocolVersion)?;
    convert_htcfs_result(response.params[0])?;

    rpc.version = use_version;
    info!(version = use_version, "htcfs protocol negotiated");
    Ok(())
}

fn wait_for_state(inner: &Inner, target: ChannelState) -> bool {
    loop {
        if inner.cancel.try_wait() {
            return false;
        }
        let rpc = inner.rpc.lock();
        let reached = match rpc.channel.state() {
            Ok(state) => state == target || state == ChannelState::Disconnected,
            Err(_) => return false,
        };
        let event = rpc.channel.state_event().ok();
        drop(rpc);
        if reached {
            return true;
        }
        if let Some(event) = event {
            event.wait_timeout(Duration::from_millis(50));
            event.clear();
        }
    }
}

fn monitor_body(inner: &Arc<Inner>) {
    while !inner.cancel.try_wait() {
        // Open the RPC channel for this connection cycle.
        {
            let rpc = inner.rpc.lock();
            if let Err(e) = rpc.channel.open() {
                warn!("htcfs rpc channel open failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            let _ = rpc.channel.set_config(ChannelConfig::DEFAULT);
            let _ = rpc.channel.set_send_buffer_size(CHANNEL_BUFFER_SIZE);
            let _ = rpc.channel.set_receive_buffer_size(CHANNEL_BUFFER_SIZE);
        }

        // Wait until the link lets us connect.
        if !wait_for_state(inner, ChannelState::Connectable) {
            break;
        }

        // Connect and negotiate.
        let established = {
            let mut rpc = inner.rpc.lock();
            match rpc.channel.connect() {
                Ok(()) => match setup_protocol(&mut rpc) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("htcfs protocol setup failed: {e}");
                        rpc.channel.shutdown();
                        false
                    }
                },
                Err(e) => {
                    debug!("htcfs connect failed: {e}");
                    false
                }
            }
        };
        if !established {
            inner.rpc.lock().channel.close();
            continue;
        }

        inner.connected.store(true, Ordering::SeqCst);
        info!("htcfs channel established");

        // Hold the connection until the host goes away.
        wait_for_state(inner, ChannelState::Disconnected);

        inner.connected.store(false, Ordering::SeqCst);
        let mut rpc = inner.rpc.lock();
        rpc.version = 0;
        rpc.channel.close();
        inner.cache.invalidate();
        debug!("htcfs connection cycle ended");
    }

    // Cancelled: tear down whatever is left.
    inner.connected.store(false, Ordering::SeqCst);
    inner.rpc.lock().channel.close();
}
