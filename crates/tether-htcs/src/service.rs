use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use slab::Slab;
use tether_htclow::{
    Channel, ChannelConfig, ChannelError, ChannelId, ChannelState, HtclowManager, ModuleId,
    ReceiveOption,
};
use tether_utils::{ClearMode, Event, ThreadPriority, spawn_named};
use tether_wire::{PacketCategory, RPC_HEADER_SIZE, RPC_PROTOCOL, RpcHeader};
use tracing::{debug, info, warn};

use crate::protocol::{
    EINTR, ENETDOWN, ENOTCONN, HtcsError, MAX_PROTOCOL_VERSION, SockAddrHtcs, SocketPacketType,
};

const RPC_CHANNEL: u16 = 0;
const CHANNEL_BUFFER_SIZE: usize = 0x1C040;
const MAX_TASKS: usize = 0x40;
/// Largest payload carried inline on the RPC channel.
const MAX_INLINE_BODY: usize = 0x4000 - tether_wire::HEADER_SIZE;

fn map_channel_err(_: ChannelError) -> HtcsError {
    HtcsError::ChannelClosed
}

/// One response from the host. `err == 0` means success and `value` holds
/// the operation result; otherwise `value` is -1.
#[derive(Clone, Debug, Default)]
struct Outcome {
    err: i32,
    value: i64,
    body: Vec<u8>,
}

struct SocketTask {
    kind: SocketPacketType,
    event: Arc<Event>,
    responses: VecDeque<Outcome>,
    failed: Option<i32>,
}

struct RpcState {
    channel: Channel,
    version: u16,
}

struct Inner {
    manager: Arc<HtclowManager>,
    rpc: Mutex<RpcState>,
    tasks: Mutex<Slab<SocketTask>>,
    descriptors: Mutex<HashSet<i32>>,
    connected: AtomicBool,
    availability_event: Event,
    cancel: Event,
    next_data_channel: AtomicU16,
}

impl Inner {
    fn disconnect_errno(kind: SocketPacketType) -> i32 {
        match kind {
            SocketPacketType::Accept => ENETDOWN,
            _ => ENOTCONN,
        }
    }

    /// Fails every outstanding task with its disconnect errno.
    fn fail_all_tasks(&self) {
        let mut tasks = self.tasks.lock();
        for (_, task) in tasks.iter_mut() {
            if task.failed.is_none() {
                task.failed = Some(Self::disconnect_errno(task.kind));
                task.event.signal();
            }
        }
    }
}

/// Socket-like endpoints served by the host over the transport. Sync calls
/// run start/results back to back; long-running calls expose the two-phase
/// pattern directly.
pub struct HtcsService {
    inner: Arc<Inner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl HtcsService {
    pub fn new(manager: Arc<HtclowManager>) -> Arc<Self> {
        let rpc_channel =
            Channel::new(manager.clone(), ChannelId::new(ModuleId::Htcs, RPC_CHANNEL));
        let inner = Arc::new(Inner {
            manager,
            rpc: Mutex::new(RpcState { channel: rpc_channel, version: 0 }),
            tasks: Mutex::new(Slab::new()),
            descriptors: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            availability_event: Event::new(ClearMode::Manual),
            cancel: Event::new(ClearMode::Manual),
            next_data_channel: AtomicU16::new(1),
        });

        let observer_inner = inner.clone();
        let observer = spawn_named("htcs-observer", ThreadPriority::Low, move || {
            observer_body(&observer_inner);
        })
        .expect("couldn't spawn htcs observer");

        let pump_inner = inner.clone();
        let pump = spawn_named("htcs-client", ThreadPriority::Low, move || {
            pump_body(&pump_inner);
        })
        .expect("couldn't spawn htcs client pump");

        Arc::new(Self { inner, threads: Mutex::new(vec![observer, pump]) })
    }

    pub fn is_service_available(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Signalled while the host-side socket service is reachable.
    pub fn availability_event(&self) -> &Event {
        &self.inner.availability_event
    }

    pub fn cancel(&self) {
        self.inner.cancel.signal();
        self.inner.fail_all_tasks();
    }

    pub fn wait(&self) {
        for handle in std::mem::take(&mut *self.threads.lock()) {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Synchronous operations
    // ------------------------------------------------------------------

    pub fn socket(&self) -> Result<i32, HtcsError> {
        let outcome = self.invoke(SocketPacketType::Socket, [0; 5], &[])?;
        let desc = outcome.value as i32;
        self.inner.descriptors.lock().insert(desc);
        Ok(desc)
    }

    pub fn close(&self, desc: i32) -> Result<(), HtcsError> {
        self.check_descriptor(desc)?;
        let result = self.invoke(SocketPacketType::Close, [desc as u64, 0, 0, 0, 0], &[]);
        // The host side is gone either way.
        self.inner.descriptors.lock().remove(&desc);
        result.map(|_| ())
    }

    pub fn connect(&self, desc: i32, address: &SockAddrHtcs) -> Result<(), HtcsError> {
        self.check_descriptor(desc)?;
        self.invoke(SocketPacketType::Connect, [desc as u64, 0, 0, 0, 0], &address.encode())
            .map(|_| ())
    }

    pub fn bind(&self, desc: i32, address: &SockAddrHtcs) -> Result<(), HtcsError> {
        self.check_descriptor(desc)?;
        self.invoke(SocketPacketType::Bind, [desc as u64, 0, 0, 0, 0], &address.encode())
            .map(|_| ())
    }

    pub fn listen(&self, desc: i32, backlog: i32) -> Result<(), HtcsError> {
        self.check_descriptor(desc)?;
        self.invoke(SocketPacketType::Listen, [desc as u64, backlog as u64, 0, 0, 0], &[])
            .map(|_| ())
    }

    pub fn shutdown(&self, desc: i32, how: i32) -> Result<(), HtcsError> {
        self.check_descriptor(desc)?;
        self.invoke(SocketPacketType::Shutdown, [desc as u64, how as u64, 0, 0, 0], &[])
            .map(|_| ())
    }

    pub fn fcntl(&self, desc: i32, command: i32, value: i32) -> Result<i32, HtcsError> {
        self.check_descriptor(desc)?;
        self.invoke(
            SocketPacketType::Fcntl,
            [desc as u64, command as u64, value as u64, 0, 0],
            &[],
        )
        .map(|outcome| outcome.value as i32)
    }

    // ------------------------------------------------------------------
    // Two-phase operations
    // ------------------------------------------------------------------

    pub fn accept_start(&self, desc: i32) -> Result<(u32, Arc<Event>), HtcsError> {
        self.check_descriptor(desc)?;
        self.start(SocketPacketType::Accept, [desc as u64, 0, 0, 0, 0], &[])
    }

    pub fn accept_results(&self, task_id: u32) -> Result<(i32, SockAddrHtcs), HtcsError> {
        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;
        let address = SockAddrHtcs::decode(&outcome.body).ok_or(HtcsError::UnexpectedResponse)?;
        let desc = outcome.value as i32;
        self.inner.descriptors.lock().insert(desc);
        Ok((desc, address))
    }

    pub fn recv_start(
        &self,
        desc: i32,
        size: usize,
        flags: i32,
    ) -> Result<(u32, Arc<Event>), HtcsError> {
        self.check_descriptor(desc)?;
        debug_assert!(size <= MAX_INLINE_BODY, "use recv_large for bulk transfers");
        self.start(SocketPacketType::Recv, [desc as u64, size as u64, flags as u64, 0, 0], &[])
    }

    pub fn recv_results(&self, task_id: u32, buffer: &mut [u8]) -> Result<i64, HtcsError> {
        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;
        let n = outcome.body.len().min(buffer.len());
        buffer[..n].copy_from_slice(&outcome.body[..n]);
        Ok(outcome.value)
    }

    pub fn send_start(
        &self,
        desc: i32,
        data: &[u8],
        flags: i32,
    ) -> Result<(u32, Arc<Event>), HtcsError> {
        self.check_descriptor(desc)?;
        debug_assert!(data.len() <= MAX_INLINE_BODY, "use send_large for bulk transfers");
        self.start(SocketPacketType::Send, [desc as u64, flags as u64, 0, 0, 0], data)
    }

    pub fn send_results(&self, task_id: u32) -> Result<i64, HtcsError> {
        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;
        Ok(outcome.value)
    }

    /// `select` over host descriptors: `fds` are tagged with the interest
    /// bits; the result is the subset that is ready.
    pub fn select_start(
        &self,
        read_fds: &[i32],
        write_fds: &[i32],
        timeout_micros: i64,
    ) -> Result<(u32, Arc<Event>), HtcsError> {
        let mut body = Vec::with_capacity((read_fds.len() + write_fds.len()) * 4);
        for fd in read_fds.iter().chain(write_fds) {
            body.extend_from_slice(&fd.to_le_bytes());
        }
        self.start(
            SocketPacketType::Select,
            [read_fds.len() as u64, write_fds.len() as u64, timeout_micros as u64, 0, 0],
            &body,
        )
    }

    /// Returns the ready read-set and write-set.
    pub fn select_results(&self, task_id: u32) -> Result<(Vec<i32>, Vec<i32>), HtcsError> {
        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;

        let read_count = (outcome.value as u64 & 0xFFFF_FFFF) as usize;
        let decode = |chunk: &[u8]| i32::from_le_bytes(chunk.try_into().unwrap());
        let fds: Vec<i32> = outcome.body.chunks_exact(4).map(decode).collect();
        if read_count > fds.len() {
            return Err(HtcsError::UnexpectedResponse);
        }
        let (read, write) = fds.split_at(read_count);
        Ok((read.to_vec(), write.to_vec()))
    }

    // ------------------------------------------------------------------
    // Bulk transfers
    // ------------------------------------------------------------------

    /// Receive too large for the RPC channel: the host streams the payload
    /// over a dedicated bulk channel.
    pub fn recv_large(&self, desc: i32, buffer: &mut [u8], flags: i32) -> Result<i64, HtcsError> {
        self.check_descriptor(desc)?;
        let channel_id = self.allocate_data_channel();
        let data = Channel::new(self.inner.manager.clone(), ChannelId::new(ModuleId::Htcs, channel_id));
        data.open().map_err(map_channel_err)?;

        let result = (|| {
            data.set_config(ChannelConfig::BULK_RECEIVE).map_err(map_channel_err)?;
            data.set_receive_buffer_size(buffer.len().max(1)).map_err(map_channel_err)?;
            data.connect().map_err(map_channel_err)?;

            let (task_id, _event) = self.start(
                SocketPacketType::RecvLarge,
                [desc as u64, buffer.len() as u64, flags as u64, channel_id as u64, 0],
                &[],
            )?;
            let outcome = self.take_response(task_id)?;
            self.finish(task_id);
            host_result(&outcome)?;

            let size = outcome.value as usize;
            if size > buffer.len() {
                return Err(HtcsError::UnexpectedResponse);
            }
            data.receive(&mut buffer[..size], ReceiveOption::All).map_err(map_channel_err)?;
            Ok(outcome.value)
        })();
        data.close();
        result
    }

    /// Send too large for the RPC channel. The host acknowledges with a
    /// first response once its receive side is up, the payload streams over
    /// the bulk channel, and a second response carries the final result.
    pub fn send_large(&self, desc: i32, data_buf: &[u8], flags: i32) -> Result<i64, HtcsError> {
        self.check_descriptor(desc)?;
        let channel_id = self.allocate_data_channel();

        let (task_id, _event) = self.start(
            SocketPacketType::SendLarge,
            [desc as u64, data_buf.len() as u64, flags as u64, channel_id as u64, 0],
            &[],
        )?;

        let ready = self.take_response(task_id)?;
        if let Err(e) = host_result(&ready) {
            self.finish(task_id);
            return Err(e);
        }

        let data = Channel::new(self.inner.manager.clone(), ChannelId::new(ModuleId::Htcs, channel_id));
        let streamed = (|| {
            data.open().map_err(map_channel_err)?;
            data.set_config(ChannelConfig::BULK_SEND).map_err(map_channel_err)?;
            data.set_send_buffer_with_data(data_buf).map_err(map_channel_err)?;
            data.connect().map_err(map_channel_err)?;
            data.flush().map_err(map_channel_err)
        })();
        data.close();
        if let Err(e) = streamed {
            self.finish(task_id);
            return Err(e);
        }

        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;
        Ok(outcome.value)
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn check_descriptor(&self, desc: i32) -> Result<(), HtcsError> {
        if self.inner.descriptors.lock().contains(&desc) {
            Ok(())
        } else {
            Err(HtcsError::UnknownDescriptor)
        }
    }

    fn allocate_data_channel(&self) -> u16 {
        // Channel 0 is the RPC channel; data channels cycle above it.
        let raw = self.inner.next_data_channel.fetch_add(1, Ordering::Relaxed);
        (raw % 0x7FFF) + 1
    }

    fn start(
        &self,
        kind: SocketPacketType,
        mut params: [u64; 5],
        body: &[u8],
    ) -> Result<(u32, Arc<Event>), HtcsError> {
        if self.inner.cancel.try_wait() || !self.inner.connected.load(Ordering::SeqCst) {
            return Err(HtcsError::Host(Inner::disconnect_errno(kind)));
        }

        let (task_id, event) = {
            let mut tasks = self.inner.tasks.lock();
            if tasks.len() >= MAX_TASKS {
                return Err(HtcsError::Host(EINTR));
            }
            let event = Arc::new(Event::new(ClearMode::Manual));
            let id = tasks.insert(SocketTask {
                kind,
                event: event.clone(),
                responses: VecDeque::new(),
                failed: None,
            }) as u32;
            (id, event)
        };

        params[4] = task_id as u64;
        let rpc = self.inner.rpc.lock();
        let request = RpcHeader::request(rpc.version, kind as u16, body.len() as u64, params);
        let mut bytes = Vec::with_capacity(RPC_HEADER_SIZE + body.len());
        bytes.extend_from_slice(&request.encode());
        bytes.extend_from_slice(body);

        let sent = rpc.channel.send(&bytes).map_err(map_channel_err);
        match sent {
            Ok(n) if n == bytes.len() => {
                let _ = rpc.channel.flush();
                Ok((task_id, event))
            }
            _ => {
                drop(rpc);
                self.finish(task_id);
                Err(HtcsError::Host(Inner::disconnect_errno(kind)))
            }
        }
    }

    /// Blocks until the task has a response queued, then pops it.
    fn take_response(&self, task_id: u32) -> Result<Outcome, HtcsError> {
        loop {
            let event = {
                let mut tasks = self.inner.tasks.lock();
                let task = tasks
                    .get_mut(task_id as usize)
                    .ok_or(HtcsError::Cancelled)?;
                if let Some(outcome) = task.responses.pop_front() {
                    return Ok(outcome);
                }
                if let Some(errno) = task.failed {
                    return Ok(Outcome { err: errno, value: -1, body: Vec::new() });
                }
                task.event.clone()
            };
            event.wait_timeout(Duration::from_millis(50));
            event.clear();
            if self.inner.cancel.try_wait() {
                return Err(HtcsError::Cancelled);
            }
        }
    }

    fn finish(&self, task_id: u32) {
        let mut tasks = self.inner.tasks.lock();
        if tasks.contains(task_id as usize) {
            tasks.remove(task_id as usize);
        }
    }

    fn invoke(
        &self,
        kind: SocketPacketType,
        params: [u64; 5],
        body: &[u8],
    ) -> Result<Outcome, HtcsError> {
        let (task_id, _event) = self.start(kind, params, body)?;
        let outcome = self.take_response(task_id)?;
        self.finish(task_id);
        host_result(&outcome)?;
        Ok(outcome)
    }
}

impl Drop for HtcsService {
    fn drop(&mut self) {
        self.cancel();
        self.wait();
    }
}

fn host_result(outcome: &Outcome) -> Result<(), HtcsError> {
    if outcome.err == 0 { Ok(()) } else { Err(HtcsError::Host(outcome.err)) }
}

// ----------------------------------------------------------------------
// Worker threads
// ----------------------------------------------------------------------

/// Reads responses off the RPC channel and pairs them with outstanding
/// tasks by the echoed task id. Uses its own channel handle so it never
/// contends with senders for the RPC mutex; it only receives while the
/// observer reports the connection up, which keeps it out of negotiation.
fn pump_body(inner: &Arc<Inner>) {
    let channel =
        Channel::new(inner.manager.clone(), ChannelId::new(ModuleId::Htcs, RPC_CHANNEL));

    while !inner.cancel.try_wait() {
        if !inner.connected.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(20));
            continue;
        }

        if channel.wait_receive(RPC_HEADER_SIZE).is_err() {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        let mut header_bytes = [0u8; RPC_HEADER_SIZE];
        if channel.receive(&mut header_bytes, ReceiveOption::All).is_err() {
            continue;
        }
        let Some(header) = RpcHeader::decode(&header_bytes) else {
            warn!("undecodable response prelude");
            continue;
        };
        let mut body = vec![0u8; (header.body_size as usize).min(MAX_INLINE_BODY)];
        if !body.is_empty() && channel.receive(&mut body, ReceiveOption::All).is_err() {
            continue;
        }

        if header.category != PacketCategory::Response {
            debug!(packet_type = header.packet_type, "ignoring non-response packet");
            continue;
        }

        let task_id = header.params[4] as u32;
        let outcome =
            Outcome { err: header.params[0] as i32, value: header.params[1] as i64, body };
        let mut tasks = inner.tasks.lock();
        match tasks.get_mut(task_id as usize) {
            Some(task) => {
                task.responses.push_back(outcome);
                task.event.signal();
            }
            None => warn!(task_id, "response for unknown task"),
        }
    }
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

fn negotiate(rpc: &mut RpcState) -> Result<(), HtcsError> {
    let exchange = |rpc: &RpcState, kind: SocketPacketType, params: [u64; 5]| {
        let request = RpcHeader::request(rpc.version, kind as u16, 0, params);
        let sent = rpc.channel.send(&request.encode()).map_err(map_channel_err)?;
        if sent != RPC_HEADER_SIZE {
            return Err(HtcsError::ChannelClosed);
        }
        rpc.channel.flush().map_err(map_channel_err)?;

        let mut bytes = [0u8; RPC_HEADER_SIZE];
        let received =
            rpc.channel.receive(&mut bytes, ReceiveOption::All).map_err(map_channel_err)?;
        if received != RPC_HEADER_SIZE {
            return Err(HtcsError::ChannelClosed);
        }
        let response = RpcHeader::decode(&bytes).ok_or(HtcsError::UnexpectedResponse)?;
        if response.protocol != RPC_PROTOCOL
            || response.category != PacketCategory::Response
            || response.packet_type != kind as u16
            || response.params[0] != 0
        {
            return Err(HtcsError::UnexpectedResponse);
        }
        Ok(response)
    };

    let response = exchange(rpc, SocketPacketType::GetMaxProtocolVersion, [0; 5])?;
    let use_version = MAX_PROTOCOL_VERSION.min(response.params[1] as u16);
    exchange(rpc, SocketPacketType::SetProtocolVersion, [use_version as u64, 0, 0, 0, 0])?;
    rpc.version = use_version;
    info!(version = use_version, "htcs protocol negotiated");
    Ok(())
}

/// Owns the RPC channel lifecycle: connect, negotiate, publish
/// availability, and tear down on link loss.
fn observer_body(inner: &Arc<Inner>) {
    while !inner.cancel.try_wait() {
        {
            let rpc = inner.rpc.lock();
            if let Err(e) = rpc.channel.open() {
                warn!("htcs rpc channel open failed: {e}");
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            let _ = rpc.channel.set_config(ChannelConfig::DEFAULT);
            let _ = rpc.channel.set_send_buffer_size(CHANNEL_BUFFER_SIZE);
            let _ = rpc.channel.set_receive_buffer_size(CHANNEL_BUFFER_SIZE);
        }

        if !wait_for_state(inner, ChannelState::Connectable) {
            break;
        }

        let established = {
            let mut rpc = inner.rpc.lock();
            match rpc.channel.connect() {
                Ok(()) => match negotiate(&mut rpc) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("htcs negotiation failed: {e}");
                        rpc.channel.shutdown();
                        false
                    }
                },
                Err(e) => {
                    debug!("htcs connect failed: {e}");
                    false
                }
            }
        };
        if !established {
            inner.rpc.lock().channel.close();
            continue;
        }

        inner.connected.store(true, Ordering::SeqCst);
        inner.availability_event.signal();
        info!("htcs service available");

        wait_for_state(inner, ChannelState::Disconnected);

        inner.connected.store(false, Ordering::SeqCst);
        inner.availability_event.clear();
        inner.fail_all_tasks();
        let mut rpc = inner.rpc.lock();
        rpc.version = 0;
        rpc.channel.close();
        inner.descriptors.lock().clear();
        debug!("htcs connection cycle ended");
    }

    inner.connected.store(false, Ordering::SeqCst);
    inner.availability_event.clear();
    inner.fail_all_tasks();
    inner.rpc.lock().channel.close();
}
