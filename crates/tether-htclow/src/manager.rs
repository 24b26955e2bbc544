use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use slab::Slab;
use tether_utils::{Event, ThreadPriority, spawn_named};
use tether_wire::{ChannelId, Command, HEADER_SIZE, PacketHeader, WindowUpdate};
use tracing::{debug, info, warn};

use crate::{
    carrier::{Carrier, CarrierError, CarrierState},
    channel::{ChannelConfig, ChannelEngine, ChannelState, PROTOCOL_VERSION},
    error::ChannelError,
    task::{TaskKind, TaskTable},
};

/// How long `resume` waits for the link to come back after wake.
const RESUME_TIMEOUT: Duration = Duration::from_secs(7);
/// Idle poll interval for the workers, bounding reaction time to flag flips.
const WORKER_IDLE: Duration = Duration::from_millis(50);

struct ManagerState {
    channels: Slab<ChannelEngine>,
    by_id: HashMap<ChannelId, usize>,
    by_service: HashMap<u32, usize>,
    tasks: TaskTable,
    /// Pre-encoded control traffic (window updates, parting FINs) that does
    /// not belong to a live channel's send ring.
    control_queue: VecDeque<Vec<u8>>,
    running: bool,
    suspended: bool,
    send_cursor: usize,
}

impl ManagerState {
    fn channel(&self, id: ChannelId) -> Result<usize, ChannelError> {
        self.by_id.get(&id).copied().ok_or(ChannelError::ChannelNotExist)
    }

    /// Re-evaluates every in-progress task owned by `idx`'s channel.
    fn service_channel_tasks(&mut self, idx: usize) {
        let engine = &self.channels[idx];
        let id = engine.id;
        let state = engine.state();
        let recv_len = engine.recv_len();
        let sent_offset = engine.sent_offset;

        for task_id in self.tasks.ids_for_channel(id) {
            let Some(task) = self.tasks.get(task_id) else { continue };
            let outcome = match task.kind {
                TaskKind::Connect => match state {
                    ChannelState::Connected => Some(Ok(())),
                    ChannelState::Disconnected => Some(Err(ChannelError::ConnectionFailure)),
                    _ => None,
                },
                TaskKind::Send { watermark } | TaskKind::Flush { watermark } => {
                    if sent_offset >= watermark {
                        Some(Ok(()))
                    } else if state == ChannelState::Disconnected {
                        Some(Err(ChannelError::ConnectionFailure))
                    } else {
                        None
                    }
                }
                // Receive completes on disconnect as well; the end call
                // drains whatever arrived before reporting failure.
                TaskKind::Receive { min } => {
                    if recv_len >= min || state == ChannelState::Disconnected {
                        Some(Ok(()))
                    } else {
                        None
                    }
                }
                TaskKind::WaitReceive { target } => {
                    if recv_len >= target {
                        Some(Ok(()))
                    } else if state == ChannelState::Disconnected {
                        Some(Err(ChannelError::ConnectionFailure))
                    } else {
                        None
                    }
                }
            };
            if let Some(result) = outcome {
                self.tasks.complete(task_id, result);
            }
        }
    }

    fn fail_channel_tasks(&mut self, id: ChannelId, err: ChannelError) {
        for task_id in self.tasks.ids_for_channel(id) {
            self.tasks.complete(task_id, Err(err));
        }
    }

    /// Carrier link went away: connected channels die, connectable ones fall
    /// back to unconnectable, every outstanding task fails.
    fn on_link_loss(&mut self) {
        let ids: Vec<usize> = self.channels.iter().map(|(i, _)| i).collect();
        for idx in ids {
            let engine = &mut self.channels[idx];
            match engine.state() {
                ChannelState::Connected => engine.set_state(ChannelState::Disconnected),
                ChannelState::Connectable => engine.set_state(ChannelState::Unconnectable),
                _ => {}
            }
        }
        for task_id in self.tasks.in_progress_ids() {
            self.tasks.complete(task_id, Err(ChannelError::ConnectionFailure));
        }
        self.control_queue.clear();
    }

    /// Carrier became ready: idle channels may now connect.
    fn on_link_ready(&mut self) {
        let ids: Vec<usize> = self.channels.iter().map(|(i, _)| i).collect();
        for idx in ids {
            if self.channels[idx].state() == ChannelState::Unconnectable {
                self.channels[idx].set_state(ChannelState::Connectable);
            }
        }
    }

    fn queue_window_update(&mut self, channel: ChannelId, delta: u32) {
        let control = ChannelId::control(channel.module);
        let body = WindowUpdate { channel: channel.channel, delta }.encode();
        let header = PacketHeader {
            service_id: control.service_id(),
            task_id: 0,
            command: Command::WindowUpdate,
            is_continuation: false,
            version: PROTOCOL_VERSION,
            body_len: body.len() as u32,
        };
        let mut packet = Vec::with_capacity(HEADER_SIZE + body.len());
        packet.extend_from_slice(&header.encode(&body));
        packet.extend_from_slice(&body);
        self.control_queue.push_back(packet);
    }

    fn queue_fin(&mut self, id: ChannelId) {
        let header = PacketHeader {
            service_id: id.service_id(),
            task_id: 0,
            command: Command::Fin,
            is_continuation: false,
            version: PROTOCOL_VERSION,
            body_len: 0,
        };
        self.control_queue.push_back(header.encode(&[]).to_vec());
    }

    /// Next packet for the send worker: control traffic first, then channel
    /// traffic round-robin from the cursor.
    fn build_next(&mut self) -> Option<(Vec<u8>, Option<usize>, usize)> {
        if let Some(bytes) = self.control_queue.pop_front() {
            return Some((bytes, None, 0));
        }
        if self.channels.is_empty() {
            return None;
        }
        let indices: Vec<usize> = self.channels.iter().map(|(i, _)| i).collect();
        let n = indices.len();
        for step in 0..n {
            let idx = indices[(self.send_cursor + step) % n];
            if self.channels[idx].has_pending_send() {
                if let Some(pkt) = self.channels[idx].next_packet() {
                    self.send_cursor = (self.send_cursor + step + 1) % n;
                    // FIN emission flips state; dependent tasks must observe.
                    self.service_channel_tasks(idx);
                    return Some((pkt.bytes, Some(idx), pkt.payload_len));
                }
            }
        }
        None
    }

    /// Routes one inbound packet. Returns the engine index a data-bearing
    /// packet landed on, for task servicing.
    fn route(&mut self, header: &PacketHeader, body: &[u8]) {
        let Some(&idx) = self.by_service.get(&header.service_id) else {
            debug!(service_id = header.service_id, "packet for unknown service");
            return;
        };

        if header.command == Command::WindowUpdate && self.channels[idx].id.is_control() {
            match WindowUpdate::decode(body) {
                Ok(update) => {
                    let target =
                        ChannelId::new(self.channels[idx].id.module, update.channel);
                    if let Ok(t) = self.channel(target) {
                        self.channels[t].grant_window(update.delta);
                    }
                }
                Err(e) => warn!("malformed window update: {e}"),
            }
            return;
        }

        match self.channels[idx].on_packet(header, body) {
            Ok(()) => self.service_channel_tasks(idx),
            Err(err) => {
                // Channel-level fault (ring overflow): the channel dies, the
                // rest of the link survives.
                warn!(channel = %self.channels[idx].id, "channel fault: {err}");
                self.channels[idx].set_state(ChannelState::Disconnected);
                let id = self.channels[idx].id;
                self.fail_channel_tasks(id, ChannelError::ConnectionFailure);
            }
        }
    }
}

struct Shared {
    state: Mutex<ManagerState>,
    send_ready: Condvar,
}

/// Central transport dispatcher: owns the channel table, the task table and
/// the two carrier workers. Thread-safe; consumers drive it through
/// begin/end pairs and per-task events.
pub struct HtclowManager {
    shared: Arc<Shared>,
    carrier: Arc<dyn Carrier>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HtclowManager {
    pub fn new(carrier: Arc<dyn Carrier>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState {
                channels: Slab::new(),
                by_id: HashMap::new(),
                by_service: HashMap::new(),
                tasks: TaskTable::default(),
                control_queue: VecDeque::new(),
                running: true,
                suspended: false,
                send_cursor: 0,
            }),
            send_ready: Condvar::new(),
        });

        let manager = Arc::new(Self {
            shared: shared.clone(),
            carrier: carrier.clone(),
            workers: Mutex::new(Vec::new()),
        });

        let recv_shared = shared.clone();
        let recv_carrier = carrier.clone();
        let recv = spawn_named("htclow-receive", ThreadPriority::Medium, move || {
            receive_worker(&recv_shared, recv_carrier.as_ref());
        })
        .expect("couldn't spawn receive worker");

        let send_shared = shared;
        let send_carrier = carrier;
        let send = spawn_named("htclow-send", ThreadPriority::Medium, move || {
            send_worker(&send_shared, send_carrier.as_ref());
        })
        .expect("couldn't spawn send worker");

        *manager.workers.lock() = vec![recv, send];
        manager
    }

    fn notify_send(&self) {
        self.shared.send_ready.notify_all();
    }

    pub fn open(&self, id: ChannelId) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        if state.by_id.contains_key(&id) {
            return Err(ChannelError::ChannelAlreadyExist);
        }
        let ready = self.carrier.state() == CarrierState::Ready && !state.suspended;
        let engine = ChannelEngine::new(id, ready);
        let service_id = id.service_id();
        let idx = state.channels.insert(engine);
        state.by_id.insert(id, idx);
        state.by_service.insert(service_id, idx);
        debug!(channel = %id, "channel opened");
        Ok(())
    }

    pub fn close(&self, id: ChannelId) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        let was_connected = state.channels[idx].state() == ChannelState::Connected;

        for task_id in state.tasks.ids_for_channel(id) {
            state.tasks.cancel(task_id);
        }
        let engine = state.channels.remove(idx);
        state.by_id.remove(&id);
        state.by_service.remove(&id.service_id());
        engine.state_event.signal();

        if was_connected {
            state.queue_fin(id);
        }
        drop(state);
        self.notify_send();
        debug!(channel = %id, "channel closed");
        Ok(())
    }

    pub fn set_config(&self, id: ChannelId, config: ChannelConfig) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        state.channels[idx].set_config(config);
        Ok(())
    }

    pub fn set_send_buffer_size(&self, id: ChannelId, size: usize) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        state.channels[idx].set_send_capacity(size);
        Ok(())
    }

    pub fn set_receive_buffer_size(&self, id: ChannelId, size: usize) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        state.channels[idx].set_recv_capacity(size);
        Ok(())
    }

    /// Loads a bulk payload into the send ring ahead of `connect`+`flush`.
    pub fn set_send_buffer_with_data(&self, id: ChannelId, data: &[u8]) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        state.channels[idx].preload_send(data);
        drop(state);
        self.notify_send();
        Ok(())
    }

    pub fn get_channel_state(&self, id: ChannelId) -> Result<ChannelState, ChannelError> {
        let state = self.shared.state.lock();
        let idx = state.channel(id)?;
        Ok(state.channels[idx].state())
    }

    pub fn get_channel_state_event(&self, id: ChannelId) -> Result<Arc<Event>, ChannelError> {
        let state = self.shared.state.lock();
        let idx = state.channel(id)?;
        Ok(state.channels[idx].state_event.clone())
    }

    pub fn get_task_event(&self, task_id: u32) -> Result<Arc<Event>, ChannelError> {
        self.shared.state.lock().tasks.event(task_id).ok_or(ChannelError::InvalidArgument)
    }

    pub fn connect_begin(&self, id: ChannelId) -> Result<u32, ChannelError> {
        let mut state = self.shared.state.lock();
        if state.suspended {
            return Err(ChannelError::Suspended);
        }
        let idx = state.channel(id)?;
        state.channels[idx].request_connect()?;
        let task_id = state.tasks.begin(id, TaskKind::Connect, 0)?;
        state.service_channel_tasks(idx);
        drop(state);
        self.notify_send();
        Ok(task_id)
    }

    pub fn connect_end(&self, id: ChannelId, task_id: u32) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let (channel, result) = state.tasks.end(task_id)?;
        debug_assert_eq!(channel, id);
        result
    }

    /// Queues as much of `src` as fits and returns `(task_id, accepted)`.
    /// The task completes once the accepted bytes reach the carrier.
    pub fn send_begin(&self, id: ChannelId, src: &[u8]) -> Result<(u32, usize), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        let accepted = state.channels[idx].queue_send(src)?;
        let watermark = state.channels[idx].queued_offset;
        let task_id = state.tasks.begin(id, TaskKind::Send { watermark }, 0)?;
        state.service_channel_tasks(idx);
        drop(state);
        self.notify_send();
        Ok((task_id, accepted))
    }

    pub fn send_end(&self, task_id: u32) -> Result<(), ChannelError> {
        self.shared.state.lock().tasks.end(task_id)?.1
    }

    pub fn flush_begin(&self, id: ChannelId) -> Result<u32, ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        let watermark = state.channels[idx].queued_offset;
        let task_id = state.tasks.begin(id, TaskKind::Flush { watermark }, 0)?;
        state.service_channel_tasks(idx);
        drop(state);
        self.notify_send();
        Ok(task_id)
    }

    pub fn flush_end(&self, task_id: u32) -> Result<(), ChannelError> {
        self.shared.state.lock().tasks.end(task_id)?.1
    }

    pub fn receive_begin(&self, id: ChannelId, blocking: bool) -> Result<u32, ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        let min = if blocking { 1 } else { 0 };
        let task_id = state.tasks.begin(id, TaskKind::Receive { min }, 0)?;
        state.service_channel_tasks(idx);
        Ok(task_id)
    }

    /// Pops received bytes into `dst`. Empty results map to
    /// `ReceiveBufferEmpty` on a live channel and `ConnectionFailure` on a
    /// dead one.
    pub fn receive_end(&self, task_id: u32, dst: &mut [u8]) -> Result<usize, ChannelError> {
        let mut state = self.shared.state.lock();
        let (channel, result) = state.tasks.end(task_id)?;
        result?;
        let idx = state.channel(channel)?;
        let (popped, delta) = state.channels[idx].consume_recv(dst);
        if popped == 0 && !dst.is_empty() {
            return match state.channels[idx].state() {
                ChannelState::Disconnected => Err(ChannelError::ConnectionFailure),
                _ => Err(ChannelError::ReceiveBufferEmpty),
            };
        }
        if delta > 0 {
            state.queue_window_update(channel, delta);
            drop(state);
            self.notify_send();
        }
        Ok(popped)
    }

    pub fn wait_receive_begin(&self, id: ChannelId, size: usize) -> Result<u32, ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        let task_id = state.tasks.begin(id, TaskKind::WaitReceive { target: size }, 0)?;
        state.service_channel_tasks(idx);
        Ok(task_id)
    }

    pub fn wait_receive_end(&self, task_id: u32) -> Result<(), ChannelError> {
        self.shared.state.lock().tasks.end(task_id)?.1
    }

    pub fn shutdown(&self, id: ChannelId) -> Result<(), ChannelError> {
        let mut state = self.shared.state.lock();
        let idx = state.channel(id)?;
        state.channels[idx].request_shutdown();
        state.service_channel_tasks(idx);
        drop(state);
        self.notify_send();
        Ok(())
    }

    /// Force-drops the current host link; channels observe a normal link
    /// loss and the carrier waits for the host to come back.
    pub fn disconnect(&self) {
        self.carrier.disconnect();
        self.shared.state.lock().on_link_loss();
    }

    pub fn suspend(&self) {
        info!("transport suspending");
        {
            let mut state = self.shared.state.lock();
            state.suspended = true;
            state.on_link_loss();
        }
        self.carrier.suspend();
    }

    /// Restarts the carrier after wake, waiting up to the resume budget for
    /// the link to report ready.
    pub fn resume(&self) {
        info!("transport resuming");
        self.carrier.resume();
        self.shared.state.lock().suspended = false;

        let deadline = std::time::Instant::now() + RESUME_TIMEOUT;
        while self.carrier.state() != CarrierState::Ready {
            let now = std::time::Instant::now();
            if now >= deadline {
                warn!("link did not come back within resume budget");
                break;
            }
            self.carrier.state_event().wait_timeout(deadline - now);
            self.carrier.state_event().clear();
        }
    }

    pub fn notify_asleep(&self) {
        self.carrier.notify_asleep();
    }

    pub fn notify_awake(&self) {
        self.carrier.notify_awake();
    }

    /// Stops the workers and cancels everything outstanding. Idempotent.
    pub fn finalize(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            for task_id in state.tasks.in_progress_ids() {
                state.tasks.cancel(task_id);
            }
        }
        self.carrier.cancel();
        self.notify_send();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for HtclowManager {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn receive_worker(shared: &Arc<Shared>, carrier: &dyn Carrier) {
    let mut was_ready = false;
    loop {
        if !shared.state.lock().running {
            return;
        }
        match carrier.state() {
            CarrierState::Ready => {
                if !was_ready {
                    was_ready = true;
                    let mut state = shared.state.lock();
                    state.on_link_ready();
                    drop(state);
                    shared.send_ready.notify_all();
                }
                match read_packet(shared, carrier) {
                    Ok(()) => {}
                    Err(CarrierError::Cancelled) => return,
                    Err(CarrierError::Disconnected) => {
                        was_ready = false;
                        shared.state.lock().on_link_loss();
                    }
                }
            }
            CarrierState::Gone => return,
            _ => {
                if was_ready {
                    was_ready = false;
                    shared.state.lock().on_link_loss();
                }
                carrier.state_event().wait_timeout(WORKER_IDLE);
                carrier.state_event().clear();
            }
        }
    }
}

/// Reads and routes one packet. A checksum failure desynchronises the byte
/// stream, so the link is dropped rather than resynchronised byte-by-byte.
fn read_packet(shared: &Arc<Shared>, carrier: &dyn Carrier) -> Result<(), CarrierError> {
    let mut header_buf = [0u8; HEADER_SIZE];
    carrier.recv_exact(&mut header_buf)?;

    let (header, body_checksum) = match PacketHeader::decode(&header_buf) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("dropping link on bad packet header: {e}");
            carrier.disconnect();
            return Err(CarrierError::Disconnected);
        }
    };

    let mut body = vec![0u8; header.body_len as usize];
    carrier.recv_exact(&mut body)?;
    if let Err(e) = PacketHeader::validate_body(body_checksum, &body) {
        warn!("dropping link on bad packet body: {e}");
        carrier.disconnect();
        return Err(CarrierError::Disconnected);
    }

    let mut state = shared.state.lock();
    state.route(&header, &body);
    drop(state);
    shared.send_ready.notify_all();
    Ok(())
}

fn send_worker(shared: &Arc<Shared>, carrier: &dyn Carrier) {
    loop {
        let work = {
            let mut state = shared.state.lock();
            if !state.running {
                return;
            }
            match state.build_next() {
                Some(work) => Some(work),
                None => {
                    shared.send_ready.wait_for(&mut state, WORKER_IDLE);
                    None
                }
            }
        };
        let Some((bytes, channel_idx, payload_len)) = work else { continue };

        match carrier.send(&bytes) {
            Ok(()) => {
                if let Some(idx) = channel_idx {
                    let mut state = shared.state.lock();
                    if state.channels.contains(idx) {
                        state.channels[idx].sent_offset += payload_len as u64;
                        state.service_channel_tasks(idx);
                    }
                }
            }
            Err(CarrierError::Cancelled) => return,
            Err(CarrierError::Disconnected) => {
                shared.state.lock().on_link_loss();
            }
        }
    }
}
