use std::{collections::VecDeque, sync::Arc, time::Instant};

use tether_utils::{ClearMode, Event};
use tether_wire::{ChannelId, Command, MAX_BODY_SIZE, PacketHeader};
use tracing::{debug, warn};

use crate::error::ChannelError;

/// Negotiated protocol version carried in handshake packets. Peers
/// advertising something newer are clamped, never rejected.
pub(crate) const PROTOCOL_VERSION: u8 = 1;

/// Default ring capacity, matching the RPC consumers' working buffers.
pub(crate) const DEFAULT_BUFFER_SIZE: usize = 0x1C040;

/// An unanswered SYN is re-sent at this interval; the peer may not have
/// registered the service yet when the first one lands.
const SYN_RETRY: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub flow_control_enabled: bool,
    pub handshake_enabled: bool,
    pub max_packet_size: u32,
}

impl ChannelConfig {
    /// Flow-controlled, handshaked, 16 KiB packets.
    pub const DEFAULT: Self =
        Self { flow_control_enabled: true, handshake_enabled: true, max_packet_size: 0x4000 };

    /// One-shot outbound bulk transfer.
    pub const BULK_SEND: Self =
        Self { flow_control_enabled: false, handshake_enabled: false, max_packet_size: 0xE020 };

    /// One-shot inbound bulk transfer.
    pub const BULK_RECEIVE: Self =
        Self { flow_control_enabled: false, handshake_enabled: false, max_packet_size: 0x3E000 };
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Unconnectable,
    Connectable,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOption {
    NonBlocking,
    Any,
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handshake {
    Idle,
    SynSent,
    SynAckPending,
    SynAckSent,
    AckPending,
    Done,
}

/// An encoded packet ready for the carrier, with the byte count of channel
/// payload it carries (zero for control traffic).
pub(crate) struct OutPacket {
    pub bytes: Vec<u8>,
    pub payload_len: usize,
}

fn encode(header: PacketHeader, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tether_wire::HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode(body));
    out.extend_from_slice(body);
    out
}

/// Per-channel protocol state. All methods are called under the manager
/// lock; carrier I/O never happens in here.
pub(crate) struct ChannelEngine {
    pub id: ChannelId,
    pub config: ChannelConfig,
    state: ChannelState,
    pub state_event: Arc<Event>,

    send_ring: VecDeque<u8>,
    send_capacity: usize,
    recv_ring: VecDeque<u8>,
    recv_capacity: usize,

    /// Remaining send credit in bytes; only meaningful with flow control.
    send_window: usize,
    /// Total bytes ever accepted into the send ring.
    pub queued_offset: u64,
    /// Total bytes confirmed handed to the carrier.
    pub sent_offset: u64,

    handshake: Handshake,
    version: u8,
    connect_requested: bool,
    fin_pending: bool,
    syn_sent_at: Option<Instant>,
}

impl ChannelEngine {
    pub fn new(id: ChannelId, carrier_ready: bool) -> Self {
        Self {
            id,
            config: ChannelConfig::DEFAULT,
            state: if carrier_ready { ChannelState::Connectable } else { ChannelState::Unconnectable },
            state_event: Arc::new(Event::new(ClearMode::Manual)),
            send_ring: VecDeque::new(),
            send_capacity: DEFAULT_BUFFER_SIZE,
            recv_ring: VecDeque::new(),
            recv_capacity: DEFAULT_BUFFER_SIZE,
            send_window: 0,
            queued_offset: 0,
            sent_offset: 0,
            handshake: Handshake::Idle,
            version: PROTOCOL_VERSION,
            connect_requested: false,
            fin_pending: false,
            syn_sent_at: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            debug!(channel = %self.id, ?state, "channel state");
            self.state = state;
            self.state_event.signal();
        }
    }

    pub fn set_config(&mut self, config: ChannelConfig) {
        self.config = config;
    }

    pub fn set_send_capacity(&mut self, capacity: usize) {
        self.send_capacity = capacity;
    }

    pub fn set_recv_capacity(&mut self, capacity: usize) {
        self.recv_capacity = capacity;
    }

    /// Preloads the send ring, for bulk transfers whose whole payload is
    /// known up front.
    pub fn preload_send(&mut self, data: &[u8]) {
        debug_assert!(self.send_ring.is_empty());
        self.send_capacity = self.send_capacity.max(data.len());
        self.send_ring.extend(data);
        self.queued_offset += data.len() as u64;
    }

    /// Requests connection. With handshaking enabled the state advances once
    /// SYN/SYN-ACK/ACK complete; without it the channel is connected on the
    /// spot.
    pub fn request_connect(&mut self) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Connectable => {}
            ChannelState::Connected => return Ok(()),
            _ => return Err(ChannelError::InvalidChannelState),
        }
        if self.config.handshake_enabled {
            self.connect_requested = true;
        } else {
            if self.config.flow_control_enabled {
                // No handshake to learn the peer window from.
                self.send_window = DEFAULT_BUFFER_SIZE;
            }
            self.set_state(ChannelState::Connected);
        }
        Ok(())
    }

    pub fn request_shutdown(&mut self) {
        if self.state == ChannelState::Connected {
            self.fin_pending = true;
        } else {
            self.set_state(ChannelState::Disconnected);
        }
    }

    /// Accepts bytes into the send ring, up to the free capacity. Returns
    /// the count accepted.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<usize, ChannelError> {
        match self.state {
            ChannelState::Connected => {}
            ChannelState::Disconnected => return Err(ChannelError::ConnectionFailure),
            _ => return Err(ChannelError::InvalidChannelState),
        }
        let free = self.send_capacity.saturating_sub(self.send_ring.len());
        let n = free.min(data.len());
        self.send_ring.extend(&data[..n]);
        self.queued_offset += n as u64;
        Ok(n)
    }

    /// Pops up to `dst.len()` received bytes. With flow control the returned
    /// delta must be advertised back to the peer as a window update.
    pub fn consume_recv(&mut self, dst: &mut [u8]) -> (usize, u32) {
        let n = dst.len().min(self.recv_ring.len());
        for slot in dst[..n].iter_mut() {
            *slot = self.recv_ring.pop_front().unwrap();
        }
        let delta = if self.config.flow_control_enabled { n as u32 } else { 0 };
        (n, delta)
    }

    pub fn recv_len(&self) -> usize {
        self.recv_ring.len()
    }

    pub fn grant_window(&mut self, delta: u32) {
        self.send_window = self.send_window.saturating_add(delta as usize);
    }

    /// Whether the send worker has anything to emit for this channel.
    pub fn has_pending_send(&self) -> bool {
        if self.fin_pending {
            return true;
        }
        match self.handshake {
            Handshake::SynAckPending | Handshake::AckPending => return true,
            Handshake::Idle
                if self.connect_requested && self.state == ChannelState::Connectable =>
            {
                return true;
            }
            Handshake::SynSent
                if self.syn_sent_at.is_some_and(|at| at.elapsed() >= SYN_RETRY) =>
            {
                return true;
            }
            _ => {}
        }
        self.state == ChannelState::Connected
            && !self.send_ring.is_empty()
            && (!self.config.flow_control_enabled || self.send_window > 0)
    }

    fn header(&self, command: Command, body_len: usize) -> PacketHeader {
        PacketHeader {
            service_id: self.id.service_id(),
            task_id: 0,
            command,
            is_continuation: false,
            version: self.version,
            body_len: body_len as u32,
        }
    }

    /// Builds the next packet to put on the wire, if any. Handshake and FIN
    /// take precedence over data.
    pub fn next_packet(&mut self) -> Option<OutPacket> {
        if self.fin_pending {
            self.fin_pending = false;
            let pkt = encode(self.header(Command::Fin, 0), &[]);
            self.set_state(ChannelState::Disconnected);
            return Some(OutPacket { bytes: pkt, payload_len: 0 });
        }

        match self.handshake {
            Handshake::Idle
                if self.connect_requested && self.state == ChannelState::Connectable =>
            {
                self.handshake = Handshake::SynSent;
                self.syn_sent_at = Some(Instant::now());
                let body = (self.recv_capacity as u32).to_le_bytes();
                return Some(OutPacket { bytes: encode(self.header(Command::Syn, 4), &body), payload_len: 0 });
            }
            Handshake::SynSent
                if self.syn_sent_at.is_some_and(|at| at.elapsed() >= SYN_RETRY) =>
            {
                self.syn_sent_at = Some(Instant::now());
                let body = (self.recv_capacity as u32).to_le_bytes();
                return Some(OutPacket { bytes: encode(self.header(Command::Syn, 4), &body), payload_len: 0 });
            }
            Handshake::SynAckPending => {
                self.handshake = Handshake::SynAckSent;
                let body = (self.recv_capacity as u32).to_le_bytes();
                return Some(OutPacket { bytes: encode(self.header(Command::SynAck, 4), &body), payload_len: 0 });
            }
            Handshake::AckPending => {
                self.handshake = Handshake::Done;
                self.set_state(ChannelState::Connected);
                return Some(OutPacket { bytes: encode(self.header(Command::Ack, 0), &[]), payload_len: 0 });
            }
            _ => {}
        }

        if self.state != ChannelState::Connected || self.send_ring.is_empty() {
            return None;
        }
        let mut limit = (self.config.max_packet_size as usize).min(MAX_BODY_SIZE);
        if self.config.flow_control_enabled {
            if self.send_window == 0 {
                return None;
            }
            limit = limit.min(self.send_window);
        }

        let n = limit.min(self.send_ring.len());
        let body: Vec<u8> = self.send_ring.drain(..n).collect();
        if self.config.flow_control_enabled {
            self.send_window -= n;
        }
        // More queued data means the peer should expect continuation.
        let mut header = self.header(Command::Data, n);
        header.is_continuation = !self.send_ring.is_empty();
        Some(OutPacket { bytes: encode(header, &body), payload_len: n })
    }

    /// Handles an inbound packet for this channel.
    pub fn on_packet(&mut self, header: &PacketHeader, body: &[u8]) -> Result<(), ChannelError> {
        match header.command {
            Command::Syn => {
                if !self.config.handshake_enabled || self.state != ChannelState::Connectable {
                    warn!(channel = %self.id, "unexpected SYN");
                    return Ok(());
                }
                self.accept_peer_window(body);
                self.version = PROTOCOL_VERSION.min(header.version.max(1));
                self.handshake = Handshake::SynAckPending;
            }
            Command::SynAck => {
                if self.handshake != Handshake::SynSent {
                    warn!(channel = %self.id, "unexpected SYN-ACK");
                    return Ok(());
                }
                self.accept_peer_window(body);
                self.version = self.version.min(header.version.max(1));
                self.handshake = Handshake::AckPending;
                self.syn_sent_at = None;
            }
            Command::Ack => {
                if self.handshake == Handshake::SynAckSent {
                    self.handshake = Handshake::Done;
                    self.set_state(ChannelState::Connected);
                } else {
                    warn!(channel = %self.id, "unexpected ACK");
                }
            }
            Command::Data => {
                // Data from a peer we sent SYN-ACK to means our ACK's
                // sender considers the handshake done; agree.
                if self.handshake == Handshake::SynAckSent {
                    self.handshake = Handshake::Done;
                    self.set_state(ChannelState::Connected);
                }
                let accept = match self.state {
                    ChannelState::Connected => true,
                    // Bulk channels carry data without a handshake; the peer
                    // may start streaming before our local connect.
                    ChannelState::Connectable => !self.config.handshake_enabled,
                    _ => false,
                };
                if !accept {
                    warn!(channel = %self.id, state = ?self.state, "data on unconnected channel");
                    return Ok(());
                }
                if self.recv_ring.len() + body.len() > self.recv_capacity {
                    warn!(channel = %self.id, "receive ring overflow");
                    return Err(ChannelError::ConnectionFailure);
                }
                self.recv_ring.extend(body);
            }
            Command::Fin => {
                self.set_state(ChannelState::Disconnected);
            }
            Command::WindowUpdate => {
                // Routed at the manager level; reaching here means the peer
                // addressed a data channel directly.
                warn!(channel = %self.id, "window update on non-control channel");
            }
        }
        Ok(())
    }

    fn accept_peer_window(&mut self, body: &[u8]) {
        if self.config.flow_control_enabled {
            if let Ok(bytes) = <[u8; 4]>::try_from(body) {
                self.send_window = u32::from_le_bytes(bytes) as usize;
            } else {
                self.send_window = DEFAULT_BUFFER_SIZE;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use tether_wire::ModuleId;

    use super::*;

    fn pair() -> (ChannelEngine, ChannelEngine) {
        let id = ChannelId::new(ModuleId::Htcfs, 0);
        (ChannelEngine::new(id, true), ChannelEngine::new(id, true))
    }

    fn deliver(from: &mut ChannelEngine, to: &mut ChannelEngine) -> usize {
        let mut delivered = 0;
        while let Some(pkt) = from.next_packet() {
            from.sent_offset += pkt.payload_len as u64;
            let header_bytes: [u8; tether_wire::HEADER_SIZE] =
                pkt.bytes[..tether_wire::HEADER_SIZE].try_into().unwrap();
            let (header, _) = PacketHeader::decode(&header_bytes).unwrap();
            to.on_packet(&header, &pkt.bytes[tether_wire::HEADER_SIZE..]).unwrap();
            delivered += 1;
        }
        delivered
    }

    #[test]
    fn handshake_connects_both_sides() {
        let (mut a, mut b) = pair();
        a.request_connect().unwrap();

        deliver(&mut a, &mut b); // SYN
        deliver(&mut b, &mut a); // SYN-ACK
        deliver(&mut a, &mut b); // ACK

        assert_eq!(a.state(), ChannelState::Connected);
        assert_eq!(b.state(), ChannelState::Connected);
    }

    #[test]
    fn connect_without_handshake_is_immediate() {
        let (mut a, _) = pair();
        a.set_config(ChannelConfig::BULK_SEND);
        a.request_connect().unwrap();
        assert_eq!(a.state(), ChannelState::Connected);
    }

    #[test]
    fn data_respects_window() {
        let (mut a, mut b) = pair();
        a.request_connect().unwrap();
        b.set_recv_capacity(8);
        deliver(&mut a, &mut b);
        deliver(&mut b, &mut a);
        deliver(&mut a, &mut b);

        // Peer advertised an 8-byte window; only 8 of 12 bytes may fly.
        assert_eq!(a.queue_send(b"twelve bytes").unwrap(), 12);
        deliver(&mut a, &mut b);
        assert_eq!(b.recv_len(), 8);
        assert!(!a.has_pending_send());

        // Draining the peer ring opens the window again.
        let mut buf = [0u8; 8];
        let (n, delta) = b.consume_recv(&mut buf);
        assert_eq!(n, 8);
        a.grant_window(delta);
        deliver(&mut a, &mut b);
        assert_eq!(b.recv_len(), 4);
    }

    #[test]
    fn data_splits_at_max_packet_size() {
        let (mut a, mut b) = pair();
        a.set_config(ChannelConfig { max_packet_size: 4, ..ChannelConfig::DEFAULT });
        a.request_connect().unwrap();
        deliver(&mut a, &mut b);
        deliver(&mut b, &mut a);
        deliver(&mut a, &mut b);

        a.queue_send(b"0123456789").unwrap();
        let packets = deliver(&mut a, &mut b);
        assert_eq!(packets, 3);
        assert_eq!(b.recv_len(), 10);
    }

    #[test]
    fn fin_disconnects_peer() {
        let (mut a, mut b) = pair();
        a.request_connect().unwrap();
        deliver(&mut a, &mut b);
        deliver(&mut b, &mut a);
        deliver(&mut a, &mut b);

        a.request_shutdown();
        deliver(&mut a, &mut b);
        assert_eq!(a.state(), ChannelState::Disconnected);
        assert_eq!(b.state(), ChannelState::Disconnected);
    }

    #[test]
    fn newer_peer_version_is_clamped() {
        let (mut a, mut b) = pair();
        a.request_connect().unwrap();
        let pkt = a.next_packet().unwrap();
        let header_bytes: [u8; tether_wire::HEADER_SIZE] =
            pkt.bytes[..tether_wire::HEADER_SIZE].try_into().unwrap();
        let (mut header, _) = PacketHeader::decode(&header_bytes).unwrap();
        header.version = 9;
        b.on_packet(&header, &pkt.bytes[tether_wire::HEADER_SIZE..]).unwrap();
        let synack = b.next_packet().unwrap();
        let hb: [u8; tether_wire::HEADER_SIZE] =
            synack.bytes[..tether_wire::HEADER_SIZE].try_into().unwrap();
        let (synack_header, _) = PacketHeader::decode(&hb).unwrap();
        assert_eq!(synack_header.version, 1);
    }

    #[test]
    fn overflow_is_a_connection_failure() {
        let (mut a, mut b) = pair();
        b.set_config(ChannelConfig::BULK_RECEIVE);
        b.set_recv_capacity(4);
        a.set_config(ChannelConfig::BULK_SEND);
        a.request_connect().unwrap();
        b.request_connect().unwrap();

        a.queue_send(b"toolarge").unwrap();
        let pkt = a.next_packet().unwrap();
        let hb: [u8; tether_wire::HEADER_SIZE] =
            pkt.bytes[..tether_wire::HEADER_SIZE].try_into().unwrap();
        let (header, _) = PacketHeader::decode(&hb).unwrap();
        assert_eq!(
            b.on_packet(&header, &pkt.bytes[tether_wire::HEADER_SIZE..]),
            Err(ChannelError::ConnectionFailure)
        );
    }
}
