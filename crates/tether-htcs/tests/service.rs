//! Socket service exercises against a scripted host over an in-memory
//! carrier pair.

use std::{sync::Arc, time::Duration};

use tether_htcs::{ENETDOWN, HtcsError, HtcsService, SockAddrHtcs, SocketPacketType};
use tether_htclow::{
    Carrier, Channel, ChannelConfig, ChannelId, ChannelState, HtclowManager, ModuleId,
    ReceiveOption, loopback,
};
use tether_wire::{RPC_HEADER_SIZE, RpcHeader};

struct Host {
    manager: Arc<HtclowManager>,
    rpc: Channel,
}

impl Host {
    fn new(manager: Arc<HtclowManager>) -> Self {
        let rpc = Channel::new(manager.clone(), ChannelId::new(ModuleId::Htcs, 0));
        rpc.open().unwrap();
        rpc.set_send_buffer_size(0x1C040).unwrap();
        rpc.set_receive_buffer_size(0x1C040).unwrap();
        Self { manager, rpc }
    }

    fn wait_connected(&self) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while self.rpc.state().unwrap() != ChannelState::Connected {
            assert!(std::time::Instant::now() < deadline, "host never connected");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn recv_request(&self) -> (RpcHeader, Vec<u8>) {
        let mut header_bytes = [0u8; RPC_HEADER_SIZE];
        self.rpc.receive(&mut header_bytes, ReceiveOption::All).unwrap();
        let header = RpcHeader::decode(&header_bytes).unwrap();
        let mut body = vec![0u8; header.body_size as usize];
        if !body.is_empty() {
            self.rpc.receive(&mut body, ReceiveOption::All).unwrap();
        }
        (header, body)
    }

    /// Responds to `request`, echoing its task id, with host (err, value).
    fn respond(&self, request: &RpcHeader, err: i32, value: i64, body: &[u8]) {
        let params = [err as u64, value as u64, 0, 0, request.params[4]];
        let header = RpcHeader::response(1, request.packet_type, body.len() as u64, params);
        let mut bytes = Vec::with_capacity(RPC_HEADER_SIZE + body.len());
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(body);
        assert_eq!(self.rpc.send(&bytes).unwrap(), bytes.len());
        self.rpc.flush().unwrap();
    }

    fn negotiate(&self) {
        let (request, _) = self.recv_request();
        assert_eq!(request.packet_type, SocketPacketType::GetMaxProtocolVersion as u16);
        let params = [0, 1, 0, 0, 0];
        let header = RpcHeader::response(request.version, request.packet_type, 0, params);
        self.rpc.send(&header.encode()).unwrap();
        self.rpc.flush().unwrap();

        let (request, _) = self.recv_request();
        assert_eq!(request.packet_type, SocketPacketType::SetProtocolVersion as u16);
        let header = RpcHeader::response(request.version, request.packet_type, 0, [0; 5]);
        self.rpc.send(&header.encode()).unwrap();
        self.rpc.flush().unwrap();
    }

    fn expect(&self, packet_type: SocketPacketType) -> (RpcHeader, Vec<u8>) {
        let (request, body) = self.recv_request();
        assert_eq!(request.packet_type, packet_type as u16);
        (request, body)
    }
}

fn setup() -> (Arc<HtcsService>, Host, Arc<HtclowManager>) {
    let (target_carrier, host_carrier) = loopback();
    let target_mgr = HtclowManager::new(Arc::new(target_carrier) as Arc<dyn Carrier>);
    let host_mgr = HtclowManager::new(Arc::new(host_carrier) as Arc<dyn Carrier>);

    let host = Host::new(host_mgr);
    let service = HtcsService::new(target_mgr.clone());
    host.wait_connected();
    host.negotiate();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !service.is_service_available() {
        assert!(std::time::Instant::now() < deadline, "service never became available");
        std::thread::sleep(Duration::from_millis(5));
    }
    (service, host, target_mgr)
}

#[test]
fn socket_lifecycle() {
    let (service, host, _mgr) = setup();

    let server = std::thread::spawn(move || {
        let (request, _) = host.expect(SocketPacketType::Socket);
        host.respond(&request, 0, 11, &[]);

        let (request, body) = host.expect(SocketPacketType::Bind);
        assert_eq!(request.params[0], 11);
        let addr = SockAddrHtcs::decode(&body).unwrap();
        assert_eq!(addr.port_name, "debug-log");
        host.respond(&request, 0, 0, &[]);

        let (request, _) = host.expect(SocketPacketType::Listen);
        assert_eq!(request.params, [11, 4, 0, 0, request.params[4]]);
        host.respond(&request, 0, 0, &[]);

        let (request, _) = host.expect(SocketPacketType::Close);
        host.respond(&request, 0, 0, &[]);
    });

    let desc = service.socket().unwrap();
    assert_eq!(desc, 11);
    let addr = SockAddrHtcs { peer_name: String::new(), port_name: "debug-log".into() };
    service.bind(desc, &addr).unwrap();
    service.listen(desc, 4).unwrap();
    service.close(desc).unwrap();
    server.join().unwrap();

    // The descriptor is gone once closed.
    assert_eq!(service.listen(11, 1), Err(HtcsError::UnknownDescriptor));
}

#[test]
fn two_phase_recv() {
    let (service, host, _mgr) = setup();

    let server = std::thread::spawn(move || {
        let (request, _) = host.expect(SocketPacketType::Socket);
        host.respond(&request, 0, 3, &[]);

        let (request, _) = host.expect(SocketPacketType::Recv);
        assert_eq!(request.params[1], 8);
        // Data shows up a little later, as in a real socket.
        std::thread::sleep(Duration::from_millis(50));
        host.respond(&request, 0, 5, b"hello");
    });

    let desc = service.socket().unwrap();
    let (task_id, event) = service.recv_start(desc, 8, 0).unwrap();
    event.wait();

    let mut buf = [0u8; 8];
    let received = service.recv_results(task_id, &mut buf).unwrap();
    assert_eq!(received, 5);
    assert_eq!(&buf[..5], b"hello");
    server.join().unwrap();
}

#[test]
fn host_errno_is_surfaced() {
    let (service, host, _mgr) = setup();

    let server = std::thread::spawn(move || {
        let (request, _) = host.expect(SocketPacketType::Socket);
        host.respond(&request, 0, 2, &[]);
        let (request, _) = host.expect(SocketPacketType::Connect);
        host.respond(&request, 111 /* ECONNREFUSED */, -1, &[]);
    });

    let desc = service.socket().unwrap();
    let addr = SockAddrHtcs { peer_name: "host".into(), port_name: "nope".into() };
    assert_eq!(service.connect(desc, &addr), Err(HtcsError::Host(111)));
    server.join().unwrap();
}

#[test]
fn send_large_streams_after_ready() {
    let (service, host, _mgr) = setup();
    const LEN: usize = 0x14000;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 239) as u8).collect();
    let expected = payload.clone();

    let server = std::thread::spawn(move || {
        let (request, _) = host.expect(SocketPacketType::Socket);
        host.respond(&request, 0, 6, &[]);

        let (request, _) = host.expect(SocketPacketType::SendLarge);
        assert_eq!(request.params[1], LEN as u64);
        let channel_id = request.params[3] as u16;

        // Receive side up first, then tell the target to stream.
        let data = Channel::new(host.manager.clone(), ChannelId::new(ModuleId::Htcs, channel_id));
        data.open().unwrap();
        data.set_config(ChannelConfig::BULK_RECEIVE).unwrap();
        data.set_receive_buffer_size(LEN).unwrap();
        data.connect().unwrap();
        host.respond(&request, 0, 0, &[]);

        let mut received = vec![0u8; LEN];
        data.receive(&mut received, ReceiveOption::All).unwrap();
        data.close();
        host.respond(&request, 0, LEN as i64, &[]);
        received
    });

    let desc = service.socket().unwrap();
    let sent = service.send_large(desc, &payload, 0).unwrap();
    assert_eq!(sent, LEN as i64);
    assert_eq!(server.join().unwrap(), expected);
}

#[test]
fn link_loss_maps_accept_to_enetdown() {
    let (service, host, target_mgr) = setup();

    let server = std::thread::spawn(move || {
        let (request, _) = host.expect(SocketPacketType::Socket);
        host.respond(&request, 0, 4, &[]);
        // Swallow the accept request and never answer.
        let _ = host.expect(SocketPacketType::Accept);
        host
    });

    let desc = service.socket().unwrap();
    let (task_id, _event) = service.accept_start(desc).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    // Drop the link out from under the service.
    target_mgr.disconnect();

    assert_eq!(service.accept_results(task_id), Err(HtcsError::Host(ENETDOWN)));
    drop(server);
}
