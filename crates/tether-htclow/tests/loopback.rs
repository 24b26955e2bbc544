//! End-to-end transport exercises over an in-memory carrier pair: one
//! manager plays the target, the other the host.

use std::{sync::Arc, time::Duration};

use tether_htclow::{
    Carrier, Channel, ChannelConfig, ChannelError, ChannelId, ChannelState, HtclowManager,
    ModuleId, ReceiveOption, loopback,
};

fn managers() -> (Arc<HtclowManager>, Arc<HtclowManager>, Arc<dyn Carrier>, Arc<dyn Carrier>) {
    let (a, b) = loopback();
    let a: Arc<dyn Carrier> = Arc::new(a);
    let b: Arc<dyn Carrier> = Arc::new(b);
    (HtclowManager::new(a.clone()), HtclowManager::new(b.clone()), a, b)
}

fn wait_state(channel: &Channel, state: ChannelState) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if channel.state().unwrap() == state {
            return;
        }
        assert!(std::time::Instant::now() < deadline, "timed out waiting for {state:?}");
        let event = channel.state_event().unwrap();
        event.wait_timeout(Duration::from_millis(50));
        event.clear();
    }
}

fn connected_pair(
    target: &Arc<HtclowManager>,
    host: &Arc<HtclowManager>,
    id: ChannelId,
) -> (Channel, Channel) {
    let target_ch = Channel::new(target.clone(), id);
    let host_ch = Channel::new(host.clone(), id);
    host_ch.open().unwrap();
    target_ch.open().unwrap();
    target_ch.connect().unwrap();
    wait_state(&host_ch, ChannelState::Connected);
    (target_ch, host_ch)
}

#[test]
fn handshake_and_ordered_delivery() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 0);
    let (target_ch, host_ch) = connected_pair(&target, &host, id);

    assert_eq!(target_ch.send(b"first ").unwrap(), 6);
    assert_eq!(target_ch.send(b"second").unwrap(), 6);

    let mut buf = [0u8; 12];
    assert_eq!(host_ch.receive(&mut buf, ReceiveOption::All).unwrap(), 12);
    assert_eq!(&buf, b"first second");

    // And the other direction.
    host_ch.send(b"reply").unwrap();
    let mut back = [0u8; 5];
    target_ch.receive(&mut back, ReceiveOption::All).unwrap();
    assert_eq!(&back, b"reply");
}

#[test]
fn receive_option_semantics() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcs, 0);
    let (target_ch, host_ch) = connected_pair(&target, &host, id);

    let mut buf = [0u8; 16];
    assert_eq!(
        host_ch.receive(&mut buf, ReceiveOption::NonBlocking),
        Err(ChannelError::ReceiveBufferEmpty)
    );

    target_ch.send(b"abc").unwrap();
    // Any returns as soon as something is there, possibly less than asked.
    let n = host_ch.receive(&mut buf, ReceiveOption::Any).unwrap();
    assert!(n >= 1 && n <= 3);

    // All spans multiple sends.
    let host2 = Channel::new(host.clone(), id);
    let reader = std::thread::spawn(move || {
        let mut all = [0u8; 6];
        host2.receive(&mut all, ReceiveOption::All).map(|_| all)
    });
    std::thread::sleep(Duration::from_millis(20));
    target_ch.send(b"123").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    target_ch.send(b"456").unwrap();
    let mut expected = Vec::from(&b"abc"[n..]);
    expected.extend_from_slice(b"123456");
    let got = reader.join().unwrap().unwrap();
    assert_eq!(&got[..], &expected[..6]);
}

#[test]
fn wait_receive_fires_at_threshold() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 0);
    let (target_ch, host_ch) = connected_pair(&target, &host, id);

    let host_mgr = host.clone();
    let waiter = std::thread::spawn(move || Channel::new(host_mgr, id).wait_receive(8));
    std::thread::sleep(Duration::from_millis(20));
    target_ch.send(b"1234").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    target_ch.send(b"5678").unwrap();
    waiter.join().unwrap().unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(host_ch.receive(&mut buf, ReceiveOption::NonBlocking).unwrap(), 8);
}

#[test]
fn flow_control_sustains_large_transfer() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 0);
    let (target_ch, host_ch) = connected_pair(&target, &host, id);

    const LEN: usize = 200_000;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();

    let reader = std::thread::spawn(move || {
        let mut buf = vec![0u8; LEN];
        host_ch.receive(&mut buf, ReceiveOption::All).map(|_| buf)
    });

    assert_eq!(target_ch.send(&payload).unwrap(), LEN);
    target_ch.flush().unwrap();
    assert_eq!(reader.join().unwrap().unwrap(), payload);
}

#[test]
fn bulk_channel_without_handshake() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 1);

    let target_ch = Channel::new(target.clone(), id);
    let host_ch = Channel::new(host.clone(), id);
    target_ch.open().unwrap();
    target_ch.set_config(ChannelConfig::BULK_RECEIVE).unwrap();
    target_ch.set_receive_buffer_size(0x20000).unwrap();
    target_ch.connect().unwrap();

    host_ch.open().unwrap();
    host_ch.set_config(ChannelConfig::BULK_SEND).unwrap();
    let payload = vec![0x5Au8; 0x12345];
    host_ch.set_send_buffer_with_data(&payload).unwrap();
    host_ch.connect().unwrap();
    host_ch.flush().unwrap();

    let mut buf = vec![0u8; payload.len()];
    target_ch.receive(&mut buf, ReceiveOption::All).unwrap();
    assert_eq!(buf, payload);

    target_ch.close();
    host_ch.close();
}

#[test]
fn close_cancels_outstanding_tasks() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcs, 0);
    let (target_ch, _host_ch) = connected_pair(&target, &host, id);

    let target_mgr = target.clone();
    let blocked = std::thread::spawn(move || {
        let mut buf = [0u8; 4];
        Channel::new(target_mgr, id).receive(&mut buf, ReceiveOption::Any)
    });
    std::thread::sleep(Duration::from_millis(30));
    target_ch.close();

    assert_eq!(blocked.join().unwrap(), Err(ChannelError::ChannelWaitCancelled));
}

#[test]
fn corrupt_header_disconnects_channel() {
    let (target, host, _target_carrier, host_carrier) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 0);
    let (target_ch, _host_ch) = connected_pair(&target, &host, id);

    let target_mgr = target.clone();
    let blocked = std::thread::spawn(move || {
        let mut buf = [0u8; 4];
        Channel::new(target_mgr, id).receive(&mut buf, ReceiveOption::Any)
    });
    std::thread::sleep(Duration::from_millis(30));

    // A header with a flipped bit: checksum cannot validate.
    host_carrier.send(&[0xFF; 0x28]).unwrap();

    assert_eq!(blocked.join().unwrap(), Err(ChannelError::ConnectionFailure));
    wait_state(&target_ch, ChannelState::Disconnected);
}

#[test]
fn suspend_disconnects_resume_recovers() {
    let (target, host, _, _) = managers();
    let id = ChannelId::new(ModuleId::Htcfs, 0);
    let (target_ch, _host_ch) = connected_pair(&target, &host, id);

    target.suspend();
    assert_eq!(target_ch.state().unwrap(), ChannelState::Disconnected);

    target.resume();
    target_ch.close();
    let fresh = Channel::new(target.clone(), id);
    fresh.open().unwrap();
    wait_state(&fresh, ChannelState::Connectable);
}
