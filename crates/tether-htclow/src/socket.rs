//! TCP carrier: a listening port accepting a single host connection.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::Arc,
    thread::JoinHandle,
};

use mio::{Events, Interest, Poll, Token, net::{TcpListener, TcpStream}};
use parking_lot::{Condvar, Mutex};
use tether_utils::{ClearMode, Event};
use tracing::{debug, error, info, warn};

use crate::carrier::{Carrier, CarrierError, CarrierState};

const LISTENER: Token = Token(0);
const STREAM: Token = Token(1);
const WAKER: Token = Token(2);

const READ_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Flags {
    cancel: bool,
    drop_link: bool,
    suspend: bool,
    resume: bool,
}

struct Inner {
    state: Mutex<CarrierState>,
    state_event: Event,
    inbox: Mutex<VecDeque<u8>>,
    inbox_readable: Condvar,
    outbox: Mutex<VecDeque<u8>>,
    outbox_drained: Condvar,
    flags: Mutex<Flags>,
    waker: mio::Waker,
}

impl Inner {
    fn set_state(&self, state: CarrierState) {
        *self.state.lock() = state;
        self.state_event.signal();
        self.inbox_readable.notify_all();
        self.outbox_drained.notify_all();
    }
}

/// Socket-mode carrier. Owns an event-loop thread driving the listener and
/// at most one host stream; `send`/`recv` bridge into it through byte
/// queues.
pub struct SocketCarrier {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCarrier {
    pub fn listen(addr: SocketAddr) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        let inner = Arc::new(Inner {
            state: Mutex::new(CarrierState::Initialized),
            state_event: Event::new(ClearMode::Manual),
            inbox: Mutex::new(VecDeque::new()),
            inbox_readable: Condvar::new(),
            outbox: Mutex::new(VecDeque::new()),
            outbox_drained: Condvar::new(),
            flags: Mutex::new(Flags::default()),
            waker,
        });

        let loop_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("tether-carrier".into())
            .spawn(move || EventLoop::new(loop_inner, poll, listener).run())?;

        info!(%local_addr, "socket carrier listening");
        Ok(Self { inner, local_addr, event_loop: Mutex::new(Some(handle)) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn wake_with(&self, f: impl FnOnce(&mut Flags)) {
        f(&mut self.inner.flags.lock());
        let _ = self.inner.waker.wake();
    }
}

impl Drop for SocketCarrier {
    fn drop(&mut self) {
        self.cancel();
        if let Some(handle) = self.event_loop.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Carrier for SocketCarrier {
    fn send(&self, bytes: &[u8]) -> Result<(), CarrierError> {
        {
            let mut outbox = self.inner.outbox.lock();
            match *self.inner.state.lock() {
                CarrierState::Ready => {}
                CarrierState::Gone => return Err(CarrierError::Cancelled),
                _ => return Err(CarrierError::Disconnected),
            }
            outbox.extend(bytes);
        }
        let _ = self.inner.waker.wake();

        // Block until the kernel has taken the bytes; a dropped link fails
        // the send rather than silently discarding it.
        let mut outbox = self.inner.outbox.lock();
        while !outbox.is_empty() {
            match *self.inner.state.lock() {
                CarrierState::Ready => {}
                CarrierState::Gone => return Err(CarrierError::Cancelled),
                _ => return Err(CarrierError::Disconnected),
            }
            self.inner.outbox_drained.wait(&mut outbox);
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, CarrierError> {
        let mut inbox = self.inner.inbox.lock();
        loop {
            if !inbox.is_empty() {
                break;
            }
            match *self.inner.state.lock() {
                CarrierState::Ready => {}
                CarrierState::Gone => return Err(CarrierError::Cancelled),
                _ => return Err(CarrierError::Disconnected),
            }
            self.inner.inbox_readable.wait(&mut inbox);
        }
        let n = buf.len().min(inbox.len());
        for slot in buf[..n].iter_mut() {
            *slot = inbox.pop_front().unwrap();
        }
        Ok(n)
    }

    fn cancel(&self) {
        self.wake_with(|f| f.cancel = true);
    }

    fn disconnect(&self) {
        self.wake_with(|f| f.drop_link = true);
    }

    fn state(&self) -> CarrierState {
        *self.inner.state.lock()
    }

    fn state_event(&self) -> &Event {
        &self.inner.state_event
    }

    fn suspend(&self) {
        self.wake_with(|f| f.suspend = true);
    }

    fn resume(&self) {
        self.wake_with(|f| f.resume = true);
    }
}

struct EventLoop {
    inner: Arc<Inner>,
    poll: Poll,
    listener: TcpListener,
    stream: Option<TcpStream>,
    writable_armed: bool,
    read_buf: Vec<u8>,
}

impl EventLoop {
    fn new(inner: Arc<Inner>, poll: Poll, listener: TcpListener) -> Self {
        Self { inner, poll, listener, stream: None, writable_armed: false, read_buf: vec![0; READ_CHUNK] }
    }

    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("carrier poll failed: {e}");
                self.inner.set_state(CarrierState::Gone);
                return;
            }

            for ev in events.iter() {
                match ev.token() {
                    WAKER => {
                        if self.handle_wake() {
                            return;
                        }
                    }
                    LISTENER => self.accept(),
                    STREAM => {
                        if ev.is_readable() {
                            self.read_stream();
                        }
                        if ev.is_writable() {
                            self.write_stream();
                        }
                    }
                    _ => {}
                }
            }

            // A wake may have queued bytes before the stream became
            // writable-armed; try an opportunistic drain.
            if self.stream.is_some() && !self.inner.outbox.lock().is_empty() {
                self.write_stream();
            }
        }
    }

    /// Returns true when the loop should exit.
    fn handle_wake(&mut self) -> bool {
        let flags = std::mem::take(&mut *self.inner.flags.lock());
        if flags.cancel {
            debug!("carrier cancelled");
            self.drop_stream();
            self.inner.set_state(CarrierState::Gone);
            return true;
        }
        if flags.drop_link {
            debug!("carrier link dropped on request");
            self.drop_stream();
            self.inner.set_state(CarrierState::Initialized);
        }
        if flags.suspend {
            self.drop_stream();
            self.inner.set_state(CarrierState::Suspended);
        }
        if flags.resume && *self.inner.state.lock() == CarrierState::Suspended {
            self.inner.set_state(CarrierState::Initialized);
        }
        false
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if *self.inner.state.lock() == CarrierState::Suspended {
                        debug!(%peer, "rejecting host while suspended");
                        continue;
                    }
                    if self.stream.is_some() {
                        warn!(%peer, "second host connection refused");
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    if let Err(e) =
                        self.poll.registry().register(&mut stream, STREAM, Interest::READABLE)
                    {
                        error!("couldn't register host stream: {e}");
                        continue;
                    }
                    info!(%peer, "host connected");
                    self.stream = Some(stream);
                    self.writable_armed = false;
                    self.inner.set_state(CarrierState::Ready);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn drop_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.inner.inbox_readable.notify_all();
        self.inner.outbox.lock().clear();
        self.inner.outbox_drained.notify_all();
    }

    fn link_lost(&mut self, why: &str) {
        debug!("host link lost: {why}");
        self.drop_stream();
        self.inner.set_state(CarrierState::Initialized);
    }

    fn read_stream(&mut self) {
        let lost: Option<String> = 'read: {
            let Some(stream) = self.stream.as_mut() else { return };
            loop {
                match stream.read(&mut self.read_buf) {
                    Ok(0) => break 'read Some("eof".into()),
                    Ok(n) => {
                        let mut inbox = self.inner.inbox.lock();
                        inbox.extend(&self.read_buf[..n]);
                        self.inner.inbox_readable.notify_all();
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break 'read None,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break 'read Some(format!("read: {e}")),
                }
            }
        };
        if let Some(why) = lost {
            self.link_lost(&why);
        }
    }

    fn write_stream(&mut self) {
        let outcome: Result<bool, String> = 'write: {
            let Some(stream) = self.stream.as_mut() else { return };
            let mut outbox = self.inner.outbox.lock();
            while !outbox.is_empty() {
                let (front, _) = outbox.as_slices();
                match stream.write(front) {
                    Ok(0) => break 'write Err("write zero".into()),
                    Ok(n) => {
                        outbox.drain(..n);
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break 'write Err(format!("write: {e}")),
                }
            }
            Ok(outbox.is_empty())
        };

        let drained = match outcome {
            Ok(drained) => drained,
            Err(why) => {
                self.link_lost(&why);
                return;
            }
        };

        if drained {
            self.inner.outbox_drained.notify_all();
            if self.writable_armed {
                if let Some(stream) = self.stream.as_mut() {
                    let _ = self.poll.registry().reregister(stream, STREAM, Interest::READABLE);
                }
                self.writable_armed = false;
            }
        } else if !self.writable_armed {
            let rearmed = match self.stream.as_mut() {
                Some(stream) => self
                    .poll
                    .registry()
                    .reregister(stream, STREAM, Interest::READABLE | Interest::WRITABLE)
                    .is_ok(),
                None => return,
            };
            if !rearmed {
                self.link_lost("reregister");
                return;
            }
            self.writable_armed = true;
        }
    }
}

#[cfg(test)]
mod test {
    use std::{io::{Read, Write}, time::Duration};

    use super::*;

    fn connect_host(carrier: &SocketCarrier) -> std::net::TcpStream {
        let host = std::net::TcpStream::connect(carrier.local_addr()).unwrap();
        carrier.state_event().wait_timeout(Duration::from_secs(2));
        assert_eq!(carrier.state(), CarrierState::Ready);
        host
    }

    #[test]
    fn host_roundtrip() {
        let carrier = SocketCarrier::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut host = connect_host(&carrier);

        host.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        carrier.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        carrier.send(b"pong").unwrap();
        let mut back = [0u8; 4];
        host.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"pong");
    }

    #[test]
    fn host_disconnect_surfaces() {
        let carrier = SocketCarrier::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let host = connect_host(&carrier);
        drop(host);

        let mut buf = [0u8; 1];
        assert_eq!(carrier.recv(&mut buf), Err(CarrierError::Disconnected));
        assert_eq!(carrier.state(), CarrierState::Initialized);
    }

    #[test]
    fn cancel_unblocks_recv() {
        let carrier = Arc::new(SocketCarrier::listen("127.0.0.1:0".parse().unwrap()).unwrap());
        let _host = connect_host(&carrier);

        let c = carrier.clone();
        let h = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            c.recv(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(20));
        carrier.cancel();
        assert_eq!(h.join().unwrap(), Err(CarrierError::Cancelled));
        assert_eq!(carrier.state(), CarrierState::Gone);
    }

    #[test]
    fn host_can_reconnect() {
        let carrier = SocketCarrier::listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let host = connect_host(&carrier);
        drop(host);
        let mut buf = [0u8; 1];
        let _ = carrier.recv(&mut buf);

        carrier.state_event().clear();
        let mut host2 = connect_host(&carrier);
        host2.write_all(b"x").unwrap();
        carrier.recv_exact(&mut buf).unwrap();
        assert_eq!(buf[0], b'x');
    }
}
