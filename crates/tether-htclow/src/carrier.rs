use std::{collections::VecDeque, sync::Arc};

use parking_lot::{Condvar, Mutex};
use tether_utils::{ClearMode, Event};
use thiserror::Error;
use tracing::debug;

/// Link state of a carrier. Channels become connectable while the carrier is
/// `Ready` and are torn down on any transition away from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CarrierState {
    None,
    Initialized,
    Ready,
    Suspended,
    Gone,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierError {
    #[error("carrier disconnected")]
    Disconnected,
    #[error("carrier operation cancelled")]
    Cancelled,
}

/// A byte-stream link to the host. The carrier moves raw bytes; packet
/// framing is the codec's concern.
///
/// `send`/`recv` block; `cancel` unblocks any in-progress call with
/// `Cancelled` and drives the state to `Gone`.
pub trait Carrier: Send + Sync {
    fn send(&self, bytes: &[u8]) -> Result<(), CarrierError>;

    /// Blocks until at least one byte is available, returning the count
    /// copied into `buf`.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, CarrierError>;

    fn recv_exact(&self, buf: &mut [u8]) -> Result<(), CarrierError> {
        let mut filled = 0;
        while filled < buf.len() {
            filled += self.recv(&mut buf[filled..])?;
        }
        Ok(())
    }

    fn cancel(&self);

    /// Drops the current link (if any) without tearing the carrier down,
    /// e.g. after stream desynchronisation. The carrier may accept a new
    /// link afterwards.
    fn disconnect(&self);

    fn state(&self) -> CarrierState;

    /// Signalled on every state transition.
    fn state_event(&self) -> &Event;

    fn suspend(&self) {}
    fn resume(&self) {}
    fn notify_asleep(&self) {}
    fn notify_awake(&self) {}
}

struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    readable: Condvar,
}

impl Pipe {
    fn new() -> Self {
        Self { bytes: Mutex::new(VecDeque::new()), readable: Condvar::new() }
    }
}

struct LoopbackShared {
    state: Mutex<CarrierState>,
    state_event: Event,
}

/// One endpoint of an in-memory duplex byte link. [`loopback`] returns the
/// two halves; whatever one sends, the other receives. Used by tests and by
/// embedders that run both peers in-process.
pub struct LoopbackCarrier {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    shared: Arc<LoopbackShared>,
    state_event: Event,
}

pub fn loopback() -> (LoopbackCarrier, LoopbackCarrier) {
    let a = Arc::new(Pipe::new());
    let b = Arc::new(Pipe::new());
    let shared = Arc::new(LoopbackShared {
        state: Mutex::new(CarrierState::Ready),
        state_event: Event::new(ClearMode::Manual),
    });
    (
        LoopbackCarrier {
            tx: a.clone(),
            rx: b.clone(),
            shared: shared.clone(),
            state_event: Event::new(ClearMode::Manual),
        },
        LoopbackCarrier { tx: b, rx: a, shared, state_event: Event::new(ClearMode::Manual) },
    )
}

impl LoopbackCarrier {
    fn check_state(&self) -> Result<(), CarrierError> {
        match *self.shared.state.lock() {
            CarrierState::Ready => Ok(()),
            CarrierState::Gone => Err(CarrierError::Cancelled),
            _ => Err(CarrierError::Disconnected),
        }
    }

    fn set_state(&self, state: CarrierState) {
        *self.shared.state.lock() = state;
        self.shared.state_event.signal();
        self.state_event.signal();
        // Wake blocked readers on both sides so they observe the transition.
        self.tx.readable.notify_all();
        self.rx.readable.notify_all();
    }
}

impl Carrier for LoopbackCarrier {
    fn send(&self, bytes: &[u8]) -> Result<(), CarrierError> {
        self.check_state()?;
        let mut queue = self.tx.bytes.lock();
        queue.extend(bytes);
        self.tx.readable.notify_all();
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, CarrierError> {
        let mut queue = self.rx.bytes.lock();
        loop {
            self.check_state()?;
            if !queue.is_empty() {
                break;
            }
            self.rx.readable.wait(&mut queue);
        }
        let n = buf.len().min(queue.len());
        for slot in buf[..n].iter_mut() {
            *slot = queue.pop_front().unwrap();
        }
        Ok(n)
    }

    fn cancel(&self) {
        debug!("loopback carrier cancelled");
        self.set_state(CarrierState::Gone);
    }

    fn disconnect(&self) {
        // Drop in-flight bytes on both directions; the link is considered
        // re-established immediately.
        self.tx.bytes.lock().clear();
        self.rx.bytes.lock().clear();
        self.set_state(CarrierState::Ready);
    }

    fn state(&self) -> CarrierState {
        *self.shared.state.lock()
    }

    fn state_event(&self) -> &Event {
        &self.state_event
    }

    fn suspend(&self) {
        self.set_state(CarrierState::Suspended);
    }

    fn resume(&self) {
        self.tx.bytes.lock().clear();
        self.rx.bytes.lock().clear();
        self.set_state(CarrierState::Ready);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_cross_the_pair() {
        let (a, b) = loopback();
        a.send(b"abc").unwrap();
        let mut buf = [0u8; 8];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
    }

    #[test]
    fn recv_exact_spans_sends() {
        let (a, b) = loopback();
        a.send(b"ab").unwrap();
        a.send(b"cd").unwrap();
        let mut buf = [0u8; 4];
        b.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn cancel_unblocks_reader() {
        let (a, b) = loopback();
        let b = Arc::new(b);
        let b2 = b.clone();
        let h = std::thread::spawn(move || {
            let mut buf = [0u8; 1];
            b2.recv(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(10));
        a.cancel();
        assert_eq!(h.join().unwrap(), Err(CarrierError::Cancelled));
    }

    #[test]
    fn disconnect_flushes_in_flight_bytes() {
        let (a, b) = loopback();
        a.send(b"junk").unwrap();
        a.disconnect();
        a.send(b"x").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.recv(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'x');
    }
}
