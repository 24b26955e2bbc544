use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Whether a signalled event resets on its own once a waiter observes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearMode {
    Manual,
    Auto,
}

/// A waitable boolean flag shared between threads.
///
/// `Manual` events stay signalled until `clear()` is called; `Auto` events
/// wake exactly one waiter per `signal()` and reset themselves.
pub struct Event {
    signalled: Mutex<bool>,
    cond: Condvar,
    clear_mode: ClearMode,
}

impl Event {
    pub fn new(clear_mode: ClearMode) -> Self {
        Self { signalled: Mutex::new(false), cond: Condvar::new(), clear_mode }
    }

    pub fn signal(&self) {
        let mut signalled = self.signalled.lock();
        *signalled = true;
        match self.clear_mode {
            ClearMode::Manual => {
                self.cond.notify_all();
            }
            ClearMode::Auto => {
                self.cond.notify_one();
            }
        }
    }

    pub fn clear(&self) {
        *self.signalled.lock() = false;
    }

    /// Blocks until the event is signalled.
    pub fn wait(&self) {
        let mut signalled = self.signalled.lock();
        while !*signalled {
            self.cond.wait(&mut signalled);
        }
        if self.clear_mode == ClearMode::Auto {
            *signalled = false;
        }
    }

    /// Non-blocking check. Consumes the signal in `Auto` mode.
    pub fn try_wait(&self) -> bool {
        let mut signalled = self.signalled.lock();
        let was = *signalled;
        if was && self.clear_mode == ClearMode::Auto {
            *signalled = false;
        }
        was
    }

    /// Waits until signalled or `timeout` elapses. Returns whether the event
    /// was signalled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut signalled = self.signalled.lock();
        while !*signalled {
            if self.cond.wait_until(&mut signalled, deadline).timed_out() {
                return false;
            }
        }
        if self.clear_mode == ClearMode::Auto {
            *signalled = false;
        }
        true
    }
}
