//! Capabilities the cheat engine needs from the surrounding system, plus an
//! in-memory implementation for tests and host-side tooling.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::CheatError,
    vm::MemoryExtents,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub process_id: u64,
    pub title_id: u64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessExtents {
    pub main: MemoryExtents,
    pub heap: MemoryExtents,
    pub alias: MemoryExtents,
    pub address_space: MemoryExtents,
    pub build_id: [u8; 0x20],
}

/// An open debug attachment. Dropping the handle releases it.
pub trait DebugHandle: Send + Sync {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), CheatError>;
    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), CheatError>;
    fn query_extents(&self) -> Result<ProcessExtents, CheatError>;
    /// Blocks up to `timeout` for a debug event from the debuggee.
    fn wait_debug_event(&self, timeout: Duration) -> bool;
    /// Resumes the debuggee past the pending event.
    fn continue_debug_events(&self) -> Result<(), CheatError>;
    fn is_alive(&self) -> bool;
}

pub trait ProcessDebugger: Send + Sync {
    fn current_application(&self) -> Option<ApplicationInfo>;
    fn attach(&self, process_id: u64) -> Result<Arc<dyn DebugHandle>, CheatError>;
}

/// Blocks until the system launches a new application.
pub trait LaunchEvents: Send + Sync {
    fn wait_launch(&self, timeout: Duration) -> Option<ApplicationInfo>;
}

/// Held-button state feeding keypress conditionals.
pub trait ButtonReader: Send + Sync {
    fn keys_down(&self) -> u64;
}

pub struct NoButtons;

impl ButtonReader for NoButtons {
    fn keys_down(&self) -> u64 {
        0
    }
}

// ----------------------------------------------------------------------
// In-memory system double
// ----------------------------------------------------------------------

pub const MOCK_MAIN_BASE: u64 = 0x8000_0000;
pub const MOCK_HEAP_BASE: u64 = 0x4000_0000;

struct MockProcess {
    info: ApplicationInfo,
    main: Vec<u8>,
    heap: Vec<u8>,
    build_id: [u8; 0x20],
    alive: bool,
}

impl MockProcess {
    fn slice(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
        if address >= MOCK_MAIN_BASE {
            let off = usize::try_from(address.checked_sub(MOCK_MAIN_BASE)?).ok()?;
            self.main.get_mut(off..off.checked_add(len)?)
        } else {
            let off = usize::try_from(address.checked_sub(MOCK_HEAP_BASE)?).ok()?;
            self.heap.get_mut(off..off.checked_add(len)?)
        }
    }
}

#[derive(Default)]
struct MockState {
    app: Option<MockProcess>,
    pending_launches: VecDeque<ApplicationInfo>,
    next_process_id: u64,
    keys_down: u64,
}

/// A process-manager stand-in: launches fake applications, exposes their
/// memory, and hands out debug attachments.
pub struct MockSystem {
    state: Mutex<MockState>,
    launched: Condvar,
}

impl Default for MockSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSystem {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState { next_process_id: 0x50, ..Default::default() }),
            launched: Condvar::new(),
        }
    }

    /// Starts a fresh application and announces the launch.
    pub fn launch(self: &Arc<Self>, title_id: u64, build_id: [u8; 0x20]) -> ApplicationInfo {
        let mut state = self.state.lock();
        state.next_process_id += 1;
        let info = ApplicationInfo { process_id: state.next_process_id, title_id };
        state.app = Some(MockProcess {
            info,
            main: vec![0; 0x100000],
            heap: vec![0; 0x100000],
            build_id,
            alive: true,
        });
        state.pending_launches.push_back(info);
        self.launched.notify_all();
        info
    }

    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if let Some(app) = state.app.as_mut() {
            app.alive = false;
        }
    }

    pub fn set_keys_down(&self, keys: u64) {
        self.state.lock().keys_down = keys;
    }

    /// Direct memory access for assertions and fixture setup.
    pub fn poke(&self, address: u64, data: &[u8]) {
        let mut state = self.state.lock();
        let app = state.app.as_mut().expect("no application");
        app.slice(address, data.len()).expect("address out of range").copy_from_slice(data);
    }

    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        let app = state.app.as_mut().expect("no application");
        app.slice(address, len).expect("address out of range").to_vec()
    }
}

impl ProcessDebugger for Arc<MockSystem> {
    fn current_application(&self) -> Option<ApplicationInfo> {
        self.state.lock().app.as_ref().filter(|app| app.alive).map(|app| app.info)
    }

    fn attach(&self, process_id: u64) -> Result<Arc<dyn DebugHandle>, CheatError> {
        let state = self.state.lock();
        let app = state.app.as_ref().ok_or(CheatError::AttachFailed)?;
        if !app.alive || app.info.process_id != process_id {
            return Err(CheatError::AttachFailed);
        }
        Ok(Arc::new(MockHandle { system: self.clone(), process_id }))
    }
}

impl LaunchEvents for Arc<MockSystem> {
    fn wait_launch(&self, timeout: Duration) -> Option<ApplicationInfo> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(info) = state.pending_launches.pop_front() {
                return Some(info);
            }
            if self.launched.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }
}

impl ButtonReader for Arc<MockSystem> {
    fn keys_down(&self) -> u64 {
        self.state.lock().keys_down
    }
}

struct MockHandle {
    system: Arc<MockSystem>,
    process_id: u64,
}

impl MockHandle {
    fn with_process<T>(
        &self,
        f: impl FnOnce(&mut MockProcess) -> Option<T>,
    ) -> Result<T, CheatError> {
        let mut state = self.system.state.lock();
        let app = state
            .app
            .as_mut()
            .filter(|app| app.alive && app.info.process_id == self.process_id)
            .ok_or(CheatError::ProcessAccess)?;
        f(app).ok_or(CheatError::ProcessAccess)
    }
}

impl DebugHandle for MockHandle {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), CheatError> {
        self.with_process(|app| {
            let src = app.slice(address, buf.len())?;
            buf.copy_from_slice(src);
            Some(())
        })
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> Result<(), CheatError> {
        self.with_process(|app| {
            app.slice(address, data.len())?.copy_from_slice(data);
            Some(())
        })
    }

    fn query_extents(&self) -> Result<ProcessExtents, CheatError> {
        self.with_process(|app| {
            Some(ProcessExtents {
                main: MemoryExtents { base: MOCK_MAIN_BASE, size: app.main.len() as u64 },
                heap: MemoryExtents { base: MOCK_HEAP_BASE, size: app.heap.len() as u64 },
                alias: MemoryExtents::default(),
                address_space: MemoryExtents { base: 0x0800_0000, size: 0x7800_0000 },
                build_id: app.build_id,
            })
        })
    }

    fn wait_debug_event(&self, timeout: Duration) -> bool {
        // The fake debuggee never raises events; the pump just idles.
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        false
    }

    fn continue_debug_events(&self) -> Result<(), CheatError> {
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.system
            .state
            .lock()
            .app
            .as_ref()
            .is_some_and(|app| app.alive && app.info.process_id == self.process_id)
    }
}
