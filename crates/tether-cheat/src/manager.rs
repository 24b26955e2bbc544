use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::Mutex;
use tether_utils::{ClearMode, Event, SettingsProvider, ThreadPriority, spawn_named};
use tracing::{debug, info, warn};

use crate::{
    error::CheatError,
    parse::{
        CheatDefinition, CheatEntry, MAX_CHEAT_COUNT, format_cheat_toggles, parse_cheat_toggles,
        parse_cheats,
    },
    process::{ApplicationInfo, ButtonReader, DebugHandle, LaunchEvents, ProcessDebugger},
    vm::{CheatMemory, CheatProcessMetadata, CheatVm},
};

pub const MAX_FROZEN_ADDRESS_COUNT: usize = 0x80;

/// VM cadence: twelve ticks per second.
const TICK_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 12);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrozenValue {
    pub width: u8,
    pub value: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrozenAddressEntry {
    pub address: u64,
    pub value: FrozenValue,
}

#[derive(Clone, Debug)]
pub struct CheatManagerOptions {
    pub enable_cheats_by_default: bool,
    pub always_save_cheat_toggles: bool,
    /// Directory containing `contents/<title-id>/cheats/...`.
    pub content_root: PathBuf,
}

impl CheatManagerOptions {
    pub fn from_settings(settings: &dyn SettingsProvider, content_root: PathBuf) -> Self {
        Self {
            enable_cheats_by_default: settings
                .get_bool("dmnt_cheats_enabled_by_default")
                .unwrap_or(true),
            always_save_cheat_toggles: settings
                .get_bool("dmnt_always_save_cheat_toggles")
                .unwrap_or(false),
            content_root,
        }
    }
}

struct Attachment {
    handle: Arc<dyn DebugHandle>,
    metadata: CheatProcessMetadata,
}

fn empty_entries() -> Vec<CheatEntry> {
    (0..MAX_CHEAT_COUNT as u32)
        .map(|cheat_id| CheatEntry { cheat_id, ..Default::default() })
        .collect()
}

struct CheatState {
    attachment: Option<Attachment>,
    entries: Vec<CheatEntry>,
    frozen: BTreeMap<u64, FrozenValue>,
    needs_reload_vm: bool,
    should_save_toggles: bool,
    vm: CheatVm,
}

struct Shared {
    lock: Mutex<CheatState>,
    process_event: Event,
    cancel: Event,
    debugger: Arc<dyn ProcessDebugger>,
    launches: Arc<dyn LaunchEvents>,
    buttons: Arc<dyn ButtonReader>,
    opts: CheatManagerOptions,
}

/// Memory access the VM uses: straight through the debug handle. Frozen
/// bookkeeping is intentionally not touched here, so the per-tick replay
/// restores whatever the cheat program overwrote.
struct HandleMemory<'a> {
    handle: &'a dyn DebugHandle,
}

impl CheatMemory for HandleMemory<'_> {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), CheatError> {
        self.handle.read_memory(address, buf)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), CheatError> {
        self.handle.write_memory(address, data)
    }
}

/// Attached-process cheat engine: owns the attachment lifecycle, the cheat
/// entry table, the frozen-address map and the VM tick.
pub struct CheatManager {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CheatManager {
    pub fn new(
        debugger: Arc<dyn ProcessDebugger>,
        launches: Arc<dyn LaunchEvents>,
        buttons: Arc<dyn ButtonReader>,
        opts: CheatManagerOptions,
    ) -> Arc<Self> {
        let shared = Arc::new(Shared {
            lock: Mutex::new(CheatState {
                attachment: None,
                entries: empty_entries(),
                frozen: BTreeMap::new(),
                needs_reload_vm: false,
                should_save_toggles: false,
                vm: CheatVm::new(),
            }),
            process_event: Event::new(ClearMode::Manual),
            cancel: Event::new(ClearMode::Manual),
            debugger,
            launches,
            buttons,
            opts,
        });

        let watcher_shared = shared.clone();
        let watcher = spawn_named("cheat-attach", ThreadPriority::Low, move || {
            attach_watcher_body(&watcher_shared);
        })
        .expect("couldn't spawn attach watcher");

        let ticker_shared = shared.clone();
        let ticker = spawn_named("cheat-vm", ThreadPriority::Medium, move || {
            vm_ticker_body(&ticker_shared);
        })
        .expect("couldn't spawn vm ticker");

        let pump_shared = shared.clone();
        let pump = spawn_named("cheat-debug-events", ThreadPriority::Medium, move || {
            debug_events_body(&pump_shared);
        })
        .expect("couldn't spawn debug events pump");

        Arc::new(Self { shared, threads: Mutex::new(vec![watcher, ticker, pump]) })
    }

    /// Signalled on every attach and detach.
    pub fn process_event(&self) -> &Event {
        &self.shared.process_event
    }

    pub fn has_active_process(&self) -> bool {
        let mut state = self.shared.lock.lock();
        has_active(&mut state, &self.shared)
    }

    /// Tears down the current attachment. Safe to call repeatedly.
    pub fn detach(&self) {
        let mut state = self.shared.lock.lock();
        close_active(&mut state, &self.shared);
    }

    /// Attaches to whatever application is currently running, with or
    /// without cheats on disk.
    pub fn force_attach(&self) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if has_active(&mut state, &self.shared) {
            return Ok(());
        }
        let app = self.shared.debugger.current_application().ok_or(CheatError::AttachFailed)?;
        attach_to(&mut state, &self.shared, app, true)
    }

    pub fn get_process_metadata(&self) -> Result<CheatProcessMetadata, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        Ok(state.attachment.as_ref().unwrap().metadata.clone())
    }

    // ------------------------------------------------------------------
    // Process memory
    // ------------------------------------------------------------------

    pub fn read_process_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        state.attachment.as_ref().unwrap().handle.read_memory(address, buf)
    }

    /// Writes process memory and updates any overlapped frozen values, so
    /// the next replay re-applies what was just written.
    pub fn write_process_memory(&self, address: u64, data: &[u8]) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        state.attachment.as_ref().unwrap().handle.write_memory(address, data)?;

        let end = address.saturating_add(data.len() as u64);
        for (&frozen_address, value) in state.frozen.range_mut(address..end) {
            let offset = (frozen_address - address) as usize;
            let mut bytes = value.value.to_le_bytes();
            let n = (data.len() - offset).min(bytes.len());
            bytes[..n].copy_from_slice(&data[offset..offset + n]);
            value.value = u64::from_le_bytes(bytes);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cheat entries
    // ------------------------------------------------------------------

    pub fn get_cheat_count(&self) -> Result<u64, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        Ok(state.entries.iter().filter(|e| !e.definition.is_empty()).count() as u64)
    }

    pub fn get_cheats(&self, offset: usize, max: usize) -> Result<Vec<CheatEntry>, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        Ok(state
            .entries
            .iter()
            .filter(|e| !e.definition.is_empty())
            .skip(offset)
            .take(max)
            .cloned()
            .collect())
    }

    pub fn get_cheat_by_id(&self, cheat_id: u32) -> Result<CheatEntry, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        state
            .entries
            .get(cheat_id as usize)
            .filter(|e| !e.definition.is_empty())
            .cloned()
            .ok_or(CheatError::UnknownId)
    }

    pub fn toggle_cheat(&self, cheat_id: u32) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        if cheat_id == 0 {
            return Err(CheatError::CannotDisableMasterCheat);
        }
        let entry = state
            .entries
            .get_mut(cheat_id as usize)
            .filter(|e| !e.definition.is_empty())
            .ok_or(CheatError::UnknownId)?;
        entry.enabled = !entry.enabled;
        state.needs_reload_vm = true;
        Ok(())
    }

    pub fn add_cheat(&self, definition: CheatDefinition, enabled: bool) -> Result<u32, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        if definition.opcodes.is_empty() {
            return Err(CheatError::InvalidCheat);
        }
        let slot = state
            .entries
            .iter()
            .skip(1)
            .position(|e| e.definition.is_empty())
            .map(|i| i + 1)
            .ok_or(CheatError::OutOfCheats)?;
        state.entries[slot] = CheatEntry { enabled, cheat_id: slot as u32, definition };
        state.needs_reload_vm = true;
        Ok(slot as u32)
    }

    pub fn remove_cheat(&self, cheat_id: u32) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        if cheat_id as usize >= MAX_CHEAT_COUNT {
            return Err(CheatError::UnknownId);
        }
        state.entries[cheat_id as usize] =
            CheatEntry { cheat_id, ..Default::default() };
        state.needs_reload_vm = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frozen addresses
    // ------------------------------------------------------------------

    pub fn get_frozen_address_count(&self) -> Result<u64, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        Ok(state.frozen.len() as u64)
    }

    pub fn get_frozen_addresses(
        &self,
        offset: usize,
        max: usize,
    ) -> Result<Vec<FrozenAddressEntry>, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        Ok(state
            .frozen
            .iter()
            .skip(offset)
            .take(max)
            .map(|(&address, &value)| FrozenAddressEntry { address, value })
            .collect())
    }

    pub fn get_frozen_address(&self, address: u64) -> Result<FrozenAddressEntry, CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        state
            .frozen
            .get(&address)
            .map(|&value| FrozenAddressEntry { address, value })
            .ok_or(CheatError::AddressNotFrozen)
    }

    /// Starts re-writing `address` every tick with its current contents.
    /// Returns the captured value.
    pub fn enable_frozen_address(&self, address: u64, width: u8) -> Result<u64, CheatError> {
        if !matches!(width, 1 | 2 | 4 | 8) {
            return Err(CheatError::InvalidWidth);
        }
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        if state.frozen.len() >= MAX_FROZEN_ADDRESS_COUNT {
            return Err(CheatError::TooManyFrozenAddresses);
        }
        if state.frozen.contains_key(&address) {
            return Err(CheatError::AddressAlreadyFrozen);
        }

        let mut bytes = [0u8; 8];
        state
            .attachment
            .as_ref()
            .unwrap()
            .handle
            .read_memory(address, &mut bytes[..width as usize])?;
        let value = u64::from_le_bytes(bytes);
        state.frozen.insert(address, FrozenValue { width, value });
        Ok(value)
    }

    pub fn disable_frozen_address(&self, address: u64) -> Result<(), CheatError> {
        let mut state = self.shared.lock.lock();
        if !has_active(&mut state, &self.shared) {
            return Err(CheatError::NotAttached);
        }
        state.frozen.remove(&address).map(|_| ()).ok_or(CheatError::AddressNotFrozen)
    }

    /// Stops the worker threads. Called on drop.
    pub fn finalize(&self) {
        self.shared.cancel.signal();
        for handle in std::mem::take(&mut *self.threads.lock()) {
            let _ = handle.join();
        }
        self.detach();
    }
}

impl Drop for CheatManager {
    fn drop(&mut self) {
        self.finalize();
    }
}

// ----------------------------------------------------------------------
// Attachment internals
// ----------------------------------------------------------------------

/// Verifies the attachment is still live, tearing it down when the process
/// died or was replaced behind our back.
fn has_active(state: &mut CheatState, shared: &Shared) -> bool {
    let alive = match &state.attachment {
        Some(attachment) => {
            attachment.handle.is_alive()
                && shared
                    .debugger
                    .current_application()
                    .is_some_and(|app| app.process_id == attachment.metadata.process_id)
        }
        None => false,
    };
    if !alive && state.attachment.is_some() {
        close_active(state, shared);
    }
    alive
}

fn close_active(state: &mut CheatState, shared: &Shared) {
    let Some(attachment) = state.attachment.take() else { return };

    if shared.opts.always_save_cheat_toggles || state.should_save_toggles {
        save_toggles(shared, attachment.metadata.title_id, &state.entries);
        state.should_save_toggles = false;
    }

    state.entries = empty_entries();
    state.frozen.clear();
    state.needs_reload_vm = true;
    drop(attachment);

    info!("cheat process detached");
    shared.process_event.signal();
}

fn cheats_dir(shared: &Shared, title_id: u64) -> PathBuf {
    shared.opts.content_root.join("contents").join(format!("{title_id:016x}")).join("cheats")
}

fn build_id_stem(build_id: &[u8; 0x20]) -> String {
    build_id[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn load_cheats_from_disk(path: &Path, enable_by_default: bool) -> Option<Vec<CheatEntry>> {
    let text = std::fs::read_to_string(path).ok()?;
    parse_cheats(&text, enable_by_default)
}

enum TogglesOutcome {
    Missing,
    Applied(Vec<(String, bool)>),
    Malformed,
}

fn load_toggles(path: &Path) -> TogglesOutcome {
    match std::fs::read_to_string(path) {
        Ok(text) => match parse_cheat_toggles(&text) {
            Some(toggles) => TogglesOutcome::Applied(toggles),
            None => TogglesOutcome::Malformed,
        },
        Err(_) => TogglesOutcome::Missing,
    }
}

fn save_toggles(shared: &Shared, title_id: u64, entries: &[CheatEntry]) {
    let dir = cheats_dir(shared, title_id);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("couldn't create cheats directory: {e}");
        return;
    }
    let path = dir.join("toggles.txt");
    if let Err(e) = std::fs::write(&path, format_cheat_toggles(entries)) {
        warn!("couldn't persist cheat toggles: {e}");
    } else {
        debug!(?path, "cheat toggles saved");
    }
}

/// Opens a debug attachment for `app` and loads its cheats. With
/// `tolerate_missing_cheats` unset, a title without a (valid) cheat file is
/// left untouched.
fn attach_to(
    state: &mut CheatState,
    shared: &Shared,
    app: ApplicationInfo,
    tolerate_missing_cheats: bool,
) -> Result<(), CheatError> {
    close_active(state, shared);

    let handle = shared.debugger.attach(app.process_id)?;
    let extents = handle.query_extents()?;
    let metadata = CheatProcessMetadata {
        process_id: app.process_id,
        title_id: app.title_id,
        main_nso_extents: extents.main,
        heap_extents: extents.heap,
        alias_extents: extents.alias,
        address_space_extents: extents.address_space,
        main_nso_build_id: extents.build_id,
    };

    let dir = cheats_dir(shared, app.title_id);
    let cheats_path = dir.join(format!("{}.txt", build_id_stem(&extents.build_id)));
    match load_cheats_from_disk(&cheats_path, shared.opts.enable_cheats_by_default) {
        Some(entries) => state.entries = entries,
        None if tolerate_missing_cheats => state.entries = empty_entries(),
        None => {
            debug!(?cheats_path, "no usable cheats; not attaching");
            return Err(CheatError::InvalidCheat);
        }
    }

    state.should_save_toggles = false;
    match load_toggles(&dir.join("toggles.txt")) {
        TogglesOutcome::Missing => {}
        TogglesOutcome::Applied(toggles) => {
            for (name, enabled) in toggles {
                if let Some(entry) = state
                    .entries
                    .iter_mut()
                    .skip(1)
                    .find(|e| e.definition.readable_name == name)
                {
                    entry.enabled = enabled;
                }
            }
            state.should_save_toggles = true;
        }
        TogglesOutcome::Malformed if tolerate_missing_cheats => {}
        TogglesOutcome::Malformed => {
            state.entries = empty_entries();
            return Err(CheatError::InvalidCheat);
        }
    }

    state.needs_reload_vm = true;
    state.attachment = Some(Attachment { handle, metadata });
    info!(title_id = app.title_id, process_id = app.process_id, "cheat process attached");
    shared.process_event.signal();
    Ok(())
}

// ----------------------------------------------------------------------
// Worker threads
// ----------------------------------------------------------------------

fn attach_watcher_body(shared: &Arc<Shared>) {
    while !shared.cancel.try_wait() {
        let Some(app) = shared.launches.wait_launch(Duration::from_millis(100)) else { continue };
        let mut state = shared.lock.lock();
        if let Err(e) = attach_to(&mut state, shared, app, false) {
            debug!("skipping launched application: {e}");
        }
    }
}

/// One VM tick: reload the program if entries changed, run it, then replay
/// every frozen address so their values stick.
fn tick(shared: &Shared) {
    let mut state = shared.lock.lock();
    if !has_active(&mut state, shared) {
        return;
    }

    let loaded = if state.needs_reload_vm {
        let CheatState { vm, entries, .. } = &mut *state;
        let ok = vm.load_program(entries);
        if ok {
            state.needs_reload_vm = false;
        }
        ok
    } else {
        true
    };

    if loaded && state.vm.program_size() != 0 {
        let attachment = state.attachment.as_ref().unwrap();
        let metadata = attachment.metadata.clone();
        let handle = attachment.handle.clone();
        let keys_down = shared.buttons.keys_down();

        let mut vm = std::mem::take(&mut state.vm);
        vm.execute(&metadata, &mut HandleMemory { handle: handle.as_ref() }, keys_down);
        state.vm = vm;
    }

    if let Some(attachment) = state.attachment.as_ref() {
        for (&address, value) in &state.frozen {
            let bytes = value.value.to_le_bytes();
            let _ = attachment.handle.write_memory(address, &bytes[..value.width as usize]);
        }
    }
}

fn vm_ticker_body(shared: &Arc<Shared>) {
    while !shared.cancel.wait_timeout(TICK_INTERVAL) {
        tick(shared);
    }
}

/// Keeps the debuggee running by continuing every debug event it raises.
fn debug_events_body(shared: &Arc<Shared>) {
    while !shared.cancel.try_wait() {
        let handle = {
            let state = shared.lock.lock();
            state.attachment.as_ref().map(|a| a.handle.clone())
        };
        match handle {
            None => std::thread::sleep(Duration::from_millis(50)),
            Some(handle) => {
                if handle.wait_debug_event(Duration::from_millis(100)) {
                    let mut state = shared.lock.lock();
                    if has_active(&mut state, shared) {
                        let _ = handle.continue_debug_events();
                    }
                }
            }
        }
    }
}
