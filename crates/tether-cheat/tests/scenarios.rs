//! End-to-end cheat engine scenarios against the in-memory system double.

use std::{sync::Arc, time::Duration};

use tether_cheat::{
    CheatError, CheatManager, CheatManagerOptions, MOCK_HEAP_BASE, MOCK_MAIN_BASE, MockSystem,
};

const BUILD_ID: [u8; 0x20] = [1; 0x20];
const TITLE_ID: u64 = 0x0100_0000_0000_CAFE;

struct Fixture {
    system: Arc<MockSystem>,
    manager: Arc<CheatManager>,
    _root: tempfile::TempDir,
}

fn fixture(cheat_text: &str, enable_by_default: bool, always_save: bool) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let cheats_dir =
        root.path().join(format!("contents/{TITLE_ID:016x}/cheats"));
    std::fs::create_dir_all(&cheats_dir).unwrap();
    std::fs::write(cheats_dir.join("0101010101010101.txt"), cheat_text).unwrap();

    let system = Arc::new(MockSystem::new());
    let options = CheatManagerOptions {
        enable_cheats_by_default: enable_by_default,
        always_save_cheat_toggles: always_save,
        content_root: root.path().to_owned(),
    };
    let manager = CheatManager::new(
        Arc::new(system.clone()),
        Arc::new(system.clone()),
        Arc::new(system.clone()),
        options,
    );
    Fixture { system, manager, _root: root }
}

fn wait_attached(manager: &CheatManager) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !manager.has_active_process() {
        assert!(std::time::Instant::now() < deadline, "never attached");
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn wait_ticks(n: u32) {
    std::thread::sleep(Duration::from_millis(90 * n as u64));
}

#[test]
fn store_static_program_runs_each_tick() {
    // Master cheat: r0 = 0x12345678, then write the 8-byte value 0xAA at
    // main+0x100. The store offsets through r1 (still zero) so the loaded
    // r0 does not displace the target address.
    let text = "{Write AA}\n\
                40000000 00000000 12345678\n\
                08010000 00000100 00000000 000000AA\n";
    let fx = fixture(text, true, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);
    wait_ticks(2);

    let written = fx.system.peek(MOCK_MAIN_BASE + 0x100, 8);
    assert_eq!(written, vec![0xAA, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn frozen_address_survives_cheat_write() {
    // A (disabled by default) cheat that zeroes heap+0x1000 every tick.
    let text = "[Zero]\n04100000 00001000 00000000\n";
    let fx = fixture(text, false, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);

    fx.system.poke(MOCK_HEAP_BASE + 0x1000, &0xDEAD_BEEFu32.to_le_bytes());
    let captured =
        fx.manager.enable_frozen_address(MOCK_HEAP_BASE + 0x1000, 4).unwrap();
    assert_eq!(captured, 0xDEAD_BEEF);

    // Turn the zeroing cheat on and let it race the freezer.
    let cheats = fx.manager.get_cheats(0, 16).unwrap();
    let zero = cheats.iter().find(|c| c.definition.readable_name == "Zero").unwrap();
    fx.manager.toggle_cheat(zero.cheat_id).unwrap();
    wait_ticks(3);

    // Replay runs after the VM each tick, so the frozen value wins.
    let mut bytes = [0u8; 4];
    fx.manager.read_process_memory(MOCK_HEAP_BASE + 0x1000, &mut bytes).unwrap();
    assert_eq!(u32::from_le_bytes(bytes), 0xDEAD_BEEF);

    let entry = fx.manager.get_frozen_address(MOCK_HEAP_BASE + 0x1000).unwrap();
    assert_eq!(entry.value.value, 0xDEAD_BEEF);
    assert_eq!(entry.value.width, 4);
}

#[test]
fn external_write_updates_frozen_value() {
    let text = "{M}\n20000000\n";
    let fx = fixture(text, true, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);

    fx.system.poke(MOCK_HEAP_BASE + 0x40, &[1, 2, 3, 4]);
    fx.manager.enable_frozen_address(MOCK_HEAP_BASE + 0x40, 4).unwrap();

    // A tool-initiated write re-targets the freeze.
    fx.manager
        .write_process_memory(MOCK_HEAP_BASE + 0x40, &0x0BAD_F00Du32.to_le_bytes())
        .unwrap();
    let entry = fx.manager.get_frozen_address(MOCK_HEAP_BASE + 0x40).unwrap();
    assert_eq!(entry.value.value, 0x0BAD_F00D);

    wait_ticks(2);
    let mut bytes = [0u8; 4];
    fx.manager.read_process_memory(MOCK_HEAP_BASE + 0x40, &mut bytes).unwrap();
    assert_eq!(u32::from_le_bytes(bytes), 0x0BAD_F00D);
}

#[test]
fn detach_is_idempotent_and_persists_toggles_once() {
    let text = "[Extra]\n20000000\n";
    let fx = fixture(text, true, true);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);

    let toggles_path = fx
        ._root
        .path()
        .join(format!("contents/{TITLE_ID:016x}/cheats/toggles.txt"));
    assert!(!toggles_path.exists());

    fx.manager.detach();
    assert!(!fx.manager.has_active_process());
    assert!(toggles_path.exists(), "first detach persists toggles");
    assert!(std::fs::read_to_string(&toggles_path).unwrap().contains("[Extra]"));

    std::fs::remove_file(&toggles_path).unwrap();
    fx.manager.detach();
    assert!(!toggles_path.exists(), "second detach must not touch storage");
}

#[test]
fn dead_process_detaches_transparently() {
    let text = "{M}\n20000000\n";
    let fx = fixture(text, true, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);

    fx.system.terminate();
    assert!(!fx.manager.has_active_process());
    assert_eq!(fx.manager.get_cheat_count(), Err(CheatError::NotAttached));
    // Again, for idempotence.
    assert!(!fx.manager.has_active_process());
}

#[test]
fn operations_require_attachment() {
    let fx = fixture("{M}\n20000000\n", true, false);
    assert_eq!(fx.manager.get_cheat_count(), Err(CheatError::NotAttached));
    assert_eq!(fx.manager.enable_frozen_address(0x1000, 4), Err(CheatError::NotAttached));
    let mut buf = [0u8; 1];
    assert_eq!(
        fx.manager.read_process_memory(MOCK_HEAP_BASE, &mut buf),
        Err(CheatError::NotAttached)
    );
}

#[test]
fn malformed_cheat_file_prevents_attachment() {
    let fx = fixture("[Broken]\nnothex!!\n", true, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    std::thread::sleep(Duration::from_millis(300));
    assert!(!fx.manager.has_active_process());
}

#[test]
fn toggles_file_applies_on_attach() {
    let fx = fixture("[A]\n20000000\n[B]\n20000000\n", true, false);
    let cheats_dir = fx._root.path().join(format!("contents/{TITLE_ID:016x}/cheats"));
    std::fs::write(cheats_dir.join("toggles.txt"), "[B]\nfalse\n").unwrap();

    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);

    let cheats = fx.manager.get_cheats(0, 16).unwrap();
    let a = cheats.iter().find(|c| c.definition.readable_name == "A").unwrap();
    let b = cheats.iter().find(|c| c.definition.readable_name == "B").unwrap();
    assert!(a.enabled);
    assert!(!b.enabled);
}

#[test]
fn frozen_width_is_validated() {
    let fx = fixture("{M}\n20000000\n", true, false);
    fx.system.launch(TITLE_ID, BUILD_ID);
    wait_attached(&fx.manager);
    assert_eq!(
        fx.manager.enable_frozen_address(MOCK_HEAP_BASE, 3),
        Err(CheatError::InvalidWidth)
    );
}
