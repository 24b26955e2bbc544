mod error;
mod manager;
mod opcode;
mod parse;
mod process;
mod vm;

pub use error::CheatError;
pub use manager::{
    CheatManager, CheatManagerOptions, FrozenAddressEntry, FrozenValue, MAX_FROZEN_ADDRESS_COUNT,
};
pub use opcode::{
    ArithOperand, Arithmetic, CheatOpcode, Comparison, MemoryRegion, OpcodeDecoder,
    RegCondOperand, StoreRegOffset,
};
pub use parse::{
    CheatDefinition, CheatEntry, MAX_CHEAT_COUNT, OpcodeList, parse_cheat_toggles, parse_cheats,
};
pub use process::{
    ApplicationInfo, ButtonReader, DebugHandle, LaunchEvents, MOCK_HEAP_BASE, MOCK_MAIN_BASE,
    MockSystem, NoButtons, ProcessDebugger, ProcessExtents,
};
pub use vm::{CheatMemory, CheatProcessMetadata, CheatVm, MemoryExtents};
