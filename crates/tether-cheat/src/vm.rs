//! Bytecode interpreter mutating an attached process once per tick.

use tracing::warn;

use crate::{
    error::CheatError,
    opcode::{
        ArithOperand, Arithmetic, CheatOpcode, MemoryRegion, OpcodeDecoder, RegCondOperand,
        StoreRegOffset,
    },
    parse::CheatEntry,
};

pub const MAX_PROGRAM_SIZE: usize = 0x400;
pub const NUM_REGISTERS: usize = 0x10;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryExtents {
    pub base: u64,
    pub size: u64,
}

/// Everything the VM needs to know about the attached process.
#[derive(Clone, Debug, Default)]
pub struct CheatProcessMetadata {
    pub process_id: u64,
    pub title_id: u64,
    pub main_nso_extents: MemoryExtents,
    pub heap_extents: MemoryExtents,
    pub alias_extents: MemoryExtents,
    pub address_space_extents: MemoryExtents,
    pub main_nso_build_id: [u8; 0x20],
}

/// Process memory access used by the interpreter. Every read and write must
/// verify the attachment is still live.
pub trait CheatMemory {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), CheatError>;
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), CheatError>;
}

fn truncate(value: u64, width: u32) -> u64 {
    match width {
        1 => value as u8 as u64,
        2 => value as u16 as u64,
        4 => value as u32 as u64,
        _ => value,
    }
}

fn valid_width(width: u32) -> bool {
    matches!(width, 1 | 2 | 4 | 8)
}

fn read_value(memory: &mut dyn CheatMemory, address: u64, width: u32) -> u64 {
    let mut buf = [0u8; 8];
    let n = width as usize;
    if memory.read(address, &mut buf[..n]).is_err() {
        return 0;
    }
    u64::from_le_bytes(buf)
}

fn write_value(memory: &mut dyn CheatMemory, address: u64, width: u32, value: u64) {
    let bytes = value.to_le_bytes();
    let _ = memory.write(address, &bytes[..width as usize]);
}

#[derive(Default)]
pub struct CheatVm {
    program: Vec<u32>,
    registers: [u64; NUM_REGISTERS],
    saved_values: [u64; NUM_REGISTERS],
    loop_tops: [usize; NUM_REGISTERS],
    condition_depth: usize,
}

impl CheatVm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn program_size(&self) -> usize {
        self.program.len()
    }

    pub fn registers(&self) -> &[u64; NUM_REGISTERS] {
        &self.registers
    }

    /// Concatenates the opcodes of every enabled cheat. On overflow the
    /// program is cleared and loading reports failure.
    pub fn load_program(&mut self, cheats: &[CheatEntry]) -> bool {
        self.program.clear();
        for cheat in cheats.iter().filter(|c| c.enabled) {
            if self.program.len() + cheat.definition.opcodes.len() > MAX_PROGRAM_SIZE {
                self.program.clear();
                return false;
            }
            self.program.extend_from_slice(&cheat.definition.opcodes);
        }
        true
    }

    fn reset_state(&mut self) {
        self.registers = [0; NUM_REGISTERS];
        self.saved_values = [0; NUM_REGISTERS];
        self.loop_tops = [0; NUM_REGISTERS];
        self.condition_depth = 0;
    }

    fn region_address(metadata: &CheatProcessMetadata, region: MemoryRegion, rel: u64) -> u64 {
        match region {
            MemoryRegion::MainNso => metadata.main_nso_extents.base.wrapping_add(rel),
            MemoryRegion::Heap => metadata.heap_extents.base.wrapping_add(rel),
        }
    }

    /// Advances the decoder past the current conditional block, counting
    /// nested begin/end pairs so nesting composes.
    fn skip_conditional_block(&mut self, decoder: &mut OpcodeDecoder<'_>) {
        debug_assert!(self.condition_depth > 0);
        let desired_depth = self.condition_depth.saturating_sub(1);
        while self.condition_depth > desired_depth {
            match decoder.decode_next() {
                Some(Ok(op)) => {
                    if op.begins_conditional() {
                        self.condition_depth += 1;
                    } else if op == CheatOpcode::EndCond {
                        self.condition_depth -= 1;
                    }
                }
                Some(Err(())) | None => {
                    // Unterminated block: the program simply ends here.
                    self.condition_depth = desired_depth;
                    decoder.seek_to_end();
                }
            }
        }
    }

    /// Runs the loaded program once against the attached process.
    pub fn execute(
        &mut self,
        metadata: &CheatProcessMetadata,
        memory: &mut dyn CheatMemory,
        keys_down: u64,
    ) {
        self.reset_state();
        let program = std::mem::take(&mut self.program);
        let mut decoder = OpcodeDecoder::new(&program);

        loop {
            let opcode = match decoder.decode_next() {
                Some(Ok(op)) => op,
                Some(Err(())) => {
                    warn!("undecodable cheat instruction; stopping tick");
                    break;
                }
                None => break,
            };

            if opcode.begins_conditional() {
                self.condition_depth += 1;
            }

            match opcode {
                CheatOpcode::StoreStatic { width, region, offset_reg, rel_address, value } => {
                    if valid_width(width) {
                        let address = Self::region_address(
                            metadata,
                            region,
                            rel_address.wrapping_add(self.registers[offset_reg]),
                        );
                        write_value(memory, address, width, value);
                    }
                }
                CheatOpcode::BeginCond { width, region, comparison, rel_address, value } => {
                    let address = Self::region_address(metadata, region, rel_address);
                    let current = if valid_width(width) {
                        read_value(memory, address, width)
                    } else {
                        0
                    };
                    if !comparison.evaluate(current, truncate(value, width)) {
                        self.skip_conditional_block(&mut decoder);
                    }
                }
                CheatOpcode::EndCond => {
                    // Mismatched block ends are graciously treated as no-ops.
                    self.condition_depth = self.condition_depth.saturating_sub(1);
                }
                CheatOpcode::Loop { start, reg, count } => {
                    if start {
                        self.registers[reg] = count as u64;
                        self.loop_tops[reg] = decoder.position();
                    } else {
                        self.registers[reg] = self.registers[reg].wrapping_sub(1);
                        if self.registers[reg] != 0 {
                            decoder.set_position(self.loop_tops[reg]);
                        }
                    }
                }
                CheatOpcode::LoadRegImm { reg, value } => {
                    self.registers[reg] = value;
                }
                CheatOpcode::LoadRegMem { width, region, reg, load_from_reg, rel_address } => {
                    let address = if load_from_reg {
                        self.registers[reg].wrapping_add(rel_address)
                    } else {
                        Self::region_address(metadata, region, rel_address)
                    };
                    if valid_width(width) {
                        self.registers[reg] = read_value(memory, address, width);
                    }
                }
                CheatOpcode::StoreImmToAddr {
                    width,
                    reg,
                    increment,
                    add_offset_reg,
                    offset_reg,
                    value,
                } => {
                    let mut address = self.registers[reg];
                    if add_offset_reg {
                        address = address.wrapping_add(self.registers[offset_reg]);
                    }
                    if valid_width(width) {
                        write_value(memory, address, width, value);
                    }
                    if increment {
                        self.registers[reg] = self.registers[reg].wrapping_add(width as u64);
                    }
                }
                CheatOpcode::ArithImm { width, reg, op, value } => {
                    let lhs = self.registers[reg];
                    let result = match op {
                        Arithmetic::Add => lhs.wrapping_add(value as u64),
                        Arithmetic::Sub => lhs.wrapping_sub(value as u64),
                        Arithmetic::Mul => lhs.wrapping_mul(value as u64),
                        Arithmetic::LeftShift => lhs.wrapping_shl(value),
                        Arithmetic::RightShift => lhs.wrapping_shr(value),
                        // Extensions are handled by the register form only.
                        _ => lhs,
                    };
                    self.registers[reg] = truncate(result, width);
                }
                CheatOpcode::BeginKeyCond { key_mask } => {
                    if (key_mask as u64 & keys_down) != key_mask as u64 {
                        self.skip_conditional_block(&mut decoder);
                    }
                }
                CheatOpcode::ArithReg { width, op, dst, src, operand } => {
                    let lhs = self.registers[src];
                    let rhs = match operand {
                        ArithOperand::Immediate(value) => value,
                        ArithOperand::Register(index) => self.registers[index],
                    };
                    let result = match op {
                        Arithmetic::Add => lhs.wrapping_add(rhs),
                        Arithmetic::Sub => lhs.wrapping_sub(rhs),
                        Arithmetic::Mul => lhs.wrapping_mul(rhs),
                        Arithmetic::LeftShift => lhs.wrapping_shl(rhs as u32),
                        Arithmetic::RightShift => lhs.wrapping_shr(rhs as u32),
                        Arithmetic::And => lhs & rhs,
                        Arithmetic::Or => lhs | rhs,
                        Arithmetic::Not => !lhs,
                        Arithmetic::Xor => lhs ^ rhs,
                        Arithmetic::None => lhs,
                    };
                    self.registers[dst] = truncate(result, width);
                }
                CheatOpcode::StoreRegToAddr { width, src_reg, addr_reg, increment, offset } => {
                    let value = self.registers[src_reg];
                    let address = match offset {
                        StoreRegOffset::None => self.registers[addr_reg],
                        StoreRegOffset::Reg(ofs_reg) => {
                            self.registers[addr_reg].wrapping_add(self.registers[ofs_reg])
                        }
                        StoreRegOffset::Imm(rel) => self.registers[addr_reg].wrapping_add(rel),
                        StoreRegOffset::MemReg(region) => {
                            Self::region_address(metadata, region, self.registers[addr_reg])
                        }
                        StoreRegOffset::MemImm(region, rel) => {
                            Self::region_address(metadata, region, rel)
                        }
                        StoreRegOffset::MemImmReg(region, rel) => Self::region_address(
                            metadata,
                            region,
                            self.registers[addr_reg].wrapping_add(rel),
                        ),
                    };
                    if valid_width(width) {
                        write_value(memory, address, width, value);
                    }
                    if increment {
                        self.registers[addr_reg] =
                            self.registers[addr_reg].wrapping_add(width as u64);
                    }
                }
                CheatOpcode::BeginRegCond { width, comparison, val_reg, operand } => {
                    let lhs = truncate(self.registers[val_reg], width);
                    let rhs = match operand {
                        RegCondOperand::StaticValue(value) => truncate(value, width),
                        RegCondOperand::OtherRegister(index) => {
                            truncate(self.registers[index], width)
                        }
                        RegCondOperand::MemoryRelAddr { region, rel_address } => {
                            let address = Self::region_address(metadata, region, rel_address);
                            if valid_width(width) { read_value(memory, address, width) } else { 0 }
                        }
                        RegCondOperand::MemoryOfsReg { region, ofs_reg } => {
                            let address = Self::region_address(
                                metadata,
                                region,
                                self.registers[ofs_reg],
                            );
                            if valid_width(width) { read_value(memory, address, width) } else { 0 }
                        }
                        RegCondOperand::RegisterRelAddr { addr_reg, rel_address } => {
                            let address = self.registers[addr_reg].wrapping_add(rel_address);
                            if valid_width(width) { read_value(memory, address, width) } else { 0 }
                        }
                        RegCondOperand::RegisterOfsReg { addr_reg, ofs_reg } => {
                            let address =
                                self.registers[addr_reg].wrapping_add(self.registers[ofs_reg]);
                            if valid_width(width) { read_value(memory, address, width) } else { 0 }
                        }
                    };
                    if !comparison.evaluate(lhs, rhs) {
                        self.skip_conditional_block(&mut decoder);
                    }
                }
                CheatOpcode::SaveRestoreReg { dst, src, save } => {
                    if save {
                        self.saved_values[dst] = self.registers[src];
                    } else {
                        self.registers[dst] = self.saved_values[src];
                    }
                }
                CheatOpcode::SaveRestoreMask { save, mask } => {
                    for i in 0..NUM_REGISTERS {
                        if mask & (1 << i) != 0 {
                            if save {
                                self.saved_values[i] = self.registers[i];
                            } else {
                                self.registers[i] = self.saved_values[i];
                            }
                        }
                    }
                }
            }
        }

        self.program = program;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parse::CheatDefinition;

    const MAIN_BASE: u64 = 0x8000_0000;
    const HEAP_BASE: u64 = 0x4000_0000;

    struct FlatMemory {
        main: Vec<u8>,
        heap: Vec<u8>,
    }

    impl FlatMemory {
        fn new() -> Self {
            Self { main: vec![0; 0x100000], heap: vec![0; 0x100000] }
        }

        fn slice(&mut self, address: u64, len: usize) -> Option<&mut [u8]> {
            if address >= MAIN_BASE {
                let off = (address - MAIN_BASE) as usize;
                self.main.get_mut(off..off + len)
            } else {
                let off = (address - HEAP_BASE) as usize;
                self.heap.get_mut(off..off + len)
            }
        }
    }

    impl CheatMemory for FlatMemory {
        fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<(), CheatError> {
            let len = buf.len();
            let src = self.slice(address, len).ok_or(CheatError::ProcessAccess)?;
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, address: u64, data: &[u8]) -> Result<(), CheatError> {
            let dst = self.slice(address, data.len()).ok_or(CheatError::ProcessAccess)?;
            dst.copy_from_slice(data);
            Ok(())
        }
    }

    fn metadata() -> CheatProcessMetadata {
        CheatProcessMetadata {
            main_nso_extents: MemoryExtents { base: MAIN_BASE, size: 0x100000 },
            heap_extents: MemoryExtents { base: HEAP_BASE, size: 0x100000 },
            ..Default::default()
        }
    }

    fn run(program: &[u32], memory: &mut FlatMemory, keys: u64) -> CheatVm {
        let mut vm = CheatVm::new();
        let entry = CheatEntry {
            enabled: true,
            cheat_id: 0,
            definition: CheatDefinition {
                readable_name: "test".into(),
                opcodes: program.iter().copied().collect(),
            },
        };
        assert!(vm.load_program(std::slice::from_ref(&entry)));
        vm.execute(&metadata(), memory, keys);
        vm
    }

    #[test]
    fn load_then_store() {
        let mut memory = FlatMemory::new();
        // r0 = 0x12345678, then store byte 0xAA at main+0x10. The store's
        // offset register is r1, which stays zero; r0 would push the
        // address out of the region.
        let vm = run(
            &[0x4000_0000, 0x0000_0000, 0x1234_5678, 0x0101_0000, 0x0000_0010, 0x0000_00AA],
            &mut memory,
            0,
        );
        assert_eq!(vm.registers()[0], 0x1234_5678);
        assert_eq!(memory.main[0x10], 0xAA);
    }

    #[test]
    fn conditional_skips_and_nests() {
        let mut memory = FlatMemory::new();
        memory.heap[0] = 5;
        // if heap[0] == 5 { if heap[0] == 9 { r1 = 1 } r2 = 2 } r3 = 3
        let program = [
            0x1150_0000, 0x0000_0000, 0x0000_0005, // begin: heap byte == 5 (true)
            0x1150_0000, 0x0000_0000, 0x0000_0009, // begin: heap byte == 9 (false)
            0x4001_0000, 0x0000_0000, 0x0000_0001, // r1 = 1 (skipped)
            0x2000_0000, // end inner
            0x4002_0000, 0x0000_0000, 0x0000_0002, // r2 = 2
            0x2000_0000, // end outer
            0x4003_0000, 0x0000_0000, 0x0000_0003, // r3 = 3
        ];
        let vm = run(&program, &mut memory, 0);
        assert_eq!(vm.registers()[1], 0);
        assert_eq!(vm.registers()[2], 2);
        assert_eq!(vm.registers()[3], 3);
    }

    #[test]
    fn stray_end_is_a_no_op() {
        let mut memory = FlatMemory::new();
        let vm = run(&[0x2000_0000, 0x4004_0000, 0x0000_0000, 0x0000_0007], &mut memory, 0);
        assert_eq!(vm.registers()[4], 7);
    }

    #[test]
    fn loop_writes_a_run_of_bytes() {
        let mut memory = FlatMemory::new();
        // r1 = heap base address; loop r0 4 times: store byte 0x7F at [r1], r1 += 1.
        let program = [
            0x4001_0000, 0x0000_0000, 0x4000_0000, // r1 = 0x40000000
            0x3000_0000, 0x0000_0004, // loop r0 = 4
            0x6101_1000, 0x0000_0000, 0x0000_007F, // store byte at [r1], r1 += 1
            0x3100_0000, // end loop r0
        ];
        let vm = run(&program, &mut memory, 0);
        assert_eq!(&memory.heap[..5], &[0x7F, 0x7F, 0x7F, 0x7F, 0x00]);
        assert_eq!(vm.registers()[1], 0x4000_0004);
    }

    #[test]
    fn keypress_gates_block() {
        let mut memory = FlatMemory::new();
        let program = [
            0x8000_0003, // require keys 0b11
            0x4005_0000, 0x0000_0000, 0x0000_0001, // r5 = 1
            0x2000_0000,
        ];
        let vm = run(&program, &mut memory, 0b01);
        assert_eq!(vm.registers()[5], 0);
        let vm = run(&program, &mut memory, 0b111);
        assert_eq!(vm.registers()[5], 1);
    }

    #[test]
    fn arithmetic_truncates_to_width() {
        let mut memory = FlatMemory::new();
        // r0 = 0xFF, then 1-byte add 1 -> truncates to 0.
        let program = [
            0x4000_0000, 0x0000_0000, 0x0000_00FF, // r0 = 0xFF
            0x7100_0000, 0x0000_0001, // r0 = trunc8(r0 + 1)
        ];
        let vm = run(&program, &mut memory, 0);
        assert_eq!(vm.registers()[0], 0);
    }

    #[test]
    fn save_and_restore_registers() {
        let mut memory = FlatMemory::new();
        let program = [
            0x4000_0000, 0x0000_0000, 0x0000_0042, // r0 = 0x42
            0xC101_0010, // save[1] = r0
            0x4000_0000, 0x0000_0000, 0x0000_0000, // r0 = 0
            0xC102_0100, // r2 = save[1]
        ];
        let vm = run(&program, &mut memory, 0);
        assert_eq!(vm.registers()[2], 0x42);
    }

    #[test]
    fn execution_is_deterministic() {
        let program = [
            0x4000_0000, 0x0000_0000, 0x0000_0010, // r0 = 0x10
            0x9400_0100, 0x0000_0003, // r0 = trunc32(r0 + 3)
            0x0100_0000, 0x0000_0020, 0x0000_0055, // store byte at main+0x20
        ];
        let mut memory_a = FlatMemory::new();
        let vm_a = run(&program, &mut memory_a, 0);
        let mut memory_b = FlatMemory::new();
        let vm_b = run(&program, &mut memory_b, 0);

        assert_eq!(vm_a.registers(), vm_b.registers());
        assert_eq!(memory_a.main, memory_b.main);
        assert_eq!(memory_a.heap, memory_b.heap);
    }

    #[test]
    fn program_overflow_clears() {
        let mut vm = CheatVm::new();
        // Five maxed-out cheats exceed the 0x400-dword program budget.
        let cheats: Vec<CheatEntry> = (0..5)
            .map(|i| CheatEntry {
                enabled: true,
                cheat_id: i,
                definition: CheatDefinition {
                    readable_name: format!("chunk {i}"),
                    opcodes: std::iter::repeat(0x2000_0000)
                        .take(crate::parse::MAX_CHEAT_OPCODES)
                        .collect(),
                },
            })
            .collect();
        assert!(!vm.load_program(&cheats));
        assert_eq!(vm.program_size(), 0);
    }
}
