use std::collections::HashMap;

use crate::architecture::mips::ejtag::{DMSEG_END, DMSEG_START, PRACC_TEXT};

/// Instructions executed from RAM before the core is considered hung.
const RUN_LIMIT: usize = 100_000;

/// A processor access the core is stalled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAccess {
    Fetch { address: u32 },
    Load { address: u32, reg: u8, width: u8 },
    Store { address: u32, value: u32 },
}

impl MockAccess {
    pub fn address(&self) -> u32 {
        match *self {
            MockAccess::Fetch { address }
            | MockAccess::Load { address, .. }
            | MockAccess::Store { address, .. } => address,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, MockAccess::Store { .. })
    }
}

/// A cache maintenance instruction executed by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOperation {
    Synci { address: u32 },
    Cache { op: u8, address: u32 },
}

/// A MIPS32 core in debug mode, executing what the probe feeds it.
///
/// Every fetch, and every load and store to the debug segment stalls the
/// core. A store to the debug segment is only presented after the following
/// instruction has been fetched, like on a pipelined core.
#[derive(Debug)]
pub struct MockMipsCore {
    gpr: [u32; 32],
    hi: u32,
    lo: u32,
    cp0: HashMap<(u8, u8), u32>,
    /// Sparse RAM, indexed by physical address.
    memory: HashMap<u32, u8>,
    synci_step: u32,

    /// Address of the next instruction.
    pc: u32,
    /// Branch target, taken after the delay slot.
    branch_target: Option<u32>,
    pending: Option<MockAccess>,
    /// A store to the debug segment, presented after the next fetch.
    deferred_store: Option<MockAccess>,
    /// The instruction fetched while a store was deferred.
    held_instruction: Option<u32>,

    cache_operations: Vec<CacheOperation>,
    completed_accesses: usize,

    /// The address reported for fetches from a given address.
    fetch_address_faults: HashMap<u32, u32>,
    /// Go back to the text start after this many more completed accesses.
    restart_after: Option<usize>,
}

impl Default for MockMipsCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMipsCore {
    pub fn new() -> Self {
        let mut cp0 = HashMap::new();
        // Release 2, kseg0 cacheable write-back
        cp0.insert((16, 0), 1 << 31 | 1 << 10 | 3);
        // 32 byte data cache lines
        cp0.insert((16, 1), 4 << 10);
        // Debug: in debug mode
        cp0.insert((23, 0), 1 << 30);
        cp0.insert((24, 0), 0x8000_0400);

        Self {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            cp0,
            memory: HashMap::new(),
            synci_step: 32,
            pc: PRACC_TEXT,
            branch_target: None,
            pending: Some(MockAccess::Fetch {
                address: PRACC_TEXT,
            }),
            deferred_store: None,
            held_instruction: None,
            cache_operations: Vec::new(),
            completed_accesses: 0,
            fetch_address_faults: HashMap::new(),
            restart_after: None,
        }
    }

    pub fn gpr(&self, reg: u8) -> u32 {
        self.gpr[reg as usize]
    }

    pub fn set_gpr(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.gpr[reg as usize] = value;
        }
    }

    pub fn hi(&self) -> u32 {
        self.hi
    }

    pub fn lo(&self) -> u32 {
        self.lo
    }

    pub fn set_hi(&mut self, value: u32) {
        self.hi = value;
    }

    pub fn set_lo(&mut self, value: u32) {
        self.lo = value;
    }

    pub fn cp0(&self, reg: u8, sel: u8) -> u32 {
        self.cp0.get(&(reg, sel)).copied().unwrap_or_default()
    }

    pub fn set_cp0(&mut self, reg: u8, sel: u8, value: u32) {
        self.cp0.insert((reg, sel), value);
    }

    pub fn set_synci_step(&mut self, step: u32) {
        self.synci_step = step;
    }

    pub fn read_memory(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.read_byte(address.wrapping_add(i)))
            .collect()
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.write_byte(address.wrapping_add(i as u32), *byte);
        }
    }

    pub fn cache_operations(&self) -> &[CacheOperation] {
        &self.cache_operations
    }

    pub fn clear_cache_operations(&mut self) {
        self.cache_operations.clear();
    }

    pub fn completed_accesses(&self) -> usize {
        self.completed_accesses
    }

    /// The access the core is stalled on, if any.
    pub fn pending(&self) -> Option<MockAccess> {
        self.pending
    }

    pub fn pending_address(&self) -> Option<u32> {
        self.pending.map(|access| access.address())
    }

    /// The address as seen in the ADDRESS register.
    pub fn reported_address(&self) -> u32 {
        match self.pending {
            Some(MockAccess::Fetch { address }) => self
                .fetch_address_faults
                .get(&address)
                .copied()
                .unwrap_or(address),
            Some(access) => access.address(),
            None => 0,
        }
    }

    /// Reports `reported` instead of `actual` for every fetch from `actual`.
    pub fn corrupt_fetch_address(&mut self, actual: u32, reported: u32) {
        self.fetch_address_faults.insert(actual, reported);
    }

    /// Makes the core jump back to the text start, as if the debug exception
    /// was taken again, once `accesses` more accesses have completed.
    pub fn restart_after(&mut self, accesses: usize) {
        self.restart_after = Some(accesses);
    }

    /// Completes the pending access. `data` is the instruction or the loaded
    /// value; it is ignored for stores.
    pub fn complete(&mut self, data: u32) {
        let Some(access) = self.pending.take() else {
            return;
        };

        self.completed_accesses += 1;

        match access {
            MockAccess::Fetch { .. } => {
                if let Some(store) = self.deferred_store.take() {
                    self.held_instruction = Some(data);
                    self.pending = Some(store);
                } else {
                    self.execute(data);
                }
            }
            MockAccess::Store { .. } => {
                if let Some(instruction) = self.held_instruction.take() {
                    self.execute(instruction);
                }
            }
            MockAccess::Load { reg, width, .. } => {
                let mask = match width {
                    1 => 0xFF,
                    2 => 0xFFFF,
                    _ => !0,
                };
                self.set_gpr(reg, data & mask);
            }
        }

        if let Some(remaining) = self.restart_after {
            if remaining <= 1 {
                self.restart_after = None;
                self.restart();
                return;
            }
            self.restart_after = Some(remaining - 1);
        }

        self.run();
    }

    fn restart(&mut self) {
        self.pc = PRACC_TEXT;
        self.branch_target = None;
        self.deferred_store = None;
        self.held_instruction = None;
        self.pending = Some(MockAccess::Fetch {
            address: PRACC_TEXT,
        });
    }

    /// Runs until the next processor access.
    fn run(&mut self) {
        for _ in 0..RUN_LIMIT {
            if self.pending.is_some() {
                return;
            }

            if is_dmseg(self.pc) {
                self.pending = Some(MockAccess::Fetch { address: self.pc });
                return;
            }

            let instruction = self.read_word(self.pc);
            if let Some(store) = self.deferred_store.take() {
                self.held_instruction = Some(instruction);
                self.pending = Some(store);
                return;
            }

            self.execute(instruction);
        }

        tracing::warn!("Mock core stopped after {} instructions", RUN_LIMIT);
    }

    fn execute(&mut self, instruction: u32) {
        let pc = self.pc;
        let in_delay_slot = self.branch_target.take();

        let opcode = instruction >> 26;
        let rs = (instruction >> 21 & 0x1F) as u8;
        let rt = (instruction >> 16 & 0x1F) as u8;
        let rd = (instruction >> 11 & 0x1F) as u8;
        let shamt = instruction >> 6 & 0x1F;
        let immediate = instruction as u16;
        let offset = immediate as i16 as i32 as u32;
        let branch = pc.wrapping_add(4).wrapping_add(offset << 2);

        let rs_value = self.gpr(rs);
        let rt_value = self.gpr(rt);

        match opcode {
            0x00 => match instruction & 0x3F {
                0x00 => self.set_gpr(rd, rt_value << shamt),
                0x08 => self.branch_target = Some(rs_value),
                0x0F => {}
                0x10 => self.set_gpr(rd, self.hi),
                0x11 => self.hi = rs_value,
                0x12 => self.set_gpr(rd, self.lo),
                0x13 => self.lo = rs_value,
                _ => {}
            },
            0x01 if rt == 0x1F => {
                let address = rs_value.wrapping_add(offset);
                self.cache_operations.push(CacheOperation::Synci { address });
            }
            0x02 => {
                let target = (pc.wrapping_add(4) & 0xF000_0000) | (instruction & 0x03FF_FFFF) << 2;
                self.branch_target = Some(target);
            }
            0x04 if rs_value == rt_value => self.branch_target = Some(branch),
            0x05 if rs_value != rt_value => self.branch_target = Some(branch),
            0x08 => self.set_gpr(rt, rs_value.wrapping_add(offset)),
            0x0D => self.set_gpr(rt, rs_value | u32::from(immediate)),
            0x0F => self.set_gpr(rt, u32::from(immediate) << 16),
            0x10 => {
                let sel = (instruction & 0x7) as u8;
                match rs {
                    0x00 => self.set_gpr(rt, self.cp0(rd, sel)),
                    0x04 => self.set_cp0(rd, sel, rt_value),
                    _ => {}
                }
            }
            0x1F if instruction & 0x3F == 0x3B => {
                if rd == 1 {
                    self.set_gpr(rt, self.synci_step);
                }
            }
            0x20..=0x25 => {
                let address = rs_value.wrapping_add(offset);
                let width = match opcode {
                    0x20 | 0x24 => 1,
                    0x21 | 0x25 => 2,
                    _ => 4,
                };

                if is_dmseg(address) {
                    self.pending = Some(MockAccess::Load {
                        address,
                        reg: rt,
                        width,
                    });
                } else {
                    let value = match width {
                        1 => u32::from(self.read_byte(address)),
                        2 => u32::from(u16::from_le_bytes([
                            self.read_byte(address),
                            self.read_byte(address.wrapping_add(1)),
                        ])),
                        _ => self.read_word(address),
                    };
                    self.set_gpr(rt, value);
                }
            }
            0x28 | 0x29 | 0x2B => {
                let address = rs_value.wrapping_add(offset);

                if is_dmseg(address) {
                    self.deferred_store = Some(MockAccess::Store {
                        address,
                        value: rt_value,
                    });
                } else {
                    let len = match opcode {
                        0x28 => 1,
                        0x29 => 2,
                        _ => 4,
                    };
                    self.write_memory(address, &rt_value.to_le_bytes()[..len]);
                }
            }
            0x2F => {
                let address = rs_value.wrapping_add(offset);
                self.cache_operations.push(CacheOperation::Cache { op: rt, address });
            }
            _ => {}
        }

        self.pc = in_delay_slot.unwrap_or(pc.wrapping_add(4));
    }

    fn read_word(&self, address: u32) -> u32 {
        let bytes = self.read_memory(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn read_byte(&self, address: u32) -> u8 {
        self.memory
            .get(&physical(address))
            .copied()
            .unwrap_or_default()
    }

    fn write_byte(&mut self, address: u32, value: u8) {
        self.memory.insert(physical(address), value);
    }
}

fn is_dmseg(address: u32) -> bool {
    (DMSEG_START..DMSEG_END).contains(&address)
}

/// kseg0 and kseg1 alias the same physical memory.
fn physical(address: u32) -> u32 {
    match address {
        0x8000_0000..=0xBFFF_FFFF => address & 0x1FFF_FFFF,
        _ => address,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::mips::assembly::{b, lui, mfc0, mtc0, ori, sw, NOP};
    use crate::architecture::mips::ejtag::PRACC_PARAM_OUT;
    use pretty_assertions::assert_eq;

    fn fetch(address: u32) -> Option<MockAccess> {
        Some(MockAccess::Fetch { address })
    }

    #[test]
    fn store_is_presented_after_next_fetch() {
        let mut core = MockMipsCore::new();
        core.set_gpr(8, 0xCAFE_F00D);

        core.complete(lui(15, 0xFF20));
        core.complete(sw(8, 0x2000, 15));
        assert_eq!(core.pending(), fetch(PRACC_TEXT + 8));

        core.complete(NOP);
        assert_eq!(
            core.pending(),
            Some(MockAccess::Store {
                address: PRACC_PARAM_OUT,
                value: 0xCAFE_F00D
            })
        );

        core.complete(0);
        assert_eq!(core.pending(), fetch(PRACC_TEXT + 12));
    }

    #[test]
    fn branch_back_to_text_after_delay_slot() {
        let mut core = MockMipsCore::new();
        core.set_gpr(15, 0x1234);

        core.complete(mtc0(15, 31, 0));
        core.complete(ori(15, 0, 0x5678));
        core.complete(b(-3));
        core.complete(mfc0(15, 31, 0));

        assert_eq!(core.pending(), fetch(PRACC_TEXT));
        assert_eq!(core.gpr(15), 0x1234);
    }

    #[test]
    fn kseg0_and_kseg1_alias() {
        let mut core = MockMipsCore::new();
        core.write_memory(0xA000_0010, &[1, 2, 3, 4]);

        assert_eq!(core.read_memory(0x8000_0010, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn restart_returns_to_text() {
        let mut core = MockMipsCore::new();
        core.restart_after(2);

        core.complete(NOP);
        assert_eq!(core.pending(), fetch(PRACC_TEXT + 4));
        core.complete(NOP);
        assert_eq!(core.pending(), fetch(PRACC_TEXT));
    }
}
