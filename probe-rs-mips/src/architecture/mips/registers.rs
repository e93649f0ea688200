//! MIPS32 register definitions.

use bitfield::bitfield;

/// `$1`, used while writing coprocessor registers.
pub const AT: u8 = 1;
pub const T0: u8 = 8;
pub const T1: u8 = 9;
pub const T2: u8 = 10;
pub const T7: u8 = 15;

/// A coprocessor 0 register, identified by number and select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cp0Register {
    pub reg: u8,
    pub sel: u8,
}

impl Cp0Register {
    pub const fn new(reg: u8, sel: u8) -> Self {
        Self { reg, sel }
    }
}

pub const CP0_BADVADDR: Cp0Register = Cp0Register::new(8, 0);
pub const CP0_STATUS: Cp0Register = Cp0Register::new(12, 0);
pub const CP0_CAUSE: Cp0Register = Cp0Register::new(13, 0);
pub const CP0_CONFIG: Cp0Register = Cp0Register::new(16, 0);
pub const CP0_CONFIG1: Cp0Register = Cp0Register::new(16, 1);
pub const CP0_DEBUG: Cp0Register = Cp0Register::new(23, 0);
pub const CP0_DEPC: Cp0Register = Cp0Register::new(24, 0);
pub const CP0_DESAVE: Cp0Register = Cp0Register::new(31, 0);

/// Hardware register holding the `synci` step size.
pub const HWR_SYNCI_STEP: u8 = 1;

/// Number of general purpose registers.
pub const GPR_COUNT: usize = 32;
pub const STATUS_INDEX: usize = 32;
pub const LO_INDEX: usize = 33;
pub const HI_INDEX: usize = 34;
pub const BADVADDR_INDEX: usize = 35;
pub const CAUSE_INDEX: usize = 36;
pub const PC_INDEX: usize = 37;

/// Number of words in a [`RegisterFile`].
pub const REGISTER_FILE_LEN: usize = 38;

/// The architectural state saved and restored around debug mode.
///
/// The layout is `$0`..`$31`, Status, LO, HI, BadVAddr, Cause and the
/// debug exception PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile(pub [u32; REGISTER_FILE_LEN]);

impl Default for RegisterFile {
    fn default() -> Self {
        Self([0; REGISTER_FILE_LEN])
    }
}

impl RegisterFile {
    pub fn gpr(&self, index: u8) -> u32 {
        self.0[index as usize]
    }

    pub fn set_gpr(&mut self, index: u8, value: u32) {
        // $0 is hardwired.
        if index != 0 {
            self.0[index as usize] = value;
        }
    }

    pub fn status(&self) -> u32 {
        self.0[STATUS_INDEX]
    }

    pub fn lo(&self) -> u32 {
        self.0[LO_INDEX]
    }

    pub fn hi(&self) -> u32 {
        self.0[HI_INDEX]
    }

    pub fn bad_vaddr(&self) -> u32 {
        self.0[BADVADDR_INDEX]
    }

    pub fn cause(&self) -> u32 {
        self.0[CAUSE_INDEX]
    }

    /// Debug exception PC, where execution resumes when leaving debug mode.
    pub fn pc(&self) -> u32 {
        self.0[PC_INDEX]
    }

    pub fn set_pc(&mut self, value: u32) {
        self.0[PC_INDEX] = value;
    }
}

bitfield! {
    /// CP0 Config register (16, 0).
    #[derive(Copy, Clone)]
    pub struct Config(u32);
    impl Debug;

    pub m, _: 31;
    /// Cacheability of kseg2/kseg3.
    pub k23, _: 30, 28;
    /// Cacheability of kuseg.
    pub ku, _: 27, 25;
    pub be, _: 15;
    pub architecture_type, _: 14, 13;
    pub architecture_release, _: 12, 10;
    pub mmu_type, _: 9, 7;
    /// Cacheability of kseg0.
    pub k0, _: 2, 0;
}

bitfield! {
    /// CP0 Config1 register (16, 1).
    #[derive(Copy, Clone)]
    pub struct Config1(u32);
    impl Debug;

    pub m, _: 31;
    pub mmu_size, _: 30, 25;
    pub is, _: 24, 22;
    pub il, _: 21, 19;
    pub ia, _: 18, 16;
    pub ds, _: 15, 13;
    /// Data cache line size, `2 << dl` bytes. Zero means no data cache.
    pub dl, _: 12, 10;
    pub da, _: 9, 7;
}

bitfield! {
    /// CP0 Debug register (23, 0).
    #[derive(Copy, Clone)]
    pub struct DebugRegister(u32);
    impl Debug;

    /// The debug exception happened in a branch delay slot.
    pub dbd, _: 31;
    pub dm, _: 30;
    pub exc_code, _: 14, 10;
    pub ddbsimpr, _: 19;
    pub ddblimpr, _: 18;
    pub dint, _: 5;
    pub dib, _: 4;
    pub ddbs, _: 3;
    pub ddbl, _: 2;
    pub dbp, _: 1;
    pub dss, _: 0;
}

/// Cache coherency attribute of a memory segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttribute {
    Uncached,
    WriteThrough,
    WriteBack,
}

impl CacheAttribute {
    pub fn from_config_field(value: u32) -> Self {
        match value {
            0 => CacheAttribute::WriteThrough,
            3 => CacheAttribute::WriteBack,
            _ => CacheAttribute::Uncached,
        }
    }
}

impl Config {
    /// The cache attribute governing `address`. kseg1 is always uncached.
    pub fn cache_attribute(&self, address: u32) -> CacheAttribute {
        let field = match address {
            0x0000_0000..=0x7FFF_FFFF => self.ku(),
            0x8000_0000..=0x9FFF_FFFF => self.k0(),
            0xA000_0000..=0xBFFF_FFFF => return CacheAttribute::Uncached,
            _ => self.k23(),
        };

        CacheAttribute::from_config_field(field)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(0x8000_0000, CacheAttribute::WriteBack; "kseg0")]
    #[test_case(0xA000_0000, CacheAttribute::Uncached; "kseg1")]
    #[test_case(0x0040_0000, CacheAttribute::WriteThrough; "kuseg")]
    #[test_case(0xC000_0000, CacheAttribute::Uncached; "kseg2")]
    fn segment_cacheability(address: u32, expected: CacheAttribute) {
        // K23 = 2 (uncached), KU = 0 (write through), K0 = 3 (write back)
        let config = Config(2 << 28 | 3);

        assert_eq!(config.cache_attribute(address), expected);
    }

    #[test]
    fn zero_register_is_hardwired() {
        let mut regs = RegisterFile::default();
        regs.set_gpr(0, 5);
        regs.set_gpr(4, 5);

        assert_eq!(regs.gpr(0), 0);
        assert_eq!(regs.gpr(4), 5);
    }

    #[test]
    fn config1_line_size() {
        let config1 = Config1(3 << 10);

        assert_eq!(2 << config1.dl(), 16);
    }
}
