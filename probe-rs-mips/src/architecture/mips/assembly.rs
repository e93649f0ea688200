//! MIPS32 instruction encoders for the code executed in debug mode.
#![allow(clippy::unusual_byte_groupings)]

/// `sll $0, $0, 0`
pub const NOP: u32 = 0;

/// `sync`
pub const SYNC: u32 = 0b000000_00000_00000_00000_00000_001111;

const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;
const OP_J: u32 = 0x02;
const OP_BEQ: u32 = 0x04;
const OP_BNE: u32 = 0x05;
const OP_ADDI: u32 = 0x08;
const OP_ORI: u32 = 0x0D;
const OP_LUI: u32 = 0x0F;
const OP_COP0: u32 = 0x10;
const OP_SPECIAL3: u32 = 0x1F;
const OP_LW: u32 = 0x23;
const OP_LBU: u32 = 0x24;
const OP_LHU: u32 = 0x25;
const OP_SB: u32 = 0x28;
const OP_SH: u32 = 0x29;
const OP_SW: u32 = 0x2B;
const OP_CACHE: u32 = 0x2F;

const FUNCT_JR: u32 = 0x08;
const FUNCT_MFHI: u32 = 0x10;
const FUNCT_MTHI: u32 = 0x11;
const FUNCT_MFLO: u32 = 0x12;
const FUNCT_MTLO: u32 = 0x13;
const FUNCT_RDHWR: u32 = 0x3B;

const COP0_MF: u32 = 0x00;
const COP0_MT: u32 = 0x04;

const REGIMM_SYNCI: u32 = 0x1F;

/// Upper half of `value`, as loaded by `lui`.
pub const fn upper16(value: u32) -> u16 {
    (value >> 16) as u16
}

/// Lower half of `value`.
pub const fn lower16(value: u32) -> u16 {
    value as u16
}

/// The `lui` operand which, combined with a sign extended [`lower16`]
/// offset, addresses `value`.
pub const fn upper16_for_offset(value: u32) -> u16 {
    upper16(value.wrapping_add(0x8000))
}

/// Assemble an I-type instruction.
const fn i_type(opcode: u32, rs: u8, rt: u8, immediate: u16) -> u32 {
    opcode << 26 | (rs as u32 & 0x1F) << 21 | (rt as u32 & 0x1F) << 16 | immediate as u32
}

const fn r_type(rs: u8, rt: u8, rd: u8, shamt: u8, funct: u32) -> u32 {
    OP_SPECIAL << 26
        | (rs as u32 & 0x1F) << 21
        | (rt as u32 & 0x1F) << 16
        | (rd as u32 & 0x1F) << 11
        | (shamt as u32 & 0x1F) << 6
        | funct
}

pub const fn lui(rt: u8, immediate: u16) -> u32 {
    i_type(OP_LUI, 0, rt, immediate)
}

pub const fn ori(rt: u8, rs: u8, immediate: u16) -> u32 {
    i_type(OP_ORI, rs, rt, immediate)
}

pub const fn addi(rt: u8, rs: u8, immediate: i16) -> u32 {
    i_type(OP_ADDI, rs, rt, immediate as u16)
}

pub const fn lw(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_LW, base, rt, offset as u16)
}

pub const fn lhu(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_LHU, base, rt, offset as u16)
}

pub const fn lbu(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_LBU, base, rt, offset as u16)
}

pub const fn sw(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_SW, base, rt, offset as u16)
}

pub const fn sh(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_SH, base, rt, offset as u16)
}

pub const fn sb(rt: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_SB, base, rt, offset as u16)
}

/// `beq rs, rt, offset`, with `offset` counted in instructions from the delay slot.
pub const fn beq(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(OP_BEQ, rs, rt, offset as u16)
}

pub const fn bne(rs: u8, rt: u8, offset: i16) -> u32 {
    i_type(OP_BNE, rs, rt, offset as u16)
}

/// Unconditional relative branch (`beq $0, $0, offset`).
pub const fn b(offset: i16) -> u32 {
    beq(0, 0, offset)
}

/// Jump within the current 256 MiB segment.
pub const fn j(target: u32) -> u32 {
    OP_J << 26 | (target & 0x0FFF_FFFF) >> 2
}

pub const fn jr(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, FUNCT_JR)
}

pub const fn mfhi(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, FUNCT_MFHI)
}

pub const fn mflo(rd: u8) -> u32 {
    r_type(0, 0, rd, 0, FUNCT_MFLO)
}

pub const fn mthi(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, FUNCT_MTHI)
}

pub const fn mtlo(rs: u8) -> u32 {
    r_type(rs, 0, 0, 0, FUNCT_MTLO)
}

/// Move from coprocessor 0 register `rd`, select `sel`, into `rt`.
pub const fn mfc0(rt: u8, rd: u8, sel: u8) -> u32 {
    OP_COP0 << 26
        | COP0_MF << 21
        | (rt as u32 & 0x1F) << 16
        | (rd as u32 & 0x1F) << 11
        | (sel as u32 & 0x7)
}

/// Move `rt` into coprocessor 0 register `rd`, select `sel`.
pub const fn mtc0(rt: u8, rd: u8, sel: u8) -> u32 {
    OP_COP0 << 26
        | COP0_MT << 21
        | (rt as u32 & 0x1F) << 16
        | (rd as u32 & 0x1F) << 11
        | (sel as u32 & 0x7)
}

/// Read hardware register `rd` into `rt`.
pub const fn rdhwr(rt: u8, rd: u8) -> u32 {
    OP_SPECIAL3 << 26 | (rt as u32 & 0x1F) << 16 | (rd as u32 & 0x1F) << 11 | FUNCT_RDHWR
}

/// Synchronize the caches to make instruction writes at `offset(base)` effective.
pub const fn synci(offset: i16, base: u8) -> u32 {
    i_type(OP_REGIMM, base, REGIMM_SYNCI as u8, offset as u16)
}

/// Perform cache operation `op` on the line containing `offset(base)`.
pub const fn cache(op: u8, offset: i16, base: u8) -> u32 {
    i_type(OP_CACHE, base, op, offset as u16)
}

/// Branch offset from the instruction at `index` back to the first instruction.
pub fn branch_back_to_start(index: usize) -> i16 {
    -(index as i16 + 1)
}
