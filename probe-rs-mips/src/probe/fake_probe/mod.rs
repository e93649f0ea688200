#![allow(missing_docs)] // Don't require docs for test code

//! A probe with a simulated EJTAG TAP and MIPS32 core, for tests.

mod mock_core;

use std::ops::Range;

use bitvec::prelude::*;

pub use mock_core::{CacheOperation, MockAccess, MockMipsCore};

use crate::architecture::mips::ejtag::{EjtagControl, EjtagInstruction, FASTDATA_AREA};
use crate::probe::{DebugProbeError, JtagAccess};

/// A single data register scan seen by the [`FakeProbe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    pub instruction: EjtagInstruction,
    pub shifted_in: u128,
    pub captured: u128,
}

/// This is a mock probe which can be used for mocking things in tests.
#[derive(Debug)]
pub struct FakeProbe {
    ir_len: u32,
    instruction: EjtagInstruction,
    idcode: u32,
    impcode: u32,
    speed_khz: u32,
    idle_cycles: u8,

    /// The EJTAG DATA register.
    data: u32,
    core: MockMipsCore,

    scans: Vec<Scan>,
    fastdata_scans: usize,
    failing_fastdata_scans: Range<usize>,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeProbe {
    /// Creates a new [`FakeProbe`] with a core halted at the text start.
    pub fn new() -> Self {
        Self {
            ir_len: 0,
            instruction: EjtagInstruction::IdCode,
            idcode: 0x0000_1A0F,
            // EJTAG 2.6
            impcode: 2 << 29,
            speed_khz: 10_000,
            idle_cycles: 0,
            data: 0,
            core: MockMipsCore::new(),
            scans: Vec::new(),
            fastdata_scans: 0,
            failing_fastdata_scans: 0..0,
        }
    }

    pub fn core(&self) -> &MockMipsCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut MockMipsCore {
        &mut self.core
    }

    pub fn set_idcode(&mut self, idcode: u32) {
        self.idcode = idcode;
    }

    pub fn set_impcode(&mut self, impcode: u32) {
        self.impcode = impcode;
    }

    pub fn ir_len(&self) -> u32 {
        self.ir_len
    }

    /// All data register scans, in order.
    pub fn scans(&self) -> &[Scan] {
        &self.scans
    }

    pub fn clear_scans(&mut self) {
        self.scans.clear();
    }

    /// Scans of `instruction` so far.
    pub fn scan_count(&self, instruction: EjtagInstruction) -> usize {
        self.scans
            .iter()
            .filter(|scan| scan.instruction == instruction)
            .count()
    }

    /// Fastdata scans with an index in `range`, counted from the first
    /// fastdata scan of the session, do not complete the access.
    pub fn fail_fastdata_scans(&mut self, range: Range<usize>) {
        self.failing_fastdata_scans = range;
    }

    fn control_capture(&self) -> u32 {
        let mut control = EjtagControl::finish();
        // Always in debug mode.
        control.0 |= 1 << 3;

        if let Some(access) = self.core.pending() {
            control.set_pracc(true);
            control.set_prnw(access.is_store());
        }

        control.0
    }

    /// Completes the pending access with the DATA register and latches the
    /// value of the next store, if the core presents one.
    fn finish_access(&mut self) {
        self.core.complete(self.data);

        if let Some(MockAccess::Store { value, .. }) = self.core.pending() {
            self.data = value;
        }
    }

    fn shift(&mut self, data_in: u128) -> u128 {
        match self.instruction {
            EjtagInstruction::IdCode => u128::from(self.idcode),
            EjtagInstruction::ImpCode => u128::from(self.impcode),
            EjtagInstruction::Address => u128::from(self.core.reported_address()),
            EjtagInstruction::Data => {
                let captured = self.data;
                self.data = data_in as u32;
                u128::from(captured)
            }
            EjtagInstruction::Control => {
                let captured = self.control_capture();
                if !EjtagControl(data_in as u32).pracc() {
                    self.finish_access();
                }
                u128::from(captured)
            }
            EjtagInstruction::All => {
                let captured = u128::from(self.control_capture())
                    | u128::from(self.data) << 32
                    | u128::from(self.core.reported_address()) << 64;

                self.data = (data_in >> 32) as u32;
                if !EjtagControl(data_in as u32).pracc() {
                    self.finish_access();
                }

                captured
            }
            EjtagInstruction::Fastdata => {
                let index = self.fastdata_scans;
                self.fastdata_scans += 1;

                let waiting = self.core.pending_address() == Some(FASTDATA_AREA);
                if !waiting || self.failing_fastdata_scans.contains(&index) {
                    return 0;
                }

                let captured = u128::from(self.data) << 1 | 1;
                self.data = (data_in >> 1) as u32;
                self.finish_access();

                captured
            }
            _ => 0,
        }
    }
}

impl JtagAccess for FakeProbe {
    fn set_ir_len(&mut self, len: u32) {
        self.ir_len = len;
    }

    fn tap_reset(&mut self) -> Result<(), DebugProbeError> {
        self.instruction = EjtagInstruction::IdCode;
        Ok(())
    }

    fn set_idle_cycles(&mut self, idle_cycles: u8) -> Result<(), DebugProbeError> {
        self.idle_cycles = idle_cycles;
        Ok(())
    }

    fn idle_cycles(&self) -> u8 {
        self.idle_cycles
    }

    fn speed_khz(&self) -> u32 {
        self.speed_khz
    }

    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
    ) -> Result<BitVec, DebugProbeError> {
        self.instruction = EjtagInstruction::from_code(address)
            .ok_or(DebugProbeError::NotImplemented("unknown EJTAG instruction"))?;

        let data_in = data
            .iter()
            .take(16)
            .rev()
            .fold(0u128, |acc, byte| acc << 8 | u128::from(*byte));
        let data_in = if len < 128 {
            data_in & ((1u128 << len) - 1)
        } else {
            data_in
        };

        let captured = self.shift(data_in);
        self.scans.push(Scan {
            instruction: self.instruction,
            shifted_in: data_in,
            captured,
        });

        let mut bits = BitVec::with_capacity(len as usize);
        for i in 0..len.min(128) {
            bits.push(captured >> i & 1 == 1);
        }

        Ok(bits)
    }
}
