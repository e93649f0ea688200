//! Programs executed by the halted core through processor accesses.
//!
//! A [`PraccQueue`] holds a short program which is fed to the core one
//! instruction fetch at a time. Instructions that store a result into the
//! parameter output window are tagged with the address they store to, so
//! the executors know which stores to expect.

pub(crate) mod batch;
pub(crate) mod executor;

use crate::architecture::mips::assembly::{self, lower16, upper16};
use crate::architecture::mips::ejtag::{PRACC_PARAM_OUT, PRACC_PARAM_OUT_SIZE};

/// Errors of the processor access protocol.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PraccError {
    #[error("Unable to allocate memory for the instruction queue")]
    QueueAllocation,
    #[error("Store address 0x{0:08X} is outside of the parameter output window")]
    InvalidStoreAddress(u32),
    #[error("The instruction queue is empty")]
    EmptyQueue,
    #[error("Unexpected store to 0x{address:08X}, no store was pending")]
    UnexpectedStore { address: u32 },
    #[error("Store to 0x{address:08X} is outside of the output range of the queue")]
    StoreOutOfRange { address: u32 },
    #[error("Expected a store to 0x{expected:08X}, got 0x{actual:08X}")]
    StoreMismatch { expected: u32, actual: u32 },
    #[error("Expected a fetch, the core stored to 0x{address:08X}")]
    UnexpectedDirection { address: u32 },
    #[error("No processor access was pending")]
    NoPendingAccess,
    #[error("Fetch from 0x{actual:08X}, expected 0x{expected:08X}")]
    Desync { expected: u32, actual: u32 },
    #[error("Gave up after {restarts} restarts: fetch from 0x{actual:08X}, expected 0x{expected:08X}")]
    RestartLimitExceeded {
        restarts: usize,
        expected: u32,
        actual: u32,
    },
    #[error("The debug handler returned to the text start unexpectedly")]
    UnexpectedReturnToText,
    #[error("The core did not return to the text start, last fetch from 0x{0:08X}")]
    NoReturnToText(u32),
}

/// One instruction of a [`PraccQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PraccEntry {
    pub instruction: u32,
    /// The address in the parameter output window this instruction stores to.
    pub store_address: Option<u32>,
}

#[derive(Debug, Default, Clone)]
pub struct PraccQueue {
    entries: Vec<PraccEntry>,
    store_count: usize,
    max_store_address: u32,
    error: Option<PraccError>,
}

impl PraccQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an instruction.
    pub fn add(&mut self, instruction: u32) {
        self.push(PraccEntry {
            instruction,
            store_address: None,
        });
    }

    /// Appends an instruction storing to `store_address` in the parameter window.
    pub fn add_with_store(&mut self, store_address: u32, instruction: u32) {
        let in_window = (PRACC_PARAM_OUT..PRACC_PARAM_OUT + PRACC_PARAM_OUT_SIZE)
            .contains(&store_address)
            && store_address % 4 == 0;

        if !in_window {
            self.fail(PraccError::InvalidStoreAddress(store_address));
            return;
        }

        self.push(PraccEntry {
            instruction,
            store_address: Some(store_address),
        });

        if self.error.is_none() {
            self.store_count += 1;
            self.max_store_address = self.max_store_address.max(store_address);
        }
    }

    /// Loads `value` into register `reg`.
    ///
    /// With `optimize`, a single instruction is used when one half of `value`
    /// is zero. Without it, `lui` + `ori` is always emitted, so that the
    /// second instruction can be placed in a branch delay slot.
    pub fn add_immediate_load(&mut self, reg: u8, value: u32, optimize: bool) {
        let upper = upper16(value);
        let lower = lower16(value);

        if optimize && lower == 0 {
            self.add(assembly::lui(reg, upper));
        } else if optimize && upper == 0 {
            self.add(assembly::ori(reg, 0, lower));
        } else {
            self.add(assembly::lui(reg, upper));
            self.add(assembly::ori(reg, reg, lower));
        }
    }

    /// Ends the program with a branch back to the text start, with
    /// `delay_slot` executed on the way.
    pub fn add_return(&mut self, delay_slot: u32) {
        let offset = assembly::branch_back_to_start(self.entries.len());
        self.add(assembly::b(offset));
        self.add(delay_slot);
    }

    fn push(&mut self, entry: PraccEntry) {
        if self.error.is_some() {
            return;
        }

        if self.entries.try_reserve(1).is_err() {
            self.fail(PraccError::QueueAllocation);
            return;
        }

        self.entries.push(entry);
    }

    fn fail(&mut self, error: PraccError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Returns the first error hit while building the queue.
    pub fn check(&self) -> Result<(), PraccError> {
        match &self.error {
            Some(error) => Err(error.clone()),
            None if self.entries.is_empty() => Err(PraccError::EmptyQueue),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[PraccEntry] {
        &self.entries
    }

    pub fn instruction(&self, index: usize) -> u32 {
        self.entries[index].instruction
    }

    /// Number of instructions storing to the parameter window.
    pub fn store_count(&self) -> usize {
        self.store_count
    }

    pub fn max_store_address(&self) -> u32 {
        self.max_store_address
    }

    /// Number of output words the queue can produce.
    pub fn output_len(&self) -> usize {
        if self.store_count == 0 {
            0
        } else {
            ((self.max_store_address - PRACC_PARAM_OUT) / 4 + 1) as usize
        }
    }
}

/// Index of a store address in the output buffer.
pub(crate) fn output_slot(address: u32) -> usize {
    ((address - PRACC_PARAM_OUT) / 4) as usize
}
