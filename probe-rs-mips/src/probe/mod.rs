//! The JTAG transport boundary used by the EJTAG engine.
//!
//! Probes implement [`JtagAccess`]; everything above it only ever selects an
//! instruction register and shifts a data register.

#[cfg(any(test, feature = "test"))]
pub mod fake_probe;
mod queue;

use bitvec::prelude::*;
use thiserror::Error;

pub use queue::{
    BatchExecutionError, CommandQueue, DeferredResultIndex, DeferredResultSet, ScheduledCommand,
};

#[derive(Error, Debug)]
pub enum DebugProbeError {
    #[error("No target was found on the scan chain")]
    TargetNotFound,
    #[error("Some functionality was not implemented yet: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Low-level access to the JTAG protocol.
///
/// An implementor is expected to remember the currently selected instruction
/// and only shift the IR when it changes.
pub trait JtagAccess: std::fmt::Debug {
    /// Sets the length of the instruction register of the selected TAP.
    fn set_ir_len(&mut self, len: u32);

    /// Resets the TAP controller through Test-Logic-Reset.
    fn tap_reset(&mut self) -> Result<(), DebugProbeError>;

    /// Read a JTAG register.
    ///
    /// This function emulates a read by performing a write with all zeros to the DR.
    fn read_register(&mut self, address: u32, len: u32) -> Result<BitVec, DebugProbeError> {
        let data = vec![0u8; len.div_ceil(8) as usize];

        self.write_register(address, &data, len)
    }

    /// For EJTAG, and possibly other interfaces, the JTAG interface has to remain in
    /// the idle state for several cycles between consecutive accesses to the DR register.
    ///
    /// This function configures the number of idle cycles which are inserted after each access.
    fn set_idle_cycles(&mut self, idle_cycles: u8) -> Result<(), DebugProbeError>;

    /// Return the currently configured idle cycles.
    fn idle_cycles(&self) -> u8;

    /// The TCK frequency of the probe, in kHz.
    fn speed_khz(&self) -> u32;

    /// Write to a JTAG register
    ///
    /// This function will perform a write to the IR register, if necessary,
    /// to select the correct register, and then to the DR register, to transmit the
    /// data. The data shifted out of the DR register will be returned.
    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
    ) -> Result<BitVec, DebugProbeError>;

    /// Executes a sequence of JTAG commands.
    ///
    /// Probes which can pipeline scans should override this; the default shifts
    /// the commands one by one and stops at the first failing transform.
    fn write_register_batch(
        &mut self,
        writes: &CommandQueue<JtagCommand>,
    ) -> Result<DeferredResultSet<CommandResult>, BatchExecutionError> {
        let mut results = DeferredResultSet::with_capacity(writes.len());

        for scheduled in writes.iter() {
            let JtagCommand::WriteRegister(write) = scheduled.command();

            let result = match self.write_register(write.address, &write.data, write.len) {
                Ok(bits) => (write.transform)(write, &bits),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(res) => results.push(scheduled, res),
                Err(e) => return Err(BatchExecutionError::new(e, results)),
            }
        }

        Ok(results)
    }
}

/// A single register write scheduled in a [`CommandQueue`].
#[derive(Debug, Clone)]
pub struct JtagWriteCommand {
    /// The instruction register value selecting the data register.
    pub address: u32,
    /// The bits shifted into the data register, LSB first.
    pub data: Vec<u8>,
    /// Number of bits to shift.
    pub len: u32,
    /// Converts the captured bits into a [`CommandResult`].
    pub transform: fn(&JtagWriteCommand, &BitSlice) -> Result<CommandResult, crate::Error>,
}

#[derive(Debug, Clone)]
pub enum JtagCommand {
    WriteRegister(JtagWriteCommand),
}

impl From<JtagWriteCommand> for JtagCommand {
    fn from(cmd: JtagWriteCommand) -> Self {
        JtagCommand::WriteRegister(cmd)
    }
}

/// Results generated by [`JtagCommand`]s
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    None,
    U32(u32),
    U64(u64),
    VecU8(Vec<u8>),
}

impl CommandResult {
    /// Returns the result as a `u32` if the result is a `u32`.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            CommandResult::U32(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the result as a `u64` if the result is a `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            CommandResult::U64(value) => Some(*value),
            _ => None,
        }
    }
}
