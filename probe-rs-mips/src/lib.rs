//! # EJTAG processor access engine for MIPS32 cores
//!
//! A MIPS32 core halted in debug mode fetches its instructions from the
//! debug segment, which is served by the probe through the EJTAG TAP. This
//! crate drives that handshake: it feeds short generated programs to the core
//! to read and write registers and memory, keeps the caches coherent after
//! writes and moves bulk data through the FASTDATA register.
//!
//! ## Reading registers and memory
//!
//! ```no_run
//! # use probe_rs_mips::Error;
//! use probe_rs_mips::{EjtagConfig, MemoryInterface, MipsCommunicationInterface, MipsDebugInterfaceState};
//! # fn probe() -> Box<dyn probe_rs_mips::probe::JtagAccess> { unimplemented!() }
//!
//! let mut probe = probe();
//! let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
//! let mut interface = MipsCommunicationInterface::new(probe.as_mut(), &mut state)?;
//!
//! let registers = interface.read_registers()?;
//! println!("Halted at 0x{:08X}", registers.pc());
//!
//! let word = interface.read_word_32(0x8000_0000)?;
//! interface.write_word_32(0x8000_0000, word + 1)?;
//! # Ok::<(), Error>(())
//! ```

/// All the interface bits for the different architectures.
pub mod architecture;
pub mod config;
mod error;
pub mod memory;
pub mod probe;

pub use crate::architecture::mips::{
    AccessWidth, FastdataDirection, MipsCommunicationInterface, MipsDebugInterfaceState,
    MipsError, RegisterFile,
};
pub use crate::config::{EjtagConfig, ExecutionMode};
pub use crate::error::Error;
pub use crate::memory::MemoryInterface;
