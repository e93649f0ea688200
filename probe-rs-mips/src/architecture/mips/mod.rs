//! All the interface bits for MIPS32 cores debugged through EJTAG.

pub mod assembly;
pub mod communication_interface;
pub mod ejtag;
pub mod fastdata;
pub mod memory_access;
pub(crate) mod pracc;
pub mod registers;

pub use communication_interface::{
    MipsCommunicationInterface, MipsDebugInterfaceState, MipsError, MipsSessionState,
};
pub use fastdata::{FastdataDirection, FastdataError, FastdataHandler};
pub use memory_access::AccessWidth;
pub use pracc::PraccError;
pub use registers::RegisterFile;
