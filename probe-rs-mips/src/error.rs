use crate::architecture::mips::communication_interface::MipsError;
use crate::memory::{AddressOutOfRangeError, InvalidDataLengthError, MemoryNotAlignedError};
use crate::probe::DebugProbeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("An error with the usage of the probe occurred")]
    Probe(#[from] DebugProbeError),
    #[error("A MIPS specific error occurred")]
    Mips(#[source] MipsError),
    #[error(transparent)]
    InvalidDataLength(#[from] InvalidDataLengthError),
    #[error(transparent)]
    MemoryNotAligned(#[from] MemoryNotAlignedError),
    #[error(transparent)]
    AddressOutOfRange(#[from] AddressOutOfRangeError),
    #[error("Unable to load the EJTAG configuration")]
    Config(#[from] serde_yaml::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<MipsError> for Error {
    fn from(err: MipsError) -> Self {
        match err {
            MipsError::DebugProbe(e) => Error::Probe(e),
            other => Error::Mips(other),
        }
    }
}
