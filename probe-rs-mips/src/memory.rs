//! Target memory access, independent of how the core is driven.

use crate::Error;

/// {function_name} needs a data length that is a multiple of {alignment} bytes
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct InvalidDataLengthError {
    pub function_name: &'static str,
    /// Size of one element, in bytes.
    pub alignment: usize,
}

impl InvalidDataLengthError {
    pub fn new(function_name: &'static str, alignment: usize) -> Self {
        Self {
            function_name,
            alignment,
        }
    }
}

/// Address {address:#010X} is not aligned to {alignment} bytes
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct MemoryNotAlignedError {
    pub address: u64,
    pub alignment: usize,
}

/// Address {address:#X} does not fit into the 32 bit address space
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub struct AddressOutOfRangeError {
    pub address: u64,
}

/// Element-wise access to target memory.
///
/// Block accesses transfer `data.len()` elements. Addresses must be aligned
/// to the element size, otherwise [`MemoryNotAlignedError`] is returned.
pub trait MemoryInterface {
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), Error>;

    fn read_16(&mut self, address: u64, data: &mut [u16]) -> Result<(), Error>;

    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error>;

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), Error>;

    fn write_16(&mut self, address: u64, data: &[u16]) -> Result<(), Error>;

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Shifts out scans that are still queued in the probe.
    fn flush(&mut self) -> Result<(), Error>;

    fn read_word_32(&mut self, address: u64) -> Result<u32, Error> {
        let mut value = [0];
        self.read_32(address, &mut value)?;
        Ok(value[0])
    }

    fn read_word_16(&mut self, address: u64) -> Result<u16, Error> {
        let mut value = [0];
        self.read_16(address, &mut value)?;
        Ok(value[0])
    }

    fn read_word_8(&mut self, address: u64) -> Result<u8, Error> {
        let mut value = [0];
        self.read_8(address, &mut value)?;
        Ok(value[0])
    }

    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), Error> {
        self.write_32(address, &[value])
    }

    fn write_word_16(&mut self, address: u64, value: u16) -> Result<(), Error> {
        self.write_16(address, &[value])
    }

    fn write_word_8(&mut self, address: u64, value: u8) -> Result<(), Error> {
        self.write_8(address, &[value])
    }
}

/// Checks that `address` is a multiple of `alignment` and fits into 32 bits.
pub(crate) fn valid_32bit_address(address: u64, alignment: usize) -> Result<u32, Error> {
    if address % alignment as u64 != 0 {
        return Err(MemoryNotAlignedError { address, alignment }.into());
    }

    u32::try_from(address).map_err(|_| AddressOutOfRangeError { address }.into())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0x8000_0000, 4; "word")]
    #[test_case(0x8000_0002, 2; "half word")]
    #[test_case(0xFFFF_FFFF, 1; "last byte")]
    fn accepted(address: u64, alignment: usize) {
        assert_eq!(valid_32bit_address(address, alignment).unwrap(), address as u32);
    }

    #[test]
    fn unaligned_address() {
        assert!(matches!(
            valid_32bit_address(0x8000_0002, 4),
            Err(Error::MemoryNotAligned(MemoryNotAlignedError {
                address: 0x8000_0002,
                alignment: 4
            }))
        ));
    }

    #[test]
    fn address_beyond_32_bits() {
        assert!(matches!(
            valid_32bit_address(0x1_0000_0000, 4),
            Err(Error::AddressOutOfRange(_))
        ));
    }

    #[test]
    fn error_messages() {
        let error = MemoryNotAlignedError {
            address: 0x8000_0001,
            alignment: 2,
        };

        assert_eq!(
            error.to_string(),
            "Address 0x80000001 is not aligned to 2 bytes"
        );
    }
}
