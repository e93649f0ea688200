//! Target memory access through injected load and store sequences.

use crate::architecture::mips::assembly::{self, lower16, upper16_for_offset};
use crate::architecture::mips::communication_interface::{MipsCommunicationInterface, MipsError};
use crate::architecture::mips::ejtag::{
    DMSEG_END, DMSEG_START, PRACC_OUT_OFFSET, PRACC_PARAM_OUT, PRACC_UPPER_BASE,
};
use crate::architecture::mips::pracc::PraccQueue;
use crate::architecture::mips::registers::{
    CacheAttribute, Config, Config1, CP0_CONFIG, CP0_CONFIG1, CP0_DESAVE, HWR_SYNCI_STEP, T0,
    T1, T7,
};
use crate::memory::{valid_32bit_address, InvalidDataLengthError, MemoryInterface};
use crate::Error;

/// Elements read by one program.
const READ_CHUNK: usize = 256;
/// Elements written by one program.
const WRITE_CHUNK: usize = 128;
/// Cache lines synchronized by one program.
const CACHE_CHUNK: usize = 256;

/// The uncached, unmapped kernel segment.
const KSEG1_START: u32 = 0xA000_0000;
const KSEG1_END: u32 = 0xC000_0000;

const CACHE_D_HIT_WRITEBACK_INVALIDATE: u8 = 0x15;
const CACHE_I_HIT_INVALIDATE: u8 = 0x10;

/// Width of a single memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    HalfWord,
    Word,
}

impl AccessWidth {
    pub fn bytes(self) -> usize {
        match self {
            AccessWidth::Byte => 1,
            AccessWidth::HalfWord => 2,
            AccessWidth::Word => 4,
        }
    }

    fn load(self, rt: u8, offset: i16, base: u8) -> u32 {
        match self {
            AccessWidth::Byte => assembly::lbu(rt, offset, base),
            AccessWidth::HalfWord => assembly::lhu(rt, offset, base),
            AccessWidth::Word => assembly::lw(rt, offset, base),
        }
    }

    fn store(self, rt: u8, offset: i16, base: u8) -> u32 {
        match self {
            AccessWidth::Byte => assembly::sb(rt, offset, base),
            AccessWidth::HalfWord => assembly::sh(rt, offset, base),
            AccessWidth::Word => assembly::sw(rt, offset, base),
        }
    }
}

/// How dirty lines are pushed out to the point of unification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheSync {
    /// Release 2 `synci`.
    Synci,
    /// Release 1 `cache` operations on the data and instruction caches.
    CacheOps(CacheAttribute),
}

impl<'state> MipsCommunicationInterface<'state> {
    /// Reads `count` elements of `width` starting at `address`.
    ///
    /// The bytes are returned in target byte order.
    pub fn read_memory(
        &mut self,
        address: u32,
        width: AccessWidth,
        count: usize,
    ) -> Result<Vec<u8>, MipsError> {
        check_alignment(address, width)?;

        let endianness = self.config().endianness;
        let mut data = Vec::with_capacity(count * width.bytes());
        let mut address = address;
        let mut remaining = count;

        while remaining > 0 {
            let chunk = remaining.min(READ_CHUNK);

            for word in self.read_memory_chunk(address, width, chunk)? {
                endianness.to_bytes(word, width.bytes(), &mut data);
            }

            address = address.wrapping_add((chunk * width.bytes()) as u32);
            remaining -= chunk;
        }

        Ok(data)
    }

    fn read_memory_chunk(
        &mut self,
        address: u32,
        width: AccessWidth,
        count: usize,
    ) -> Result<Vec<u32>, MipsError> {
        let [t0, t1, _] = self.scratch_snapshot()?;

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add(assembly::lui(T7, PRACC_UPPER_BASE));

        let mut upper = upper16_for_offset(address);
        queue.add(assembly::lui(T1, upper));

        for i in 0..count {
            let element = address.wrapping_add((i * width.bytes()) as u32);

            if upper16_for_offset(element) != upper {
                upper = upper16_for_offset(element);
                queue.add(assembly::lui(T1, upper));
            }

            queue.add(width.load(T0, lower16(element) as i16, T1));
            queue.add_with_store(
                PRACC_PARAM_OUT + 4 * i as u32,
                assembly::sw(T0, (PRACC_OUT_OFFSET as usize + 4 * i) as i16, T7),
            );
        }

        queue.add_immediate_load(T0, t0, true);
        queue.add_immediate_load(T1, t1, true);
        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        let mut output = self.execute_queue(&queue)?;
        output.truncate(count);

        Ok(output)
    }

    /// Writes `data`, given in target byte order, as elements of `width`
    /// starting at `address`, and makes the written range coherent for
    /// instruction fetches.
    pub fn write_memory(
        &mut self,
        address: u32,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), MipsError> {
        check_alignment(address, width)?;

        if data.len() % width.bytes() != 0 {
            return Err(InvalidDataLengthError::new("write_memory", width.bytes()).into());
        }

        if data.is_empty() {
            return Ok(());
        }

        let endianness = self.config().endianness;
        let values: Vec<u32> = data
            .chunks_exact(width.bytes())
            .map(|bytes| endianness.from_bytes(bytes))
            .collect();

        let mut chunk_address = address;
        for chunk in values.chunks(WRITE_CHUNK) {
            self.write_memory_chunk(chunk_address, width, chunk)?;
            chunk_address = chunk_address.wrapping_add((chunk.len() * width.bytes()) as u32);
        }

        let last = address.wrapping_add(data.len() as u32 - 1);
        self.sync_cache(address, last)
    }

    fn write_memory_chunk(
        &mut self,
        address: u32,
        width: AccessWidth,
        values: &[u32],
    ) -> Result<(), MipsError> {
        let [t0, _, _] = self.scratch_snapshot()?;

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        let mut upper = upper16_for_offset(address);
        queue.add(assembly::lui(T7, upper));

        for (i, value) in values.iter().enumerate() {
            let element = address.wrapping_add((i * width.bytes()) as u32);

            if upper16_for_offset(element) != upper {
                upper = upper16_for_offset(element);
                queue.add(assembly::lui(T7, upper));
            }

            match width {
                AccessWidth::Word => queue.add_immediate_load(T0, *value, true),
                _ => queue.add(assembly::ori(T0, 0, *value as u16)),
            }
            queue.add(width.store(T0, lower16(element) as i16, T7));
        }

        queue.add_immediate_load(T0, t0, true);
        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        self.execute_queue(&queue)?;

        Ok(())
    }

    /// Writes back and invalidates the caches covering `start..end`.
    pub(crate) fn sync_cache(&mut self, start: u32, last: u32) -> Result<(), MipsError> {
        if (KSEG1_START..KSEG1_END).contains(&start) || (DMSEG_START..DMSEG_END).contains(&start)
        {
            return Ok(());
        }

        let config = Config(self.read_cp0(CP0_CONFIG.reg, CP0_CONFIG.sel)?);
        let attribute = config.cache_attribute(start);

        if attribute == CacheAttribute::Uncached {
            tracing::trace!("0x{:08X} is uncached, skipping cache synchronization", start);
            return Ok(());
        }

        let (line_size, method) = match config.architecture_release() {
            0 => {
                let config1 = Config1(self.read_cp0(CP0_CONFIG1.reg, CP0_CONFIG1.sel)?);
                if config1.dl() == 0 {
                    tracing::debug!("No data cache present");
                    return Ok(());
                }
                (2 << config1.dl(), CacheSync::CacheOps(attribute))
            }
            1 => (
                self.read_through_t0(assembly::rdhwr(T0, HWR_SYNCI_STEP))?,
                CacheSync::Synci,
            ),
            release => return Err(MipsError::UnsupportedRelease(release)),
        };

        if line_size == 0 {
            // SYNCI_Step of zero: no synchronization is needed.
            return Ok(());
        }

        if !line_size.is_power_of_two() {
            return Err(MipsError::InvalidCacheLineSize(line_size));
        }

        let lines = cache_lines(start, last, line_size);
        tracing::debug!(
            "Synchronizing {} cache lines of {} bytes using {:?}",
            lines.len(),
            line_size,
            method
        );

        for chunk in lines.chunks(CACHE_CHUNK) {
            self.sync_cache_lines(chunk, method)?;
        }

        Ok(())
    }

    fn sync_cache_lines(&mut self, lines: &[u32], method: CacheSync) -> Result<(), MipsError> {
        let Some(&first) = lines.first() else {
            return Ok(());
        };

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        let mut upper = upper16_for_offset(first);
        queue.add(assembly::lui(T7, upper));

        for &line in lines {
            if upper16_for_offset(line) != upper {
                upper = upper16_for_offset(line);
                queue.add(assembly::lui(T7, upper));
            }

            let offset = lower16(line) as i16;
            match method {
                CacheSync::Synci => queue.add(assembly::synci(offset, T7)),
                CacheSync::CacheOps(attribute) => {
                    // Write-through lines are never dirty.
                    if attribute == CacheAttribute::WriteBack {
                        queue.add(assembly::cache(CACHE_D_HIT_WRITEBACK_INVALIDATE, offset, T7));
                    }
                    queue.add(assembly::cache(CACHE_I_HIT_INVALIDATE, offset, T7));
                }
            }
        }

        queue.add(assembly::SYNC);
        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        self.execute_queue(&queue)?;

        Ok(())
    }
}

fn check_alignment(address: u32, width: AccessWidth) -> Result<(), MipsError> {
    valid_32bit_address(address as u64, width.bytes())
        .map(drop)
        .map_err(|e| match e {
            Error::MemoryNotAligned(e) => MipsError::MemoryNotAligned(e),
            other => MipsError::Other(anyhow::Error::new(other)),
        })
}

/// Start addresses of the cache lines of `line_size` bytes touching `start..end`.
/// Start addresses of the cache lines covering `start..=last`.
fn cache_lines(start: u32, last: u32, line_size: u32) -> Vec<u32> {
    let mask = !(line_size - 1);
    let last_line = last & mask;
    let mut lines = Vec::new();
    let mut line = start & mask;

    loop {
        lines.push(line);
        if line >= last_line {
            break;
        }
        line += line_size;
    }

    lines
}

impl MemoryInterface for MipsCommunicationInterface<'_> {
    fn read_32(&mut self, address: u64, data: &mut [u32]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 4)?;
        let endianness = self.config().endianness;
        let bytes = self.read_memory(address, AccessWidth::Word, data.len())?;

        for (word, bytes) in data.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = endianness.from_bytes(bytes);
        }

        Ok(())
    }

    fn read_16(&mut self, address: u64, data: &mut [u16]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 2)?;
        let endianness = self.config().endianness;
        let bytes = self.read_memory(address, AccessWidth::HalfWord, data.len())?;

        for (half, bytes) in data.iter_mut().zip(bytes.chunks_exact(2)) {
            *half = endianness.from_bytes(bytes) as u16;
        }

        Ok(())
    }

    fn read_8(&mut self, address: u64, data: &mut [u8]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 1)?;
        let bytes = self.read_memory(address, AccessWidth::Byte, data.len())?;
        data.copy_from_slice(&bytes);

        Ok(())
    }

    fn write_32(&mut self, address: u64, data: &[u32]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 4)?;
        let endianness = self.config().endianness;

        let mut bytes = Vec::with_capacity(data.len() * 4);
        for word in data {
            endianness.to_bytes(*word, 4, &mut bytes);
        }

        Ok(self.write_memory(address, AccessWidth::Word, &bytes)?)
    }

    fn write_16(&mut self, address: u64, data: &[u16]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 2)?;
        let endianness = self.config().endianness;

        let mut bytes = Vec::with_capacity(data.len() * 2);
        for half in data {
            endianness.to_bytes(u32::from(*half), 2, &mut bytes);
        }

        Ok(self.write_memory(address, AccessWidth::HalfWord, &bytes)?)
    }

    fn write_8(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        let address = valid_32bit_address(address, 1)?;

        Ok(self.write_memory(address, AccessWidth::Byte, data)?)
    }

    fn flush(&mut self) -> Result<(), Error> {
        Ok(self.ejtag.execute()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0x8000_0004, 0x8000_0007, 16, vec![0x8000_0000]; "inside one line")]
    #[test_case(0x8000_000C, 0x8000_0013, 16, vec![0x8000_0000, 0x8000_0010]; "crossing a line")]
    #[test_case(0x8000_0000, 0x8000_003F, 32, vec![0x8000_0000, 0x8000_0020]; "aligned range")]
    #[test_case(0xFFFF_FFF0, 0xFFFF_FFFF, 32, vec![0xFFFF_FFE0]; "end of address space")]
    #[test_case(0xFFFF_FFC0, 0xFFFF_FFFF, 32, vec![0xFFFF_FFC0, 0xFFFF_FFE0]; "last two lines")]
    fn lines_of_range(start: u32, last: u32, line_size: u32, expected: Vec<u32>) {
        assert_eq!(cache_lines(start, last, line_size), expected);
    }

    #[test]
    fn unaligned_access_is_rejected() {
        assert!(matches!(
            check_alignment(0x8000_0002, AccessWidth::Word),
            Err(MipsError::MemoryNotAligned(_))
        ));
        assert!(check_alignment(0x8000_0002, AccessWidth::HalfWord).is_ok());
        assert!(check_alignment(0x8000_0003, AccessWidth::Byte).is_ok());
    }
}
