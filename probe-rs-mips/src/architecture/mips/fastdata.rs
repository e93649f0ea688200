//! Bulk transfers through the FASTDATA register.
//!
//! A small handler is downloaded to the working area. It runs from RAM and
//! moves one word per access to [`FASTDATA_AREA`], which the probe services
//! with a 33 bit FASTDATA scan instead of a full PRACC exchange.

use std::time::Duration;

use crate::architecture::mips::assembly::{self, lower16, upper16, NOP, SYNC};
use crate::architecture::mips::communication_interface::{MipsCommunicationInterface, MipsError};
use crate::architecture::mips::ejtag::{FASTDATA_AREA, PRACC_TEXT};
use crate::architecture::mips::memory_access::AccessWidth;
use crate::architecture::mips::registers::{CP0_DESAVE, T0, T1, T2, T7};

/// Bytes of the working area used by the handler: code followed by the
/// saved scratch registers.
pub const HANDLER_AREA_SIZE: u32 = 0x80;

/// Number of instructions of the handler.
const HANDLER_LEN: usize = 22;

/// Failed scans in a row after which the core is checked for a lost handler.
const MAX_CONSECUTIVE_FAILURES: usize = 100;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FastdataError {
    #[error("No working area is configured")]
    NoWorkingArea,
    #[error("The working area of {size} bytes is too small, {required} bytes are needed")]
    WorkingAreaTooSmall { size: u32, required: u32 },
    #[error("Fastdata transfers need a word aligned address, got 0x{0:08X}")]
    UnalignedAddress(u32),
    #[error("Expected an access to the fastdata area, got one at 0x{0:08X}")]
    Desync(u32),
    #[error("{failed} fastdata scans did not complete an access")]
    TransferFailed { failed: usize },
    #[error("The handler did not return to the text start, it accessed 0x{0:08X}. The target has to be reconnected")]
    NoReturnToText(u32),
}

/// Direction of a transfer, seen from the target memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastdataDirection {
    /// Probe to target memory.
    Write,
    /// Target memory to probe.
    Read,
}

/// The handler that was last downloaded to the working area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastdataHandler {
    pub direction: FastdataDirection,
    pub address: u32,
}

/// Builds the handler for `direction`, linked to run at `base`.
pub(crate) fn handler_code(direction: FastdataDirection, base: u32) -> [u32; HANDLER_LEN] {
    let save = |slot: u32| (HANDLER_AREA_SIZE - 4 * slot) as i16;

    let (load, store) = match direction {
        FastdataDirection::Write => (assembly::lw(T2, 0, T0), assembly::sw(T2, 0, T1)),
        FastdataDirection::Read => (assembly::lw(T2, 0, T1), assembly::sw(T2, 0, T0)),
    };

    [
        assembly::sw(T0, save(1), T7),
        assembly::sw(T1, save(2), T7),
        assembly::sw(T2, save(3), T7),
        assembly::lui(T0, upper16(FASTDATA_AREA)),
        assembly::ori(T0, T0, lower16(FASTDATA_AREA)),
        // start and end address
        assembly::lw(T1, 0, T0),
        SYNC,
        assembly::lw(T7, 0, T0),
        SYNC,
        // loop
        load,
        store,
        assembly::bne(T7, T1, -3),
        assembly::addi(T1, T1, 4),
        assembly::lui(T7, upper16(base)),
        assembly::ori(T7, T7, lower16(base)),
        assembly::lw(T0, save(1), T7),
        assembly::lw(T1, save(2), T7),
        assembly::lw(T2, save(3), T7),
        assembly::lui(T7, upper16(PRACC_TEXT)),
        assembly::ori(T7, T7, lower16(PRACC_TEXT)),
        assembly::jr(T7),
        assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel),
    ]
}

/// Idle cycles after each scan so that scans are at least `scan_delay_ns` apart.
pub(crate) fn idle_cycles_for_delay(scan_delay_ns: u64, speed_khz: u32) -> u8 {
    let cycles = (scan_delay_ns * u64::from(speed_khz) + 500_000) / 1_000_000;

    cycles.min(u64::from(u8::MAX)) as u8
}

/// Counts failed scans in a row.
#[derive(Debug, Default)]
pub(crate) struct FailureTracker {
    consecutive: usize,
}

impl FailureTracker {
    pub fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Records a failure. Returns `true` once the core should be checked.
    pub fn failure(&mut self) -> bool {
        self.consecutive += 1;

        if self.consecutive > MAX_CONSECUTIVE_FAILURES {
            self.consecutive = 0;
            true
        } else {
            false
        }
    }
}

impl<'state> MipsCommunicationInterface<'state> {
    /// Transfers `data.len()` words between the probe and target memory at `address`.
    ///
    /// For [`FastdataDirection::Read`], `data` is filled with the words read.
    pub fn fastdata_transfer(
        &mut self,
        direction: FastdataDirection,
        address: u32,
        data: &mut [u32],
    ) -> Result<(), MipsError> {
        if data.is_empty() {
            return Ok(());
        }

        if address % 4 != 0 {
            return Err(FastdataError::UnalignedAddress(address).into());
        }

        let area = self
            .config()
            .working_area
            .ok_or(FastdataError::NoWorkingArea)?;

        if area.size < HANDLER_AREA_SIZE {
            return Err(FastdataError::WorkingAreaTooSmall {
                size: area.size,
                required: HANDLER_AREA_SIZE,
            }
            .into());
        }

        let handler = FastdataHandler {
            direction,
            address: area.address,
        };

        let result = self.run_fastdata(handler, address, data);
        if result.is_err() {
            self.state.forget_fastdata_handler();
        }

        result
    }

    fn run_fastdata(
        &mut self,
        handler: FastdataHandler,
        address: u32,
        data: &mut [u32],
    ) -> Result<(), MipsError> {
        if self.state.fastdata_handler() != Some(handler) {
            tracing::debug!(
                "Downloading the {:?} fastdata handler to 0x{:08X}",
                handler.direction,
                handler.address
            );

            let endianness = self.config().endianness;
            let mut image = Vec::with_capacity(HANDLER_LEN * 4);
            for instruction in handler_code(handler.direction, handler.address) {
                endianness.to_bytes(instruction, 4, &mut image);
            }

            self.write_memory(handler.address, AccessWidth::Word, &image)?;
            self.state.set_fastdata_handler(handler);
        }

        let timeout = self.config().pracc_timeout();

        // Jump to the handler. It starts by saving the scratch registers.
        let jump = [
            assembly::lui(T7, upper16(handler.address)),
            assembly::ori(T7, T7, lower16(handler.address)),
            assembly::jr(T7),
            NOP,
        ];
        for instruction in jump {
            self.ejtag.wait_for_processor_access(timeout)?;
            self.ejtag.schedule_data_write(instruction);
            self.ejtag.schedule_finish();
        }

        let end = address.wrapping_add(4 * (data.len() as u32 - 1));
        for parameter in [address, end] {
            self.expect_fastdata_access(timeout)?;
            self.ejtag.schedule_data_write(parameter);
            self.ejtag.schedule_finish();
        }

        // The first payload access, a load or a store depending on the direction.
        let access = self.ejtag.wait_for_processor_access(timeout)?;
        if access.address != FASTDATA_AREA {
            return Err(FastdataError::Desync(access.address).into());
        }

        let idle_cycles =
            idle_cycles_for_delay(self.config().scan_delay_ns, self.ejtag.speed_khz());
        let previous_idle_cycles = self.ejtag.idle_cycles();
        self.ejtag.set_idle_cycles(idle_cycles)?;

        let payload = self.fastdata_payload(handler.direction, data);
        self.ejtag.set_idle_cycles(previous_idle_cycles)?;
        let failed = payload?;

        let access = self.ejtag.wait_for_processor_access(timeout)?;
        if access.address != PRACC_TEXT || access.is_write() {
            return Err(FastdataError::NoReturnToText(access.address).into());
        }

        if failed > 0 {
            return Err(FastdataError::TransferFailed { failed }.into());
        }

        Ok(())
    }

    /// Waits for the handler to load a parameter from the fastdata area.
    fn expect_fastdata_access(&mut self, timeout: Duration) -> Result<(), MipsError> {
        let access = self.ejtag.wait_for_processor_access(timeout)?;

        if access.address != FASTDATA_AREA || access.is_write() {
            return Err(FastdataError::Desync(access.address).into());
        }

        Ok(())
    }

    /// Shifts the payload. Returns the number of scans which did not complete
    /// an access.
    fn fastdata_payload(
        &mut self,
        direction: FastdataDirection,
        data: &mut [u32],
    ) -> Result<usize, MipsError> {
        let block_size = self.config().fastdata_block_size.max(1);
        let mut tracker = FailureTracker::default();
        let mut failed = 0;

        for block in data.chunks_mut(block_size) {
            // After a failure, the data no longer lines up with the addresses
            // the handler stores to. Keep the handler going with zeros.
            let filler = failed > 0;

            let indices: Vec<_> = block
                .iter()
                .map(|word| {
                    let value = match direction {
                        FastdataDirection::Write if !filler => *word,
                        _ => 0,
                    };
                    self.ejtag.schedule_fastdata(value)
                })
                .collect();

            self.ejtag.execute()?;

            for (word, index) in block.iter_mut().zip(indices) {
                let scan = self.ejtag.read_fastdata_result(index)?;

                if scan.success {
                    tracker.success();
                    if direction == FastdataDirection::Read {
                        *word = scan.data;
                    }
                    continue;
                }

                failed += 1;
                if tracker.failure() {
                    self.check_fastdata_handler()?;
                }
            }
        }

        if failed > 0 {
            tracing::warn!("{} of {} fastdata scans failed", failed, data.len());
        }

        Ok(failed)
    }

    /// Checks whether the handler still waits on the fastdata area after a
    /// run of failed scans.
    fn check_fastdata_handler(&mut self) -> Result<(), MipsError> {
        let access = self.ejtag.read_processor_access()?;

        if access.control.pracc() && access.address == FASTDATA_AREA {
            tracing::warn!("Fastdata scans failed while the handler is waiting, continuing");
            Ok(())
        } else {
            Err(FastdataError::Desync(access.address).into())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(0, 10_000, 0; "no delay")]
    #[test_case(1_000, 1_000, 1; "one cycle")]
    #[test_case(1_400, 1_000, 1; "rounds down")]
    #[test_case(1_500, 1_000, 2; "rounds up")]
    #[test_case(1_000_000, 30_000, 255; "saturates")]
    fn idle_cycles(delay_ns: u64, khz: u32, expected: u8) {
        assert_eq!(idle_cycles_for_delay(delay_ns, khz), expected);
    }

    #[test]
    fn failure_tracker_triggers_after_limit() {
        let mut tracker = FailureTracker::default();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            assert!(!tracker.failure());
        }
        assert!(tracker.failure());
        // The count starts over after a check.
        assert!(!tracker.failure());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut tracker = FailureTracker::default();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            tracker.failure();
        }
        tracker.success();

        assert!(!tracker.failure());
    }

    #[test]
    fn handler_layout() {
        let code = handler_code(FastdataDirection::Write, 0x8000_1000);

        assert_eq!(code.len(), HANDLER_LEN);
        // saves below the end of the area
        assert_eq!(code[0], assembly::sw(T0, 0x7C, T7));
        // the loop branches back to its load
        assert_eq!(code[11], assembly::bne(T7, T1, -3));
        assert_eq!(code[9], assembly::lw(T2, 0, T0));
        assert_eq!(code[13], assembly::lui(T7, 0x8000));
        assert_eq!(code[14], assembly::ori(T7, T7, 0x1000));
        assert_eq!(code[21], assembly::mfc0(T7, 31, 0));

        let read = handler_code(FastdataDirection::Read, 0x8000_1000);
        assert_eq!(read[9], assembly::lw(T2, 0, T1));
        assert_eq!(read[10], assembly::sw(T2, 0, T0));
    }

    #[test]
    fn handler_fits_in_its_area() {
        assert!(HANDLER_LEN as u32 * 4 <= HANDLER_AREA_SIZE - 12);
    }
}
