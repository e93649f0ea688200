//! EJTAG TAP access.
//!
//! The EJTAG TAP exposes the processor access (PRACC) handshake through the
//! CONTROL, ADDRESS and DATA registers. A halted core stalls on every access
//! to the debug segment until the probe clears `PrAcc` in the control register.

use std::time::{Duration, Instant};

use bitfield::bitfield;
use bitvec::prelude::*;

use crate::architecture::mips::communication_interface::MipsError;
use crate::probe::{
    CommandQueue, CommandResult, DebugProbeError, DeferredResultIndex, DeferredResultSet,
    JtagAccess, JtagCommand, JtagWriteCommand,
};

/// Length of the EJTAG instruction register.
pub const EJTAG_IR_LEN: u32 = 5;

/// Start of the debug segment (dmseg).
pub const DMSEG_START: u32 = 0xFF20_0000;
/// End of the debug segment, exclusive.
pub const DMSEG_END: u32 = 0xFF40_0000;

/// Upper half of every debug segment address used by the engine.
pub const PRACC_UPPER_BASE: u16 = 0xFF20;
/// Address the halted core fetches its first instruction from.
pub const PRACC_TEXT: u32 = 0xFF20_0200;
/// Offset of the parameter output window from [`DMSEG_START`].
pub const PRACC_OUT_OFFSET: u16 = 0x2000;
/// Window the injected code stores results to.
pub const PRACC_PARAM_OUT: u32 = DMSEG_START + PRACC_OUT_OFFSET as u32;
/// Size of the parameter output window.
pub const PRACC_PARAM_OUT_SIZE: u32 = 0x1000;
/// Address accessed by the fastdata handler for every transferred word.
pub const FASTDATA_AREA: u32 = DMSEG_START;

/// The EJTAG TAP instructions.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EjtagInstruction {
    IdCode,
    ImpCode,
    Address,
    Data,
    Control,
    All,
    EjtagBoot,
    NormalBoot,
    Fastdata,
    Bypass,
}

impl EjtagInstruction {
    pub fn code(self) -> u32 {
        match self {
            EjtagInstruction::IdCode => 0x01,
            EjtagInstruction::ImpCode => 0x03,
            EjtagInstruction::Address => 0x08,
            EjtagInstruction::Data => 0x09,
            EjtagInstruction::Control => 0x0A,
            EjtagInstruction::All => 0x0B,
            EjtagInstruction::EjtagBoot => 0x0C,
            EjtagInstruction::NormalBoot => 0x0D,
            EjtagInstruction::Fastdata => 0x0E,
            EjtagInstruction::Bypass => 0x1F,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            EjtagInstruction::All => 96,
            EjtagInstruction::Fastdata => 33,
            EjtagInstruction::Bypass => 1,
            _ => 32,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0x01 => EjtagInstruction::IdCode,
            0x03 => EjtagInstruction::ImpCode,
            0x08 => EjtagInstruction::Address,
            0x09 => EjtagInstruction::Data,
            0x0A => EjtagInstruction::Control,
            0x0B => EjtagInstruction::All,
            0x0C => EjtagInstruction::EjtagBoot,
            0x0D => EjtagInstruction::NormalBoot,
            0x0E => EjtagInstruction::Fastdata,
            0x1F => EjtagInstruction::Bypass,
            _ => return None,
        })
    }
}

bitfield! {
    /// The EJTAG control register.
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct EjtagControl(u32);
    impl Debug;

    pub rocc, set_rocc: 31;
    pub psz, _: 30, 29;
    pub doze, _: 22;
    pub halt, _: 21;
    pub per_rst, set_per_rst: 20;
    pub prnw, set_prnw: 19;
    pub pracc, set_pracc: 18;
    pub pr_rst, set_pr_rst: 16;
    pub proben, set_proben: 15;
    pub probtrap, set_probtrap: 14;
    pub ejtag_brk, set_ejtag_brk: 12;
    /// The core is in debug mode.
    pub dm, _: 3;
}

impl EjtagControl {
    /// Control word written on every access: probe services dmseg, handler in dmseg.
    pub fn base() -> Self {
        let mut control = EjtagControl(0);
        control.set_proben(true);
        control.set_probtrap(true);
        control.set_pracc(true);
        control
    }

    /// Control word completing the pending processor access.
    pub fn finish() -> Self {
        let mut control = Self::base();
        control.set_pracc(false);
        control
    }
}

bitfield! {
    /// The EJTAG implementation register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ImpCode(u32);
    impl Debug;

    pub ejtag_version, _: 31, 29;
    pub dint_supported, _: 24;
    pub asid_size, _: 22, 21;
    pub mips16, _: 16;
    pub no_dma, _: 14;
    pub mips64, _: 0;
}

/// A processor access observed on the PRACC handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorAccess {
    pub control: EjtagControl,
    pub address: u32,
}

impl ProcessorAccess {
    /// The core is storing to the debug segment.
    pub fn is_write(&self) -> bool {
        self.control.prnw()
    }
}

/// One exchange through the 96 bit ALL register.
///
/// The fields are shifted in order control, data, address, and are captured
/// in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllScan {
    pub control: u32,
    pub data: u32,
    pub address: u32,
}

impl AllScan {
    pub fn to_bytes(self) -> [u8; 12] {
        let mut bytes = [0; 12];
        bytes[0..4].copy_from_slice(&self.control.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.data.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.address.to_le_bytes());
        bytes
    }

    pub fn from_bits<T: BitStore>(bits: &BitSlice<T, Lsb0>) -> Option<Self> {
        if bits.len() < 96 {
            return None;
        }

        Some(AllScan {
            control: bits[0..32].load_le(),
            data: bits[32..64].load_le(),
            address: bits[64..96].load_le(),
        })
    }

    pub fn access(&self) -> ProcessorAccess {
        ProcessorAccess {
            control: EjtagControl(self.control),
            address: self.address,
        }
    }
}

/// The result of a 33 bit FASTDATA scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastdataScan {
    /// SPrAcc: a processor access was pending and has been completed.
    pub success: bool,
    pub data: u32,
}

impl FastdataScan {
    fn to_u64(self) -> u64 {
        (self.data as u64) << 1 | self.success as u64
    }

    fn from_u64(raw: u64) -> Self {
        FastdataScan {
            success: raw & 1 == 1,
            data: (raw >> 1) as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct EjtagState {
    queued_commands: CommandQueue<JtagCommand>,
    jtag_results: DeferredResultSet<CommandResult>,

    idcode: Option<u32>,
    impcode: Option<ImpCode>,

    /// The access seen by the last handshake poll.
    last_access: Option<ProcessorAccess>,
}

impl EjtagState {
    pub fn idcode(&self) -> Option<u32> {
        self.idcode
    }

    pub fn impcode(&self) -> Option<ImpCode> {
        self.impcode
    }

    pub fn last_access(&self) -> Option<ProcessorAccess> {
        self.last_access
    }
}

/// Access to the EJTAG registers of a single TAP.
#[derive(Debug)]
pub struct Ejtag<'probe> {
    pub probe: &'probe mut dyn JtagAccess,
    state: &'probe mut EjtagState,
}

impl<'probe> Ejtag<'probe> {
    pub fn new(probe: &'probe mut dyn JtagAccess, state: &'probe mut EjtagState) -> Self {
        Self { probe, state }
    }

    /// Identifies the TAP. Only done once per session.
    pub fn init(&mut self) -> Result<(), MipsError> {
        self.probe.set_ir_len(EJTAG_IR_LEN);

        if self.state.idcode.is_some() {
            return Ok(());
        }

        self.probe.tap_reset()?;

        let idcode = self.tap_read(EjtagInstruction::IdCode)?;
        if idcode == 0 || idcode == !0 {
            return Err(DebugProbeError::TargetNotFound.into());
        }

        let impcode = ImpCode(self.tap_read(EjtagInstruction::ImpCode)?);
        tracing::info!("Found EJTAG TAP with IDCODE 0x{:08X}", idcode);
        tracing::info!(
            "EJTAG version {}, {:?}",
            ejtag_version_name(impcode.ejtag_version()),
            impcode
        );

        if impcode.mips64() {
            return Err(MipsError::Unsupported64Bit);
        }

        let control = self.read_control()?;
        if !control.dm() {
            tracing::warn!("The core is not in debug mode, processor accesses will time out");
        }

        self.state.idcode = Some(idcode);
        self.state.impcode = Some(impcode);

        Ok(())
    }

    fn tap_write(&mut self, instr: EjtagInstruction, data: u32) -> Result<u32, DebugProbeError> {
        let capture = self
            .probe
            .write_register(instr.code(), &data.to_le_bytes(), instr.bits())?;

        Ok(capture.load_le::<u32>())
    }

    fn tap_read(&mut self, instr: EjtagInstruction) -> Result<u32, DebugProbeError> {
        let capture = self.probe.read_register(instr.code(), instr.bits())?;

        Ok(capture.load_le::<u32>())
    }

    /// Polls the control register without completing anything.
    pub fn read_control(&mut self) -> Result<EjtagControl, MipsError> {
        let control =
            EjtagControl(self.tap_write(EjtagInstruction::Control, EjtagControl::base().0)?);
        tracing::trace!("control: {:?}", control);

        Ok(control)
    }

    /// Reads the control and address registers once.
    pub fn read_processor_access(&mut self) -> Result<ProcessorAccess, MipsError> {
        self.execute()?;

        let control = self.read_control()?;
        let address = self.tap_read(EjtagInstruction::Address)?;
        let access = ProcessorAccess { control, address };
        self.state.last_access = Some(access);

        Ok(access)
    }

    pub fn last_access(&self) -> Option<ProcessorAccess> {
        self.state.last_access
    }

    /// Flushes queued scans and waits until the core requests a processor access.
    pub fn wait_for_processor_access(
        &mut self,
        timeout: Duration,
    ) -> Result<ProcessorAccess, MipsError> {
        self.execute()?;

        let start = Instant::now();
        let control = loop {
            let control = self.read_control()?;
            if control.pracc() {
                break control;
            }

            if start.elapsed() > timeout {
                return Err(MipsError::PraccTimeout);
            }
        };

        let address = self.tap_read(EjtagInstruction::Address)?;
        let access = ProcessorAccess { control, address };
        self.state.last_access = Some(access);
        tracing::trace!(
            "{} access at 0x{:08X}",
            if access.is_write() { "store" } else { "fetch" },
            address
        );

        Ok(access)
    }

    fn schedule_scan(
        &mut self,
        instr: EjtagInstruction,
        data: &[u8],
        transform: fn(&JtagWriteCommand, &BitSlice) -> Result<CommandResult, crate::Error>,
    ) -> DeferredResultIndex {
        self.state.queued_commands.schedule(JtagWriteCommand {
            address: instr.code(),
            data: data.to_vec(),
            len: instr.bits(),
            transform,
        })
    }

    /// Queues a write of the DATA register, serving a fetch or a load.
    pub fn schedule_data_write(&mut self, value: u32) {
        // The captured value is not needed, dropping the index skips capturing it.
        let _ = self.schedule_scan(EjtagInstruction::Data, &value.to_le_bytes(), |_, _| {
            Ok(CommandResult::None)
        });
    }

    /// Queues a read of the DATA register, capturing the value of a store.
    pub fn schedule_data_read(&mut self) -> DeferredResultIndex {
        self.schedule_scan(EjtagInstruction::Data, &0u32.to_le_bytes(), |_, bits| {
            Ok(CommandResult::U32(bits.load_le::<u32>()))
        })
    }

    /// Queues the control write that lets the core continue after an access.
    pub fn schedule_finish(&mut self) {
        let _ = self.schedule_scan(
            EjtagInstruction::Control,
            &EjtagControl::finish().0.to_le_bytes(),
            |_, _| Ok(CommandResult::None),
        );
    }

    /// Queues an exchange through the ALL register.
    pub fn schedule_all(&mut self, scan: AllScan) -> DeferredResultIndex {
        self.schedule_scan(EjtagInstruction::All, &scan.to_bytes(), |_, bits| {
            Ok(CommandResult::VecU8(
                bits.chunks(8).map(|byte| byte.load_le::<u8>()).collect(),
            ))
        })
    }

    /// Queues a FASTDATA scan.
    pub fn schedule_fastdata(&mut self, data: u32) -> DeferredResultIndex {
        let raw = FastdataScan {
            success: false,
            data,
        }
        .to_u64();

        self.schedule_scan(
            EjtagInstruction::Fastdata,
            &raw.to_le_bytes()[..5],
            |_, bits| Ok(CommandResult::U64(bits.load_le::<u64>())),
        )
    }

    /// Shifts all queued scans through the probe.
    pub fn execute(&mut self) -> Result<(), MipsError> {
        let cmds = std::mem::take(&mut self.state.queued_commands);

        if cmds.is_empty() {
            return Ok(());
        }

        tracing::trace!("Executing {} queued scans", cmds.len());

        match self.probe.write_register_batch(&cmds) {
            Ok(results) => {
                self.state.jtag_results.merge_from(results);
                Ok(())
            }
            Err(e) => {
                // Keep what was captured before the failure.
                self.state.jtag_results.merge_from(e.results);
                Err(MipsError::from_batch(e.error))
            }
        }
    }

    fn read_deferred_result(
        &mut self,
        index: DeferredResultIndex,
    ) -> Result<CommandResult, MipsError> {
        match self.state.jtag_results.take(index) {
            Ok(result) => Ok(result),
            Err(index) => {
                self.execute()?;
                // We can lose data if `execute` fails.
                self.state
                    .jtag_results
                    .take(index)
                    .map_err(|_| MipsError::BatchedResultNotAvailable)
            }
        }
    }

    /// Result of a [`Self::schedule_data_read`].
    pub fn read_data_result(&mut self, index: DeferredResultIndex) -> Result<u32, MipsError> {
        self.read_deferred_result(index)?
            .as_u32()
            .ok_or(MipsError::UnexpectedScanResult)
    }

    /// Result of a [`Self::schedule_all`].
    pub fn read_all_result(&mut self, index: DeferredResultIndex) -> Result<AllScan, MipsError> {
        match self.read_deferred_result(index)? {
            CommandResult::VecU8(bytes) => AllScan::from_bits(bytes.view_bits::<Lsb0>())
                .ok_or(MipsError::UnexpectedScanResult),
            _ => Err(MipsError::UnexpectedScanResult),
        }
    }

    /// Result of a [`Self::schedule_fastdata`].
    pub fn read_fastdata_result(
        &mut self,
        index: DeferredResultIndex,
    ) -> Result<FastdataScan, MipsError> {
        self.read_deferred_result(index)?
            .as_u64()
            .map(FastdataScan::from_u64)
            .ok_or(MipsError::UnexpectedScanResult)
    }

    /// Configures the idle cycles inserted after each scan.
    pub fn set_idle_cycles(&mut self, idle_cycles: u8) -> Result<(), MipsError> {
        Ok(self.probe.set_idle_cycles(idle_cycles)?)
    }

    pub fn idle_cycles(&self) -> u8 {
        self.probe.idle_cycles()
    }

    pub fn speed_khz(&self) -> u32 {
        self.probe.speed_khz()
    }
}

fn ejtag_version_name(version: u32) -> &'static str {
    match version {
        0 => "1 and 2.0",
        1 => "2.5",
        2 => "2.6",
        3 => "3.1",
        4 => "4.0",
        5 => "5.0",
        _ => "unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn control_words() {
        assert_eq!(EjtagControl::base().0, 1 << 18 | 1 << 15 | 1 << 14);
        assert_eq!(EjtagControl::finish().0, 1 << 15 | 1 << 14);
    }

    #[test]
    fn store_access_is_reported_as_write() {
        let access = ProcessorAccess {
            control: EjtagControl(1 << 19 | 1 << 18),
            address: PRACC_PARAM_OUT,
        };

        assert!(access.is_write());
        assert!(access.control.pracc());
    }

    #[test]
    fn all_scan_layout() {
        let scan = AllScan {
            control: 0x1122_3344,
            data: 0x5566_7788,
            address: 0x99AA_BBCC,
        };

        let bytes = scan.to_bytes();
        assert_eq!(&bytes[..4], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[8..], &[0xCC, 0xBB, 0xAA, 0x99]);

        let bits = bytes.view_bits::<Lsb0>().to_bitvec();
        assert_eq!(AllScan::from_bits(&bits), Some(scan));
        assert_eq!(AllScan::from_bits(&bits[..64]), None);
    }

    #[test]
    fn fastdata_scan_packing() {
        let scan = FastdataScan {
            success: true,
            data: 0xDEAD_BEEF,
        };

        assert_eq!(scan.to_u64(), 0x1_BD5B_7DDF);
        assert_eq!(FastdataScan::from_u64(scan.to_u64()), scan);
    }

    #[test]
    fn parameter_window() {
        assert_eq!(PRACC_PARAM_OUT, 0xFF20_2000);
        assert!(PRACC_TEXT > DMSEG_START && PRACC_TEXT < PRACC_PARAM_OUT);
    }
}
