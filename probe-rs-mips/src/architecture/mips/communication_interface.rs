//! MIPS EJTAG communication
//!
//! The [`MipsCommunicationInterface`] runs short programs on a core halted in
//! debug mode. Every instruction fetch and every store to the debug segment
//! stalls the core until the probe services it through the EJTAG TAP.

use crate::architecture::mips::assembly::{self, lower16, upper16, NOP};
use crate::architecture::mips::ejtag::{
    AllScan, Ejtag, EjtagState, PRACC_OUT_OFFSET, PRACC_PARAM_OUT, PRACC_TEXT, PRACC_UPPER_BASE,
};
use crate::architecture::mips::fastdata::{FastdataError, FastdataHandler};
use crate::architecture::mips::pracc::batch::{self, PlannedScan};
use crate::architecture::mips::pracc::executor::{Action, SyncExecutor};
use crate::architecture::mips::pracc::{PraccError, PraccQueue};
use crate::architecture::mips::registers::{
    Cp0Register, DebugRegister, RegisterFile, AT, BADVADDR_INDEX, CAUSE_INDEX, CP0_BADVADDR,
    CP0_CAUSE, CP0_DEBUG, CP0_DEPC, CP0_DESAVE, CP0_STATUS, GPR_COUNT, HI_INDEX, LO_INDEX,
    PC_INDEX, REGISTER_FILE_LEN, STATUS_INDEX, T0, T1, T2, T7,
};
use crate::config::{EjtagConfig, ExecutionMode, InstructionSet};
use crate::memory::{InvalidDataLengthError, MemoryNotAlignedError};
use crate::probe::{DebugProbeError, DeferredResultIndex, JtagAccess};

/// Possible MIPS errors
#[derive(thiserror::Error, Debug)]
pub enum MipsError {
    /// An error originating from the DebugProbe
    #[error("Debug Probe Error")]
    DebugProbe(#[from] DebugProbeError),
    /// The core did not request a processor access in time.
    #[error("Timeout while waiting for a processor access. Is the core in debug mode?")]
    PraccTimeout,
    /// The processor access protocol failed.
    #[error("Processor access failed: {0}")]
    Pracc(#[from] PraccError),
    /// A fastdata transfer failed.
    #[error("Fastdata transfer failed: {0}")]
    Fastdata(#[from] FastdataError),
    /// The core implements the 64 bit architecture.
    #[error("MIPS64 cores are not supported")]
    Unsupported64Bit,
    #[error("The {0:?} instruction set is not supported in debug mode")]
    UnsupportedInstructionSet(InstructionSet),
    #[error("Unsupported architecture release {0} in Config.AR")]
    UnsupportedRelease(u32),
    #[error("Cache line size {0} is not a power of two")]
    InvalidCacheLineSize(u32),
    /// DeSave holds the spilled `$15` of every injected program.
    #[error("CP0 register ({0}, {1}) is reserved for the debugger")]
    ReservedRegister(u8, u8),
    /// Only `$8`..`$10` have a snapshot to restore from.
    #[error("${0} is not a restorable scratch register")]
    NotAScratchRegister(u8),
    #[error(transparent)]
    InvalidDataLength(#[from] InvalidDataLengthError),
    #[error(transparent)]
    MemoryNotAligned(#[from] MemoryNotAlignedError),
    /// The requested result was not captured by the last batch.
    #[error("The result of a batched scan is not available")]
    BatchedResultNotAvailable,
    /// A scan returned a result of an unexpected kind.
    #[error("Unexpected scan result")]
    UnexpectedScanResult,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MipsError {
    /// Recovers the MIPS error of a failed probe batch.
    pub(crate) fn from_batch(error: crate::Error) -> Self {
        match error {
            crate::Error::Probe(e) => MipsError::DebugProbe(e),
            crate::Error::Mips(e) => e,
            other => MipsError::Other(anyhow::Error::new(other)),
        }
    }
}

/// Session state of the engine that outlives a single [`MipsCommunicationInterface`].
#[derive(Debug)]
pub struct MipsSessionState {
    config: EjtagConfig,
    mode: ExecutionMode,

    /// The values of `$8`, `$9` and `$10` the core held when it entered debug mode.
    scratch: Option<[u32; 3]>,

    /// A batch failed; the core has to be brought back to the text start and
    /// the scratch registers restored before anything else runs.
    pending_recovery: bool,

    /// The fastdata handler currently present in the working area.
    fastdata_handler: Option<FastdataHandler>,

    diagnosing: bool,
}

impl MipsSessionState {
    pub fn new(config: EjtagConfig) -> Self {
        Self {
            mode: config.execution_mode,
            config,
            scratch: None,
            pending_recovery: false,
            fastdata_handler: None,
            diagnosing: false,
        }
    }

    pub fn config(&self) -> &EjtagConfig {
        &self.config
    }

    /// The execution mode the next queue runs in.
    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// The fastdata handler present in the working area, if it is still valid.
    pub fn fastdata_handler(&self) -> Option<FastdataHandler> {
        self.fastdata_handler
    }

    pub fn recovery_pending(&self) -> bool {
        self.pending_recovery
    }

    /// Downgrades the session after a failed batch.
    ///
    /// The session stays synchronous for its remaining lifetime. The next
    /// operation restores the scratch registers before doing anything else.
    pub fn on_batch_failure(&mut self) {
        self.mode = ExecutionMode::Synchronous;
        self.pending_recovery = true;
        self.fastdata_handler = None;
    }

    pub(super) fn set_fastdata_handler(&mut self, handler: FastdataHandler) {
        self.fastdata_handler = Some(handler);
    }

    pub(super) fn forget_fastdata_handler(&mut self) {
        self.fastdata_handler = None;
    }

    fn scratch_value(&self, snapshot: [u32; 3], reg: u8) -> Result<u32, MipsError> {
        match reg {
            T0 => Ok(snapshot[0]),
            T1 => Ok(snapshot[1]),
            T2 => Ok(snapshot[2]),
            other => Err(MipsError::NotAScratchRegister(other)),
        }
    }
}

/// State of the EJTAG TAP and the engine, kept across reconnects of the probe.
#[derive(Debug)]
pub struct MipsDebugInterfaceState {
    ejtag_state: EjtagState,
    interface_state: MipsSessionState,
}

impl MipsDebugInterfaceState {
    pub fn new(config: EjtagConfig) -> Self {
        Self {
            ejtag_state: EjtagState::default(),
            interface_state: MipsSessionState::new(config),
        }
    }

    pub fn session(&self) -> &MipsSessionState {
        &self.interface_state
    }

    pub fn ejtag(&self) -> &EjtagState {
        &self.ejtag_state
    }
}

/// A capture of a store which is read once the next access is seen.
#[derive(Debug)]
struct PendingStore {
    slot: usize,
    index: DeferredResultIndex,
}

/// A interface that implements controls for MIPS32 cores through EJTAG.
#[derive(Debug)]
pub struct MipsCommunicationInterface<'state> {
    pub(super) ejtag: Ejtag<'state>,
    pub(super) state: &'state mut MipsSessionState,
}

impl<'state> MipsCommunicationInterface<'state> {
    /// Create the MIPS communication interface using the underlying probe driver
    pub fn new(
        probe: &'state mut dyn JtagAccess,
        state: &'state mut MipsDebugInterfaceState,
    ) -> Result<Self, MipsError> {
        let instruction_set = state.interface_state.config.instruction_set;
        if instruction_set != InstructionSet::Mips32 {
            return Err(MipsError::UnsupportedInstructionSet(instruction_set));
        }

        let mut interface = Self {
            ejtag: Ejtag::new(probe, &mut state.ejtag_state),
            state: &mut state.interface_state,
        };

        interface.ejtag.init()?;

        Ok(interface)
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.state.mode
    }

    pub(crate) fn config(&self) -> &EjtagConfig {
        &self.state.config
    }

    /// Runs `queue` on the core and returns the words it stored to the
    /// parameter output window, indexed by `(address - PARAM_OUT) / 4`.
    pub(crate) fn execute_queue(&mut self, queue: &PraccQueue) -> Result<Vec<u32>, MipsError> {
        queue.check()?;
        self.recover_if_needed()?;

        // Without a snapshot, a failed batch could not be cleaned up.
        if self.state.mode == ExecutionMode::Batched && self.state.scratch.is_some() {
            self.execute_batched(queue)
        } else {
            self.execute_sync(queue)
        }
    }

    fn execute_sync(&mut self, queue: &PraccQueue) -> Result<Vec<u32>, MipsError> {
        let timeout = self.state.config.pracc_timeout();
        let mut executor = SyncExecutor::new(queue);
        let mut output = vec![0; queue.output_len()];
        let mut pending_store: Option<PendingStore> = None;

        loop {
            let access = self.ejtag.wait_for_processor_access(timeout)?;

            if let Some(store) = pending_store.take() {
                output[store.slot] = self.ejtag.read_data_result(store.index)?;
            }

            match executor.step(access) {
                Ok(Action::Fetch(instruction)) => {
                    self.ejtag.schedule_data_write(instruction);
                    self.ejtag.schedule_finish();
                }
                Ok(Action::Store { slot }) => {
                    let index = self.ejtag.schedule_data_read();
                    self.ejtag.schedule_finish();
                    pending_store = Some(PendingStore { slot, index });
                }
                Ok(Action::Complete) => break,
                Err(error) => {
                    self.handle_fatal(&error, executor.restarts());
                    return Err(error.into());
                }
            }
        }

        Ok(output)
    }

    fn execute_batched(&mut self, queue: &PraccQueue) -> Result<Vec<u32>, MipsError> {
        let Some(plan) = batch::plan(queue) else {
            tracing::debug!("Queue ends with a store, running it synchronously");
            return self.execute_sync(queue);
        };

        let captures = match self.shift_batch(&plan) {
            Ok(captures) => captures,
            Err(error) => {
                self.state.on_batch_failure();
                return Err(error);
            }
        };

        let error = match batch::verify_batch(queue, &plan, &captures) {
            Ok(output) => return Ok(output),
            Err(error) => error,
        };

        tracing::warn!("Batched execution failed: {error}. Continuing synchronously");
        self.state.on_batch_failure();
        self.recover_if_needed()?;

        if error == PraccError::UnexpectedReturnToText {
            // The handler was restarted behind our back. Run the program once
            // more; a second restart is reported by the synchronous executor.
            return self.execute_sync(queue);
        }

        Err(error.into())
    }

    fn shift_batch(&mut self, plan: &[PlannedScan]) -> Result<Vec<AllScan>, MipsError> {
        let indices: Vec<DeferredResultIndex> = plan
            .iter()
            .map(|planned| self.ejtag.schedule_all(planned.scan))
            .collect();

        self.ejtag.execute()?;

        indices
            .into_iter()
            .map(|index| self.ejtag.read_all_result(index))
            .collect()
    }

    fn recover_if_needed(&mut self) -> Result<(), MipsError> {
        if !self.state.pending_recovery {
            return Ok(());
        }

        self.state.pending_recovery = false;
        tracing::info!("Restoring the core after a failed batch");

        let result = self
            .clean_text_jump()
            .and_then(|_| self.restore_scratch_registers(T0, T2));

        if result.is_err() {
            self.state.pending_recovery = true;
        }

        result
    }

    /// Brings the core back to the text start, whatever it was executing.
    ///
    /// The address of the first exchanges is not checked: the core may be
    /// anywhere in the debug segment, and stores are simply completed.
    pub(crate) fn clean_text_jump(&mut self) -> Result<(), MipsError> {
        let timeout = self.state.config.pracc_timeout();

        for instruction in [NOP, NOP, NOP, assembly::j(PRACC_TEXT), NOP] {
            let access = self.ejtag.wait_for_processor_access(timeout)?;
            if !access.is_write() {
                self.ejtag.schedule_data_write(instruction);
            }
            self.ejtag.schedule_finish();
        }

        for _ in 0..2 {
            let access = self.ejtag.wait_for_processor_access(timeout)?;
            if access.address == PRACC_TEXT && !access.is_write() {
                return Ok(());
            }

            // Flush a stale access out of the pipeline.
            if !access.is_write() {
                self.ejtag.schedule_data_write(NOP);
            }
            self.ejtag.schedule_finish();
        }

        let access = self.ejtag.wait_for_processor_access(timeout)?;
        if access.address == PRACC_TEXT && !access.is_write() {
            Ok(())
        } else {
            Err(PraccError::Desync {
                expected: PRACC_TEXT,
                actual: access.address,
            }
            .into())
        }
    }

    /// Logs what the core was doing and leaves it in a sane state after a
    /// protocol error. Failures here are only logged.
    fn handle_fatal(&mut self, error: &PraccError, restarts: usize) {
        if self.state.diagnosing {
            return;
        }

        tracing::error!(
            "Processor access failed after {restarts} restarts: {error}. Last access: {:?}",
            self.ejtag.last_access()
        );

        self.state.diagnosing = true;
        if let Err(e) = self.log_debug_state() {
            tracing::debug!("Unable to read the debug state of the core: {e}");
        }
        self.state.diagnosing = false;
    }

    fn log_debug_state(&mut self) -> Result<(), MipsError> {
        self.clean_text_jump()?;

        if self.state.scratch.is_none() {
            return Ok(());
        }

        let debug_register = DebugRegister(self.read_cp0(CP0_DEBUG.reg, CP0_DEBUG.sel)?);
        let depc = self.read_cp0(CP0_DEPC.reg, CP0_DEPC.sel)?;
        tracing::error!("Debug: {:?}, DEPC: 0x{:08X}", debug_register, depc);

        self.restore_scratch_registers(T0, T2)
    }

    /// The values of `$8`..`$10` before the engine touched them, read from
    /// the core if they are not known yet.
    pub(crate) fn scratch_snapshot(&mut self) -> Result<[u32; 3], MipsError> {
        if let Some(snapshot) = self.state.scratch {
            return Ok(snapshot);
        }

        let regs = self.read_registers()?;
        Ok([regs.gpr(T0), regs.gpr(T1), regs.gpr(T2)])
    }

    /// Reloads `$first`..=`$last` from the snapshot and restores `$15` from DeSave.
    pub fn restore_scratch_registers(&mut self, first: u8, last: u8) -> Result<(), MipsError> {
        let snapshot = self.scratch_snapshot()?;

        let mut queue = PraccQueue::new();
        for reg in first..=last {
            let value = self.state.scratch_value(snapshot, reg)?;
            queue.add_immediate_load(reg, value, true);
        }
        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        self.execute_queue(&queue)?;

        Ok(())
    }

    /// Reads the general purpose registers and the CP0 state saved on debug entry.
    pub fn read_registers(&mut self) -> Result<RegisterFile, MipsError> {
        let out = |index: usize| PRACC_PARAM_OUT + 4 * index as u32;
        let offset = |index: usize| (PRACC_OUT_OFFSET as usize + 4 * index) as i16;

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add(assembly::lui(T7, PRACC_UPPER_BASE));

        for reg in 0..GPR_COUNT {
            if reg == T7 as usize {
                continue;
            }
            queue.add_with_store(out(reg), assembly::sw(reg as u8, offset(reg), T7));
        }

        let special = [
            (STATUS_INDEX, mfc0_t0(CP0_STATUS)),
            (LO_INDEX, assembly::mflo(T0)),
            (HI_INDEX, assembly::mfhi(T0)),
            (BADVADDR_INDEX, mfc0_t0(CP0_BADVADDR)),
            (CAUSE_INDEX, mfc0_t0(CP0_CAUSE)),
            (PC_INDEX, mfc0_t0(CP0_DEPC)),
            (T7 as usize, mfc0_t0(CP0_DESAVE)),
        ];

        for (index, instruction) in special {
            queue.add(instruction);
            queue.add_with_store(out(index), assembly::sw(T0, offset(index), T7));
        }

        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        let output = self.execute_queue(&queue)?;
        let words: [u32; REGISTER_FILE_LEN] = output
            .try_into()
            .map_err(|_| MipsError::UnexpectedScanResult)?;
        let regs = RegisterFile(words);

        self.state.scratch = Some([regs.gpr(T0), regs.gpr(T1), regs.gpr(T2)]);
        self.restore_scratch_registers(T0, T0)?;

        Ok(regs)
    }

    /// Writes the general purpose registers and the CP0 state restored on debug exit.
    ///
    /// BadVAddr is read-only and not written.
    pub fn write_registers(&mut self, regs: &RegisterFile) -> Result<(), MipsError> {
        let mut queue = PraccQueue::new();

        for reg in 2..GPR_COUNT as u8 {
            queue.add_immediate_load(reg, regs.gpr(reg), true);
        }

        let special = [
            (regs.status(), mtc0_at(CP0_STATUS)),
            (regs.lo(), assembly::mtlo(AT)),
            (regs.hi(), assembly::mthi(AT)),
            (regs.cause(), mtc0_at(CP0_CAUSE)),
            (regs.pc(), mtc0_at(CP0_DEPC)),
        ];

        for (value, instruction) in special {
            queue.add_immediate_load(AT, value, false);
            queue.add(instruction);
        }

        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add(assembly::lui(AT, upper16(regs.gpr(AT))));
        queue.add_return(assembly::ori(AT, AT, lower16(regs.gpr(AT))));

        self.execute_queue(&queue)?;

        self.state.scratch = Some([regs.gpr(T0), regs.gpr(T1), regs.gpr(T2)]);

        Ok(())
    }

    /// Reads the coprocessor 0 register `reg` with select `sel`.
    pub fn read_cp0(&mut self, reg: u8, sel: u8) -> Result<u32, MipsError> {
        self.read_through_t0(assembly::mfc0(T0, reg, sel))
    }

    /// Runs `instruction`, which leaves a value in `$8`, and returns that value.
    pub(crate) fn read_through_t0(&mut self, instruction: u32) -> Result<u32, MipsError> {
        let [t0, _, _] = self.scratch_snapshot()?;

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add(assembly::lui(T7, PRACC_UPPER_BASE));
        queue.add(instruction);
        queue.add_with_store(
            PRACC_PARAM_OUT,
            assembly::sw(T0, PRACC_OUT_OFFSET as i16, T7),
        );
        queue.add(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add(assembly::lui(T0, upper16(t0)));
        queue.add_return(assembly::ori(T0, T0, lower16(t0)));

        let output = self.execute_queue(&queue)?;

        output
            .first()
            .copied()
            .ok_or(MipsError::UnexpectedScanResult)
    }

    /// Writes `value` to the coprocessor 0 register `reg` with select `sel`.
    pub fn write_cp0(&mut self, reg: u8, sel: u8, value: u32) -> Result<(), MipsError> {
        if Cp0Register::new(reg, sel) == CP0_DESAVE {
            return Err(MipsError::ReservedRegister(reg, sel));
        }

        let mut queue = PraccQueue::new();
        queue.add(assembly::mtc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));
        queue.add_immediate_load(T7, value, true);
        queue.add(assembly::mtc0(T7, reg, sel));
        queue.add_return(assembly::mfc0(T7, CP0_DESAVE.reg, CP0_DESAVE.sel));

        self.execute_queue(&queue)?;

        Ok(())
    }
}

fn mfc0_t0(register: Cp0Register) -> u32 {
    assembly::mfc0(T0, register.reg, register.sel)
}

fn mtc0_at(register: Cp0Register) -> u32 {
    assembly::mtc0(AT, register.reg, register.sel)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::probe::fake_probe::FakeProbe;
    use pretty_assertions::assert_eq;

    #[test]
    fn batch_failure_downgrades_for_good() {
        let mut state = MipsSessionState::new(EjtagConfig {
            execution_mode: ExecutionMode::Batched,
            ..Default::default()
        });
        assert_eq!(state.execution_mode(), ExecutionMode::Batched);

        state.on_batch_failure();

        assert_eq!(state.execution_mode(), ExecutionMode::Synchronous);
        assert!(state.recovery_pending());
    }

    #[test]
    fn scratch_registers_map_to_snapshot() {
        let state = MipsSessionState::new(EjtagConfig::default());
        let snapshot = [1, 2, 3];

        assert_eq!(state.scratch_value(snapshot, T1).unwrap(), 2);
        assert!(matches!(
            state.scratch_value(snapshot, T7),
            Err(MipsError::NotAScratchRegister(15))
        ));
    }

    #[test]
    fn micromips_is_rejected() {
        let mut probe = FakeProbe::new();
        let mut state = MipsDebugInterfaceState::new(EjtagConfig {
            instruction_set: InstructionSet::MicroMips,
            ..Default::default()
        });

        assert!(matches!(
            MipsCommunicationInterface::new(&mut probe, &mut state),
            Err(MipsError::UnsupportedInstructionSet(InstructionSet::MicroMips))
        ));
    }

    #[test]
    fn desave_is_reserved() {
        let mut probe = FakeProbe::new();
        let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
        let mut interface = MipsCommunicationInterface::new(&mut probe, &mut state).unwrap();

        assert!(matches!(
            interface.write_cp0(31, 0, 0),
            Err(MipsError::ReservedRegister(31, 0))
        ));
    }

    #[test]
    fn clean_text_jump_from_the_text_start() {
        let mut probe = FakeProbe::new();
        let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
        let mut interface = MipsCommunicationInterface::new(&mut probe, &mut state).unwrap();

        interface.clean_text_jump().unwrap();
    }

    #[test]
    fn cp0_round_trip() {
        let mut probe = FakeProbe::new();
        probe.core_mut().set_cp0(CP0_STATUS.reg, CP0_STATUS.sel, 0x0040_0004);
        probe.core_mut().set_gpr(T0, 0x1234_5678);
        let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
        let mut interface = MipsCommunicationInterface::new(&mut probe, &mut state).unwrap();

        assert_eq!(interface.read_cp0(12, 0).unwrap(), 0x0040_0004);
        interface.write_cp0(12, 0, 0x0040_0001).unwrap();
        assert_eq!(interface.read_cp0(12, 0).unwrap(), 0x0040_0001);

        drop(interface);
        assert_eq!(probe.core().gpr(T0), 0x1234_5678);
        assert_eq!(probe.core().pending_address(), Some(PRACC_TEXT));
    }
}
