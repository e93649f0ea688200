//! The synchronous executor.
//!
//! The core gives no acknowledgement of what it executed, so progress is
//! inferred from the address and direction of each processor access. The
//! state machine below only decides what to do with an observed access; the
//! scans themselves are done by the communication interface.

use crate::architecture::mips::assembly::{self, NOP};
use crate::architecture::mips::ejtag::{ProcessorAccess, PRACC_PARAM_OUT, PRACC_TEXT};

use super::{output_slot, PraccError, PraccQueue};

/// Number of times the program may be restarted after a fetch mismatch.
pub(crate) const MAX_RESTARTS: usize = 3;

/// Padding fetches served after a return to the text start while stores are outstanding.
const MAX_PASSED_FETCHES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Nothing fetched yet.
    Init,
    /// Feeding the program.
    Executing,
    /// The program was fed completely, waiting for the return to the text start.
    FinalCheck,
    /// Returned to the text start while stores were still outstanding.
    Passed,
}

/// What to do with the current processor access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Serve the fetch with this instruction.
    Fetch(u32),
    /// Capture the stored value into this output slot.
    Store { slot: usize },
    /// The program ran completely. The fetch at the text start is left pending.
    Complete,
}

/// Why a `j` to the text start was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Jump {
    Restart,
    Return,
}

#[derive(Debug)]
pub struct SyncExecutor<'q> {
    queue: &'q PraccQueue,
    state: ExecutorState,
    /// Fetches served in the current phase.
    code_count: usize,
    /// Stores of fetched instructions that were not seen yet.
    store_pending: usize,
    /// Highest store address of the instructions fetched so far.
    max_store_address: Option<u32>,
    restarts: usize,
    resynced: bool,
    /// A jump to the text start was served; the next fetch is its delay slot.
    jump: Option<Jump>,
}

impl<'q> SyncExecutor<'q> {
    pub fn new(queue: &'q PraccQueue) -> Self {
        Self {
            queue,
            state: ExecutorState::Init,
            code_count: 0,
            store_pending: 0,
            max_store_address: None,
            restarts: 0,
            resynced: false,
            jump: None,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Decides how to serve `access`.
    pub fn step(&mut self, access: ProcessorAccess) -> Result<Action, PraccError> {
        // Fetches take priority, a store is only ever taken from the direction bit.
        if access.is_write() {
            self.store(access.address)
        } else {
            self.fetch(access.address)
        }
    }

    fn store(&mut self, address: u32) -> Result<Action, PraccError> {
        if self.store_pending == 0 {
            return Err(PraccError::UnexpectedStore { address });
        }

        let in_range = self
            .max_store_address
            .is_some_and(|max| (PRACC_PARAM_OUT..=max).contains(&address));

        if !in_range || address % 4 != 0 {
            return Err(PraccError::StoreOutOfRange { address });
        }

        self.store_pending -= 1;

        Ok(Action::Store {
            slot: output_slot(address),
        })
    }

    fn fetch(&mut self, address: u32) -> Result<Action, PraccError> {
        if let Some(jump) = self.jump.take() {
            match jump {
                Jump::Restart => {
                    self.state = ExecutorState::Init;
                    self.code_count = 0;
                    self.forget_stores();
                }
                Jump::Return => {
                    self.state = ExecutorState::FinalCheck;
                    self.code_count = self.queue.len();
                }
            }

            return Ok(Action::Fetch(NOP));
        }

        match self.state {
            ExecutorState::Init | ExecutorState::Executing => self.fetch_code(address),
            ExecutorState::FinalCheck => self.final_check(address),
            ExecutorState::Passed => self.passed(address),
        }
    }

    fn fetch_code(&mut self, address: u32) -> Result<Action, PraccError> {
        let expected = PRACC_TEXT + 4 * self.code_count as u32;

        if address != expected {
            if self.code_count == 1 && address == PRACC_TEXT && !self.resynced {
                tracing::debug!("Core fetched the text start again, resynchronizing");
                self.resynced = true;
                self.code_count = 0;
                self.forget_stores();
            } else {
                return self.restart(expected, address);
            }
        }

        self.state = ExecutorState::Executing;

        let entry = self.queue.entries()[self.code_count];
        if let Some(store_address) = entry.store_address {
            self.store_pending += 1;
            self.max_store_address = Some(
                self.max_store_address
                    .map_or(store_address, |max| max.max(store_address)),
            );
        }
        self.code_count += 1;

        if self.code_count == self.queue.len() {
            self.state = ExecutorState::FinalCheck;
        }

        Ok(Action::Fetch(entry.instruction))
    }

    fn forget_stores(&mut self) {
        self.store_pending = 0;
        self.max_store_address = None;
    }

    /// Fetches past the program must still follow each other.
    fn check_sequential(&self, address: u32) -> Result<(), PraccError> {
        let expected = PRACC_TEXT + 4 * self.code_count as u32;
        if address != expected {
            return Err(PraccError::Desync {
                expected,
                actual: address,
            });
        }
        Ok(())
    }

    fn restart(&mut self, expected: u32, actual: u32) -> Result<Action, PraccError> {
        // From the second instruction on, $15 may no longer match DeSave, and
        // running the first instruction again would overwrite the spill.
        if self.code_count >= 2 {
            return Err(PraccError::Desync { expected, actual });
        }

        if self.restarts >= MAX_RESTARTS {
            return Err(PraccError::RestartLimitExceeded {
                restarts: self.restarts,
                expected,
                actual,
            });
        }

        self.restarts += 1;
        tracing::warn!(
            "Fetch from 0x{:08X}, expected 0x{:08X}. Restarting ({}/{})",
            actual,
            expected,
            self.restarts,
            MAX_RESTARTS
        );

        self.jump = Some(Jump::Restart);
        Ok(Action::Fetch(assembly::j(PRACC_TEXT)))
    }

    fn final_check(&mut self, address: u32) -> Result<Action, PraccError> {
        if address == PRACC_TEXT {
            if self.store_pending == 0 {
                return Ok(Action::Complete);
            }

            tracing::debug!(
                "Returned to the text start with {} stores outstanding",
                self.store_pending
            );
            self.state = ExecutorState::Passed;
            self.code_count = 1;
            return Ok(Action::Fetch(NOP));
        }

        self.check_sequential(address)?;

        if self.code_count - self.queue.len() > 1 {
            return Err(PraccError::NoReturnToText(address));
        }

        self.code_count += 1;
        Ok(Action::Fetch(NOP))
    }

    fn passed(&mut self, address: u32) -> Result<Action, PraccError> {
        if address == PRACC_TEXT {
            return Err(PraccError::UnexpectedReturnToText);
        }

        self.check_sequential(address)?;

        if self.store_pending == 0 {
            // Park the core at the text start again.
            self.jump = Some(Jump::Return);
            return Ok(Action::Fetch(assembly::j(PRACC_TEXT)));
        }

        if self.code_count > MAX_PASSED_FETCHES {
            return Err(PraccError::NoReturnToText(address));
        }

        self.code_count += 1;
        Ok(Action::Fetch(NOP))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::architecture::mips::assembly::{lui, mfc0, mtc0, sw};
    use crate::architecture::mips::ejtag::EjtagControl;
    use pretty_assertions::assert_eq;

    fn fetch(address: u32) -> ProcessorAccess {
        ProcessorAccess {
            control: EjtagControl::base(),
            address,
        }
    }

    fn store(address: u32) -> ProcessorAccess {
        let mut control = EjtagControl::base();
        control.set_prnw(true);
        ProcessorAccess { control, address }
    }

    fn text(index: u32) -> u32 {
        PRACC_TEXT + 4 * index
    }

    /// mtc0 $15, DeSave; lui $15, 0xff20; sw $8, 0x2004($15); b start; mfc0 $15, DeSave
    fn store_program() -> PraccQueue {
        let mut queue = PraccQueue::new();
        queue.add(mtc0(15, 31, 0));
        queue.add(lui(15, 0xFF20));
        queue.add_with_store(PRACC_PARAM_OUT + 4, sw(8, 0x2004, 15));
        queue.add_return(mfc0(15, 31, 0));
        queue
    }

    #[test]
    fn runs_program_in_order() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        assert_eq!(exec.state(), ExecutorState::Init);
        for i in 0..4 {
            assert_eq!(
                exec.step(fetch(text(i))),
                Ok(Action::Fetch(queue.instruction(i as usize)))
            );
        }
        assert_eq!(exec.state(), ExecutorState::Executing);

        // The store of the third instruction shows up after the next fetch.
        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 4)),
            Ok(Action::Store { slot: 1 })
        );
        assert_eq!(exec.step(fetch(text(4))), Ok(Action::Fetch(queue.instruction(4))));
        assert_eq!(exec.state(), ExecutorState::FinalCheck);

        assert_eq!(exec.step(fetch(PRACC_TEXT)), Ok(Action::Complete));
        assert_eq!(exec.restarts(), 0);
    }

    #[test]
    fn rejects_store_before_any_fetch() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 4)),
            Err(PraccError::UnexpectedStore {
                address: PRACC_PARAM_OUT + 4
            })
        );
    }

    #[test]
    fn rejects_store_when_none_pending() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        // Only mtc0 was fetched, the store instruction was not.
        exec.step(fetch(text(0))).unwrap();
        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 4)),
            Err(PraccError::UnexpectedStore {
                address: PRACC_PARAM_OUT + 4
            })
        );

        for i in 1..4 {
            exec.step(fetch(text(i))).unwrap();
        }
        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 4)).unwrap(),
            Action::Store { slot: 1 }
        );
        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 4)),
            Err(PraccError::UnexpectedStore {
                address: PRACC_PARAM_OUT + 4
            })
        );
    }

    #[test]
    fn restart_forgets_fetched_stores() {
        // sw $8, 0x2000($15) as the first instruction, then a bogus fetch.
        let mut queue = PraccQueue::new();
        queue.add_with_store(PRACC_PARAM_OUT, sw(8, 0x2000, 15));
        queue.add_return(NOP);
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(0xFF20_0340)).unwrap();
        exec.step(fetch(0xFF20_0344)).unwrap();
        assert_eq!(exec.state(), ExecutorState::Init);

        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT)),
            Err(PraccError::UnexpectedStore {
                address: PRACC_PARAM_OUT
            })
        );
    }

    #[test]
    fn rejects_store_outside_output_range() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        for i in 0..4 {
            exec.step(fetch(text(i))).unwrap();
        }

        assert_eq!(
            exec.step(store(PRACC_PARAM_OUT + 8)),
            Err(PraccError::StoreOutOfRange {
                address: PRACC_PARAM_OUT + 8
            })
        );
        assert_eq!(
            exec.step(store(PRACC_TEXT)),
            Err(PraccError::StoreOutOfRange {
                address: PRACC_TEXT
            })
        );
    }

    #[test]
    fn single_free_resynchronization() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        // The core went back to the text start once, this is not a restart.
        assert_eq!(
            exec.step(fetch(text(0))),
            Ok(Action::Fetch(queue.instruction(0)))
        );
        exec.step(fetch(text(1))).unwrap();
        assert_eq!(exec.restarts(), 0);
    }

    #[test]
    fn second_resynchronization_restarts() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(text(0))).unwrap();

        assert_eq!(
            exec.step(fetch(text(0))),
            Ok(Action::Fetch(assembly::j(PRACC_TEXT)))
        );
        assert_eq!(exec.restarts(), 1);
    }

    #[test]
    fn restart_is_bounded() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);
        let bogus = 0xFF20_0340;

        for attempt in 1..=MAX_RESTARTS {
            assert_eq!(exec.step(fetch(text(0))).unwrap(), Action::Fetch(queue.instruction(0)));
            assert_eq!(
                exec.step(fetch(bogus)),
                Ok(Action::Fetch(assembly::j(PRACC_TEXT)))
            );
            assert_eq!(exec.restarts(), attempt);
            // delay slot of the jump
            assert_eq!(exec.step(fetch(bogus + 4)), Ok(Action::Fetch(NOP)));
            assert_eq!(exec.state(), ExecutorState::Init);
        }

        exec.step(fetch(text(0))).unwrap();
        assert_eq!(
            exec.step(fetch(bogus)),
            Err(PraccError::RestartLimitExceeded {
                restarts: 3,
                expected: text(1),
                actual: bogus,
            })
        );
    }

    #[test]
    fn no_restart_after_scratch_register_changed() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(text(1))).unwrap();

        assert_eq!(
            exec.step(fetch(text(5))),
            Err(PraccError::Desync {
                expected: text(2),
                actual: text(5)
            })
        );
    }

    #[test]
    fn store_after_return_to_text() {
        // b start; sw $8, 0x2000($15) in the delay slot
        let mut queue = PraccQueue::new();
        queue.add(assembly::b(-1));
        queue.add_with_store(PRACC_PARAM_OUT, sw(8, 0x2000, 15));
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(text(1))).unwrap();

        assert_eq!(exec.step(fetch(PRACC_TEXT)), Ok(Action::Fetch(NOP)));
        assert_eq!(exec.state(), ExecutorState::Passed);
        assert_eq!(exec.step(store(PRACC_PARAM_OUT)), Ok(Action::Store { slot: 0 }));

        // Stores drained, the executor jumps back to the text start.
        assert_eq!(
            exec.step(fetch(text(1))),
            Ok(Action::Fetch(assembly::j(PRACC_TEXT)))
        );
        assert_eq!(exec.step(fetch(text(2))), Ok(Action::Fetch(NOP)));
        assert_eq!(exec.step(fetch(PRACC_TEXT)), Ok(Action::Complete));
    }

    #[test]
    fn second_return_to_text_is_an_error() {
        let mut queue = PraccQueue::new();
        queue.add(assembly::b(-1));
        queue.add_with_store(PRACC_PARAM_OUT, sw(8, 0x2000, 15));
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(text(1))).unwrap();
        exec.step(fetch(PRACC_TEXT)).unwrap();

        assert_eq!(
            exec.step(fetch(PRACC_TEXT)),
            Err(PraccError::UnexpectedReturnToText)
        );
    }

    #[test]
    fn missing_return_to_text() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        for i in 0..3 {
            exec.step(fetch(text(i))).unwrap();
        }
        exec.step(store(PRACC_PARAM_OUT + 4)).unwrap();
        exec.step(fetch(text(3))).unwrap();
        exec.step(fetch(text(4))).unwrap();

        // Two padding fetches are tolerated.
        assert_eq!(exec.step(fetch(text(5))), Ok(Action::Fetch(NOP)));
        assert_eq!(exec.step(fetch(text(6))), Ok(Action::Fetch(NOP)));
        assert_eq!(
            exec.step(fetch(text(7))),
            Err(PraccError::NoReturnToText(text(7)))
        );
    }

    #[test]
    fn fetch_after_program_must_be_sequential() {
        let queue = store_program();
        let mut exec = SyncExecutor::new(&queue);

        for i in 0..4 {
            exec.step(fetch(text(i))).unwrap();
        }
        exec.step(store(PRACC_PARAM_OUT + 4)).unwrap();
        exec.step(fetch(text(4))).unwrap();
        assert_eq!(exec.state(), ExecutorState::FinalCheck);

        assert_eq!(
            exec.step(fetch(0x8000_0000)),
            Err(PraccError::Desync {
                expected: text(5),
                actual: 0x8000_0000
            })
        );
    }

    #[test]
    fn fetch_while_stores_outstanding_must_be_sequential() {
        let mut queue = PraccQueue::new();
        queue.add(assembly::b(-1));
        queue.add_with_store(PRACC_PARAM_OUT, sw(8, 0x2000, 15));
        let mut exec = SyncExecutor::new(&queue);

        exec.step(fetch(text(0))).unwrap();
        exec.step(fetch(text(1))).unwrap();
        exec.step(fetch(PRACC_TEXT)).unwrap();
        assert_eq!(exec.state(), ExecutorState::Passed);

        assert_eq!(
            exec.step(fetch(text(3))),
            Err(PraccError::Desync {
                expected: text(1),
                actual: text(3)
            })
        );
    }
}
