//! The batched executor.
//!
//! Every exchange of a program is planned up front and shifted through the
//! ALL register in one go. The captured control, data and address words are
//! checked afterwards against the order the core must have followed.

use crate::architecture::mips::ejtag::{AllScan, EjtagControl, PRACC_TEXT};

use super::{output_slot, PraccError, PraccQueue};

/// The processor access an exchange is planned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// Fetch of the instruction at this index.
    Fetch { index: usize },
    /// Store done by the instruction at this index.
    Store { index: usize },
    /// The final fetch from the text start, observed but left pending.
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedScan {
    pub kind: ScanKind,
    pub scan: AllScan,
}

/// Plans the exchanges for `queue`.
///
/// The store of an instruction is presented by the core after the fetch of
/// the following instruction. Returns `None` if the last instruction stores,
/// as that store would only show up after the return to the text start.
pub fn plan(queue: &PraccQueue) -> Option<Vec<PlannedScan>> {
    let entries = queue.entries();

    if entries.last()?.store_address.is_some() {
        return None;
    }

    let finish = EjtagControl::finish().0;
    let mut scans = Vec::with_capacity(entries.len() + queue.store_count() + 1);

    for (index, entry) in entries.iter().enumerate() {
        scans.push(PlannedScan {
            kind: ScanKind::Fetch { index },
            scan: AllScan {
                control: finish,
                data: entry.instruction,
                address: 0,
            },
        });

        if index > 0 && entries[index - 1].store_address.is_some() {
            scans.push(PlannedScan {
                kind: ScanKind::Store { index: index - 1 },
                scan: AllScan {
                    control: finish,
                    data: 0,
                    address: 0,
                },
            });
        }
    }

    scans.push(PlannedScan {
        kind: ScanKind::Return,
        scan: AllScan {
            control: EjtagControl::base().0,
            data: 0,
            address: 0,
        },
    });

    Some(scans)
}

/// Checks the captured exchanges of a batch against its plan and collects the
/// stored values.
pub fn verify_batch(
    queue: &PraccQueue,
    plan: &[PlannedScan],
    captures: &[AllScan],
) -> Result<Vec<u32>, PraccError> {
    let mut output = vec![0; queue.output_len()];

    for (planned, captured) in plan.iter().zip(captures) {
        let access = captured.access();
        let address = access.address;

        if !access.control.pracc() {
            return Err(PraccError::NoPendingAccess);
        }

        match planned.kind {
            ScanKind::Fetch { index } => {
                if access.is_write() {
                    return Err(PraccError::UnexpectedDirection { address });
                }

                let expected = PRACC_TEXT + 4 * index as u32;
                if address != expected {
                    if address == PRACC_TEXT {
                        return Err(PraccError::UnexpectedReturnToText);
                    }
                    return Err(PraccError::Desync {
                        expected,
                        actual: address,
                    });
                }
            }
            ScanKind::Store { index } => {
                if !access.is_write() {
                    if address == PRACC_TEXT {
                        return Err(PraccError::UnexpectedReturnToText);
                    }
                    return Err(PraccError::Desync {
                        expected: queue.entries()[index].store_address.unwrap_or_default(),
                        actual: address,
                    });
                }

                let expected = queue.entries()[index].store_address.unwrap_or_default();
                if address != expected {
                    return Err(PraccError::StoreMismatch {
                        expected,
                        actual: address,
                    });
                }

                output[output_slot(address)] = captured.data;
            }
            ScanKind::Return => {
                if access.is_write() || address != PRACC_TEXT {
                    return Err(PraccError::NoReturnToText(address));
                }
            }
        }
    }

    if captures.len() < plan.len() {
        return Err(PraccError::NoPendingAccess);
    }

    Ok(output)
}
