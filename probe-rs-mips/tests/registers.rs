use probe_rs_mips::architecture::mips::assembly;
use probe_rs_mips::architecture::mips::ejtag::PRACC_TEXT;
use probe_rs_mips::architecture::mips::registers::{
    BADVADDR_INDEX, CAUSE_INDEX, HI_INDEX, LO_INDEX, PC_INDEX, STATUS_INDEX,
};
use probe_rs_mips::architecture::mips::PraccError;
use probe_rs_mips::probe::fake_probe::FakeProbe;
use probe_rs_mips::{
    EjtagConfig, MemoryInterface, MipsCommunicationInterface, MipsDebugInterfaceState, MipsError,
    RegisterFile,
};
use pretty_assertions::assert_eq;

/// Fills the core with recognizable values and returns what reading it should give.
fn populate(probe: &mut FakeProbe) -> RegisterFile {
    let core = probe.core_mut();
    let mut expected = RegisterFile::default();

    for reg in 1..32u8 {
        let value = 0x0101_0101u32.wrapping_mul(u32::from(reg)) ^ 0x8000_0000;
        core.set_gpr(reg, value);
        expected.set_gpr(reg, value);
    }

    core.set_lo(0x1111_0000);
    core.set_hi(0x0000_2222);
    core.set_cp0(12, 0, 0x1040_FF03);
    core.set_cp0(8, 0, 0xDEAD_0000);
    core.set_cp0(13, 0, 0x0080_0024);
    core.set_cp0(24, 0, 0x8002_0040);

    expected.0[STATUS_INDEX] = 0x1040_FF03;
    expected.0[LO_INDEX] = 0x1111_0000;
    expected.0[HI_INDEX] = 0x0000_2222;
    expected.0[BADVADDR_INDEX] = 0xDEAD_0000;
    expected.0[CAUSE_INDEX] = 0x0080_0024;
    expected.0[PC_INDEX] = 0x8002_0040;

    expected
}

#[test]
fn read_registers_leaves_core_untouched() {
    let mut probe = FakeProbe::new();
    let expected = populate(&mut probe);
    let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());

    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");
    let regs = interface.read_registers().expect("Failed to read registers");

    assert_eq!(regs, expected);

    for reg in [8, 9, 10, 15] {
        assert_eq!(probe.core().gpr(reg), expected.gpr(reg), "${reg} was clobbered");
    }
    assert_eq!(probe.core().cp0(31, 0), expected.gpr(15));
    assert_eq!(probe.core().pending_address(), Some(PRACC_TEXT));
}

#[test]
fn write_then_read_registers() {
    let mut probe = FakeProbe::new();
    let original = populate(&mut probe);
    let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");

    let mut regs = original;
    regs.set_gpr(1, 0x1234_5678);
    // Values loaded with a single instruction.
    regs.set_gpr(8, 0x8000_0000);
    regs.set_gpr(9, 0x0000_1234);
    regs.set_gpr(10, 0);
    regs.set_gpr(15, 0xA000_0010);
    regs.0[STATUS_INDEX] = 0x1040_0001;
    regs.0[LO_INDEX] = 0xFFFF_FFFF;
    regs.0[HI_INDEX] = 0x0000_0001;
    regs.0[CAUSE_INDEX] = 0x0000_0300;
    regs.set_pc(0x8000_0180);
    // Read-only, not written.
    regs.0[BADVADDR_INDEX] = 0x4444_4444;

    interface
        .write_registers(&regs)
        .expect("Failed to write registers");
    let read_back = interface.read_registers().expect("Failed to read registers");

    let mut expected = regs;
    expected.0[BADVADDR_INDEX] = original.bad_vaddr();
    assert_eq!(read_back, expected);

    let core = probe.core();
    assert_eq!(core.gpr(8), 0x8000_0000);
    assert_eq!(core.gpr(15), 0xA000_0010);
    assert_eq!(core.cp0(24, 0), 0x8000_0180);
    assert_eq!(core.lo(), 0xFFFF_FFFF);
}

#[test]
fn register_round_trip_leaves_memory_untouched() {
    let mut probe = FakeProbe::new();
    let original = populate(&mut probe);
    let words: Vec<u8> = original.0[..4]
        .iter()
        .flat_map(|word| word.to_le_bytes())
        .collect();
    probe.core_mut().write_memory(0x8000_0000, &words);

    let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");

    let regs = interface.read_registers().expect("Failed to read registers");
    interface
        .write_registers(&regs)
        .expect("Failed to write registers");

    let mut memory = [0u32; 4];
    interface.read_32(0x8000_0000, &mut memory).unwrap();
    assert_eq!(memory, original.0[..4]);

    assert_eq!(interface.read_registers().unwrap(), original);
}

#[test]
fn cp0_access_preserves_scratch_registers() {
    let mut probe = FakeProbe::new();
    let expected = populate(&mut probe);
    let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");

    assert_eq!(interface.read_cp0(13, 0).unwrap(), 0x0080_0024);
    interface.write_cp0(11, 0, 0x0001_0000).unwrap();
    assert_eq!(interface.read_cp0(11, 0).unwrap(), 0x0001_0000);

    let core = probe.core();
    assert_eq!(core.cp0(11, 0), 0x0001_0000);
    assert_eq!(core.cp0(31, 0), expected.gpr(15));
    for reg in [8, 9, 10, 15] {
        assert_eq!(core.gpr(reg), expected.gpr(reg));
    }
}

#[test]
fn restarts_are_bounded() {
    let mut probe = FakeProbe::new();
    populate(&mut probe);
    probe
        .core_mut()
        .corrupt_fetch_address(PRACC_TEXT + 4, PRACC_TEXT + 0x40);
    let mut state = MipsDebugInterfaceState::new(EjtagConfig::default());
    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");

    let result = interface.read_registers();

    assert!(
        matches!(
            result,
            Err(MipsError::Pracc(PraccError::RestartLimitExceeded {
                restarts: 3,
                expected,
                actual,
            })) if expected == PRACC_TEXT + 4 && actual == PRACC_TEXT + 0x40
        ),
        "{result:?}"
    );

    // The core was brought back to the text start.
    assert_eq!(probe.core().pending_address(), Some(PRACC_TEXT));
}

#[test]
fn idle_core_times_out() {
    let mut probe = FakeProbe::new();
    // Send the core off to spin in RAM, where it never accesses the debug segment.
    probe
        .core_mut()
        .write_memory(0x8000_0000, &assembly::b(-1).to_le_bytes());
    probe.core_mut().set_gpr(15, 0x8000_0000);
    probe.core_mut().complete(assembly::jr(15));
    probe.core_mut().complete(assembly::NOP);
    assert_eq!(probe.core().pending(), None);

    let mut state = MipsDebugInterfaceState::new(EjtagConfig {
        pracc_timeout_ms: 10,
        ..Default::default()
    });
    let mut interface =
        MipsCommunicationInterface::new(&mut probe, &mut state).expect("Failed to attach");

    assert!(matches!(
        interface.write_cp0(12, 0, 0),
        Err(MipsError::PraccTimeout)
    ));
}
