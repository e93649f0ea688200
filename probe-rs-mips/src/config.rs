//! Configuration of the EJTAG engine.
//!
//! The configuration is usually part of a target description and can be
//! deserialized from YAML:
//!
//! ```yaml
//! execution_mode: batched
//! pracc_timeout_ms: 500
//! working_area:
//!   address: 0xa0000000
//!   size: 0x800
//! endianness: little
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How instruction queues are executed on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One processor access per round trip, checking every observed address.
    #[default]
    Synchronous,
    /// All accesses of a queue are shifted speculatively and verified afterwards.
    Batched,
}

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

impl Endianness {
    /// Converts the lower `width` bytes of `value` into target byte order.
    pub(crate) fn to_bytes(self, value: u32, width: usize, out: &mut Vec<u8>) {
        match (self, width) {
            (Endianness::Little, 1) | (Endianness::Big, 1) => out.push(value as u8),
            (Endianness::Little, 2) => out.extend_from_slice(&(value as u16).to_le_bytes()),
            (Endianness::Big, 2) => out.extend_from_slice(&(value as u16).to_be_bytes()),
            (Endianness::Little, _) => out.extend_from_slice(&value.to_le_bytes()),
            (Endianness::Big, _) => out.extend_from_slice(&value.to_be_bytes()),
        }
    }

    /// Assembles a value of `bytes.len()` bytes given in target byte order.
    pub(crate) fn from_bytes(self, bytes: &[u8]) -> u32 {
        let shift_in = |acc: u32, b: &u8| (acc << 8) | u32::from(*b);

        match self {
            Endianness::Little => bytes.iter().rev().fold(0, shift_in),
            Endianness::Big => bytes.iter().fold(0, shift_in),
        }
    }
}

/// The instruction set used while the core is in debug mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionSet {
    #[default]
    Mips32,
    MicroMips,
}

/// A block of target RAM reserved for downloaded helper code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingArea {
    pub address: u32,
    pub size: u32,
}

/// Settings of the EJTAG engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EjtagConfig {
    /// Preferred execution mode. A batched session falls back to synchronous
    /// execution after the first failed batch.
    pub execution_mode: ExecutionMode,
    /// How long to wait for a pending processor access.
    pub pracc_timeout_ms: u64,
    /// Minimum delay between two fastdata scans, in nanoseconds.
    pub scan_delay_ns: u64,
    /// Number of fastdata scans shifted per batch.
    pub fastdata_block_size: usize,
    /// RAM used for the fastdata handler.
    pub working_area: Option<WorkingArea>,
    pub endianness: Endianness,
    pub instruction_set: InstructionSet,
}

impl Default for EjtagConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Synchronous,
            pracc_timeout_ms: 1000,
            scan_delay_ns: 0,
            fastdata_block_size: 64,
            working_area: None,
            endianness: Endianness::Little,
            instruction_set: InstructionSet::Mips32,
        }
    }
}

impl EjtagConfig {
    /// Parses a configuration from its YAML representation.
    pub fn from_yaml(source: &str) -> Result<Self, crate::Error> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub(crate) fn pracc_timeout(&self) -> Duration {
        Duration::from_millis(self.pracc_timeout_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = EjtagConfig::from_yaml("{}").unwrap();

        assert_eq!(config, EjtagConfig::default());
    }

    #[test]
    fn parse_full_config() {
        let config = EjtagConfig::from_yaml(
            "execution_mode: batched\n\
             pracc_timeout_ms: 250\n\
             scan_delay_ns: 2000000\n\
             fastdata_block_size: 32\n\
             working_area:\n  address: 0xa0001000\n  size: 0x400\n\
             endianness: big\n",
        )
        .unwrap();

        assert_eq!(config.execution_mode, ExecutionMode::Batched);
        assert_eq!(config.pracc_timeout(), Duration::from_millis(250));
        assert_eq!(config.scan_delay_ns, 2_000_000);
        assert_eq!(config.fastdata_block_size, 32);
        assert_eq!(
            config.working_area,
            Some(WorkingArea {
                address: 0xa000_1000,
                size: 0x400
            })
        );
        assert_eq!(config.endianness, Endianness::Big);
        assert_eq!(config.instruction_set, InstructionSet::Mips32);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(EjtagConfig::from_yaml("execution_mode: turbo").is_err());
    }

    #[test]
    fn byte_order_conversion() {
        let mut out = vec![];
        Endianness::Little.to_bytes(0x1122_3344, 4, &mut out);
        Endianness::Big.to_bytes(0x1122_3344, 4, &mut out);
        Endianness::Big.to_bytes(0xAABB, 2, &mut out);

        assert_eq!(
            out,
            [0x44, 0x33, 0x22, 0x11, 0x11, 0x22, 0x33, 0x44, 0xAA, 0xBB]
        );
        assert_eq!(Endianness::Little.from_bytes(&[0x44, 0x33]), 0x3344);
        assert_eq!(Endianness::Big.from_bytes(&[0x44, 0x33]), 0x4433);
    }
}
