//! Host-facing configuration errors.
//!
//! Setters validate their bounds synchronously and leave no partial state
//! behind on failure. Decode failures are a separate concern and live with
//! the decoder ([`crate::emu::instruction::DecodeError`]).

use thiserror::Error;

/// Invalid-argument failure from a configuration setter or program loader.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A register field setter received an out-of-range value.
    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    /// A program image does not fit the 32-slot code memory.
    #[error("program of {words} words exceeds code memory ({capacity} words)")]
    ProgramTooLong { words: usize, capacity: usize },

    /// A little-endian program byte stream has a trailing half word.
    #[error("program byte stream has odd length {0}")]
    OddProgramLength(usize),
}

impl ConfigError {
    pub(crate) fn out_of_range(field: &'static str, value: u32, max: u32) -> Self {
        ConfigError::OutOfRange { field, value, max }
    }
}
