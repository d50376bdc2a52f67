//! The state-machine core: registers, shifters, instruction set, engine.

pub mod instruction;
pub mod registers;
pub mod shifter;
pub mod sm;

pub use instruction::{DecodeError, ExecResult, Instruction, InstructionKind};
pub use registers::{threshold, ExecCtrl, PinCtrl, PinDir, ShiftCtrl, ShiftDir};
pub use shifter::ShiftRegister;
pub use sm::StateMachine;
