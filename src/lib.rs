//! pio-emu library
//!
//! Cycle-accurate emulation of the RP2040 PIO state-machine core.
//!
//! # Module Organization
//!
//! - [`bits`]: 32-bit masks and shift primitives safe at full width
//! - [`device`]: hardware collaborators (code memory, GPIO pads, IRQ bank,
//!   FIFOs, clock divider)
//! - [`emu`]: the core itself (configuration registers, shift registers,
//!   instruction set, per-cycle engine)
//! - [`error`]: host-facing configuration errors
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use pio_emu::device::{Gpio, IrqBank, Memory};
//! use pio_emu::emu::StateMachine;
//!
//! let memory = Rc::new(RefCell::new(Memory::new()));
//! let gpio = Rc::new(RefCell::new(Gpio::new()));
//! let irq = Rc::new(RefCell::new(IrqBank::new()));
//!
//! // set pins, 1
//! memory.borrow_mut().set(0, 0xE001);
//!
//! let mut sm = StateMachine::new(0, memory, Rc::clone(&gpio), irq);
//! sm.set_set_count(1).unwrap();
//! sm.enable();
//! sm.clock_raising_edge().unwrap();
//!
//! assert_eq!(gpio.borrow().get_pins(0, 1), 1);
//! ```

pub mod bits;
pub mod device;
pub mod emu;
pub mod error;

pub use device::{Bit, Fifo, Gpio, IrqBank, Memory, Pll};
pub use emu::{DecodeError, ExecResult, Instruction, StateMachine};
pub use error::ConfigError;
