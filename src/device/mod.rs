//! Hardware collaborators of the state-machine core.
//!
//! Code memory, the GPIO pad array and the IRQ bank are shared by all four
//! state machines of a block; each machine owns its FIFO pair and clock
//! divider. Everything here implements exactly the collaborator contracts
//! the engine consumes.

pub mod fifo;
pub mod gpio;
pub mod irq;
pub mod memory;
pub mod pll;

pub use fifo::{Fifo, FIFO_DEPTH};
pub use gpio::{Bit, Gpio, PIN_COUNT};
pub use irq::{IrqBank, IRQ_COUNT};
pub use memory::{Memory, MEMORY_SIZE};
pub use pll::Pll;
