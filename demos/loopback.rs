//! FIFO loopback: every TX word comes back bit-reversed on RX.
//!
//! ```text
//! 00: pull block
//! 01: mov isr, ::osr
//! 02: push block
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use pio_emu::device::{Gpio, IrqBank, Memory};
use pio_emu::emu::StateMachine;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let memory = Rc::new(RefCell::new(Memory::new()));
    let gpio = Rc::new(RefCell::new(Gpio::new()));
    let irq = Rc::new(RefCell::new(IrqBank::new()));

    memory.borrow_mut().load(0, &[0x80A0, 0xA0D7, 0x8020])?;

    let mut sm = StateMachine::new(0, memory, gpio, irq);
    sm.set_wrap_top(2)?;
    sm.set_wrap_bottom(0)?;
    sm.enable();

    for word in [0x0000_0001u32, 0x8000_0000, 0xDEAD_BEEF] {
        sm.fifo_mut().tx_write(word);
    }

    for _ in 0..16 {
        sm.clock_raising_edge()?;
        if let Some(word) = sm.fifo_mut().rx_read() {
            println!("{:08x} -> {:08x}", word.reverse_bits(), word);
        }
    }
    Ok(())
}
