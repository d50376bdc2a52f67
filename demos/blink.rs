//! Square wave on one pin via side-set.
//!
//! Two NOPs toggle pin 25 through the side-set window, each padded with one
//! delay cycle, wrapping forever:
//!
//! ```text
//! 00: mov y, y        side 1 [1]
//! 01: mov y, y        side 0 [1]
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use pio_emu::device::{Gpio, IrqBank, Memory};
use pio_emu::emu::StateMachine;

const LED_PIN: u8 = 25;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let memory = Rc::new(RefCell::new(Memory::new()));
    let gpio = Rc::new(RefCell::new(Gpio::new()));
    let irq = Rc::new(RefCell::new(IrqBank::new()));

    memory.borrow_mut().load(0, &[0xB142, 0xA142])?;

    let mut sm = StateMachine::new(0, memory, Rc::clone(&gpio), irq);
    sm.set_sideset_count(1)?;
    sm.set_sideset_base(LED_PIN)?;
    sm.set_wrap_top(1)?;
    sm.set_wrap_bottom(0)?;

    println!("{}", sm.dump_memory());

    sm.enable();
    print!("pin {}: ", LED_PIN);
    for _ in 0..16 {
        sm.clock_raising_edge()?;
        print!("{}", u32::from(gpio.borrow().get_bit(LED_PIN).is_high()));
    }
    println!();
    Ok(())
}
