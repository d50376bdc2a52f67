//! Per-state-machine cycle engine.
//!
//! Each [`StateMachine`] runs the fetch/decode/execute loop over the shared
//! code memory, gated by its enable flag and fractional clock divider. One
//! rising edge of the divided clock is one engine cycle:
//!
//! 1. a pending delay consumes the cycle, otherwise
//! 2. the next word comes from the one-slot injection queue or `memory[PC]`,
//! 3. the decoder materializes the instruction (decode errors are fatal to
//!    this machine and surfaced to the host),
//! 4. side-set drives its pin window, the instruction executes,
//! 5. COMPLETE advances the PC with wrap, anything but STALL arms the delay.
//!
//! A stalled instruction re-runs on the next cycle with the PC unchanged.
//! The machine keeps a stall latch so the one-shot side effects of a
//! stalled IN/OUT/IRQ (the shift-and-deliver phase, the IRQ set) are not
//! replayed on retries.

use std::cell::RefCell;
use std::rc::Rc;

use crate::device::fifo::Fifo;
use crate::device::gpio::{Bit, Gpio};
use crate::device::irq::IrqBank;
use crate::device::memory::{Memory, MEMORY_SIZE};
use crate::device::pll::Pll;
use crate::emu::instruction::{
    DecodeError, ExecResult, InSource, Instruction, MovSource, OutDestination,
};
use crate::emu::registers::{threshold, ExecCtrl, PinCtrl, PinDir, ShiftCtrl, ShiftDir};
use crate::emu::shifter::ShiftRegister;
use crate::error::ConfigError;

/// One PIO state machine: engine state plus collaborator handles.
///
/// Code memory, the pad array and the IRQ bank are shared across the four
/// machines of a block; the FIFO pair and clock divider are owned.
pub struct StateMachine {
    pub(crate) num: u8,
    pub(crate) memory: Rc<RefCell<Memory>>,
    pub(crate) gpio: Rc<RefCell<Gpio>>,
    pub(crate) irq: Rc<RefCell<IrqBank>>,
    pub(crate) fifo: Fifo,
    pll: Pll,

    enabled: bool,
    clock_enabled: bool,
    pub(crate) x: u32,
    pub(crate) y: u32,
    pub(crate) isr: ShiftRegister,
    pub(crate) osr: ShiftRegister,
    pub(crate) pc: u8,
    pending_delay: u8,
    pending_instruction: Option<u16>,
    /// Set while a stalled IN/OUT/IRQ has already applied its one-shot side
    /// effects; cleared when the instruction retires.
    pub(crate) stalled: bool,

    pub(crate) exec_ctrl: ExecCtrl,
    pub(crate) shift_ctrl: ShiftCtrl,
    pub(crate) pin_ctrl: PinCtrl,
}

impl StateMachine {
    /// Create machine `num` (0..=3) wired to the block's shared memory,
    /// pad array and IRQ bank.
    pub fn new(
        num: u8,
        memory: Rc<RefCell<Memory>>,
        gpio: Rc<RefCell<Gpio>>,
        irq: Rc<RefCell<IrqBank>>,
    ) -> Self {
        assert!(num <= 3, "state machine number {} out of range", num);
        Self {
            num,
            memory,
            gpio,
            irq,
            fifo: Fifo::new(),
            pll: Pll::new(),
            enabled: false,
            clock_enabled: false,
            x: 0,
            y: 0,
            isr: ShiftRegister::new(),
            osr: ShiftRegister::drained(),
            pc: 0,
            pending_delay: 0,
            pending_instruction: None,
            stalled: false,
            exec_ctrl: ExecCtrl::default(),
            shift_ctrl: ShiftCtrl::default(),
            pin_ctrl: PinCtrl::default(),
        }
    }

    #[inline]
    pub fn num(&self) -> u8 {
        self.num
    }

    // ------------------------------------------------------------------
    // Clocking
    // ------------------------------------------------------------------

    /// Drive one system-clock rising edge. The machine executes one engine
    /// cycle when it is enabled and its divided clock fires.
    ///
    /// A decode error is fatal to this machine: the PC does not advance and
    /// disabling is left to the host.
    pub fn clock_raising_edge(&mut self) -> Result<(), DecodeError> {
        self.clock_enabled = self.pll.rising_edge();
        if self.enabled && self.clock_enabled {
            self.execute()?;
        }
        Ok(())
    }

    /// Drive one system-clock falling edge.
    pub fn clock_falling_edge(&mut self) {
        self.clock_enabled = false;
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_clkdiv(&mut self, clkdiv: u32) {
        self.pll.set_clkdiv(clkdiv);
    }

    pub fn clkdiv(&self) -> u32 {
        self.pll.clkdiv()
    }

    pub fn set_clock_div_integer_bits(&mut self, div_int: u16) {
        self.pll.set_div_integer_bits(div_int);
    }

    pub fn clock_div_integer_bits(&self) -> u16 {
        self.pll.div_integer_bits()
    }

    pub fn set_clock_div_fractional_bits(&mut self, div_frac: u8) {
        self.pll.set_div_fractional_bits(div_frac);
    }

    pub fn clock_div_fractional_bits(&self) -> u8 {
        self.pll.div_fractional_bits()
    }

    /// Restart the clock divider phase without touching engine state.
    pub fn restart_clkdiv(&mut self) {
        self.pll.reset_phase();
    }

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------

    fn execute(&mut self) -> Result<(), DecodeError> {
        if self.pending_delay > 0 {
            self.pending_delay -= 1;
            return Ok(());
        }

        let injected = self.pending_instruction.take();
        let word = match injected {
            Some(word) => word,
            None => self.memory.borrow().get(self.pc),
        };
        let inst = Instruction::decode(word, self.pin_ctrl.sideset_count, self.exec_ctrl.side_en)?;
        log::trace!("sm{}: pc={:02} {:04x} {}", self.num, self.pc, word, inst);

        self.apply_side_set(&inst);
        let result = inst.execute(self);

        match result {
            ExecResult::Complete => self.update_pc(),
            ExecResult::Jump => {}
            ExecResult::Stall => {
                // a stalled injected word is re-armed so the same
                // instruction re-runs, unless it queued its own injection
                if injected.is_some() && self.pending_instruction.is_none() {
                    self.pending_instruction = injected;
                }
            }
        }
        if result != ExecResult::Stall {
            self.pending_delay = inst.delay;
            self.stalled = false;
        }
        Ok(())
    }

    fn update_pc(&mut self) {
        if self.pc == self.exec_ctrl.wrap_top {
            self.pc = self.exec_ctrl.wrap_bottom;
        } else {
            self.pc = (self.pc + 1) & 0x1F;
        }
    }

    fn apply_side_set(&mut self, inst: &Instruction) {
        let value = match inst.side_set {
            Some(value) => value as u32,
            None => return,
        };
        // under SIDE_EN the enable flag occupies the top side-set slot
        let count = self.pin_ctrl.sideset_count - self.exec_ctrl.side_en as u8;
        if count == 0 {
            return;
        }
        let base = self.pin_ctrl.sideset_base;
        match self.exec_ctrl.side_pindir {
            PinDir::GpioLevels => self.gpio.borrow_mut().set_pins(value, base, count),
            PinDir::PinDirs => self.gpio.borrow_mut().set_pin_dirs(value, base, count),
        }
    }

    /// Queue one synthetic instruction word; it preempts `memory[PC]` on
    /// the next cycle. At most one may be pending.
    pub fn insert_instruction(&mut self, word: u16) {
        assert!(
            self.pending_instruction.is_none(),
            "pending instruction slot already occupied"
        );
        self.pending_instruction = Some(word);
        self.stalled = false;
    }

    /// Restart the machine: volatile engine state and the configuration
    /// registers return to their reset values; X, Y and the ISR/OSR values
    /// are retained. The FIFOs and clock divider are untouched.
    pub fn restart(&mut self) {
        self.isr.set_count(0);
        self.osr.set_count(32);
        self.pending_delay = 0;
        self.pending_instruction = None;
        self.stalled = false;
        self.enabled = false;
        self.clock_enabled = false;
        self.pc = 0;
        self.exec_ctrl = ExecCtrl::default();
        self.shift_ctrl = ShiftCtrl::default();
        self.pin_ctrl = PinCtrl::default();
        log::trace!("sm{}: restart", self.num);
    }

    // ------------------------------------------------------------------
    // FIFO transfers
    // ------------------------------------------------------------------

    /// Push the ISR into the RX FIFO.
    ///
    /// With `if_full` the push only happens once the ISR has reached the
    /// push threshold and AUTOPUSH is on. Returns true when the caller must
    /// stall (RX full on a blocking push); the ISR is kept in that case.
    pub fn rx_push(&mut self, if_full: bool, block: bool) -> bool {
        let isr_full = self.isr.count() >= threshold(self.shift_ctrl.push_thresh);
        if !if_full || (isr_full && self.shift_ctrl.autopush) {
            if self.fifo.fstat_rx_full() {
                return block;
            }
            self.fifo.rx_push(self.isr.value());
            self.isr.flush();
        }
        false
    }

    /// Refill the OSR from the TX FIFO.
    ///
    /// With `if_empty` the pull only happens once the OSR has reached the
    /// pull threshold and AUTOPULL is on. Returns true when the caller must
    /// stall (TX empty on a blocking pull). A non-blocking pull on an empty
    /// TX copies X into the OSR instead.
    pub fn tx_pull(&mut self, if_empty: bool, block: bool) -> bool {
        let osr_empty = self.osr.count() >= threshold(self.shift_ctrl.pull_thresh);
        if !if_empty || (osr_empty && self.shift_ctrl.autopull) {
            if self.fifo.fstat_tx_empty() {
                if !block {
                    self.osr.refill(self.x);
                }
                return block;
            }
            let word = self.fifo.tx_pull();
            self.osr.refill(word);
        }
        false
    }

    /// True once the OSR shift count has reached the pull threshold.
    pub(crate) fn osr_empty(&self) -> bool {
        self.osr.count() >= threshold(self.shift_ctrl.pull_thresh)
    }

    /// MOV STATUS word: all-ones while the selected FIFO level is below
    /// STATUS_N, zero otherwise.
    pub(crate) fn fifo_status_word(&self) -> u32 {
        let below = if self.exec_ctrl.status_sel {
            self.fifo.rx_level() < self.exec_ctrl.status_n as usize
        } else {
            self.fifo.tx_level() < self.exec_ctrl.status_n as usize
        };
        if below {
            u32::MAX
        } else {
            0
        }
    }

    // ------------------------------------------------------------------
    // Pin and register datapaths
    // ------------------------------------------------------------------

    pub(crate) fn jmp_pin(&self) -> Bit {
        self.gpio.borrow().get_bit(self.exec_ctrl.jmp_pin)
    }

    pub(crate) fn read_in_source(&self, source: InSource) -> u32 {
        match source {
            InSource::Pins => self.gpio.borrow().get_pins(self.pin_ctrl.in_base, 32),
            InSource::X => self.x,
            InSource::Y => self.y,
            InSource::Null => 0,
            InSource::Isr => self.isr.value(),
            InSource::Osr => self.osr.value(),
        }
    }

    pub(crate) fn read_mov_source(&self, source: MovSource) -> u32 {
        match source {
            MovSource::Pins => self.gpio.borrow().get_pins(self.pin_ctrl.in_base, 32),
            MovSource::X => self.x,
            MovSource::Y => self.y,
            MovSource::Null => 0,
            MovSource::Status => self.fifo_status_word(),
            MovSource::Isr => self.isr.value(),
            MovSource::Osr => self.osr.value(),
        }
    }

    pub(crate) fn write_out_destination(&mut self, destination: OutDestination, data: u32) {
        match destination {
            OutDestination::Pins => self.write_out_pins(data),
            OutDestination::X => self.x = data,
            OutDestination::Y => self.y = data,
            OutDestination::Null => {}
            OutDestination::PinDirs => {
                self.gpio.borrow_mut().set_pin_dirs(
                    data,
                    self.pin_ctrl.out_base,
                    self.pin_ctrl.out_count,
                );
            }
            OutDestination::Pc => self.pc = (data & 0x1F) as u8,
            OutDestination::Isr => self.isr.set_value(data),
            OutDestination::Exec => self.insert_instruction(data as u16),
        }
    }

    pub(crate) fn write_out_pins(&mut self, data: u32) {
        self.gpio
            .borrow_mut()
            .set_pins(data, self.pin_ctrl.out_base, self.pin_ctrl.out_count);
    }

    pub(crate) fn write_set_pins(&mut self, data: u32) {
        self.gpio
            .borrow_mut()
            .set_pins(data, self.pin_ctrl.set_base, self.pin_ctrl.set_count);
    }

    pub(crate) fn write_set_pin_dirs(&mut self, data: u32) {
        self.gpio
            .borrow_mut()
            .set_pin_dirs(data, self.pin_ctrl.set_base, self.pin_ctrl.set_count);
    }

    // ------------------------------------------------------------------
    // Packed configuration registers
    // ------------------------------------------------------------------

    pub fn set_execctrl(&mut self, bits: u32) {
        self.exec_ctrl = ExecCtrl::from_bits(bits);
        log::trace!("sm{}: execctrl <- {:08x}", self.num, bits);
    }

    pub fn execctrl(&self) -> u32 {
        self.exec_ctrl.to_bits()
    }

    /// Write SHIFTCTRL; the FIFO join flags live with the FIFO itself.
    pub fn set_shiftctrl(&mut self, bits: u32) {
        let shift_ctrl = ShiftCtrl::from_bits(bits);
        self.fifo.set_join_rx(shift_ctrl.join_rx);
        self.fifo.set_join_tx(shift_ctrl.join_tx);
        self.shift_ctrl = shift_ctrl;
        log::trace!("sm{}: shiftctrl <- {:08x}", self.num, bits);
    }

    pub fn shiftctrl(&self) -> u32 {
        let mut shift_ctrl = self.shift_ctrl;
        shift_ctrl.join_rx = self.fifo.join_rx();
        shift_ctrl.join_tx = self.fifo.join_tx();
        shift_ctrl.to_bits()
    }

    /// Write PINCTRL. Fails when a count field exceeds its legal range
    /// (SIDESET_COUNT/SET_COUNT over 5, OUT_COUNT over 31); no state
    /// changes on failure.
    pub fn set_pinctrl(&mut self, bits: u32) -> Result<(), ConfigError> {
        self.pin_ctrl = PinCtrl::from_bits(bits)?;
        log::trace!("sm{}: pinctrl <- {:08x}", self.num, bits);
        Ok(())
    }

    pub fn pinctrl(&self) -> u32 {
        self.pin_ctrl.to_bits()
    }

    // ------------------------------------------------------------------
    // Granular field setters (bounds-checked)
    // ------------------------------------------------------------------

    pub fn set_pc(&mut self, value: u8) -> Result<(), ConfigError> {
        if value > 31 {
            return Err(ConfigError::out_of_range("pc", value as u32, 31));
        }
        self.pc = value;
        self.stalled = false;
        Ok(())
    }

    pub fn set_wrap_top(&mut self, value: u8) -> Result<(), ConfigError> {
        if value > 31 {
            return Err(ConfigError::out_of_range("wrap top", value as u32, 31));
        }
        self.exec_ctrl.wrap_top = value;
        Ok(())
    }

    pub fn set_wrap_bottom(&mut self, value: u8) -> Result<(), ConfigError> {
        if value > 31 {
            return Err(ConfigError::out_of_range("wrap bottom", value as u32, 31));
        }
        self.exec_ctrl.wrap_bottom = value;
        Ok(())
    }

    /// Reset the wrap window to cover the whole code memory.
    pub fn deactivate_wrap(&mut self) {
        self.exec_ctrl.wrap_top = 0x1F;
        self.exec_ctrl.wrap_bottom = 0x00;
    }

    pub fn set_jmp_pin(&mut self, pin: u8) -> Result<(), ConfigError> {
        if pin > 31 {
            return Err(ConfigError::out_of_range("jmp pin", pin as u32, 31));
        }
        self.exec_ctrl.jmp_pin = pin;
        Ok(())
    }

    pub fn set_side_set_enable(&mut self, enable: bool) {
        self.exec_ctrl.side_en = enable;
    }

    pub fn set_side_set_pindir(&mut self, pindir: PinDir) {
        self.exec_ctrl.side_pindir = pindir;
    }

    pub fn set_status_sel(&mut self, rx: bool) {
        self.exec_ctrl.status_sel = rx;
    }

    pub fn set_status_n(&mut self, n: u8) -> Result<(), ConfigError> {
        if n > 15 {
            return Err(ConfigError::out_of_range("status n", n as u32, 15));
        }
        self.exec_ctrl.status_n = n;
        Ok(())
    }

    pub fn set_in_shiftdir(&mut self, dir: ShiftDir) {
        self.shift_ctrl.in_shiftdir = dir;
    }

    pub fn in_shiftdir(&self) -> ShiftDir {
        self.shift_ctrl.in_shiftdir
    }

    pub fn set_out_shiftdir(&mut self, dir: ShiftDir) {
        self.shift_ctrl.out_shiftdir = dir;
    }

    pub fn out_shiftdir(&self) -> ShiftDir {
        self.shift_ctrl.out_shiftdir
    }

    pub fn set_push_thresh(&mut self, thresh: u8) -> Result<(), ConfigError> {
        if thresh > 31 {
            return Err(ConfigError::out_of_range("push threshold", thresh as u32, 31));
        }
        self.shift_ctrl.push_thresh = thresh;
        Ok(())
    }

    pub fn set_pull_thresh(&mut self, thresh: u8) -> Result<(), ConfigError> {
        if thresh > 31 {
            return Err(ConfigError::out_of_range("pull threshold", thresh as u32, 31));
        }
        self.shift_ctrl.pull_thresh = thresh;
        Ok(())
    }

    pub fn set_autopush(&mut self, auto: bool) {
        self.shift_ctrl.autopush = auto;
    }

    pub fn set_join_rx(&mut self, join: bool) {
        self.fifo.set_join_rx(join);
    }

    pub fn set_join_tx(&mut self, join: bool) {
        self.fifo.set_join_tx(join);
    }

    pub fn set_autopull(&mut self, auto: bool) {
        self.shift_ctrl.autopull = auto;
    }

    pub fn set_sideset_count(&mut self, count: u8) -> Result<(), ConfigError> {
        if count > 5 {
            return Err(ConfigError::out_of_range("sideset count", count as u32, 5));
        }
        self.pin_ctrl.sideset_count = count;
        Ok(())
    }

    pub fn set_sideset_base(&mut self, base: u8) -> Result<(), ConfigError> {
        if base > 31 {
            return Err(ConfigError::out_of_range("sideset base", base as u32, 31));
        }
        self.pin_ctrl.sideset_base = base;
        Ok(())
    }

    pub fn set_set_count(&mut self, count: u8) -> Result<(), ConfigError> {
        if count > 5 {
            return Err(ConfigError::out_of_range("set count", count as u32, 5));
        }
        self.pin_ctrl.set_count = count;
        Ok(())
    }

    pub fn set_set_base(&mut self, base: u8) -> Result<(), ConfigError> {
        if base > 31 {
            return Err(ConfigError::out_of_range("set base", base as u32, 31));
        }
        self.pin_ctrl.set_base = base;
        Ok(())
    }

    pub fn set_out_count(&mut self, count: u8) -> Result<(), ConfigError> {
        if count > 31 {
            return Err(ConfigError::out_of_range("out count", count as u32, 31));
        }
        self.pin_ctrl.out_count = count;
        Ok(())
    }

    pub fn set_out_base(&mut self, base: u8) -> Result<(), ConfigError> {
        if base > 31 {
            return Err(ConfigError::out_of_range("out base", base as u32, 31));
        }
        self.pin_ctrl.out_base = base;
        Ok(())
    }

    pub fn set_in_base(&mut self, base: u8) -> Result<(), ConfigError> {
        if base > 31 {
            return Err(ConfigError::out_of_range("in base", base as u32, 31));
        }
        self.pin_ctrl.in_base = base;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scratch and shift register access
    // ------------------------------------------------------------------

    #[inline]
    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn set_x(&mut self, value: u32) {
        self.x = value;
    }

    #[inline]
    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn set_y(&mut self, value: u32) {
        self.y = value;
    }

    #[inline]
    pub fn pc(&self) -> u8 {
        self.pc
    }

    #[inline]
    pub fn isr_value(&self) -> u32 {
        self.isr.value()
    }

    /// Replace the ISR value, leaving its shift count untouched.
    pub fn set_isr_value(&mut self, value: u32) {
        self.isr.set_value(value);
    }

    #[inline]
    pub fn isr_shift_count(&self) -> u8 {
        self.isr.count()
    }

    #[inline]
    pub fn osr_value(&self) -> u32 {
        self.osr.value()
    }

    /// Replace the OSR value, leaving its shift count untouched.
    pub fn set_osr_value(&mut self, value: u32) {
        self.osr.set_value(value);
    }

    #[inline]
    pub fn osr_shift_count(&self) -> u8 {
        self.osr.count()
    }

    #[inline]
    pub fn pending_delay(&self) -> u8 {
        self.pending_delay
    }

    #[inline]
    pub fn pending_instruction(&self) -> Option<u16> {
        self.pending_instruction
    }

    // ------------------------------------------------------------------
    // Collaborator access
    // ------------------------------------------------------------------

    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    pub fn fifo_mut(&mut self) -> &mut Fifo {
        &mut self.fifo
    }

    pub fn memory(&self) -> Rc<RefCell<Memory>> {
        Rc::clone(&self.memory)
    }

    pub fn gpio(&self) -> Rc<RefCell<Gpio>> {
        Rc::clone(&self.gpio)
    }

    pub fn irq_bank(&self) -> Rc<RefCell<IrqBank>> {
        Rc::clone(&self.irq)
    }

    /// Disassembly listing of the whole code memory, one slot per line,
    /// `???` for words this machine cannot decode.
    pub fn dump_memory(&self) -> String {
        let mut out = String::new();
        for addr in 0..MEMORY_SIZE as u8 {
            let word = self.memory.borrow().get(addr);
            let listing =
                match Instruction::decode(word, self.pin_ctrl.sideset_count, self.exec_ctrl.side_en)
                {
                    Ok(inst) => inst.to_string(),
                    Err(_) => "???".to_string(),
                };
            out.push_str(&format!("{:02x}: {:04x} {}\n", addr, word, listing));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::instruction::irq_num;

    const NOP: u16 = 0xA042; // mov y, y

    fn instr_jmp(cond: u16, addr: u16) -> u16 {
        cond << 5 | addr
    }

    fn instr_wait(polarity: u16, source: u16, index: u16) -> u16 {
        1 << 13 | polarity << 7 | source << 5 | index
    }

    fn instr_in(source: u16, bit_count: u16) -> u16 {
        2 << 13 | source << 5 | (bit_count & 0x1F)
    }

    fn instr_out(destination: u16, bit_count: u16) -> u16 {
        3 << 13 | destination << 5 | (bit_count & 0x1F)
    }

    fn instr_push(if_full: bool, block: bool) -> u16 {
        4 << 13 | (if_full as u16) << 6 | (block as u16) << 5
    }

    fn instr_pull(if_empty: bool, block: bool) -> u16 {
        4 << 13 | 1 << 7 | (if_empty as u16) << 6 | (block as u16) << 5
    }

    fn instr_mov(destination: u16, op: u16, source: u16) -> u16 {
        5 << 13 | destination << 5 | op << 3 | source
    }

    fn instr_irq(clear: bool, wait: bool, index: u16) -> u16 {
        6 << 13 | (clear as u16) << 6 | (wait as u16) << 5 | index
    }

    fn instr_set(destination: u16, data: u16) -> u16 {
        7 << 13 | destination << 5 | data
    }

    fn with_delay(word: u16, delay: u16) -> u16 {
        word | delay << 8
    }

    fn sm_fixture() -> StateMachine {
        sm_fixture_num(0)
    }

    fn sm_fixture_num(num: u8) -> StateMachine {
        let memory = Rc::new(RefCell::new(Memory::new()));
        let gpio = Rc::new(RefCell::new(Gpio::new()));
        let irq = Rc::new(RefCell::new(IrqBank::new()));
        StateMachine::new(num, memory, gpio, irq)
    }

    fn load_and_enable(sm: &mut StateMachine, program: &[u16]) {
        sm.memory().borrow_mut().load(0, program).unwrap();
        sm.enable();
    }

    fn tick(sm: &mut StateMachine) {
        sm.clock_raising_edge().unwrap();
    }

    #[test]
    fn test_delay_accounting() {
        // S1: one SET with delay 3, wrapping on itself
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[with_delay(instr_set(0b001, 1), 3)]);
        sm.set_wrap_top(0).unwrap();
        sm.set_wrap_bottom(0).unwrap();

        tick(&mut sm);
        assert_eq!(sm.x(), 1);
        assert_eq!(sm.pc(), 0);
        assert_eq!(sm.pending_delay(), 3);

        sm.set_x(99);
        for _ in 0..3 {
            tick(&mut sm);
            assert_eq!(sm.x(), 99);
        }
        tick(&mut sm);
        assert_eq!(sm.x(), 1);
    }

    #[test]
    fn test_autopush_left() {
        // S2: two nibbles compose into one RX word at the push threshold
        let mut sm = sm_fixture();
        sm.set_push_thresh(8).unwrap();
        sm.set_autopush(true);

        sm.isr.shift_in_left(4, 0xA);
        assert!(!sm.rx_push(true, true));
        assert_eq!(sm.isr_shift_count(), 4);

        sm.isr.shift_in_left(4, 0xB);
        assert!(!sm.rx_push(true, true));
        assert_eq!(sm.isr_value(), 0);
        assert_eq!(sm.isr_shift_count(), 0);
        assert_eq!(sm.fifo_mut().rx_read(), Some(0xAB));
    }

    #[test]
    fn test_autopush_through_engine() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_in(0b001, 8)]); // in x, 8
        sm.set_push_thresh(8).unwrap();
        sm.set_autopush(true);
        sm.set_x(0xAB);

        tick(&mut sm);
        assert_eq!(sm.fifo_mut().rx_read(), Some(0xAB));
        assert_eq!(sm.isr_shift_count(), 0);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_blocking_pull() {
        // S3: PULL block stalls until the host enqueues a word
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_pull(false, true)]);

        for _ in 0..3 {
            tick(&mut sm);
            assert_eq!(sm.pc(), 0);
            assert_eq!(sm.osr_shift_count(), 32);
        }

        sm.fifo_mut().tx_write(0x1234_5678);
        tick(&mut sm);
        assert_eq!(sm.osr_value(), 0x1234_5678);
        assert_eq!(sm.osr_shift_count(), 0);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_jmp_x_dec() {
        // S4: fires while X is non-zero, decrements either way
        let mut sm = sm_fixture();
        let jmp = instr_jmp(0b010, 5);
        sm.memory().borrow_mut().set(1, jmp);
        sm.memory().borrow_mut().set(5, jmp);
        sm.enable();
        sm.set_x(2);
        sm.set_pc(1).unwrap();

        tick(&mut sm);
        assert_eq!(sm.pc(), 5);
        assert_eq!(sm.x(), 1);

        tick(&mut sm);
        assert_eq!(sm.pc(), 5);
        assert_eq!(sm.x(), 0);

        tick(&mut sm);
        assert_eq!(sm.pc(), 6);
        assert_eq!(sm.x(), u32::MAX);
    }

    #[test]
    fn test_out_exec() {
        // S5: the shifted-out word runs as the next instruction
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_out(0b111, 32)]);
        sm.set_osr_value(NOP as u32);

        tick(&mut sm);
        assert_eq!(sm.pending_instruction(), Some(NOP));
        assert_eq!(sm.pc(), 0);

        tick(&mut sm);
        assert_eq!(sm.pending_instruction(), None);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_wrap() {
        // S6: wrap fires regardless of bottom < top ordering
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[NOP; 8]);
        sm.set_wrap_top(3).unwrap();
        sm.set_wrap_bottom(1).unwrap();
        sm.set_pc(3).unwrap();

        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_pc_wraps_at_memory_end_without_wrap_window() {
        let mut sm = sm_fixture();
        sm.memory().borrow_mut().set(31, NOP);
        sm.enable();
        sm.set_wrap_top(0x10).unwrap(); // wrap window away from the end
        sm.set_pc(31).unwrap();

        tick(&mut sm);
        assert_eq!(sm.pc(), 0);
    }

    #[test]
    fn test_stall_idempotence_blocking_pull() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_pull(false, true)]);
        sm.set_x(7);
        sm.set_y(9);
        sm.set_isr_value(0x55);

        for _ in 0..5 {
            tick(&mut sm);
        }
        assert_eq!(sm.pc(), 0);
        assert_eq!(sm.x(), 7);
        assert_eq!(sm.y(), 9);
        assert_eq!(sm.isr_value(), 0x55);
        assert_eq!(sm.osr_shift_count(), 32);
        assert_eq!(sm.fifo().rx_level(), 0);
    }

    #[test]
    fn test_stalled_in_does_not_reshift() {
        // autopush against a full RX FIFO: the shift happens once, retries
        // only re-attempt the push
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_in(0b001, 8)]); // in x, 8
        sm.set_push_thresh(8).unwrap();
        sm.set_autopush(true);
        sm.set_x(0xCD);
        for word in 0..4 {
            sm.fifo.rx_push(word);
        }

        tick(&mut sm);
        assert_eq!(sm.isr_value(), 0xCD);
        assert_eq!(sm.isr_shift_count(), 8);
        assert_eq!(sm.pc(), 0);

        for _ in 0..3 {
            tick(&mut sm);
            assert_eq!(sm.isr_value(), 0xCD);
            assert_eq!(sm.isr_shift_count(), 8);
        }

        assert_eq!(sm.fifo_mut().rx_read(), Some(0));
        tick(&mut sm);
        assert_eq!(sm.isr_shift_count(), 0);
        assert_eq!(sm.pc(), 1);
        let mut words = Vec::new();
        while let Some(word) = sm.fifo_mut().rx_read() {
            words.push(word);
        }
        assert_eq!(words, vec![1, 2, 3, 0xCD]);
    }

    #[test]
    fn test_bit_reverse_involution() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_mov(0b001, 0b10, 0b001); 2]); // mov x, ::x
        sm.set_x(0x1234_5678);

        tick(&mut sm);
        assert_eq!(sm.x(), 0x1234_5678u32.reverse_bits());
        tick(&mut sm);
        assert_eq!(sm.x(), 0x1234_5678);
    }

    #[test]
    fn test_irq_relative_addressing() {
        for (num, rel, expected) in [(2u8, 3u16, 1u8), (0, 0, 0), (3, 3, 2), (1, 2, 3)] {
            let mut sm = sm_fixture_num(num);
            load_and_enable(&mut sm, &[instr_irq(false, false, 0x10 | rel)]);
            tick(&mut sm);
            assert!(sm.irq_bank().borrow().get(expected).is_high());
            assert_eq!(irq_num(num, 0x10 | rel as u8), expected);
        }
    }

    #[test]
    fn test_irq_wait_stalls_until_cleared() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_irq(false, true, 4)]);

        tick(&mut sm);
        assert!(sm.irq_bank().borrow().get(4).is_high());
        assert_eq!(sm.pc(), 0);

        tick(&mut sm);
        assert_eq!(sm.pc(), 0);

        sm.irq_bank().borrow_mut().clear(4);
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
        // completion does not re-assert the flag
        assert!(!sm.irq_bank().borrow().get(4).is_high());
    }

    #[test]
    fn test_irq_clear() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_irq(true, true, 6)]);
        sm.irq_bank().borrow_mut().set(6);

        tick(&mut sm);
        // clear wins and the wait flag is ignored
        assert!(!sm.irq_bank().borrow().get(6).is_high());
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_wait_irq_clears_on_high() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_wait(1, 0b10, 2)]);

        tick(&mut sm);
        assert_eq!(sm.pc(), 0);

        sm.irq_bank().borrow_mut().set(2);
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
        assert!(!sm.irq_bank().borrow().get(2).is_high());
    }

    #[test]
    fn test_wait_gpio() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_wait(1, 0b00, 5)]);

        tick(&mut sm);
        assert_eq!(sm.pc(), 0);

        sm.gpio().borrow_mut().set_pins(1, 5, 1);
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_wait_pin_uses_in_base() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_wait(1, 0b01, 2)]);
        sm.set_in_base(10).unwrap();

        sm.gpio().borrow_mut().set_pins(1, 2, 1); // absolute pin 2: wrong one
        tick(&mut sm);
        assert_eq!(sm.pc(), 0);

        sm.gpio().borrow_mut().set_pins(1, 12, 1);
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_jmp_pin() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_jmp(0b110, 9)]);
        sm.set_jmp_pin(3).unwrap();

        tick(&mut sm);
        assert_eq!(sm.pc(), 1);

        sm.set_pc(0).unwrap();
        sm.gpio().borrow_mut().set_pins(1, 3, 1);
        tick(&mut sm);
        assert_eq!(sm.pc(), 9);
    }

    #[test]
    fn test_jmp_x_not_equal_y() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_jmp(0b101, 9)]);
        sm.set_x(5);
        sm.set_y(5);

        tick(&mut sm);
        assert_eq!(sm.pc(), 1);

        sm.set_pc(0).unwrap();
        sm.set_y(6);
        tick(&mut sm);
        assert_eq!(sm.pc(), 9);
    }

    #[test]
    fn test_jmp_osre() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_jmp(0b111, 9)]);

        // OSR starts fully consumed: empty, no jump
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);

        sm.set_pc(0).unwrap();
        sm.osr.refill(0);
        tick(&mut sm);
        assert_eq!(sm.pc(), 9);
    }

    #[test]
    fn test_out_pc_jumps() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_out(0b101, 3)]);
        sm.set_out_shiftdir(ShiftDir::Right);
        sm.osr.refill(7);

        tick(&mut sm);
        assert_eq!(sm.pc(), 7);
    }

    #[test]
    fn test_out_and_set_pin_windows() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_out(0b000, 4), instr_set(0b000, 0x15)]);
        sm.set_out_base(8).unwrap();
        sm.set_out_count(4).unwrap();
        sm.set_set_base(20).unwrap();
        sm.set_set_count(5).unwrap();
        sm.set_out_shiftdir(ShiftDir::Right);
        sm.osr.refill(0xF);

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().get_pins(8, 4), 0xF);

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().get_pins(20, 5), 0x15);
    }

    #[test]
    fn test_out_pindirs() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_out(0b100, 2)]);
        sm.set_out_base(4).unwrap();
        sm.set_out_count(2).unwrap();
        sm.set_out_shiftdir(ShiftDir::Right);
        sm.osr.refill(0b11);

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().directions(), 0b11 << 4);
    }

    #[test]
    fn test_side_set_drives_window() {
        let mut sm = sm_fixture();
        // set pins, 0 with side-set field 0b11 (count 2)
        let word = instr_set(0b000, 0) | 0b11 << 11;
        load_and_enable(&mut sm, &[word]);
        sm.set_sideset_count(2).unwrap();
        sm.set_sideset_base(10).unwrap();

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().get_pins(10, 2), 0b11);
    }

    #[test]
    fn test_side_set_enable_bit_gates() {
        let mut sm = sm_fixture();
        // without the enable bit the field carries no side-set
        load_and_enable(&mut sm, &[with_delay(NOP, 0b01000), NOP]);
        sm.set_side_set_enable(true);
        sm.set_sideset_count(2).unwrap();
        sm.set_sideset_base(10).unwrap();

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().get_pins(10, 1), 0);

        // with the enable bit, one data bit drives one pin
        sm.memory().borrow_mut().set(1, with_delay(NOP, 0b11000));
        sm.set_pc(1).unwrap();
        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().get_pins(10, 1), 1);
    }

    #[test]
    fn test_side_set_pindirs() {
        let mut sm = sm_fixture();
        let word = instr_set(0b001, 0) | 0b1 << 12; // set x, 0 side 1
        load_and_enable(&mut sm, &[word]);
        sm.set_sideset_count(1).unwrap();
        sm.set_sideset_base(15).unwrap();
        sm.set_side_set_pindir(PinDir::PinDirs);

        tick(&mut sm);
        assert_eq!(sm.gpio().borrow().directions(), 1 << 15);
        assert_eq!(sm.gpio().borrow().levels(), 0);
    }

    #[test]
    fn test_mov_status() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_mov(0b001, 0b00, 0b101); 2]); // mov x, status
        sm.set_status_n(2).unwrap();

        tick(&mut sm);
        assert_eq!(sm.x(), u32::MAX);

        sm.fifo_mut().tx_write(1);
        sm.fifo_mut().tx_write(2);
        tick(&mut sm);
        assert_eq!(sm.x(), 0);
    }

    #[test]
    fn test_mov_exec_stalls() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_mov(0b100, 0b00, 0b001)]); // mov exec, x
        sm.set_x(NOP as u32);

        tick(&mut sm);
        assert_eq!(sm.pending_instruction(), Some(NOP));
        assert_eq!(sm.pc(), 0);

        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_pull_nonblocking_substitutes_x() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_pull(false, false)]);
        sm.set_x(0xCAFE);

        tick(&mut sm);
        assert_eq!(sm.osr_value(), 0xCAFE);
        assert_eq!(sm.osr_shift_count(), 0);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_push_iffull_below_threshold_is_noop() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_push(true, true)]);
        sm.set_push_thresh(8).unwrap();
        sm.set_autopush(true);
        sm.isr.shift_in_left(4, 0xF);

        tick(&mut sm);
        assert_eq!(sm.fifo().rx_level(), 0);
        assert_eq!(sm.isr_shift_count(), 4);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    fn test_delay_not_armed_while_stalled() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[with_delay(instr_pull(false, true), 3), NOP]);

        tick(&mut sm);
        tick(&mut sm);
        assert_eq!(sm.pending_delay(), 0);

        sm.fifo_mut().tx_write(1);
        tick(&mut sm);
        assert_eq!(sm.pc(), 1);
        assert_eq!(sm.pending_delay(), 3);
    }

    #[test]
    fn test_clock_divider_gates_engine() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_jmp(0b010, 0)]); // jmp x--, 0
        sm.set_clock_div_integer_bits(2);
        sm.set_x(100);

        for _ in 0..4 {
            tick(&mut sm);
        }
        assert_eq!(sm.x(), 98);
    }

    #[test]
    fn test_disabled_machine_does_not_run() {
        let mut sm = sm_fixture();
        sm.memory().borrow_mut().set(0, instr_set(0b001, 1));

        tick(&mut sm);
        assert_eq!(sm.x(), 0);
        assert_eq!(sm.pc(), 0);
    }

    #[test]
    fn test_host_injected_instruction_preempts_fetch() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_set(0b001, 7), instr_set(0b010, 3)]);
        sm.insert_instruction(instr_set(0b001, 1)); // set x, 1

        tick(&mut sm);
        assert_eq!(sm.x(), 1);
        assert_eq!(sm.pc(), 1);

        tick(&mut sm);
        assert_eq!(sm.y(), 3);
    }

    #[test]
    fn test_stalled_injected_instruction_retries() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_set(0b001, 7)]);
        sm.insert_instruction(instr_pull(false, true));

        tick(&mut sm);
        assert_eq!(sm.pending_instruction(), Some(instr_pull(false, true)));
        assert_eq!(sm.x(), 0);

        sm.fifo_mut().tx_write(0xBEEF);
        tick(&mut sm);
        assert_eq!(sm.osr_value(), 0xBEEF);
        assert_eq!(sm.pc(), 1);
    }

    #[test]
    #[should_panic(expected = "pending instruction slot already occupied")]
    fn test_double_injection_panics() {
        let mut sm = sm_fixture();
        sm.insert_instruction(NOP);
        sm.insert_instruction(NOP);
    }

    #[test]
    fn test_decode_error_surfaces_and_pc_holds() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[instr_set(0b011, 0)]); // reserved set destination

        let err = sm.clock_raising_edge().unwrap_err();
        assert!(matches!(err, DecodeError::ReservedSetDestination(_)));
        assert_eq!(sm.pc(), 0);
        assert!(sm.is_enabled());
    }

    #[test]
    fn test_packed_register_round_trips() {
        let mut sm = sm_fixture();
        for bits in [0u32, u32::MAX, 0xA5A5_A5A5, 0x4155_1234] {
            sm.set_execctrl(bits);
            assert_eq!(sm.execctrl(), bits & ExecCtrl::VALID_MASK);
        }
        for bits in [0u32, ShiftCtrl::VALID_MASK, 0x8B5C_0000, 0x7FFF_FFFF] {
            sm.set_shiftctrl(bits);
            assert_eq!(sm.shiftctrl(), bits & ShiftCtrl::VALID_MASK);
        }
        let full_pinctrl =
            5 << 29 | 4 << 26 | 31 << 20 | 0x1F << 15 | 0x1F << 10 | 0x1F << 5 | 0x1F;
        for bits in [0u32, full_pinctrl, 0x5 << 29 | 0x1F] {
            sm.set_pinctrl(bits).unwrap();
            assert_eq!(sm.pinctrl(), bits & PinCtrl::VALID_MASK);
        }
    }

    #[test]
    fn test_shiftctrl_join_flags_reach_fifo() {
        let mut sm = sm_fixture();
        sm.set_shiftctrl(1 << 31);
        assert!(sm.fifo().join_rx());
        assert!(!sm.fifo().join_tx());
        assert_eq!(sm.shiftctrl() & (1 << 31), 1 << 31);

        sm.set_shiftctrl(0);
        assert!(!sm.fifo().join_rx());
    }

    #[test]
    fn test_pinctrl_rejects_out_of_range_counts() {
        let mut sm = sm_fixture();
        sm.set_pinctrl(0x3 << 29 | 0x4 << 26).unwrap();
        let before = sm.pinctrl();

        assert!(sm.set_pinctrl(6 << 29).is_err());
        // failed write leaves no partial state
        assert_eq!(sm.pinctrl(), before);
    }

    #[test]
    fn test_granular_setter_bounds() {
        let mut sm = sm_fixture();
        assert!(sm.set_pc(32).is_err());
        assert!(sm.set_wrap_top(32).is_err());
        assert!(sm.set_jmp_pin(99).is_err());
        assert!(sm.set_set_count(6).is_err());
        assert!(sm.set_sideset_count(6).is_err());
        assert!(sm.set_out_count(32).is_err());
        assert!(sm.set_push_thresh(32).is_err());
        assert!(sm.set_pull_thresh(32).is_err());
        assert!(sm.set_status_n(16).is_err());
        assert!(sm.set_in_base(32).is_err());

        assert!(sm.set_pc(31).is_ok());
        assert!(sm.set_set_count(5).is_ok());
        assert!(sm.set_push_thresh(31).is_ok());
    }

    #[test]
    fn test_restart() {
        let mut sm = sm_fixture();
        load_and_enable(&mut sm, &[with_delay(instr_set(0b001, 9), 5)]);
        sm.set_wrap_top(7).unwrap();
        sm.set_isr_value(0x77);
        sm.isr.set_count(12);
        tick(&mut sm);
        assert_eq!(sm.pending_delay(), 5);

        sm.restart();
        assert_eq!(sm.pc(), 0);
        assert_eq!(sm.pending_delay(), 0);
        assert_eq!(sm.pending_instruction(), None);
        assert!(!sm.is_enabled());
        assert_eq!(sm.isr_shift_count(), 0);
        assert_eq!(sm.osr_shift_count(), 32);
        // values survive, configuration returns to reset
        assert_eq!(sm.x(), 9);
        assert_eq!(sm.isr_value(), 0x77);
        assert_eq!(sm.execctrl(), ExecCtrl::default().to_bits());
        assert_eq!(sm.pinctrl(), PinCtrl::default().to_bits());
    }

    #[test]
    fn test_shift_count_invariant_over_random_program() {
        // saturating counters never leave 0..=32, PC never leaves 0..=31
        let mut sm = sm_fixture();
        let program = [
            instr_in(0b011, 32),
            instr_in(0b001, 17),
            instr_out(0b011, 32),
            instr_out(0b010, 9),
            instr_mov(0b110, 0b00, 0b001),
            instr_jmp(0b000, 0),
        ];
        load_and_enable(&mut sm, &program);
        for _ in 0..64 {
            tick(&mut sm);
            assert!(sm.isr_shift_count() <= 32);
            assert!(sm.osr_shift_count() <= 32);
            assert!(sm.pc() <= 31);
        }
    }

    #[test]
    fn test_dump_memory() {
        let sm = sm_fixture();
        sm.memory().borrow_mut().set(0, NOP);
        sm.memory().borrow_mut().set(1, instr_set(0b011, 0)); // undecodable

        let dump = sm.dump_memory();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), MEMORY_SIZE);
        assert_eq!(lines[0], "00: a042 mov y, y");
        assert_eq!(lines[1], "01: e060 ???");
    }
}
