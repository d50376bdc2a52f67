//! PIO instruction set: decoding, execution, disassembly.
//!
//! A 16-bit instruction word splits into the opcode class (bits 13..15),
//! the combined delay/side-set field (bits 8..12) and class-specific
//! operand bits (0..7). How the middle field divides into delay and
//! side-set depends on the machine's PINCTRL.SIDESET_COUNT and
//! EXECCTRL.SIDE_EN, so decoding takes both.
//!
//! Decoding is total: every reserved encoding is a [`DecodeError`], never a
//! silent fallback. Execution mutates the owning [`StateMachine`] and
//! reports how the engine should retire the instruction.

use std::fmt;

use thiserror::Error;

use crate::bits;
use crate::device::gpio::Bit;
use crate::emu::registers::ShiftDir;
use crate::emu::sm::StateMachine;

/// Delay-bit masks indexed by SIDESET_COUNT.
const DELAY_MASK: [u8; 6] = [0x1F, 0x0F, 0x07, 0x03, 0x01, 0x00];

/// Instruction decode error: a reserved encoding or violated operand
/// constraint. Fatal to the issuing state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("reserved wait source in instruction word 0x{0:04X}")]
    ReservedWaitSource(u16),

    #[error("reserved in source in instruction word 0x{0:04X}")]
    ReservedInSource(u16),

    #[error("reserved mov destination in instruction word 0x{0:04X}")]
    ReservedMovDestination(u16),

    #[error("reserved mov operation in instruction word 0x{0:04X}")]
    ReservedMovOperation(u16),

    #[error("reserved mov source in instruction word 0x{0:04X}")]
    ReservedMovSource(u16),

    #[error("reserved set destination in instruction word 0x{0:04X}")]
    ReservedSetDestination(u16),

    #[error("non-zero operand bits in push/pull instruction word 0x{0:04X}")]
    NonZeroPushPullBits(u16),

    #[error("reserved flag bit in irq instruction word 0x{0:04X}")]
    ReservedIrqBit(u16),

    #[error("invalid irq index {index} in instruction word 0x{word:04X}")]
    InvalidIrqIndex { word: u16, index: u8 },
}

/// How the engine retires an executed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// Advance the PC (with wrap) and arm the delay.
    Complete,
    /// Keep the PC, re-run next tick, delay not yet armed.
    Stall,
    /// The instruction wrote the PC itself; arm the delay only.
    Jump,
}

/// JMP branch condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JmpCondition {
    Always,
    /// X is zero.
    NotX,
    /// X is non-zero, prior to a decrement that happens either way.
    DecX,
    /// Y is zero.
    NotY,
    /// Y is non-zero, prior to a decrement that happens either way.
    DecY,
    XNotEqualY,
    /// The EXECCTRL.JMP_PIN pad is high.
    Pin,
    /// The OSR has not reached its pull threshold.
    OsrNotEmpty,
}

/// WAIT bit source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSource {
    /// Absolute pad index.
    Gpio,
    /// Input-mapped pin: `(IN_BASE + index) & 31`.
    Pin,
    /// IRQ flag, index possibly machine-relative.
    Irq,
}

/// IN data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InSource {
    Pins,
    X,
    Y,
    Null,
    Isr,
    Osr,
}

/// OUT data destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutDestination {
    Pins,
    X,
    Y,
    Null,
    PinDirs,
    Pc,
    Isr,
    Exec,
}

/// MOV data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovSource {
    Pins,
    X,
    Y,
    Null,
    /// FIFO level comparison word, per EXECCTRL.STATUS_SEL/STATUS_N.
    Status,
    Isr,
    Osr,
}

/// MOV data destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovDestination {
    Pins,
    X,
    Y,
    Exec,
    Pc,
    Isr,
    Osr,
}

/// MOV transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovOp {
    None,
    Invert,
    BitReverse,
}

/// SET data destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetDestination {
    Pins,
    X,
    Y,
    PinDirs,
}

/// Decoded instruction kind with operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Jmp {
        condition: JmpCondition,
        address: u8,
    },
    Wait {
        polarity: Bit,
        source: WaitSource,
        index: u8,
    },
    In {
        source: InSource,
        bit_count: u8,
    },
    Out {
        destination: OutDestination,
        bit_count: u8,
    },
    Push {
        if_full: bool,
        block: bool,
    },
    Pull {
        if_empty: bool,
        block: bool,
    },
    Mov {
        destination: MovDestination,
        op: MovOp,
        source: MovSource,
    },
    Irq {
        clear: bool,
        wait: bool,
        index: u8,
    },
    Set {
        destination: SetDestination,
        data: u8,
    },
}

/// A decoded instruction: kind plus the delay and side-set annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub kind: InstructionKind,
    /// Idle cycles armed after the instruction retires (0..=31).
    pub delay: u8,
    /// Side-set value to drive, when the field carries one.
    pub side_set: Option<u8>,
}

/// Effective IRQ flag number for a possibly machine-relative index.
pub fn irq_num(sm_num: u8, index: u8) -> u8 {
    if index & 0x10 != 0 {
        (sm_num + index) & 0x3
    } else {
        index & 0x7
    }
}

/// Validate the IRQ index constraints shared by WAIT IRQ and IRQ.
fn check_irq_index(word: u16, index: u8) -> Result<(), DecodeError> {
    if index & 0x08 != 0 || (index & 0x10 != 0 && index & 0x04 != 0) {
        return Err(DecodeError::InvalidIrqIndex { word, index });
    }
    Ok(())
}

fn irq_index_display(index: u8) -> String {
    if index & 0x10 != 0 {
        format!("{}_rel", index & 0x3)
    } else {
        (index & 0x7).to_string()
    }
}

impl Instruction {
    /// Decode a 16-bit instruction word against the machine's side-set
    /// configuration (`sideset_count` is PINCTRL.SIDESET_COUNT, already
    /// bounded to 0..=5; `side_en` is EXECCTRL.SIDE_EN).
    pub fn decode(word: u16, sideset_count: u8, side_en: bool) -> Result<Self, DecodeError> {
        let df = (word >> 8 & 0x1F) as u8;
        let delay = df & DELAY_MASK[sideset_count as usize];
        let side_set = if sideset_count == 0 {
            None
        } else if side_en {
            // the top bit of the field gates the side-set operation
            if df & 0x10 != 0 {
                Some((df & 0x0F) >> (5 - sideset_count))
            } else {
                None
            }
        } else {
            Some(df >> (5 - sideset_count))
        };

        let kind = decode_kind(word)?;
        Ok(Self {
            kind,
            delay,
            side_set,
        })
    }

    /// Execute against the owning state machine.
    ///
    /// A re-executed stalled instruction consults the machine's stall latch
    /// so one-shot side effects (the IN/OUT shift-and-deliver phase, the
    /// IRQ set) run only on the first attempt.
    pub fn execute(&self, sm: &mut StateMachine) -> ExecResult {
        match self.kind {
            InstructionKind::Jmp { condition, address } => {
                let take = match condition {
                    JmpCondition::Always => true,
                    JmpCondition::NotX => sm.x == 0,
                    JmpCondition::DecX => {
                        let take = sm.x != 0;
                        sm.x = sm.x.wrapping_sub(1);
                        take
                    }
                    JmpCondition::NotY => sm.y == 0,
                    JmpCondition::DecY => {
                        let take = sm.y != 0;
                        sm.y = sm.y.wrapping_sub(1);
                        take
                    }
                    JmpCondition::XNotEqualY => sm.x != sm.y,
                    JmpCondition::Pin => sm.jmp_pin().is_high(),
                    JmpCondition::OsrNotEmpty => !sm.osr_empty(),
                };
                if take {
                    sm.pc = address;
                    ExecResult::Jump
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Wait {
                polarity,
                source,
                index,
            } => {
                let bit = match source {
                    WaitSource::Gpio => sm.gpio.borrow().get_bit(index),
                    WaitSource::Pin => sm
                        .gpio
                        .borrow()
                        .get_bit((sm.pin_ctrl.in_base + index) & 0x1F),
                    WaitSource::Irq => {
                        let num = irq_num(sm.num, index);
                        let bit = sm.irq.borrow().get(num);
                        // a satisfied high wait consumes the flag
                        if polarity == Bit::High && bit == Bit::High {
                            sm.irq.borrow_mut().clear(num);
                        }
                        bit
                    }
                };
                if bit != polarity {
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::In { source, bit_count } => {
                if !sm.stalled {
                    let data = sm.read_in_source(source);
                    match sm.shift_ctrl.in_shiftdir {
                        ShiftDir::Left => sm.isr.shift_in_left(bit_count, data),
                        ShiftDir::Right => sm.isr.shift_in_right(bit_count, data),
                    }
                }
                if sm.rx_push(true, true) {
                    sm.stalled = true;
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Out {
                destination,
                bit_count,
            } => {
                if !sm.stalled {
                    let data = match sm.shift_ctrl.out_shiftdir {
                        ShiftDir::Left => sm.osr.shift_out_left(bit_count),
                        ShiftDir::Right => sm.osr.shift_out_right(bit_count),
                    };
                    sm.write_out_destination(destination, data);
                }
                let stall = sm.tx_pull(true, true);
                if destination == OutDestination::Exec {
                    // the injected word runs next tick; this OUT never retries
                    ExecResult::Stall
                } else if destination == OutDestination::Pc {
                    ExecResult::Jump
                } else if stall {
                    sm.stalled = true;
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Push { if_full, block } => {
                if sm.rx_push(if_full, block) {
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Pull { if_empty, block } => {
                if sm.tx_pull(if_empty, block) {
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Mov {
                destination,
                op,
                source,
            } => {
                let data = sm.read_mov_source(source);
                let data = match op {
                    MovOp::None => data,
                    MovOp::Invert => !data,
                    MovOp::BitReverse => bits::reverse(data),
                };
                match destination {
                    MovDestination::Pins => {
                        sm.write_out_pins(data);
                        ExecResult::Complete
                    }
                    MovDestination::X => {
                        sm.x = data;
                        ExecResult::Complete
                    }
                    MovDestination::Y => {
                        sm.y = data;
                        ExecResult::Complete
                    }
                    MovDestination::Exec => {
                        sm.insert_instruction(data as u16);
                        ExecResult::Stall
                    }
                    MovDestination::Pc => {
                        sm.pc = (data & 0x1F) as u8;
                        ExecResult::Jump
                    }
                    MovDestination::Isr => {
                        sm.isr.set_value(data);
                        ExecResult::Complete
                    }
                    MovDestination::Osr => {
                        sm.osr.set_value(data);
                        ExecResult::Complete
                    }
                }
            }

            InstructionKind::Irq { clear, wait, index } => {
                let num = irq_num(sm.num, index);
                if clear {
                    sm.irq.borrow_mut().clear(num);
                    ExecResult::Complete
                } else if !wait {
                    sm.irq.borrow_mut().set(num);
                    ExecResult::Complete
                } else if !sm.stalled {
                    sm.irq.borrow_mut().set(num);
                    sm.stalled = true;
                    ExecResult::Stall
                } else if sm.irq.borrow().get(num).is_high() {
                    ExecResult::Stall
                } else {
                    ExecResult::Complete
                }
            }

            InstructionKind::Set { destination, data } => {
                match destination {
                    SetDestination::Pins => sm.write_set_pins(data as u32),
                    SetDestination::X => sm.x = data as u32,
                    SetDestination::Y => sm.y = data as u32,
                    SetDestination::PinDirs => sm.write_set_pin_dirs(data as u32),
                }
                ExecResult::Complete
            }
        }
    }
}

fn decode_kind(word: u16) -> Result<InstructionKind, DecodeError> {
    let lsb = (word & 0xFF) as u8;
    match word >> 13 {
        0b000 => Ok(InstructionKind::Jmp {
            condition: match lsb >> 5 & 0x7 {
                0b000 => JmpCondition::Always,
                0b001 => JmpCondition::NotX,
                0b010 => JmpCondition::DecX,
                0b011 => JmpCondition::NotY,
                0b100 => JmpCondition::DecY,
                0b101 => JmpCondition::XNotEqualY,
                0b110 => JmpCondition::Pin,
                _ => JmpCondition::OsrNotEmpty,
            },
            address: lsb & 0x1F,
        }),

        0b001 => {
            let source = match lsb >> 5 & 0x3 {
                0b00 => WaitSource::Gpio,
                0b01 => WaitSource::Pin,
                0b10 => WaitSource::Irq,
                _ => return Err(DecodeError::ReservedWaitSource(word)),
            };
            let index = lsb & 0x1F;
            if source == WaitSource::Irq {
                check_irq_index(word, index)?;
            }
            Ok(InstructionKind::Wait {
                polarity: Bit::from_bool(lsb & 0x80 != 0),
                source,
                index,
            })
        }

        0b010 => Ok(InstructionKind::In {
            source: match lsb >> 5 & 0x7 {
                0b000 => InSource::Pins,
                0b001 => InSource::X,
                0b010 => InSource::Y,
                0b011 => InSource::Null,
                0b110 => InSource::Isr,
                0b111 => InSource::Osr,
                _ => return Err(DecodeError::ReservedInSource(word)),
            },
            bit_count: bit_count(lsb),
        }),

        0b011 => Ok(InstructionKind::Out {
            destination: match lsb >> 5 & 0x7 {
                0b000 => OutDestination::Pins,
                0b001 => OutDestination::X,
                0b010 => OutDestination::Y,
                0b011 => OutDestination::Null,
                0b100 => OutDestination::PinDirs,
                0b101 => OutDestination::Pc,
                0b110 => OutDestination::Isr,
                _ => OutDestination::Exec,
            },
            bit_count: bit_count(lsb),
        }),

        0b100 => {
            if lsb & 0x1F != 0 {
                return Err(DecodeError::NonZeroPushPullBits(word));
            }
            let if_flag = lsb & 0x40 != 0;
            let block = lsb & 0x20 != 0;
            if lsb & 0x80 != 0 {
                Ok(InstructionKind::Pull {
                    if_empty: if_flag,
                    block,
                })
            } else {
                Ok(InstructionKind::Push {
                    if_full: if_flag,
                    block,
                })
            }
        }

        0b101 => Ok(InstructionKind::Mov {
            destination: match lsb >> 5 & 0x7 {
                0b000 => MovDestination::Pins,
                0b001 => MovDestination::X,
                0b010 => MovDestination::Y,
                0b100 => MovDestination::Exec,
                0b101 => MovDestination::Pc,
                0b110 => MovDestination::Isr,
                0b111 => MovDestination::Osr,
                _ => return Err(DecodeError::ReservedMovDestination(word)),
            },
            op: match lsb >> 3 & 0x3 {
                0b00 => MovOp::None,
                0b01 => MovOp::Invert,
                0b10 => MovOp::BitReverse,
                _ => return Err(DecodeError::ReservedMovOperation(word)),
            },
            source: match lsb & 0x7 {
                0b000 => MovSource::Pins,
                0b001 => MovSource::X,
                0b010 => MovSource::Y,
                0b011 => MovSource::Null,
                0b101 => MovSource::Status,
                0b110 => MovSource::Isr,
                0b111 => MovSource::Osr,
                _ => return Err(DecodeError::ReservedMovSource(word)),
            },
        }),

        0b110 => {
            if lsb & 0x80 != 0 {
                return Err(DecodeError::ReservedIrqBit(word));
            }
            let index = lsb & 0x1F;
            check_irq_index(word, index)?;
            Ok(InstructionKind::Irq {
                clear: lsb & 0x40 != 0,
                wait: lsb & 0x20 != 0,
                index,
            })
        }

        _ => Ok(InstructionKind::Set {
            destination: match lsb >> 5 & 0x7 {
                0b000 => SetDestination::Pins,
                0b001 => SetDestination::X,
                0b010 => SetDestination::Y,
                0b100 => SetDestination::PinDirs,
                _ => return Err(DecodeError::ReservedSetDestination(word)),
            },
            data: lsb & 0x1F,
        }),
    }
}

/// Shift width operand: 0 encodes a full 32-bit move.
fn bit_count(lsb: u8) -> u8 {
    let count = lsb & 0x1F;
    if count == 0 {
        32
    } else {
        count
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match self.kind {
            InstructionKind::Jmp { condition, address } => {
                let cond = match condition {
                    JmpCondition::Always => "",
                    JmpCondition::NotX => "!x",
                    JmpCondition::DecX => "x--",
                    JmpCondition::NotY => "!y",
                    JmpCondition::DecY => "y--",
                    JmpCondition::XNotEqualY => "x!=y",
                    JmpCondition::Pin => "pin",
                    JmpCondition::OsrNotEmpty => "!osre",
                };
                if cond.is_empty() {
                    format!("jmp {}", address)
                } else {
                    format!("jmp {}, {}", cond, address)
                }
            }
            InstructionKind::Wait {
                polarity,
                source,
                index,
            } => {
                let pol = if polarity == Bit::High { 1 } else { 0 };
                let (src, num) = match source {
                    WaitSource::Gpio => ("gpio", index.to_string()),
                    WaitSource::Pin => ("pin", index.to_string()),
                    WaitSource::Irq => ("irq", irq_index_display(index)),
                };
                format!("wait {} {} {}", pol, src, num)
            }
            InstructionKind::In { source, bit_count } => {
                let src = match source {
                    InSource::Pins => "pins",
                    InSource::X => "x",
                    InSource::Y => "y",
                    InSource::Null => "null",
                    InSource::Isr => "isr",
                    InSource::Osr => "osr",
                };
                format!("in {}, {}", src, bit_count)
            }
            InstructionKind::Out {
                destination,
                bit_count,
            } => {
                let dst = match destination {
                    OutDestination::Pins => "pins",
                    OutDestination::X => "x",
                    OutDestination::Y => "y",
                    OutDestination::Null => "null",
                    OutDestination::PinDirs => "pindirs",
                    OutDestination::Pc => "pc",
                    OutDestination::Isr => "isr",
                    OutDestination::Exec => "exec",
                };
                format!("out {}, {}", dst, bit_count)
            }
            InstructionKind::Push { if_full, block } => format!(
                "push{}{}",
                if if_full { " iffull" } else { "" },
                if block { " block" } else { " noblock" }
            ),
            InstructionKind::Pull { if_empty, block } => format!(
                "pull{}{}",
                if if_empty { " ifempty" } else { "" },
                if block { " block" } else { " noblock" }
            ),
            InstructionKind::Mov {
                destination,
                op,
                source,
            } => {
                let dst = match destination {
                    MovDestination::Pins => "pins",
                    MovDestination::X => "x",
                    MovDestination::Y => "y",
                    MovDestination::Exec => "exec",
                    MovDestination::Pc => "pc",
                    MovDestination::Isr => "isr",
                    MovDestination::Osr => "osr",
                };
                let op = match op {
                    MovOp::None => "",
                    MovOp::Invert => "!",
                    MovOp::BitReverse => "::",
                };
                let src = match source {
                    MovSource::Pins => "pins",
                    MovSource::X => "x",
                    MovSource::Y => "y",
                    MovSource::Null => "null",
                    MovSource::Status => "status",
                    MovSource::Isr => "isr",
                    MovSource::Osr => "osr",
                };
                format!("mov {}, {}{}", dst, op, src)
            }
            InstructionKind::Irq { clear, wait, index } => {
                let mode = if clear {
                    " clear"
                } else if wait {
                    " wait"
                } else {
                    ""
                };
                format!("irq{} {}", mode, irq_index_display(index))
            }
            InstructionKind::Set { destination, data } => {
                let dst = match destination {
                    SetDestination::Pins => "pins",
                    SetDestination::X => "x",
                    SetDestination::Y => "y",
                    SetDestination::PinDirs => "pindirs",
                };
                format!("set {}, {}", dst, data)
            }
        };

        let mut suffix = String::new();
        if let Some(side_set) = self.side_set {
            suffix.push_str(&format!("side {}", side_set));
        }
        if self.delay > 0 {
            if !suffix.is_empty() {
                suffix.push(' ');
            }
            suffix.push_str(&format!("[{}]", self.delay));
        }
        if suffix.is_empty() {
            write!(f, "{}", body)
        } else {
            write!(f, "{:<16}{}", body, suffix)
        }
    }
}
