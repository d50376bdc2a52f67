//! Packed per-state-machine configuration registers.
//!
//! EXECCTRL, SHIFTCTRL and PINCTRL each get a typed field struct with an
//! exact `from_bits`/`to_bits` pair. Reserved bits read as zero and are
//! preserved as zero on write; `VALID_MASK` constants spell out which bits
//! carry state.
//!
//! # Bit layouts
//!
//! ```text
//! EXECCTRL:  [30]=SIDE_EN [29]=SIDE_PINDIR [28:24]=JMP_PIN
//!            [16:12]=WRAP_TOP [11:7]=WRAP_BOTTOM [4]=STATUS_SEL [3:0]=STATUS_N
//! SHIFTCTRL: [31]=FJOIN_RX [30]=FJOIN_TX [29:25]=PULL_THRESH [24:20]=PUSH_THRESH
//!            [19]=OUT_SHIFTDIR [18]=IN_SHIFTDIR [17]=AUTOPULL [16]=AUTOPUSH
//! PINCTRL:   [31:29]=SIDESET_COUNT [28:26]=SET_COUNT [25:20]=OUT_COUNT
//!            [19:15]=IN_BASE [14:10]=SIDESET_BASE [9:5]=SET_BASE [4:0]=OUT_BASE
//! ```
//!
//! OUT_COUNT occupies a six-bit field but its legal range is 0..=31, so its
//! top bit reads back as zero.

use crate::error::ConfigError;

/// Shift direction of the ISR/OSR datapath (register encoding: 1 = right).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDir {
    Left,
    Right,
}

impl ShiftDir {
    #[inline]
    pub fn from_bit(bit: u32) -> Self {
        if bit & 1 != 0 {
            ShiftDir::Right
        } else {
            ShiftDir::Left
        }
    }

    #[inline]
    pub fn to_bit(self) -> u32 {
        match self {
            ShiftDir::Left => 0,
            ShiftDir::Right => 1,
        }
    }
}

/// What the side-set field drives (register encoding: 1 = pin directions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDir {
    GpioLevels,
    PinDirs,
}

impl PinDir {
    #[inline]
    pub fn from_bit(bit: u32) -> Self {
        if bit & 1 != 0 {
            PinDir::PinDirs
        } else {
            PinDir::GpioLevels
        }
    }

    #[inline]
    pub fn to_bit(self) -> u32 {
        match self {
            PinDir::GpioLevels => 0,
            PinDir::PinDirs => 1,
        }
    }
}

/// EXECCTRL fields: side-set mode, jump pin, wrap window, MOV STATUS source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecCtrl {
    pub side_en: bool,
    pub side_pindir: PinDir,
    pub jmp_pin: u8,
    pub wrap_top: u8,
    pub wrap_bottom: u8,
    /// MOV STATUS watches RX when set, TX when clear.
    pub status_sel: bool,
    pub status_n: u8,
}

impl ExecCtrl {
    /// Bits of EXECCTRL that carry state.
    pub const VALID_MASK: u32 =
        1 << 30 | 1 << 29 | 0x1F << 24 | 0x1F << 12 | 0x1F << 7 | 1 << 4 | 0xF;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            side_en: bits >> 30 & 1 != 0,
            side_pindir: PinDir::from_bit(bits >> 29),
            jmp_pin: (bits >> 24 & 0x1F) as u8,
            wrap_top: (bits >> 12 & 0x1F) as u8,
            wrap_bottom: (bits >> 7 & 0x1F) as u8,
            status_sel: bits >> 4 & 1 != 0,
            status_n: (bits & 0xF) as u8,
        }
    }

    pub fn to_bits(self) -> u32 {
        (self.side_en as u32) << 30
            | self.side_pindir.to_bit() << 29
            | (self.jmp_pin as u32) << 24
            | (self.wrap_top as u32) << 12
            | (self.wrap_bottom as u32) << 7
            | (self.status_sel as u32) << 4
            | self.status_n as u32
    }
}

impl Default for ExecCtrl {
    /// Reset state: wrap over the whole memory, side-set optional off.
    fn default() -> Self {
        Self {
            side_en: false,
            side_pindir: PinDir::GpioLevels,
            jmp_pin: 0,
            wrap_top: 0x1F,
            wrap_bottom: 0x00,
            status_sel: false,
            status_n: 0,
        }
    }
}

/// SHIFTCTRL fields: FIFO joins, shift thresholds, directions, auto modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftCtrl {
    pub join_rx: bool,
    pub join_tx: bool,
    /// 0 encodes a full-word threshold of 32.
    pub pull_thresh: u8,
    /// 0 encodes a full-word threshold of 32.
    pub push_thresh: u8,
    pub out_shiftdir: ShiftDir,
    pub in_shiftdir: ShiftDir,
    pub autopull: bool,
    pub autopush: bool,
}

impl ShiftCtrl {
    /// Bits of SHIFTCTRL that carry state.
    pub const VALID_MASK: u32 =
        1 << 31 | 1 << 30 | 0x1F << 25 | 0x1F << 20 | 1 << 19 | 1 << 18 | 1 << 17 | 1 << 16;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            join_rx: bits >> 31 & 1 != 0,
            join_tx: bits >> 30 & 1 != 0,
            pull_thresh: (bits >> 25 & 0x1F) as u8,
            push_thresh: (bits >> 20 & 0x1F) as u8,
            out_shiftdir: ShiftDir::from_bit(bits >> 19),
            in_shiftdir: ShiftDir::from_bit(bits >> 18),
            autopull: bits >> 17 & 1 != 0,
            autopush: bits >> 16 & 1 != 0,
        }
    }

    pub fn to_bits(self) -> u32 {
        (self.join_rx as u32) << 31
            | (self.join_tx as u32) << 30
            | (self.pull_thresh as u32) << 25
            | (self.push_thresh as u32) << 20
            | self.out_shiftdir.to_bit() << 19
            | self.in_shiftdir.to_bit() << 18
            | (self.autopull as u32) << 17
            | (self.autopush as u32) << 16
    }
}

impl Default for ShiftCtrl {
    fn default() -> Self {
        Self {
            join_rx: false,
            join_tx: false,
            pull_thresh: 0,
            push_thresh: 0,
            out_shiftdir: ShiftDir::Left,
            in_shiftdir: ShiftDir::Left,
            autopull: false,
            autopush: false,
        }
    }
}

/// PINCTRL fields: pin window bases and counts for each I/O mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinCtrl {
    /// 0..=5; when EXECCTRL.SIDE_EN is set the top slot is the enable flag.
    pub sideset_count: u8,
    /// 0..=5.
    pub set_count: u8,
    /// 0..=31.
    pub out_count: u8,
    pub in_base: u8,
    pub sideset_base: u8,
    pub set_base: u8,
    pub out_base: u8,
}

impl PinCtrl {
    /// Bits of PINCTRL that carry state (bit 25 of OUT_COUNT reads as zero).
    pub const VALID_MASK: u32 =
        0x7 << 29 | 0x7 << 26 | 0x1F << 20 | 0x1F << 15 | 0x1F << 10 | 0x1F << 5 | 0x1F;

    /// Unpack PINCTRL, validating the count fields whose encodable range
    /// exceeds their legal one.
    pub fn from_bits(bits: u32) -> Result<Self, ConfigError> {
        let sideset_count = (bits >> 29 & 0x7) as u8;
        if sideset_count > 5 {
            return Err(ConfigError::out_of_range(
                "sideset count",
                sideset_count as u32,
                5,
            ));
        }
        let set_count = (bits >> 26 & 0x7) as u8;
        if set_count > 5 {
            return Err(ConfigError::out_of_range("set count", set_count as u32, 5));
        }
        let out_count = (bits >> 20 & 0x3F) as u8;
        if out_count > 31 {
            return Err(ConfigError::out_of_range("out count", out_count as u32, 31));
        }
        Ok(Self {
            sideset_count,
            set_count,
            out_count,
            in_base: (bits >> 15 & 0x1F) as u8,
            sideset_base: (bits >> 10 & 0x1F) as u8,
            set_base: (bits >> 5 & 0x1F) as u8,
            out_base: (bits & 0x1F) as u8,
        })
    }

    pub fn to_bits(self) -> u32 {
        (self.sideset_count as u32) << 29
            | (self.set_count as u32) << 26
            | (self.out_count as u32) << 20
            | (self.in_base as u32) << 15
            | (self.sideset_base as u32) << 10
            | (self.set_base as u32) << 5
            | self.out_base as u32
    }
}

impl Default for PinCtrl {
    /// Reset state: a five-pin SET window at base 0.
    fn default() -> Self {
        Self {
            sideset_count: 0,
            set_count: 5,
            out_count: 0,
            in_base: 0,
            sideset_base: 0,
            set_base: 0,
            out_base: 0,
        }
    }
}

/// Effective shift threshold: the 5-bit register value 0 encodes 32.
#[inline]
pub fn threshold(raw: u8) -> u8 {
    if raw == 0 {
        32
    } else {
        raw
    }
}
