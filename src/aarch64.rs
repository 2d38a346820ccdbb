//! Decoding of arm64 compact unwind encodings, used for diagnostics.

use std::fmt::Display;

use crate::encoding::{extract_bits, Encoding};

pub const MODE_FRAMELESS: u32 = 0x0200_0000;
pub const MODE_DWARF: u32 = 0x0300_0000;
pub const MODE_FRAME: u32 = 0x0400_0000;

pub const FRAME_X19_X20_PAIR: u32 = 0x0000_0001;
pub const FRAME_X21_X22_PAIR: u32 = 0x0000_0002;
pub const FRAME_X23_X24_PAIR: u32 = 0x0000_0004;
pub const FRAME_X25_X26_PAIR: u32 = 0x0000_0008;
pub const FRAME_X27_X28_PAIR: u32 = 0x0000_0010;
pub const FRAME_D8_D9_PAIR: u32 = 0x0000_0020;
pub const FRAME_D10_D11_PAIR: u32 = 0x0000_0040;
pub const FRAME_D12_D13_PAIR: u32 = 0x0000_0080;
pub const FRAME_D14_D15_PAIR: u32 = 0x0000_0100;

pub const FRAMELESS_STACK_SIZE_MASK: u32 = 0x00FF_F000;
pub const DWARF_SECTION_OFFSET: u32 = 0x00FF_FFFF;

/// Which callee-save register pairs the prologue pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedRegisterPairs {
    pub x19_and_x20: bool,
    pub x21_and_x22: bool,
    pub x23_and_x24: bool,
    pub x25_and_x26: bool,
    pub x27_and_x28: bool,
    pub d8_and_d9: bool,
    pub d10_and_d11: bool,
    pub d12_and_d13: bool,
    pub d14_and_d15: bool,
}

impl SavedRegisterPairs {
    fn parse(value: u32) -> Self {
        SavedRegisterPairs {
            x19_and_x20: value & FRAME_X19_X20_PAIR != 0,
            x21_and_x22: value & FRAME_X21_X22_PAIR != 0,
            x23_and_x24: value & FRAME_X23_X24_PAIR != 0,
            x25_and_x26: value & FRAME_X25_X26_PAIR != 0,
            x27_and_x28: value & FRAME_X27_X28_PAIR != 0,
            d8_and_d9: value & FRAME_D8_D9_PAIR != 0,
            d10_and_d11: value & FRAME_D10_D11_PAIR != 0,
            d12_and_d13: value & FRAME_D12_D13_PAIR != 0,
            d14_and_d15: value & FRAME_D14_D15_PAIR != 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.x19_and_x20
            || self.x21_and_x22
            || self.x23_and_x24
            || self.x25_and_x26
            || self.x27_and_x28
            || self.d8_and_d9
            || self.d10_and_d11
            || self.d12_and_d13
            || self.d14_and_d15)
    }
}

impl Display for SavedRegisterPairs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut write_pair = |saved: bool, name: &str| {
            if saved {
                write!(f, " {}", name)
            } else {
                Ok(())
            }
        };
        write_pair(self.x19_and_x20, "x19/20")?;
        write_pair(self.x21_and_x22, "x21/22")?;
        write_pair(self.x23_and_x24, "x23/24")?;
        write_pair(self.x25_and_x26, "x25/26")?;
        write_pair(self.x27_and_x28, "x27/28")?;
        write_pair(self.d8_and_d9, "d8/9")?;
        write_pair(self.d10_and_d11, "d10/11")?;
        write_pair(self.d12_and_d13, "d12/13")?;
        write_pair(self.d14_and_d15, "d14/15")?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingArm64 {
    Null,
    /// No frame record; sp was moved down by a fixed amount.
    Frameless {
        stack_size_in_bytes: u32,
        saved_registers: SavedRegisterPairs,
    },
    /// Defer to the DWARF FDE at this offset into the debug call-frame
    /// section.
    Dwarf { fde_offset: u32 },
    /// Standard fp/lr frame record with optional saved register pairs.
    Frame { saved_registers: SavedRegisterPairs },
}

impl EncodingArm64 {
    pub fn parse(encoding: Encoding) -> Option<Self> {
        let value = encoding.0;
        match encoding.mode() {
            0 if value == 0 => Some(EncodingArm64::Null),
            MODE_FRAMELESS => Some(EncodingArm64::Frameless {
                stack_size_in_bytes: extract_bits(value, FRAMELESS_STACK_SIZE_MASK) * 16,
                saved_registers: SavedRegisterPairs::parse(value),
            }),
            MODE_DWARF => Some(EncodingArm64::Dwarf {
                fde_offset: value & DWARF_SECTION_OFFSET,
            }),
            MODE_FRAME => Some(EncodingArm64::Frame {
                saved_registers: SavedRegisterPairs::parse(value),
            }),
            _ => None,
        }
    }
}

impl Display for EncodingArm64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingArm64::Null => write!(f, "no unwind information"),
            EncodingArm64::Frameless {
                stack_size_in_bytes,
                saved_registers,
            } => {
                if *stack_size_in_bytes == 0 && saved_registers.is_empty() {
                    return write!(f, "no frame, no saved registers");
                }
                write!(f, "stack size={}:{}", stack_size_in_bytes, saved_registers)
            }
            EncodingArm64::Dwarf { fde_offset } => {
                write!(f, "dwarf offset 0x{:08X}", fde_offset)
            }
            EncodingArm64::Frame { saved_registers } => {
                if saved_registers.is_empty() {
                    write!(f, "std frame, no saved registers")
                } else {
                    write!(f, "std frame:{}", saved_registers)
                }
            }
        }
    }
}

/// Format an encoding for diagnostics. Function bytes are never needed on
/// arm64.
pub fn describe(encoding: Encoding) -> String {
    match EncodingArm64::parse(encoding) {
        Some(decoded) => decoded.to_string(),
        None => format!("unknown arm64 compact encoding 0x{:08X}", encoding.0),
    }
}
