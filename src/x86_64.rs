//! Decoding of x86-64 compact unwind encodings, used for diagnostics.

use std::fmt::Display;

use arrayvec::ArrayVec;
use object::LittleEndian;

use crate::encoding::{extract_bits, Encoding};
use crate::raw::ReadIntoRef;

pub const MODE_RBP_FRAME: u32 = 0x0100_0000;
pub const MODE_STACK_IMMD: u32 = 0x0200_0000;
pub const MODE_STACK_IND: u32 = 0x0300_0000;
pub const MODE_DWARF: u32 = 0x0400_0000;

pub const RBP_FRAME_REGISTERS: u32 = 0x0000_7FFF;
pub const RBP_FRAME_OFFSET: u32 = 0x00FF_0000;
pub const FRAMELESS_STACK_SIZE: u32 = 0x00FF_0000;
pub const FRAMELESS_STACK_ADJUST: u32 = 0x0000_E000;
pub const FRAMELESS_STACK_REG_COUNT: u32 = 0x0000_1C00;
pub const FRAMELESS_STACK_REG_PERMUTATION: u32 = 0x0000_03FF;
pub const DWARF_SECTION_OFFSET: u32 = 0x00FF_FFFF;

/// The callee-save registers that can appear in an unwind recipe, in their
/// 3-bit wire numbering (1 through 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rbx,
    R12,
    R13,
    R14,
    R15,
    Rbp,
}

impl Reg {
    fn from_number(number: u32) -> Option<Reg> {
        match number {
            1 => Some(Reg::Rbx),
            2 => Some(Reg::R12),
            3 => Some(Reg::R13),
            4 => Some(Reg::R14),
            5 => Some(Reg::R15),
            6 => Some(Reg::Rbp),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Reg::Rbx => "rbx",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::Rbp => "rbp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingX86_64 {
    Null,
    /// rbp-based frame; `saved_registers` holds five 3-bit register slots,
    /// stored at `-frame_offset_in_bytes` below rbp.
    RbpFrame {
        saved_registers: u32,
        frame_offset_in_bytes: u32,
    },
    /// No frame pointer; the stack size is in the encoding itself.
    FramelessImmediate {
        stack_size_in_bytes: u32,
        saved_registers: ArrayVec<Reg, 6>,
    },
    /// No frame pointer; the stack size lives in a `sub` instruction inside
    /// the function bytes at `stack_size_instruction_offset`.
    FramelessIndirect {
        stack_size_instruction_offset: u32,
        stack_adjust_in_bytes: u32,
        saved_registers: ArrayVec<Reg, 6>,
    },
    /// Defer to the DWARF FDE at this offset into the debug call-frame
    /// section.
    Dwarf { fde_offset: u32 },
}

impl EncodingX86_64 {
    pub fn parse(encoding: Encoding) -> Option<Self> {
        let value = encoding.0;
        match encoding.mode() {
            0 if value == 0 => Some(EncodingX86_64::Null),
            MODE_RBP_FRAME => Some(EncodingX86_64::RbpFrame {
                saved_registers: extract_bits(value, RBP_FRAME_REGISTERS),
                frame_offset_in_bytes: extract_bits(value, RBP_FRAME_OFFSET) * 8,
            }),
            MODE_STACK_IMMD => Some(EncodingX86_64::FramelessImmediate {
                stack_size_in_bytes: extract_bits(value, FRAMELESS_STACK_SIZE) * 8,
                saved_registers: frameless_registers(value)?,
            }),
            MODE_STACK_IND => Some(EncodingX86_64::FramelessIndirect {
                stack_size_instruction_offset: extract_bits(value, FRAMELESS_STACK_SIZE),
                stack_adjust_in_bytes: extract_bits(value, FRAMELESS_STACK_ADJUST) * 8,
                saved_registers: frameless_registers(value)?,
            }),
            MODE_DWARF => Some(EncodingX86_64::Dwarf {
                fde_offset: value & DWARF_SECTION_OFFSET,
            }),
            _ => None,
        }
    }
}

fn frameless_registers(value: u32) -> Option<ArrayVec<Reg, 6>> {
    decode_permutation(
        extract_bits(value, FRAMELESS_STACK_REG_COUNT),
        extract_bits(value, FRAMELESS_STACK_REG_PERMUTATION),
    )
}

/// Un-permute the factorial-base-packed register list back into wire
/// register numbers, in push order.
pub fn decode_permutation(reg_count: u32, permutation: u32) -> Option<ArrayVec<Reg, 6>> {
    let mut digits = [0u32; 6];
    let mut p = permutation;
    match reg_count {
        0 => return Some(ArrayVec::new()),
        1 => {
            digits[0] = p;
        }
        2 => {
            digits[0] = p / 5;
            digits[1] = p % 5;
        }
        3 => {
            digits[0] = p / 20;
            p %= 20;
            digits[1] = p / 4;
            digits[2] = p % 4;
        }
        4 => {
            digits[0] = p / 60;
            p %= 60;
            digits[1] = p / 12;
            p %= 12;
            digits[2] = p / 3;
            digits[3] = p % 3;
        }
        5 | 6 => {
            digits[0] = p / 120;
            p %= 120;
            digits[1] = p / 24;
            p %= 24;
            digits[2] = p / 6;
            p %= 6;
            digits[3] = p / 2;
            digits[4] = p % 2;
            // with all six registers pushed the last slot is forced
            digits[5] = 0;
        }
        _ => return None,
    }

    let mut used = [false; 7];
    let mut registers = ArrayVec::new();
    for &digit in digits.iter().take(reg_count as usize) {
        let mut unused_seen = 0;
        let mut chosen = None;
        for number in 1..7u32 {
            if used[number as usize] {
                continue;
            }
            if unused_seen == digit {
                used[number as usize] = true;
                chosen = Some(number);
                break;
            }
            unused_seen += 1;
        }
        registers.push(Reg::from_number(chosen?)?);
    }
    Some(registers)
}

fn write_registers(f: &mut std::fmt::Formatter<'_>, registers: &[Reg]) -> std::fmt::Result {
    for (i, reg) in registers.iter().enumerate() {
        if i != 0 {
            f.write_str(",")?;
        }
        f.write_str(reg.name())?;
    }
    Ok(())
}

impl Display for EncodingX86_64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingX86_64::Null => write!(f, "no unwind information"),
            EncodingX86_64::RbpFrame {
                saved_registers,
                frame_offset_in_bytes,
            } => {
                if *saved_registers == 0 {
                    return write!(f, "rbp frame, no saved registers");
                }
                write!(f, "rbp frame, at -{}: ", frame_offset_in_bytes)?;
                let mut slots = *saved_registers;
                for i in 0..5 {
                    if i != 0 {
                        f.write_str(",")?;
                    }
                    match Reg::from_number(slots & 0x7) {
                        Some(reg) => f.write_str(reg.name())?,
                        None if slots & 0x7 == 0 => f.write_str("-")?,
                        None => f.write_str("r?")?,
                    }
                    slots >>= 3;
                    if slots == 0 {
                        break;
                    }
                }
                Ok(())
            }
            EncodingX86_64::FramelessImmediate {
                stack_size_in_bytes,
                saved_registers,
            } => {
                write!(f, "stack size={}, ", stack_size_in_bytes)?;
                if saved_registers.is_empty() {
                    write!(f, "no registers saved")
                } else {
                    write_registers(f, saved_registers)
                }
            }
            EncodingX86_64::FramelessIndirect {
                stack_size_instruction_offset,
                stack_adjust_in_bytes,
                saved_registers,
            } => {
                write!(
                    f,
                    "stack size at function offset {} (+{} adjust), ",
                    stack_size_instruction_offset, stack_adjust_in_bytes
                )?;
                if saved_registers.is_empty() {
                    write!(f, "no registers saved")
                } else {
                    write_registers(f, saved_registers)
                }
            }
            EncodingX86_64::Dwarf { fde_offset } => {
                write!(f, "dwarf offset 0x{:08X}", fde_offset)
            }
        }
    }
}

/// Format an encoding for diagnostics.
///
/// `func_bytes` is consulted only for the frameless-indirect mode, where the
/// stack size is the immediate of a `sub` instruction inside the function.
pub fn describe(encoding: Encoding, func_bytes: &[u8]) -> String {
    match EncodingX86_64::parse(encoding) {
        Some(EncodingX86_64::FramelessIndirect {
            stack_size_instruction_offset,
            stack_adjust_in_bytes,
            saved_registers,
        }) => {
            let immediate = func_bytes
                .read_at::<object::U32<LittleEndian>>(stack_size_instruction_offset.into())
                .map(|v| v.get(LittleEndian));
            match immediate {
                Some(sub_immediate) => {
                    let mut out = format!(
                        "stack size=0x{:08X}, ",
                        sub_immediate.wrapping_add(stack_adjust_in_bytes)
                    );
                    if saved_registers.is_empty() {
                        out.push_str("no registers saved");
                    } else {
                        for (i, reg) in saved_registers.iter().enumerate() {
                            if i != 0 {
                                out.push(',');
                            }
                            out.push_str(reg.name());
                        }
                    }
                    out
                }
                None => EncodingX86_64::FramelessIndirect {
                    stack_size_instruction_offset,
                    stack_adjust_in_bytes,
                    saved_registers,
                }
                .to_string(),
            }
        }
        Some(decoded) => decoded.to_string(),
        None => format!("unknown x86_64 compact encoding 0x{:08X}", encoding.0),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn permutation_identity_prefixes() {
        // permutation 0 always selects the registers in wire order
        assert_eq!(decode_permutation(0, 0).unwrap().as_slice(), &[]);
        assert_eq!(decode_permutation(1, 0).unwrap().as_slice(), &[Reg::Rbx]);
        assert_eq!(
            decode_permutation(3, 0).unwrap().as_slice(),
            &[Reg::Rbx, Reg::R12, Reg::R13]
        );
        assert_eq!(
            decode_permutation(6, 0).unwrap().as_slice(),
            &[Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15, Reg::Rbp]
        );
    }

    #[test]
    fn permutation_nontrivial() {
        // two registers, digits (1, 0): skip rbx, then the first remaining
        assert_eq!(
            decode_permutation(2, 5).unwrap().as_slice(),
            &[Reg::R12, Reg::Rbx]
        );
        // single register, digit 5 selects the last register
        assert_eq!(decode_permutation(1, 5).unwrap().as_slice(), &[Reg::Rbp]);
    }

    #[test]
    fn permutation_out_of_range() {
        assert_eq!(decode_permutation(7, 0), None);
        // digit larger than the number of remaining registers
        assert_eq!(decode_permutation(1, 6), None);
    }

    #[test]
    fn describe_rbp_frame() {
        // frame offset field 2 (-16 bytes), rbx in the first slot
        let s = describe(Encoding(MODE_RBP_FRAME | 0x0002_0000 | 1), &[]);
        assert_eq!(s, "rbp frame, at -16: rbx");

        let s = describe(Encoding(MODE_RBP_FRAME), &[]);
        assert_eq!(s, "rbp frame, no saved registers");
    }

    #[test]
    fn describe_frameless_immediate() {
        // stack size field 4 (32 bytes), no saved registers
        let s = describe(Encoding(MODE_STACK_IMMD | 0x0004_0000), &[]);
        assert_eq!(s, "stack size=32, no registers saved");

        // one register, permutation 0 (rbx)
        let s = describe(Encoding(MODE_STACK_IMMD | 0x0004_0000 | 0x0000_0400), &[]);
        assert_eq!(s, "stack size=32, rbx");
    }

    #[test]
    fn describe_frameless_indirect_reads_function_bytes() {
        // sub immediate at function offset 4
        let mut func = vec![0u8; 8];
        func[4..8].copy_from_slice(&0x40u32.to_le_bytes());
        let s = describe(Encoding(MODE_STACK_IND | 0x0004_0000), &func);
        assert_eq!(s, "stack size=0x00000040, no registers saved");

        // truncated function bytes degrade to the symbolic form
        let s = describe(Encoding(MODE_STACK_IND | 0x0004_0000), &[]);
        assert_eq!(s, "stack size at function offset 4 (+0 adjust), no registers saved");
    }

    #[test]
    fn describe_frameless_indirect_wraps_huge_immediate() {
        // adjust field 1 (8 bytes) on top of an immediate of u32::MAX
        let mut func = vec![0u8; 8];
        func[4..8].copy_from_slice(&u32::MAX.to_le_bytes());
        let s = describe(Encoding(MODE_STACK_IND | 0x0004_0000 | 0x0000_2000), &func);
        assert_eq!(s, "stack size=0x00000007, no registers saved");
    }

    #[test]
    fn describe_dwarf_and_unknown() {
        assert_eq!(
            describe(Encoding(MODE_DWARF | 0x123), &[]),
            "dwarf offset 0x00000123"
        );
        assert_eq!(describe(Encoding(0), &[]), "no unwind information");
        assert_eq!(
            describe(Encoding(0x0700_0000), &[]),
            "unknown x86_64 compact encoding 0x07000000"
        );
    }
}
