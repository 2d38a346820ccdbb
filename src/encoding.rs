use std::fmt::Debug;

use crate::display_utils::HexNum;

/// Set when the entry is the start of a function rather than a mid-function
/// state change. Kept for wire compatibility; this crate does not act on it.
pub const UNWIND_IS_START_OF_FUNCTION: u32 = 0x8000_0000;

/// Set when the function has a Language-Specific Data Area entry.
pub const UNWIND_HAS_LSDA: u32 = 0x4000_0000;

/// Two-bit 1-based index into the personality table. Zero means no
/// personality function.
pub const UNWIND_PERSONALITY_MASK: u32 = 0x3000_0000;

/// Selects the architecture-specific mode. The meaning of the low 24 bits
/// depends entirely on this selector and the architecture.
pub const UNWIND_MODE_MASK: u32 = 0x0F00_0000;

/// A 32-bit compact unwind encoding.
///
/// The top bits are uniform across architectures (see the `UNWIND_*` masks);
/// the rest is interpreted by the [`x86_64`](crate::x86_64) and
/// [`aarch64`](crate::aarch64) modules.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Encoding(pub u32);

impl Encoding {
    pub fn has_lsda(self) -> bool {
        self.0 & UNWIND_HAS_LSDA != 0
    }

    /// The 1-based personality index, or 0 if the function has no
    /// personality function.
    pub fn personality_index(self) -> u8 {
        ((self.0 & UNWIND_PERSONALITY_MASK) >> UNWIND_PERSONALITY_MASK.trailing_zeros()) as u8
    }

    /// The mode selector bits, still in their in-word position.
    pub fn mode(self) -> u32 {
        self.0 & UNWIND_MODE_MASK
    }

    pub(crate) fn with_lsda(self) -> Encoding {
        Encoding(self.0 | UNWIND_HAS_LSDA)
    }

    pub(crate) fn with_personality_index(self, index: u8) -> Encoding {
        let shift = UNWIND_PERSONALITY_MASK.trailing_zeros();
        Encoding((self.0 & !UNWIND_PERSONALITY_MASK) | ((index as u32) << shift))
    }
}

impl From<u32> for Encoding {
    fn from(value: u32) -> Encoding {
        Encoding(value)
    }
}

impl Debug for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Encoding").field(&HexNum(self.0)).finish()
    }
}

/// Extract the bits selected by `mask`, shifted down to the low end.
pub(crate) fn extract_bits(value: u32, mask: u32) -> u32 {
    (value >> mask.trailing_zeros()) & ((1 << mask.count_ones()) - 1)
}
