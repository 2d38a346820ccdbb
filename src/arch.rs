use crate::aarch64;
use crate::encoding::Encoding;
use crate::x86_64;

/// The instruction set a compact unwind table was built for.
///
/// Supplied by the surrounding image parser; the table bytes themselves do
/// not record it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
}

impl Arch {
    /// Whether this encoding is only a pointer at full DWARF call-frame info.
    ///
    /// Such encodings are never placed in the common encodings table and are
    /// never merged with a neighboring function.
    pub fn encoding_means_use_dwarf(self, encoding: Encoding) -> bool {
        match self {
            Arch::X86_64 => encoding.mode() == x86_64::MODE_DWARF,
            Arch::Arm64 => encoding.mode() == aarch64::MODE_DWARF,
        }
    }

    /// Whether adjacent functions with this bit-identical encoding must still
    /// keep separate entries.
    ///
    /// The x86-64 frameless-indirect mode stores an offset into the function
    /// bytes, so two functions can share the bits but not the meaning.
    pub fn encoding_cannot_be_merged(self, encoding: Encoding) -> bool {
        match self {
            Arch::X86_64 => encoding.mode() == x86_64::MODE_STACK_IND,
            Arch::Arm64 => false,
        }
    }
}
