//! A reader and builder for the compact unwind table format, the two-level
//! lookup structure that maps function offsets to 32-bit unwind encodings.
//!
//! [`UnwindReader`] parses an existing section: it validates the table
//! layout, iterates all per-function records, and answers point lookups by
//! instruction offset. [`UnwindBuilder`] goes the other way, packing a
//! sorted list of per-function encodings into a fresh section together with
//! the fixups a linker needs to patch in final addresses.
//!
//! The crate never allocates while reading; all reader types borrow the
//! section bytes.

pub mod aarch64;
mod arch;
mod builder;
mod display_utils;
mod encoding;
mod error;
pub mod raw;
mod reader;
pub mod x86_64;

pub use arch::Arch;
pub use builder::{
    BuiltUnwindTable, Diff24Fixup, ImageOffsetFixup, SymbolHandle, UnwindBuilder,
    WriterUnwindInfo, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
pub use encoding::{
    Encoding, UNWIND_HAS_LSDA, UNWIND_IS_START_OF_FUNCTION, UNWIND_MODE_MASK,
    UNWIND_PERSONALITY_MASK,
};
pub use error::{ReadError, Result};
pub use reader::{UnwindInfo, UnwindInfoIter, UnwindReader};
