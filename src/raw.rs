//! The wire format of the compact unwind section.
//!
//! All fields are little-endian u32 values with no alignment requirement,
//! so every struct here is built from [`object`]'s unaligned endian types
//! and can be overlaid on any byte offset.

use std::fmt::Debug;
use std::mem;

use object::{LittleEndian, Pod, U32};

use crate::display_utils::HexNum;
use crate::error::{ReadErrorExt, Result};

/// The only defined section version.
pub const SECTION_VERSION: u32 = 1;

pub const PAGE_KIND_REGULAR: u32 = 1;
pub const PAGE_KIND_COMPRESSED: u32 = 2;

pub const SECTION_HEADER_SIZE: u32 = mem::size_of::<SectionHeader>() as u32;
pub const FIRST_LEVEL_ENTRY_SIZE: u32 = mem::size_of::<FirstLevelEntry>() as u32;
pub const REGULAR_PAGE_HEADER_SIZE: u32 = mem::size_of::<RegularPageHeader>() as u32;
pub const COMPRESSED_PAGE_HEADER_SIZE: u32 = mem::size_of::<CompressedPageHeader>() as u32;
pub const REGULAR_ENTRY_SIZE: u32 = mem::size_of::<RegularEntry>() as u32;
pub const LSDA_ENTRY_SIZE: u32 = mem::size_of::<LsdaEntry>() as u32;

pub(crate) trait ReadIntoRef {
    fn read_at<T: Pod>(&self, offset: u64) -> Option<&T>;
    fn read_slice_at<T: Pod>(&self, offset: u64, len: usize) -> Option<&[T]>;
}

impl ReadIntoRef for [u8] {
    fn read_at<T: Pod>(&self, offset: u64) -> Option<&T> {
        let offset: usize = offset.try_into().ok()?;
        let end = offset.checked_add(mem::size_of::<T>())?;
        let (value, _) = object::from_bytes(self.get(offset..end)?).ok()?;
        Some(value)
    }

    fn read_slice_at<T: Pod>(&self, offset: u64, len: usize) -> Option<&[T]> {
        let offset: usize = offset.try_into().ok()?;
        let size = mem::size_of::<T>().checked_mul(len)?;
        let end = offset.checked_add(size)?;
        let (slice, _) = object::slice_from_bytes(self.get(offset..end)?, len).ok()?;
        Some(slice)
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SectionHeader {
    /// The version. Only [`SECTION_VERSION`] is currently defined.
    pub version: U32<LittleEndian>,

    /// The array of u32 encodings shared by two or more functions
    /// (offset relative to start of the section).
    ///
    /// Compressed second-level pages index into this array first, then into
    /// their page-local array.
    pub common_encodings_offset: U32<LittleEndian>,
    pub common_encodings_count: U32<LittleEndian>,

    /// The array of u32 personality function references (offset relative to
    /// start of the section). Referenced by a 1-based 2-bit index inside
    /// each encoding.
    pub personalities_offset: U32<LittleEndian>,
    pub personalities_count: U32<LittleEndian>,

    /// The array of [`FirstLevelEntry`]'s describing the second-level pages
    /// (offset relative to start of the section). The last entry is a
    /// sentinel with no page.
    pub index_offset: U32<LittleEndian>,
    pub index_count: U32<LittleEndian>,
    // After this point the section holds dynamically-sized arrays whose
    // positions are given by the offsets above and by the first-level
    // entries: common encodings, personalities, first-level index, LSDA
    // entries, then the second-level pages.
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct FirstLevelEntry {
    /// The offset of the first function covered by this range.
    ///
    /// Strictly ascending across the table; the sentinel entry closes the
    /// last range.
    pub function_offset: U32<LittleEndian>,

    /// Section offset of the second-level page, or 0 in the sentinel entry.
    ///
    /// The page may be a [`RegularPageHeader`] or a [`CompressedPageHeader`];
    /// both start with a 32-bit kind tag.
    pub second_level_page_offset: U32<LittleEndian>,

    /// Section offset of this range's slice of the LSDA array. The slice
    /// ends where the next first-level entry's slice begins.
    pub lsda_index_offset: U32<LittleEndian>,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegularPageHeader {
    /// Always [`PAGE_KIND_REGULAR`].
    pub kind: U32<LittleEndian>,

    /// The array of [`RegularEntry`]'s (offset relative to start of this
    /// page).
    pub entry_page_offset: U32<LittleEndian>,
    pub entry_count: U32<LittleEndian>,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CompressedPageHeader {
    /// Always [`PAGE_KIND_COMPRESSED`].
    pub kind: U32<LittleEndian>,

    /// The array of packed u32 entries (offset relative to start of this
    /// page). See [`CompressedEntry`].
    pub entry_page_offset: U32<LittleEndian>,
    pub entry_count: U32<LittleEndian>,

    /// The array of u32 page-local encodings (offset relative to start of
    /// this page). Index space continues after the common encodings table.
    pub encodings_page_offset: U32<LittleEndian>,
    pub encodings_count: U32<LittleEndian>,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RegularEntry {
    /// The offset of the function (absolute within the image's text).
    pub function_offset: U32<LittleEndian>,

    /// The encoding for this function.
    pub encoding: U32<LittleEndian>,
}

/// A packed compressed-page entry:
/// `(encoding_index << 24) | (offset_within_page & 0xFF_FFFF)`.
///
/// Encoding indices below the common encodings count select the common
/// table; the rest select the page-local table after subtracting that count.
/// The offset is relative to the range's first function offset.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct CompressedEntry(pub U32<LittleEndian>);

#[derive(Clone, Copy)]
#[repr(C)]
pub struct LsdaEntry {
    /// The offset of the function. Exact-match key; ascending within a
    /// range's slice.
    pub function_offset: U32<LittleEndian>,

    /// The offset of the function's Language-Specific Data Area.
    pub lsda_offset: U32<LittleEndian>,
}

unsafe impl Pod for SectionHeader {}
unsafe impl Pod for FirstLevelEntry {}
unsafe impl Pod for RegularPageHeader {}
unsafe impl Pod for CompressedPageHeader {}
unsafe impl Pod for RegularEntry {}
unsafe impl Pod for CompressedEntry {}
unsafe impl Pod for LsdaEntry {}

impl SectionHeader {
    pub fn parse(data: &[u8]) -> Result<&Self> {
        data.read_at::<SectionHeader>(0)
            .read_error("Could not read unwind section header")
    }

    pub fn version(&self) -> u32 {
        self.version.get(LittleEndian)
    }

    pub fn common_encodings_offset(&self) -> u32 {
        self.common_encodings_offset.get(LittleEndian)
    }

    pub fn common_encodings_count(&self) -> u32 {
        self.common_encodings_count.get(LittleEndian)
    }

    pub fn personalities_offset(&self) -> u32 {
        self.personalities_offset.get(LittleEndian)
    }

    pub fn personalities_count(&self) -> u32 {
        self.personalities_count.get(LittleEndian)
    }

    pub fn index_offset(&self) -> u32 {
        self.index_offset.get(LittleEndian)
    }

    pub fn index_count(&self) -> u32 {
        self.index_count.get(LittleEndian)
    }

    /// Return the common encodings table.
    pub fn common_encodings<'data>(&self, data: &'data [u8]) -> Result<&'data [U32<LittleEndian>]> {
        data.read_slice_at::<U32<LittleEndian>>(
            self.common_encodings_offset().into(),
            self.common_encodings_count() as usize,
        )
        .read_error("Could not read common encodings table")
    }

    /// Return the personality table.
    pub fn personalities<'data>(&self, data: &'data [u8]) -> Result<&'data [U32<LittleEndian>]> {
        data.read_slice_at::<U32<LittleEndian>>(
            self.personalities_offset().into(),
            self.personalities_count() as usize,
        )
        .read_error("Could not read personality table")
    }

    /// Return the first-level index, including the sentinel entry.
    pub fn first_level_entries<'data>(&self, data: &'data [u8]) -> Result<&'data [FirstLevelEntry]> {
        data.read_slice_at::<FirstLevelEntry>(self.index_offset().into(), self.index_count() as usize)
            .read_error("Could not read first-level index")
    }
}

impl FirstLevelEntry {
    pub fn function_offset(&self) -> u32 {
        self.function_offset.get(LittleEndian)
    }

    pub fn second_level_page_offset(&self) -> u32 {
        self.second_level_page_offset.get(LittleEndian)
    }

    pub fn lsda_index_offset(&self) -> u32 {
        self.lsda_index_offset.get(LittleEndian)
    }

    pub fn page_kind(&self, data: &[u8]) -> Result<u32> {
        let kind = data
            .read_at::<U32<LittleEndian>>(self.second_level_page_offset().into())
            .read_error("Could not read second-level page kind")?;
        Ok(kind.get(LittleEndian))
    }
}

impl Debug for FirstLevelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirstLevelEntry")
            .field("function_offset", &HexNum(self.function_offset()))
            .field(
                "second_level_page_offset",
                &HexNum(self.second_level_page_offset()),
            )
            .field("lsda_index_offset", &HexNum(self.lsda_index_offset()))
            .finish()
    }
}

impl RegularPageHeader {
    pub fn parse(data: &[u8], page_offset: u64) -> Result<&Self> {
        data.read_at::<Self>(page_offset)
            .read_error("Could not read regular page header")
    }

    pub fn entry_page_offset(&self) -> u32 {
        self.entry_page_offset.get(LittleEndian)
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count.get(LittleEndian)
    }

    pub fn entries<'data>(&self, data: &'data [u8], page_offset: u32) -> Result<&'data [RegularEntry]> {
        let entries_offset = page_offset as u64 + self.entry_page_offset() as u64;
        data.read_slice_at::<RegularEntry>(entries_offset, self.entry_count() as usize)
            .read_error("Could not read regular page entries")
    }
}

impl CompressedPageHeader {
    pub fn parse(data: &[u8], page_offset: u64) -> Result<&Self> {
        data.read_at::<Self>(page_offset)
            .read_error("Could not read compressed page header")
    }

    pub fn entry_page_offset(&self) -> u32 {
        self.entry_page_offset.get(LittleEndian)
    }

    pub fn entry_count(&self) -> u32 {
        self.entry_count.get(LittleEndian)
    }

    pub fn encodings_page_offset(&self) -> u32 {
        self.encodings_page_offset.get(LittleEndian)
    }

    pub fn encodings_count(&self) -> u32 {
        self.encodings_count.get(LittleEndian)
    }

    pub fn entries<'data>(
        &self,
        data: &'data [u8],
        page_offset: u32,
    ) -> Result<&'data [CompressedEntry]> {
        let entries_offset = page_offset as u64 + self.entry_page_offset() as u64;
        data.read_slice_at::<CompressedEntry>(entries_offset, self.entry_count() as usize)
            .read_error("Could not read compressed page entries")
    }

    /// Return the page-local encodings table.
    pub fn local_encodings<'data>(
        &self,
        data: &'data [u8],
        page_offset: u32,
    ) -> Result<&'data [U32<LittleEndian>]> {
        let encodings_offset = page_offset as u64 + self.encodings_page_offset() as u64;
        data.read_slice_at::<U32<LittleEndian>>(encodings_offset, self.encodings_count() as usize)
            .read_error("Could not read page-local encodings table")
    }
}

impl RegularEntry {
    pub fn function_offset(&self) -> u32 {
        self.function_offset.get(LittleEndian)
    }

    pub fn encoding(&self) -> u32 {
        self.encoding.get(LittleEndian)
    }
}

impl CompressedEntry {
    /// The combined common + page-local encoding index.
    pub fn encoding_index(&self) -> u8 {
        (self.0.get(LittleEndian) >> 24) as u8
    }

    /// The function offset relative to the range's first function offset.
    pub fn function_offset_in_page(&self) -> u32 {
        self.0.get(LittleEndian) & 0x00FF_FFFF
    }
}

impl Debug for CompressedEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedEntry")
            .field("encoding_index", &self.encoding_index())
            .field(
                "function_offset_in_page",
                &HexNum(self.function_offset_in_page()),
            )
            .finish()
    }
}

impl LsdaEntry {
    pub fn function_offset(&self) -> u32 {
        self.function_offset.get(LittleEndian)
    }

    pub fn lsda_offset(&self) -> u32 {
        self.lsda_offset.get(LittleEndian)
    }
}

impl Debug for LsdaEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsdaEntry")
            .field("function_offset", &HexNum(self.function_offset()))
            .field("lsda_offset", &HexNum(self.lsda_offset()))
            .finish()
    }
}
