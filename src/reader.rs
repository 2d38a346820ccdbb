use fallible_iterator::FallibleIterator;
use object::{LittleEndian, U32};

use crate::aarch64;
use crate::arch::Arch;
use crate::encoding::Encoding;
use crate::error::{ReadError, ReadErrorExt, Result};
use crate::raw::{
    CompressedEntry, FirstLevelEntry, LsdaEntry, RegularEntry, SectionHeader, FIRST_LEVEL_ENTRY_SIZE,
    LSDA_ENTRY_SIZE, PAGE_KIND_COMPRESSED, PAGE_KIND_REGULAR, SECTION_VERSION,
};
use crate::x86_64;

/// One decoded per-function record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindInfo {
    pub func_offset: u32,
    pub encoding: Encoding,
    /// Offset of the function's LSDA, or 0 when the encoding has no LSDA bit
    /// or no entry matches.
    pub lsda_offset: u32,
    /// Offset of the personality function, or 0 when the encoding carries no
    /// personality index.
    pub personality_offset: u32,
}

/// A lazily-traversed view of a compact unwind section.
///
/// The reader never mutates the underlying buffer and holds no interior
/// state, so lookups and iteration may run concurrently from any number of
/// threads.
pub struct UnwindReader<'data> {
    data: &'data [u8],
    arch: Arch,
}

impl<'data> UnwindReader<'data> {
    pub fn new(data: &'data [u8], arch: Arch) -> Self {
        UnwindReader { data, arch }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Bounds-check every sub-table against the buffer, reporting the first
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let header = SectionHeader::parse(self.data)?;
        if header.version() != SECTION_VERSION {
            return Err(ReadError::BadVersion(header.version()));
        }
        let len = self.data.len() as u64;
        let table_end = |offset: u32, count: u32, entry_size: u32| {
            offset as u64 + count as u64 * entry_size as u64
        };
        if header.common_encodings_offset() as u64 > len
            || table_end(header.common_encodings_offset(), header.common_encodings_count(), 4) > len
        {
            return Err(ReadError::CommonEncodingsOutOfRange);
        }
        if header.personalities_offset() as u64 > len
            || table_end(header.personalities_offset(), header.personalities_count(), 4) > len
        {
            return Err(ReadError::PersonalityTableOutOfRange);
        }
        if header.index_offset() as u64 > len
            || table_end(header.index_offset(), header.index_count(), FIRST_LEVEL_ENTRY_SIZE) > len
        {
            return Err(ReadError::IndexTableOutOfRange);
        }
        Ok(())
    }

    /// Iterate over all records in ascending function-offset order.
    ///
    /// The returned iterator is single-pass; stop early by not pulling the
    /// next record.
    pub fn entries(&self) -> Result<UnwindInfoIter<'data>> {
        let header = SectionHeader::parse(self.data)?;
        Ok(UnwindInfoIter {
            data: self.data,
            common_encodings: header.common_encodings(self.data)?,
            personalities: header.personalities(self.data)?,
            first_level: header.first_level_entries(self.data)?,
            range_index: 0,
            lsdas: &[],
            page: None,
            entry_index: 0,
        })
    }

    /// Look up the record covering `target_offset`, or `None` when the
    /// offset precedes the first range or lies past the end of coverage.
    pub fn find(&self, target_offset: u32) -> Result<Option<UnwindInfo>> {
        let header = SectionHeader::parse(self.data)?;
        let first_level = header.first_level_entries(self.data)?;
        if first_level.len() < 2 {
            return Ok(None);
        }
        // The sentinel's slot is rewritten with the end of coverage once
        // fixups resolve; before that it carries the last function's own
        // offset, so the last range's upper bound is inclusive.
        let sentinel = &first_level[first_level.len() - 1];
        if target_offset > sentinel.function_offset() {
            return Ok(None);
        }
        let ranges = &first_level[..first_level.len() - 1];
        let idx = ranges.partition_point(|e| e.function_offset() <= target_offset);
        if idx == 0 {
            return Ok(None);
        }
        let range = &ranges[idx - 1];
        let next = &first_level[idx];

        let page_offset = range.second_level_page_offset();
        let found = match range.page_kind(self.data)? {
            PAGE_KIND_REGULAR => {
                let page = crate::raw::RegularPageHeader::parse(self.data, page_offset.into())?;
                let entries = page.entries(self.data, page_offset)?;
                let pos = entries.partition_point(|e| e.function_offset() <= target_offset);
                match pos {
                    0 => None,
                    pos => {
                        let entry = &entries[pos - 1];
                        Some((entry.function_offset(), Encoding(entry.encoding())))
                    }
                }
            }
            PAGE_KIND_COMPRESSED => {
                let page = crate::raw::CompressedPageHeader::parse(self.data, page_offset.into())?;
                let entries = page.entries(self.data, page_offset)?;
                let local_encodings = page.local_encodings(self.data, page_offset)?;
                let target_in_page = target_offset - range.function_offset();
                let pos = entries.partition_point(|e| e.function_offset_in_page() <= target_in_page);
                match pos {
                    0 => None,
                    pos => {
                        let entry = &entries[pos - 1];
                        let common_encodings = header.common_encodings(self.data)?;
                        let encoding = resolve_encoding_index(
                            entry.encoding_index(),
                            common_encodings,
                            local_encodings,
                        )?;
                        let func_offset = range
                            .function_offset()
                            .checked_add(entry.function_offset_in_page())
                            .ok_or(ReadError::FunctionOffsetOverflow)?;
                        Some((func_offset, encoding))
                    }
                }
            }
            kind => return Err(ReadError::BadPageKind(kind)),
        };
        let (func_offset, encoding) = match found {
            Some(found) => found,
            None => return Ok(None),
        };

        let mut lsda_offset = 0;
        if encoding.has_lsda() {
            let lsdas = lsda_entries_for_range(self.data, range, next)?;
            if let Ok(pos) = lsdas.binary_search_by_key(&func_offset, |e| e.function_offset()) {
                lsda_offset = lsdas[pos].lsda_offset();
            }
        }
        let personality_offset =
            resolve_personality(header.personalities(self.data)?, encoding)?;

        Ok(Some(UnwindInfo {
            func_offset,
            encoding,
            lsda_offset,
            personality_offset,
        }))
    }

    /// Format an encoding into a human-readable frame description.
    ///
    /// Purely diagnostic; never participates in lookup or decoding. On
    /// x86-64 the frameless-indirect mode reads the stack size out of
    /// `func_bytes`.
    pub fn describe(&self, encoding: Encoding, func_bytes: &[u8]) -> String {
        match self.arch {
            Arch::X86_64 => x86_64::describe(encoding, func_bytes),
            Arch::Arm64 => aarch64::describe(encoding),
        }
    }
}

fn resolve_encoding_index(
    index: u8,
    common_encodings: &[U32<LittleEndian>],
    local_encodings: &[U32<LittleEndian>],
) -> Result<Encoding> {
    let index = index as usize;
    let raw = if index < common_encodings.len() {
        common_encodings[index]
    } else {
        *local_encodings
            .get(index - common_encodings.len())
            .read_error("Page-local encoding index out of range")?
    };
    Ok(Encoding(raw.get(LittleEndian)))
}

fn resolve_personality(
    personalities: &[U32<LittleEndian>],
    encoding: Encoding,
) -> Result<u32> {
    match encoding.personality_index() {
        0 => Ok(0),
        index => personalities
            .get(index as usize - 1)
            .map(|p| p.get(LittleEndian))
            .ok_or(ReadError::BadPersonalityIndex),
    }
}

fn lsda_entries_for_range<'data>(
    data: &'data [u8],
    range: &FirstLevelEntry,
    next: &FirstLevelEntry,
) -> Result<&'data [LsdaEntry]> {
    use crate::raw::ReadIntoRef;
    let byte_len = next
        .lsda_index_offset()
        .checked_sub(range.lsda_index_offset())
        .read_error("LSDA index offsets not ascending")?;
    let count = (byte_len / LSDA_ENTRY_SIZE) as usize;
    data.read_slice_at::<LsdaEntry>(range.lsda_index_offset().into(), count)
        .read_error("Could not read LSDA entries")
}

enum Page<'data> {
    Regular(&'data [RegularEntry]),
    Compressed {
        entries: &'data [CompressedEntry],
        local_encodings: &'data [U32<LittleEndian>],
        base_offset: u32,
    },
}

impl Page<'_> {
    fn len(&self) -> usize {
        match self {
            Page::Regular(entries) => entries.len(),
            Page::Compressed { entries, .. } => entries.len(),
        }
    }
}

/// Single-pass iterator over the decoded records of an unwind section.
pub struct UnwindInfoIter<'data> {
    data: &'data [u8],
    common_encodings: &'data [U32<LittleEndian>],
    personalities: &'data [U32<LittleEndian>],
    first_level: &'data [FirstLevelEntry],
    range_index: usize,
    lsdas: &'data [LsdaEntry],
    page: Option<Page<'data>>,
    entry_index: usize,
}

impl<'data> UnwindInfoIter<'data> {
    fn next_impl(&mut self) -> Result<Option<UnwindInfo>> {
        loop {
            if let Some(page) = &self.page {
                if self.entry_index < page.len() {
                    let info = self.decode_current(page)?;
                    self.entry_index += 1;
                    return Ok(Some(info));
                }
                self.page = None;
                self.range_index += 1;
            }
            // the last first-level entry is the sentinel
            if self.range_index + 1 >= self.first_level.len() {
                return Ok(None);
            }
            let range = &self.first_level[self.range_index];
            let next = &self.first_level[self.range_index + 1];
            if range.function_offset() > next.function_offset() {
                return Err(ReadError::NonMonotonicFirstLevel);
            }
            if range.second_level_page_offset() as usize > self.data.len() {
                return Err(ReadError::SecondLevelPageOutOfRange);
            }
            self.lsdas = lsda_entries_for_range(self.data, range, next)?;
            self.page = Some(self.load_page(range)?);
            self.entry_index = 0;
        }
    }

    fn load_page(&self, range: &FirstLevelEntry) -> Result<Page<'data>> {
        let page_offset = range.second_level_page_offset();
        match range.page_kind(self.data)? {
            PAGE_KIND_REGULAR => {
                let page = crate::raw::RegularPageHeader::parse(self.data, page_offset.into())?;
                Ok(Page::Regular(page.entries(self.data, page_offset)?))
            }
            PAGE_KIND_COMPRESSED => {
                let page = crate::raw::CompressedPageHeader::parse(self.data, page_offset.into())?;
                Ok(Page::Compressed {
                    entries: page.entries(self.data, page_offset)?,
                    local_encodings: page.local_encodings(self.data, page_offset)?,
                    base_offset: range.function_offset(),
                })
            }
            kind => Err(ReadError::BadPageKind(kind)),
        }
    }

    fn decode_current(&self, page: &Page<'data>) -> Result<UnwindInfo> {
        let (func_offset, encoding) = match page {
            Page::Regular(entries) => {
                let entry = &entries[self.entry_index];
                (entry.function_offset(), Encoding(entry.encoding()))
            }
            Page::Compressed {
                entries,
                local_encodings,
                base_offset,
            } => {
                let entry = &entries[self.entry_index];
                let encoding = resolve_encoding_index(
                    entry.encoding_index(),
                    self.common_encodings,
                    local_encodings,
                )?;
                let func_offset = base_offset
                    .checked_add(entry.function_offset_in_page())
                    .ok_or(ReadError::FunctionOffsetOverflow)?;
                (func_offset, encoding)
            }
        };
        let mut lsda_offset = 0;
        if encoding.has_lsda() {
            if let Some(entry) = self
                .lsdas
                .iter()
                .find(|e| e.function_offset() == func_offset)
            {
                lsda_offset = entry.lsda_offset();
            }
        }
        let personality_offset = resolve_personality(self.personalities, encoding)?;
        Ok(UnwindInfo {
            func_offset,
            encoding,
            lsda_offset,
            personality_offset,
        })
    }
}

impl FallibleIterator for UnwindInfoIter<'_> {
    type Item = UnwindInfo;
    type Error = ReadError;

    fn next(&mut self) -> Result<Option<UnwindInfo>> {
        self.next_impl()
    }
}
