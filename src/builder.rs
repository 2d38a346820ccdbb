use std::collections::{HashMap, HashSet};

use log::debug;

use crate::arch::Arch;
use crate::encoding::Encoding;
use crate::raw::{
    COMPRESSED_PAGE_HEADER_SIZE, FIRST_LEVEL_ENTRY_SIZE, LSDA_ENTRY_SIZE, PAGE_KIND_COMPRESSED,
    PAGE_KIND_REGULAR, REGULAR_ENTRY_SIZE, REGULAR_PAGE_HEADER_SIZE, SECTION_HEADER_SIZE,
    SECTION_VERSION,
};

/// Maximum size of one second-level page.
pub const MAX_PAGE_SIZE: u32 = 0x1000;

/// Minimum leftover space worth falling back to a regular page for.
pub const MIN_PAGE_SIZE: u32 = 128;

const ENTRIES_PER_REGULAR_PAGE: usize =
    ((MAX_PAGE_SIZE - REGULAR_PAGE_HEADER_SIZE) / REGULAR_ENTRY_SIZE) as usize;

/// An opaque reference to a function, LSDA, or personality owned by the
/// external linker. The builder records handles in fixups and never resolves
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolHandle(pub u32);

/// One per-function input record for [`UnwindBuilder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterUnwindInfo {
    pub func_offset: u32,
    pub encoding: Encoding,
    pub lsda_offset: u32,
    pub personality_offset: u32,
    pub func_handle: SymbolHandle,
    pub lsda_handle: Option<SymbolHandle>,
    pub personality_handle: Option<SymbolHandle>,
}

/// A slot that must be rewritten with the resolved image offset of `handle`
/// once final addresses are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageOffsetFixup {
    pub handle: SymbolHandle,
    /// Byte offset of the u32 slot within the emitted section.
    pub section_offset: u32,
    /// The sentinel entry records the end of the last function, so its slot
    /// gets the target's size added on top of its address.
    pub include_target_size_in_addend: bool,
}

/// A 24-bit slot that must be rewritten with the address difference between
/// two not-yet-resolved targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diff24Fixup {
    pub target_handle: SymbolHandle,
    pub from_handle: SymbolHandle,
    /// Byte offset of the u32 slot within the emitted section; only the low
    /// 24 bits are rewritten.
    pub section_offset: u32,
}

/// The result of one build: the section bytes plus everything the link-time
/// fixup resolver needs to patch them.
#[derive(Debug, Clone)]
pub struct BuiltUnwindTable {
    pub bytes: Vec<u8>,
    pub image_offset_fixups: Vec<ImageOffsetFixup>,
    pub diff24_fixups: Vec<Diff24Fixup>,
}

struct UniquePersonality {
    offset: u32,
    handle: Option<SymbolHandle>,
}

/// Builds a compact unwind section from a sorted list of per-function
/// descriptors.
///
/// One call to [`build`](UnwindBuilder::build) produces one complete,
/// immutable result; there is no incremental API. Input that violates the
/// builder's contract (unsorted offsets, an LSDA bit without an LSDA handle)
/// indicates a caller bug and panics rather than emitting a corrupt table.
pub struct UnwindBuilder {
    arch: Arch,
    bytes: Vec<u8>,
    image_offset_fixups: Vec<ImageOffsetFixup>,
    diff24_fixups: Vec<Diff24Fixup>,
}

impl UnwindBuilder {
    /// Build the section. `unwind_infos` must be sorted ascending by
    /// `func_offset`.
    pub fn build(arch: Arch, unwind_infos: Vec<WriterUnwindInfo>) -> BuiltUnwindTable {
        let mut builder = UnwindBuilder {
            arch,
            bytes: Vec::new(),
            image_offset_fixups: Vec::new(),
            diff24_fixups: Vec::new(),
        };
        builder.run(unwind_infos);
        BuiltUnwindTable {
            bytes: builder.bytes,
            image_offset_fixups: builder.image_offset_fixups,
            diff24_fixups: builder.diff24_fixups,
        }
    }

    fn run(&mut self, mut unwind_infos: Vec<WriterUnwindInfo>) {
        assert!(
            unwind_infos
                .windows(2)
                .all(|pair| pair[0].func_offset <= pair[1].func_offset),
            "unwind infos must be sorted by func_offset"
        );

        let (lsda_count, common_encodings, personalities) =
            compress_duplicates(self.arch, &mut unwind_infos);
        let unique = unwind_infos;

        self.bytes = vec![
            0;
            estimate_table_size(&unique, lsda_count, personalities.len())
        ];

        // fixed leading tables
        let common_offset = SECTION_HEADER_SIZE as usize;
        let personalities_offset = common_offset + common_encodings.len() * 4;
        let index_offset = personalities_offset + personalities.len() * 4;
        self.put_u32(0, SECTION_VERSION);
        self.put_u32(4, common_offset as u32);
        self.put_u32(8, common_encodings.len() as u32);
        self.put_u32(12, personalities_offset as u32);
        self.put_u32(16, personalities.len() as u32);
        self.put_u32(20, index_offset as u32);

        for (&encoding, &index) in &common_encodings {
            self.put_u32(common_offset + index as usize * 4, encoding);
        }
        for (i, personality) in personalities.iter().enumerate() {
            let slot = personalities_offset + i * 4;
            self.put_u32(slot, personality.offset);
            if let Some(handle) = personality.handle {
                self.image_offset_fixups.push(ImageOffsetFixup {
                    handle,
                    section_offset: slot as u32,
                    include_target_size_in_addend: false,
                });
            }
        }

        if unique.is_empty() {
            self.put_u32(24, 0);
            self.bytes.truncate(SECTION_HEADER_SIZE as usize);
            return;
        }

        // build second-level pages, filling in the first level as each range
        // completes
        let page_count_upper_bound = page_count_upper_bound(unique.len());
        let lsda_start = index_offset + page_count_upper_bound * FIRST_LEVEL_ENTRY_SIZE as usize;
        // pages are 8-byte aligned
        let second_level_start = (lsda_start + lsda_count as usize * LSDA_ENTRY_SIZE as usize + 7) & !7;
        let mut index_count = 0usize;
        let mut lsda_cursor = lsda_start;
        let mut page_cursor = second_level_start;
        let mut cur = 0usize;
        self.image_offset_fixups.reserve(unique.len() / 2);
        self.diff24_fixups.reserve(unique.len() / 2);

        while cur < unique.len() {
            let slot = index_offset + index_count * FIRST_LEVEL_ENTRY_SIZE as usize;
            self.image_offset_fixups.push(ImageOffsetFixup {
                handle: unique[cur].func_handle,
                section_offset: slot as u32,
                include_target_size_in_addend: false,
            });
            self.put_u32(slot, unique[cur].func_offset);
            self.put_u32(slot + 4, page_cursor as u32);
            self.put_u32(slot + 8, lsda_cursor as u32);
            self.make_compressed_page(
                &unique,
                &common_encodings,
                MAX_PAGE_SIZE,
                &mut cur,
                &mut page_cursor,
                &mut lsda_cursor,
            );
            index_count += 1;
            // 8-byte align the next page
            page_cursor = (page_cursor + 7) & !7;
        }

        // the sentinel closes the last range; its function-offset slot is
        // patched with the end of the last function
        let last = &unique[unique.len() - 1];
        let slot = index_offset + index_count * FIRST_LEVEL_ENTRY_SIZE as usize;
        self.put_u32(slot, last.func_offset);
        self.put_u32(slot + 4, 0);
        self.put_u32(slot + 8, second_level_start as u32);
        self.image_offset_fixups.push(ImageOffsetFixup {
            handle: last.func_handle,
            section_offset: slot as u32,
            include_target_size_in_addend: true,
        });
        index_count += 1;

        assert!(
            index_count <= page_count_upper_bound,
            "not enough space reserved for the first-level table"
        );
        self.put_u32(24, index_count as u32);
        assert!(page_cursor <= self.bytes.len(), "table size estimate too small");
        self.bytes.truncate(page_cursor);
        debug!(
            "built unwind table: {} unique entries, {} pages, {} bytes",
            unique.len(),
            index_count - 1,
            self.bytes.len()
        );
    }

    /// Emit one compressed page for the run starting at `cur`, falling back
    /// to a regular page when the greedy pass under-fills the space.
    fn make_compressed_page(
        &mut self,
        unique: &[WriterUnwindInfo],
        common_encodings: &HashMap<u32, u32>,
        page_size: u32,
        cur: &mut usize,
        page_cursor: &mut usize,
        lsda_cursor: &mut usize,
    ) {
        // first pass: count how many entries fit. Keep adding while
        //  1) the entry (plus its page-local encoding, if new) fits,
        //  2) the combined encoding index space stays within a byte,
        //  3) the offset from the page's first function fits 24 bits with
        //     margin for later layout changes,
        //  4) entries remain.
        let mut page_specific: HashMap<u32, u32> = HashMap::new();
        let mut space = page_size - COMPRESSED_PAGE_HEADER_SIZE;
        let mut entry_count = 0usize;
        while *cur + entry_count < unique.len() && space >= 4 {
            let info = &unique[*cur + entry_count];
            if !common_encodings.contains_key(&info.encoding.0)
                && !page_specific.contains_key(&info.encoding.0)
            {
                // no point adding the encoding if the entry can't follow it
                if space < 8 {
                    break;
                }
                let next_index = (common_encodings.len() + page_specific.len()) as u32;
                if next_index > 255 {
                    break;
                }
                page_specific.insert(info.encoding.0, next_index);
                space -= 4;
            }
            let from_offset = unique[*cur].func_offset;
            let offset_in_page = info.func_offset - from_offset;
            // functions move when the image is laid out again, so don't pack
            // right up to the 24-bit limit
            if offset_in_page > 0x00FF_0000 {
                break;
            }
            if self.arch == Arch::Arm64 {
                // __text beyond the 128 MiB branch distance gets branch
                // islands inserted at every 124 MiB interval. When the run
                // crosses an interval, leave room for up to 4 MiB of islands
                // between the page's first function and this one.
                const BRANCH_ISLAND_DISTANCE: u32 = 124 * 1024 * 1024;
                const BRANCH_ISLAND_MAX_SIZE: u32 = 4 * 1024 * 1024;
                if from_offset / BRANCH_ISLAND_DISTANCE != info.func_offset / BRANCH_ISLAND_DISTANCE
                    && offset_in_page + BRANCH_ISLAND_MAX_SIZE > 0x00FF_0000
                {
                    break;
                }
            }
            entry_count += 1;
            space -= 4;
        }

        // when the compressed pass leaves substantial space unused and a
        // regular page would cover more entries, emit a regular page instead
        if space >= MIN_PAGE_SIZE && *cur + entry_count < unique.len() {
            let max_regular = ((page_size - REGULAR_PAGE_HEADER_SIZE) / REGULAR_ENTRY_SIZE) as usize;
            if entry_count < max_regular {
                self.make_regular_page(unique, page_size, cur, page_cursor, lsda_cursor);
                return;
            }
        }

        // second pass fills in the page
        let page_start = *page_cursor;
        let entry_page_offset = COMPRESSED_PAGE_HEADER_SIZE as usize;
        let encodings_page_offset = entry_page_offset + entry_count * 4;
        self.put_u32(page_start, PAGE_KIND_COMPRESSED);
        self.put_u32(page_start + 4, entry_page_offset as u32);
        self.put_u32(page_start + 8, entry_count as u32);
        self.put_u32(page_start + 12, encodings_page_offset as u32);
        self.put_u32(page_start + 16, page_specific.len() as u32);

        let first = &unique[*cur];
        for i in 0..entry_count {
            let info = &unique[*cur + i];
            let offset_in_page = info.func_offset - first.func_offset;
            let index = encoding_index(info.encoding, common_encodings, &page_specific);
            let slot = page_start + entry_page_offset + i * 4;
            self.put_u32(slot, (offset_in_page & 0x00FF_FFFF) | ((index as u32) << 24));
            self.diff24_fixups.push(Diff24Fixup {
                target_handle: info.func_handle,
                from_handle: first.func_handle,
                section_offset: slot as u32,
            });
            if info.encoding.has_lsda() {
                self.append_lsda_entry(info, lsda_cursor);
            }
        }
        for (&encoding, &index) in &page_specific {
            let slot =
                page_start + encodings_page_offset + (index as usize - common_encodings.len()) * 4;
            self.put_u32(slot, encoding);
        }

        *cur += entry_count;
        *page_cursor = page_start + encodings_page_offset + page_specific.len() * 4;
    }

    fn make_regular_page(
        &mut self,
        unique: &[WriterUnwindInfo],
        page_size: u32,
        cur: &mut usize,
        page_cursor: &mut usize,
        lsda_cursor: &mut usize,
    ) {
        let max_entries = ((page_size - REGULAR_PAGE_HEADER_SIZE) / REGULAR_ENTRY_SIZE) as usize;
        let entries_to_add = max_entries.min(unique.len() - *cur);

        let page_start = *page_cursor;
        let entry_page_offset = REGULAR_PAGE_HEADER_SIZE as usize;
        self.put_u32(page_start, PAGE_KIND_REGULAR);
        self.put_u32(page_start + 4, entry_page_offset as u32);
        self.put_u32(page_start + 8, entries_to_add as u32);

        for i in 0..entries_to_add {
            let info = &unique[*cur + i];
            let slot = page_start + entry_page_offset + i * REGULAR_ENTRY_SIZE as usize;
            self.put_u32(slot, info.func_offset);
            self.put_u32(slot + 4, info.encoding.0);
            self.image_offset_fixups.push(ImageOffsetFixup {
                handle: info.func_handle,
                section_offset: slot as u32,
                include_target_size_in_addend: false,
            });
            if info.encoding.has_lsda() {
                self.append_lsda_entry(info, lsda_cursor);
            }
        }

        *cur += entries_to_add;
        *page_cursor = page_start + entry_page_offset + entries_to_add * REGULAR_ENTRY_SIZE as usize;
    }

    fn append_lsda_entry(&mut self, info: &WriterUnwindInfo, lsda_cursor: &mut usize) {
        let lsda_handle = match info.lsda_handle {
            Some(handle) => handle,
            None => panic!("unwind info entry has LSDA bit set but no LSDA handle"),
        };
        self.put_u32(*lsda_cursor, info.func_offset);
        self.put_u32(*lsda_cursor + 4, info.lsda_offset);
        self.image_offset_fixups.push(ImageOffsetFixup {
            handle: info.func_handle,
            section_offset: *lsda_cursor as u32,
            include_target_size_in_addend: false,
        });
        self.image_offset_fixups.push(ImageOffsetFixup {
            handle: lsda_handle,
            section_offset: *lsda_cursor as u32 + 4,
            include_target_size_in_addend: false,
        });
        *lsda_cursor += LSDA_ENTRY_SIZE as usize;
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Drop entries that merge into their predecessor, assign personality
/// indices, and tally encoding usage for the common table.
fn compress_duplicates(
    arch: Arch,
    entries: &mut Vec<WriterUnwindInfo>,
) -> (u32, HashMap<u32, u32>, Vec<UniquePersonality>) {
    let input_len = entries.len();
    let mut lsda_count = 0u32;
    let mut encodings_used: HashMap<u32, u32> = HashMap::new();
    let mut personalities: Vec<UniquePersonality> = Vec::new();
    let mut last: Option<(Encoding, Option<SymbolHandle>)> = None;
    entries.retain_mut(|entry| {
        if entry.lsda_handle.is_some() {
            entry.encoding = entry.encoding.with_lsda();
        }
        update_personality_for_entry(entry, &mut personalities);
        let needs_dwarf = arch.encoding_means_use_dwarf(entry.encoding);
        let cannot_be_merged = arch.encoding_cannot_be_merged(entry.encoding);
        let same_as_last = last
            == Some((entry.encoding, entry.personality_handle));
        let mut duplicate = true;
        if needs_dwarf || !same_as_last || cannot_be_merged || entry.lsda_handle.is_some() {
            duplicate = false;
            // dwarf-fallback encodings never go in the common table
            if !needs_dwarf {
                *encodings_used.entry(entry.encoding.0).or_insert(0) += 1;
            }
        }
        if entry.encoding.has_lsda() {
            lsda_count += 1;
            assert!(
                entry.lsda_handle.is_some(),
                "unwind info entry has LSDA bit set but no LSDA handle"
            );
        }
        last = Some((entry.encoding, entry.personality_handle));
        !duplicate
    });

    // descending by usage, ascending by value for deterministic output
    let mut by_usage: Vec<(u32, u32)> = encodings_used.into_iter().collect();
    by_usage.sort_by(|l, r| r.1.cmp(&l.1).then(l.0.cmp(&r.0)));
    let mut common_encodings = HashMap::new();
    for (i, &(encoding, usage)) in by_usage.iter().take(127).enumerate() {
        // a singleton encoding saves nothing by being shared
        if usage <= 1 {
            break;
        }
        common_encodings.insert(encoding, i as u32);
    }
    debug!(
        "compress_duplicates: {} entries in, {} unique, {} with LSDA, {} common encodings",
        input_len,
        entries.len(),
        lsda_count,
        common_encodings.len()
    );
    (lsda_count, common_encodings, personalities)
}

/// Assign the entry its 2-bit 1-based personality index, reusing the index
/// of any earlier entry with the same personality.
// TODO: report an error when more than 3 distinct personality functions are
// used; the 2-bit field silently overflows today.
fn update_personality_for_entry(
    entry: &mut WriterUnwindInfo,
    personalities: &mut Vec<UniquePersonality>,
) {
    if entry.personality_handle.is_none() && entry.personality_offset == 0 {
        return;
    }
    let index = personalities
        .iter()
        .position(|p| match (p.handle, entry.personality_handle) {
            (Some(existing), Some(new)) => existing == new,
            (None, None) => p.offset != 0 && p.offset == entry.personality_offset,
            _ => false,
        })
        .unwrap_or_else(|| {
            personalities.push(UniquePersonality {
                offset: entry.personality_offset,
                handle: entry.personality_handle,
            });
            personalities.len() - 1
        });
    entry.encoding = entry.encoding.with_personality_index(index as u8 + 1);
}

fn encoding_index(
    encoding: Encoding,
    common_encodings: &HashMap<u32, u32>,
    page_specific: &HashMap<u32, u32>,
) -> u8 {
    let index = common_encodings
        .get(&encoding.0)
        .or_else(|| page_specific.get(&encoding.0));
    match index {
        Some(&index) => index as u8,
        None => panic!("encoding missing from both encoding tables"),
    }
}

fn page_count_upper_bound(unique_count: usize) -> usize {
    // every emitted page covers at least a regular page's worth of entries,
    // plus slack for the sentinel and a short final page
    unique_count / ENTRIES_PER_REGULAR_PAGE + 3
}

/// Worst-case byte size assuming every page is emitted as a regular page.
fn estimate_table_size(
    unique: &[WriterUnwindInfo],
    lsda_count: u32,
    personality_count: usize,
) -> usize {
    let mut unique_encodings = HashSet::new();
    for entry in unique {
        unique_encodings.insert(entry.encoding.0);
    }
    let page_count_upper_bound = page_count_upper_bound(unique.len());
    SECTION_HEADER_SIZE as usize
        + unique_encodings.len() * 4
        + personality_count * 4
        + page_count_upper_bound * FIRST_LEVEL_ENTRY_SIZE as usize
        + lsda_count as usize * LSDA_ENTRY_SIZE as usize
        + page_count_upper_bound * (COMPRESSED_PAGE_HEADER_SIZE as usize + 8)
        + unique.len() * REGULAR_ENTRY_SIZE as usize
}
