use fallible_iterator::FallibleIterator;

use compact_unwind::raw::{
    CompressedPageHeader, FirstLevelEntry, SectionHeader, PAGE_KIND_COMPRESSED, PAGE_KIND_REGULAR,
    SECTION_HEADER_SIZE,
};
use compact_unwind::{
    Arch, Encoding, SymbolHandle, UnwindBuilder, UnwindReader, WriterUnwindInfo, UNWIND_HAS_LSDA,
};

fn entry(func_offset: u32, encoding: u32) -> WriterUnwindInfo {
    WriterUnwindInfo {
        func_offset,
        encoding: Encoding(encoding),
        lsda_offset: 0,
        personality_offset: 0,
        func_handle: SymbolHandle(func_offset),
        lsda_handle: None,
        personality_handle: None,
    }
}

fn first_page_kind(bytes: &[u8]) -> u32 {
    let header = SectionHeader::parse(bytes).unwrap();
    let first_level = header.first_level_entries(bytes).unwrap();
    first_level[0].page_kind(bytes).unwrap()
}

#[test]
fn merged_lookup_scenario() {
    // Two functions sharing an encoding collapse into one record; a third
    // with an LSDA stays separate.
    let built = UnwindBuilder::build(
        Arch::X86_64,
        vec![
            entry(0x1000, 0x0200_0001),
            entry(0x1010, 0x0200_0001),
            WriterUnwindInfo {
                lsda_offset: 0x50,
                lsda_handle: Some(SymbolHandle(0x999)),
                ..entry(0x1020, 0x0300_0002)
            },
        ],
    );
    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    reader.validate().unwrap();

    // a lookup inside the merged pair resolves to the first function
    let info = reader.find(0x1018).unwrap().unwrap();
    assert_eq!(info.func_offset, 0x1000);
    assert_eq!(info.encoding, Encoding(0x0200_0001));
    assert_eq!(info.lsda_offset, 0);

    let info = reader.find(0x1020).unwrap().unwrap();
    assert_eq!(info.func_offset, 0x1020);
    assert_eq!(info.encoding.0 & !UNWIND_HAS_LSDA, 0x0300_0002);
    assert!(info.encoding.has_lsda());
    assert_eq!(info.lsda_offset, 0x50);

    assert_eq!(reader.find(0x0FFF).unwrap(), None);
    assert_eq!(reader.find(0x2000).unwrap(), None);

    // one range slot, the sentinel, and both halves of the LSDA entry
    assert_eq!(built.image_offset_fixups.len(), 4);
    assert_eq!(built.diff24_fixups.len(), 2);
    let sentinel = built
        .image_offset_fixups
        .iter()
        .find(|f| f.include_target_size_in_addend)
        .unwrap();
    assert_eq!(sentinel.handle, SymbolHandle(0x1020));
    let slot = sentinel.section_offset as usize;
    let written = u32::from_le_bytes(built.bytes[slot..slot + 4].try_into().unwrap());
    assert_eq!(written, 0x1020);
    assert!(built
        .image_offset_fixups
        .iter()
        .any(|f| f.handle == SymbolHandle(0x999)));
}

#[test]
fn iteration_matches_input_after_merging() {
    // alternate two encodings so nothing merges and both become common
    let mut input = Vec::new();
    for i in 0..40u32 {
        let encoding = if i % 2 == 0 { 0x0100_0000 } else { 0x0200_0010 };
        input.push(entry(0x1000 + i * 0x40, encoding));
    }
    let built = UnwindBuilder::build(Arch::X86_64, input.clone());
    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    reader.validate().unwrap();

    let header = SectionHeader::parse(&built.bytes).unwrap();
    assert_eq!(header.common_encodings_count(), 2);

    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), input.len());
    for (record, input) in records.iter().zip(&input) {
        assert_eq!(record.func_offset, input.func_offset);
        assert_eq!(record.encoding, input.encoding);
        assert_eq!(record.lsda_offset, 0);
        assert_eq!(record.personality_offset, 0);
    }

    // every offset inside a function resolves to that function
    for input in &input {
        let info = reader.find(input.func_offset + 0x20).unwrap().unwrap();
        assert_eq!(info.func_offset, input.func_offset);
        assert_eq!(info.encoding, input.encoding);
    }
}

#[test]
fn lsda_and_personality_resolution() {
    let personality = Some(SymbolHandle(0x7000));
    let built = UnwindBuilder::build(
        Arch::X86_64,
        vec![
            WriterUnwindInfo {
                lsda_offset: 0x5000,
                lsda_handle: Some(SymbolHandle(0x50)),
                personality_offset: 0x6000,
                personality_handle: personality,
                ..entry(0x100, 0x0100_0000)
            },
            entry(0x200, 0x0100_0000),
            WriterUnwindInfo {
                lsda_offset: 0x5008,
                lsda_handle: Some(SymbolHandle(0x51)),
                personality_offset: 0x6000,
                personality_handle: personality,
                ..entry(0x300, 0x0200_0010)
            },
        ],
    );
    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].lsda_offset, 0x5000);
    assert_eq!(records[0].personality_offset, 0x6000);
    assert_eq!(records[0].encoding.personality_index(), 1);
    assert_eq!(records[1].lsda_offset, 0);
    assert_eq!(records[1].personality_offset, 0);
    assert_eq!(records[2].lsda_offset, 0x5008);
    assert_eq!(records[2].personality_offset, 0x6000);

    let info = reader.find(0x300).unwrap().unwrap();
    assert_eq!(info.lsda_offset, 0x5008);
    assert_eq!(info.personality_offset, 0x6000);
}

#[test]
fn build_is_deterministic() {
    let mut input = Vec::new();
    for i in 0..200u32 {
        input.push(entry(i * 0x30, 0x0100_0000 | (i % 7)));
    }
    let a = UnwindBuilder::build(Arch::X86_64, input.clone());
    let b = UnwindBuilder::build(Arch::X86_64, input);
    assert_eq!(a.bytes, b.bytes);
    assert_eq!(a.image_offset_fixups, b.image_offset_fixups);
    assert_eq!(a.diff24_fixups, b.diff24_fixups);
}

#[test]
fn sparse_offsets_fall_back_to_regular_page() {
    // the second function is too far from the first for a 24-bit delta
    let built = UnwindBuilder::build(
        Arch::X86_64,
        vec![entry(0x0, 0x0100_0000), entry(0x0100_0000, 0x0200_0010)],
    );
    assert_eq!(first_page_kind(&built.bytes), PAGE_KIND_REGULAR);

    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    reader.validate().unwrap();
    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), 2);
    let info = reader.find(0x0100_0000).unwrap().unwrap();
    assert_eq!(info.func_offset, 0x0100_0000);
    assert_eq!(info.encoding, Encoding(0x0200_0010));
}

#[test]
fn arm64_branch_islands_split_far_apart_functions() {
    // 14 MiB apart, straddling a 124 MiB branch-island interval. The delta
    // fits 24 bits, but arm64 must leave room for islands.
    let a = 124 * 1024 * 1024 - 7 * 1024 * 1024;
    let b = 124 * 1024 * 1024 + 7 * 1024 * 1024;
    let input = vec![entry(a, 0x0200_1000), entry(b, 0x0200_2000)];

    let built = UnwindBuilder::build(Arch::Arm64, input.clone());
    assert_eq!(first_page_kind(&built.bytes), PAGE_KIND_REGULAR);
    let reader = UnwindReader::new(&built.bytes, Arch::Arm64);
    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), 2);

    // no islands on x86-64, so the same input packs compressed
    let built = UnwindBuilder::build(Arch::X86_64, input);
    assert_eq!(first_page_kind(&built.bytes), PAGE_KIND_COMPRESSED);
}

#[test]
fn empty_table_round_trips() {
    let built = UnwindBuilder::build(Arch::Arm64, Vec::new());
    assert_eq!(built.bytes.len(), SECTION_HEADER_SIZE as usize);

    let reader = UnwindReader::new(&built.bytes, Arch::Arm64);
    reader.validate().unwrap();
    assert_eq!(reader.entries().unwrap().count().unwrap(), 0);
    assert_eq!(reader.find(0x1000).unwrap(), None);
}

#[test]
fn validate_rejects_corrupt_tables() {
    use compact_unwind::ReadError;

    let built = UnwindBuilder::build(Arch::X86_64, vec![entry(0x100, 0x0100_0000)]);

    let mut bad_version = built.bytes.clone();
    bad_version[0] = 9;
    let reader = UnwindReader::new(&bad_version, Arch::X86_64);
    assert!(matches!(reader.validate(), Err(ReadError::BadVersion(9))));

    // truncating below the first-level index invalidates the table
    let truncated = &built.bytes[..SECTION_HEADER_SIZE as usize];
    let reader = UnwindReader::new(truncated, Arch::X86_64);
    assert!(reader.validate().is_err());

    let reader = UnwindReader::new(&[], Arch::X86_64);
    assert!(reader.validate().is_err());
}

#[test]
fn compressed_entry_offset_overflow_is_an_error() {
    use compact_unwind::ReadError;

    fn push_u32(bytes: &mut Vec<u8>, value: u32) {
        bytes.extend_from_slice(&value.to_le_bytes());
    }

    // a range starting near u32::MAX with an entry whose in-page offset
    // pushes the function offset past the end of the address space
    let mut bytes = Vec::new();
    push_u32(&mut bytes, 1); // version
    push_u32(&mut bytes, 28); // common encodings table (empty)
    push_u32(&mut bytes, 0);
    push_u32(&mut bytes, 28); // personality table (empty)
    push_u32(&mut bytes, 0);
    push_u32(&mut bytes, 28); // first-level index
    push_u32(&mut bytes, 2);
    push_u32(&mut bytes, 0xFFFF_FF00); // range start
    push_u32(&mut bytes, 52); // page offset
    push_u32(&mut bytes, 52); // LSDA slice (empty)
    push_u32(&mut bytes, 0xFFFF_FFFF); // sentinel
    push_u32(&mut bytes, 0);
    push_u32(&mut bytes, 52);
    push_u32(&mut bytes, PAGE_KIND_COMPRESSED);
    push_u32(&mut bytes, 20); // entries
    push_u32(&mut bytes, 1);
    push_u32(&mut bytes, 24); // page-local encodings
    push_u32(&mut bytes, 1);
    push_u32(&mut bytes, 0x200); // encoding index 0, in-page offset 0x200
    push_u32(&mut bytes, 0x0100_0000);

    let reader = UnwindReader::new(&bytes, Arch::X86_64);
    reader.validate().unwrap();
    let result: Result<Vec<_>, _> = reader.entries().unwrap().collect();
    assert_eq!(result, Err(ReadError::FunctionOffsetOverflow));
    // lookups below the overflowing entry still answer without panicking
    assert_eq!(reader.find(0xFFFF_FFFF).unwrap(), None);
}

#[test]
fn common_table_caps_at_127_shared_encodings() {
    // 150 encodings each used twice, in two blocks so nothing merges; only
    // the 127 most frequent may be shared
    let mut input = Vec::new();
    let mut offset = 0;
    for _ in 0..2 {
        for i in 0..150u32 {
            input.push(entry(offset, 0x0100_0000 | i));
            offset += 0x40;
        }
    }
    let built = UnwindBuilder::build(Arch::X86_64, input.clone());
    let header = SectionHeader::parse(&built.bytes).unwrap();
    let common_count = header.common_encodings_count();
    assert_eq!(common_count, 127);

    // walk the emitted pages: every index stays inside the combined
    // byte-wide encoding space, and no in-page offset was truncated
    let first_level = header.first_level_entries(&built.bytes).unwrap();
    let mut reconstructed = Vec::new();
    for range in &first_level[..first_level.len() - 1] {
        let page_offset = range.second_level_page_offset();
        assert_eq!(range.page_kind(&built.bytes).unwrap(), PAGE_KIND_COMPRESSED);
        let page = CompressedPageHeader::parse(&built.bytes, page_offset.into()).unwrap();
        assert!(common_count + page.encodings_count() <= 256);
        for page_entry in page.entries(&built.bytes, page_offset).unwrap() {
            let index = page_entry.encoding_index() as u32;
            assert!(index < common_count + page.encodings_count());
            reconstructed.push(range.function_offset() + page_entry.function_offset_in_page());
        }
    }
    let offsets: Vec<u32> = input.iter().map(|e| e.func_offset).collect();
    assert_eq!(reconstructed, offsets);
}

#[test]
fn page_local_encoding_index_is_byte_bounded() {
    // exactly 256 distinct one-off encodings fill the index space
    let input: Vec<_> = (0..256u32)
        .map(|i| entry(i * 0x10, 0x0100_0000 | i))
        .collect();
    let built = UnwindBuilder::build(Arch::X86_64, input);
    let header = SectionHeader::parse(&built.bytes).unwrap();
    assert_eq!(header.common_encodings_count(), 0);
    let first_level = header.first_level_entries(&built.bytes).unwrap();
    let page_offset = first_level[0].second_level_page_offset();
    assert_eq!(
        first_level[0].page_kind(&built.bytes).unwrap(),
        PAGE_KIND_COMPRESSED
    );
    let page = CompressedPageHeader::parse(&built.bytes, page_offset.into()).unwrap();
    assert_eq!(page.encodings_count(), 256);
    let max_index = page
        .entries(&built.bytes, page_offset)
        .unwrap()
        .iter()
        .map(|e| e.encoding_index())
        .max()
        .unwrap();
    assert_eq!(max_index, 255);

    // a 257th distinct encoding would need index 256, so the builder falls
    // back to a regular page instead
    let input: Vec<_> = (0..257u32)
        .map(|i| entry(i * 0x10, 0x0100_0000 | i))
        .collect();
    let built = UnwindBuilder::build(Arch::X86_64, input.clone());
    assert_eq!(first_page_kind(&built.bytes), PAGE_KIND_REGULAR);
    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), input.len());
}

#[test]
fn many_entries_spill_into_multiple_pages() {
    // more compressed entries than fit one 4 KiB page
    let mut input = Vec::new();
    for i in 0..2500u32 {
        input.push(entry(i * 0x10, 0x0100_0000 | (i % 3)));
    }
    let built = UnwindBuilder::build(Arch::X86_64, input.clone());
    let header = SectionHeader::parse(&built.bytes).unwrap();
    assert!(header.index_count() > 2);
    let first_level: &[FirstLevelEntry] = header.first_level_entries(&built.bytes).unwrap();
    assert!(first_level
        .windows(2)
        .all(|p| p[0].function_offset() <= p[1].function_offset()));
    // pages start on 8-byte boundaries
    for range in &first_level[..first_level.len() - 1] {
        assert_eq!(range.second_level_page_offset() % 8, 0);
    }

    let reader = UnwindReader::new(&built.bytes, Arch::X86_64);
    reader.validate().unwrap();
    let records: Vec<_> = reader.entries().unwrap().collect().unwrap();
    assert_eq!(records.len(), input.len());
    for probe in [0x0u32, 0x1234, 0x5558, 2499 * 0x10] {
        let info = reader.find(probe).unwrap().unwrap();
        assert_eq!(info.func_offset, probe & !0xF);
    }
}
