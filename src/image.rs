//! A loaded Mach-O image: a parser run once over a paged memory stream, plus
//! the per-image name → symbol index built on top of it.

use std::collections::HashMap;
use std::io::{Read, Seek};

use crate::error::Result;
use crate::macho::{self, Dylib, ParsedImage, Section, Segment, Symbol};

/// One image mapped into the target process (the executable, the dynamic
/// linker, or a shared library), parsed once at discovery time.
pub struct Image {
    load_address: u64,
    parsed: ParsedImage,
    symbols_by_name: HashMap<String, usize>,
}

impl Image {
    /// Parses an image over `source`, which must already be positioned so
    /// that offset 0 of the source is the image's Mach-O header (i.e. a
    /// [`PagedStream`](crate::stream::PagedStream) based at the load address).
    pub fn parse<R: Read + Seek>(source: &mut R, load_address: u64) -> Result<Self> {
        let parsed = macho::parse(source, macho::Mode::Image { load_address })?;
        let symbols_by_name = parsed
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.name.is_empty())
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        Ok(Self {
            load_address,
            parsed,
            symbols_by_name,
        })
    }

    pub fn load_address(&self) -> u64 {
        self.load_address
    }

    pub fn file_type(&self) -> u32 {
        self.parsed.file_type
    }

    pub fn flags(&self) -> u32 {
        self.parsed.flags
    }

    pub fn uuid(&self) -> Option<uuid::Uuid> {
        self.parsed.uuid.map(uuid::Uuid::from_bytes)
    }

    pub fn slide(&self) -> u64 {
        self.parsed.slide
    }

    pub fn dylibs(&self) -> &[Dylib] {
        &self.parsed.dylibs
    }

    pub fn dylinker(&self) -> Option<&str> {
        self.parsed.dylinker.as_deref()
    }

    pub fn has_symbol(&self, name: &str) -> bool {
        self.symbols_by_name.contains_key(name)
    }

    pub fn symbol_by_name(&self, name: &str) -> Option<&Symbol> {
        self.symbols_by_name.get(name).map(|&i| &self.parsed.symbols[i])
    }

    pub fn all_symbols(&self) -> &[Symbol] {
        &self.parsed.symbols
    }

    pub fn segment_by_name(&self, name: &str) -> Option<&Segment> {
        self.parsed.segment_by_name(name)
    }

    pub fn segment_by_index(&self, index: usize) -> Option<&Segment> {
        self.parsed.segment_by_index(index)
    }

    pub fn section_by_index(&self, index: usize) -> Option<&Section> {
        self.parsed.section_by_index(index)
    }

    pub fn text_segment(&self) -> Option<&Segment> {
        self.parsed.text_segment()
    }

    pub fn data_segment(&self) -> Option<&Segment> {
        self.parsed.data_segment()
    }

    pub fn linkedit_segment(&self) -> Option<&Segment> {
        self.parsed.linkedit_segment()
    }
}
