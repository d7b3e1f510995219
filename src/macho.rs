//! Mach-O header, load-command, segment/section, and symbol-table parsing.
//!
//! Works over any `Read + Seek` source so the same code parses a file on disk
//! or a live [`PagedStream`](crate::stream::PagedStream) over another
//! process's memory. Only the 64-bit little-endian format is handled — the
//! targets this debugger attaches to are x86-64 processes, which never carry
//! 32-bit Mach-O images.

use std::io::{Read, Seek, SeekFrom};

use scroll::{Pread, LE};

use crate::error::{Error, Kind, Result};

pub const MH_MAGIC_64: u32 = 0xfeed_facf;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;
pub const MH_DYLINKER: u32 = 0x7;
/// Position-independent executable, set in `mach_header_64.flags`.
pub const MH_PIE: u32 = 0x0020_0000;

const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_DYSYMTAB: u32 = 0xb;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x8000_0018;
const LC_REEXPORT_DYLIB: u32 = 0x8000_001f;
const LC_ID_DYLINKER: u32 = 0xf;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_UUID: u32 = 0x1b;

const HEADER_SIZE: usize = 32;
const SEGMENT_COMMAND_SIZE: usize = 72;
const SECTION_SIZE: usize = 80;
const NLIST_SIZE: usize = 16;

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub segment_name: String,
    pub addr: u64,
    pub size: u64,
    pub file_offset: u32,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub sections: Vec<Section>,
}

bitflags::bitflags! {
    /// Orthogonal flags decoded from `n_type`/`n_desc`, independent of the
    /// mutually exclusive [`SymbolKind`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymbolFlags: u16 {
        const STAB = 0x0001;
        const PRIVATE_EXTERNAL = 0x0002;
        const EXTERNAL = 0x0004;
        const WEAK_REF = 0x0008;
        const WEAK_DEF = 0x0010;
        const ALT_ENTRY = 0x0020;
    }
}

/// Mutually exclusive symbol type-classes decoded from the low bits of `n_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Undefined,
    Absolute,
    /// Carries the 1-based section index the symbol is defined in.
    DefinedInSection(u8),
    Prebound,
    Indirect,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub kind: SymbolKind,
    pub flags: SymbolFlags,
    /// Two-level namespace library ordinal, `GET_LIBRARY_ORDINAL(n_desc)`.
    pub library_ordinal: u8,
}

#[derive(Debug, Clone)]
pub struct Dylib {
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DysymtabInfo {
    pub local_symbols: (u32, u32),
    pub external_defined_symbols: (u32, u32),
    pub undefined_symbols: (u32, u32),
}

/// Whether the parser is reading a file on disk or a live process image; the
/// latter carries the address the image was loaded at so the ASLR slide can
/// be computed.
#[derive(Debug, Clone, Copy)]
pub enum Mode {
    File,
    Image { load_address: u64 },
}

#[derive(Debug, Default)]
pub struct ParsedImage {
    pub file_type: u32,
    pub flags: u32,
    pub segments: Vec<Segment>,
    pub symbols: Vec<Symbol>,
    pub dylibs: Vec<Dylib>,
    pub dylinker: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub dysymtab: Option<DysymtabInfo>,
    /// Applied exactly once, inside the parser, before symbol values are
    /// computed. Zero for file mode or for a non-PIE, non-dynamic-linker image.
    pub slide: u64,
}

impl ParsedImage {
    pub fn segment_by_name(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    /// 1-based, matching the Mach-O load-command ordering.
    pub fn segment_by_index(&self, index: usize) -> Option<&Segment> {
        index.checked_sub(1).and_then(|i| self.segments.get(i))
    }

    /// 1-based across the concatenation of every segment's sections, in
    /// load-command order.
    pub fn section_by_index(&self, index: usize) -> Option<&Section> {
        if index == 0 {
            return None;
        }
        self.segments
            .iter()
            .flat_map(|s| s.sections.iter())
            .nth(index - 1)
    }

    pub fn text_segment(&self) -> Option<&Segment> {
        self.segment_by_name("__TEXT")
    }

    pub fn data_segment(&self) -> Option<&Segment> {
        self.segment_by_name("__DATA")
    }

    pub fn linkedit_segment(&self) -> Option<&Segment> {
        self.segment_by_name("__LINKEDIT")
    }
}

struct SymtabInfo {
    sym_off: u32,
    n_syms: u32,
    str_off: u32,
    str_size: u32,
}

/// Parses a Mach-O image from `reader`, starting at its current position 0.
pub fn parse<R: Read + Seek>(reader: &mut R, mode: Mode) -> Result<ParsedImage> {
    reader.seek(SeekFrom::Start(0)).map_err(read_err(0))?;

    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).map_err(read_err(0))?;

    let magic: u32 = header_buf.pread_with(0, LE).map_err(parser_err(0))?;
    if magic != MH_MAGIC_64 {
        return Err(
            Error::internal(Kind::Parser, "not a 64-bit little-endian Mach-O image")
                .context("magic", format!("{magic:#x}")),
        );
    }

    let file_type: u32 = header_buf.pread_with(12, LE).map_err(parser_err(0))?;
    let ncmds: u32 = header_buf.pread_with(16, LE).map_err(parser_err(0))?;
    let size_of_cmds: u32 = header_buf.pread_with(20, LE).map_err(parser_err(0))?;
    let flags: u32 = header_buf.pread_with(24, LE).map_err(parser_err(0))?;

    let mut cmd_buf = vec![0u8; size_of_cmds as usize];
    reader
        .read_exact(&mut cmd_buf)
        .map_err(read_err(HEADER_SIZE as u64))?;

    let mut image = ParsedImage {
        file_type,
        flags,
        ..Default::default()
    };
    let mut symtab = None;
    let mut cursor = 0usize;

    for _ in 0..ncmds {
        if cursor + 8 > cmd_buf.len() {
            return Err(Error::internal(Kind::Parser, "load command truncated")
                .context("offset", HEADER_SIZE + cursor));
        }
        let cmd: u32 = cmd_buf
            .pread_with(cursor, LE)
            .map_err(parser_err(HEADER_SIZE + cursor))?;
        let cmd_size: u32 = cmd_buf
            .pread_with(cursor + 4, LE)
            .map_err(parser_err(HEADER_SIZE + cursor))?;

        if cmd_size == 0 || cursor + cmd_size as usize > cmd_buf.len() {
            return Err(Error::internal(Kind::Parser, "load command size out of range")
                .context("offset", HEADER_SIZE + cursor)
                .context("cmd_size", cmd_size));
        }
        let body = &cmd_buf[cursor..cursor + cmd_size as usize];

        match cmd {
            LC_SEGMENT_64 => image.segments.push(parse_segment(body)?),
            LC_SYMTAB => symtab = Some(parse_symtab(body)?),
            LC_DYSYMTAB => image.dysymtab = Some(parse_dysymtab(body)?),
            LC_ID_DYLIB | LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB => {
                image.dylibs.push(parse_dylib(body)?);
            }
            LC_ID_DYLINKER | LC_LOAD_DYLINKER => {
                image.dylinker = Some(parse_trailing_name(body, 8));
            }
            LC_UUID if body.len() >= 24 => {
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&body[8..24]);
                image.uuid = Some(uuid);
            }
            // Unknown or uninteresting commands are skipped by `cmd_size`.
            _ => {}
        }

        cursor += cmd_size as usize;
    }

    image.slide = match mode {
        Mode::Image { load_address } if flags & MH_PIE != 0 || file_type == MH_DYLINKER => {
            match image.segments.iter().find(|s| s.file_off == 0 && s.file_size != 0) {
                Some(text) => load_address.wrapping_sub(text.vm_addr),
                None => 0,
            }
        }
        _ => 0,
    };

    if image.slide != 0 {
        for segment in &mut image.segments {
            segment.vm_addr = segment.vm_addr.wrapping_add(image.slide);
            for section in &mut segment.sections {
                section.addr = section.addr.wrapping_add(image.slide);
            }
        }
    }

    if let Some(symtab) = symtab {
        image.symbols = parse_symbols(reader, &image, mode, &symtab)?;
    }

    Ok(image)
}

fn parse_segment(body: &[u8]) -> Result<Segment> {
    let name = fixed_name(&body[8..24]);
    let vm_addr: u64 = body.pread_with(24, LE).map_err(parser_err(0))?;
    let vm_size: u64 = body.pread_with(32, LE).map_err(parser_err(0))?;
    let file_off: u64 = body.pread_with(40, LE).map_err(parser_err(0))?;
    let file_size: u64 = body.pread_with(48, LE).map_err(parser_err(0))?;
    let max_prot: i32 = body.pread_with(56, LE).map_err(parser_err(0))?;
    let init_prot: i32 = body.pread_with(60, LE).map_err(parser_err(0))?;
    let num_sections: u32 = body.pread_with(64, LE).map_err(parser_err(0))?;

    let mut sections = Vec::with_capacity(num_sections as usize);
    let mut offset = SEGMENT_COMMAND_SIZE;
    for _ in 0..num_sections {
        if offset + SECTION_SIZE > body.len() {
            return Err(Error::internal(Kind::Parser, "section record truncated"));
        }
        let sect_name = fixed_name(&body[offset..offset + 16]);
        let seg_name = fixed_name(&body[offset + 16..offset + 32]);
        let addr: u64 = body.pread_with(offset + 32, LE).map_err(parser_err(0))?;
        let size: u64 = body.pread_with(offset + 40, LE).map_err(parser_err(0))?;
        let file_offset: u32 = body.pread_with(offset + 48, LE).map_err(parser_err(0))?;
        sections.push(Section {
            name: sect_name,
            segment_name: seg_name,
            addr,
            size,
            file_offset,
        });
        offset += SECTION_SIZE;
    }

    Ok(Segment {
        name,
        vm_addr,
        vm_size,
        file_off,
        file_size,
        max_prot,
        init_prot,
        sections,
    })
}

fn parse_symtab(body: &[u8]) -> Result<SymtabInfo> {
    Ok(SymtabInfo {
        sym_off: body.pread_with(8, LE).map_err(parser_err(0))?,
        n_syms: body.pread_with(12, LE).map_err(parser_err(0))?,
        str_off: body.pread_with(16, LE).map_err(parser_err(0))?,
        str_size: body.pread_with(20, LE).map_err(parser_err(0))?,
    })
}

fn parse_dysymtab(body: &[u8]) -> Result<DysymtabInfo> {
    let field = |offset: usize| -> Result<u32> { body.pread_with(offset, LE).map_err(parser_err(0)) };
    Ok(DysymtabInfo {
        local_symbols: (field(8)?, field(12)?),
        external_defined_symbols: (field(16)?, field(20)?),
        undefined_symbols: (field(24)?, field(28)?),
    })
}

fn parse_dylib(body: &[u8]) -> Result<Dylib> {
    Ok(Dylib {
        name: parse_trailing_name(body, 8),
    })
}

/// Reads the NUL-terminated string trailing a command, whose offset (relative
/// to the command's own start) is stored as a `u32` at `offset_field`.
fn parse_trailing_name(body: &[u8], offset_field: usize) -> String {
    let Ok(name_offset) = body.pread_with::<u32>(offset_field, LE) else {
        return String::new();
    };
    let start = name_offset as usize;
    if start >= body.len() {
        return String::new();
    }
    fixed_name(&body[start..])
}

fn fixed_name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_symbols<R: Read + Seek>(
    reader: &mut R,
    image: &ParsedImage,
    mode: Mode,
    symtab: &SymtabInfo,
) -> Result<Vec<Symbol>> {
    let linkedit_address = |file_offset: u32| -> Result<u64> {
        match mode {
            Mode::File => Ok(file_offset as u64),
            Mode::Image { .. } => {
                let linkedit = image.linkedit_segment().ok_or_else(|| {
                    Error::internal(Kind::Parser, "symbol table present but no __LINKEDIT segment")
                })?;
                Ok(linkedit.vm_addr + (file_offset as u64 - linkedit.file_off))
            }
        }
    };

    let table_addr = linkedit_address(symtab.sym_off)?;
    let string_table_addr = linkedit_address(symtab.str_off)?;

    reader
        .seek(SeekFrom::Start(table_addr))
        .map_err(read_err(table_addr))?;
    let mut buf = vec![0u8; NLIST_SIZE * symtab.n_syms as usize];
    reader.read_exact(&mut buf).map_err(read_err(table_addr))?;

    let mut symbols = Vec::with_capacity(symtab.n_syms as usize);
    for i in 0..symtab.n_syms as usize {
        let off = i * NLIST_SIZE;
        let n_strx: u32 = buf
            .pread_with(off, LE)
            .map_err(parser_err(table_addr as usize + off))?;
        let n_type: u8 = buf
            .pread_with(off + 4, LE)
            .map_err(parser_err(table_addr as usize + off))?;
        let n_sect: u8 = buf
            .pread_with(off + 5, LE)
            .map_err(parser_err(table_addr as usize + off))?;
        let n_desc: u16 = buf
            .pread_with(off + 6, LE)
            .map_err(parser_err(table_addr as usize + off))?;
        let n_value: u64 = buf
            .pread_with(off + 8, LE)
            .map_err(parser_err(table_addr as usize + off))?;

        // Tolerance: a symbol whose name offset overruns the string table is
        // left nameless rather than failing the whole parse, matching what
        // the dynamic linker itself does.
        let name = if n_strx == 0 || n_strx >= symtab.str_size {
            String::new()
        } else {
            read_c_string(reader, string_table_addr + n_strx as u64)?
        };

        let kind = match n_type & 0x0e {
            0x00 => SymbolKind::Undefined,
            0x02 => SymbolKind::Absolute,
            0x0e => SymbolKind::DefinedInSection(n_sect),
            0x0c => SymbolKind::Prebound,
            0x0a => SymbolKind::Indirect,
            _ => SymbolKind::Undefined,
        };

        let mut flags = SymbolFlags::empty();
        flags.set(SymbolFlags::STAB, n_type & 0xe0 != 0);
        flags.set(SymbolFlags::PRIVATE_EXTERNAL, n_type & 0x10 != 0);
        flags.set(SymbolFlags::EXTERNAL, n_type & 0x01 != 0);
        flags.set(SymbolFlags::WEAK_REF, n_desc & 0x0040 != 0);
        flags.set(SymbolFlags::WEAK_DEF, n_desc & 0x0080 != 0);
        flags.set(SymbolFlags::ALT_ENTRY, n_desc & 0x0200 != 0);

        let library_ordinal = ((n_desc >> 8) & 0xff) as u8;
        let value = match mode {
            Mode::Image { .. } => n_value.wrapping_add(image.slide),
            Mode::File => n_value,
        };

        symbols.push(Symbol {
            name,
            value,
            kind,
            flags,
            library_ordinal,
        });
    }

    Ok(symbols)
}

/// Reads a NUL-terminated string starting at `addr`. Capped so a corrupt or
/// unterminated string table can't force an unbounded read.
fn read_c_string<R: Read + Seek>(reader: &mut R, addr: u64) -> Result<String> {
    const MAX_LEN: usize = 4096;

    reader.seek(SeekFrom::Start(addr)).map_err(read_err(addr))?;
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).map_err(read_err(addr))?;
        if n == 0 || byte[0] == 0 || bytes.len() >= MAX_LEN {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parser_err(offset: usize) -> impl FnOnce(scroll::Error) -> Error {
    move |e| Error::internal(Kind::Parser, e.to_string()).context("offset", offset)
}

fn read_err(offset: u64) -> impl FnOnce(std::io::Error) -> Error {
    move |e| Error::internal(Kind::Parser, e.to_string()).context("offset", format!("{offset:#x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    fn push_name16(buf: &mut Vec<u8>, name: &str) {
        let mut fixed = [0u8; 16];
        fixed[..name.len()].copy_from_slice(name.as_bytes());
        buf.extend_from_slice(&fixed);
    }

    /// Builds a minimal Mach-O 64 image with a single `__TEXT` segment
    /// (`fileoff == 0`) containing one symbol, for slide and pass-1 tests.
    fn build_image(pie: bool, text_vmaddr: u64, symbol_value: u64) -> Vec<u8> {
        let mut cmds = Vec::new();

        // LC_SEGMENT_64 __TEXT, no sections.
        push_u32(&mut cmds, LC_SEGMENT_64);
        push_u32(&mut cmds, SEGMENT_COMMAND_SIZE as u32);
        push_name16(&mut cmds, "__TEXT");
        push_u64(&mut cmds, text_vmaddr);
        push_u64(&mut cmds, 0x1000);
        push_u64(&mut cmds, 0); // fileoff
        push_u64(&mut cmds, 0x1000); // filesize
        push_u32(&mut cmds, 0x7); // max_prot
        push_u32(&mut cmds, 0x5); // init_prot
        push_u32(&mut cmds, 0); // nsects
        push_u32(&mut cmds, 0); // flags

        // LC_SEGMENT_64 __LINKEDIT.
        let linkedit_fileoff = 0x2000u64;
        let linkedit_vmaddr = text_vmaddr + 0x2000;
        push_u32(&mut cmds, LC_SEGMENT_64);
        push_u32(&mut cmds, SEGMENT_COMMAND_SIZE as u32);
        push_name16(&mut cmds, "__LINKEDIT");
        push_u64(&mut cmds, linkedit_vmaddr);
        push_u64(&mut cmds, 0x1000);
        push_u64(&mut cmds, linkedit_fileoff);
        push_u64(&mut cmds, 0x1000);
        push_u32(&mut cmds, 0x1);
        push_u32(&mut cmds, 0x1);
        push_u32(&mut cmds, 0);
        push_u32(&mut cmds, 0);

        // LC_SYMTAB.
        let symoff = linkedit_fileoff as u32; // symbol table right at the start of __LINKEDIT
        let stroff = symoff + NLIST_SIZE as u32;
        push_u32(&mut cmds, LC_SYMTAB);
        push_u32(&mut cmds, 24);
        push_u32(&mut cmds, symoff);
        push_u32(&mut cmds, 1); // nsyms
        push_u32(&mut cmds, stroff);
        push_u32(&mut cmds, 8); // strsize

        let mut header = Vec::new();
        push_u32(&mut header, MH_MAGIC_64);
        push_u32(&mut header, 0x0100_0007); // CPU_TYPE_X86_64
        push_u32(&mut header, 0x3); // CPU_SUBTYPE_X86_64_ALL
        push_u32(&mut header, MH_EXECUTE);
        push_u32(&mut header, 3); // ncmds
        push_u32(&mut header, cmds.len() as u32); // sizeofcmds
        push_u32(&mut header, if pie { MH_PIE } else { 0 });
        push_u32(&mut header, 0); // reserved

        let mut file = header;
        file.extend_from_slice(&cmds);
        // pad up to the linkedit file offset.
        file.resize(linkedit_fileoff as usize, 0);
        // nlist_64: n_strx=1, n_type=N_SECT|N_EXT=0x0f, n_sect=1, n_desc=0, n_value.
        push_u32(&mut file, 1);
        file.push(0x0f);
        file.push(1);
        file.extend_from_slice(&0u16.to_le_bytes());
        push_u64(&mut file, symbol_value);
        // string table: NUL, then "_main\0".
        file.push(0);
        file.extend_from_slice(b"_main\0");
        file.resize(stroff as usize + 8, 0);
        file
    }

    #[test]
    fn rejects_bad_magic() {
        let mut cursor = Cursor::new(vec![0u8; 32]);
        let err = parse(&mut cursor, Mode::File).unwrap_err();
        assert_eq!(err.kind(), Kind::Parser);
    }

    #[test]
    fn file_mode_does_not_slide() {
        let data = build_image(true, 0x1_0000_0000, 0x1_0000_0abc);
        let mut cursor = Cursor::new(data);
        let image = parse(&mut cursor, Mode::File).unwrap();
        assert_eq!(image.slide, 0);
        assert_eq!(image.symbols[0].value, 0x1_0000_0abc);
    }

    #[test]
    fn pie_image_slide_applies_to_segments_and_symbols() {
        let text_vmaddr = 0x1_0000_0000u64;
        let load_address = 0x1_0abc_d000u64;
        let symbol_value = 0x1_0000_0abc; // pre-slide

        let data = build_image(true, text_vmaddr, symbol_value);
        let mut cursor = Cursor::new(data);
        let image = parse(&mut cursor, Mode::Image { load_address }).unwrap();

        let expected_slide = load_address - text_vmaddr;
        assert_eq!(image.slide, expected_slide);
        assert_eq!(image.text_segment().unwrap().vm_addr, load_address);
        assert_eq!(image.symbols[0].value, symbol_value + expected_slide);
        assert_eq!(image.symbols[0].name, "_main");
    }

    #[test]
    fn non_pie_image_does_not_slide_even_in_image_mode() {
        let text_vmaddr = 0x1000u64;
        let data = build_image(false, text_vmaddr, 0x1234);
        let mut cursor = Cursor::new(data);
        let image = parse(&mut cursor, Mode::Image { load_address: 0x5000 }).unwrap();
        assert_eq!(image.slide, 0);
        assert_eq!(image.text_segment().unwrap().vm_addr, text_vmaddr);
    }
}
