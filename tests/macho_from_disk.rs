//! Parsing a Mach-O straight off disk, the way a debugger would read the
//! executable argument before ever spawning it. The in-memory `Cursor` tests
//! beside `macho.rs` cover the parser's slide arithmetic; this exercises the
//! same parser over a real `std::fs::File` and a real temp path.

use std::fs::File;
use std::io::Write;

use mach_debug::macho::{self, Mode, MH_EXECUTE};

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

/// A minimal non-PIE Mach-O 64 executable: one `__TEXT` segment, no symbols.
fn build_minimal_executable(text_vmaddr: u64) -> Vec<u8> {
    let mut cmds = Vec::new();
    push_u32(&mut cmds, 0x19); // LC_SEGMENT_64
    push_u32(&mut cmds, 72);
    push_name16(&mut cmds, "__TEXT");
    push_u64(&mut cmds, text_vmaddr);
    push_u64(&mut cmds, 0x1000);
    push_u64(&mut cmds, 0);
    push_u64(&mut cmds, 0x1000);
    push_u32(&mut cmds, 0x7);
    push_u32(&mut cmds, 0x5);
    push_u32(&mut cmds, 0);
    push_u32(&mut cmds, 0);

    let mut header = Vec::new();
    push_u32(&mut header, macho::MH_MAGIC_64);
    push_u32(&mut header, 0x0100_0007);
    push_u32(&mut header, 0x3);
    push_u32(&mut header, MH_EXECUTE);
    push_u32(&mut header, 1); // ncmds
    push_u32(&mut header, cmds.len() as u32);
    push_u32(&mut header, 0); // flags: not PIE
    push_u32(&mut header, 0);

    let mut file = header;
    file.extend_from_slice(&cmds);
    file
}

#[test]
fn parses_an_executable_written_to_a_real_file() {
    let text_vmaddr = 0x1_0000_0000u64;
    let data = build_minimal_executable(text_vmaddr);

    let dir = tempfile::tempdir().expect("create scratch dir");
    let path = dir.path().join("minimal_exe");
    File::create(&path)
        .expect("create temp file")
        .write_all(&data)
        .expect("write synthetic image");

    let mut file = File::open(&path).expect("reopen temp file");
    let image = macho::parse(&mut file, Mode::File).expect("parse from disk");

    assert_eq!(image.file_type, MH_EXECUTE);
    assert_eq!(image.slide, 0);
    similar_asserts::assert_eq!(
        image.text_segment().map(|s| s.vm_addr),
        Some(text_vmaddr),
    );
}
