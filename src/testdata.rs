//! Synthetic little endian Mach-O images for the unit tests.

use crate::consts::*;

fn pad_name(name: &str) -> [u8; 16] {
    let mut buf = [0; 16];

    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

fn align4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Write `data` at `offset`, growing the buffer as needed.
pub fn place(buf: &mut Vec<u8>, offset: usize, data: &[u8]) {
    if buf.len() < offset + data.len() {
        buf.resize(offset + data.len(), 0);
    }

    buf[offset..offset + data.len()].copy_from_slice(data);
}

pub fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes().to_vec()).collect()
}

pub fn uleb(mut v: u64) -> Vec<u8> {
    let mut buf = Vec::new();

    loop {
        let b = (v & 0x7F) as u8;

        v >>= 7;

        if v == 0 {
            buf.push(b);
            break;
        }

        buf.push(b | 0x80);
    }

    buf
}

pub fn raw_command(cmd: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = words(&[cmd, 0]);

    buf.extend_from_slice(payload);
    align4(&mut buf);

    let cmdsize = buf.len() as u32;

    buf[4..8].copy_from_slice(&cmdsize.to_le_bytes());
    buf
}

/// `(sectname, addr, size, offset, flags)`
pub type SectionSpec<'a> = (&'a str, u64, u64, u32, u32);

pub fn segment64_command(
    segname: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: i32,
    sections: &[SectionSpec],
) -> Vec<u8> {
    let mut buf = pad_name(segname).to_vec();

    for v in &[vmaddr, vmsize, fileoff, filesize] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf.extend(words(&[7, initprot as u32, sections.len() as u32, 0]));

    for &(sectname, addr, size, offset, flags) in sections {
        buf.extend_from_slice(&pad_name(sectname));
        buf.extend_from_slice(&pad_name(segname));
        buf.extend_from_slice(&addr.to_le_bytes());
        buf.extend_from_slice(&size.to_le_bytes());
        buf.extend(words(&[offset, 0, 0, 0, flags, 0, 0, 0]));
    }

    raw_command(LC_SEGMENT_64, &buf)
}

pub fn segment32_command(
    segname: &str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: i32,
    sections: &[SectionSpec],
) -> Vec<u8> {
    let mut buf = pad_name(segname).to_vec();

    buf.extend(words(&[
        vmaddr as u32,
        vmsize as u32,
        fileoff as u32,
        filesize as u32,
        7,
        initprot as u32,
        sections.len() as u32,
        0,
    ]));

    for &(sectname, addr, size, offset, flags) in sections {
        buf.extend_from_slice(&pad_name(sectname));
        buf.extend_from_slice(&pad_name(segname));
        buf.extend(words(&[addr as u32, size as u32, offset, 0, 0, 0, flags, 0, 0]));
    }

    raw_command(LC_SEGMENT, &buf)
}

pub fn uuid_command(uuid: [u8; 16]) -> Vec<u8> {
    raw_command(LC_UUID, &uuid)
}

pub fn dylib_command(cmd: u32, name: &str) -> Vec<u8> {
    let mut buf = words(&[24, 2, 0x10000, 0x10000]);

    buf.extend_from_slice(name.as_bytes());
    buf.push(0);

    raw_command(cmd, &buf)
}

pub fn build_version_command(platform: u32, minos: u32, sdk: u32, tools: &[(u32, u32)]) -> Vec<u8> {
    let mut buf = words(&[platform, minos, sdk, tools.len() as u32]);

    for &(tool, version) in tools {
        buf.extend(words(&[tool, version]));
    }

    raw_command(LC_BUILD_VERSION, &buf)
}

pub fn version_min_command(cmd: u32, version: u32, sdk: u32) -> Vec<u8> {
    raw_command(cmd, &words(&[version, sdk]))
}

pub fn symtab_command(symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Vec<u8> {
    raw_command(LC_SYMTAB, &words(&[symoff, nsyms, stroff, strsize]))
}

pub fn dysymtab_command(indirectsymoff: u32, nindirectsyms: u32) -> Vec<u8> {
    let mut fields = [0u32; 18];

    fields[12] = indirectsymoff;
    fields[13] = nindirectsyms;

    raw_command(LC_DYSYMTAB, &words(&fields))
}

/// `[(off, size); 5]` for rebase, bind, weak bind, lazy bind and export.
pub fn dyld_info_command(tables: [(u32, u32); 5]) -> Vec<u8> {
    let fields: Vec<u32> = tables.iter().flat_map(|&(off, size)| vec![off, size]).collect();

    raw_command(LC_DYLD_INFO_ONLY, &words(&fields))
}

pub fn linkedit_command(cmd: u32, off: u32, size: u32) -> Vec<u8> {
    raw_command(cmd, &words(&[off, size]))
}

pub fn main_command(entryoff: u64, stacksize: u64) -> Vec<u8> {
    let mut buf = entryoff.to_le_bytes().to_vec();

    buf.extend_from_slice(&stacksize.to_le_bytes());

    raw_command(LC_MAIN, &buf)
}

pub fn nlist64(strx: u32, n_type: u8, n_sect: u8, n_desc: u16, n_value: u64) -> Vec<u8> {
    let mut buf = strx.to_le_bytes().to_vec();

    buf.push(n_type);
    buf.push(n_sect);
    buf.extend_from_slice(&n_desc.to_le_bytes());
    buf.extend_from_slice(&n_value.to_le_bytes());
    buf
}

pub fn nlist32(strx: u32, n_type: u8, n_sect: u8, n_desc: u16, n_value: u32) -> Vec<u8> {
    let mut buf = strx.to_le_bytes().to_vec();

    buf.push(n_type);
    buf.push(n_sect);
    buf.extend_from_slice(&n_desc.to_le_bytes());
    buf.extend_from_slice(&n_value.to_le_bytes());
    buf
}

pub fn regular_export(offset: u64) -> Vec<u8> {
    let mut buf = uleb(0);

    buf.extend(uleb(offset));
    buf
}

pub fn reexport(ordinal: u64, name: &str) -> Vec<u8> {
    let mut buf = uleb(u64::from(EXPORT_SYMBOL_FLAGS_REEXPORT));

    buf.extend(uleb(ordinal));
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf
}

/// A flat export trie, one edge from the root per symbol.
///
/// Child offsets use a fixed two byte ULEB so the layout is known upfront.
pub fn export_trie(entries: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let root_size = 2 + entries.iter().map(|(name, _)| name.len() + 1 + 2).sum::<usize>();
    let mut root = vec![0, entries.len() as u8];
    let mut children = Vec::new();

    for (name, payload) in entries {
        let off = root_size + children.len();

        root.extend_from_slice(name.as_bytes());
        root.push(0);
        root.push(0x80 | (off & 0x7F) as u8);
        root.push((off >> 7) as u8);

        children.extend(uleb(payload.len() as u64));
        children.extend_from_slice(payload);
        children.push(0);
    }

    root.extend(children);
    root
}

/// Builds a header followed by the given load commands.
pub struct MachBuilder {
    is_64bit: bool,
    cputype: cpu_type_t,
    cpusubtype: cpu_subtype_t,
    filetype: u32,
    flags: u32,
    commands: Vec<Vec<u8>>,
}

impl MachBuilder {
    pub fn new() -> Self {
        MachBuilder {
            is_64bit: true,
            cputype: CPU_TYPE_X86_64,
            cpusubtype: 3,
            filetype: MH_DYLIB,
            flags: 0,
            commands: Vec::new(),
        }
    }

    pub fn arch32(mut self) -> Self {
        self.is_64bit = false;
        self.cputype = CPU_TYPE_I386;
        self
    }

    pub fn cputype(mut self, cputype: cpu_type_t, cpusubtype: cpu_subtype_t) -> Self {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn filetype(mut self, filetype: u32) -> Self {
        self.filetype = filetype;
        self
    }

    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn command(mut self, cmd: Vec<u8>) -> Self {
        self.commands.push(cmd);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let sizeofcmds: usize = self.commands.iter().map(Vec::len).sum();
        let magic = if self.is_64bit { MH_MAGIC_64 } else { MH_MAGIC };
        let mut buf = words(&[
            magic,
            self.cputype as u32,
            self.cpusubtype as u32,
            self.filetype,
            self.commands.len() as u32,
            sizeofcmds as u32,
            self.flags,
        ]);

        if self.is_64bit {
            buf.extend(words(&[0]));
        }

        for cmd in &self.commands {
            buf.extend_from_slice(cmd);
        }

        buf
    }
}

/// Layout of `sample_dylib`.
pub mod sample {
    pub const TEXT_ADDR: u64 = 0x1000;
    pub const TEXT_SIZE: u64 = 0x2000;
    pub const DATA_ADDR: u64 = 0x4000;
    pub const LINKEDIT_ADDR: u64 = 0x5000;
    pub const GOT_ADDR: u64 = 0x4000;
    pub const REBASE_OFF: u32 = 0x3000;
    pub const BIND_OFF: u32 = 0x3040;
    pub const LAZY_BIND_OFF: u32 = 0x3080;
    pub const EXPORT_OFF: u32 = 0x30C0;
    pub const FUNC_STARTS_OFF: u32 = 0x3100;
    pub const SYMOFF: u32 = 0x3200;
    pub const STROFF: u32 = 0x3300;
    pub const INDIRECT_OFF: u32 = 0x3380;
    pub const FILE_SIZE: usize = 0x4000;
}

/// A 64-bit dylib with a text, data and link-edit segment.
///
/// * exports `_foo` at 0x1010 and `_baz` at 0x1100 through the trie;
/// * symbols `_foo` (defined), `_local` (defined, not external) and
///   `_bar` (undefined, from the first dylib);
/// * the GOT at 0x4000 holds two slots bound to `_bar` and a local symbol;
/// * rebase at 0x4008 and 0x4010; bind of `_bar` at 0x4000.
pub fn sample_dylib() -> Vec<u8> {
    use self::sample::*;

    let rebase = vec![
        REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
        REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        0x08,
        REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2,
        REBASE_OPCODE_DONE,
    ];
    let mut bind = vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1, BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM];

    bind.extend_from_slice(b"_bar\0");
    bind.extend_from_slice(&[
        BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER,
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        0x00,
        BIND_OPCODE_DO_BIND,
        BIND_OPCODE_DONE,
    ]);

    let mut lazy = vec![
        BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        0x20,
        BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2,
        BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
    ];

    lazy.extend_from_slice(b"_qux\0");
    lazy.extend_from_slice(&[BIND_OPCODE_DO_BIND, BIND_OPCODE_DONE]);

    let trie = export_trie(&[("_foo", regular_export(0x10)), ("_baz", regular_export(0x100))]);
    let func_starts = [uleb(0x100), uleb(0x20), vec![0]].concat();
    let strings = b"\0_foo\0_local\0_bar\0".to_vec();
    let symbols = [
        nlist64(1, N_SECT | N_EXT, 1, 0, 0x1010),
        nlist64(6, N_SECT, 1, 0, 0x1120),
        nlist64(13, N_UNDF | N_EXT, NO_SECT, 0x0100, 0),
    ]
    .concat();
    let indirect = words(&[2, INDIRECT_SYMBOL_LOCAL]);

    let mut buf = MachBuilder::new()
        .command(segment64_command(
            "__TEXT",
            TEXT_ADDR,
            TEXT_SIZE,
            0,
            0x2000,
            5,
            &[("__text", 0x1100, 0x100, 0x100, S_ATTR_PURE_INSTRUCTIONS | S_ATTR_SOME_INSTRUCTIONS)],
        ))
        .command(segment64_command(
            "__DATA",
            DATA_ADDR,
            0x1000,
            0x2000,
            0x1000,
            3,
            &[
                ("__got", GOT_ADDR, 0x10, 0x2000, S_NON_LAZY_SYMBOL_POINTERS),
                ("__data", 0x4010, 0x20, 0x2010, 0),
            ],
        ))
        .command(segment64_command("__LINKEDIT", LINKEDIT_ADDR, 0x1000, 0x3000, 0x1000, 1, &[]))
        .command(dylib_command(LC_ID_DYLIB, "/usr/lib/libsample.dylib"))
        .command(dylib_command(LC_LOAD_DYLIB, "/usr/lib/libSystem.B.dylib"))
        .command(dylib_command(LC_REEXPORT_DYLIB, "/usr/lib/libreexported.dylib"))
        .command(uuid_command([0; 16]))
        .command(build_version_command(PLATFORM_MACOS, 0x000a0f00, 0x000b0000, &[(TOOL_LD, 0x02000000)]))
        .command(dyld_info_command([
            (REBASE_OFF, rebase.len() as u32),
            (BIND_OFF, bind.len() as u32),
            (0, 0),
            (LAZY_BIND_OFF, lazy.len() as u32),
            (EXPORT_OFF, trie.len() as u32),
        ]))
        .command(linkedit_command(LC_FUNCTION_STARTS, FUNC_STARTS_OFF, func_starts.len() as u32))
        .command(symtab_command(SYMOFF, 3, STROFF, strings.len() as u32))
        .command(dysymtab_command(INDIRECT_OFF, 2))
        .build();

    place(&mut buf, REBASE_OFF as usize, &rebase);
    place(&mut buf, BIND_OFF as usize, &bind);
    place(&mut buf, LAZY_BIND_OFF as usize, &lazy);
    place(&mut buf, EXPORT_OFF as usize, &trie);
    place(&mut buf, FUNC_STARTS_OFF as usize, &func_starts);
    place(&mut buf, SYMOFF as usize, &symbols);
    place(&mut buf, STROFF as usize, &strings);
    place(&mut buf, INDIRECT_OFF as usize, &indirect);
    place(&mut buf, FILE_SIZE - 1, &[0]);

    buf
}

/// Layout of `sample_cache`.
pub mod cache {
    pub const MAGIC: &[u8; 16] = b"dyld_v1  arm64e\0";
    pub const MAPPING_OFF: u32 = 0x98;
    pub const IMAGES_OFF: u32 = 0x100;
    pub const TEXT_INFO_OFF: u64 = 0x140;
    pub const PATHS_OFF: u32 = 0x180;
    pub const ISLANDS_OFF: u32 = 0x200;
    pub const SLIDE_OFF: u64 = 0x300;
    pub const LOCAL_SYMBOLS_OFF: u64 = 0x8000;

    pub const TEXT_ADDR: u64 = 0x10000;
    pub const DATA_ADDR: u64 = 0x20000;
    pub const LINKEDIT_ADDR: u64 = 0x30000;

    pub const LIB_A: &str = "/usr/lib/libA.dylib";
    pub const LIB_B: &str = "/usr/lib/libB.dylib";
    pub const LIB_A_ADDR: u64 = 0x11000;
    pub const LIB_B_ADDR: u64 = 0x12000;
    pub const ISLAND_ADDR: u64 = 0x13000;

    pub const A_FUNC: u64 = 0x11100;
    pub const B_FUNC: u64 = 0x12100;
    pub const B_DATA: u64 = 0x12200;
    /// `__got` of libA, two slots bound to `_b_func` and `_b_data`.
    pub const A_GOT: u64 = 0x20000;
    pub const A_GOT_OFF: usize = 0x4000;
    pub const DELTA_MASK: u64 = 0x00FF_FF00_0000_0000;
}

fn cache_text_segment(addr: u64, fileoff: u64, sections: &[SectionSpec]) -> Vec<u8> {
    segment64_command("__TEXT", addr, 0x1000, fileoff, 0x1000, 5, sections)
}

/// A little endian arm64e shared cache with two dylibs and one branch island.
///
/// * libA exports `_a_func` and imports `_b_func`, `_b_data` from libB through `__got`;
/// * libB exports `_b_func`, `_b_data` and `_alias` (re-export of libA's `_a_func`),
///   and re-exports libA as a whole;
/// * slide info v2 covers the first data page, the two `__got` slots form one chain;
/// * local symbols `_helper`, `_helper2` belong to libA.
pub fn sample_cache() -> Vec<u8> {
    use self::cache::*;

    let mut buf = vec![0; 0x8000];

    // header
    place(&mut buf, 0, MAGIC);
    place(&mut buf, 16, &words(&[MAPPING_OFF, 3, IMAGES_OFF, 2]));
    place(&mut buf, 56, &[SLIDE_OFF.to_le_bytes(), 0x40u64.to_le_bytes()].concat());
    place(&mut buf, 72, &[LOCAL_SYMBOLS_OFF.to_le_bytes(), 88u64.to_le_bytes()].concat());
    place(&mut buf, 88, &[0x11; 16]);
    place(&mut buf, 112, &words(&[ISLANDS_OFF, 1]));
    place(&mut buf, 136, &[TEXT_INFO_OFF.to_le_bytes(), 2u64.to_le_bytes()].concat());

    // mappings
    let mappings = [
        (TEXT_ADDR, 0x4000u64, 0u64, 5u32),
        (DATA_ADDR, 0x2000, 0x4000, 3),
        (LINKEDIT_ADDR, 0x2000, 0x6000, 1),
    ];

    for (i, &(address, size, fileoff, prot)) in mappings.iter().enumerate() {
        let record = [
            address.to_le_bytes().to_vec(),
            size.to_le_bytes().to_vec(),
            fileoff.to_le_bytes().to_vec(),
            words(&[prot, prot]),
        ]
        .concat();

        place(&mut buf, MAPPING_OFF as usize + i * 32, &record);
    }

    // images, text infos and paths
    let b_path = PATHS_OFF + LIB_A.len() as u32 + 1;

    for (i, &(address, path, uuid)) in [(LIB_A_ADDR, PATHS_OFF, 0xAA), (LIB_B_ADDR, b_path, 0xBB)]
        .iter()
        .enumerate()
    {
        let image = [address.to_le_bytes().to_vec(), vec![0; 16], words(&[path, 0])].concat();
        let text = [vec![uuid; 16], address.to_le_bytes().to_vec(), words(&[0x1000, path])].concat();

        place(&mut buf, IMAGES_OFF as usize + i * 32, &image);
        place(&mut buf, TEXT_INFO_OFF as usize + i * 32, &text);
    }

    place(&mut buf, PATHS_OFF as usize, format!("{}\0{}\0", LIB_A, LIB_B).as_bytes());
    place(&mut buf, ISLANDS_OFF as usize, &ISLAND_ADDR.to_le_bytes());

    // slide info v2, one chain on the first data page
    let slide = [
        words(&[2, 0x1000, 40, 2, 44, 0]),
        DELTA_MASK.to_le_bytes().to_vec(),
        0u64.to_le_bytes().to_vec(),
        vec![0, 0, 0x00, 0x40],
    ]
    .concat();

    place(&mut buf, SLIDE_OFF as usize, &slide);

    // libA
    let a_trie = export_trie(&[("_a_func", regular_export(0x100))]);
    let a_strings = b"\0_a_func\0_b_func\0_b_data\0".to_vec();
    let a_symbols = [
        nlist64(1, N_SECT | N_EXT, 1, 0, A_FUNC),
        nlist64(9, N_UNDF | N_EXT, NO_SECT, 0x0100, 0),
        nlist64(17, N_UNDF | N_EXT, NO_SECT, 0x0100, 0),
    ]
    .concat();
    let lib_a = MachBuilder::new()
        .cputype(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
        .command(cache_text_segment(
            LIB_A_ADDR,
            0x1000,
            &[("__text", A_FUNC, 0x100, 0x1100, S_ATTR_PURE_INSTRUCTIONS)],
        ))
        .command(segment64_command(
            "__DATA",
            DATA_ADDR,
            0x800,
            0x4000,
            0x800,
            3,
            &[("__got", A_GOT, 0x10, A_GOT_OFF as u32, S_NON_LAZY_SYMBOL_POINTERS)],
        ))
        .command(segment64_command("__LINKEDIT", LINKEDIT_ADDR, 0x2000, 0x6000, 0x2000, 1, &[]))
        .command(dylib_command(LC_ID_DYLIB, LIB_A))
        .command(dylib_command(LC_LOAD_DYLIB, LIB_B))
        .command(uuid_command([0xAA; 16]))
        .command(dyld_info_command([(0, 0), (0, 0), (0, 0), (0, 0), (0x6000, a_trie.len() as u32)]))
        .command(symtab_command(0x6100, 3, 0x6200, a_strings.len() as u32))
        .command(dysymtab_command(0x6280, 2))
        .build();

    place(&mut buf, 0x1000, &lib_a);
    place(&mut buf, 0x6000, &a_trie);
    place(&mut buf, 0x6100, &a_symbols);
    place(&mut buf, 0x6200, &a_strings);
    place(&mut buf, 0x6280, &words(&[1, 2]));
    place(&mut buf, A_GOT_OFF, &((2u64 << 40) | B_FUNC).to_le_bytes());
    place(&mut buf, A_GOT_OFF + 8, &B_DATA.to_le_bytes());

    // libB
    let b_trie = export_trie(&[
        ("_b_func", regular_export(0x100)),
        ("_b_data", regular_export(0x200)),
        ("_alias", reexport(1, "_a_func")),
    ]);
    let lib_b = MachBuilder::new()
        .cputype(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
        .command(cache_text_segment(
            LIB_B_ADDR,
            0x2000,
            &[("__text", B_FUNC, 0x200, 0x2100, S_ATTR_PURE_INSTRUCTIONS)],
        ))
        .command(segment64_command("__DATA", DATA_ADDR + 0x800, 0x800, 0x4800, 0x800, 3, &[]))
        .command(segment64_command("__LINKEDIT", LINKEDIT_ADDR, 0x2000, 0x6000, 0x2000, 1, &[]))
        .command(dylib_command(LC_ID_DYLIB, LIB_B))
        .command(dylib_command(LC_REEXPORT_DYLIB, LIB_A))
        .command(uuid_command([0xBB; 16]))
        .command(dyld_info_command([(0, 0), (0, 0), (0, 0), (0, 0), (0x7000, b_trie.len() as u32)]))
        .build();

    place(&mut buf, 0x2000, &lib_b);
    place(&mut buf, 0x7000, &b_trie);

    // branch island
    let island = MachBuilder::new()
        .cputype(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E)
        .command(cache_text_segment(ISLAND_ADDR, 0x3000, &[]))
        .build();

    place(&mut buf, 0x3000, &island);

    // local symbols of libA
    let strings = b"\0_helper\0_helper2\0";
    let local = [
        words(&[24, 2, 56, strings.len() as u32, 76, 1]),
        nlist64(1, N_SECT, 1, 0, 0x11180),
        nlist64(9, N_SECT, 1, 0, 0x111c0),
        strings.to_vec(),
        vec![0, 0],
        words(&[0x1000, 0, 2]),
    ]
    .concat();

    place(&mut buf, LOCAL_SYMBOLS_OFF as usize, &local);

    buf
}

/// Layout of `sample_kernelcache`.
pub mod kernel {
    pub const BASE: u64 = 0xFFFF_FFF0_0700_4000;
    pub const THREAD_STARTS: u64 = BASE + 0x1000;
    pub const CHAIN: u64 = BASE + 0x4000;
    pub const PRELINK_TEXT: u64 = BASE + 0x8000;
    pub const PRELINK_INFO: u64 = BASE + 0xA000;
    pub const KMOD_INFO_SECT: u64 = BASE + 0xB000;
    pub const KMOD_START_SECT: u64 = BASE + 0xB100;
    pub const FILE_SIZE: usize = 0xC000;

    pub const KEXT_A: u64 = PRELINK_TEXT;
    pub const KEXT_B: u64 = PRELINK_TEXT + 0x1000;
    pub const KEXT_SIZE: u64 = 0x1000;
    /// `kmod_info` of a kext, relative to its header.
    pub const KMOD_OFF: u64 = 0xC00;
    pub const KEXT_A_NAME: &str = "com.example.driver.a";
    pub const KEXT_B_NAME: &str = "com.example.driver.b";
}

/// A plain chained pointer to `addr` with the given skip.
pub fn tagged(addr: u64, skip: u64) -> u64 {
    (addr & ((1 << 51) - 1)) | (skip << 51)
}

/// A `kmod_info_64_v1` record.
pub fn kmod_info64(version: i32, name: &str, address: u64, size: u64) -> Vec<u8> {
    let mut buf = vec![0; 196];

    place(&mut buf, 8, &version.to_le_bytes());
    place(&mut buf, 16, name.as_bytes());
    place(&mut buf, 156, &address.to_le_bytes());
    place(&mut buf, 164, &size.to_le_bytes());
    place(&mut buf, 172, &0x1000u64.to_le_bytes());
    place(&mut buf, 180, &(address + 0x100).to_le_bytes());
    buf
}

/// A one page kext bundle exporting `_kmod_info`.
pub fn sample_kext(addr: u64, name: &str, uuid: u8, deps: &[&str]) -> Vec<u8> {
    use self::kernel::*;

    let trie = export_trie(&[("_kmod_info", regular_export(KMOD_OFF))]);
    let mut builder = MachBuilder::new()
        .cputype(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)
        .filetype(MH_KEXT_BUNDLE)
        .command(segment64_command("__TEXT", addr, KEXT_SIZE, 0, KEXT_SIZE, 5, &[]))
        .command(dylib_command(LC_ID_DYLIB, name));

    for dep in deps {
        builder = builder.command(dylib_command(LC_LOAD_DYLIB, dep));
    }

    let mut buf = builder
        .command(uuid_command([uuid; 16]))
        .command(dyld_info_command([(0, 0), (0, 0), (0, 0), (0, 0), (0x800, trie.len() as u32)]))
        .build();

    place(&mut buf, 0x800, &trie);
    place(&mut buf, KMOD_OFF as usize, &kmod_info64(1, name, addr, KEXT_SIZE));
    place(&mut buf, KEXT_SIZE as usize - 1, &[0]);

    buf
}

/// The prelink info plist of `sample_kernelcache`.
pub fn prelink_xml() -> String {
    use self::kernel::*;

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>_PrelinkInfoDictionary</key>
  <array>
    <dict>
      <key>CFBundleIdentifier</key><string>{}</string>
      <key>_PrelinkKmodInfo</key><integer size="64">0x{:x}</integer>
    </dict>
    <dict>
      <key>CFBundleIdentifier</key><string>{}</string>
      <key>_PrelinkKmodInfo</key><integer size="64">{}</integer>
    </dict>
    <dict>
      <key>CFBundleIdentifier</key><string>com.example.legacy</string>
      <key>OSBundlePrelink</key><data>AAAQAAAAAAAAAAAAAAAAAA==</data>
    </dict>
  </array>
</dict>
</plist>
"#,
        KEXT_A_NAME,
        KEXT_A + KMOD_OFF,
        KEXT_B_NAME,
        KEXT_B + KMOD_OFF,
    )
}

/// A 64-bit arm64 kernelcache with two prelinked kexts.
///
/// * `__TEXT,__thread_starts` holds one chain of three pointers (plain,
///   authenticated, bind) at `CHAIN`;
/// * kext A links against kext B;
/// * `kmod_start` adds `__PRELINK_INFO,__kmod_start` / `__kmod_info`,
///   `xml` adds the `__PRELINK_INFO,__info` plist.
pub fn sample_kernelcache(kmod_start: bool, xml: bool) -> Vec<u8> {
    use self::kernel::*;

    let mut prelink_info: Vec<SectionSpec> = Vec::new();

    if xml {
        prelink_info.push(("__info", PRELINK_INFO, 0x1000, 0xA000, 0));
    }
    if kmod_start {
        prelink_info.push(("__kmod_info", KMOD_INFO_SECT, 0x10, 0xB000, 0));
        prelink_info.push(("__kmod_start", KMOD_START_SECT, 0x10, 0xB100, 0));
    }

    let mut buf = MachBuilder::new()
        .cputype(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)
        .filetype(MH_EXECUTE)
        .command(segment64_command(
            "__TEXT",
            BASE,
            0x4000,
            0,
            0x4000,
            5,
            &[("__thread_starts", THREAD_STARTS, 12, 0x1000, 0)],
        ))
        .command(segment64_command("__DATA", CHAIN, 0x4000, 0x4000, 0x4000, 3, &[]))
        .command(segment64_command(
            "__PRELINK_TEXT",
            PRELINK_TEXT,
            0x2000,
            0x8000,
            0x2000,
            5,
            &[("__text", PRELINK_TEXT, 0x2000, 0x8000, 0)],
        ))
        .command(segment64_command(
            "__PRELINK_INFO",
            PRELINK_INFO,
            0x2000,
            0xA000,
            0x2000,
            3,
            &prelink_info,
        ))
        .command(uuid_command([0x77; 16]))
        .build();

    place(&mut buf, 0x1000, &words(&[1, 0x4000, 0xFFFF_FFFF]));
    place(&mut buf, 0x4000, &tagged(KEXT_A, 1).to_le_bytes());
    place(&mut buf, 0x4008, &((1u64 << 63) | (2 << 51) | 0x9000).to_le_bytes());
    place(&mut buf, 0x4018, &((1u64 << 62) | 5).to_le_bytes());

    place(&mut buf, 0x8000, &sample_kext(KEXT_A, KEXT_A_NAME, 0xAA, &[KEXT_B_NAME]));
    place(&mut buf, 0x9000, &sample_kext(KEXT_B, KEXT_B_NAME, 0xBB, &[]));

    if xml {
        place(&mut buf, 0xA000, prelink_xml().as_bytes());
    }
    if kmod_start {
        let infos = [tagged(KEXT_A + KMOD_OFF, 0), tagged(KEXT_B + KMOD_OFF, 0)];
        let starts = [tagged(KEXT_A, 0), tagged(KEXT_B, 0)];

        for (i, (info, start)) in infos.iter().zip(starts.iter()).enumerate() {
            place(&mut buf, 0xB000 + i * 8, &info.to_le_bytes());
            place(&mut buf, 0xB100 + i * 8, &start.to_le_bytes());
        }
    }

    place(&mut buf, FILE_SIZE - 1, &[0]);

    buf
}
