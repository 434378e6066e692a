//! `otool`, `nm` and `dyldinfo` flavored dumps of the parsed structures.
use std::fmt;

use time::{macros::format_description, OffsetDateTime};

use crate::cache::{ImageInfo, MappingInfo};
use crate::commands::{DyLib, LinkEditData, LoadCommand, Section, Segment};
use crate::consts::*;
use crate::export::{ExportSymbol, ExportType};
use crate::kcache::KextInfo;
use crate::loader::{FatArch, MachCommand, MachHeader};
use crate::opcode::{BindRecord, RebaseRecord};
use crate::symbol::{Symbol, SymbolKind};

fn format_timestamp(secs: i64) -> String {
    OffsetDateTime::from_unix_timestamp(secs)
        .ok()
        .and_then(|ts| {
            ts.format(format_description!(
                "[weekday repr:short] [month repr:short] [day padding:space] [hour]:[minute]:[second] [year] UTC"
            ))
            .ok()
        })
        .unwrap_or_else(|| "<invalid>".to_owned())
}

pub fn platform_name(platform: u32) -> &'static str {
    match platform {
        PLATFORM_MACOS => "macos",
        PLATFORM_IOS => "ios",
        PLATFORM_TVOS => "tvos",
        PLATFORM_WATCHOS => "watchos",
        PLATFORM_BRIDGEOS => "bridgeos",
        PLATFORM_MACCATALYST => "maccatalyst",
        PLATFORM_IOSSIMULATOR => "iossimulator",
        PLATFORM_TVOSSIMULATOR => "tvossimulator",
        PLATFORM_WATCHOSSIMULATOR => "watchossimulator",
        PLATFORM_DRIVERKIT => "driverkit",
        _ => "unknown",
    }
}

impl fmt::Display for MachHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Mach header")?;
        writeln!(
            f,
            "      magic  cputype cpusubtype  caps    filetype ncmds sizeofcmds      flags"
        )?;
        writeln!(
            f,
            " 0x{:08x} {:8} {:10}  0x{:02x}  {:10} {:5} {:10} 0x{:08x}",
            self.magic,
            self.cputype,
            get_cpu_subtype_type(self.cpusubtype),
            get_cpu_subtype_feature(self.cpusubtype),
            self.filetype,
            self.ncmds,
            self.sizeofcmds,
            self.flags
        )
    }
}

impl fmt::Display for FatArch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "    cputype {}", self.cputype)?;
        writeln!(f, "    cpusubtype {}", get_cpu_subtype_type(self.cpusubtype))?;
        writeln!(f, "    capabilities 0x{:x}", get_cpu_subtype_feature(self.cpusubtype))?;
        writeln!(f, "    offset {}", self.offset)?;
        writeln!(f, "    size {}", self.size)?;
        writeln!(f, "    align 2^{} ({})", self.align, 1u64 << self.align.min(63))
    }
}

impl MachCommand {
    fn print_segment_command(&self, f: &mut fmt::Formatter, seg: &Segment) -> fmt::Result {
        let is_64bit = self.0.cmd() == LC_SEGMENT_64;

        writeln!(f, "      cmd {}", self.0.name())?;
        writeln!(f, "  cmdsize {}", self.1)?;
        writeln!(f, "  segname {}", seg.segname)?;
        if is_64bit {
            writeln!(f, "   vmaddr 0x{:016x}", seg.vmaddr)?;
            writeln!(f, "   vmsize 0x{:016x}", seg.vmsize)?;
        } else {
            writeln!(f, "   vmaddr 0x{:08x}", seg.vmaddr)?;
            writeln!(f, "   vmsize 0x{:08x}", seg.vmsize)?;
        }
        writeln!(f, "  fileoff {}", seg.fileoff)?;
        writeln!(f, " filesize {}", seg.filesize)?;
        writeln!(f, "  maxprot 0x{:08x}", seg.maxprot)?;
        writeln!(f, " initprot 0x{:08x}", seg.initprot)?;
        writeln!(f, "   nsects {}", seg.sections.len())?;
        writeln!(f, "    flags 0x{:x}", seg.flags.bits())?;

        for section in &seg.sections {
            print_section(f, section, &seg.segname, is_64bit)?;
        }

        Ok(())
    }

    fn print_dylib_command(&self, f: &mut fmt::Formatter, dylib: &DyLib) -> fmt::Result {
        writeln!(f, "          cmd {}", self.0.name())?;
        writeln!(f, "      cmdsize {}", self.1)?;
        writeln!(f, "         name {} (offset {})", dylib.name, dylib.name.offset())?;
        writeln!(
            f,
            "   time stamp {} {}",
            dylib.timestamp,
            format_timestamp(i64::from(dylib.timestamp))
        )?;
        writeln!(f, "      current version {}", dylib.current_version)?;
        writeln!(f, "compatibility version {}", dylib.compatibility_version)
    }

    fn print_linkedit_data_command(&self, f: &mut fmt::Formatter, data: &LinkEditData) -> fmt::Result {
        writeln!(f, "      cmd {}", self.0.name())?;
        writeln!(f, "  cmdsize {}", self.1)?;
        writeln!(f, "  dataoff {}", data.off)?;
        writeln!(f, " datasize {}", data.size)
    }
}

fn print_section(f: &mut fmt::Formatter, section: &Section, segname: &str, is_64bit: bool) -> fmt::Result {
    writeln!(f, "Section")?;
    writeln!(f, "  sectname {}", section.sectname)?;
    writeln!(
        f,
        "   segname {}{}",
        section.segname,
        if segname != section.segname {
            " (does not match segment)"
        } else {
            ""
        }
    )?;
    if is_64bit {
        writeln!(f, "      addr 0x{:016x}", section.addr)?;
        writeln!(f, "      size 0x{:016x}", section.size)?;
    } else {
        writeln!(f, "      addr 0x{:08x}", section.addr)?;
        writeln!(f, "      size 0x{:08x}", section.size)?;
    }
    writeln!(f, "    offset {}", section.offset)?;
    writeln!(f, "     align 2^{} ({})", section.align, 1u64 << section.align.min(63))?;
    writeln!(f, "    reloff {}", section.reloff)?;
    writeln!(f, "    nreloc {}", section.nreloc)?;
    writeln!(f, "     flags 0x{:08x}", u32::from(section.flags))?;
    writeln!(
        f,
        " reserved1 {}{}",
        section.reserved1,
        match section.flags.sect_type() {
            S_SYMBOL_STUBS | S_LAZY_SYMBOL_POINTERS | S_LAZY_DYLIB_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => {
                " (index into indirect symbol table)"
            }
            _ => "",
        }
    )?;
    writeln!(
        f,
        " reserved2 {}{}",
        section.reserved2,
        if section.flags.sect_type() == S_SYMBOL_STUBS {
            " (size of stubs)"
        } else {
            ""
        }
    )
}

impl fmt::Display for MachCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let MachCommand(ref cmd, cmdsize) = *self;

        match cmd {
            LoadCommand::Segment(seg) | LoadCommand::Segment64(seg) => self.print_segment_command(f, seg),
            LoadCommand::IdDyLib(dylib)
            | LoadCommand::LoadDyLib(dylib)
            | LoadCommand::LoadWeakDyLib(dylib)
            | LoadCommand::ReexportDyLib(dylib)
            | LoadCommand::LoadUpwardDylib(dylib)
            | LoadCommand::LazyLoadDylib(dylib) => self.print_dylib_command(f, dylib),
            LoadCommand::CodeSignature(data)
            | LoadCommand::SegmentSplitInfo(data)
            | LoadCommand::FunctionStarts(data)
            | LoadCommand::DataInCode(data)
            | LoadCommand::DylibCodeSignDrs(data)
            | LoadCommand::LinkerOptimizationHint(data)
            | LoadCommand::DyldExportsTrie(data)
            | LoadCommand::DyldChainedFixups(data) => self.print_linkedit_data_command(f, data),
            LoadCommand::IdDyLinker(name)
            | LoadCommand::LoadDyLinker(name)
            | LoadCommand::DyLdEnv(name)
            | LoadCommand::SubFramework(name)
            | LoadCommand::SubUmbrella(name)
            | LoadCommand::SubClient(name)
            | LoadCommand::SubLibrary(name) => {
                writeln!(f, "          cmd {}", cmd.name())?;
                writeln!(f, "      cmdsize {}", cmdsize)?;
                writeln!(f, "         name {} (offset {})", name, name.offset())
            }
            LoadCommand::Rpath(path) => {
                writeln!(f, "          cmd {}", cmd.name())?;
                writeln!(f, "      cmdsize {}", cmdsize)?;
                writeln!(f, "         path {}", path)
            }
            LoadCommand::SymTab {
                symoff,
                nsyms,
                stroff,
                strsize,
            } => {
                writeln!(f, "     cmd {}", cmd.name())?;
                writeln!(f, " cmdsize {}", cmdsize)?;
                writeln!(f, "  symoff {}", symoff)?;
                writeln!(f, "   nsyms {}", nsyms)?;
                writeln!(f, "  stroff {}", stroff)?;
                writeln!(f, " strsize {}", strsize)
            }
            LoadCommand::DySymTab {
                ilocalsym,
                nlocalsym,
                iextdefsym,
                nextdefsym,
                iundefsym,
                nundefsym,
                indirectsymoff,
                nindirectsyms,
                ..
            } => {
                writeln!(f, "            cmd {}", cmd.name())?;
                writeln!(f, "        cmdsize {}", cmdsize)?;
                writeln!(f, "      ilocalsym {}", ilocalsym)?;
                writeln!(f, "      nlocalsym {}", nlocalsym)?;
                writeln!(f, "     iextdefsym {}", iextdefsym)?;
                writeln!(f, "     nextdefsym {}", nextdefsym)?;
                writeln!(f, "      iundefsym {}", iundefsym)?;
                writeln!(f, "      nundefsym {}", nundefsym)?;
                writeln!(f, " indirectsymoff {}", indirectsymoff)?;
                writeln!(f, "  nindirectsyms {}", nindirectsyms)
            }
            LoadCommand::Uuid(uuid) => {
                writeln!(f, "     cmd {}", cmd.name())?;
                writeln!(f, " cmdsize {}", cmdsize)?;
                writeln!(f, "    uuid {}", uuid.hyphenated().to_string().to_uppercase())
            }
            LoadCommand::VersionMin { version, sdk, .. } => {
                writeln!(f, "      cmd {}", cmd.name())?;
                writeln!(f, "  cmdsize {}", cmdsize)?;
                writeln!(f, "  version {}", version)?;
                writeln!(f, "      sdk {}", sdk)
            }
            LoadCommand::BuildVersion {
                platform,
                minos,
                sdk,
                tools,
            } => {
                writeln!(f, "      cmd {}", cmd.name())?;
                writeln!(f, "  cmdsize {}", cmdsize)?;
                writeln!(f, " platform {}", platform_name(*platform))?;
                writeln!(f, "    minos {}", minos)?;
                writeln!(f, "      sdk {}", sdk)?;
                writeln!(f, "   ntools {}", tools.len())?;

                for tool in tools {
                    writeln!(f, "     tool {}", tool.tool)?;
                    writeln!(f, "  version {}", tool.version)?;
                }

                Ok(())
            }
            LoadCommand::DyldInfo {
                rebase_off,
                rebase_size,
                bind_off,
                bind_size,
                weak_bind_off,
                weak_bind_size,
                lazy_bind_off,
                lazy_bind_size,
                export_off,
                export_size,
                ..
            } => {
                writeln!(f, "            cmd {}", cmd.name())?;
                writeln!(f, "        cmdsize {}", cmdsize)?;
                writeln!(f, "     rebase_off 0x{:08x}", rebase_off)?;
                writeln!(f, "    rebase_size {}", rebase_size)?;
                writeln!(f, "       bind_off 0x{:08x}", bind_off)?;
                writeln!(f, "      bind_size {}", bind_size)?;
                writeln!(f, "  weak_bind_off 0x{:08x}", weak_bind_off)?;
                writeln!(f, " weak_bind_size {}", weak_bind_size)?;
                writeln!(f, "  lazy_bind_off 0x{:08x}", lazy_bind_off)?;
                writeln!(f, " lazy_bind_size {}", lazy_bind_size)?;
                writeln!(f, "     export_off 0x{:08x}", export_off)?;
                writeln!(f, "    export_size {}", export_size)
            }
            LoadCommand::EntryPoint { entryoff, stacksize } => {
                writeln!(f, "       cmd {}", cmd.name())?;
                writeln!(f, "   cmdsize {}", cmdsize)?;
                writeln!(f, "  entryoff {}", entryoff)?;
                writeln!(f, " stacksize {}", stacksize)
            }
            LoadCommand::SourceVersion(version) => {
                writeln!(f, "      cmd {}", cmd.name())?;
                writeln!(f, "  cmdsize {}", cmdsize)?;
                writeln!(f, "  version {}", version)
            }
            LoadCommand::Thread { flavor, count, pc, .. } => {
                writeln!(f, "     cmd {}", cmd.name())?;
                writeln!(f, " cmdsize {}", cmdsize)?;
                writeln!(f, "  flavor {}", flavor)?;
                writeln!(f, "   count {}", count)?;
                match pc {
                    Some(pc) => writeln!(f, "      pc 0x{:016x}", pc),
                    None => Ok(()),
                }
            }
            LoadCommand::EncryptionInfo {
                cryptoff,
                cryptsize,
                cryptid,
                ..
            } => {
                writeln!(f, "          cmd {}", cmd.name())?;
                writeln!(f, "      cmdsize {}", cmdsize)?;
                writeln!(f, "     cryptoff {}", cryptoff)?;
                writeln!(f, "    cryptsize {}", cryptsize)?;
                writeln!(f, "      cryptid {}", cryptid)
            }
            LoadCommand::LinkerOption(options) => {
                writeln!(f, "     cmd {}", cmd.name())?;
                writeln!(f, " cmdsize {}", cmdsize)?;
                writeln!(f, "   count {}", options.len())?;

                for (i, option) in options.iter().enumerate() {
                    writeln!(f, "  string #{} {}", i + 1, option)?;
                }

                Ok(())
            }
            LoadCommand::Command { cmd: raw, payload } => {
                writeln!(f, "     cmd {} (0x{:x})", cmd.name(), raw)?;
                writeln!(f, " cmdsize {}", cmdsize)?;
                writeln!(f, " payload {} bytes", payload.len())
            }
        }
    }
}

impl Symbol {
    /// The `nm` type letter, uppercase for external symbols.
    ///
    /// `sections` are the sections of the image in file order, used to tell
    /// text, data and bss symbols apart.
    pub fn type_char(&self, sections: &[Section]) -> char {
        let c = match self.kind {
            SymbolKind::Undefined if self.value != 0 => 'c',
            SymbolKind::Undefined => 'u',
            SymbolKind::Absolute => 'a',
            SymbolKind::Prebound => 'p',
            SymbolKind::Indirect => 'i',
            SymbolKind::Debug(_) => '-',
            SymbolKind::Unknown(_) => '?',
            SymbolKind::Section => match sections.get(usize::from(self.section).wrapping_sub(1)) {
                Some(s) if s.segname == SEG_TEXT && s.sectname == SECT_TEXT => 't',
                Some(s) if s.segname == SEG_DATA && s.sectname == SECT_DATA => 'd',
                Some(s) if s.segname == SEG_DATA && s.sectname == SECT_BSS => 'b',
                _ => 's',
            },
        };

        if self.external {
            c.to_ascii_uppercase()
        } else {
            c
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let c = self.type_char(&[]);

        match self.kind {
            SymbolKind::Undefined | SymbolKind::Prebound | SymbolKind::Indirect => {
                write!(f, "{:16} {} {}", "", c, self.name)
            }
            _ => write!(f, "{:016x} {} {}", self.value, c, self.name),
        }
    }
}

impl fmt::Display for RebaseRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x} {}", self.address, self.rebase_type)
    }
}

impl fmt::Display for BindRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "0x{:016x} {:<8} {:>4} {}",
            self.address,
            self.bind_type.to_string(),
            self.ordinal,
            self.name
        )?;

        if self.addend != 0 {
            write!(f, " + 0x{:x}", self.addend)?;
        }

        if self.kind != crate::opcode::BindKind::Normal {
            write!(f, " ({})", self.kind)?;
        }

        Ok(())
    }
}

impl fmt::Display for ExportSymbol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.export {
            ExportType::Regular { address } => write!(f, "0x{:016x} {}", address, self.name),
            ExportType::Weak { address } => write!(f, "0x{:016x} {} [weak_def]", address, self.name),
            ExportType::Stub { stub, resolver } => write!(
                f,
                "0x{:016x} {} [resolver=0x{:x}]",
                stub, self.name, resolver
            ),
            ExportType::Reexport { ordinal, ref name } => {
                write!(f, "{:18} {} [re-export", "", self.name)?;

                if name.is_empty() {
                    write!(f, " from #{}]", ordinal)
                } else {
                    write!(f, " {} from #{}]", name, ordinal)
                }
            }
        }
    }
}

impl fmt::Display for MappingInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prot = |p: vm_prot_t| {
            [(VM_PROT_READ, 'r'), (VM_PROT_WRITE, 'w'), (VM_PROT_EXECUTE, 'x')]
                .iter()
                .map(|&(bit, c)| if p & bit != 0 { c } else { '-' })
                .collect::<String>()
        };

        write!(
            f,
            "0x{:016x} - 0x{:016x} @ 0x{:08x} {}/{}",
            self.address,
            self.end(),
            self.file_offset,
            prot(self.init_prot),
            prot(self.max_prot)
        )
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "0x{:016x} {} ({})",
            self.address,
            self.path,
            format_timestamp(self.mod_time as i64)
        )
    }
}

impl fmt::Display for KextInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "0x{:016x} 0x{:08x} {}",
            self.start, self.size, self.name
        )?;

        if let Some(uuid) = self.uuid {
            write!(f, " <{}>", uuid.hyphenated().to_string().to_uppercase())?;
        }

        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use std::io::Write;

    use crate::image::{LoadHint, MachImage};
    use crate::opcode::{BindKind, SymbolType};
    use crate::symbol::StringTableCache;
    use crate::testdata::*;

    use super::*;

    macro_rules! assert_nodiff {
        ($left:expr, $right:expr) => {{
            let mut w = Vec::new();
            let mut diffs = 0;
            let left = $left.replace("\r\n", "\n");
            let right = $right.replace("\r\n", "\n");

            for diff in diff::lines(&left, &right) {
                match diff {
                    diff::Result::Left(l) => {
                        diffs += 1;
                        writeln!(w, "-{}", l).unwrap()
                    }
                    diff::Result::Both(_, _) => {}
                    diff::Result::Right(r) => {
                        diffs += 1;
                        writeln!(w, "+{}", r).unwrap()
                    }
                }
            }

            if diffs > 0 {
                info!("found {} diffs:\n{}", diffs, String::from_utf8(w).unwrap());
            }

            assert_eq!(&left, &right);
        }};
    }

    fn dump_command(image: &MachImage<&[u8]>, cmd: u32) -> String {
        image
            .mach_commands()
            .iter()
            .find(|c| c.command().cmd() == cmd)
            .map(|c| c.to_string())
            .unwrap()
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(2), "Thu Jan  1 00:00:02 1970 UTC");
        assert_eq!(format_timestamp(1_000_000_000), "Sun Sep  9 01:46:40 2001 UTC");
    }

    #[test]
    fn test_dylib_command() {
        let _ = pretty_env_logger::try_init();

        let data = sample_dylib();
        let image = MachImage::parse(&data[..], 0, LoadHint::File).unwrap();

        assert_nodiff!(
            dump_command(&image, LC_LOAD_DYLIB),
            "          cmd LC_LOAD_DYLIB
      cmdsize 52
         name /usr/lib/libSystem.B.dylib (offset 24)
   time stamp 2 Thu Jan  1 00:00:02 1970 UTC
      current version 1.0
compatibility version 1.0
"
        );
    }

    #[test]
    fn test_commands() {
        let data = sample_dylib();
        let image = MachImage::parse(&data[..], 0, LoadHint::File).unwrap();

        let segment = dump_command(&image, LC_SEGMENT_64);

        assert!(segment.starts_with("      cmd LC_SEGMENT_64\n"));
        assert!(segment.contains("  segname __TEXT\n"));
        assert!(segment.contains("   vmaddr 0x0000000000001000\n"));
        assert!(segment.contains("  sectname __text\n"));

        let build = dump_command(&image, LC_BUILD_VERSION);

        assert!(build.contains(" platform macos\n"));
        assert!(build.contains("    minos 10.15\n"));
        assert!(build.contains("   ntools 1\n"));

        assert!(dump_command(&image, LC_UUID).contains("    uuid 00000000-0000-0000-0000-000000000000\n"));

        let header = image.header().to_string();

        assert!(header.starts_with("Mach header\n"));
        assert!(header.contains(" 0xfeedfacf "));
    }

    #[test]
    fn test_symbols() {
        let data = sample_dylib();
        let image = MachImage::parse(&data[..], 0, LoadHint::File).unwrap();
        let cache = StringTableCache::new();
        let symtab = image.symbol_table(&cache, None).unwrap().unwrap();
        let sections: Vec<Section> = image
            .segments()
            .iter()
            .flat_map(|seg| seg.sections.iter().cloned())
            .collect();
        let types: Vec<char> = symtab.symbols().iter().map(|sym| sym.type_char(&sections)).collect();

        assert_eq!(types, vec!['T', 't', 'U']);

        let lines: Vec<String> = symtab.symbols().iter().map(|sym| sym.to_string()).collect();

        assert_eq!(lines[0], "0000000000001010 S _foo");
        assert_eq!(lines[2], "                 U _bar");
    }

    #[test]
    fn test_records() {
        let rebase = RebaseRecord {
            address: 0x4008,
            rebase_type: SymbolType::Pointer,
        };

        assert_eq!(rebase.to_string(), "0x0000000000004008 pointer");

        let bind = BindRecord {
            address: 0x4000,
            bind_type: SymbolType::Pointer,
            name: "_bar".to_owned(),
            ordinal: 1,
            addend: 8,
            flags: 0,
            kind: BindKind::Lazy,
        };

        assert_eq!(bind.to_string(), "0x0000000000004000 pointer     1 _bar + 0x8 (lazy bind)");

        let reexport = ExportSymbol {
            name: "_open".to_owned(),
            kind: crate::export::ExportKind::Regular,
            flags: EXPORT_SYMBOL_FLAGS_REEXPORT,
            export: ExportType::Reexport {
                ordinal: 2,
                name: "_open$UNIX2003".to_owned(),
            },
        };

        assert_eq!(
            reexport.to_string(),
            "                   _open [re-export _open$UNIX2003 from #2]"
        );
    }

    #[test]
    fn test_mapping() {
        let mapping = MappingInfo {
            address: 0x1_8000_0000,
            size: 0x1000,
            file_offset: 0,
            max_prot: VM_PROT_READ | VM_PROT_EXECUTE,
            init_prot: VM_PROT_READ,
        };

        assert_eq!(
            mapping.to_string(),
            "0x0000000180000000 - 0x0000000180001000 @ 0x00000000 r--/r-x"
        );
    }
}
