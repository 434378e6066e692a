//! A parsed Mach-O image and the queries built on its load commands.

use std::cell::RefCell;
use std::io::Cursor;
use std::ops::{ControlFlow, Range};
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use uuid::Uuid;

use crate::codec::CursorExt;
use crate::commands::{BuildTool, LoadCommand, Section, Segment, VersionTag};
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::export::{ExportSymbol, ExportTrie, ExportType};
use crate::loader::{MachCommand, MachFile, MachHeader};
use crate::opcode::{self, BindKind, BindRecord, RebaseRecord};
use crate::source::ByteSource;
use crate::symbol::{StringTableCache, SymbolTable, SymbolTableLoader};

/// How offsets found in the load commands map onto the byte source.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadHint {
    /// A file, offsets are relative to the header.
    File,
    /// Process memory addressed by virtual address.
    Memory,
    /// A dylib inside a dyld shared cache, read through a cache image view.
    SharedCacheLib,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlatformVersion {
    pub platform: u32,
    pub version: VersionTag,
}

/// A pointer slot bound to a symbol of another image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub address: u64,
    pub name: String,
    pub ordinal: u8,
    /// Install name of the library the symbol comes from.
    pub dylib: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportInfo {
    pub imports: Vec<Import>,
    /// Address ranges of the symbol pointer sections.
    pub ranges: Vec<Range<u64>>,
}

impl ImportInfo {
    pub fn contains(&self, addr: u64) -> bool {
        self.ranges.iter().any(|range| range.contains(&addr))
    }
}

/// The answer of an exported symbol lookup in one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportLookup {
    Address(u64),
    /// The symbol is re-exported from another dylib, maybe under another name.
    Reexport { dylib: String, name: String },
}

pub struct MachImage<S> {
    source: S,
    start: u64,
    hint: LoadHint,
    header: MachHeader,
    commands: Vec<MachCommand>,
    command_error: Option<Error>,
    segments: RefCell<Option<Rc<[Segment]>>>,
}

impl<S: ByteSource> MachImage<S> {
    /// Parse the image whose header lies at `start` in `source`.
    pub fn parse(source: S, start: u64, hint: LoadHint) -> Result<Self> {
        let MachFile {
            header,
            commands,
            error,
        } = MachFile::parse(&source, start)?;

        Ok(MachImage {
            source,
            start,
            hint,
            header,
            commands,
            command_error: error,
            segments: RefCell::new(None),
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn hint(&self) -> LoadHint {
        self.hint
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn is_64bit(&self) -> bool {
        self.header.is_64bit()
    }

    pub fn ptr_size(&self) -> usize {
        self.header.ptr_size()
    }

    pub fn mach_commands(&self) -> &[MachCommand] {
        &self.commands
    }

    pub fn commands(&self) -> impl Iterator<Item = &LoadCommand> {
        self.commands.iter().map(|MachCommand(cmd, _)| cmd)
    }

    /// Why the load command walk stopped early, if it did.
    pub fn command_error(&self) -> Option<&Error> {
        self.command_error.as_ref()
    }

    /// The normalized segment table, computed once.
    pub fn segments(&self) -> Rc<[Segment]> {
        if let Some(segments) = self.segments.borrow().as_ref() {
            return segments.clone();
        }

        let segments: Rc<[Segment]> = self.load_segments().into();

        *self.segments.borrow_mut() = Some(segments.clone());

        segments
    }

    fn load_segments(&self) -> Vec<Segment> {
        let is_64bit = self.is_64bit();
        let mut segments: Vec<Segment> = Vec::new();

        for cmd in self.commands() {
            let segment = match cmd {
                LoadCommand::Segment(segment) if !is_64bit => segment,
                LoadCommand::Segment64(segment) if is_64bit => segment,
                LoadCommand::Segment(segment) | LoadCommand::Segment64(segment) => {
                    warn!(
                        "skip segment, {}",
                        Error::InconsistentStructure(format!(
                            "{} {} in a {}-bit image",
                            cmd.name(),
                            segment.segname,
                            if is_64bit { 64 } else { 32 }
                        ))
                    );

                    continue;
                }
                _ => continue,
            };

            let mut segment = segment.clone();
            let sections = std::mem::take(&mut segment.sections);

            for section in sections {
                let overlapped = section.size != 0
                    && segments
                        .iter()
                        .flat_map(|seg| seg.sections.iter())
                        .chain(segment.sections.iter())
                        .any(|prev| prev.size != 0 && prev.addr < section.end() && section.addr < prev.end());

                if overlapped {
                    warn!(
                        "drop section {},{} at 0x{:x} overlapping an earlier section",
                        section.segname, section.sectname, section.addr
                    );
                } else {
                    segment.sections.push(section);
                }
            }

            segments.push(segment);
        }

        if self.hint == LoadHint::SharedCacheLib {
            if let Some(text) = segments.first_mut().filter(|seg| seg.segname == SEG_TEXT && seg.fileoff != 0) {
                let fileoff = text.fileoff;

                debug!("renormalize __TEXT file offset 0x{:x} of a cache image", fileoff);

                for section in text.sections.iter_mut().filter(|sect| sect.segname == SEG_TEXT) {
                    section.offset = (u64::from(section.offset).saturating_sub(fileoff)) as u32;
                }

                text.fileoff = 0;
            }
        }

        segments
    }

    pub fn visit_segments<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&Segment) -> ControlFlow<()>,
    {
        for segment in self.segments().iter() {
            visitor(segment)?;
        }

        ControlFlow::Continue(())
    }

    pub fn visit_sections<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(&Segment, &Section) -> ControlFlow<()>,
    {
        for segment in self.segments().iter() {
            for section in &segment.sections {
                visitor(segment, section)?;
            }
        }

        ControlFlow::Continue(())
    }

    pub fn find_segment(&self, segname: &str) -> Option<Segment> {
        self.segments().iter().find(|seg| seg.segname == segname).cloned()
    }

    pub fn find_section(&self, segname: &str, sectname: &str) -> Option<Section> {
        self.segments()
            .iter()
            .flat_map(|seg| seg.sections.iter())
            .find(|sect| sect.segname == segname && sect.sectname == sectname)
            .cloned()
    }

    /// Bounding box `(start, end)` of the text segments, zero pages excluded.
    pub fn text_size(&self) -> Option<(u64, u64)> {
        self.segments()
            .iter()
            .filter(|seg| seg.is_text() && !seg.is_zeropage())
            .fold(None, |bbox, seg| match bbox {
                None => Some((seg.vmaddr, seg.end())),
                Some((start, end)) => Some((start.min(seg.vmaddr), end.max(seg.end()))),
            })
    }

    /// The address the header is mapped at when the image is not slid.
    pub fn base_addr(&self) -> Option<u64> {
        self.segments()
            .iter()
            .find(|seg| seg.fileoff == 0 && seg.filesize != 0)
            .map(|seg| seg.vmaddr)
    }

    /// Distance between where a memory image is and where it was linked.
    pub fn slide(&self) -> i64 {
        match (self.hint, self.base_addr()) {
            (LoadHint::Memory, Some(base)) => self.start.wrapping_sub(base) as i64,
            _ => 0,
        }
    }

    pub fn is_loaded_addr(&self, addr: u64) -> bool {
        self.segments()
            .iter()
            .any(|seg| !seg.is_zeropage() && seg.contains(addr))
    }

    /// The file offset holding the byte at `addr`, if it is file backed.
    pub fn va2off(&self, addr: u64) -> Option<u64> {
        self.segments()
            .iter()
            .filter(|seg| !seg.is_zeropage())
            .find(|seg| seg.vmaddr <= addr && addr - seg.vmaddr < seg.filesize)
            .and_then(|seg| seg.fileoff.checked_add(addr - seg.vmaddr))
    }

    pub fn read_at_va(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let pos = match self.hint {
            LoadHint::Memory => addr.wrapping_add(self.slide() as u64),
            LoadHint::File | LoadHint::SharedCacheLib => {
                let off = self
                    .va2off(addr)
                    .ok_or_else(|| Error::NotFound(format!("file offset of address 0x{:x}", addr)))?;

                self.start.wrapping_add(off)
            }
        };

        self.source.read_exact_at(pos, buf)
    }

    /// Read a pointer sized value in the image byte order.
    pub fn read_ptr_at_va(&self, addr: u64) -> Result<u64> {
        if self.is_64bit() {
            self.read_u64_at_va(addr)
        } else {
            let mut buf = [0; 4];

            self.read_at_va(addr, &mut buf)?;

            Ok(u64::from(if self.header.is_bigend() {
                BigEndian::read_u32(&buf)
            } else {
                LittleEndian::read_u32(&buf)
            }))
        }
    }

    pub fn read_u64_at_va(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];

        self.read_at_va(addr, &mut buf)?;

        Ok(if self.header.is_bigend() {
            BigEndian::read_u64(&buf)
        } else {
            LittleEndian::read_u64(&buf)
        })
    }

    pub fn uuid(&self) -> Option<Uuid> {
        self.commands().find_map(|cmd| match cmd {
            LoadCommand::Uuid(uuid) => Some(*uuid),
            _ => None,
        })
    }

    pub fn install_name(&self) -> Option<String> {
        self.commands().find_map(|cmd| match cmd {
            LoadCommand::IdDyLib(dylib) => Some(dylib.name.to_string()),
            _ => None,
        })
    }

    /// Install names of the linked dylibs, in ordinal order.
    ///
    /// `filter` keeps only one command kind, e.g. `LC_REEXPORT_DYLIB`.
    pub fn dylibs(&self, filter: Option<u32>) -> Vec<String> {
        self.commands()
            .filter(|cmd| match filter {
                Some(kind) => cmd.cmd() == kind,
                None => cmd.cmd() != LC_ID_DYLIB,
            })
            .filter_map(|cmd| cmd.dylib())
            .map(|dylib| dylib.name.to_string())
            .collect()
    }

    pub fn visit_build_versions<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(u32, VersionTag, VersionTag, &[BuildTool]) -> ControlFlow<()>,
    {
        for cmd in self.commands() {
            if let LoadCommand::BuildVersion {
                platform,
                minos,
                sdk,
                tools,
            } = cmd
            {
                visitor(*platform, *minos, *sdk, tools)?;
            }
        }

        ControlFlow::Continue(())
    }

    /// The platform and best known OS version the image was built for.
    pub fn platform_version(&self) -> Option<PlatformVersion> {
        let mut found = None;

        let _ = self.visit_build_versions(|platform, minos, sdk, _| {
            found = [sdk, minos]
                .iter()
                .find(|v| !v.is_zero())
                .map(|&version| PlatformVersion { platform, version });

            if found.is_some() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        found.or_else(|| {
            self.commands().find_map(|cmd| match cmd {
                LoadCommand::VersionMin { target, version, sdk } => [*sdk, *version]
                    .iter()
                    .find(|v| !v.is_zero())
                    .map(|&version| PlatformVersion {
                        platform: target.platform(),
                        version,
                    }),
                _ => None,
            })
        })
    }

    pub fn entry_point(&self) -> Option<u64> {
        self.commands().find_map(|cmd| match cmd {
            LoadCommand::EntryPoint { entryoff, .. } => self.base_addr().map(|base| base.wrapping_add(*entryoff)),
            LoadCommand::Thread { pc, .. } => *pc,
            _ => None,
        })
    }

    /// The source position of a link-edit file offset.
    fn linkedit_pos(&self, off: u64) -> Option<u64> {
        match self.hint {
            LoadHint::File | LoadHint::SharedCacheLib => self.start.checked_add(off),
            LoadHint::Memory => {
                let linkedit = self.find_segment(SEG_LINKEDIT);
                let base = self.base_addr();

                match (linkedit, base) {
                    (Some(linkedit), Some(base)) => Some(
                        self.start
                            .wrapping_add(off)
                            .wrapping_add(linkedit.vmaddr.wrapping_sub(base))
                            .wrapping_sub(linkedit.fileoff),
                    ),
                    _ => {
                        warn!("no __LINKEDIT segment to locate link-edit data at 0x{:x}", off);

                        None
                    }
                }
            }
        }
    }

    /// Read link-edit data, clamped to what the source holds.
    pub fn load_linkedit_data(&self, off: u32, size: u32) -> Vec<u8> {
        match self.linkedit_pos(u64::from(off)) {
            Some(pos) => {
                let data = self.source.read_clamped(pos, size as usize);

                if data.len() < size as usize {
                    warn!(
                        "link-edit data at 0x{:x} truncated from {} to {} bytes",
                        off,
                        size,
                        data.len()
                    );
                }

                data
            }
            None => Vec::new(),
        }
    }

    pub fn symbol_table(
        &self,
        cache: &StringTableCache,
        cancel: Option<&dyn Fn() -> bool>,
    ) -> Result<Option<SymbolTable>> {
        let symtab = self.commands().find_map(|cmd| match *cmd {
            LoadCommand::SymTab {
                symoff,
                nsyms,
                stroff,
                strsize,
            } => Some((symoff, nsyms, stroff, strsize)),
            _ => None,
        });
        let (symoff, nsyms, stroff, strsize) = match symtab {
            Some(symtab) => symtab,
            None => return Ok(None),
        };

        let symoff = self.linkedit_pos(u64::from(symoff));
        let stroff = self.linkedit_pos(u64::from(stroff));

        if let (Some(symoff), Some(stroff)) = (symoff, stroff) {
            let mut loader = SymbolTableLoader::new(&self.source, self.is_64bit(), self.header.is_bigend(), cache);

            if let Some(cancel) = cancel {
                loader = loader.with_cancel(cancel);
            }

            loader.load(symoff, nsyms, stroff, strsize).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Function start addresses from `LC_FUNCTION_STARTS`.
    pub fn function_starts(&self) -> Vec<u64> {
        let data = match self.commands().find_map(|cmd| match cmd {
            LoadCommand::FunctionStarts(data) => Some(*data),
            _ => None,
        }) {
            Some(data) => self.load_linkedit_data(data.off, data.size),
            None => return Vec::new(),
        };
        let mut addr = match self.base_addr() {
            Some(base) => base,
            None => return Vec::new(),
        };
        let mut cur = Cursor::new(&data[..]);
        let mut starts = Vec::new();

        while cur.remaining() > 0 {
            match cur.read_uleb128() {
                Ok(0) => break,
                Ok(delta) => {
                    addr = addr.wrapping_add(delta);
                    starts.push(addr);
                }
                Err(err) => {
                    warn!("stop decoding function starts, {}", err);

                    break;
                }
            }
        }

        starts
    }

    fn indirect_symbols(&self) -> Vec<u32> {
        let table = self.commands().find_map(|cmd| match *cmd {
            LoadCommand::DySymTab {
                indirectsymoff,
                nindirectsyms,
                ..
            } => Some((indirectsymoff, nindirectsyms)),
            _ => None,
        });

        match table {
            Some((off, count)) if count > 0 => {
                let data = self.load_linkedit_data(off, count.saturating_mul(4));
                let mut cur = Cursor::new(&data[..]);

                (0..data.len() / 4)
                    .filter_map(|_| {
                        if self.header.is_bigend() {
                            cur.read_u32::<BigEndian>().ok()
                        } else {
                            cur.read_u32::<LittleEndian>().ok()
                        }
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Symbols imported through the symbol pointer sections.
    pub fn import_info(&self, cache: &StringTableCache) -> Result<ImportInfo> {
        let mut info = ImportInfo::default();
        let symtab = match self.symbol_table(cache, None)? {
            Some(symtab) => symtab,
            None => return Ok(info),
        };
        let indirect = self.indirect_symbols();
        let dylibs = self.dylibs(None);
        let ptr_size = self.ptr_size() as u64;

        for segment in self.segments().iter() {
            for section in &segment.sections {
                match section.flags.sect_type() {
                    S_LAZY_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => {}
                    _ => continue,
                }

                info.ranges.push(section.addr..section.end());

                for i in 0..section.size / ptr_size {
                    let index = u64::from(section.reserved1).saturating_add(i);
                    let symbol = match indirect.get(index as usize) {
                        Some(&symbol) => symbol,
                        None => {
                            warn!(
                                "indirect symbol index {} of section {} out of range",
                                index, section.sectname
                            );

                            break;
                        }
                    };

                    if (symbol & (INDIRECT_SYMBOL_LOCAL | INDIRECT_SYMBOL_ABS)) != 0 {
                        continue;
                    }

                    let nlist = match symtab.nlists().get(symbol as usize) {
                        Some(nlist) if nlist.is_undefined() => nlist,
                        _ => continue,
                    };
                    let ordinal = nlist.library_ordinal();

                    if ordinal == SELF_LIBRARY_ORDINAL
                        || ordinal == DYNAMIC_LOOKUP_ORDINAL
                        || ordinal == EXECUTABLE_ORDINAL
                    {
                        continue;
                    }

                    if let Some(name) = symtab.name(nlist.n_strx) {
                        info.imports.push(Import {
                            address: section.addr.wrapping_add(i * ptr_size),
                            name: name.into_owned(),
                            ordinal,
                            dylib: dylibs.get(ordinal as usize - 1).cloned(),
                        });
                    }
                }
            }
        }

        debug!("found {} imports in {} sections", info.imports.len(), info.ranges.len());

        Ok(info)
    }

    fn dyld_info_table(&self, select: fn(&LoadCommand) -> Option<(u32, u32)>) -> Option<Vec<u8>> {
        self.commands()
            .find_map(select)
            .filter(|&(_, size)| size > 0)
            .map(|(off, size)| self.load_linkedit_data(off, size))
    }

    fn rebase_opcodes(&self) -> Option<Vec<u8>> {
        self.dyld_info_table(|cmd| match *cmd {
            LoadCommand::DyldInfo {
                rebase_off,
                rebase_size,
                ..
            } => Some((rebase_off, rebase_size)),
            _ => None,
        })
    }

    fn bind_opcodes(&self, kind: BindKind) -> Option<Vec<u8>> {
        match kind {
            BindKind::Normal => self.dyld_info_table(|cmd| match *cmd {
                LoadCommand::DyldInfo { bind_off, bind_size, .. } => Some((bind_off, bind_size)),
                _ => None,
            }),
            BindKind::Weak => self.dyld_info_table(|cmd| match *cmd {
                LoadCommand::DyldInfo {
                    weak_bind_off,
                    weak_bind_size,
                    ..
                } => Some((weak_bind_off, weak_bind_size)),
                _ => None,
            }),
            BindKind::Lazy => self.dyld_info_table(|cmd| match *cmd {
                LoadCommand::DyldInfo {
                    lazy_bind_off,
                    lazy_bind_size,
                    ..
                } => Some((lazy_bind_off, lazy_bind_size)),
                _ => None,
            }),
        }
    }

    /// The export trie from `LC_DYLD_INFO` or `LC_DYLD_EXPORTS_TRIE`.
    pub fn export_trie(&self) -> Option<Vec<u8>> {
        self.dyld_info_table(|cmd| match *cmd {
            LoadCommand::DyldInfo {
                export_off,
                export_size,
                ..
            } => Some((export_off, export_size)),
            LoadCommand::DyldExportsTrie(data) => Some((data.off, data.size)),
            _ => None,
        })
    }

    pub fn visit_rebase<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(&RebaseRecord) -> ControlFlow<()>,
    {
        match self.rebase_opcodes() {
            Some(opcodes) => opcode::run_rebase(self, &opcodes, visitor),
            None => Ok(()),
        }
    }

    /// All rebase records; decoding stops quietly at the first corruption.
    pub fn rebase_records(&self) -> Vec<RebaseRecord> {
        let mut records = Vec::new();

        if let Err(err) = self.visit_rebase(|record| {
            records.push(record.clone());
            ControlFlow::Continue(())
        }) {
            warn!("wrong rebase info, {}", err);
        }

        records
    }

    pub fn visit_bind<F>(&self, kind: BindKind, visitor: F) -> Result<()>
    where
        F: FnMut(&BindRecord) -> ControlFlow<()>,
    {
        match self.bind_opcodes(kind) {
            Some(opcodes) => opcode::run_bind(self, &opcodes, kind, visitor),
            None => Ok(()),
        }
    }

    pub fn bind_records(&self, kind: BindKind) -> Vec<BindRecord> {
        let mut records = Vec::new();

        if let Err(err) = self.visit_bind(kind, |record| {
            records.push(record.clone());
            ControlFlow::Continue(())
        }) {
            warn!("wrong {:?} bind info, {}", kind, err);
        }

        records
    }

    pub fn visit_exports<F>(&self, visitor: F) -> Result<()>
    where
        F: FnMut(&ExportSymbol) -> ControlFlow<()>,
    {
        match self.export_trie() {
            Some(trie) => ExportTrie::new(&trie, self.base_addr().unwrap_or_default()).visit(visitor),
            None => Ok(()),
        }
    }

    pub fn exports(&self) -> Vec<ExportSymbol> {
        let mut exports = Vec::new();

        if let Err(err) = self.visit_exports(|symbol| {
            exports.push(symbol.clone());
            ControlFlow::Continue(())
        }) {
            warn!("wrong export info, {}", err);
        }

        exports
    }

    pub fn find_export(&self, name: &str) -> Result<Option<ExportSymbol>> {
        match self.export_trie() {
            Some(trie) => ExportTrie::new(&trie, self.base_addr().unwrap_or_default()).find(name),
            None => Ok(None),
        }
    }

    /// Look `name` up in the export trie, then in the symbol table.
    pub fn find_exported_symbol(&self, name: &str, cache: &StringTableCache) -> Result<Option<ExportLookup>> {
        match self.find_export(name) {
            Ok(Some(ExportSymbol {
                export: ExportType::Reexport { ordinal, name: target },
                ..
            })) => {
                let dylib = (ordinal as usize)
                    .checked_sub(1)
                    .and_then(|i| self.dylibs(None).into_iter().nth(i));

                match dylib {
                    Some(dylib) => {
                        let name = if target.is_empty() { name.to_owned() } else { target };

                        return Ok(Some(ExportLookup::Reexport { dylib, name }));
                    }
                    None => warn!("re-exported symbol {} has bad dylib ordinal {}", name, ordinal),
                }
            }
            Ok(Some(symbol)) => {
                if let Some(addr) = symbol.export.address() {
                    return Ok(Some(ExportLookup::Address(addr)));
                }
            }
            Ok(None) => {}
            Err(err) => warn!("fail to look up {} in the export trie, {}", name, err),
        }

        let symtab = match self.symbol_table(cache, None)? {
            Some(symtab) => symtab,
            None => return Ok(None),
        };

        Ok(symtab.find_defined(name).map(|nlist| {
            if self.header.cputype == CPU_TYPE_ARM && nlist.is_thumb() {
                ExportLookup::Address(nlist.n_value | 1)
            } else {
                ExportLookup::Address(nlist.n_value)
            }
        }))
    }
}
