//! The dyld shared cache container.
//!
//! A cache is a header followed by tables (mappings, images, text infos, local
//! symbols, branch islands, slide info) and the merged segments of every dylib.
//! Each dylib is opened as a `MachImage` through a `CacheImageSource`.
use std::io::Cursor;
use std::ops::{ControlFlow, Range};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::codec::CursorExt;
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::graph;
use crate::image::{ExportLookup, LoadHint, MachImage};
use crate::slide::SlideInfo;
use crate::source::ByteSource;
use crate::symbol::{StringTableCache, Symbol, SymbolTable, SymbolTableLoader};

bitflags! {
    /// The tables decoded by `SharedCache::parse`.
    pub struct ParseFlags: u32 {
        const MAPPINGS = 0x01;
        const IMAGES = 0x02;
        const SYMBOLS = 0x04;
        const ISLANDS = 0x08;
        const SLIDE = 0x10;
        const TEXT = 0x20;
    }
}

impl Default for ParseFlags {
    fn default() -> Self {
        ParseFlags::MAPPINGS | ParseFlags::IMAGES | ParseFlags::TEXT | ParseFlags::SLIDE
    }
}

/// Size of the largest header layout we understand.
const HEADER_SIZE: usize = 248;
/// Fields before `mappingOffset` that every cache has.
const MIN_HEADER_SIZE: usize = 32;
const MAPPING_INFO_SIZE: usize = 32;
const IMAGE_INFO_SIZE: usize = 32;
const TEXT_INFO_SIZE: usize = 32;
const LOCAL_SYMBOLS_INFO_SIZE: usize = 24;
const LOCAL_SYMBOLS_ENTRY_SIZE: usize = 12;
const MAX_PATH_LEN: usize = 1024;
const SHARED_REGION_SIZE: u64 = 0x1_0000_0000;

fn arch_name(magic: &[u8; 16]) -> String {
    let name = &magic[DYLD_CACHE_MAGIC_PREFIX.len()..];
    let name = match name.iter().position(|&b| b == 0) {
        Some(end) => &name[..end],
        None => name,
    };

    String::from_utf8_lossy(name)
        .trim_start_matches(|c: char| c.is_ascii_digit())
        .trim()
        .to_owned()
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheHeader {
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    pub images_offset: u32,
    pub images_count: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset: u64,
    pub slide_info_size: u64,
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: Uuid,
    pub cache_type: u64,
    pub branch_pools_offset: u32,
    pub branch_pools_count: u32,
    pub accelerate_info_addr: u64,
    pub accelerate_info_size: u64,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    pub platform: u32,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
}

impl CacheHeader {
    /// The architecture name after the version, e.g. `arm64e`.
    pub fn arch(&self) -> String {
        arch_name(&self.magic)
    }

    fn parse(source: &dyn ByteSource) -> Result<(CacheHeader, bool)> {
        let mut buf = source.read_clamped(0, HEADER_SIZE);

        if !buf.starts_with(DYLD_CACHE_MAGIC_PREFIX) || buf.starts_with(b"dyld_v0") {
            return Err(Error::InvalidCacheMagic);
        }

        if buf.len() < MIN_HEADER_SIZE {
            return Err(Error::Truncated {
                offset: 0,
                needed: MIN_HEADER_SIZE,
                available: buf.len(),
            });
        }

        buf.resize(HEADER_SIZE, 0);

        let mut magic = [0; 16];

        magic.copy_from_slice(&buf[..16]);

        let bigend = arch_name(&magic).starts_with("ppc");

        let header = if bigend {
            Self::parse_fields::<BigEndian>(buf, magic)
        } else {
            Self::parse_fields::<LittleEndian>(buf, magic)
        };

        Ok((header, bigend))
    }

    fn parse_fields<O: ByteOrder>(mut buf: Vec<u8>, magic: [u8; 16]) -> CacheHeader {
        let mapping_offset = O::read_u32(&buf[16..]);

        // older caches are shorter, their tables start where newer fields would be
        let end = (mapping_offset as usize).max(MIN_HEADER_SIZE);

        if end < HEADER_SIZE {
            for b in &mut buf[end..] {
                *b = 0;
            }
        }

        let u32_at = |off: usize| O::read_u32(&buf[off..]);
        let u64_at = |off: usize| O::read_u64(&buf[off..]);

        CacheHeader {
            magic,
            mapping_offset,
            mapping_count: u32_at(20),
            images_offset: u32_at(24),
            images_count: u32_at(28),
            dyld_base_address: u64_at(32),
            code_signature_offset: u64_at(40),
            code_signature_size: u64_at(48),
            slide_info_offset: u64_at(56),
            slide_info_size: u64_at(64),
            local_symbols_offset: u64_at(72),
            local_symbols_size: u64_at(80),
            uuid: Uuid::from_slice(&buf[88..104]).unwrap_or_default(),
            cache_type: u64_at(104),
            branch_pools_offset: u32_at(112),
            branch_pools_count: u32_at(116),
            accelerate_info_addr: u64_at(120),
            accelerate_info_size: u64_at(128),
            images_text_offset: u64_at(136),
            images_text_count: u64_at(144),
            platform: u32_at(216),
            shared_region_start: u64_at(224),
            shared_region_size: u64_at(232),
            max_slide: u64_at(240),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: vm_prot_t,
    pub init_prot: vm_prot_t,
}

impl MappingInfo {
    pub fn contains(&self, addr: u64) -> bool {
        self.address <= addr && addr - self.address < self.size
    }

    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn is_text(&self) -> bool {
        let rx = VM_PROT_READ | VM_PROT_EXECUTE;

        self.max_prot & rx == rx
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    pub path_file_offset: u32,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextInfo {
    pub uuid: Uuid,
    pub load_address: u64,
    pub text_segment_size: u32,
    pub path_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSymbolsEntry {
    /// File offset of the dylib's mach header.
    pub dylib_offset: u32,
    pub nlist_start_index: u32,
    pub nlist_count: u32,
}

/// The unmapped local symbols of every cache dylib.
#[derive(Debug, Clone)]
pub struct LocalSymbols {
    pub symbols: SymbolTable,
    pub entries: Vec<LocalSymbolsEntry>,
}

/// A window over the cache file presenting one dylib as if it were a file.
///
/// Offsets below `max_rel_off` are relative to the image header, anything
/// else (data and link-edit) is a cache file offset.
pub struct CacheImageSource<'a, S: ?Sized> {
    cache: &'a S,
    start_off: u64,
    max_rel_off: u64,
    size: u64,
}

impl<'a, S: ByteSource + ?Sized> CacheImageSource<'a, S> {
    pub fn new(cache: &'a S, start_off: u64, max_rel_off: u64, size: u64) -> Self {
        CacheImageSource {
            cache,
            start_off,
            max_rel_off,
            size,
        }
    }

    pub fn start_off(&self) -> u64 {
        self.start_off
    }

    fn translate(&self, offset: u64) -> u64 {
        if offset < self.max_rel_off {
            self.start_off.wrapping_add(offset)
        } else {
            offset
        }
    }
}

impl<'a, S: ByteSource + ?Sized> ByteSource for CacheImageSource<'a, S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        self.cache.read_at(self.translate(offset), buf)
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

pub type CacheImage<'a, S> = MachImage<CacheImageSource<'a, S>>;

pub struct SharedCache<S> {
    source: S,
    header: CacheHeader,
    arch: String,
    bigend: bool,
    is_64bit: bool,
    mappings: Vec<MappingInfo>,
    images: Vec<ImageInfo>,
    text_infos: Vec<TextInfo>,
    local_symbols: Option<LocalSymbols>,
    islands: Vec<u64>,
    slide_info: Option<SlideInfo>,
    strings: StringTableCache,
}

impl<S: ByteSource> SharedCache<S> {
    /// Parse the cache header and the tables selected by `flags`.
    ///
    /// Only a bad magic or an unreadable header fail, broken tables are
    /// clamped or skipped with a warning.
    pub fn parse(source: S, flags: ParseFlags) -> Result<Self> {
        let (mut header, bigend) = CacheHeader::parse(&source)?;
        let arch = header.arch();
        let is_64bit = (arch.starts_with("arm64") && arch != "arm64_32") || arch.starts_with("x86_64");

        debug!(
            "dyld cache for {}, {}-bit {} endian, {} mappings, {} images",
            arch,
            if is_64bit { 64 } else { 32 },
            if bigend { "big" } else { "little" },
            header.mapping_count,
            header.images_count,
        );

        let mut cache = SharedCache {
            source,
            header: CacheHeader::default(),
            arch,
            bigend,
            is_64bit,
            mappings: Vec::new(),
            images: Vec::new(),
            text_infos: Vec::new(),
            local_symbols: None,
            islands: Vec::new(),
            slide_info: None,
            strings: StringTableCache::new(),
        };

        if bigend {
            cache.parse_tables::<BigEndian>(&header, flags);
        } else {
            cache.parse_tables::<LittleEndian>(&header, flags);
        }

        if header.mapping_offset as usize <= HEADER_SIZE && cache.mappings.len() > 2 {
            let start = cache.mappings[0].address;
            let last = cache.mappings[2];

            header.shared_region_start = start;
            header.shared_region_size = SHARED_REGION_SIZE;
            header.max_slide = SHARED_REGION_SIZE
                .wrapping_sub(last.address)
                .wrapping_sub(last.size)
                .wrapping_add(start);
        }

        cache.header = header;

        Ok(cache)
    }

    fn parse_tables<O: ByteOrder>(&mut self, header: &CacheHeader, flags: ParseFlags) {
        let needs_mappings = flags.intersects(ParseFlags::MAPPINGS | ParseFlags::IMAGES | ParseFlags::SLIDE);

        if needs_mappings {
            self.mappings = self.parse_mappings::<O>(header);
        }
        if flags.contains(ParseFlags::IMAGES) {
            self.images = self.parse_images::<O>(header);
        }
        if flags.intersects(ParseFlags::TEXT | ParseFlags::IMAGES) {
            self.text_infos = self.parse_text_infos::<O>(header);
        }
        if flags.contains(ParseFlags::SYMBOLS) {
            self.local_symbols = match self.parse_local_symbols::<O>(header) {
                Ok(symbols) => symbols,
                Err(err) => {
                    warn!("skip local symbols, {}", err);

                    None
                }
            };
        }
        if flags.contains(ParseFlags::ISLANDS) {
            self.islands = self
                .read_table(
                    u64::from(header.branch_pools_offset),
                    u64::from(header.branch_pools_count),
                    8,
                    "branch pools",
                )
                .chunks_exact(8)
                .map(O::read_u64)
                .collect();
        }
        if flags.contains(ParseFlags::SLIDE) && header.slide_info_offset != 0 && header.slide_info_size != 0 {
            self.slide_info = match SlideInfo::parse::<O, _>(&self.source, header.slide_info_offset) {
                Ok(info) => info,
                Err(err) => {
                    warn!("skip slide info, {}", err);

                    None
                }
            };
        }
    }

    /// Read `count` records, clamped to the source size.
    fn read_table(&self, offset: u64, count: u64, record_size: usize, what: &str) -> Vec<u8> {
        if offset == 0 || count == 0 {
            return Vec::new();
        }

        let len = count.saturating_mul(record_size as u64);
        let len = match self.source.size() {
            Some(size) => len.min(size.saturating_sub(offset)),
            None => len,
        };
        let buf = self.source.read_clamped(offset, len as usize);

        if (buf.len() / record_size) as u64 != count {
            warn!("{} at 0x{:x} clamped from {} to {} records", what, offset, count, buf.len() / record_size);
        }

        buf
    }

    fn parse_mappings<O: ByteOrder>(&self, header: &CacheHeader) -> Vec<MappingInfo> {
        self.read_table(
            u64::from(header.mapping_offset),
            u64::from(header.mapping_count),
            MAPPING_INFO_SIZE,
            "mappings",
        )
        .chunks_exact(MAPPING_INFO_SIZE)
        .map(|record| MappingInfo {
            address: O::read_u64(&record[0..]),
            size: O::read_u64(&record[8..]),
            file_offset: O::read_u64(&record[16..]),
            max_prot: O::read_i32(&record[24..]),
            init_prot: O::read_i32(&record[28..]),
        })
        .collect()
    }

    fn read_path(&self, offset: u32) -> String {
        let buf = self.source.read_clamped(u64::from(offset), MAX_PATH_LEN);

        Cursor::new(&buf[..]).read_cstr().unwrap_or_else(|err| {
            warn!("bad image path at 0x{:x}, {}", offset, err);

            String::from_utf8_lossy(&buf).into_owned()
        })
    }

    fn parse_images<O: ByteOrder>(&self, header: &CacheHeader) -> Vec<ImageInfo> {
        self.read_table(
            u64::from(header.images_offset),
            u64::from(header.images_count),
            IMAGE_INFO_SIZE,
            "images",
        )
        .chunks_exact(IMAGE_INFO_SIZE)
        .map(|record| {
            let path_file_offset = O::read_u32(&record[24..]);

            ImageInfo {
                address: O::read_u64(&record[0..]),
                mod_time: O::read_u64(&record[8..]),
                inode: O::read_u64(&record[16..]),
                path_file_offset,
                path: self.read_path(path_file_offset),
            }
        })
        .collect()
    }

    fn parse_text_infos<O: ByteOrder>(&self, header: &CacheHeader) -> Vec<TextInfo> {
        self.read_table(
            header.images_text_offset,
            header.images_text_count,
            TEXT_INFO_SIZE,
            "image text infos",
        )
        .chunks_exact(TEXT_INFO_SIZE)
        .map(|record| TextInfo {
            uuid: Uuid::from_slice(&record[..16]).unwrap_or_default(),
            load_address: O::read_u64(&record[16..]),
            text_segment_size: O::read_u32(&record[24..]),
            path_offset: O::read_u32(&record[28..]),
        })
        .collect()
    }

    fn parse_local_symbols<O: ByteOrder>(&self, header: &CacheHeader) -> Result<Option<LocalSymbols>> {
        if header.local_symbols_offset == 0 || header.local_symbols_size == 0 {
            return Ok(None);
        }

        let base = header.local_symbols_offset;
        let mut info = [0; LOCAL_SYMBOLS_INFO_SIZE];

        self.source.read_exact_at(base, &mut info)?;

        let field = |i: usize| O::read_u32(&info[i * 4..]);
        let (nlist_offset, nlist_count) = (field(0), field(1));
        let (strings_offset, strings_size) = (field(2), field(3));
        let (entries_offset, entries_count) = (field(4), field(5));

        let symbols = SymbolTableLoader::new(&self.source, self.is_64bit, self.bigend, &self.strings).load(
            base.saturating_add(u64::from(nlist_offset)),
            nlist_count,
            base.saturating_add(u64::from(strings_offset)),
            strings_size,
        )?;
        let entries = self
            .read_table(
                base.saturating_add(u64::from(entries_offset)),
                u64::from(entries_count),
                LOCAL_SYMBOLS_ENTRY_SIZE,
                "local symbols entries",
            )
            .chunks_exact(LOCAL_SYMBOLS_ENTRY_SIZE)
            .map(|record| LocalSymbolsEntry {
                dylib_offset: O::read_u32(&record[0..]),
                nlist_start_index: O::read_u32(&record[4..]),
                nlist_count: O::read_u32(&record[8..]),
            })
            .collect::<Vec<_>>();

        debug!("{} local symbols for {} dylibs", symbols.len(), entries.len());

        Ok(Some(LocalSymbols { symbols, entries }))
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn header(&self) -> &CacheHeader {
        &self.header
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    pub fn is_bigend(&self) -> bool {
        self.bigend
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn mappings(&self) -> &[MappingInfo] {
        &self.mappings
    }

    pub fn images(&self) -> &[ImageInfo] {
        &self.images
    }

    pub fn text_infos(&self) -> &[TextInfo] {
        &self.text_infos
    }

    pub fn islands(&self) -> &[u64] {
        &self.islands
    }

    pub fn slide_info(&self) -> Option<&SlideInfo> {
        self.slide_info.as_ref()
    }

    /// The string table cache shared by every image opened from this cache.
    pub fn string_tables(&self) -> &StringTableCache {
        &self.strings
    }

    pub fn image_index(&self, path: &str) -> Option<usize> {
        self.images.iter().position(|image| image.path == path)
    }

    pub fn image_path(&self, index: usize) -> Option<&str> {
        self.images.get(index).map(|image| image.path.as_str())
    }

    /// The mapping with read and execute permissions.
    pub fn text_mapping(&self) -> Option<&MappingInfo> {
        self.mappings.iter().find(|mapping| mapping.is_text())
    }

    pub fn va2off(&self, addr: u64) -> Option<u64> {
        self.mappings
            .iter()
            .find(|mapping| mapping.contains(addr))
            .and_then(|mapping| mapping.file_offset.checked_add(addr - mapping.address))
    }

    pub fn read_at_va(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let off = self
            .va2off(addr)
            .ok_or_else(|| Error::NotFound(format!("cache mapping of address 0x{:x}", addr)))?;

        self.source.read_exact_at(off, buf)
    }

    pub fn read_u64_at_va(&self, addr: u64) -> Result<u64> {
        let mut buf = [0; 8];

        self.read_at_va(addr, &mut buf)?;

        Ok(if self.bigend {
            BigEndian::read_u64(&buf)
        } else {
            LittleEndian::read_u64(&buf)
        })
    }

    pub fn read_ptr_at_va(&self, addr: u64) -> Result<u64> {
        if self.is_64bit {
            self.read_u64_at_va(addr)
        } else {
            let mut buf = [0; 4];

            self.read_at_va(addr, &mut buf)?;

            Ok(u64::from(if self.bigend {
                BigEndian::read_u32(&buf)
            } else {
                LittleEndian::read_u32(&buf)
            }))
        }
    }

    /// Strip the slide info chain bits from a pointer read out of the cache.
    pub fn untag(&self, raw: u64) -> u64 {
        match self.slide_info {
            Some(ref info) => info.untag(raw),
            None => raw,
        }
    }

    /// The addresses between the start of the cache and the first image header.
    pub fn header_range(&self) -> Option<Range<u64>> {
        let start = self.mappings.first()?.address;
        let end = self.images.iter().map(|image| image.address).min()?;

        Some(start..end)
    }

    /// The unmapped local symbols of image `index`.
    pub fn local_symbols(&self, index: usize) -> Vec<Symbol> {
        let (local, offset) = match (self.local_symbols.as_ref(), self.image_offset(index)) {
            (Some(local), Some(offset)) => (local, offset),
            _ => return Vec::new(),
        };
        let entry = match local.entries.iter().find(|entry| u64::from(entry.dylib_offset) == offset) {
            Some(entry) => entry,
            None => return Vec::new(),
        };

        let start = entry.nlist_start_index as usize;
        let end = start.saturating_add(entry.nlist_count as usize);

        if end > local.symbols.len() {
            warn!(
                "local symbols {}..{} of image {} out of {} symbols",
                start,
                end,
                index,
                local.symbols.len()
            );
        }

        (start..end.min(local.symbols.len()))
            .filter_map(|i| local.symbols.symbol(i))
            .collect()
    }

    /// The file offset of the header of the image mapped at `addr`.
    fn header_offset(&self, addr: u64) -> Option<u64> {
        let text = self.text_mapping()?;

        addr.checked_sub(text.address).and_then(|rel| rel.checked_add(text.file_offset))
    }

    pub fn image_offset(&self, index: usize) -> Option<u64> {
        self.images.get(index).and_then(|image| self.header_offset(image.address))
    }

    /// Offsets below this are relative to an image header.
    fn max_rel_off(&self) -> u64 {
        self.text_infos
            .iter()
            .map(|info| u64::from(info.text_segment_size))
            .max()
            .filter(|&size| size != 0)
            .or_else(|| self.text_mapping().map(|mapping| mapping.size))
            .unwrap_or_default()
    }

    fn cache_size(&self) -> u64 {
        let mapped = self
            .mappings
            .last()
            .map(|mapping| mapping.file_offset.saturating_add(mapping.size));

        match (mapped, self.source.size()) {
            (Some(mapped), Some(size)) => mapped.min(size),
            (mapped, size) => mapped.or(size).unwrap_or_default(),
        }
    }

    fn open_at(&self, addr: u64) -> Result<CacheImage<'_, S>> {
        let start_off = self
            .header_offset(addr)
            .ok_or_else(|| Error::NotFound(format!("cache image at 0x{:x}", addr)))?;
        let source = CacheImageSource::new(&self.source, start_off, self.max_rel_off(), self.cache_size());

        MachImage::parse(source, 0, LoadHint::SharedCacheLib)
    }

    pub fn open_image(&self, index: usize) -> Result<CacheImage<'_, S>> {
        let image = self
            .images
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("cache image #{}", index)))?;

        self.open_at(image.address)
    }

    pub fn open_island(&self, index: usize) -> Result<CacheImage<'_, S>> {
        let addr = self
            .islands
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("branch island #{}", index)))?;

        self.open_at(*addr)
    }

    /// Indexes of every image `index` links against, transitively.
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        graph::closure(vec![index], |&i| match self.open_image(i) {
            Ok(image) => image
                .dylibs(None)
                .iter()
                .filter_map(|path| {
                    let dep = self.image_index(path);

                    if dep.is_none() {
                        debug!("{} is not in the cache", path);
                    }

                    dep
                })
                .collect(),
            Err(err) => {
                warn!("skip dependencies of image #{}, {}", i, err);

                Vec::new()
            }
        })
    }

    /// Resolve `name` as seen by a client of `dylib`, following re-exports.
    pub fn find_exported_symbol(&self, dylib: &str, name: &str) -> Option<u64> {
        let found = graph::search(vec![(dylib.to_owned(), name.to_owned())], |(dylib, name), worklist| {
            let image = match self.image_index(&dylib).map(|i| self.open_image(i)) {
                Some(Ok(image)) => image,
                Some(Err(err)) => {
                    warn!("fail to open {}, {}", dylib, err);

                    return ControlFlow::Continue(());
                }
                None => {
                    debug!("{} is not in the cache", dylib);

                    return ControlFlow::Continue(());
                }
            };

            match image.find_exported_symbol(&name, &self.strings) {
                Ok(Some(ExportLookup::Address(addr))) => return ControlFlow::Break(addr),
                Ok(Some(ExportLookup::Reexport { dylib: target, name: renamed })) => {
                    trace!("{} in {} re-exported from {} as {}", name, dylib, target, renamed);

                    worklist.push((target, renamed));

                    return ControlFlow::Continue(());
                }
                Ok(None) => {}
                Err(err) => warn!("fail to look up {} in {}, {}", name, dylib, err),
            }

            if image.header().flags & MH_NO_REEXPORTED_DYLIBS == 0 {
                for reexported in image.dylibs(Some(LC_REEXPORT_DYLIB)) {
                    worklist.push((reexported, name.clone()));
                }
            }

            ControlFlow::Continue(())
        });

        if found.is_none() {
            debug!("symbol {} not found from {}", name, dylib);
        }

        found
    }

    /// Visit every pointer of the data mapping that slide info tracks.
    pub fn visit_slid_pointers<F>(&self, visitor: F) -> ControlFlow<()>
    where
        F: FnMut(u64, u64, u64) -> ControlFlow<()>,
    {
        match (self.slide_info.as_ref(), self.mappings.get(1)) {
            (Some(info), Some(data)) => {
                info.visit_slid_pointers(data.address, |addr| self.read_ptr_at_va(addr).ok(), visitor)
            }
            _ => ControlFlow::Continue(()),
        }
    }
}
