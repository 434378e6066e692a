//! Kernelcaches and the kexts prelinked into them.
//!
//! Kexts are located with the first of three strategies that finds any:
//! the `__kmod_start` / `__kmod_info` tables, the prelink info plist, and at
//! last a scan of the prelink text for Mach-O headers.
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;
use std::ops::ControlFlow;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::commands::Section;
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::graph;
use crate::image::{ExportLookup, LoadHint, MachImage};
use crate::pointer::TaggedPointer;
use crate::source::ByteSource;
use crate::symbol::StringTableCache;

const KMOD_MAX_NAME: usize = 64;
const KMOD_INFO_SIZE_64: usize = 196;
const KMOD_INFO_SIZE_32: usize = 168;
const PAGE_MASK: u64 = 0xFFF;
const THREAD_STARTS_END: u32 = 0xFFFF_FFFF;

/// The `kmod_info` record a kext exports as `_kmod_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmodInfo {
    pub info_version: i32,
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub hdr_size: u64,
    pub start_addr: u64,
}

impl KmodInfo {
    /// Read the record at `addr` of `image`.
    pub fn read<S: ByteSource>(image: &MachImage<S>, addr: u64) -> Result<KmodInfo> {
        let mut buf = vec![
            0;
            if image.is_64bit() {
                KMOD_INFO_SIZE_64
            } else {
                KMOD_INFO_SIZE_32
            }
        ];

        image.read_at_va(addr, &mut buf)?;

        Ok(if image.header().is_bigend() {
            Self::parse::<BigEndian>(&buf, image.is_64bit())
        } else {
            Self::parse::<LittleEndian>(&buf, image.is_64bit())
        })
    }

    fn parse<O: ByteOrder>(buf: &[u8], is_64bit: bool) -> KmodInfo {
        let name_at = |off: usize| {
            let name = &buf[off..off + KMOD_MAX_NAME];
            let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());

            String::from_utf8_lossy(&name[..end]).into_owned()
        };

        if is_64bit {
            KmodInfo {
                info_version: O::read_i32(&buf[8..]),
                name: name_at(16),
                address: O::read_u64(&buf[156..]),
                size: O::read_u64(&buf[164..]),
                hdr_size: O::read_u64(&buf[172..]),
                start_addr: O::read_u64(&buf[180..]),
            }
        } else {
            KmodInfo {
                info_version: O::read_i32(&buf[4..]),
                name: name_at(12),
                address: u64::from(O::read_u32(&buf[148..])),
                size: u64::from(O::read_u32(&buf[152..])),
                hdr_size: u64::from(O::read_u32(&buf[156..])),
                start_addr: u64::from(O::read_u32(&buf[160..])),
            }
        }
    }
}

/// How the kexts of a kernelcache were found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KextStrategy {
    KmodStart,
    PrelinkInfo,
    Scan,
}

impl fmt::Display for KextStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            KextStrategy::KmodStart => "__kmod_start",
            KextStrategy::PrelinkInfo => "prelink info",
            KextStrategy::Scan => "prelink text scan",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KextInfo {
    pub name: String,
    pub uuid: Option<Uuid>,
    /// Address of the kext header.
    pub start: u64,
    pub size: u64,
    /// File offset of the kext header in the kernelcache.
    pub offset: u64,
    /// Where the kext lies in the prelink text, which may differ from `start`
    /// when the kext was relocated.
    pub load_addr: u64,
    pub kmod_info: Option<u64>,
}

/// A kext inside a kernelcache, seen as a standalone file.
///
/// Offsets in a kext's load commands are relative to its header, except
/// those into a `__PRELINK_DATA` segment shared by all kexts, which are
/// kernelcache file offsets.
pub struct KextSource<'a, S: ?Sized> {
    kcache: &'a S,
    start_off: u64,
    prelink_data_off: u64,
}

impl<'a, S: ByteSource + ?Sized> KextSource<'a, S> {
    pub fn new(kcache: &'a S, start_off: u64, prelink_data_off: u64) -> Self {
        KextSource {
            kcache,
            start_off,
            prelink_data_off,
        }
    }

    fn translate(&self, offset: u64) -> u64 {
        if self.prelink_data_off == 0 || offset < self.prelink_data_off {
            self.start_off.wrapping_add(offset)
        } else {
            offset
        }
    }
}

impl<'a, S: ByteSource + ?Sized> ByteSource for KextSource<'a, S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        self.kcache.read_at(self.translate(offset), buf)
    }

    // a kext has no size of its own, the kernelcache bounds the reads
    fn size(&self) -> Option<u64> {
        self.kcache.size()
    }
}

pub type KextImage<'a, S> = MachImage<KextSource<'a, S>>;

pub struct KernelCache<S> {
    image: MachImage<S>,
    strings: StringTableCache,
    kexts: Vec<KextInfo>,
    strategy: Option<KextStrategy>,
    uuids: HashMap<Uuid, usize>,
}

impl<S: ByteSource> KernelCache<S> {
    /// Parse the kernel image at the start of `source` and locate its kexts.
    pub fn parse(source: S) -> Result<Self> {
        let image = MachImage::parse(source, 0, LoadHint::File)?;
        let mut kcache = KernelCache {
            image,
            strings: StringTableCache::new(),
            kexts: Vec::new(),
            strategy: None,
            uuids: HashMap::new(),
        };

        kcache.detect_kexts();

        Ok(kcache)
    }

    fn detect_kexts(&mut self) {
        let found = self
            .parse_kmod_starts()
            .filter(|kexts| !kexts.is_empty())
            .map(|kexts| (KextStrategy::KmodStart, kexts))
            .or_else(|| {
                self.parse_prelink_info()
                    .filter(|kexts| !kexts.is_empty())
                    .map(|kexts| (KextStrategy::PrelinkInfo, kexts))
            })
            .or_else(|| {
                Some((KextStrategy::Scan, self.scan_for_kexts())).filter(|(_, kexts)| !kexts.is_empty())
            });

        if let Some((strategy, kexts)) = found {
            info!("found {} kexts from {}", kexts.len(), strategy);

            self.uuids = kexts
                .iter()
                .enumerate()
                .filter_map(|(i, kext)| kext.uuid.map(|uuid| (uuid, i)))
                .collect();
            self.kexts = kexts;
            self.strategy = Some(strategy);
        } else {
            debug!("no prelinked kexts");
        }
    }

    pub fn image(&self) -> &MachImage<S> {
        &self.image
    }

    pub fn kexts(&self) -> &[KextInfo] {
        &self.kexts
    }

    pub fn strategy(&self) -> Option<KextStrategy> {
        self.strategy
    }

    pub fn string_tables(&self) -> &StringTableCache {
        &self.strings
    }

    pub fn kext_index(&self, name: &str) -> Option<usize> {
        self.kexts.iter().position(|kext| kext.name == name)
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<&KextInfo> {
        self.uuids.get(uuid).map(|&i| &self.kexts[i])
    }

    fn section_data(&self, section: &Section) -> Vec<u8> {
        let offset = self.image.start() + u64::from(section.offset);
        let data = self.image.source().read_clamped(offset, section.size as usize);

        if data.len() < section.size as usize {
            warn!(
                "section {},{} clamped from {} to {} bytes",
                section.segname,
                section.sectname,
                section.size,
                data.len()
            );
        }

        data
    }

    fn find_nonempty_section(&self, segname: &str, sectname: &str) -> Option<Section> {
        self.image
            .find_section(segname, sectname)
            .filter(|section| section.size != 0)
    }

    fn prelink_data_off(&self) -> u64 {
        self.image
            .find_section(SEG_PRELINK_DATA, SECT_DATA)
            .map_or(0, |section| u64::from(section.offset))
    }

    /// A view of the kext whose header is at file offset `offset`.
    pub fn kext_source(&self, offset: u64) -> KextSource<'_, S> {
        KextSource::new(self.image.source(), offset, self.prelink_data_off())
    }

    fn open_kext_at(&self, offset: u64) -> Result<KextImage<'_, S>> {
        MachImage::parse(self.kext_source(offset), 0, LoadHint::File)
    }

    pub fn open_kext(&self, index: usize) -> Result<KextImage<'_, S>> {
        let kext = self
            .kexts
            .get(index)
            .ok_or_else(|| Error::NotFound(format!("kext #{}", index)))?;

        self.open_kext_at(kext.offset)
    }

    /// Strip the tag bits of a chained pointer; binds are returned untouched.
    pub fn untag(&self, raw: u64) -> u64 {
        let ptr = TaggedPointer(raw);

        if ptr.is_bind() {
            raw
        } else {
            ptr.untag(self.image.base_addr().unwrap_or_default())
        }
    }

    fn kext_uuid(&self, offset: u64) -> Option<Uuid> {
        self.open_kext_at(offset).ok().and_then(|kext| kext.uuid())
    }

    /// `__PRELINK_INFO,__kmod_start` and `__kmod_info`, paired arrays of kext
    /// header and `kmod_info` addresses.
    fn parse_kmod_starts(&self) -> Option<Vec<KextInfo>> {
        if !self.image.is_64bit() {
            return None;
        }

        let starts = self.find_nonempty_section(SEG_PRELINK_INFO, SECT_KMOD_START)?;
        let infos = self.find_nonempty_section(SEG_PRELINK_INFO, SECT_KMOD_INFO)?;
        let text_exec = self.find_nonempty_section(SEG_TEXT_EXEC, SECT_TEXT);
        let bigend = self.image.header().is_bigend();
        let read_u64 = |buf: &[u8]| {
            if bigend {
                BigEndian::read_u64(buf)
            } else {
                LittleEndian::read_u64(buf)
            }
        };

        let starts = self.section_data(&starts);
        let infos = self.section_data(&infos);
        let mut kexts = Vec::new();

        for (start, info) in starts.chunks_exact(8).zip(infos.chunks_exact(8)) {
            let start = self.untag(read_u64(start));
            let kmod_info = self.untag(read_u64(info));

            let in_text = match text_exec {
                Some(ref text) => text.contains(start),
                None => self.image.is_loaded_addr(start),
            };

            if !in_text {
                debug!("skip kext start 0x{:x} outside of the kernel text", start);
                continue;
            }

            let offset = match self.image.va2off(start) {
                Some(offset) => offset,
                None => continue,
            };
            let kext = match self.open_kext_at(offset) {
                Ok(kext) => kext,
                Err(err) => {
                    warn!("skip kext at 0x{:x}, {}", start, err);
                    continue;
                }
            };
            let size = kext
                .segments()
                .iter()
                .find(|seg| seg.fileoff == 0)
                .map_or(0, |seg| seg.vmsize);

            if size == 0 {
                continue;
            }

            let name = match KmodInfo::read(&self.image, kmod_info) {
                Ok(kmod) => kmod.name,
                Err(err) => {
                    warn!("unreadable kmod_info at 0x{:x}, {}", kmod_info, err);

                    String::new()
                }
            };

            kexts.push(KextInfo {
                name: if name.is_empty() {
                    format!("prelink_mod_{}", kexts.len())
                } else {
                    name
                },
                uuid: kext.uuid(),
                start,
                size,
                offset,
                load_addr: start,
                kmod_info: Some(kmod_info),
            });
        }

        Some(kexts)
    }

    /// The `kmod_info` addresses listed by the prelink info plist.
    fn parse_prelink_info(&self) -> Option<Vec<KextInfo>> {
        let section = self
            .find_nonempty_section(SEG_PRELINK_INFO, SECT_PRELINK_INFO)
            .or_else(|| self.find_nonempty_section(SEG_PRELINK, SECT_PRELINK_INFO))?;
        let mut data = self.section_data(&section);

        if let Some(end) = data.iter().position(|&b| b == 0) {
            data.truncate(end);
        }

        if data.is_empty() {
            return None;
        }

        let candidates = match std::str::from_utf8(&data)
            .map_err(Error::from)
            .and_then(prelink_kmod_infos)
        {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!("fail to parse the prelink info, {}", err);

                return None;
            }
        };

        let mut kexts = Vec::new();

        for addr in candidates {
            let kmod = match KmodInfo::read(&self.image, addr) {
                Ok(kmod) if kmod.info_version == 1 => kmod,
                Ok(kmod) => {
                    debug!("skip kmod_info at 0x{:x} version {}", addr, kmod.info_version);
                    continue;
                }
                Err(err) => {
                    warn!("skip kmod_info at 0x{:x}, {}", addr, err);
                    continue;
                }
            };
            let offset = match self.image.va2off(kmod.address) {
                Some(offset) => offset,
                None => {
                    warn!("kext {} at 0x{:x} is not file backed", kmod.name, kmod.address);
                    continue;
                }
            };

            kexts.push(KextInfo {
                uuid: self.kext_uuid(offset),
                start: kmod.address,
                size: kmod.size,
                offset,
                load_addr: kmod.address,
                kmod_info: Some(addr),
                name: kmod.name,
            });
        }

        Some(kexts)
    }

    /// Look for Mach-O headers in the prelink text.
    fn scan_for_kexts(&self) -> Vec<KextInfo> {
        let section = match self
            .find_nonempty_section(SEG_PRELINK_TEXT, SECT_TEXT)
            .or_else(|| self.find_nonempty_section(SEG_PRELINK, SECT_TEXT))
        {
            Some(section) => section,
            None => return Vec::new(),
        };
        let start_off = self.image.start().wrapping_add(u64::from(section.offset));
        let data = self.section_data(&section);
        let mut kexts = Vec::new();
        let mut pos = 0;

        while let Some(found) = find_next_magic(&data, pos) {
            pos = found;

            let offset = start_off.wrapping_add(pos as u64);
            let kext = match self.open_kext_at(offset) {
                Ok(kext) => kext,
                Err(_) => {
                    pos += 4;
                    continue;
                }
            };
            let segments = kext.segments();
            let base = segments.iter().find(|seg| seg.fileoff == 0).map(|seg| seg.vmaddr);
            let max_addr = segments.iter().map(|seg| seg.end()).max().unwrap_or_default();
            let filesize = segments.iter().fold(0u64, |sum, seg| sum.saturating_add(seg.filesize));

            if filesize == 0 || max_addr == 0 {
                trace!("no kext at 0x{:x}", offset);

                pos += 4;
                continue;
            }

            let load_addr = section.addr.wrapping_add(pos as u64);
            let (start, size) = match base {
                Some(base) => (base, (max_addr.saturating_add(PAGE_MASK) & !PAGE_MASK).wrapping_sub(base)),
                None => {
                    let next = find_next_magic(&data, pos + 4).unwrap_or(data.len());

                    (load_addr, (next - pos) as u64)
                }
            };

            let kmod_info = match kext.find_exported_symbol("_kmod_info", &self.strings) {
                Ok(Some(ExportLookup::Address(addr))) => Some(addr),
                Ok(_) => None,
                Err(err) => {
                    warn!("fail to look up _kmod_info of the kext at 0x{:x}, {}", offset, err);

                    None
                }
            };
            let name = kmod_info
                .and_then(|addr| KmodInfo::read(&kext, addr).ok())
                .filter(|kmod| kmod.info_version == 1 && !kmod.name.is_empty())
                .map(|kmod| kmod.name)
                .unwrap_or_else(|| format!("prelink_mod_{}", kexts.len()));

            debug!("kext {} at 0x{:x}, {} bytes", name, start, size);

            kexts.push(KextInfo {
                name,
                uuid: kext.uuid(),
                start,
                size,
                offset,
                load_addr,
                kmod_info,
            });

            pos = match usize::try_from(filesize).ok().and_then(|size| pos.checked_add(size)) {
                Some(next) if next <= data.len() => next,
                _ => {
                    warn!("kext at 0x{:x} claims {} bytes past the prelink text", offset, filesize);

                    pos + 4
                }
            };
        }

        kexts
    }

    /// Visit the chained pointers listed by `__TEXT,__thread_starts`.
    ///
    /// The visitor receives the address, the raw value and the untagged value.
    pub fn visit_threaded_pointers<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(u64, u64, u64) -> ControlFlow<()>,
    {
        let section = match self.find_nonempty_section(SEG_TEXT, SECT_THREAD_STARTS) {
            Some(section) => section,
            None => return ControlFlow::Continue(()),
        };
        let data = self.section_data(&section);
        let bigend = self.image.header().is_bigend();
        let items: Vec<u32> = data
            .chunks_exact(4)
            .map(|item| {
                if bigend {
                    BigEndian::read_u32(item)
                } else {
                    LittleEndian::read_u32(item)
                }
            })
            .collect();

        let (flags, starts) = match items.split_first() {
            Some((flags, starts)) if !starts.is_empty() => (*flags, starts),
            _ => return ControlFlow::Continue(()),
        };
        let stride = if flags & 1 != 0 { 8 } else { 4 };
        let base = self.image.base_addr().unwrap_or_default();

        for &start in starts.iter().take_while(|&&start| start != THREAD_STARTS_END) {
            let mut addr = base.wrapping_add(u64::from(start));

            loop {
                let raw = match self.image.read_u64_at_va(addr) {
                    Ok(raw) => raw,
                    Err(_) => break,
                };

                visitor(addr, raw, self.untag(raw))?;

                match TaggedPointer(raw).skip() {
                    0 => break,
                    skip => match addr.checked_add(skip * stride) {
                        Some(next) => addr = next,
                        None => break,
                    },
                }
            }
        }

        ControlFlow::Continue(())
    }

    /// Indexes of the kexts `index` links against, transitively.
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        graph::closure(vec![index], |&i| match self.open_kext(i) {
            Ok(kext) => kext
                .dylibs(None)
                .iter()
                .filter_map(|name| self.kext_index(name))
                .collect(),
            Err(err) => {
                warn!("skip dependencies of kext #{}, {}", i, err);

                Vec::new()
            }
        })
    }
}

/// Offset of the next Mach-O magic at or after `from`, on a 4-byte stride.
fn find_next_magic(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len().saturating_sub(3))
        .step_by(4)
        .find(|&pos| match LittleEndian::read_u32(&data[pos..]) {
            MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64 => true,
            _ => false,
        })
}

/// Parse an integer the way `strtoull(text, NULL, 0)` does.
fn parse_c_integer(text: &str) -> u64 {
    let text = text.trim();
    let (digits, radix) = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        (hex, 16)
    } else if text.len() > 1 && text.starts_with('0') {
        (&text[1..], 8)
    } else {
        (text, 10)
    };
    let end = digits
        .find(|c: char| !c.is_digit(radix))
        .unwrap_or(digits.len());

    u64::from_str_radix(&digits[..end], radix).unwrap_or_default()
}

/// The `kmod_info` addresses named in a prelink info plist.
///
/// `_PrelinkKmodInfo` integers are addresses, `OSBundlePrelink` data holds a
/// big endian 32-bit address in its first four bytes.
pub fn prelink_kmod_infos(xml: &str) -> Result<Vec<u64>> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = roxmltree::Document::parse_with_options(xml, options)
        .map_err(|err| Error::LoadError(format!("prelink info, {}", err)))?;
    let mut key = "";
    let mut addrs = Vec::new();

    for node in doc.descendants().filter(|node| node.is_element()) {
        let text = node.text().unwrap_or_default();

        let addr = match node.tag_name().name() {
            "key" => {
                key = text;
                continue;
            }
            "integer" if key == "_PrelinkKmodInfo" => parse_c_integer(text),
            "data" if key == "OSBundlePrelink" => {
                let encoded: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();

                match base64::decode(&encoded) {
                    Ok(data) if data.len() >= 16 => u64::from(BigEndian::read_u32(&data)),
                    Ok(data) => {
                        warn!("OSBundlePrelink with {} bytes", data.len());
                        continue;
                    }
                    Err(err) => {
                        warn!("bad OSBundlePrelink, {}", err);
                        continue;
                    }
                }
            }
            _ => continue,
        };

        if addr != 0 {
            addrs.push(addr);
        }
    }

    Ok(addrs)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::testdata::kernel::*;
    use crate::testdata::*;

    fn open(data: &[u8]) -> KernelCache<&[u8]> {
        KernelCache::parse(data).unwrap()
    }

    fn names<'a>(kcache: &'a KernelCache<&[u8]>) -> Vec<&'a str> {
        kcache.kexts().iter().map(|kext| kext.name.as_str()).collect()
    }

    #[test]
    fn test_parse_c_integer() {
        assert_eq!(parse_c_integer("0x1F"), 0x1F);
        assert_eq!(parse_c_integer(" 42 "), 42);
        assert_eq!(parse_c_integer("017"), 0o17);
        assert_eq!(parse_c_integer("12abc"), 12);
        assert_eq!(parse_c_integer("abc"), 0);
        assert_eq!(parse_c_integer("0"), 0);
    }

    #[test]
    fn test_prelink_kmod_infos() {
        let addrs = prelink_kmod_infos(&prelink_xml()).unwrap();

        assert_eq!(addrs, vec![KEXT_A + KMOD_OFF, KEXT_B + KMOD_OFF, 0x1000]);
        assert!(prelink_kmod_infos("<dict><key>").is_err());
    }

    #[test]
    fn test_kmod_start_strategy() {
        let _ = pretty_env_logger::try_init();

        let data = sample_kernelcache(true, true);
        let kcache = open(&data);

        assert_eq!(kcache.strategy(), Some(KextStrategy::KmodStart));
        assert_eq!(names(&kcache), vec![KEXT_A_NAME, KEXT_B_NAME]);

        let kext = &kcache.kexts()[1];

        assert_eq!(kext.start, KEXT_B);
        assert_eq!(kext.size, KEXT_SIZE);
        assert_eq!(kext.offset, 0x9000);
        assert_eq!(kext.kmod_info, Some(KEXT_B + KMOD_OFF));
        assert_eq!(kext.uuid, Some(Uuid::from_bytes([0xBB; 16])));
    }

    #[test]
    fn test_prelink_info_strategy() {
        let data = sample_kernelcache(false, true);
        let kcache = open(&data);

        assert_eq!(kcache.strategy(), Some(KextStrategy::PrelinkInfo));
        assert_eq!(names(&kcache), vec![KEXT_A_NAME, KEXT_B_NAME]);

        let kext = &kcache.kexts()[0];

        assert_eq!((kext.start, kext.load_addr), (KEXT_A, KEXT_A));
        assert_eq!(kext.size, KEXT_SIZE);
        assert_eq!(kext.offset, 0x8000);
        assert_eq!(kext.uuid, Some(Uuid::from_bytes([0xAA; 16])));
    }

    #[test]
    fn test_scan_strategy() {
        let data = sample_kernelcache(false, false);
        let kcache = open(&data);

        assert_eq!(kcache.strategy(), Some(KextStrategy::Scan));
        assert_eq!(names(&kcache), vec![KEXT_A_NAME, KEXT_B_NAME]);

        let kext = &kcache.kexts()[1];

        assert_eq!(kext.start, KEXT_B);
        assert_eq!(kext.load_addr, KEXT_B);
        assert_eq!(kext.size, KEXT_SIZE);
        assert_eq!(kext.offset, 0x9000);
        assert_eq!(kext.kmod_info, Some(KEXT_B + KMOD_OFF));
    }

    #[test]
    fn test_scan_falls_back_to_generated_names() {
        let mut data = sample_kernelcache(false, false);

        // break the kmod_info version of kext A
        place(&mut data, 0x8000 + KMOD_OFF as usize + 8, &2i32.to_le_bytes());

        let kcache = open(&data);

        assert_eq!(names(&kcache), vec!["prelink_mod_0", KEXT_B_NAME]);
    }

    #[test]
    fn test_scan_with_huge_segment_sizes() {
        // kext headers are at 0x8000 and 0x9000, `__TEXT` vmsize at +64 and filesize at +80
        let mut data = sample_kernelcache(false, false);

        place(&mut data, 0x8000 + 64, &(u64::MAX - KEXT_A).to_le_bytes());

        let kcache = open(&data);

        assert_eq!(names(&kcache), vec![KEXT_A_NAME, KEXT_B_NAME]);
        assert_eq!(kcache.kexts()[0].start, KEXT_A);
        assert_eq!(kcache.kexts()[0].size, (u64::MAX & !PAGE_MASK) - KEXT_A);
        assert_eq!(kcache.kexts()[1].size, KEXT_SIZE);

        // a filesize running past the prelink text does not hide the next kext
        let mut data = sample_kernelcache(false, false);

        place(&mut data, 0x8000 + 80, &u64::MAX.to_le_bytes());

        let kcache = open(&data);

        assert_eq!(kcache.kexts().len(), 2);
        assert_eq!(kcache.kexts()[1].name, KEXT_B_NAME);
        assert_eq!(kcache.kexts()[1].offset, 0x9000);

        let mut data = sample_kernelcache(false, false);

        place(&mut data, 0x9000 + 80, &u64::MAX.to_le_bytes());

        let kcache = open(&data);

        assert_eq!(names(&kcache), vec![KEXT_A_NAME, KEXT_B_NAME]);
    }

    #[test]
    fn test_uuid_index_and_dependencies() {
        let data = sample_kernelcache(true, false);
        let kcache = open(&data);

        assert_eq!(
            kcache.find_by_uuid(&Uuid::from_bytes([0xAA; 16])).map(|kext| kext.name.as_str()),
            Some(KEXT_A_NAME)
        );
        assert!(kcache.find_by_uuid(&Uuid::nil()).is_none());
        assert_eq!(kcache.kext_index(KEXT_B_NAME), Some(1));
        assert_eq!(kcache.dependencies(0), vec![1]);
        assert!(kcache.dependencies(1).is_empty());
        assert_eq!(
            kcache.open_kext(0).unwrap().install_name().as_deref(),
            Some(KEXT_A_NAME)
        );
        assert!(kcache.open_kext(2).is_err());
    }

    #[test]
    fn test_visit_threaded_pointers() {
        let data = sample_kernelcache(false, false);
        let kcache = open(&data);
        let mut pointers = Vec::new();

        let flow = kcache.visit_threaded_pointers(|addr, raw, value| {
            pointers.push((addr, raw, value));
            ControlFlow::Continue(())
        });

        assert_eq!(flow, ControlFlow::Continue(()));
        assert_eq!(
            pointers,
            vec![
                (CHAIN, tagged(KEXT_A, 1), KEXT_A),
                (CHAIN + 8, (1 << 63) | (2 << 51) | 0x9000, KEXT_B),
                (CHAIN + 0x18, (1 << 62) | 5, (1 << 62) | 5),
            ]
        );

        let mut count = 0;

        let flow = kcache.visit_threaded_pointers(|_, _, _| {
            count += 1;
            ControlFlow::Break(())
        });

        assert_eq!(flow, ControlFlow::Break(()));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_kext_source() {
        let data: Vec<u8> = (0..=255).collect();
        let source = KextSource::new(&data[..], 0x10, 0x80);

        let mut buf = [0; 2];

        assert_eq!(source.read_at(0, &mut buf), 2);
        assert_eq!(buf, [0x10, 0x11]);
        assert_eq!(source.read_at(0x90, &mut buf), 2);
        assert_eq!(buf, [0x90, 0x91]);

        let source = KextSource::new(&data[..], 0x10, 0);

        assert_eq!(source.read_at(0x90, &mut buf), 2);
        assert_eq!(buf, [0xA0, 0xA1]);
    }

    #[test]
    fn test_not_a_kernelcache() {
        let data = sample_dylib();
        let kcache = open(&data);

        assert!(kcache.kexts().is_empty());
        assert_eq!(kcache.strategy(), None);
    }
}
