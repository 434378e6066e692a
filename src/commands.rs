use std::fmt;
use std::io::Cursor;
use std::ops::Deref;

use byteorder::{ByteOrder, ReadBytesExt};
use uuid::Uuid;

use crate::codec::CursorExt;
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::loader::MachHeader;

/// The encoded version.
///
///  X.Y.Z is encoded in nibbles xxxx.yy.zz
///
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VersionTag(pub u32);

impl VersionTag {
    pub fn major(self) -> u32 {
        self.0 >> 16
    }

    pub fn minor(self) -> u32 {
        (self.0 >> 8) & 0xFF
    }

    pub fn release(self) -> u32 {
        self.0 & 0xFF
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl From<VersionTag> for u32 {
    fn from(v: VersionTag) -> u32 {
        v.0
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.release() == 0 {
            write!(f, "{}.{}", self.major(), self.minor())
        } else {
            write!(f, "{}.{}.{}", self.major(), self.minor(), self.release())
        }
    }
}

/// The packed version.
///
/// A.B.C.D.E packed as a24.b10.c10.d10.e10
///
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SourceVersionTag(pub u64);

impl From<SourceVersionTag> for (u32, u32, u32, u32, u32) {
    fn from(v: SourceVersionTag) -> Self {
        (
            ((v.0 >> 40) & 0xFFF) as u32,
            ((v.0 >> 30) & 0x3FF) as u32,
            ((v.0 >> 20) & 0x3FF) as u32,
            ((v.0 >> 10) & 0x3FF) as u32,
            (v.0 & 0x3FF) as u32,
        )
    }
}

impl fmt::Display for SourceVersionTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (a, b, c, d, e) = (*self).into();

        if e != 0 {
            write!(f, "{}.{}.{}.{}.{}", a, b, c, d, e)
        } else if d != 0 {
            write!(f, "{}.{}.{}.{}", a, b, c, d)
        } else if c != 0 {
            write!(f, "{}.{}.{}", a, b, c)
        } else {
            write!(f, "{}.{}", a, b)
        }
    }
}

/// The min OS version on which this binary was built to run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildTarget {
    MacOsX,
    IPhoneOs,
    WatchOs,
    TvOs,
}

impl BuildTarget {
    pub fn from_cmd(cmd: u32) -> Option<Self> {
        match cmd {
            LC_VERSION_MIN_MACOSX => Some(BuildTarget::MacOsX),
            LC_VERSION_MIN_IPHONEOS => Some(BuildTarget::IPhoneOs),
            LC_VERSION_MIN_WATCHOS => Some(BuildTarget::WatchOs),
            LC_VERSION_MIN_TVOS => Some(BuildTarget::TvOs),
            _ => None,
        }
    }

    pub fn cmd(self) -> u32 {
        match self {
            BuildTarget::MacOsX => LC_VERSION_MIN_MACOSX,
            BuildTarget::IPhoneOs => LC_VERSION_MIN_IPHONEOS,
            BuildTarget::WatchOs => LC_VERSION_MIN_WATCHOS,
            BuildTarget::TvOs => LC_VERSION_MIN_TVOS,
        }
    }

    /// The `LC_BUILD_VERSION` platform this legacy command corresponds to.
    pub fn platform(self) -> u32 {
        match self {
            BuildTarget::MacOsX => PLATFORM_MACOS,
            BuildTarget::IPhoneOs => PLATFORM_IOS,
            BuildTarget::WatchOs => PLATFORM_WATCHOS,
            BuildTarget::TvOs => PLATFORM_TVOS,
        }
    }
}

/// A tool used to build the image, from `LC_BUILD_VERSION`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BuildTool {
    pub tool: u32,
    pub version: VersionTag,
}

/// A variable length string in a load command.
///
/// The first field is the offset of the string from the start of the command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LcString(pub usize, pub String);

impl LcString {
    pub const BAD_NAME: &'static str = "<bad dylib name>";

    pub fn offset(&self) -> usize {
        self.0
    }

    pub fn as_str(&self) -> &str {
        self.1.as_str()
    }

    /// Read the string at `off` inside the raw command bytes.
    ///
    /// An offset pointing outside the command yields a placeholder name.
    fn parse(cmd: &[u8], off: usize) -> LcString {
        if off < LOAD_COMMAND_HEADER_SIZE || off >= cmd.len() {
            warn!("load command string offset {} outside of {} bytes command", off, cmd.len());

            return LcString(off, Self::BAD_NAME.to_owned());
        }

        let raw = &cmd[off..];
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

        LcString(off, String::from_utf8_lossy(&raw[..len]).into_owned())
    }
}

impl fmt::Display for LcString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.1)
    }
}

impl Deref for LcString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.1.as_str()
    }
}

/// Dynamically linked shared libraries are identified by two things.
///
/// The pathname (the name of the library as found for execution), and the
/// compatibility version number.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DyLib {
    /// library's path name
    pub name: LcString,
    /// library's build time stamp
    pub timestamp: u32,
    /// library's current version number
    pub current_version: VersionTag,
    /// library's compatibility vers number
    pub compatibility_version: VersionTag,
}

/// The `LinkEditData` contains the offsets and sizes of a blob
/// of data in the __LINKEDIT segment.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct LinkEditData {
    /// file offset of data in __LINKEDIT segment
    pub off: u32,
    /// file size of data in __LINKEDIT segment
    pub size: u32,
}

bitflags! {
    pub struct SegmentFlags: u32 {
        const HIGHVM = SG_HIGHVM;
        const FVMLIB = SG_FVMLIB;
        const NORELOC = SG_NORELOC;
        const PROTECTED_VERSION_1 = SG_PROTECTED_VERSION_1;
        const READ_ONLY = SG_READ_ONLY;
    }
}

bitflags! {
    pub struct SectionAttributes: u32 {
        const PURE_INSTRUCTIONS = S_ATTR_PURE_INSTRUCTIONS;
        const NO_TOC = S_ATTR_NO_TOC;
        const STRIP_STATIC_SYMS = S_ATTR_STRIP_STATIC_SYMS;
        const NO_DEAD_STRIP = S_ATTR_NO_DEAD_STRIP;
        const LIVE_SUPPORT = S_ATTR_LIVE_SUPPORT;
        const SELF_MODIFYING_CODE = S_ATTR_SELF_MODIFYING_CODE;
        const DEBUG = S_ATTR_DEBUG;
        const SOME_INSTRUCTIONS = S_ATTR_SOME_INSTRUCTIONS;
        const EXT_RELOC = S_ATTR_EXT_RELOC;
        const LOC_RELOC = S_ATTR_LOC_RELOC;
    }
}

/// The flags field of a section structure is separated into two parts a section
/// type and section attributes.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SectionFlags(pub u32);

impl SectionFlags {
    pub fn sect_type(self) -> u32 {
        self.0 & SECTION_TYPE
    }

    pub fn sect_attrs(self) -> SectionAttributes {
        SectionAttributes::from_bits_truncate(self.0 & SECTION_ATTRIBUTES)
    }
}

impl From<SectionFlags> for u32 {
    fn from(flags: SectionFlags) -> u32 {
        flags.0
    }
}

/// A section, normalized to the 64-bit layout.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Section {
    /// name of this section
    pub sectname: String,
    /// segment this section goes in
    pub segname: String,
    /// memory address of this section
    pub addr: u64,
    /// size in bytes of this section
    pub size: u64,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    /// file offset of relocation entries
    pub reloff: u32,
    /// number of relocation entries
    pub nreloc: u32,
    // flags (section type and attributes)
    pub flags: SectionFlags,
    /// reserved (for offset or index)
    pub reserved1: u32,
    /// reserved (for count or sizeof)
    pub reserved2: u32,
    /// reserved
    pub reserved3: u32,
}

impl Section {
    pub const SIZE_32: usize = 68;
    pub const SIZE_64: usize = 80;

    fn parse_section<O: ByteOrder, T: AsRef<[u8]>>(buf: &mut Cursor<T>) -> Result<Section> {
        buf.ensure(Self::SIZE_32)?;

        Ok(Section {
            sectname: buf.read_fixed_size_string(16)?,
            segname: buf.read_fixed_size_string(16)?,
            addr: u64::from(buf.read_u32::<O>()?),
            size: u64::from(buf.read_u32::<O>()?),
            offset: buf.read_u32::<O>()?,
            align: buf.read_u32::<O>()?,
            reloff: buf.read_u32::<O>()?,
            nreloc: buf.read_u32::<O>()?,
            flags: SectionFlags(buf.read_u32::<O>()?),
            reserved1: buf.read_u32::<O>()?,
            reserved2: buf.read_u32::<O>()?,
            reserved3: 0,
        })
    }

    fn parse_section64<O: ByteOrder, T: AsRef<[u8]>>(buf: &mut Cursor<T>) -> Result<Section> {
        buf.ensure(Self::SIZE_64)?;

        Ok(Section {
            sectname: buf.read_fixed_size_string(16)?,
            segname: buf.read_fixed_size_string(16)?,
            addr: buf.read_u64::<O>()?,
            size: buf.read_u64::<O>()?,
            offset: buf.read_u32::<O>()?,
            align: buf.read_u32::<O>()?,
            reloff: buf.read_u32::<O>()?,
            nreloc: buf.read_u32::<O>()?,
            flags: SectionFlags(buf.read_u32::<O>()?),
            reserved1: buf.read_u32::<O>()?,
            reserved2: buf.read_u32::<O>()?,
            reserved3: buf.read_u32::<O>()?,
        })
    }

    /// Whether the section holds machine code.
    pub fn is_code(&self) -> bool {
        let attrs = self.flags.sect_attrs();

        attrs.intersects(SectionAttributes::PURE_INSTRUCTIONS | SectionAttributes::SOME_INSTRUCTIONS)
            || self.segname == SEG_TEXT
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.addr <= addr && addr < self.addr.saturating_add(self.size)
    }

    pub fn end(&self) -> u64 {
        self.addr.saturating_add(self.size)
    }
}

/// A segment, normalized to the 64-bit layout whatever the image bitness.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Segment {
    pub segname: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: vm_prot_t,
    pub initprot: vm_prot_t,
    pub nsects: u32,
    pub flags: SegmentFlags,
    pub sections: Vec<Section>,
}

impl Default for SegmentFlags {
    fn default() -> Self {
        SegmentFlags::empty()
    }
}

impl Segment {
    pub const SIZE_32: usize = 56;
    pub const SIZE_64: usize = 72;

    /// A zero page maps nothing from the file and is never accessible.
    pub fn is_zeropage(&self) -> bool {
        self.vmsize == 0 || (self.vmaddr == 0 && self.fileoff == 0 && self.initprot == 0)
    }

    /// `__TEXT`, `TEXT`, `___text`... any leading underscores, case insensitive.
    pub fn is_text(&self) -> bool {
        self.segname.trim_start_matches('_').eq_ignore_ascii_case("TEXT")
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.vmaddr <= addr && addr < self.end()
    }

    pub fn end(&self) -> u64 {
        self.vmaddr.saturating_add(self.vmsize)
    }

    pub fn is_readable(&self) -> bool {
        (self.initprot & VM_PROT_READ) != 0
    }

    pub fn is_executable(&self) -> bool {
        (self.initprot & VM_PROT_EXECUTE) != 0
    }

    fn parse<O: ByteOrder, T: AsRef<[u8]>>(buf: &mut Cursor<T>, is_64bit: bool, cmdsize: usize) -> Result<Segment> {
        let begin = buf.position() - LOAD_COMMAND_HEADER_SIZE as u64;
        let (header_size, section_size) = if is_64bit {
            (Self::SIZE_64, Section::SIZE_64)
        } else {
            (Self::SIZE_32, Section::SIZE_32)
        };

        buf.ensure(header_size - LOAD_COMMAND_HEADER_SIZE)?;

        let segname = buf.read_fixed_size_string(16)?;
        let (vmaddr, vmsize, fileoff, filesize) = if is_64bit {
            (
                buf.read_u64::<O>()?,
                buf.read_u64::<O>()?,
                buf.read_u64::<O>()?,
                buf.read_u64::<O>()?,
            )
        } else {
            (
                u64::from(buf.read_u32::<O>()?),
                u64::from(buf.read_u32::<O>()?),
                u64::from(buf.read_u32::<O>()?),
                u64::from(buf.read_u32::<O>()?),
            )
        };
        let maxprot = buf.read_i32::<O>()?;
        let initprot = buf.read_i32::<O>()?;
        let nsects = buf.read_u32::<O>()?;
        let flags = buf.read_u32::<O>()?;

        if header_size as u64 + u64::from(nsects) * section_size as u64 > cmdsize as u64 {
            return Err(Error::malformed(
                begin,
                format!("inconsistent number of sections {} in segment {}", nsects, segname),
            ));
        }

        let sections = (0..nsects)
            .map(|_| {
                if is_64bit {
                    Section::parse_section64::<O, T>(buf)
                } else {
                    Section::parse_section::<O, T>(buf)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Segment {
            segname,
            vmaddr,
            vmsize,
            fileoff,
            filesize,
            maxprot,
            initprot,
            nsects,
            flags: SegmentFlags::from_bits_truncate(flags),
            sections,
        })
    }
}

/// The load commands directly follow the mach header.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadCommand {
    /// A 32-bit segment, upgraded to the 64-bit layout.
    Segment(Segment),
    Segment64(Segment),

    IdDyLib(DyLib),
    LoadDyLib(DyLib),
    LoadWeakDyLib(DyLib),
    ReexportDyLib(DyLib),
    LoadUpwardDylib(DyLib),
    LazyLoadDylib(DyLib),

    Rpath(String),

    IdDyLinker(LcString),
    LoadDyLinker(LcString),
    DyLdEnv(LcString),

    SubFramework(LcString),
    SubUmbrella(LcString),
    SubClient(LcString),
    SubLibrary(LcString),

    SymTab {
        symoff: u32,
        nsyms: u32,
        stroff: u32,
        strsize: u32,
    },
    DySymTab {
        ilocalsym: u32,
        nlocalsym: u32,
        iextdefsym: u32,
        nextdefsym: u32,
        iundefsym: u32,
        nundefsym: u32,
        tocoff: u32,
        ntoc: u32,
        modtaboff: u32,
        nmodtab: u32,
        extrefsymoff: u32,
        nextrefsyms: u32,
        indirectsymoff: u32,
        nindirectsyms: u32,
        extreloff: u32,
        nextrel: u32,
        locreloff: u32,
        nlocrel: u32,
    },

    Uuid(Uuid),

    CodeSignature(LinkEditData),
    SegmentSplitInfo(LinkEditData),
    FunctionStarts(LinkEditData),
    DataInCode(LinkEditData),
    DylibCodeSignDrs(LinkEditData),
    LinkerOptimizationHint(LinkEditData),
    DyldExportsTrie(LinkEditData),
    DyldChainedFixups(LinkEditData),

    VersionMin {
        target: BuildTarget,
        version: VersionTag,
        sdk: VersionTag,
    },
    BuildVersion {
        platform: u32,
        minos: VersionTag,
        sdk: VersionTag,
        tools: Vec<BuildTool>,
    },

    DyldInfo {
        only: bool,
        rebase_off: u32,
        rebase_size: u32,
        bind_off: u32,
        bind_size: u32,
        weak_bind_off: u32,
        weak_bind_size: u32,
        lazy_bind_off: u32,
        lazy_bind_size: u32,
        export_off: u32,
        export_size: u32,
    },

    EntryPoint {
        entryoff: u64,
        stacksize: u64,
    },
    SourceVersion(SourceVersionTag),

    /// `LC_THREAD` or `LC_UNIXTHREAD`, the raw state is kept as is.
    Thread {
        unix: bool,
        flavor: u32,
        count: u32,
        pc: Option<u64>,
        state: Vec<u8>,
    },

    EncryptionInfo {
        is_64bit: bool,
        cryptoff: u32,
        cryptsize: u32,
        cryptid: u32,
    },

    LinkerOption(Vec<String>),

    /// A command this crate does not decode, or failed to decode.
    Command {
        cmd: u32,
        payload: Vec<u8>,
    },
}

pub(crate) const LOAD_COMMAND_HEADER_SIZE: usize = 8; // cmd + cmdsize

impl LoadCommand {
    /// Parse the command at the cursor position.
    ///
    /// Framing errors (bad `cmdsize`, command past the end of `buf`) are returned
    /// as errors and stop the enumeration. A command whose body fails to decode
    /// is kept as `LoadCommand::Command` so the enumeration can continue.
    pub fn parse<O: ByteOrder, T: AsRef<[u8]>>(
        header: &MachHeader,
        buf: &mut Cursor<T>,
    ) -> Result<(LoadCommand, usize)> {
        let begin = buf.position();

        buf.ensure(LOAD_COMMAND_HEADER_SIZE)?;

        let cmd = buf.read_u32::<O>()?;
        let cmdsize = buf.read_u32::<O>()? as usize;

        if cmdsize == 0 {
            buf.set_position(begin);

            return Err(Error::malformed(begin, "load command size zero"));
        }
        if cmdsize % 4 != 0 || cmdsize < LOAD_COMMAND_HEADER_SIZE {
            buf.set_position(begin);

            return Err(Error::malformed(
                begin,
                format!("load command {} size {} not a multiple of 4", Self::cmd_name(cmd), cmdsize),
            ));
        }
        if begin as usize + cmdsize > buf.get_ref().as_ref().len() {
            let available = buf.get_ref().as_ref().len() - begin as usize;

            buf.set_position(begin);

            return Err(Error::Truncated {
                offset: begin,
                needed: cmdsize,
                available,
            });
        }

        let raw = &buf.get_ref().as_ref()[begin as usize..begin as usize + cmdsize];
        let command = match Self::parse_body::<O>(header, cmd, raw) {
            Ok(command) => command,
            Err(err) => {
                warn!(
                    "skip malformed {} command at 0x{:x} with {} bytes, {}",
                    Self::cmd_name(cmd),
                    begin,
                    cmdsize,
                    err
                );

                LoadCommand::Command {
                    cmd,
                    payload: raw[LOAD_COMMAND_HEADER_SIZE..].to_vec(),
                }
            }
        };

        trace!("parsed {} command with {} bytes", command.name(), cmdsize);

        buf.set_position(begin + cmdsize as u64);

        Ok((command, cmdsize))
    }

    fn parse_body<O: ByteOrder>(header: &MachHeader, cmd: u32, raw: &[u8]) -> Result<LoadCommand> {
        let cmdsize = raw.len();
        let mut buf = Cursor::new(raw);

        buf.set_position(LOAD_COMMAND_HEADER_SIZE as u64);

        let command = match cmd {
            LC_SEGMENT => LoadCommand::Segment(Segment::parse::<O, _>(&mut buf, false, cmdsize)?),
            LC_SEGMENT_64 => LoadCommand::Segment64(Segment::parse::<O, _>(&mut buf, true, cmdsize)?),

            LC_ID_DYLIB => LoadCommand::IdDyLib(Self::read_dylib::<O>(&mut buf)?),
            LC_LOAD_DYLIB => LoadCommand::LoadDyLib(Self::read_dylib::<O>(&mut buf)?),
            LC_LOAD_WEAK_DYLIB => LoadCommand::LoadWeakDyLib(Self::read_dylib::<O>(&mut buf)?),
            LC_REEXPORT_DYLIB => LoadCommand::ReexportDyLib(Self::read_dylib::<O>(&mut buf)?),
            LC_LOAD_UPWARD_DYLIB => LoadCommand::LoadUpwardDylib(Self::read_dylib::<O>(&mut buf)?),
            LC_LAZY_LOAD_DYLIB => LoadCommand::LazyLoadDylib(Self::read_dylib::<O>(&mut buf)?),
            LC_RPATH => LoadCommand::Rpath(Self::read_lc_string::<O>(&mut buf)?.1),

            LC_ID_DYLINKER => LoadCommand::IdDyLinker(Self::read_lc_string::<O>(&mut buf)?),
            LC_LOAD_DYLINKER => LoadCommand::LoadDyLinker(Self::read_lc_string::<O>(&mut buf)?),
            LC_DYLD_ENVIRONMENT => LoadCommand::DyLdEnv(Self::read_lc_string::<O>(&mut buf)?),

            LC_SUB_FRAMEWORK => LoadCommand::SubFramework(Self::read_lc_string::<O>(&mut buf)?),
            LC_SUB_UMBRELLA => LoadCommand::SubUmbrella(Self::read_lc_string::<O>(&mut buf)?),
            LC_SUB_CLIENT => LoadCommand::SubClient(Self::read_lc_string::<O>(&mut buf)?),
            LC_SUB_LIBRARY => LoadCommand::SubLibrary(Self::read_lc_string::<O>(&mut buf)?),

            LC_SYMTAB => {
                buf.ensure(16)?;

                LoadCommand::SymTab {
                    symoff: buf.read_u32::<O>()?,
                    nsyms: buf.read_u32::<O>()?,
                    stroff: buf.read_u32::<O>()?,
                    strsize: buf.read_u32::<O>()?,
                }
            }
            LC_DYSYMTAB => {
                buf.ensure(72)?;

                LoadCommand::DySymTab {
                    ilocalsym: buf.read_u32::<O>()?,
                    nlocalsym: buf.read_u32::<O>()?,
                    iextdefsym: buf.read_u32::<O>()?,
                    nextdefsym: buf.read_u32::<O>()?,
                    iundefsym: buf.read_u32::<O>()?,
                    nundefsym: buf.read_u32::<O>()?,
                    tocoff: buf.read_u32::<O>()?,
                    ntoc: buf.read_u32::<O>()?,
                    modtaboff: buf.read_u32::<O>()?,
                    nmodtab: buf.read_u32::<O>()?,
                    extrefsymoff: buf.read_u32::<O>()?,
                    nextrefsyms: buf.read_u32::<O>()?,
                    indirectsymoff: buf.read_u32::<O>()?,
                    nindirectsyms: buf.read_u32::<O>()?,
                    extreloff: buf.read_u32::<O>()?,
                    nextrel: buf.read_u32::<O>()?,
                    locreloff: buf.read_u32::<O>()?,
                    nlocrel: buf.read_u32::<O>()?,
                }
            }
            LC_UUID => {
                let mut uuid = [0; 16];

                buf.safe_copy(&mut uuid[..])?;

                LoadCommand::Uuid(Uuid::from_bytes(uuid))
            }
            LC_CODE_SIGNATURE => LoadCommand::CodeSignature(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_SEGMENT_SPLIT_INFO => LoadCommand::SegmentSplitInfo(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_FUNCTION_STARTS => LoadCommand::FunctionStarts(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_DATA_IN_CODE => LoadCommand::DataInCode(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_DYLIB_CODE_SIGN_DRS => LoadCommand::DylibCodeSignDrs(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_LINKER_OPTIMIZATION_HINT => {
                LoadCommand::LinkerOptimizationHint(Self::read_linkedit_data::<O>(&mut buf)?)
            }
            LC_DYLD_EXPORTS_TRIE => LoadCommand::DyldExportsTrie(Self::read_linkedit_data::<O>(&mut buf)?),
            LC_DYLD_CHAINED_FIXUPS => LoadCommand::DyldChainedFixups(Self::read_linkedit_data::<O>(&mut buf)?),

            LC_VERSION_MIN_MACOSX | LC_VERSION_MIN_IPHONEOS | LC_VERSION_MIN_WATCHOS | LC_VERSION_MIN_TVOS => {
                buf.ensure(8)?;

                LoadCommand::VersionMin {
                    target: BuildTarget::from_cmd(cmd).unwrap_or(BuildTarget::MacOsX),
                    version: VersionTag(buf.read_u32::<O>()?),
                    sdk: VersionTag(buf.read_u32::<O>()?),
                }
            }
            LC_BUILD_VERSION => {
                buf.ensure(16)?;

                let platform = buf.read_u32::<O>()?;
                let minos = VersionTag(buf.read_u32::<O>()?);
                let sdk = VersionTag(buf.read_u32::<O>()?);
                let ntools = buf.read_u32::<O>()?;

                if u64::from(ntools) * 8 > buf.remaining() as u64 {
                    return Err(Error::malformed(0, format!("too many build tools, {}", ntools)));
                }

                let tools = (0..ntools)
                    .map(|_| {
                        Ok(BuildTool {
                            tool: buf.read_u32::<O>()?,
                            version: VersionTag(buf.read_u32::<O>()?),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;

                LoadCommand::BuildVersion {
                    platform,
                    minos,
                    sdk,
                    tools,
                }
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                buf.ensure(40)?;

                LoadCommand::DyldInfo {
                    only: cmd == LC_DYLD_INFO_ONLY,
                    rebase_off: buf.read_u32::<O>()?,
                    rebase_size: buf.read_u32::<O>()?,
                    bind_off: buf.read_u32::<O>()?,
                    bind_size: buf.read_u32::<O>()?,
                    weak_bind_off: buf.read_u32::<O>()?,
                    weak_bind_size: buf.read_u32::<O>()?,
                    lazy_bind_off: buf.read_u32::<O>()?,
                    lazy_bind_size: buf.read_u32::<O>()?,
                    export_off: buf.read_u32::<O>()?,
                    export_size: buf.read_u32::<O>()?,
                }
            }
            LC_MAIN => {
                buf.ensure(16)?;

                LoadCommand::EntryPoint {
                    entryoff: buf.read_u64::<O>()?,
                    stacksize: buf.read_u64::<O>()?,
                }
            }
            LC_SOURCE_VERSION => {
                buf.ensure(8)?;

                LoadCommand::SourceVersion(SourceVersionTag(buf.read_u64::<O>()?))
            }
            LC_THREAD | LC_UNIXTHREAD => {
                buf.ensure(8)?;

                let flavor = buf.read_u32::<O>()?;
                let count = buf.read_u32::<O>()?;
                let state = raw[buf.position() as usize..].to_vec();
                let pc = Self::thread_pc::<O>(header.cputype, flavor, &state);

                LoadCommand::Thread {
                    unix: cmd == LC_UNIXTHREAD,
                    flavor,
                    count,
                    pc,
                    state,
                }
            }
            LC_ENCRYPTION_INFO | LC_ENCRYPTION_INFO_64 => {
                buf.ensure(12)?;

                LoadCommand::EncryptionInfo {
                    is_64bit: cmd == LC_ENCRYPTION_INFO_64,
                    cryptoff: buf.read_u32::<O>()?,
                    cryptsize: buf.read_u32::<O>()?,
                    cryptid: buf.read_u32::<O>()?,
                }
            }
            LC_LINKER_OPTION => {
                buf.ensure(4)?;

                let count = buf.read_u32::<O>()?;
                let mut options = Vec::new();

                for _ in 0..count {
                    if buf.remaining() == 0 {
                        break;
                    }

                    options.push(buf.read_cstr()?);
                }

                LoadCommand::LinkerOption(options)
            }
            _ => {
                let payload = raw[LOAD_COMMAND_HEADER_SIZE..].to_vec();

                debug!(
                    "load unsupported {} command with {} bytes payload",
                    Self::cmd_name(cmd),
                    payload.len()
                );

                LoadCommand::Command { cmd, payload }
            }
        };

        Ok(command)
    }

    /// Locate the program counter inside a thread state.
    fn thread_pc<O: ByteOrder>(cputype: cpu_type_t, flavor: u32, state: &[u8]) -> Option<u64> {
        let (offset, is_64bit) = match (cputype, flavor) {
            (CPU_TYPE_I386, X86_THREAD_STATE32) => (10 * 4, false),
            (CPU_TYPE_X86_64, X86_THREAD_STATE64) => (16 * 8, true),
            (CPU_TYPE_ARM, ARM_THREAD_STATE) => (15 * 4, false),
            (CPU_TYPE_ARM64, ARM_THREAD_STATE64) => (32 * 8, true),
            _ => return None,
        };

        if is_64bit {
            state.get(offset..offset + 8).map(O::read_u64)
        } else {
            state.get(offset..offset + 4).map(|b| u64::from(O::read_u32(b)))
        }
    }

    fn read_lc_string<O: ByteOrder>(buf: &mut Cursor<&[u8]>) -> Result<LcString> {
        buf.ensure(4)?;

        let off = buf.read_u32::<O>()? as usize;

        Ok(LcString::parse(buf.get_ref(), off))
    }

    fn read_dylib<O: ByteOrder>(buf: &mut Cursor<&[u8]>) -> Result<DyLib> {
        buf.ensure(16)?;

        let off = buf.read_u32::<O>()? as usize;
        let timestamp = buf.read_u32::<O>()?;
        let current_version = buf.read_u32::<O>()?;
        let compatibility_version = buf.read_u32::<O>()?;

        Ok(DyLib {
            name: LcString::parse(buf.get_ref(), off),
            timestamp,
            current_version: VersionTag(current_version),
            compatibility_version: VersionTag(compatibility_version),
        })
    }

    fn read_linkedit_data<O: ByteOrder>(buf: &mut Cursor<&[u8]>) -> Result<LinkEditData> {
        buf.ensure(8)?;

        Ok(LinkEditData {
            off: buf.read_u32::<O>()?,
            size: buf.read_u32::<O>()?,
        })
    }

    pub fn cmd(&self) -> u32 {
        match *self {
            LoadCommand::Segment(_) => LC_SEGMENT,
            LoadCommand::Segment64(_) => LC_SEGMENT_64,
            LoadCommand::IdDyLib(_) => LC_ID_DYLIB,
            LoadCommand::LoadDyLib(_) => LC_LOAD_DYLIB,
            LoadCommand::LoadWeakDyLib(_) => LC_LOAD_WEAK_DYLIB,
            LoadCommand::ReexportDyLib(_) => LC_REEXPORT_DYLIB,
            LoadCommand::LoadUpwardDylib(_) => LC_LOAD_UPWARD_DYLIB,
            LoadCommand::LazyLoadDylib(_) => LC_LAZY_LOAD_DYLIB,
            LoadCommand::Rpath(_) => LC_RPATH,
            LoadCommand::IdDyLinker(_) => LC_ID_DYLINKER,
            LoadCommand::LoadDyLinker(_) => LC_LOAD_DYLINKER,
            LoadCommand::DyLdEnv(_) => LC_DYLD_ENVIRONMENT,
            LoadCommand::SubFramework(_) => LC_SUB_FRAMEWORK,
            LoadCommand::SubUmbrella(_) => LC_SUB_UMBRELLA,
            LoadCommand::SubClient(_) => LC_SUB_CLIENT,
            LoadCommand::SubLibrary(_) => LC_SUB_LIBRARY,
            LoadCommand::SymTab { .. } => LC_SYMTAB,
            LoadCommand::DySymTab { .. } => LC_DYSYMTAB,
            LoadCommand::Uuid(_) => LC_UUID,
            LoadCommand::CodeSignature(_) => LC_CODE_SIGNATURE,
            LoadCommand::SegmentSplitInfo(_) => LC_SEGMENT_SPLIT_INFO,
            LoadCommand::FunctionStarts(_) => LC_FUNCTION_STARTS,
            LoadCommand::DataInCode(_) => LC_DATA_IN_CODE,
            LoadCommand::DylibCodeSignDrs(_) => LC_DYLIB_CODE_SIGN_DRS,
            LoadCommand::LinkerOptimizationHint(_) => LC_LINKER_OPTIMIZATION_HINT,
            LoadCommand::DyldExportsTrie(_) => LC_DYLD_EXPORTS_TRIE,
            LoadCommand::DyldChainedFixups(_) => LC_DYLD_CHAINED_FIXUPS,
            LoadCommand::VersionMin { target, .. } => target.cmd(),
            LoadCommand::BuildVersion { .. } => LC_BUILD_VERSION,
            LoadCommand::DyldInfo { only: true, .. } => LC_DYLD_INFO_ONLY,
            LoadCommand::DyldInfo { only: false, .. } => LC_DYLD_INFO,
            LoadCommand::EntryPoint { .. } => LC_MAIN,
            LoadCommand::SourceVersion(_) => LC_SOURCE_VERSION,
            LoadCommand::Thread { unix: true, .. } => LC_UNIXTHREAD,
            LoadCommand::Thread { unix: false, .. } => LC_THREAD,
            LoadCommand::EncryptionInfo { is_64bit: true, .. } => LC_ENCRYPTION_INFO_64,
            LoadCommand::EncryptionInfo { is_64bit: false, .. } => LC_ENCRYPTION_INFO,
            LoadCommand::LinkerOption(_) => LC_LINKER_OPTION,
            LoadCommand::Command { cmd, .. } => cmd,
        }
    }

    pub fn name(&self) -> &'static str {
        Self::cmd_name(self.cmd())
    }

    /// The dylib carried by any of the dylib family commands.
    pub fn dylib(&self) -> Option<&DyLib> {
        match self {
            LoadCommand::IdDyLib(dylib)
            | LoadCommand::LoadDyLib(dylib)
            | LoadCommand::LoadWeakDyLib(dylib)
            | LoadCommand::ReexportDyLib(dylib)
            | LoadCommand::LoadUpwardDylib(dylib)
            | LoadCommand::LazyLoadDylib(dylib) => Some(dylib),
            _ => None,
        }
    }

    pub fn cmd_name(cmd: u32) -> &'static str {
        match cmd {
            LC_SEGMENT => "LC_SEGMENT",
            LC_SYMTAB => "LC_SYMTAB",
            LC_SYMSEG => "LC_SYMSEG",
            LC_THREAD => "LC_THREAD",
            LC_UNIXTHREAD => "LC_UNIXTHREAD",
            LC_LOADFVMLIB => "LC_LOADFVMLIB",
            LC_IDFVMLIB => "LC_IDFVMLIB",
            LC_IDENT => "LC_IDENT",
            LC_FVMFILE => "LC_FVMFILE",
            LC_PREPAGE => "LC_PREPAGE",
            LC_DYSYMTAB => "LC_DYSYMTAB",
            LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
            LC_ID_DYLIB => "LC_ID_DYLIB",
            LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
            LC_ID_DYLINKER => "LC_ID_DYLINKER",
            LC_PREBOUND_DYLIB => "LC_PREBOUND_DYLIB",
            LC_ROUTINES => "LC_ROUTINES",
            LC_SUB_FRAMEWORK => "LC_SUB_FRAMEWORK",
            LC_SUB_UMBRELLA => "LC_SUB_UMBRELLA",
            LC_SUB_CLIENT => "LC_SUB_CLIENT",
            LC_SUB_LIBRARY => "LC_SUB_LIBRARY",
            LC_TWOLEVEL_HINTS => "LC_TWOLEVEL_HINTS",
            LC_PREBIND_CKSUM => "LC_PREBIND_CKSUM",
            LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
            LC_SEGMENT_64 => "LC_SEGMENT_64",
            LC_ROUTINES_64 => "LC_ROUTINES_64",
            LC_UUID => "LC_UUID",
            LC_RPATH => "LC_RPATH",
            LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
            LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
            LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
            LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
            LC_ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
            LC_DYLD_INFO => "LC_DYLD_INFO",
            LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
            LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
            LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
            LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
            LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
            LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
            LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
            LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
            LC_MAIN => "LC_MAIN",
            LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
            LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
            LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
            LC_ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
            LC_LINKER_OPTION => "LC_LINKER_OPTION",
            LC_LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
            LC_NOTE => "LC_NOTE",
            LC_BUILD_VERSION => "LC_BUILD_VERSION",
            LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
            LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
            _ => "LC_COMMAND",
        }
    }
}

#[cfg(test)]
pub mod tests {
    use std::io::Cursor;

    use byteorder::{BigEndian, LittleEndian};

    use super::*;
    use crate::testdata::*;

    macro_rules! parse_command {
        ($buf:expr) => {{
            let header = MachHeader::default();
            let mut cur = Cursor::new($buf);

            LoadCommand::parse::<LittleEndian, _>(&header, &mut cur).unwrap()
        }};
    }

    #[test]
    fn test_parse_segment64() {
        let cmd = segment64_command(
            "__TEXT",
            0x1000,
            0x2000,
            0,
            0x2000,
            5,
            &[("__text", 0x1100, 0x100, 0x100, S_ATTR_PURE_INSTRUCTIONS)],
        );

        if let (LoadCommand::Segment64(seg), cmdsize) = parse_command!(cmd.clone()) {
            assert_eq!(cmdsize, cmd.len());
            assert_eq!(seg.segname, "__TEXT");
            assert_eq!(seg.vmaddr, 0x1000);
            assert_eq!(seg.vmsize, 0x2000);
            assert_eq!(seg.initprot, 5);
            assert_eq!(seg.sections.len(), 1);
            assert_eq!(seg.sections[0].sectname, "__text");
            assert_eq!(seg.sections[0].addr, 0x1100);
            assert!(seg.sections[0].is_code());
            assert!(seg.is_text());
            assert!(!seg.is_zeropage());
        } else {
            panic!();
        }
    }

    #[test]
    fn test_segment32_is_normalized() {
        let cmd32 = segment32_command("__DATA", 0x4000, 0x1000, 0x3000, 0x1000, 3, &[("__data", 0x4000, 0x20, 0x3000, 0)]);
        let cmd64 = segment64_command("__DATA", 0x4000, 0x1000, 0x3000, 0x1000, 3, &[("__data", 0x4000, 0x20, 0x3000, 0)]);

        match (parse_command!(cmd32).0, parse_command!(cmd64).0) {
            (LoadCommand::Segment(seg32), LoadCommand::Segment64(seg64)) => {
                assert_eq!(seg32, seg64);
            }
            r => panic!("unexpected {:?}", r),
        }
    }

    #[test]
    fn test_inconsistent_section_count_keeps_raw_command() {
        let mut cmd = segment64_command("__TEXT", 0x1000, 0x1000, 0, 0x1000, 5, &[]);

        // claim 3 sections in a command without room for any
        cmd[64..68].copy_from_slice(&3u32.to_le_bytes());

        if let (LoadCommand::Command { cmd, payload }, cmdsize) = parse_command!(cmd) {
            assert_eq!(cmd, LC_SEGMENT_64);
            assert_eq!(payload.len(), cmdsize - 8);
        } else {
            panic!();
        }
    }

    #[test]
    fn test_parse_uuid_command() {
        if let (LoadCommand::Uuid(uuid), 24) = parse_command!(uuid_command([0xAB; 16])) {
            assert_eq!(uuid.as_bytes(), &[0xAB; 16]);
        } else {
            panic!();
        }
    }

    #[test]
    fn test_parse_dylib_command() {
        if let (LoadCommand::ReexportDyLib(dylib), _) =
            parse_command!(dylib_command(LC_REEXPORT_DYLIB, "/usr/lib/libSystem.B.dylib"))
        {
            assert_eq!(dylib.name.as_str(), "/usr/lib/libSystem.B.dylib");
            assert_eq!(dylib.current_version, VersionTag(0x10000));
        } else {
            panic!();
        }
    }

    #[test]
    fn test_bad_dylib_name_offset() {
        let mut cmd = dylib_command(LC_LOAD_DYLIB, "/usr/lib/libfoo.dylib");

        cmd[8..12].copy_from_slice(&0x400u32.to_le_bytes());

        if let (LoadCommand::LoadDyLib(dylib), _) = parse_command!(cmd) {
            assert_eq!(dylib.name.as_str(), LcString::BAD_NAME);
        } else {
            panic!();
        }
    }

    #[test]
    fn test_parse_build_version() {
        if let (
            LoadCommand::BuildVersion {
                platform,
                minos,
                sdk,
                tools,
            },
            _,
        ) = parse_command!(build_version_command(PLATFORM_IOS, 0x000c0000, 0x000d0100, &[(TOOL_LD, 0x02000000)]))
        {
            assert_eq!(platform, PLATFORM_IOS);
            assert_eq!(minos.to_string(), "12.0");
            assert_eq!(sdk.to_string(), "13.1");
            assert_eq!(tools, vec![BuildTool { tool: TOOL_LD, version: VersionTag(0x02000000) }]);
        } else {
            panic!();
        }
    }

    #[test]
    fn test_parse_unixthread_pc() {
        let header = MachHeader {
            cputype: CPU_TYPE_ARM64,
            ..MachHeader::default()
        };
        let mut state = vec![0u8; 34 * 8];

        state[256..264].copy_from_slice(&0xfffffff007004000u64.to_le_bytes());

        let cmd = raw_command(LC_UNIXTHREAD, &[&6u32.to_le_bytes()[..], &68u32.to_le_bytes()[..], &state[..]].concat());
        let mut cur = Cursor::new(cmd);

        if let (LoadCommand::Thread { unix, flavor, pc, .. }, _) =
            LoadCommand::parse::<LittleEndian, _>(&header, &mut cur).unwrap()
        {
            assert!(unix);
            assert_eq!(flavor, ARM_THREAD_STATE64);
            assert_eq!(pc, Some(0xfffffff007004000));
        } else {
            panic!();
        }
    }

    #[test]
    fn test_parse_big_endian_symtab() {
        let mut cmd = Vec::new();

        for v in &[LC_SYMTAB, 24, 0x100, 3, 0x200, 0x40] {
            cmd.extend_from_slice(&v.to_be_bytes());
        }

        let header = MachHeader::default();
        let mut cur = Cursor::new(cmd);

        assert_eq!(
            LoadCommand::parse::<BigEndian, _>(&header, &mut cur).unwrap(),
            (
                LoadCommand::SymTab {
                    symoff: 0x100,
                    nsyms: 3,
                    stroff: 0x200,
                    strsize: 0x40
                },
                24
            )
        );
    }

    #[test]
    fn test_bad_cmdsize() {
        let header = MachHeader::default();

        for &(cmdsize, len) in &[(0u32, 16usize), (10, 16), (32, 16)] {
            let mut cmd = vec![0u8; len];

            cmd[0..4].copy_from_slice(&LC_UUID.to_le_bytes());
            cmd[4..8].copy_from_slice(&cmdsize.to_le_bytes());

            let mut cur = Cursor::new(cmd);

            assert!(LoadCommand::parse::<LittleEndian, _>(&header, &mut cur).is_err());
            assert_eq!(cur.position(), 0);
        }
    }
}
