use std::io::Cursor;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::codec::CursorExt;
use crate::commands::LoadCommand;
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::source::{ByteSource, SubSource};

pub trait MachArch {
    const HEADER_SIZE: usize;

    fn parse_mach_header<T: AsRef<[u8]>, O: ByteOrder>(buf: &mut Cursor<T>) -> Result<MachHeader>;
}

pub enum Arch32 {}
pub enum Arch64 {}

fn is_big_endian<O: ByteOrder>() -> bool {
    O::read_u16(&[0, 1]) == 1
}

impl MachArch for Arch32 {
    const HEADER_SIZE: usize = 28;

    fn parse_mach_header<T: AsRef<[u8]>, O: ByteOrder>(buf: &mut Cursor<T>) -> Result<MachHeader> {
        buf.ensure(Self::HEADER_SIZE)?;

        let header = MachHeader {
            magic: buf.read_u32::<O>()?,
            cputype: buf.read_i32::<O>()?,
            cpusubtype: buf.read_i32::<O>()?,
            filetype: buf.read_u32::<O>()?,
            ncmds: buf.read_u32::<O>()?,
            sizeofcmds: buf.read_u32::<O>()?,
            flags: buf.read_u32::<O>()?,
            bigend: is_big_endian::<O>(),
        };

        Ok(header)
    }
}

impl MachArch for Arch64 {
    const HEADER_SIZE: usize = 32;

    fn parse_mach_header<T: AsRef<[u8]>, O: ByteOrder>(buf: &mut Cursor<T>) -> Result<MachHeader> {
        buf.ensure(Self::HEADER_SIZE)?;

        let header = MachHeader {
            magic: buf.read_u32::<O>()?,
            cputype: buf.read_i32::<O>()?,
            cpusubtype: buf.read_i32::<O>()?,
            filetype: buf.read_u32::<O>()?,
            ncmds: buf.read_u32::<O>()?,
            sizeofcmds: buf.read_u32::<O>()?,
            flags: buf.read_u32::<O>()?,
            bigend: is_big_endian::<O>(),
        };

        buf.skip(4)?; // reserved

        Ok(header)
    }
}

/// The mach header, with the magic already in host order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MachHeader {
    pub magic: u32,
    pub cputype: cpu_type_t,
    pub cpusubtype: cpu_subtype_t,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    /// The file is stored in big endian byte order.
    pub bigend: bool,
}

impl MachHeader {
    pub fn is_64bit(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    pub fn is_bigend(&self) -> bool {
        self.bigend
    }

    pub fn header_size(&self) -> usize {
        if self.is_64bit() {
            Arch64::HEADER_SIZE
        } else {
            Arch32::HEADER_SIZE
        }
    }

    pub fn ptr_size(&self) -> usize {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    pub fn is_arm64e(&self) -> bool {
        self.cputype == CPU_TYPE_ARM64 && get_cpu_subtype_type(self.cpusubtype) == CPU_SUBTYPE_ARM64E
    }

    /// Read the header at `start`.
    ///
    /// This is the only hard failure of a Mach-O parse: an unknown magic or an
    /// unreadable header.
    pub fn parse<S: ByteSource + ?Sized>(source: &S, start: u64) -> Result<MachHeader> {
        let buf = source.read_clamped(start, Arch64::HEADER_SIZE);

        if buf.len() < 4 {
            return Err(Error::Truncated {
                offset: start,
                needed: 4,
                available: buf.len(),
            });
        }

        let magic = LittleEndian::read_u32(&buf);
        let mut cur = Cursor::new(&buf[..]);

        match magic {
            MH_MAGIC => Arch32::parse_mach_header::<_, LittleEndian>(&mut cur),
            MH_CIGAM => Arch32::parse_mach_header::<_, BigEndian>(&mut cur),
            MH_MAGIC_64 => Arch64::parse_mach_header::<_, LittleEndian>(&mut cur),
            MH_CIGAM_64 => Arch64::parse_mach_header::<_, BigEndian>(&mut cur),
            _ => Err(Error::UnknownMagic(magic)),
        }
    }
}

/// A load command with its declared size.
#[derive(Debug, Clone, PartialEq)]
pub struct MachCommand(pub LoadCommand, pub usize);

impl MachCommand {
    pub fn command(&self) -> &LoadCommand {
        &self.0
    }

    pub fn cmdsize(&self) -> usize {
        self.1
    }
}

/// Walk `ncmds` commands in the command area.
///
/// A framing error stops the walk; the commands parsed so far are returned
/// beside the error.
pub fn parse_commands(header: &MachHeader, buf: &[u8]) -> (Vec<MachCommand>, Option<Error>) {
    if header.is_bigend() {
        parse_commands_with::<BigEndian>(header, buf)
    } else {
        parse_commands_with::<LittleEndian>(header, buf)
    }
}

fn parse_commands_with<O: ByteOrder>(header: &MachHeader, buf: &[u8]) -> (Vec<MachCommand>, Option<Error>) {
    let mut cur = Cursor::new(buf);
    let mut commands = Vec::new();

    for i in 0..header.ncmds {
        match LoadCommand::parse::<O, _>(header, &mut cur) {
            Ok((cmd, cmdsize)) => commands.push(MachCommand(cmd, cmdsize)),
            Err(err) => {
                warn!(
                    "stop parsing load commands at #{} of {}, offset 0x{:x}, {}",
                    i,
                    header.ncmds,
                    cur.position(),
                    err
                );

                return (commands, Some(err));
            }
        }
    }

    if cur.position() != u64::from(header.sizeofcmds) {
        warn!(
            "inconsistent sizeofcmds, header declares {} bytes but {} commands use {} bytes",
            header.sizeofcmds,
            commands.len(),
            cur.position()
        );
    }

    debug!("parsed {} load commands", commands.len());

    (commands, None)
}

/// A parsed Mach-O header and command stream.
#[derive(Debug)]
pub struct MachFile {
    pub header: MachHeader,
    pub commands: Vec<MachCommand>,
    /// Why the command walk stopped early, if it did.
    pub error: Option<Error>,
}

impl MachFile {
    pub fn parse<S: ByteSource + ?Sized>(source: &S, start: u64) -> Result<MachFile> {
        let header = MachHeader::parse(source, start)?;

        debug!("parsed mach-o file header at 0x{:x}: {:?}", start, header);

        let off = start + header.header_size() as u64;
        let buf = source.read_clamped(off, header.sizeofcmds as usize);

        if buf.len() < header.sizeofcmds as usize {
            warn!(
                "load commands truncated to {} bytes, header declares {} bytes",
                buf.len(),
                header.sizeofcmds
            );
        }

        let (commands, error) = parse_commands(&header, &buf);

        Ok(MachFile {
            header,
            commands,
            error,
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FatArch {
    /// cpu specifier (int)
    pub cputype: cpu_type_t,
    /// machine specifier (int)
    pub cpusubtype: cpu_subtype_t,
    /// file offset to this object file
    pub offset: u32,
    /// size of this object file
    pub size: u32,
    /// alignment as a power of 2
    pub align: u32,
}

impl FatArch {
    const SIZE: usize = 20;
}

#[derive(Debug)]
pub enum OFile {
    MachFile(MachFile),
    FatFile { magic: u32, files: Vec<(FatArch, OFile)> },
}

impl OFile {
    pub fn parse<S: ByteSource + ?Sized>(source: &S) -> Result<OFile> {
        let mut magic = [0; 4];

        source.read_exact_at(0, &mut magic)?;

        match BigEndian::read_u32(&magic) {
            FAT_MAGIC => Self::parse_fat_file(source),
            _ => MachFile::parse(source, 0).map(OFile::MachFile),
        }
    }

    fn parse_fat_file<S: ByteSource + ?Sized>(source: &S) -> Result<OFile> {
        let mut head = [0; 8];

        source.read_exact_at(0, &mut head)?;

        let magic = BigEndian::read_u32(&head[..4]);
        let nfat_arch = BigEndian::read_u32(&head[4..]) as usize;
        let buf = source.read_clamped(8, nfat_arch.saturating_mul(FatArch::SIZE));

        if buf.len() < nfat_arch * FatArch::SIZE {
            warn!(
                "fat header declares {} archs, only {} fit in the file",
                nfat_arch,
                buf.len() / FatArch::SIZE
            );
        }

        debug!("parsing fat header with {} archs, magic=0x{:x}", nfat_arch, magic);

        let mut cur = Cursor::new(&buf[..]);
        let mut files = Vec::new();

        while cur.remaining() >= FatArch::SIZE {
            let arch = FatArch {
                cputype: cur.read_i32::<BigEndian>()?,
                cpusubtype: cur.read_i32::<BigEndian>()?,
                offset: cur.read_u32::<BigEndian>()?,
                size: cur.read_u32::<BigEndian>()?,
                align: cur.read_u32::<BigEndian>()?,
            };

            debug!("parsing mach-o file at 0x{:x}, arch={:?}", arch.offset, arch);

            let slice = SubSource::new(source, u64::from(arch.offset), Some(u64::from(arch.size)));

            match MachFile::parse(&slice, 0) {
                Ok(file) => files.push((arch, OFile::MachFile(file))),
                Err(err) => warn!("skip fat arch at 0x{:x}, {}", arch.offset, err),
            }
        }

        Ok(OFile::FatFile { magic, files })
    }
}
