use std::fmt;
use std::io::Cursor;
use std::ops::ControlFlow;

use crate::codec::CursorExt;
use crate::commands::Segment;
use crate::consts::*;
use crate::errors::{Error, Result};
use crate::image::MachImage;
use crate::pointer::TaggedPointer;
use crate::source::ByteSource;

/// Upper bound of the threaded bind ordinal table reservation.
const MAX_THREADED_TABLE_RESERVE: u64 = 0x10000;

/// Bind or rebase symbol type
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SymbolType {
    Pointer,
    TextAbsolute32,
    TextRelative32,
    ThreadedRebase,
    ThreadedRebaseAuth,
    ThreadedBind,
    ThreadedBindAuth,
}

impl SymbolType {
    fn from_imm(imm: u8) -> Option<Self> {
        match imm {
            BIND_TYPE_POINTER => Some(SymbolType::Pointer),
            BIND_TYPE_TEXT_ABSOLUTE32 => Some(SymbolType::TextAbsolute32),
            BIND_TYPE_TEXT_PCREL32 => Some(SymbolType::TextRelative32),
            _ => None,
        }
    }

    pub fn is_threaded(self) -> bool {
        matches!(
            self,
            SymbolType::ThreadedRebase
                | SymbolType::ThreadedRebaseAuth
                | SymbolType::ThreadedBind
                | SymbolType::ThreadedBindAuth
        )
    }
}

impl fmt::Display for SymbolType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                SymbolType::Pointer => "pointer",
                SymbolType::TextAbsolute32 => "text abs32",
                SymbolType::TextRelative32 => "text rel32",
                SymbolType::ThreadedRebase => "threaded rebase",
                SymbolType::ThreadedRebaseAuth => "threaded rebase auth",
                SymbolType::ThreadedBind => "threaded bind",
                SymbolType::ThreadedBindAuth => "threaded bind auth",
            }
        )
    }
}

bitflags! {
    /// Flags for bind symbol
    pub struct BindSymbolFlags: u8 {
        const WEAK_IMPORT = BIND_SYMBOL_FLAGS_WEAK_IMPORT;
        const NON_WEAK_DEFINITION = BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION;
    }
}

/// Which of the three bind tables a stream comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindKind {
    Normal,
    Weak,
    Lazy,
}

impl fmt::Display for BindKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            BindKind::Normal => "bind",
            BindKind::Weak => "weak bind",
            BindKind::Lazy => "lazy bind",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebaseRecord {
    pub address: u64,
    pub rebase_type: SymbolType,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindRecord {
    pub address: u64,
    pub bind_type: SymbolType,
    pub name: String,
    /// Library ordinal, negative values are the `BIND_SPECIAL_DYLIB_*` ones.
    pub ordinal: i64,
    pub addend: i64,
    pub flags: u8,
    pub kind: BindKind,
}

impl BindRecord {
    pub fn symbol_flags(&self) -> BindSymbolFlags {
        BindSymbolFlags::from_bits_truncate(self.flags)
    }
}

/// OpCode for the rebasing pointers
#[derive(Clone, Debug, PartialEq)]
pub enum RebaseOpCode {
    Done,
    SetSymbolType(SymbolType),
    SetSegmentOffset { segment_index: u8, segment_offset: u64 },
    AddAddress { offset: u64 },
    Rebase { times: u64 },
    RebaseAndAddAddress { offset: u64 },
    RebaseAndSkipping { times: u64, skip: u64 },
}

/// An iterator over the `RebaseOpCode`, it ends after the first malformed opcode.
pub struct RebaseOpCodes<'a> {
    cur: Cursor<&'a [u8]>,
    ptr_size: u64,
    failed: bool,
}

impl<'a> RebaseOpCodes<'a> {
    pub fn new(payload: &'a [u8], ptr_size: usize) -> Self {
        RebaseOpCodes {
            cur: Cursor::new(payload),
            ptr_size: ptr_size as u64,
            failed: false,
        }
    }

    /// Offset of the next opcode in the stream.
    pub fn offset(&self) -> u64 {
        self.cur.position()
    }

    fn decode(&mut self, b: u8) -> Result<RebaseOpCode> {
        let offset = self.cur.position() - 1;

        Ok(match (b & REBASE_OPCODE_MASK, b & REBASE_IMMEDIATE_MASK) {
            (REBASE_OPCODE_DONE, _) => RebaseOpCode::Done,
            (REBASE_OPCODE_SET_TYPE_IMM, rebase_type) => RebaseOpCode::SetSymbolType(
                SymbolType::from_imm(rebase_type)
                    .ok_or_else(|| Error::malformed(offset, format!("unknown rebase type {}", rebase_type)))?,
            ),
            (REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, segment_index) => RebaseOpCode::SetSegmentOffset {
                segment_index,
                segment_offset: self.cur.read_uleb128()?,
            },
            (REBASE_OPCODE_ADD_ADDR_ULEB, _) => RebaseOpCode::AddAddress {
                offset: self.cur.read_uleb128()?,
            },
            (REBASE_OPCODE_ADD_ADDR_IMM_SCALED, scale) => RebaseOpCode::AddAddress {
                offset: u64::from(scale) * self.ptr_size,
            },
            (REBASE_OPCODE_DO_REBASE_IMM_TIMES, times) => RebaseOpCode::Rebase { times: u64::from(times) },
            (REBASE_OPCODE_DO_REBASE_ULEB_TIMES, _) => RebaseOpCode::Rebase {
                times: self.cur.read_uleb128()?,
            },
            (REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB, _) => RebaseOpCode::RebaseAndAddAddress {
                offset: self.cur.read_uleb128()?,
            },
            (REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB, _) => {
                let times = self.cur.read_uleb128()?;
                let skip = self.cur.read_uleb128()?;

                RebaseOpCode::RebaseAndSkipping { times, skip }
            }
            (opcode, immediate) => {
                return Err(Error::malformed(
                    offset,
                    format!("unknown rebase opcode 0x{:02x}, immediate = {}", opcode, immediate),
                ))
            }
        })
    }
}

impl<'a> Iterator for RebaseOpCodes<'a> {
    type Item = Result<RebaseOpCode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let b = *self.cur.get_ref().get(self.cur.position() as usize)?;

        self.cur.set_position(self.cur.position() + 1);

        let res = self.decode(b);

        self.failed = res.is_err();

        Some(res)
    }
}

/// OpCode for the binding symbol
#[derive(Clone, Debug, PartialEq)]
pub enum BindOpCode {
    Done,
    SetDyLibrary(i64),
    SetSymbol { name: String, flags: u8 },
    SetSymbolType(SymbolType),
    SetAddend(i64),
    SetSegmentOffset { segment_index: u8, segment_offset: u64 },
    AddAddress { offset: u64 },
    Bind,
    BindAndAddAddress { offset: u64 },
    BindAndSkipping { times: u64, skip: u64 },
    SetBindOrdinalTableSize(u64),
    ThreadedApply,
}

/// An iterator over the `BindOpCode`, it ends after the first malformed opcode.
pub struct BindOpCodes<'a> {
    cur: Cursor<&'a [u8]>,
    ptr_size: u64,
    failed: bool,
}

impl<'a> BindOpCodes<'a> {
    pub fn new(payload: &'a [u8], ptr_size: usize) -> Self {
        BindOpCodes {
            cur: Cursor::new(payload),
            ptr_size: ptr_size as u64,
            failed: false,
        }
    }

    /// Offset of the next opcode in the stream.
    pub fn offset(&self) -> u64 {
        self.cur.position()
    }

    fn decode(&mut self, b: u8) -> Result<BindOpCode> {
        let offset = self.cur.position() - 1;

        Ok(match (b & BIND_OPCODE_MASK, b & BIND_IMMEDIATE_MASK) {
            (BIND_OPCODE_DONE, _) => BindOpCode::Done,
            (BIND_OPCODE_SET_DYLIB_ORDINAL_IMM, ordinal) => BindOpCode::SetDyLibrary(i64::from(ordinal)),
            (BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB, _) => BindOpCode::SetDyLibrary(self.cur.read_uleb128()? as i64),
            // the special ordinals are negative numbers
            (BIND_OPCODE_SET_DYLIB_SPECIAL_IMM, 0) => BindOpCode::SetDyLibrary(BIND_SPECIAL_DYLIB_SELF),
            (BIND_OPCODE_SET_DYLIB_SPECIAL_IMM, imm) => {
                BindOpCode::SetDyLibrary(i64::from((BIND_OPCODE_MASK | imm) as i8))
            }
            (BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, flags) => BindOpCode::SetSymbol {
                name: self.cur.read_cstr()?,
                flags,
            },
            (BIND_OPCODE_SET_TYPE_IMM, bind_type) => BindOpCode::SetSymbolType(
                SymbolType::from_imm(bind_type)
                    .ok_or_else(|| Error::malformed(offset, format!("unknown bind type {}", bind_type)))?,
            ),
            (BIND_OPCODE_SET_ADDEND_SLEB, _) => BindOpCode::SetAddend(self.cur.read_sleb128()?),
            (BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, segment_index) => BindOpCode::SetSegmentOffset {
                segment_index,
                segment_offset: self.cur.read_uleb128()?,
            },
            (BIND_OPCODE_ADD_ADDR_ULEB, _) => BindOpCode::AddAddress {
                offset: self.cur.read_uleb128()?,
            },
            (BIND_OPCODE_DO_BIND, _) => BindOpCode::Bind,
            (BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB, _) => BindOpCode::BindAndAddAddress {
                offset: self.cur.read_uleb128()?,
            },
            (BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED, scale) => BindOpCode::BindAndAddAddress {
                offset: u64::from(scale) * self.ptr_size,
            },
            (BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, _) => {
                let times = self.cur.read_uleb128()?;
                let skip = self.cur.read_uleb128()?;

                BindOpCode::BindAndSkipping { times, skip }
            }
            (BIND_OPCODE_THREADED, BIND_SUBOPCODE_THREADED_SET_BIND_ORDINAL_TABLE_SIZE_ULEB) => {
                BindOpCode::SetBindOrdinalTableSize(self.cur.read_uleb128()?)
            }
            (BIND_OPCODE_THREADED, BIND_SUBOPCODE_THREADED_APPLY) => BindOpCode::ThreadedApply,
            (opcode, immediate) => {
                return Err(Error::malformed(
                    offset,
                    format!("unknown bind opcode 0x{:02x}, immediate = {}", opcode, immediate),
                ))
            }
        })
    }
}

impl<'a> Iterator for BindOpCodes<'a> {
    type Item = Result<BindOpCode>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let b = *self.cur.get_ref().get(self.cur.position() as usize)?;

        self.cur.set_position(self.cur.position() + 1);

        let res = self.decode(b);

        self.failed = res.is_err();

        Some(res)
    }
}

/// Segment selected by a `SET_SEGMENT_AND_OFFSET_ULEB` opcode.
struct SegmentCursor<'a> {
    segment: Option<&'a Segment>,
    offset: u64,
}

impl<'a> SegmentCursor<'a> {
    fn new() -> Self {
        SegmentCursor {
            segment: None,
            offset: 0,
        }
    }

    fn select(&mut self, segments: &'a [Segment], index: u8, offset: u64, pos: u64) -> Result<()> {
        let segment = segments
            .get(usize::from(index))
            .ok_or_else(|| Error::malformed(pos, format!("segment #{} does not exist", index)))?;

        self.segment = Some(segment);
        self.offset = offset;

        Ok(())
    }

    fn address(&self, pos: u64) -> Result<u64> {
        self.segment
            .map(|seg| seg.vmaddr.wrapping_add(self.offset))
            .ok_or_else(|| Error::malformed(pos, "no segment selected"))
    }

    fn size(&self) -> u64 {
        self.segment.map_or(0, |seg| seg.vmsize)
    }

    fn end(&self) -> u64 {
        self.segment.map_or(0, |seg| seg.end())
    }

    fn advance(&mut self, delta: u64) {
        self.offset = self.offset.wrapping_add(delta);
    }
}

fn wrong_rebase(pos: u64, addr: u64) -> Error {
    Error::malformed(pos, format!("wrong rebase info, address 0x{:x} is not loaded", addr))
}

/// Run the rebase opcodes of `image`, feeding every rebased address to `visitor`.
///
/// Records emitted before a malformed opcode are kept, the error is returned afterwards.
pub fn run_rebase<S, F>(image: &MachImage<S>, opcodes: &[u8], mut visitor: F) -> Result<()>
where
    S: ByteSource,
    F: FnMut(&RebaseRecord) -> ControlFlow<()>,
{
    let segments = image.segments();
    let ptr_size = image.ptr_size() as u64;
    let mut codes = RebaseOpCodes::new(opcodes, image.ptr_size());
    let mut seg = SegmentCursor::new();
    let mut rebase_type = SymbolType::Pointer;

    let mut rebase = |seg: &SegmentCursor, rebase_type, pos| -> Result<ControlFlow<()>> {
        let address = seg.address(pos)?;

        if !image.is_loaded_addr(address) {
            return Err(wrong_rebase(pos, address));
        }

        Ok(visitor(&RebaseRecord { address, rebase_type }))
    };

    while let Some(opcode) = codes.next() {
        let pos = codes.offset();
        let opcode = opcode?;

        trace!("rebase opcode: {:?}", opcode);

        match opcode {
            RebaseOpCode::Done => break,
            RebaseOpCode::SetSymbolType(ty) => rebase_type = ty,
            RebaseOpCode::SetSegmentOffset {
                segment_index,
                segment_offset,
            } => seg.select(&segments, segment_index, segment_offset, pos)?,
            RebaseOpCode::AddAddress { offset } => seg.advance(offset),
            RebaseOpCode::Rebase { times } => {
                if times > seg.size() {
                    return Err(Error::malformed(pos, format!("bad rebase count {}", times)));
                }

                for _ in 0..times {
                    if rebase(&seg, rebase_type, pos)?.is_break() {
                        return Ok(());
                    }

                    seg.advance(ptr_size);
                }
            }
            RebaseOpCode::RebaseAndAddAddress { offset } => {
                if rebase(&seg, rebase_type, pos)?.is_break() {
                    return Ok(());
                }

                seg.advance(offset.wrapping_add(ptr_size));
            }
            RebaseOpCode::RebaseAndSkipping { times, skip } => {
                if times > seg.size() || skip > seg.size() {
                    return Err(Error::malformed(
                        pos,
                        format!("bad rebase count {} or skip {}", times, skip),
                    ));
                }

                for _ in 0..times {
                    if rebase(&seg, rebase_type, pos)?.is_break() {
                        return Ok(());
                    }

                    seg.advance(skip.wrapping_add(ptr_size));
                }
            }
        }
    }

    Ok(())
}

/// Symbol recorded by `DO_BIND` while in threaded mode.
struct ThreadedSymbol {
    name: String,
    ordinal: i64,
    addend: i64,
    flags: u8,
}

/// Run one of the bind tables of `image`, feeding every bound location to `visitor`.
///
/// `DONE` ends normal and weak streams but only separates entries in lazy ones.
pub fn run_bind<S, F>(image: &MachImage<S>, opcodes: &[u8], kind: BindKind, mut visitor: F) -> Result<()>
where
    S: ByteSource,
    F: FnMut(&BindRecord) -> ControlFlow<()>,
{
    let segments = image.segments();
    let ptr_size = image.ptr_size() as u64;
    let base = image.base_addr().unwrap_or_default();
    let mut codes = BindOpCodes::new(opcodes, image.ptr_size());
    let mut seg = SegmentCursor::new();
    let mut bind_type = SymbolType::Pointer;
    let mut ordinal = BIND_SPECIAL_DYLIB_SELF;
    let mut addend = 0i64;
    let mut flags = 0u8;
    let mut name = String::new();
    let mut threaded: Option<Vec<ThreadedSymbol>> = None;

    while let Some(opcode) = codes.next() {
        let pos = codes.offset();
        let opcode = opcode?;

        trace!("{} opcode: {:?}", kind, opcode);

        macro_rules! bind {
            ($address:expr) => {{
                let record = BindRecord {
                    address: $address,
                    bind_type,
                    name: name.clone(),
                    ordinal,
                    addend,
                    flags,
                    kind,
                };

                if visitor(&record).is_break() {
                    return Ok(());
                }
            }};
        }

        match opcode {
            BindOpCode::Done => {
                if kind != BindKind::Lazy {
                    break;
                }
            }
            BindOpCode::SetDyLibrary(n) => ordinal = n,
            BindOpCode::SetSymbol { name: symbol, flags: f } => {
                name = symbol;
                flags = f;
            }
            BindOpCode::SetSymbolType(ty) => bind_type = ty,
            BindOpCode::SetAddend(n) => addend = n,
            BindOpCode::SetSegmentOffset {
                segment_index,
                segment_offset,
            } => seg.select(&segments, segment_index, segment_offset, pos)?,
            BindOpCode::AddAddress { offset } => seg.advance(offset),
            BindOpCode::Bind => {
                match threaded.as_mut() {
                    Some(table) => table.push(ThreadedSymbol {
                        name: name.clone(),
                        ordinal,
                        addend,
                        flags,
                    }),
                    None => {
                        let address = seg.address(pos)?;

                        if image.is_loaded_addr(address) {
                            bind!(address);
                        } else {
                            warn!("reference to wrong address 0x{:x}", address);
                        }
                    }
                }

                seg.advance(ptr_size);
            }
            BindOpCode::BindAndAddAddress { offset } => {
                let address = seg.address(pos)?;

                if image.is_loaded_addr(address) {
                    bind!(address);
                } else {
                    warn!("reference to wrong address 0x{:x}", address);
                }

                seg.advance(offset.wrapping_add(ptr_size));
            }
            BindOpCode::BindAndSkipping { times, skip } => {
                if times > seg.size() || skip > seg.size() {
                    return Err(Error::malformed(pos, format!("bad bind count {} or skip {}", times, skip)));
                }

                let mut bound = 0;

                while bound < times {
                    let address = seg.address(pos)?;

                    if !image.is_loaded_addr(address) {
                        warn!("reference to wrong address 0x{:x}", address);
                        break;
                    }

                    bind!(address);

                    seg.advance(skip.wrapping_add(ptr_size));
                    bound += 1;
                }

                seg.advance((times - bound).wrapping_mul(skip.wrapping_add(ptr_size)));
            }
            BindOpCode::SetBindOrdinalTableSize(size) => {
                threaded = Some(Vec::with_capacity(size.min(MAX_THREADED_TABLE_RESERVE) as usize));
            }
            BindOpCode::ThreadedApply => {
                let table = threaded.as_deref().unwrap_or_default();
                let end = seg.end();

                loop {
                    let address = seg.address(pos)?;

                    if address >= end {
                        warn!("threaded chain runs past its segment at 0x{:x}", address);
                        break;
                    }

                    let ptr = match image.read_u64_at_va(address) {
                        Ok(raw) => TaggedPointer(raw),
                        Err(err) => {
                            warn!("fail to read threaded pointer at 0x{:x}, {}", address, err);
                            break;
                        }
                    };

                    if ptr.is_auth() {
                        trace!("0x{:x}: {}", address, ptr);
                    }

                    let record = if ptr.is_bind() {
                        table.get(usize::from(ptr.ordinal())).map(|sym| BindRecord {
                            address,
                            bind_type: if ptr.is_auth() {
                                SymbolType::ThreadedBindAuth
                            } else {
                                SymbolType::ThreadedBind
                            },
                            name: sym.name.clone(),
                            ordinal: sym.ordinal,
                            addend: sym.addend,
                            flags: sym.flags,
                            kind,
                        })
                    } else {
                        Some(BindRecord {
                            address,
                            bind_type: if ptr.is_auth() {
                                SymbolType::ThreadedRebaseAuth
                            } else {
                                SymbolType::ThreadedRebase
                            },
                            name: String::new(),
                            ordinal: BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
                            addend: ptr.untag(base) as i64,
                            flags: 0,
                            kind,
                        })
                    };

                    match record {
                        Some(record) => {
                            if visitor(&record).is_break() {
                                return Ok(());
                            }
                        }
                        None => warn!("threaded bind #{} at 0x{:x} is out of table", ptr.ordinal(), address),
                    }

                    if ptr.skip() == 0 {
                        break;
                    }

                    seg.advance(ptr.skip() * 8);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use crate::image::LoadHint;
    use crate::testdata::*;

    fn image(data: Vec<u8>) -> MachImage<Vec<u8>> {
        MachImage::parse(data, 0, LoadHint::File).unwrap()
    }

    fn collect_binds(image: &MachImage<Vec<u8>>, opcodes: &[u8], kind: BindKind) -> (Vec<BindRecord>, Result<()>) {
        let mut records = vec![];
        let res = run_bind(image, opcodes, kind, |record| {
            records.push(record.clone());
            ControlFlow::Continue(())
        });

        (records, res)
    }

    #[test]
    fn test_decode_bind_opcodes() {
        let opcodes = [
            0x11, 0x40, b'_', b'f', b'o', b'o', 0, 0x51, 0x72, 0x08, 0x90, 0x3e, 0xc0, 0x02, 0x08, 0x00,
        ];
        let codes = BindOpCodes::new(&opcodes, 8).collect::<Result<Vec<_>>>().unwrap();

        assert_eq!(
            codes,
            vec![
                BindOpCode::SetDyLibrary(1),
                BindOpCode::SetSymbol {
                    name: "_foo".to_owned(),
                    flags: 0
                },
                BindOpCode::SetSymbolType(SymbolType::Pointer),
                BindOpCode::SetSegmentOffset {
                    segment_index: 2,
                    segment_offset: 8
                },
                BindOpCode::Bind,
                BindOpCode::SetDyLibrary(BIND_SPECIAL_DYLIB_FLAT_LOOKUP),
                BindOpCode::BindAndSkipping { times: 2, skip: 8 },
                BindOpCode::Done,
            ]
        );
    }

    #[test]
    fn test_unknown_opcode_ends_stream() {
        let opcodes = [0x11, 0xe0, 0x90];
        let codes = BindOpCodes::new(&opcodes, 8).collect::<Vec<_>>();

        assert_eq!(codes.len(), 2);
        assert!(codes[1].is_err());
    }

    #[test]
    fn test_single_bind() {
        let image = image(sample_dylib());
        // SET_SEGMENT_AND_OFFSET_ULEB(1, 0), SET_SYMBOL_TRAILING_FLAGS_IMM("_bar"), DO_BIND, DONE
        let opcodes = [0x71, 0x00, 0x40, b'_', b'b', b'a', b'r', 0, 0x90, 0x00];
        let (records, res) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert!(res.is_ok());
        assert_eq!(
            records,
            vec![BindRecord {
                address: 0x4000,
                bind_type: SymbolType::Pointer,
                name: "_bar".to_owned(),
                ordinal: 0,
                addend: 0,
                flags: 0,
                kind: BindKind::Normal,
            }]
        );
    }

    #[test]
    fn test_sample_tables() {
        let image = image(sample_dylib());

        assert_eq!(
            image.rebase_records(),
            vec![
                RebaseRecord {
                    address: 0x4008,
                    rebase_type: SymbolType::Pointer
                },
                RebaseRecord {
                    address: 0x4010,
                    rebase_type: SymbolType::Pointer
                },
            ]
        );

        let binds = image.bind_records(BindKind::Normal);

        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].address, 0x4000);
        assert_eq!(binds[0].name, "_bar");
        assert_eq!(binds[0].ordinal, 1);

        let lazy = image.bind_records(BindKind::Lazy);

        assert_eq!(lazy.len(), 1);
        assert_eq!(lazy[0].address, 0x4020);
        assert_eq!(lazy[0].name, "_qux");
        assert_eq!(lazy[0].ordinal, 2);
        assert_eq!(lazy[0].kind, BindKind::Lazy);

        assert!(image.bind_records(BindKind::Weak).is_empty());
    }

    #[test]
    fn test_runs_are_idempotent() {
        let image = image(sample_dylib());

        assert_eq!(image.rebase_records(), image.rebase_records());
        assert_eq!(image.bind_records(BindKind::Lazy), image.bind_records(BindKind::Lazy));
    }

    #[test]
    fn test_lazy_done_is_separator() {
        let image = image(sample_dylib());
        let opcodes = [
            0x71, 0x00, 0x11, 0x40, b'_', b'a', 0, 0x90, 0x00, 0x71, 0x08, 0x12, 0x40, b'_', b'b', 0, 0x90, 0x00,
        ];

        let (lazy, _) = collect_binds(&image, &opcodes, BindKind::Lazy);
        let (normal, _) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert_eq!(lazy.iter().map(|r| r.address).collect::<Vec<_>>(), vec![0x4000, 0x4008]);
        assert_eq!(normal.len(), 1);
    }

    #[test]
    fn test_special_ordinal_sign_extends() {
        let image = image(sample_dylib());
        let opcodes = [0x71, 0x00, 0x3f, 0x40, b'_', b'm', 0, 0x90, 0x00];
        let (records, _) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert_eq!(records[0].ordinal, BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE);
    }

    #[test]
    fn test_wrong_rebase_keeps_records() {
        let image = image(sample_dylib());
        // rebase once in __DATA, then select a segment that does not exist
        let opcodes = [0x11, 0x21, 0x00, 0x51, 0x29, 0x00, 0x51];
        let mut records = vec![];
        let res = run_rebase(&image, &opcodes, |record| {
            records.push(record.clone());
            ControlFlow::Continue(())
        });

        assert_eq!(records.len(), 1);
        assert!(matches!(res, Err(Error::MalformedEncoding { .. })));

        // emitting before any segment is selected
        let res = run_rebase(&image, &[0x51], |_| ControlFlow::Continue(()));

        assert!(res.is_err());

        // repeat count larger than the segment
        let res = run_rebase(&image, &[0x21, 0x00, 0x60, 0x80, 0x40], |_| ControlFlow::Continue(()));

        assert!(res.is_err());
    }

    #[test]
    fn test_huge_bind_skips() {
        let data = MachBuilder::new()
            .command(segment64_command("__PAGEZERO", 0, 0x2_0000_0000, 0, 0, 0, &[]))
            .command(segment64_command("__TEXT", 0x2_0000_0000, 0x1000, 0, 0x1000, 5, &[]))
            .build();
        let image = image(data);

        // DO_BIND_ULEB_TIMES_SKIPPING_ULEB(2^32, 2^32) in __PAGEZERO, then DO_BIND in __TEXT
        let mut opcodes = vec![0x70, 0x00, 0x40, b'_', b'x', 0, 0xc0];

        opcodes.extend(uleb(1 << 32));
        opcodes.extend(uleb(1 << 32));
        opcodes.extend(&[0x71, 0x00, 0x90, 0x00]);

        let (records, res) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert!(res.is_ok());
        assert_eq!(records.iter().map(|r| r.address).collect::<Vec<_>>(), vec![0x2_0000_0000]);
    }

    #[test]
    fn test_bind_skips_unloaded_addresses() {
        let data = MachBuilder::new()
            .command(segment64_command("__PAGEZERO", 0, 0x1000, 0, 0, 0, &[]))
            .command(segment64_command("__TEXT", 0x1000, 0x1000, 0, 0x1000, 5, &[]))
            .build();
        let image = image(data);
        // DO_BIND and DO_BIND_ADD_ADDR_ULEB in __PAGEZERO, DO_BIND in __TEXT
        let opcodes = [0x70, 0x00, 0x40, b'_', b'x', 0, 0x90, 0xa0, 0x08, 0x71, 0x08, 0x90, 0x00];
        let (records, res) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert!(res.is_ok());
        assert_eq!(records.iter().map(|r| r.address).collect::<Vec<_>>(), vec![0x1008]);
    }

    #[test]
    fn test_huge_rebase_skips() {
        let data = MachBuilder::new()
            .command(segment64_command("__TEXT", 0, u64::MAX, 0, 0x1000, 5, &[]))
            .build();
        let image = image(data);
        // DO_REBASE_ULEB_TIMES_SKIPPING_ULEB(2, 2^64 - 4) wraps back to offset 4
        let mut opcodes = vec![0x20, 0x00, 0x80, 0x02];

        opcodes.extend(uleb(u64::MAX - 3));
        opcodes.push(0x00);

        let mut records = vec![];
        let res = run_rebase(&image, &opcodes, |record| {
            records.push(record.address);
            ControlFlow::Continue(())
        });

        assert!(res.is_ok());
        assert_eq!(records, vec![0, 4]);
    }

    #[test]
    fn test_visitor_break() {
        let image = image(sample_dylib());
        let mut count = 0;
        let res = run_rebase(&image, &[0x11, 0x21, 0x00, 0x54, 0x00], |_| {
            count += 1;
            ControlFlow::Break(())
        });

        assert!(res.is_ok());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_threaded_apply() {
        let mut data = sample_dylib();
        let next = 1u64 << 51;

        // __DATA is at file offset 0x2000
        place(&mut data, 0x2000, &((1u64 << 62) | next | 1).to_le_bytes());
        place(&mut data, 0x2008, &(next | 0x1100).to_le_bytes());
        place(&mut data, 0x2010, &((1u64 << 63) | 0x120).to_le_bytes());

        let image = image(data);
        let opcodes = [
            0xd0, 0x02, // SET_BIND_ORDINAL_TABLE_SIZE_ULEB(2)
            0x11, 0x40, b'_', b'a', 0, 0x90, // DO_BIND "_a"
            0x12, 0x40, b'_', b'b', 0, 0x90, // DO_BIND "_b"
            0x71, 0x00, 0xd1, 0x00,
        ];
        let (records, res) = collect_binds(&image, &opcodes, BindKind::Normal);

        assert!(res.is_ok());
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].address, 0x4000);
        assert_eq!(records[0].bind_type, SymbolType::ThreadedBind);
        assert_eq!(records[0].name, "_b");
        assert_eq!(records[0].ordinal, 2);

        assert_eq!(records[1].address, 0x4008);
        assert_eq!(records[1].bind_type, SymbolType::ThreadedRebase);
        assert_eq!(records[1].ordinal, -3);
        assert_eq!(records[1].addend, 0x1100);

        assert_eq!(records[2].address, 0x4010);
        assert_eq!(records[2].bind_type, SymbolType::ThreadedRebaseAuth);
        assert_eq!(records[2].addend, 0x1120);
    }
}
