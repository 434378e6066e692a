//! Slide info of a dyld shared cache: where the slid pointers live and how to untag them.
use std::io::Cursor;
use std::ops::ControlFlow;

use byteorder::{ByteOrder, ReadBytesExt};

use crate::consts::*;
use crate::errors::{Error, Result};
use crate::pointer::TaggedPointer;
use crate::source::ByteSource;

/// Page covered by one version 1 bitmap byte group.
const V1_PAGE_SIZE: u64 = 4096;

const V1_HEADER_SIZE: usize = 24;
const V2_HEADER_SIZE: usize = 40;
const V3_HEADER_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideInfoV1 {
    pub toc: Vec<u16>,
    pub entries_size: u32,
    pub entries: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideInfoV2 {
    pub page_size: u32,
    pub page_starts: Vec<u16>,
    pub page_extras: Vec<u16>,
    pub delta_mask: u64,
    pub value_add: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlideInfoV3 {
    pub page_size: u32,
    pub page_starts: Vec<u16>,
    pub auth_value_add: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlideInfo {
    V1(SlideInfoV1),
    V2(SlideInfoV2),
    V3(SlideInfoV3),
}

fn read_u16_array<O: ByteOrder, S: ByteSource + ?Sized>(
    source: &S,
    offset: u64,
    count: u32,
    what: &str,
) -> Vec<u16> {
    let buf = source.read_clamped(offset, count as usize * 2);

    if buf.len() < count as usize * 2 {
        warn!("{} clamped from {} to {} entries", what, count, buf.len() / 2);
    }

    buf.chunks_exact(2).map(O::read_u16).collect()
}

impl SlideInfo {
    /// Parse the slide info at `offset`; unknown versions are reported as `None`.
    pub fn parse<O: ByteOrder, S: ByteSource + ?Sized>(source: &S, offset: u64) -> Result<Option<SlideInfo>> {
        let mut version = [0; 4];

        source.read_exact_at(offset, &mut version)?;

        match O::read_u32(&version) {
            1 => {
                let buf = source.read_vec_at(offset, V1_HEADER_SIZE)?;
                let mut cur = Cursor::new(&buf[4..]);
                let toc_offset = cur.read_u32::<O>()?;
                let toc_count = cur.read_u32::<O>()?;
                let entries_offset = cur.read_u32::<O>()?;
                let entries_count = cur.read_u32::<O>()?;
                let entries_size = cur.read_u32::<O>()?;

                let toc = read_u16_array::<O, _>(source, offset + u64::from(toc_offset), toc_count, "slide toc");
                let len = entries_count as usize * entries_size as usize;
                let entries = source.read_clamped(offset + u64::from(entries_offset), len);

                if entries.len() < len {
                    warn!("slide entries clamped from {} to {} bytes", len, entries.len());
                }

                Ok(Some(SlideInfo::V1(SlideInfoV1 {
                    toc,
                    entries_size,
                    entries,
                })))
            }
            2 => {
                let buf = source.read_vec_at(offset, V2_HEADER_SIZE)?;
                let mut cur = Cursor::new(&buf[4..]);
                let page_size = cur.read_u32::<O>()?;
                let page_starts_offset = cur.read_u32::<O>()?;
                let page_starts_count = cur.read_u32::<O>()?;
                let page_extras_offset = cur.read_u32::<O>()?;
                let page_extras_count = cur.read_u32::<O>()?;
                let delta_mask = cur.read_u64::<O>()?;
                let value_add = cur.read_u64::<O>()?;

                if page_size == 0 {
                    return Err(Error::malformed(offset, "slide info with zero page size"));
                }
                if delta_mask == 0 {
                    return Err(Error::malformed(offset, "slide info with empty delta mask"));
                }

                Ok(Some(SlideInfo::V2(SlideInfoV2 {
                    page_size,
                    page_starts: read_u16_array::<O, _>(
                        source,
                        offset + u64::from(page_starts_offset),
                        page_starts_count,
                        "slide page starts",
                    ),
                    page_extras: read_u16_array::<O, _>(
                        source,
                        offset + u64::from(page_extras_offset),
                        page_extras_count,
                        "slide page extras",
                    ),
                    delta_mask,
                    value_add,
                })))
            }
            3 => {
                let buf = source.read_vec_at(offset, V3_HEADER_SIZE)?;
                let mut cur = Cursor::new(&buf[4..]);
                let page_size = cur.read_u32::<O>()?;
                let page_starts_count = cur.read_u32::<O>()?;
                let _pad = cur.read_u32::<O>()?;
                let auth_value_add = cur.read_u64::<O>()?;

                if page_size == 0 {
                    return Err(Error::malformed(offset, "slide info with zero page size"));
                }

                Ok(Some(SlideInfo::V3(SlideInfoV3 {
                    page_size,
                    page_starts: read_u16_array::<O, _>(
                        source,
                        offset + V3_HEADER_SIZE as u64,
                        page_starts_count,
                        "slide page starts",
                    ),
                    auth_value_add,
                })))
            }
            version => {
                warn!("unsupported slide info version {}", version);

                Ok(None)
            }
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            SlideInfo::V1(_) => 1,
            SlideInfo::V2(_) => 2,
            SlideInfo::V3(_) => 3,
        }
    }

    pub fn page_size(&self) -> u64 {
        match self {
            SlideInfo::V1(_) => V1_PAGE_SIZE,
            SlideInfo::V2(info) => u64::from(info.page_size),
            SlideInfo::V3(info) => u64::from(info.page_size),
        }
    }

    /// Strip the chain bits of a slid pointer.
    pub fn untag(&self, raw: u64) -> u64 {
        match self {
            SlideInfo::V1(_) => raw,
            SlideInfo::V2(info) => (raw & !info.delta_mask).wrapping_add(info.value_add),
            SlideInfo::V3(info) => TaggedPointer(raw).untag(info.auth_value_add),
        }
    }

    fn delta(&self, raw: u64) -> u64 {
        match self {
            SlideInfo::V1(_) => 0,
            SlideInfo::V2(info) => (raw & info.delta_mask) >> (info.delta_mask.trailing_zeros().saturating_sub(2)),
            SlideInfo::V3(_) => TaggedPointer(raw).skip() * 8,
        }
    }

    /// Follow one chain from `start` up to the end of its page.
    fn walk_chain<R, F>(&self, start: u64, page_end: u64, read_ptr: &R, visitor: &mut F) -> ControlFlow<()>
    where
        R: Fn(u64) -> Option<u64>,
        F: FnMut(u64, u64, u64) -> ControlFlow<()>,
    {
        let max_steps = self.page_size() / 4;
        let mut addr = start;

        for _ in 0..max_steps {
            if addr >= page_end {
                break;
            }

            let raw = match read_ptr(addr) {
                Some(raw) => raw,
                None => {
                    warn!("slid pointer at 0x{:x} is not readable", addr);
                    break;
                }
            };

            visitor(addr, raw, self.untag(raw))?;

            let delta = self.delta(raw);

            if delta == 0 {
                break;
            }

            addr = addr.wrapping_add(delta);
        }

        ControlFlow::Continue(())
    }

    /// Visit every slid pointer of the data region starting at `data_start`.
    ///
    /// `read_ptr` reads a pointer at an address, the visitor receives the
    /// address, the raw value and the untagged value.
    pub fn visit_slid_pointers<R, F>(&self, data_start: u64, read_ptr: R, mut visitor: F) -> ControlFlow<()>
    where
        R: Fn(u64) -> Option<u64>,
        F: FnMut(u64, u64, u64) -> ControlFlow<()>,
    {
        match self {
            SlideInfo::V1(info) => {
                let entries_size = info.entries_size as usize;
                let page_size = entries_size as u64 * 8 * 4;

                for (i, &toc) in info.toc.iter().enumerate() {
                    let off = usize::from(toc).saturating_mul(entries_size);
                    let entry = match info.entries.get(off..off.saturating_add(entries_size)) {
                        Some(entry) => entry,
                        None => {
                            warn!("corrupted slide info, toc entry {} out of range", i);
                            break;
                        }
                    };
                    let page = match page_address(data_start, i, page_size) {
                        Some(page) => page,
                        None => break,
                    };

                    for (j, &b) in entry.iter().enumerate() {
                        for k in (0..8).filter(|k| b & (1 << k) != 0) {
                            let addr = page.wrapping_add(j as u64 * 8 * 4 + k * 4);

                            if let Some(raw) = read_ptr(addr) {
                                visitor(addr, raw, raw)?;
                            }
                        }
                    }
                }
            }
            SlideInfo::V2(info) => {
                let page_size = u64::from(info.page_size);

                for (i, &start) in info.page_starts.iter().enumerate() {
                    let page = match page_address(data_start, i, page_size) {
                        Some(page) => page,
                        None => break,
                    };
                    let page_end = page.saturating_add(page_size);

                    if start == DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
                        trace!("page 0x{:x} has no pointers for sliding", page);
                    } else if start & DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA == 0 {
                        self.walk_chain(page.saturating_add(u64::from(start) * 4), page_end, &read_ptr, &mut visitor)?;
                    } else {
                        for &extra in info
                            .page_extras
                            .iter()
                            .skip(usize::from(start & DYLD_CACHE_SLIDE_PAGE_VALUE))
                        {
                            let chain = page.saturating_add(u64::from(extra & DYLD_CACHE_SLIDE_PAGE_VALUE) * 4);

                            self.walk_chain(chain, page_end, &read_ptr, &mut visitor)?;

                            if extra & DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                                break;
                            }
                        }
                    }
                }
            }
            SlideInfo::V3(info) => {
                let page_size = u64::from(info.page_size);

                for (i, &start) in info.page_starts.iter().enumerate() {
                    let page = match page_address(data_start, i, page_size) {
                        Some(page) => page,
                        None => break,
                    };

                    if start == DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                        trace!("page 0x{:x} has no pointers for sliding", page);
                    } else {
                        let page_end = page.saturating_add(page_size);

                        self.walk_chain(page.saturating_add(u64::from(start)), page_end, &read_ptr, &mut visitor)?;
                    }
                }
            }
        }

        ControlFlow::Continue(())
    }
}

/// The address of page `index` of a data region, unless it wraps.
fn page_address(data_start: u64, index: usize, page_size: u64) -> Option<u64> {
    let page = (index as u64)
        .checked_mul(page_size)
        .and_then(|off| data_start.checked_add(off));

    if page.is_none() {
        warn!("slid page #{} runs past the address space", index);
    }

    page
}
