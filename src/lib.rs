//! A static analysis engine for Mach-O images, dyld shared caches and
//! kernelcaches.
//!
//! Everything is read through a [`ByteSource`], a file, a memory buffer or a
//! window of another source, and every read is bounds checked: a malformed
//! input yields an error or a partial result, never a panic.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mach_dyld::{FileSource, LoadHint, MachImage, StringTableCache};
//!
//! let image = MachImage::parse(FileSource::open("/usr/lib/dyld")?, 0, LoadHint::File)?;
//! let strings = StringTableCache::new();
//!
//! for import in image.import_info(&strings)?.imports {
//!     println!("0x{:016x} {}", import.address, import.name);
//! }
//! # Ok::<(), mach_dyld::Error>(())
//! ```
#[macro_use]
extern crate log;
#[macro_use]
extern crate bitflags;

mod errors;

pub mod consts;

mod codec;
mod source;

mod commands;
mod loader;

mod symbol;

mod export;
mod opcode;
mod pointer;

mod image;

mod graph;
mod slide;

mod aslr;
mod cache;
mod kcache;

#[cfg(feature = "display")]
mod display;

#[cfg(test)]
mod testdata;

pub use crate::aslr::calc_aslr_slide;
pub use crate::cache::{
    CacheHeader, CacheImage, CacheImageSource, ImageInfo, LocalSymbols, LocalSymbolsEntry, MappingInfo, ParseFlags,
    SharedCache, TextInfo,
};
pub use crate::codec::{byteswap_if, fixed_size_string, safe_copy, CursorExt, SwapBytes};
pub use crate::commands::{
    BuildTarget, BuildTool, DyLib, LcString, LinkEditData, LoadCommand, Section, SectionAttributes, SectionFlags,
    Segment, SegmentFlags, SourceVersionTag, VersionTag,
};
pub use crate::consts::*;
#[cfg(feature = "display")]
pub use crate::display::platform_name;
pub use crate::errors::{Error, Result};
pub use crate::export::{ExportKind, ExportSymbol, ExportTrie, ExportType};
pub use crate::graph::{closure, search, Worklist};
pub use crate::image::{ExportLookup, Import, ImportInfo, LoadHint, MachImage, PlatformVersion};
pub use crate::kcache::{
    prelink_kmod_infos, KernelCache, KextImage, KextInfo, KextSource, KextStrategy, KmodInfo,
};
pub use crate::loader::{FatArch, MachCommand, MachFile, MachHeader, OFile};
pub use crate::opcode::{BindKind, BindRecord, BindSymbolFlags, RebaseRecord, SymbolType};
pub use crate::pointer::TaggedPointer;
pub use crate::slide::{SlideInfo, SlideInfoV1, SlideInfoV2, SlideInfoV3};
pub use crate::source::{ByteSource, FileSource, SubSource};
pub use crate::symbol::{Nlist, StringTableCache, Symbol, SymbolKind, SymbolTable, SymbolTableLoader};
