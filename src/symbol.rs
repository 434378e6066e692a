use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::ControlFlow;
use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

use crate::consts::*;
use crate::errors::{Error, Result};
use crate::source::ByteSource;

/// String tables are read in chunks of this size, the cancellation point.
pub const STRING_CHUNK_SIZE: usize = 32 * 1024;

/// Upper bound of a symbol table read from a source of unknown size.
const MAX_UNSIZED_TABLE: usize = 256 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    Undefined,
    Absolute,
    Section,
    Prebound,
    Indirect,
    /// A symbolic debugging entry, with its `n_type`.
    Debug(u8),
    Unknown(u8),
}

/// A `nlist` entry, upgraded to the 64-bit layout.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Nlist {
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    pub const SIZE_32: usize = 12;
    pub const SIZE_64: usize = 16;

    pub fn size(is_64bit: bool) -> usize {
        if is_64bit {
            Self::SIZE_64
        } else {
            Self::SIZE_32
        }
    }

    pub fn parse<O: ByteOrder, T: AsRef<[u8]>>(cur: &mut Cursor<T>, is_64bit: bool) -> Result<Nlist> {
        Ok(Nlist {
            n_strx: cur.read_u32::<O>()?,
            n_type: cur.read_u8()?,
            n_sect: cur.read_u8()?,
            n_desc: cur.read_u16::<O>()?,
            n_value: if is_64bit {
                cur.read_u64::<O>()?
            } else {
                u64::from(cur.read_u32::<O>()?)
            },
        })
    }

    /// Decode every whole entry in `buf`.
    pub fn parse_all(buf: &[u8], is_64bit: bool, bigend: bool) -> Vec<Nlist> {
        let count = buf.len() / Self::size(is_64bit);
        let mut cur = Cursor::new(buf);

        (0..count)
            .filter_map(|_| {
                if bigend {
                    Self::parse::<BigEndian, _>(&mut cur, is_64bit).ok()
                } else {
                    Self::parse::<LittleEndian, _>(&mut cur, is_64bit).ok()
                }
            })
            .collect()
    }

    pub fn kind(&self) -> SymbolKind {
        if self.is_stab() {
            return SymbolKind::Debug(self.n_type);
        }

        match self.n_type & N_TYPE {
            N_UNDF => SymbolKind::Undefined,
            N_ABS => SymbolKind::Absolute,
            N_SECT => SymbolKind::Section,
            N_PBUD => SymbolKind::Prebound,
            N_INDR => SymbolKind::Indirect,
            t => SymbolKind::Unknown(t),
        }
    }

    pub fn is_stab(&self) -> bool {
        (self.n_type & N_STAB) != 0
    }

    pub fn is_external(&self) -> bool {
        (self.n_type & N_EXT) != 0
    }

    pub fn is_private_external(&self) -> bool {
        (self.n_type & N_PEXT) != 0
    }

    /// Defined in some section, not a debugging entry.
    pub fn is_defined(&self) -> bool {
        !self.is_stab() && (self.n_type & N_TYPE) == N_SECT
    }

    pub fn is_undefined(&self) -> bool {
        !self.is_stab() && (self.n_type & N_TYPE) == N_UNDF
    }

    pub fn is_thumb(&self) -> bool {
        (self.n_desc & N_ARM_THUMB_DEF) != 0
    }

    pub fn library_ordinal(&self) -> u8 {
        get_library_ordinal(self.n_desc)
    }
}

/// A symbol with its name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub kind: SymbolKind,
    pub section: u8,
    pub external: bool,
    pub private_external: bool,
    pub thumb: bool,
    pub ordinal: u8,
}

impl Symbol {
    pub const BAD_NAME: &'static str = "<bad name>";
}

/// String tables keyed by their file offset.
///
/// Images of one shared cache share a single string blob, it is read once per
/// cache instance.
#[derive(Debug, Default)]
pub struct StringTableCache {
    tables: RefCell<HashMap<u64, Rc<[u8]>>>,
}

impl StringTableCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, offset: u64) -> Option<Rc<[u8]>> {
        self.tables.borrow().get(&offset).cloned()
    }

    pub fn insert(&self, offset: u64, data: Rc<[u8]>) {
        self.tables.borrow_mut().insert(offset, data);
    }

    pub fn len(&self) -> usize {
        self.tables.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.borrow().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SymbolTable {
    nlists: Vec<Nlist>,
    strings: Rc<[u8]>,
}

impl SymbolTable {
    pub fn new(nlists: Vec<Nlist>, strings: Rc<[u8]>) -> Self {
        SymbolTable { nlists, strings }
    }

    pub fn len(&self) -> usize {
        self.nlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nlists.is_empty()
    }

    pub fn nlists(&self) -> &[Nlist] {
        &self.nlists
    }

    pub fn strings(&self) -> &Rc<[u8]> {
        &self.strings
    }

    /// The name at `strx`, or `None` when the index is outside the string table.
    pub fn name(&self, strx: u32) -> Option<Cow<str>> {
        let raw = self.strings.get(strx as usize..)?;
        let len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());

        Some(String::from_utf8_lossy(&raw[..len]))
    }

    pub fn symbol(&self, index: usize) -> Option<Symbol> {
        self.nlists.get(index).map(|nlist| self.resolve(nlist))
    }

    fn resolve(&self, nlist: &Nlist) -> Symbol {
        Symbol {
            name: self
                .name(nlist.n_strx)
                .map(Cow::into_owned)
                .unwrap_or_else(|| Symbol::BAD_NAME.to_owned()),
            value: nlist.n_value,
            kind: nlist.kind(),
            section: nlist.n_sect,
            external: nlist.is_external(),
            private_external: nlist.is_private_external(),
            thumb: nlist.is_thumb(),
            ordinal: nlist.library_ordinal(),
        }
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.nlists.iter().map(|nlist| self.resolve(nlist)).collect()
    }

    /// Visit `(address, name, thumb)` of every defined symbol.
    pub fn visit_symbols<F>(&self, mut visitor: F) -> ControlFlow<()>
    where
        F: FnMut(u64, &str, bool) -> ControlFlow<()>,
    {
        for nlist in self.nlists.iter().filter(|nlist| nlist.is_defined()) {
            match self.name(nlist.n_strx) {
                Some(name) => visitor(nlist.n_value, &name, nlist.is_thumb())?,
                None => warn!("symbol at 0x{:x} has bad string index {}", nlist.n_value, nlist.n_strx),
            }
        }

        ControlFlow::Continue(())
    }

    /// The first defined, non-debugging symbol named `name`.
    pub fn find_defined(&self, name: &str) -> Option<&Nlist> {
        self.nlists
            .iter()
            .find(|nlist| nlist.is_defined() && self.name(nlist.n_strx).map_or(false, |s| s == name))
    }
}

/// Reads `LC_SYMTAB` tables from a byte source.
pub struct SymbolTableLoader<'a> {
    source: &'a dyn ByteSource,
    is_64bit: bool,
    bigend: bool,
    cache: &'a StringTableCache,
    cancel: Option<&'a dyn Fn() -> bool>,
}

impl<'a> SymbolTableLoader<'a> {
    pub fn new(source: &'a dyn ByteSource, is_64bit: bool, bigend: bool, cache: &'a StringTableCache) -> Self {
        SymbolTableLoader {
            source,
            is_64bit,
            bigend,
            cache,
            cancel: None,
        }
    }

    /// Poll `cancel` between string table chunks; returning `true` aborts the load.
    pub fn with_cancel(mut self, cancel: &'a dyn Fn() -> bool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Load `nsyms` entries at `symoff` and `strsize` bytes of strings at `stroff`.
    ///
    /// Both offsets are positions in the source. Tables that extend past the
    /// end of the source are clamped.
    pub fn load(&self, symoff: u64, nsyms: u32, stroff: u64, strsize: u32) -> Result<SymbolTable> {
        let entry_size = Nlist::size(self.is_64bit);
        let mut len = nsyms as usize * entry_size;

        if self.source.size().is_none() && len > MAX_UNSIZED_TABLE {
            warn!("symbol table with {} entries too large, clamped", nsyms);

            len = MAX_UNSIZED_TABLE - MAX_UNSIZED_TABLE % entry_size;
        }

        let buf = self.source.read_clamped(symoff, len);

        if buf.len() < nsyms as usize * entry_size {
            warn!(
                "symbol table at 0x{:x} clamped from {} to {} entries",
                symoff,
                nsyms,
                buf.len() / entry_size
            );
        }

        let nlists = Nlist::parse_all(&buf, self.is_64bit, self.bigend);
        let strings = self.load_strings(stroff, strsize as usize)?;

        debug!("loaded {} symbols, {} bytes string table", nlists.len(), strings.len());

        Ok(SymbolTable { nlists, strings })
    }

    fn load_strings(&self, stroff: u64, strsize: usize) -> Result<Rc<[u8]>> {
        if let Some(strings) = self.cache.get(stroff) {
            if strings.len() >= strsize {
                trace!("reuse cached string table at 0x{:x}", stroff);

                return Ok(strings);
            }
        }

        let strsize = match self.source.size() {
            Some(size) if stroff.saturating_add(strsize as u64) > size => {
                let clamped = size.saturating_sub(stroff) as usize;

                warn!("string table at 0x{:x} clamped from {} to {} bytes", stroff, strsize, clamped);

                clamped
            }
            _ => strsize,
        };

        let mut strings = Vec::with_capacity(strsize.min(MAX_UNSIZED_TABLE));

        while strings.len() < strsize {
            if self.cancel.map_or(false, |cancel| cancel()) {
                debug!("string table loading cancelled at {} of {} bytes", strings.len(), strsize);

                return Err(Error::Cancelled);
            }

            let want = (strsize - strings.len()).min(STRING_CHUNK_SIZE);
            let chunk = self.source.read_clamped(stroff + strings.len() as u64, want);
            let short = chunk.len() < want;

            strings.extend_from_slice(&chunk);

            if short {
                warn!("string table at 0x{:x} truncated at {} bytes", stroff, strings.len());

                break;
            }
        }

        let strings: Rc<[u8]> = strings.into();

        self.cache.insert(stroff, strings.clone());

        Ok(strings)
    }
}

#[cfg(test)]
pub mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::testdata::*;

    fn sample_table(nsyms: u32) -> Vec<u8> {
        let mut data = [
            nlist64(1, N_SECT | N_EXT, 1, 0, 0x1010),
            nlist64(6, N_UNDF | N_EXT, NO_SECT, 0x0200, 0),
            nlist64(11, N_SECT, 1, N_ARM_THUMB_DEF, 0x2001),
            nlist64(0x100, N_SECT | N_EXT, 1, 0, 0x3000),
        ]
        .concat();

        data.truncate(nsyms as usize * Nlist::SIZE_64);
        place(&mut data, 0x100, b"\0_foo\0_bar\0_thm\0");
        data
    }

    #[test]
    fn test_load_symbols() {
        let _ = pretty_env_logger::try_init();

        let data = sample_table(4);
        let cache = StringTableCache::new();
        let table = SymbolTableLoader::new(&data, true, false, &cache)
            .load(0, 4, 0x100, 16)
            .unwrap();

        assert_eq!(table.len(), 4);

        let symbols = table.symbols();

        assert_eq!(symbols[0].name, "_foo");
        assert_eq!(symbols[0].value, 0x1010);
        assert_eq!(symbols[0].kind, SymbolKind::Section);
        assert!(symbols[0].external);
        assert_eq!(symbols[1].kind, SymbolKind::Undefined);
        assert_eq!(symbols[1].ordinal, 2);
        assert!(symbols[2].thumb);
        assert!(!symbols[2].external);
        assert_eq!(symbols[3].name, Symbol::BAD_NAME);
        assert_eq!(table.find_defined("_thm").map(|n| n.n_value), Some(0x2001));
        assert!(table.find_defined("_bar").is_none());
    }

    #[test]
    fn test_clamp_symbol_count() {
        let _ = pretty_env_logger::try_init();

        let data = sample_table(4);
        let cache = StringTableCache::new();
        let loader = SymbolTableLoader::new(&data, true, false, &cache);

        // declare far more symbols than the file holds
        let table = loader.load(0x20, 1000, 0x100, 16).unwrap();
        let available = data.len() - 0x20;

        assert!(table.len() <= available / Nlist::SIZE_64);

        let table = loader.load(data.len() as u64 + 0x10, 5, 0x100, 16).unwrap();

        assert!(table.is_empty());
    }

    #[test]
    fn test_upgrade_32bit_entries() {
        let mut data = [nlist32(1, N_SECT | N_EXT, 1, 0, 0x1010), nlist32(6, N_ABS, NO_SECT, 0, 0x42)].concat();

        place(&mut data, 0x40, b"\0_foo\0_abs\0");

        let cache = StringTableCache::new();
        let table = SymbolTableLoader::new(&data, false, false, &cache)
            .load(0, 2, 0x40, 11)
            .unwrap();

        assert_eq!(
            table.nlists()[0],
            Nlist {
                n_strx: 1,
                n_type: N_SECT | N_EXT,
                n_sect: 1,
                n_desc: 0,
                n_value: 0x1010,
            }
        );
        assert_eq!(table.symbol(1).unwrap().kind, SymbolKind::Absolute);
    }

    #[test]
    fn test_string_table_cache() {
        let data = sample_table(2);
        let cache = StringTableCache::new();
        let loader = SymbolTableLoader::new(&data, true, false, &cache);

        let first = loader.load(0, 2, 0x100, 16).unwrap();
        let second = loader.load(0, 1, 0x100, 16).unwrap();

        assert_eq!(cache.len(), 1);
        assert!(Rc::ptr_eq(first.strings(), second.strings()));
    }

    #[test]
    fn test_cancel_string_loading() {
        let mut data = vec![0u8; 16];

        place(&mut data, STRING_CHUNK_SIZE * 3, &[0]);

        let polls = Cell::new(0);
        let cancel = || {
            polls.set(polls.get() + 1);
            polls.get() > 1
        };
        let cache = StringTableCache::new();
        let result = SymbolTableLoader::new(&data, true, false, &cache)
            .with_cancel(&cancel)
            .load(0, 0, 16, (STRING_CHUNK_SIZE * 2) as u32);

        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(polls.get(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_visit_symbols() {
        let data = sample_table(3);
        let cache = StringTableCache::new();
        let table = SymbolTableLoader::new(&data, true, false, &cache)
            .load(0, 3, 0x100, 16)
            .unwrap();
        let mut seen = Vec::new();

        let _ = table.visit_symbols(|addr, name, thumb| {
            seen.push((addr, name.to_owned(), thumb));
            ControlFlow::Continue(())
        });

        assert_eq!(seen, vec![(0x1010, "_foo".to_owned(), false), (0x2001, "_thm".to_owned(), true)]);
    }
}
