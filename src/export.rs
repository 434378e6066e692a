use std::io::Cursor;
use std::ops::ControlFlow;

use byteorder::ReadBytesExt;

use crate::codec::CursorExt;
use crate::consts::*;
use crate::errors::{Error, Result};

/// Deepest node nesting accepted before the trie is considered malformed.
pub const MAX_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportKind {
    Regular,
    ThreadLocal,
    Absolute,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExportType {
    Regular { address: u64 },
    Weak { address: u64 },
    Reexport { ordinal: u64, name: String },
    Stub { stub: u64, resolver: u64 },
}

impl ExportType {
    pub fn address(&self) -> Option<u64> {
        match *self {
            ExportType::Reexport { .. } => None,
            ExportType::Regular { address } | ExportType::Weak { address } | ExportType::Stub { stub: address, .. } => {
                Some(address)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSymbol {
    pub name: String,
    pub kind: ExportKind,
    pub flags: u32,
    pub export: ExportType,
}

impl ExportSymbol {
    pub fn address(&self) -> Option<u64> {
        self.export.address()
    }

    pub fn is_reexport(&self) -> bool {
        matches!(self.export, ExportType::Reexport { .. })
    }
}

struct Node {
    terminal: Option<(u64, u64)>,
    edges: Vec<(String, u64)>,
}

/// A view of the export trie of one image.
///
/// Addresses of non re-exported symbols are rebased on `base`.
pub struct ExportTrie<'a> {
    payload: &'a [u8],
    base: u64,
}

impl<'a> ExportTrie<'a> {
    pub fn new(payload: &'a [u8], base: u64) -> Self {
        ExportTrie { payload, base }
    }

    fn malformed<S: Into<String>>(offset: u64, reason: S) -> Error {
        Error::malformed(offset, reason)
    }

    /// Terminal payload range and edges of the node at `offset`.
    fn node(&self, offset: u64) -> Result<Node> {
        if offset >= self.payload.len() as u64 {
            return Err(Self::malformed(offset, "node offset out of trie"));
        }

        let mut cur = Cursor::new(self.payload);

        cur.set_position(offset);

        let terminal_size = cur.read_uleb128()?;
        let terminal_start = cur.position();
        let children = terminal_start
            .checked_add(terminal_size)
            .filter(|&pos| pos < self.payload.len() as u64)
            .ok_or_else(|| Self::malformed(offset, "terminal runs past the trie"))?;

        cur.set_position(children);

        let edges = (0..cur.read_u8()?)
            .map(|_| {
                let name = cur.read_cstr()?;
                let child = cur.read_uleb128()?;

                Ok((name, child))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Node {
            terminal: if terminal_size == 0 {
                None
            } else {
                Some((terminal_start, children))
            },
            edges,
        })
    }

    fn symbol(&self, name: String, terminal: (u64, u64)) -> Result<ExportSymbol> {
        let (start, end) = terminal;
        let mut cur = Cursor::new(&self.payload[..end as usize]);

        cur.set_position(start);

        let flags = cur.read_uleb128()?;
        let kind = match flags as u8 & EXPORT_SYMBOL_FLAGS_KIND_MASK {
            EXPORT_SYMBOL_FLAGS_KIND_REGULAR => ExportKind::Regular,
            EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL => ExportKind::ThreadLocal,
            EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE => ExportKind::Absolute,
            kind => return Err(Self::malformed(start, format!("unknown export kind {}", kind))),
        };
        let flags = flags as u32;

        let export = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            let ordinal = cur.read_uleb128()?;
            let name = cur.read_cstr()?;

            ExportType::Reexport { ordinal, name }
        } else if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            let stub = cur.read_uleb128()?;
            let resolver = cur.read_uleb128()?;

            ExportType::Stub {
                stub: self.base.wrapping_add(stub),
                resolver: self.base.wrapping_add(resolver),
            }
        } else {
            let address = self.base.wrapping_add(cur.read_uleb128()?);

            if flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0 {
                ExportType::Weak { address }
            } else {
                ExportType::Regular { address }
            }
        };

        Ok(ExportSymbol {
            name,
            kind,
            flags,
            export,
        })
    }

    fn mark(&self, visited: &mut [u8], offset: u64) -> Result<()> {
        let (idx, bit) = ((offset / 8) as usize, 1 << (offset % 8));

        match visited.get_mut(idx) {
            Some(b) if *b & bit == 0 => {
                *b |= bit;
                Ok(())
            }
            Some(_) => Err(Self::malformed(offset, "node visited twice")),
            None => Err(Self::malformed(offset, "node offset out of trie")),
        }
    }

    /// Enumerate every exported symbol, depth first in edge order.
    ///
    /// Symbols reached before a malformed node are still visited.
    pub fn visit<F>(&self, mut visitor: F) -> Result<()>
    where
        F: FnMut(&ExportSymbol) -> ControlFlow<()>,
    {
        if self.payload.is_empty() {
            return Ok(());
        }

        let mut visited = vec![0u8; (self.payload.len() + 7) / 8];
        let mut stack = vec![(String::new(), 0u64, 0usize)];

        while let Some((prefix, offset, depth)) = stack.pop() {
            if depth >= MAX_DEPTH {
                return Err(Self::malformed(offset, "export trie too deep"));
            }

            self.mark(&mut visited, offset)?;

            let node = self.node(offset)?;

            if let Some(terminal) = node.terminal {
                if prefix.is_empty() {
                    return Err(Self::malformed(offset, "terminal without name"));
                }

                let symbol = self.symbol(prefix.clone(), terminal)?;

                trace!("export {:?}", symbol);

                if visitor(&symbol).is_break() {
                    return Ok(());
                }
            }

            for (edge, child) in node.edges.into_iter().rev() {
                if child == 0 {
                    return Err(Self::malformed(offset, "child offset is zero"));
                }
                if prefix.is_empty() && edge.is_empty() {
                    return Err(Self::malformed(offset, "empty edge from root"));
                }

                stack.push((prefix.clone() + &edge, child, depth + 1));
            }
        }

        Ok(())
    }

    /// All exported symbols, or the first malformed node.
    pub fn symbols(&self) -> Result<Vec<ExportSymbol>> {
        let mut symbols = Vec::new();

        self.visit(|symbol| {
            symbols.push(symbol.clone());
            ControlFlow::Continue(())
        })?;

        Ok(symbols)
    }

    /// Follow only the edges matching `name`.
    pub fn find(&self, name: &str) -> Result<Option<ExportSymbol>> {
        if self.payload.is_empty() || name.is_empty() {
            return Ok(None);
        }

        let mut visited = vec![0u8; (self.payload.len() + 7) / 8];
        let mut rest = name;
        let mut offset = 0;

        for _ in 0..MAX_DEPTH {
            self.mark(&mut visited, offset)?;

            let node = self.node(offset)?;

            if rest.is_empty() {
                return node
                    .terminal
                    .map(|terminal| self.symbol(name.to_owned(), terminal))
                    .transpose();
            }

            match node.edges.into_iter().find(|(edge, _)| !edge.is_empty() && rest.starts_with(edge.as_str())) {
                Some((_, 0)) => return Err(Self::malformed(offset, "child offset is zero")),
                Some((edge, child)) => {
                    rest = &rest[edge.len()..];
                    offset = child;
                }
                None => return Ok(None),
            }
        }

        Err(Self::malformed(offset, "export trie too deep"))
    }
}
