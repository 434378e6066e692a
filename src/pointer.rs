use std::fmt;

/// A 64-bit pointer as stored by chained/threaded fixups on arm64e.
///
/// Bit 63 marks an authenticated pointer, bit 62 a bind, and bits 51..=61
/// hold the distance (in strides) to the next pointer of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaggedPointer(pub u64);

impl TaggedPointer {
    const AUTH_BIT: u64 = 1 << 63;
    const BIND_BIT: u64 = 1 << 62;
    const SKIP_SHIFT: u32 = 51;
    const SKIP_MASK: u64 = 0x7FF;
    const PLAIN_BITS: u32 = 51;

    pub fn new(raw: u64) -> Self {
        TaggedPointer(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_auth(self) -> bool {
        self.0 & Self::AUTH_BIT != 0
    }

    pub fn is_bind(self) -> bool {
        self.0 & Self::BIND_BIT != 0
    }

    /// Number of strides to the next pointer, 0 ends the chain.
    pub fn skip(self) -> u64 {
        (self.0 >> Self::SKIP_SHIFT) & Self::SKIP_MASK
    }

    /// PAC key (IA, IB, DA, DB) of an authenticated pointer.
    pub fn key(self) -> u8 {
        ((self.0 >> 49) & 0x3) as u8
    }

    pub fn has_addr_diversity(self) -> bool {
        self.0 & (1 << 48) != 0
    }

    pub fn diversity(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn target_offset(self) -> u32 {
        self.0 as u32
    }

    /// Import table index of a bind pointer.
    pub fn ordinal(self) -> u16 {
        self.0 as u16
    }

    /// The address the pointer refers to.
    ///
    /// Authenticated pointers keep a 32-bit offset from `base`, plain ones a
    /// 51-bit signed address.
    pub fn untag(self, base: u64) -> u64 {
        if self.is_auth() {
            base.wrapping_add(u64::from(self.target_offset()))
        } else {
            let shift = 64 - Self::PLAIN_BITS;

            (((self.0 << shift) as i64) >> shift) as u64
        }
    }
}

impl From<u64> for TaggedPointer {
    fn from(raw: u64) -> Self {
        TaggedPointer(raw)
    }
}

impl fmt::Display for TaggedPointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.is_auth(), self.is_bind()) {
            (true, true) => write!(
                f,
                "auth bind #{} (key {}, diversity 0x{:04x}{})",
                self.ordinal(),
                self.key(),
                self.diversity(),
                if self.has_addr_diversity() { ", addr" } else { "" }
            ),
            (false, true) => write!(f, "bind #{}", self.ordinal()),
            (true, false) => write!(
                f,
                "auth rebase +0x{:x} (key {}, diversity 0x{:04x}{})",
                self.target_offset(),
                self.key(),
                self.diversity(),
                if self.has_addr_diversity() { ", addr" } else { "" }
            ),
            (false, false) => write!(f, "rebase 0x{:x}", self.untag(0)),
        }
    }
}
