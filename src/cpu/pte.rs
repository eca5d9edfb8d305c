//! Page-table entry layout shared by Sv39/Sv48 and their x4 guest variants.
//!
//! ```text
//!  63      54 53                10 9  8 7 6 5 4 3 2 1 0
//! +----------+--------------------+----+-+-+-+-+-+-+-+-+
//! |   pad    |        PPN         |RSW |D|A|G|U|X|W|R|V|
//! +----------+--------------------+----+-+-+-+-+-+-+-+-+
//! ```

pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_G: u64 = 1 << 5;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

const PPN_SHIFT: u32 = 10;
const PPN_MASK: u64 = 0xFFF_FFFF_FFFF; // 44 bits
const PAD_SHIFT: u32 = 54;
const PAD_MASK: u64 = 0x3FF; // 10 bits

/// Size of one entry in bytes.
pub const PTE_SIZE: u64 = 8;
/// Bits of VPN consumed per level.
pub const VPN_BITS: u32 = 9;
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(pub u64);

impl Pte {
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn valid(self) -> bool {
        self.0 & PTE_V != 0
    }

    pub fn readable(self) -> bool {
        self.0 & PTE_R != 0
    }

    pub fn writable(self) -> bool {
        self.0 & PTE_W != 0
    }

    pub fn executable(self) -> bool {
        self.0 & PTE_X != 0
    }

    pub fn user(self) -> bool {
        self.0 & PTE_U != 0
    }

    pub fn accessed(self) -> bool {
        self.0 & PTE_A != 0
    }

    pub fn dirty(self) -> bool {
        self.0 & PTE_D != 0
    }

    pub fn ppn(self) -> u64 {
        (self.0 >> PPN_SHIFT) & PPN_MASK
    }

    pub fn pad(self) -> u64 {
        (self.0 >> PAD_SHIFT) & PAD_MASK
    }

    /// A nonzero pad also terminates the walk, so it is caught as a leaf and
    /// then rejected by the permission check.
    pub fn is_leaf(self) -> bool {
        self.readable() || self.executable() || self.pad() != 0
    }

    /// `!V` or write-without-read.
    pub fn is_malformed(self) -> bool {
        !self.valid() || (self.writable() && !self.readable())
    }

    /// Base physical address of the page or next-level table.
    pub fn target(self) -> u64 {
        self.ppn() << PAGE_SHIFT
    }

    pub fn with_flags(self, flags: u64) -> Self {
        Self(self.0 | flags)
    }

    pub fn encode(ppn: u64, flags: u64) -> Self {
        Self(((ppn & PPN_MASK) << PPN_SHIFT) | (flags & 0x3FF))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_decode() {
        let pte = Pte::encode(0x80201, PTE_V | PTE_R | PTE_W | PTE_A);
        assert!(pte.valid());
        assert!(pte.readable() && pte.writable());
        assert!(!pte.executable() && !pte.user() && !pte.dirty());
        assert_eq!(pte.ppn(), 0x80201);
        assert_eq!(pte.target(), 0x8020_1000);
        assert!(pte.is_leaf());
    }

    #[test]
    fn test_write_only_is_malformed() {
        let pte = Pte::encode(1, PTE_V | PTE_W);
        assert!(pte.is_malformed());
        assert!(!pte.is_leaf());
        assert!(Pte(0).is_malformed());
    }

    #[test]
    fn test_pad_bits_terminate_walk() {
        let pte = Pte((1 << 60) | PTE_V);
        assert_eq!(pte.pad(), 1 << 6);
        assert!(pte.is_leaf());
        assert_eq!(pte.ppn(), 0);
    }
}
