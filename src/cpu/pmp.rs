//! Physical memory protection and the global isolation bitmap.
//!
//! Entries are scanned in index order. Each entry is matched sector by
//! sector (4 bytes at a time) so that an access which is only partially
//! covered by an entry is rejected outright, whatever the privilege mode.
//! With the table extension an entry's permissions may come from a two-level
//! permission table in memory instead of its config byte.

use super::config::PmpVariant;
use super::csr::{self, CsrFile};
use super::mmu::AccessType;
use super::PrivilegeMode;
use crate::memory::Memory;

/// pmpaddr encodes physical address bits 55:2.
const PMP_SHIFT: u32 = 2;

/// Address-matching mode from the A field of a config byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmpAddrMatch {
    Off,
    /// Top of range: `[previous pmpaddr, this pmpaddr)`
    Tor,
    /// Naturally aligned 4-byte region
    Na4,
    /// Naturally aligned power-of-two region, size from the trailing ones
    Napot,
}

impl PmpAddrMatch {
    pub fn from_cfg(cfg: u8) -> Self {
        match cfg & csr::PMP_A {
            csr::PMP_TOR => Self::Tor,
            csr::PMP_NA4 => Self::Na4,
            csr::PMP_NAPOT => Self::Napot,
            _ => Self::Off,
        }
    }
}

/// One decoded PMP entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmpEntry {
    pub cfg: u8,
    /// Raw pmpaddr value (byte address >> 2)
    pub addr: u64,
}

impl PmpEntry {
    pub fn from_csrs(csrs: &CsrFile, index: usize) -> Self {
        Self {
            cfg: csrs.pmpcfg_byte(index),
            addr: csrs.pmpaddr_raw(index),
        }
    }

    pub fn match_mode(&self) -> PmpAddrMatch {
        PmpAddrMatch::from_cfg(self.cfg)
    }

    pub fn is_locked(&self) -> bool {
        self.cfg & csr::PMP_L != 0
    }

    pub fn uses_table(&self) -> bool {
        self.cfg & csr::PMP_T != 0
    }

    /// R/W/X nibble in the same layout the permission table uses.
    pub fn perm(&self) -> u8 {
        self.cfg & (csr::PMP_R | csr::PMP_W | csr::PMP_X)
    }
}

/// Permission bit required for an access kind. PTE fetches and the read half
/// of a read-modify-write use `Read`.
fn required_perm(access: AccessType) -> u8 {
    match access {
        AccessType::Read => csr::PMP_R,
        AccessType::Write => csr::PMP_W,
        AccessType::Execute => csr::PMP_X,
    }
}

/// How an access relates to one entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Coverage {
    None,
    Partial,
    /// Fully covered; carries the region base used for table offsets.
    Full(u64),
}

/// Match `[addr, addr + len)` against one entry. `base` is the previous
/// entry's top-of-range byte address.
fn coverage(entry: &PmpEntry, base: u64, addr: u64, len: u64, grain: u32) -> Coverage {
    let tor_mask = !((1u64 << grain) - 1);
    let tor = (entry.addr & tor_mask) << PMP_SHIFT;
    let is_tor = entry.match_mode() == PmpAddrMatch::Tor;
    let is_na4 = entry.match_mode() == PmpAddrMatch::Na4;

    let mut mask = (entry.addr << 1) | u64::from(!is_na4) | !tor_mask;
    mask = !(mask & !mask.wrapping_add(1)) << PMP_SHIFT;

    // Every sector the access touches, including the one holding its last byte
    let sector_mask = !((1u64 << PMP_SHIFT) - 1);
    let first = addr & sector_mask;
    let last = addr.wrapping_add(len.max(1) - 1) & sector_mask;
    let sectors = (last.wrapping_sub(first) >> PMP_SHIFT) + 1;

    let mut any = false;
    let mut all = true;
    for i in 0..sectors {
        let cur = first.wrapping_add(i << PMP_SHIFT);
        let hit = if is_tor {
            base <= cur && cur < tor
        } else {
            (cur ^ tor) & mask == 0
        };
        any |= hit;
        all &= hit;
    }

    match (any, all) {
        (false, _) => Coverage::None,
        (true, false) => Coverage::Partial,
        (true, true) if is_tor => Coverage::Full(base),
        (true, true) => Coverage::Full(tor & mask),
    }
}

/// Look up the permission nibble for `offset` inside a table-backed region.
///
/// The root table has 512 eight-byte entries indexed by offset bits 33:25.
/// A root entry whose low nibble is exactly `0b0001` points at a leaf table
/// (entries indexed by bits 24:16, each packing sixteen 4-bit permissions for
/// the pages selected by bits 15:12); any other valid root entry carries its
/// permission directly in bits 4:1.
fn table_perm<M: Memory + ?Sized>(mem: &mut M, root: u64, offset: u64) -> Option<u8> {
    let off1 = (offset >> 25) & 0x1ff;
    let off0 = (offset >> 16) & 0x1ff;
    let page_index = (offset >> 12) & 0xf;

    let root_pte = mem.read_u64(root + (off1 << 3)).ok()?;
    if root_pte & 0xf == 1 {
        let leaf_addr = ((root_pte >> 5) << 12) + (off0 << 3) + page_index / 2;
        let byte = mem.read_u8(leaf_addr).ok()?;
        Some(if page_index % 2 == 1 { byte >> 4 } else { byte & 0xf })
    } else if root_pte & 0x1 == 1 {
        Some(((root_pte >> 1) & 0xf) as u8)
    } else {
        None
    }
}

/// Check one physical access against the configured PMP variant. Returns
/// whether the access is permitted.
pub fn pmp_check<M: Memory + ?Sized>(
    csrs: &CsrFile,
    mem: &mut M,
    addr: u64,
    len: u64,
    access: AccessType,
    mode: PrivilegeMode,
) -> bool {
    let cfg = csrs.config();
    if cfg.pmp == PmpVariant::Disabled || cfg.pmp_entries == 0 {
        return true;
    }
    let machine = mode == PrivilegeMode::Machine;
    let need = required_perm(access);

    let mut base = 0u64;
    for i in 0..cfg.pmp_entries {
        let entry = PmpEntry::from_csrs(csrs, i);
        let tor = (entry.addr & !((1u64 << cfg.pmp_grain) - 1)) << PMP_SHIFT;
        if entry.match_mode() == PmpAddrMatch::Off {
            base = tor;
            continue;
        }

        match coverage(&entry, base, addr, len, cfg.pmp_grain) {
            Coverage::None => {}
            Coverage::Partial => {
                log::warn!(
                    "pmp: access {:#x}+{} only partially matches entry {}",
                    addr,
                    len,
                    i
                );
                return false;
            }
            Coverage::Full(region) => {
                if machine && !entry.is_locked() {
                    return true;
                }
                let perm = if cfg.pmp == PmpVariant::Table && entry.uses_table() {
                    // The root table base lives in the following pmpaddr
                    let root = csrs.pmpaddr_raw(i + 1) << 12;
                    match table_perm(mem, root, addr.wrapping_sub(region)) {
                        Some(p) => p,
                        None => return false,
                    }
                } else {
                    entry.perm()
                };
                log::trace!(
                    "pmp: {:#x} {:?} mode={:?} entry {} perm={:#x}",
                    addr,
                    access,
                    mode,
                    i,
                    perm
                );
                return perm & need != 0;
            }
        }
        base = tor;
    }

    machine
}

/// Global isolation bitmap. One bit per page, scaled by the level at which
/// the last walk resolved; a set bit vetoes the access. Only active while
/// `MBMC.BME` is set and `MBMC.CMODE` is clear.
pub fn bitmap_check<M: Memory + ?Sized>(csrs: &CsrFile, mem: &mut M, addr: u64, level: usize) -> bool {
    if !csrs.config().bitmap {
        return true;
    }
    let mbmc = csrs.mbmc();
    if mbmc & csr::MBMC_BME == 0 || mbmc & csr::MBMC_CMODE != 0 {
        return true;
    }
    let bm_base = mbmc & !0x3F;
    let shift = 9 * level as u32;
    let ppn = (addr >> (shift + 12)) << shift;
    match mem.read_u8(bm_base.wrapping_add(ppn / 8)) {
        Ok(byte) => (byte >> (ppn % 8)) & 1 == 0,
        Err(e) => {
            log::warn!("bitmap: {} while checking {:#x}", e, addr);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::config::HartConfig;
    use crate::cpu::csr::*;
    use crate::memory::{Bus, DRAM_BASE};

    fn napot(base: u64, size: u64) -> u64 {
        (base >> 2) | ((size >> 3) - 1)
    }

    fn csrs_with(variant: PmpVariant) -> CsrFile {
        CsrFile::for_hart(HartConfig::default().with_pmp(variant, 16).with_bitmap(true))
    }

    #[test]
    fn test_no_match_allows_only_machine() {
        let csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x1000);
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Read, PrivilegeMode::Machine));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Read, PrivilegeMode::Supervisor));
    }

    #[test]
    fn test_tor_range() {
        let mut csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x1000);
        csrs.write(PMPADDR0, DRAM_BASE >> 2);
        csrs.write(PMPADDR0 + 1, (DRAM_BASE + 0x1000) >> 2);
        csrs.write(PMPCFG0, u64::from(PMP_TOR | PMP_R | PMP_W) << 8);
        let s = PrivilegeMode::Supervisor;
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE + 0x10, 8, AccessType::Write, s));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE + 0x10, 4, AccessType::Execute, s));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE + 0x1000, 4, AccessType::Read, s));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE - 4, 4, AccessType::Read, s));
    }

    #[test]
    fn test_locked_entry_binds_machine_mode() {
        let mut csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x1000);
        csrs.write(PMPADDR0, napot(DRAM_BASE, 0x1000));
        csrs.write(PMPCFG0, u64::from(PMP_L | PMP_NAPOT | PMP_R));
        let m = PrivilegeMode::Machine;
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Read, m));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Write, m));
    }

    #[test]
    fn test_oversized_grain_covers_whole_space() {
        let cfg = HartConfig::default().with_pmp(PmpVariant::Standard, 16).with_pmp_grain(99);
        let mut csrs = CsrFile::for_hart(cfg);
        let mut bus = Bus::new(0x1000);
        csrs.write(PMPADDR0, 0);
        csrs.write(PMPCFG0, u64::from(PMP_NAPOT | PMP_R));
        let s = PrivilegeMode::Supervisor;
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Read, s));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE, 8, AccessType::Write, s));
    }

    #[test]
    fn test_unaligned_access_spanning_entries() {
        let mut csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x1000);
        csrs.write(PMPADDR0, napot(DRAM_BASE + 0x100, 8));
        csrs.write(PMPADDR0 + 1, napot(DRAM_BASE + 0x108, 8));
        let cfg0 = u64::from(PMP_NAPOT | PMP_R | PMP_W);
        let cfg1 = u64::from(PMP_NAPOT | PMP_R);
        csrs.write(PMPCFG0, cfg0 | (cfg1 << 8));
        let s = PrivilegeMode::Supervisor;
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE + 0x106, 4, AccessType::Write, s));
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE + 0x106, 4, AccessType::Read, s));
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE + 0x109, 2, AccessType::Read, s));
    }

    #[test]
    fn test_na4_covers_four_bytes() {
        let mut csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x1000);
        csrs.write(PMPADDR0, (DRAM_BASE + 8) >> 2);
        csrs.write(PMPCFG0, u64::from(PMP_NA4 | PMP_R));
        let u = PrivilegeMode::User;
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE + 8, 4, AccessType::Read, u));
        // 8-byte access spills into the next sector
        assert!(!pmp_check(&csrs, &mut bus, DRAM_BASE + 8, 8, AccessType::Read, u));
    }

    #[test]
    fn test_table_direct_and_leaf_permissions() {
        let mut csrs = csrs_with(PmpVariant::Table);
        let mut bus = Bus::new(0x10_0000);
        let region = DRAM_BASE + 0x8_0000;
        let root = DRAM_BASE + 0x1000;
        let leaf = DRAM_BASE + 0x2000;
        // Entry 0: NAPOT 64 MiB-aligned window with table bit; entry 1 holds the root
        csrs.write(PMPADDR0, napot(DRAM_BASE, 0x400_0000));
        csrs.write(PMPADDR0 + 1, root >> 12);
        csrs.write(PMPCFG0, u64::from(PMP_NAPOT | PMP_T));

        // Root slot 0: leaf table pointer; slot 1: direct R|W
        bus.write_u64(root, ((leaf >> 12) << 5) | 1).unwrap();
        bus.write_u64(root + 8, (0b011 << 1) | 1).unwrap();
        // Leaf slot for offset 0x8_0000: off0 = 8, pages 0/1 in byte 0
        let slot = leaf + (8 << 3);
        bus.ram.write8(slot - DRAM_BASE, 0x41); // page 0: R, page 1: X

        let s = PrivilegeMode::Supervisor;
        assert!(pmp_check(&csrs, &mut bus, region, 8, AccessType::Read, s));
        assert!(!pmp_check(&csrs, &mut bus, region, 8, AccessType::Write, s));
        assert!(pmp_check(&csrs, &mut bus, region + 0x1000, 4, AccessType::Execute, s));
        assert!(pmp_check(&csrs, &mut bus, DRAM_BASE + 0x200_0000, 8, AccessType::Write, s));
    }

    #[test]
    fn test_bitmap_veto() {
        let mut csrs = csrs_with(PmpVariant::Standard);
        let mut bus = Bus::new(0x10_0000);
        let bm_base = DRAM_BASE + 0x4000;
        let target = DRAM_BASE + 0x3000;
        let ppn = target >> 12;
        bus.ram.write8(bm_base + ppn / 8 - DRAM_BASE, 1 << (ppn % 8));
        assert!(bitmap_check(&csrs, &mut bus, target, 0));
        csrs.write(MBMC, bm_base | MBMC_BME);
        assert!(!bitmap_check(&csrs, &mut bus, target, 0));
        assert!(bitmap_check(&csrs, &mut bus, target + 0x1000, 0));
        // confidential mode bypasses the bitmap
        csrs.write(MBMC, bm_base | MBMC_BME | MBMC_CMODE);
        assert!(bitmap_check(&csrs, &mut bus, target, 0));
    }
}
