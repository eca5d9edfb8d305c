pub mod ram;

use std::ops::Range;

use thiserror::Error;

pub const DRAM_BASE: u64 = 0x8000_0000;

/// Failure reported by the physical memory primitive itself, independent of
/// any paging or PMP decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("physical address {0:#x} is not backed by memory")]
    Unmapped(u64),
    #[error("physical address {0:#x} is a device window")]
    Mmio(u64),
}

/// Physical memory contract consumed by the walker, the PMP table lookup and
/// the bitmap check. Reads and writes are synchronous and never block.
pub trait Memory {
    fn read_u8(&mut self, addr: u64) -> Result<u8, BusError>;
    fn read_u64(&mut self, addr: u64) -> Result<u64, BusError>;
    fn write_u64(&mut self, addr: u64, val: u64) -> Result<(), BusError>;

    /// Whether `addr` falls inside a device window. Page tables may not live there.
    fn is_mmio(&self, _addr: u64) -> bool {
        false
    }
}

/// Physical memory bus: DRAM at `DRAM_BASE` plus a list of device windows.
/// Device windows are only tracked for routing decisions; their contents are
/// not modelled here.
pub struct Bus {
    pub ram: ram::Ram,
    mmio: Vec<Range<u64>>,
}

impl Bus {
    pub fn new(ram_size: u64) -> Self {
        Self {
            ram: ram::Ram::new(ram_size),
            mmio: Vec::new(),
        }
    }

    /// Register a device window `[base, base + size)`.
    pub fn add_mmio(&mut self, base: u64, size: u64) {
        self.mmio.push(base..base.saturating_add(size));
    }

    #[inline(always)]
    fn route(&self, addr: u64) -> Result<u64, BusError> {
        if self.is_mmio(addr) {
            return Err(BusError::Mmio(addr));
        }
        match addr.checked_sub(DRAM_BASE) {
            Some(off) if off < self.ram.size() => Ok(off),
            _ => Err(BusError::Unmapped(addr)),
        }
    }

    /// Load binary data into RAM at given offset from DRAM_BASE
    pub fn load_binary(&mut self, data: &[u8], offset: u64) -> Result<(), BusError> {
        if self.ram.load(data, offset) {
            Ok(())
        } else {
            Err(BusError::Unmapped(DRAM_BASE.wrapping_add(offset)))
        }
    }
}

impl Memory for Bus {
    fn read_u8(&mut self, addr: u64) -> Result<u8, BusError> {
        let off = self.route(addr)?;
        self.ram.read8(off).ok_or(BusError::Unmapped(addr))
    }

    fn read_u64(&mut self, addr: u64) -> Result<u64, BusError> {
        let off = self.route(addr)?;
        self.ram.read64(off).ok_or(BusError::Unmapped(addr))
    }

    fn write_u64(&mut self, addr: u64, val: u64) -> Result<(), BusError> {
        let off = self.route(addr)?;
        if self.ram.write64(off, val) {
            Ok(())
        } else {
            Err(BusError::Unmapped(addr))
        }
    }

    fn is_mmio(&self, addr: u64) -> bool {
        self.mmio.iter().any(|r| r.contains(&addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dram_routing() {
        let mut bus = Bus::new(0x1000);
        bus.write_u64(DRAM_BASE + 0x10, 42).unwrap();
        assert_eq!(bus.read_u64(DRAM_BASE + 0x10), Ok(42));
        assert_eq!(bus.read_u64(0x1000), Err(BusError::Unmapped(0x1000)));
        assert_eq!(
            bus.read_u64(DRAM_BASE + 0xFFC),
            Err(BusError::Unmapped(DRAM_BASE + 0xFFC))
        );
    }

    #[test]
    fn test_mmio_window_rejected() {
        let mut bus = Bus::new(0x1000);
        bus.add_mmio(0x1000_0000, 0x100);
        assert!(bus.is_mmio(0x1000_0080));
        assert_eq!(
            bus.read_u64(0x1000_0080),
            Err(BusError::Mmio(0x1000_0080))
        );
    }
}
