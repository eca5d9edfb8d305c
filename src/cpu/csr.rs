use super::config::HartConfig;
use super::PrivilegeMode;

// Machine-level CSRs
pub const MSTATUS: u16 = 0x300;
pub const MISA: u16 = 0x301;
pub const MEDELEG: u16 = 0x302;
pub const MIDELEG: u16 = 0x303;
pub const MIE: u16 = 0x304;
pub const MTVEC: u16 = 0x305;
pub const MEPC: u16 = 0x341;
pub const MCAUSE: u16 = 0x342;
pub const MTVAL: u16 = 0x343;
pub const MIP: u16 = 0x344;
pub const MTINST: u16 = 0x34A;
pub const MTVAL2: u16 = 0x34B;
pub const PMPCFG0: u16 = 0x3A0;
pub const PMPCFG2: u16 = 0x3A2;
pub const PMPADDR0: u16 = 0x3B0;
pub const PMPADDR15: u16 = 0x3BF;
pub const MHARTID: u16 = 0xF14;

// Memory bitmap control (isolation bitmap base and enables)
pub const MBMC: u16 = 0xBC2;

// Supervisor-level CSRs
pub const SSTATUS: u16 = 0x100;
pub const SIE: u16 = 0x104;
pub const STVEC: u16 = 0x105;
pub const SSCRATCH: u16 = 0x140;
pub const SEPC: u16 = 0x141;
pub const SCAUSE: u16 = 0x142;
pub const STVAL: u16 = 0x143;
pub const SIP: u16 = 0x144;
pub const SATP: u16 = 0x180;

// Hypervisor CSRs
pub const HSTATUS: u16 = 0x600;
pub const HEDELEG: u16 = 0x602;
pub const HIDELEG: u16 = 0x603;
pub const HIE: u16 = 0x604;
pub const HTVAL: u16 = 0x643;
pub const HIP: u16 = 0x644;
pub const HTINST: u16 = 0x64A;
pub const HGATP: u16 = 0x680;

// Virtual supervisor CSRs
pub const VSSTATUS: u16 = 0x200;
pub const VSIE: u16 = 0x204;
pub const VSTVEC: u16 = 0x205;
pub const VSSCRATCH: u16 = 0x240;
pub const VSEPC: u16 = 0x241;
pub const VSCAUSE: u16 = 0x242;
pub const VSTVAL: u16 = 0x243;
pub const VSIP: u16 = 0x244;
pub const VSATP: u16 = 0x280;

// MSTATUS bit masks
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP: u64 = 3 << 11;
pub const MSTATUS_MPP_SHIFT: u32 = 11;
pub const MSTATUS_FS: u64 = 3 << 13;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;
pub const MSTATUS_GVA: u64 = 1 << 38;
pub const MSTATUS_MPV: u64 = 1 << 39;
const MSTATUS_XL: u64 = (3 << 32) | (3 << 34); // UXL | SXL

// SSTATUS mask: bits visible to S-mode (and the layout of vsstatus)
pub const SSTATUS_MASK: u64 = MSTATUS_SIE
    | MSTATUS_SPIE
    | MSTATUS_SPP
    | MSTATUS_FS
    | MSTATUS_SUM
    | MSTATUS_MXR
    | (3 << 32) // UXL
    | (1 << 63); // SD

// HSTATUS bit masks
pub const HSTATUS_GVA: u64 = 1 << 6;
pub const HSTATUS_SPV: u64 = 1 << 7;
pub const HSTATUS_SPVP: u64 = 1 << 8;
pub const HSTATUS_HU: u64 = 1 << 9;
const HSTATUS_VSXL: u64 = 3 << 32;

// Interrupt bits in mip/mie
pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_VSSIP: u64 = 1 << 2;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_VSTIP: u64 = 1 << 6;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_VSEIP: u64 = 1 << 10;
pub const MIP_MEIP: u64 = 1 << 11;
pub const MIP_SGEIP: u64 = 1 << 12;
pub const MIP_LCOFIP: u64 = 1 << 13;

const S_INT_MASK: u64 = MIP_SSIP | MIP_STIP | MIP_SEIP | MIP_LCOFIP;
const VS_INT_MASK: u64 = MIP_VSSIP | MIP_VSTIP | MIP_VSEIP;
const HS_INT_MASK: u64 = VS_INT_MASK | MIP_SGEIP;

/// Exceptions the hypervisor may pass on to VS-mode.
const HEDELEG_WRITABLE: u64 = 0xB1FF;

// MBMC fields
pub const MBMC_BME: u64 = 1 << 0;
pub const MBMC_CMODE: u64 = 1 << 1;
const MBMC_BMA_MASK: u64 = !0x3F;

// PMP config byte fields
pub const PMP_R: u8 = 1 << 0;
pub const PMP_W: u8 = 1 << 1;
pub const PMP_X: u8 = 1 << 2;
pub const PMP_A: u8 = 3 << 3;
pub const PMP_T: u8 = 1 << 5;
pub const PMP_L: u8 = 1 << 7;
pub const PMP_TOR: u8 = 1 << 3;
pub const PMP_NA4: u8 = 2 << 3;
pub const PMP_NAPOT: u8 = 3 << 3;
/// pmpaddr holds bits 55:2 of the physical address
const PMPADDR_MASK: u64 = (1 << 54) - 1;

/// CSR address space size (12-bit addresses = 4096 entries)
const CSR_COUNT: usize = 4096;

/// Paging scheme selected by the MODE field of satp, vsatp or hgatp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtpMode {
    Bare,
    /// Sv39, or Sv39x4 when read from hgatp
    Sv39,
    /// Sv48, or Sv48x4 when read from hgatp
    Sv48,
}

impl AtpMode {
    pub fn from_bits(mode: u64) -> Option<Self> {
        match mode {
            0 => Some(Self::Bare),
            8 => Some(Self::Sv39),
            9 => Some(Self::Sv48),
            _ => None,
        }
    }

    pub fn levels(self) -> usize {
        match self {
            Self::Bare => 0,
            Self::Sv39 => 3,
            Self::Sv48 => 4,
        }
    }
}

/// Decoded address-translation pointer register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Atp {
    pub mode: AtpMode,
    pub ppn: u64,
}

impl Atp {
    pub fn decode(val: u64) -> Self {
        Self {
            mode: AtpMode::from_bits(val >> 60).unwrap_or(AtpMode::Bare),
            ppn: val & 0xFFF_FFFF_FFFF,
        }
    }

    pub fn is_bare(self) -> bool {
        self.mode == AtpMode::Bare
    }

    pub fn root(self) -> u64 {
        self.ppn << 12
    }
}

/// Privileged register snapshot for one hart.
pub struct CsrFile {
    /// Fixed array for all CSR registers (indexed by 12-bit address)
    regs: Box<[u64; CSR_COUNT]>,
    /// PMP configuration registers (pmpcfg0 and pmpcfg2 on RV64)
    pub pmpcfg: [u64; 2],
    /// PMP address registers (pmpaddr0-pmpaddr15)
    pub pmpaddr: [u64; 16],
    config: HartConfig,
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new()
    }
}

impl CsrFile {
    pub fn new() -> Self {
        Self::for_hart(HartConfig::default())
    }

    pub fn for_hart(config: HartConfig) -> Self {
        let mut csrs = Self {
            regs: Box::new([0u64; CSR_COUNT]),
            pmpcfg: [0; 2],
            pmpaddr: [0; 16],
            config,
        };
        // MISA: RV64 I M A S U, plus H when configured
        let mut misa = (2u64 << 62) | (1 << 0) | (1 << 8) | (1 << 12) | (1 << 18) | (1 << 20);
        if csrs.config.hypervisor {
            misa |= 1 << 7;
        }
        csrs.regs[MISA as usize] = misa;
        // UXL = SXL = 64-bit
        csrs.regs[MSTATUS as usize] = (2u64 << 32) | (2u64 << 34);
        if csrs.config.hypervisor {
            csrs.regs[HSTATUS as usize] = 2u64 << 32;
            csrs.regs[VSSTATUS as usize] = 2u64 << 32;
        }
        csrs
    }

    pub fn config(&self) -> &HartConfig {
        &self.config
    }

    /// Check if a CSR is accessible from the given privilege mode.
    /// Address bits [9:8] encode the minimum privilege level.
    pub fn check_privilege(&self, csr_addr: u16, mode: PrivilegeMode) -> bool {
        let required_priv = (csr_addr >> 8) & 3;
        // Level 2 (hypervisor and VS CSRs) is reachable from HS-mode
        let required_priv = if required_priv == 2 { 1 } else { required_priv };
        (mode as u16) >= required_priv
    }

    /// Check if a CSR is read-only (bits [11:10] == 0b11).
    pub fn is_read_only(&self, csr_addr: u16) -> bool {
        (csr_addr >> 10) & 3 == 3
    }

    fn mideleg(&self) -> u64 {
        // VS-level and guest-external interrupts are always delegated past M
        let forced = if self.config.hypervisor { HS_INT_MASK } else { 0 };
        self.regs[MIDELEG as usize] | forced
    }

    pub fn read(&self, addr: u16) -> u64 {
        match addr {
            SSTATUS => self.regs[MSTATUS as usize] & SSTATUS_MASK,
            MIDELEG => self.mideleg(),
            SIE => self.regs[MIE as usize] & self.mideleg() & S_INT_MASK,
            SIP => self.regs[MIP as usize] & self.mideleg() & S_INT_MASK,
            HIE => self.regs[MIE as usize] & HS_INT_MASK,
            HIP => self.regs[MIP as usize] & HS_INT_MASK,
            // VS-level bits appear one position lower inside the guest
            VSIE => (self.regs[MIE as usize] & self.regs[HIDELEG as usize] & VS_INT_MASK) >> 1,
            VSIP => (self.regs[MIP as usize] & self.regs[HIDELEG as usize] & VS_INT_MASK) >> 1,
            PMPCFG0 => self.pmpcfg[0],
            PMPCFG2 => self.pmpcfg[1],
            0x3A1 | 0x3A3 => 0, // odd pmpcfg registers do not exist on RV64
            PMPADDR0..=PMPADDR15 => self.pmpaddr_read((addr - PMPADDR0) as usize),
            _ => self.regs[addr as usize],
        }
    }

    /// Raw read: direct array access, bypassing SSTATUS/SIE/SIP masking.
    pub fn read_raw(&self, addr: u16) -> u64 {
        self.regs[addr as usize]
    }

    /// Raw write: direct array access, bypassing WARL filtering. The trap
    /// engine uses this for architectural side effects.
    pub fn write_raw(&mut self, addr: u16, val: u64) {
        self.regs[addr as usize] = val;
    }

    pub fn write(&mut self, addr: u16, val: u64) {
        let h = self.config.hypervisor;
        match addr {
            MISA | MHARTID => {} // Read-only
            HSTATUS | HEDELEG | HIDELEG | HIE | HTVAL | HIP | HTINST | HGATP | VSSTATUS
            | VSIE | VSTVEC | VSSCRATCH | VSEPC | VSCAUSE | VSTVAL | VSIP | VSATP
                if !h => {}
            MSTATUS => {
                let old = self.regs[MSTATUS as usize];
                let mut new_val = (val & !MSTATUS_XL) | (old & MSTATUS_XL);
                // MPP=2 is reserved; keep the previous value
                if (new_val & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT == 2 {
                    new_val = (new_val & !MSTATUS_MPP) | (old & MSTATUS_MPP);
                }
                if !h {
                    new_val &= !(MSTATUS_GVA | MSTATUS_MPV);
                }
                self.regs[MSTATUS as usize] = new_val;
            }
            SSTATUS => {
                let mstatus = self.regs[MSTATUS as usize];
                self.regs[MSTATUS as usize] = (mstatus & !SSTATUS_MASK) | (val & SSTATUS_MASK);
            }
            MEDELEG => self.regs[MEDELEG as usize] = val & !(1 << 11),
            MIDELEG => self.regs[MIDELEG as usize] = val & (S_INT_MASK | HS_INT_MASK),
            SIE => {
                let mask = self.mideleg() & S_INT_MASK;
                let mie = self.regs[MIE as usize];
                self.regs[MIE as usize] = (mie & !mask) | (val & mask);
            }
            SIP => {
                // Only SSIP is writable from S-mode
                let writable = self.mideleg() & MIP_SSIP;
                let mip = self.regs[MIP as usize];
                self.regs[MIP as usize] = (mip & !writable) | (val & writable);
            }
            PMPCFG0 => self.pmpcfg_write(0, val),
            PMPCFG2 => self.pmpcfg_write(1, val),
            0x3A1 | 0x3A3 => {}
            PMPADDR0..=PMPADDR15 => self.pmpaddr_write((addr - PMPADDR0) as usize, val),
            SATP | VSATP => {
                // Unsupported modes leave the register unchanged
                if self.atp_mode_supported(val >> 60) {
                    self.regs[addr as usize] = val;
                }
            }
            MBMC => {
                if self.config.bitmap {
                    self.regs[MBMC as usize] = val & (MBMC_BMA_MASK | MBMC_BME | MBMC_CMODE);
                }
            }
            HSTATUS => {
                let old = self.regs[HSTATUS as usize];
                self.regs[HSTATUS as usize] = (val & !HSTATUS_VSXL) | (old & HSTATUS_VSXL);
            }
            HEDELEG => self.regs[HEDELEG as usize] = val & HEDELEG_WRITABLE,
            HIDELEG => self.regs[HIDELEG as usize] = val & VS_INT_MASK,
            HIE => {
                let mie = self.regs[MIE as usize];
                self.regs[MIE as usize] = (mie & !HS_INT_MASK) | (val & HS_INT_MASK);
            }
            HIP => {
                // Only VSSIP is software-writable
                let mip = self.regs[MIP as usize];
                self.regs[MIP as usize] = (mip & !MIP_VSSIP) | (val & MIP_VSSIP);
            }
            HGATP => {
                if self.atp_mode_supported(val >> 60) {
                    // Root table is 16 KiB aligned
                    self.regs[HGATP as usize] = val & !0x3;
                }
            }
            VSSTATUS => {
                let old = self.regs[VSSTATUS as usize];
                self.regs[VSSTATUS as usize] = (old & !SSTATUS_MASK) | (val & SSTATUS_MASK);
            }
            VSIE => {
                let mask = self.regs[HIDELEG as usize] & VS_INT_MASK;
                let mie = self.regs[MIE as usize];
                self.regs[MIE as usize] = (mie & !mask) | ((val << 1) & mask);
            }
            VSIP => {
                let mask = self.regs[HIDELEG as usize] & MIP_VSSIP;
                let mip = self.regs[MIP as usize];
                self.regs[MIP as usize] = (mip & !mask) | ((val << 1) & mask);
            }
            _ => {
                self.regs[addr as usize] = val;
            }
        }
    }

    fn atp_mode_supported(&self, mode: u64) -> bool {
        match AtpMode::from_bits(mode) {
            Some(AtpMode::Sv48) => self.config.sv48,
            Some(_) => true,
            None => false,
        }
    }

    // ---- PMP register plumbing ----

    /// Config byte of entry `i`; unimplemented entries read as zero.
    pub fn pmpcfg_byte(&self, i: usize) -> u8 {
        if i >= self.config.pmp_entries {
            return 0;
        }
        (self.pmpcfg[i / 8] >> ((i % 8) * 8)) as u8
    }

    /// Address register of entry `i` as stored (before granularity masking).
    pub fn pmpaddr_raw(&self, i: usize) -> u64 {
        if i >= self.config.pmp_entries {
            return 0;
        }
        self.pmpaddr[i]
    }

    fn pmpaddr_read(&self, i: usize) -> u64 {
        let raw = self.pmpaddr_raw(i);
        let g = self.config.pmp_grain;
        let napot = self.pmpcfg_byte(i) & PMP_A == PMP_NAPOT;
        if napot && g >= 2 {
            raw | ((1u64 << (g - 1)) - 1)
        } else if !napot && g >= 1 {
            raw & !((1u64 << g) - 1)
        } else {
            raw
        }
    }

    fn pmp_locked(&self, i: usize) -> bool {
        self.pmpcfg_byte(i) & PMP_L != 0
    }

    fn pmpcfg_write(&mut self, reg: usize, val: u64) {
        let mut cfg = self.pmpcfg[reg];
        for byte in 0..8 {
            let i = reg * 8 + byte;
            if i >= self.config.pmp_entries || self.pmp_locked(i) {
                continue;
            }
            let mut b = (val >> (byte * 8)) as u8;
            // R=0, W=1 is reserved
            if b & (PMP_R | PMP_W) == PMP_W {
                b &= !PMP_W;
            }
            // NA4 cannot be selected once the grain exceeds 4 bytes
            if self.config.pmp_grain >= 1 && b & PMP_A == PMP_NA4 {
                b = (b & !PMP_A) | (cfg.to_le_bytes()[byte] & PMP_A);
            }
            let shift = byte * 8;
            cfg = (cfg & !(0xFFu64 << shift)) | (u64::from(b) << shift);
        }
        self.pmpcfg[reg] = cfg;
    }

    fn pmpaddr_write(&mut self, i: usize, val: u64) {
        if i >= self.config.pmp_entries || self.pmp_locked(i) {
            return;
        }
        // A locked TOR entry also freezes the address below it
        if i + 1 < 16 && self.pmp_locked(i + 1) && self.pmpcfg_byte(i + 1) & PMP_A == PMP_TOR {
            return;
        }
        self.pmpaddr[i] = val & PMPADDR_MASK;
    }

    // ---- field-group accessors ----

    pub fn mstatus(&self) -> u64 {
        self.regs[MSTATUS as usize]
    }

    pub fn hstatus(&self) -> u64 {
        self.regs[HSTATUS as usize]
    }

    pub fn vsstatus(&self) -> u64 {
        self.regs[VSSTATUS as usize]
    }

    pub fn satp(&self) -> Atp {
        Atp::decode(self.regs[SATP as usize])
    }

    pub fn vsatp(&self) -> Atp {
        Atp::decode(self.regs[VSATP as usize])
    }

    pub fn hgatp(&self) -> Atp {
        Atp::decode(self.regs[HGATP as usize])
    }

    pub fn mbmc(&self) -> u64 {
        self.regs[MBMC as usize]
    }

    /// Delegation masks as (machine, hypervisor) for exceptions or interrupts.
    pub fn delegation(&self, interrupt: bool) -> (u64, u64) {
        if interrupt {
            (self.mideleg(), self.regs[HIDELEG as usize])
        } else {
            (self.regs[MEDELEG as usize], self.regs[HEDELEG as usize])
        }
    }

    /// Pending and enabled interrupt bits.
    pub fn pending_enabled(&self) -> u64 {
        self.regs[MIP as usize] & self.regs[MIE as usize]
    }
}
