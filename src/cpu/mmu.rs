use super::config::AdPolicy;
use super::csr::{self, AtpMode, CsrFile};
use super::exception::{Exception, Fault};
use super::perm::{self, PermContext};
use super::pmp;
use super::pte::{Pte, PAGE_SHIFT, PAGE_SIZE, PTE_A, PTE_D, PTE_SIZE, VPN_BITS};
use super::PrivilegeMode;
use crate::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Cached per-class decision: skip the walker or run it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuState {
    Direct,
    Translate,
}

/// Which page table a walk descends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// satp, or vsatp under virtualization
    Stage1,
    /// hgatp (guest physical to host physical)
    Stage2,
}

/// One memory access as seen by the translation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationRequest {
    pub vaddr: u64,
    pub len: u64,
    pub access: AccessType,
    /// Atomic read-modify-write; failed reads report store/AMO faults
    pub amo: bool,
    /// HLVX: reads need execute permission in both stages
    pub hlvx: bool,
    /// HLV/HSV: translate as V=1 at hstatus.SPVP privilege
    pub hyper: bool,
}

impl TranslationRequest {
    pub fn new(vaddr: u64, len: u64, access: AccessType) -> Self {
        Self {
            vaddr,
            len,
            access,
            amo: false,
            hlvx: false,
            hyper: false,
        }
    }

    pub fn fetch(vaddr: u64, len: u64) -> Self {
        Self::new(vaddr, len, AccessType::Execute)
    }

    pub fn read(vaddr: u64, len: u64) -> Self {
        Self::new(vaddr, len, AccessType::Read)
    }

    pub fn write(vaddr: u64, len: u64) -> Self {
        Self::new(vaddr, len, AccessType::Write)
    }

    pub fn atomic(mut self) -> Self {
        self.amo = true;
        self
    }

    pub fn hyper(mut self) -> Self {
        self.hyper = true;
        self
    }

    pub fn hlvx(mut self) -> Self {
        self.hyper = true;
        self.hlvx = true;
        self
    }

    fn is_fetch(&self) -> bool {
        self.access == AccessType::Execute
    }
}

/// Successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub paddr: u64,
    /// Level of the leaf that produced `paddr` (0 = 4 KiB page)
    pub level: usize,
}

/// Privilege and virtualization an access is actually performed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effective {
    pub mode: PrivilegeMode,
    pub virt: bool,
}

/// Resolve MPRV and hypervisor load/store overrides for a request.
pub fn effective(
    csrs: &CsrFile,
    mode: PrivilegeMode,
    virt: bool,
    req: &TranslationRequest,
) -> Effective {
    let mut eff = Effective { mode, virt };
    if req.is_fetch() {
        return eff;
    }
    let mstatus = csrs.mstatus();
    if mstatus & csr::MSTATUS_MPRV != 0 {
        eff.mode = PrivilegeMode::from_u64(mstatus >> csr::MSTATUS_MPP_SHIFT);
        eff.virt = mstatus & csr::MSTATUS_MPV != 0 && eff.mode != PrivilegeMode::Machine;
    }
    if req.hyper {
        eff.virt = true;
        eff.mode = if csrs.hstatus() & csr::HSTATUS_SPVP != 0 {
            PrivilegeMode::Supervisor
        } else {
            PrivilegeMode::User
        };
    }
    eff
}

fn paging_active(csrs: &CsrFile, eff: Effective) -> bool {
    if eff.mode == PrivilegeMode::Machine {
        return false;
    }
    if eff.virt {
        !csrs.vsatp().is_bare() || !csrs.hgatp().is_bare()
    } else {
        !csrs.satp().is_bare()
    }
}

/// Width in bits of the guest physical address space for an hgatp mode.
fn gpa_bits(mode: AtpMode) -> u32 {
    match mode {
        AtpMode::Sv48 => 50,
        _ => 41,
    }
}

/// Width in bits of the virtual address space for a satp/vsatp mode.
fn va_bits(mode: AtpMode) -> u32 {
    match mode {
        AtpMode::Sv48 => 48,
        _ => 39,
    }
}

fn is_canonical(vaddr: u64, bits: u32) -> bool {
    let msbs = vaddr >> (bits - 1);
    msbs == 0 || msbs == (1u64 << (64 - bits + 1)) - 1
}

/// Address-translation unit. Holds the MMU-state cache and the level of the
/// last successful walk; page-table entries themselves are never cached.
pub struct Mmu {
    ifetch_state: MmuState,
    data_state: MmuState,
    hyper_state: MmuState,
    /// Level at which the most recent walk resolved (feeds the bitmap check)
    pub last_level: usize,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        Self {
            ifetch_state: MmuState::Direct,
            data_state: MmuState::Direct,
            hyper_state: MmuState::Direct,
            last_level: 0,
        }
    }

    /// Recompute every access class. Must run after anything that changes
    /// privilege, virtualization, MPRV/MPP/MPV, SPVP or a root's MODE field.
    /// Returns whether the data-class decision changed.
    pub fn update_state(&mut self, csrs: &CsrFile, mode: PrivilegeMode, virt: bool) -> bool {
        let decide = |req: TranslationRequest| {
            if paging_active(csrs, effective(csrs, mode, virt, &req)) {
                MmuState::Translate
            } else {
                MmuState::Direct
            }
        };
        let old = self.data_state;
        self.ifetch_state = decide(TranslationRequest::fetch(0, 0));
        self.data_state = decide(TranslationRequest::read(0, 0));
        self.hyper_state = decide(TranslationRequest::read(0, 0).hyper());
        log::trace!(
            "mmu state: ifetch={:?} data={:?} hyper={:?}",
            self.ifetch_state,
            self.data_state,
            self.hyper_state
        );
        old != self.data_state
    }

    /// Cached decision for the class a request belongs to.
    pub fn state(&self, req: &TranslationRequest) -> MmuState {
        if req.hyper {
            self.hyper_state
        } else if req.is_fetch() {
            self.ifetch_state
        } else {
            self.data_state
        }
    }

    /// Pre-checks that run before any translation: data alignment (when
    /// misaligned accesses trap) and address range for the active root.
    pub fn check(
        &self,
        csrs: &CsrFile,
        mode: PrivilegeMode,
        virt: bool,
        req: &TranslationRequest,
    ) -> Result<MmuState, Fault> {
        let cfg = csrs.config();
        if !req.is_fetch()
            && cfg.misaligned_trap
            && req.len.is_power_of_two()
            && req.vaddr & (req.len - 1) != 0
        {
            let cause = Exception::misaligned(req.access, req.amo);
            log::debug!("misaligned {:?} at {:#x}", req.access, req.vaddr);
            return Err(Fault::new(cause, self.tval(csrs, mode, virt, req, req.vaddr)));
        }

        let state = self.state(req);
        if state == MmuState::Translate {
            self.check_range(csrs, effective(csrs, mode, virt, req), req)?;
        }
        Ok(state)
    }

    fn check_range(&self, csrs: &CsrFile, eff: Effective, req: &TranslationRequest) -> Result<(), Fault> {
        let vaddr = req.vaddr;
        let (ok, guest) = if eff.virt && csrs.vsatp().is_bare() {
            // No VS-stage: the address is already guest physical
            let hgatp = csrs.hgatp();
            (hgatp.is_bare() || vaddr >> gpa_bits(hgatp.mode) == 0, true)
        } else {
            let atp = if eff.virt { csrs.vsatp() } else { csrs.satp() };
            (is_canonical(vaddr, va_bits(atp.mode)), false)
        };
        if ok {
            return Ok(());
        }
        log::trace!("address {:#x} out of range for active root", vaddr);
        if guest || req.hyper {
            let cause = Exception::guest_page_fault(req.access, req.amo);
            Err(Fault::guest(cause, vaddr, vaddr))
        } else {
            Err(Fault::new(
                Exception::page_fault(req.access, req.amo),
                self.sign_extend(csrs, eff, vaddr),
            ))
        }
    }

    /// Trap value for a non-guest address fault.
    fn tval(
        &self,
        csrs: &CsrFile,
        mode: PrivilegeMode,
        virt: bool,
        req: &TranslationRequest,
        vaddr: u64,
    ) -> u64 {
        self.sign_extend(csrs, effective(csrs, mode, virt, req), vaddr)
    }

    fn sign_extend(&self, csrs: &CsrFile, eff: Effective, vaddr: u64) -> u64 {
        if !csrs.config().tval_sign_extend {
            return vaddr;
        }
        let atp = if eff.virt { csrs.vsatp() } else { csrs.satp() };
        let shift = 64 - va_bits(atp.mode);
        (((vaddr << shift) as i64) >> shift) as u64
    }

    /// Translate one request that lies within a single page.
    ///
    /// Under virtualization every stage-1 table fetch and the final stage-1
    /// output go through the stage-2 walk.
    pub fn translate<M: Memory + ?Sized>(
        &mut self,
        csrs: &CsrFile,
        mem: &mut M,
        mode: PrivilegeMode,
        virt: bool,
        req: &TranslationRequest,
    ) -> Result<Translation, Fault> {
        let eff = effective(csrs, mode, virt, req);
        if !paging_active(csrs, eff) {
            self.last_level = 0;
            return Ok(Translation {
                paddr: req.vaddr,
                level: 0,
            });
        }
        self.check_range(csrs, eff, req)?;

        let result = if eff.virt && csrs.vsatp().is_bare() {
            self.walk(csrs, mem, AddressSpace::Stage2, eff, req, req.vaddr)?
        } else {
            self.walk(csrs, mem, AddressSpace::Stage1, eff, req, req.vaddr)?
        };
        self.last_level = result.level;
        log::trace!("translate {:#x} -> {:#x} (level {})", req.vaddr, result.paddr, result.level);
        Ok(result)
    }

    /// The page-table walk shared by both stages. `addr` is a virtual address
    /// for stage 1 and a guest physical address for stage 2.
    fn walk<M: Memory + ?Sized>(
        &self,
        csrs: &CsrFile,
        mem: &mut M,
        space: AddressSpace,
        eff: Effective,
        req: &TranslationRequest,
        addr: u64,
    ) -> Result<Translation, Fault> {
        let atp = match space {
            AddressSpace::Stage1 if eff.virt => csrs.vsatp(),
            AddressSpace::Stage1 => csrs.satp(),
            AddressSpace::Stage2 => csrs.hgatp(),
        };
        let levels = atp.mode.levels();
        let fail = |space: AddressSpace| self.walk_fault(csrs, space, eff, req, addr);

        if space == AddressSpace::Stage2 {
            if atp.is_bare() {
                return Ok(Translation {
                    paddr: addr,
                    level: 0,
                });
            }
            if addr >> gpa_bits(atp.mode) != 0 {
                return Err(fail(space));
            }
        }

        let mut base = atp.root();
        let mut level = levels;
        let (pte, pte_addr) = loop {
            if level == 0 {
                log::trace!("walk {:?} {:#x}: ran out of levels", space, addr);
                return Err(fail(space));
            }
            level -= 1;
            let mut pte_addr = base + vpn(addr, level, levels, space) * PTE_SIZE;
            if space == AddressSpace::Stage1 && eff.virt {
                let gpa = pte_addr;
                pte_addr = self.walk(csrs, mem, AddressSpace::Stage2, eff, req, gpa)?.paddr;
            }
            let pte = fetch_pte(csrs, mem, pte_addr, req, self.sign_extend(csrs, eff, req.vaddr))?;
            log::trace!(
                "walk {:?} {:#x}: level {} pte@{:#x} = {:#x}",
                space,
                addr,
                level,
                pte_addr,
                pte.bits()
            );
            if pte.is_malformed() {
                return Err(fail(space));
            }
            if pte.is_leaf() {
                break (pte, pte_addr);
            }
            base = pte.target();
        };

        match space {
            AddressSpace::Stage1 => {
                let ctx = self.perm_context(csrs, eff, req);
                perm::check_leaf(pte, req.access, req.amo, &ctx)
                    .map_err(|cause| Fault::new(cause, self.sign_extend(csrs, eff, req.vaddr)))?;
            }
            AddressSpace::Stage2 => {
                let mxr = csrs.mstatus() & csr::MSTATUS_MXR != 0;
                if !perm::check_guest_leaf(pte, req.access, req.hlvx, mxr) {
                    return Err(fail(space));
                }
            }
        }

        let pg_mask = (1u64 << (PAGE_SHIFT + VPN_BITS * level as u32)) - 1;
        if level > 0 && pte.target() & pg_mask != 0 {
            log::trace!("walk {:?} {:#x}: misaligned superpage at level {}", space, addr, level);
            return Err(fail(space));
        }
        let out = (pte.target() & !pg_mask) | (addr & pg_mask);

        if space == AddressSpace::Stage2 {
            return Ok(Translation { paddr: out, level });
        }

        let result = if eff.virt {
            self.walk(csrs, mem, AddressSpace::Stage2, eff, req, out)?
        } else {
            Translation { paddr: out, level }
        };

        if csrs.config().ad_policy == AdPolicy::Hardware {
            let write = req.access == AccessType::Write;
            if !pte.accessed() || (write && !pte.dirty()) {
                let updated = pte.bits() | PTE_A | if write { PTE_D } else { 0 };
                mem.write_u64(pte_addr, updated).map_err(|e| {
                    log::debug!("A/D update failed: {}", e);
                    Fault::new(
                        Exception::access_fault(req.access, req.amo),
                        self.sign_extend(csrs, eff, req.vaddr),
                    )
                })?;
            }
        }
        Ok(result)
    }

    fn perm_context(&self, csrs: &CsrFile, eff: Effective, req: &TranslationRequest) -> PermContext {
        let mstatus = csrs.mstatus();
        let vsstatus = csrs.vsstatus();
        let sum = if eff.virt {
            vsstatus & csr::MSTATUS_SUM != 0
        } else {
            mstatus & csr::MSTATUS_SUM != 0
        };
        let mxr = mstatus & csr::MSTATUS_MXR != 0 || (eff.virt && vsstatus & csr::MSTATUS_MXR != 0);
        PermContext {
            mode: eff.mode,
            sum,
            mxr,
            hlvx: req.hlvx,
            ad: csrs.config().ad_policy,
        }
    }

    fn walk_fault(
        &self,
        csrs: &CsrFile,
        space: AddressSpace,
        eff: Effective,
        req: &TranslationRequest,
        addr: u64,
    ) -> Fault {
        match space {
            AddressSpace::Stage1 => Fault::new(
                Exception::page_fault(req.access, req.amo),
                self.sign_extend(csrs, eff, req.vaddr),
            ),
            AddressSpace::Stage2 => Fault::guest(
                Exception::guest_page_fault(req.access, req.amo),
                req.vaddr,
                addr,
            ),
        }
    }
}

/// VPN slice for `level`. The top level of a stage-2 table is two bits wider.
fn vpn(addr: u64, level: usize, levels: usize, space: AddressSpace) -> u64 {
    let shift = PAGE_SHIFT + VPN_BITS * level as u32;
    let mask = if space == AddressSpace::Stage2 && level + 1 == levels {
        0x7ff
    } else {
        0x1ff
    };
    (addr >> shift) & mask
}

/// Read one page-table entry from physical memory. Page tables may not live
/// in device windows, and the implicit read is checked by PMP as an S-mode
/// load.
fn fetch_pte<M: Memory + ?Sized>(
    csrs: &CsrFile,
    mem: &mut M,
    paddr: u64,
    req: &TranslationRequest,
    tval: u64,
) -> Result<Pte, Fault> {
    // Implicit PTE reads never report AMO causes
    let fault = || Fault::new(Exception::access_fault(req.access, false), tval);
    if mem.is_mmio(paddr) {
        log::debug!("page table fetch from device window {:#x}", paddr);
        return Err(fault());
    }
    if !pmp::pmp_check(csrs, mem, paddr, PTE_SIZE, AccessType::Read, PrivilegeMode::Supervisor) {
        log::debug!("page table fetch at {:#x} denied by PMP", paddr);
        return Err(fault());
    }
    match mem.read_u64(paddr) {
        Ok(raw) => Ok(Pte(raw)),
        Err(e) => {
            log::debug!("page table fetch failed: {}", e);
            Err(fault())
        }
    }
}

/// Whether `[vaddr, vaddr + len)` crosses a page boundary.
pub fn crosses_page(vaddr: u64, len: u64) -> bool {
    (vaddr & (PAGE_SIZE - 1)) + len > PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::config::HartConfig;
    use crate::cpu::csr::{CsrFile, SATP};
    use crate::cpu::pte::*;
    use crate::memory::{Bus, DRAM_BASE};

    const RAM_SIZE: u64 = 16 * 1024 * 1024;

    /// Set up permissive PMP (allow all for S/U mode) and SATP.
    fn setup_with(cfg: HartConfig, root_page_phys: u64, mode: u64) -> (Bus, CsrFile, Mmu) {
        let bus = Bus::new(RAM_SIZE);
        let mut csrs = CsrFile::for_hart(cfg);
        let mmu = Mmu::new();
        csrs.write(SATP, (mode << 60) | (root_page_phys >> 12));
        // pmpcfg0 byte 0: A=NAPOT, R=1, W=1, X=1
        csrs.write(csr::PMPADDR0, u64::MAX);
        csrs.write(csr::PMPCFG0, 0x1F);
        (bus, csrs, mmu)
    }

    fn setup_sv39(root_page_phys: u64) -> (Bus, CsrFile, Mmu) {
        setup_with(HartConfig::default(), root_page_phys, 8)
    }

    fn leaf_pte(ppn: u64, flags: u64) -> u64 {
        (ppn << 10) | PTE_V | flags
    }

    fn pointer_pte(next_pt_phys: u64) -> u64 {
        ((next_pt_phys >> 12) << 10) | PTE_V
    }

    fn translate_s(
        mmu: &mut Mmu,
        csrs: &CsrFile,
        bus: &mut Bus,
        req: TranslationRequest,
    ) -> Result<Translation, Fault> {
        mmu.translate(csrs, bus, PrivilegeMode::Supervisor, false, &req)
    }

    // ======================== Sv39 ========================

    #[test]
    fn test_sv39_4k_page_read() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let l0_pt = DRAM_BASE + 0x3_0000;
        let target_phys = DRAM_BASE + 0x4_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);

        // vaddr 0x40_0000: VPN[2]=0, VPN[1]=2, VPN[0]=0
        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(l1_pt + 2 * 8, pointer_pte(l0_pt)).unwrap();
        bus.write_u64(l0_pt, leaf_pte(target_phys >> 12, PTE_R | PTE_W | PTE_A | PTE_D))
            .unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(0x40_0100, 8));
        assert_eq!(
            result,
            Ok(Translation {
                paddr: target_phys + 0x100,
                level: 0
            })
        );
        assert_eq!(mmu.last_level, 0);
    }

    #[test]
    fn test_sv39_write_sets_accessed_and_dirty() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let l0_pt = DRAM_BASE + 0x3_0000;
        let target_phys = DRAM_BASE + 0x4_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);

        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(l1_pt + 2 * 8, pointer_pte(l0_pt)).unwrap();
        bus.write_u64(l0_pt, leaf_pte(target_phys >> 12, PTE_R | PTE_W)).unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::write(0x40_0000, 8));
        assert_eq!(result.map(|t| t.paddr), Ok(target_phys));
        let pte_after = bus.read_u64(l0_pt).unwrap();
        assert_ne!(pte_after & PTE_A, 0, "A bit should be set");
        assert_ne!(pte_after & PTE_D, 0, "D bit should be set");
    }

    #[test]
    fn test_software_ad_policy_faults_without_update() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let l0_pt = DRAM_BASE + 0x3_0000;
        let cfg = HartConfig::default().with_ad_policy(AdPolicy::Software);
        let (mut bus, csrs, mut mmu) = setup_with(cfg, root_pt, 8);

        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(l1_pt + 2 * 8, pointer_pte(l0_pt)).unwrap();
        let pte = leaf_pte(0x80040, PTE_R | PTE_W | PTE_A);
        bus.write_u64(l0_pt, pte).unwrap();

        for _ in 0..2 {
            let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::write(0x40_0000, 8));
            assert_eq!(result, Err(Fault::new(Exception::StorePageFault, 0x40_0000)));
        }
        assert_eq!(bus.read_u64(l0_pt).unwrap(), pte);
    }

    #[test]
    fn test_sv39_2m_superpage() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let target_base = DRAM_BASE + 0x20_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);

        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(
            l1_pt + 8,
            leaf_pte(target_base >> 12, PTE_R | PTE_W | PTE_X | PTE_A | PTE_D),
        )
        .unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(0x21_2345, 4));
        assert_eq!(
            result,
            Ok(Translation {
                paddr: target_base + 0x1_2345,
                level: 1
            })
        );
    }

    #[test]
    fn test_misaligned_superpage_faults() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);

        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        // low PPN bit set on a level-1 leaf
        bus.write_u64(l1_pt + 8, leaf_pte(0x80201, PTE_R | PTE_A)).unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(0x20_0000, 4));
        assert_eq!(result, Err(Fault::new(Exception::LoadPageFault, 0x20_0000)));
    }

    #[test]
    fn test_pointer_at_level_zero_faults() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l1_pt = DRAM_BASE + 0x2_0000;
        let l0_pt = DRAM_BASE + 0x3_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);

        bus.write_u64(root_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(l1_pt, pointer_pte(l0_pt)).unwrap();
        bus.write_u64(l0_pt, pointer_pte(DRAM_BASE)).unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::fetch(0x0, 4));
        assert_eq!(result, Err(Fault::new(Exception::InstructionPageFault, 0)));
    }

    #[test]
    fn test_pte_in_device_window_is_access_fault() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let (mut bus, csrs, mut mmu) = setup_sv39(root_pt);
        bus.add_mmio(root_pt, 0x1000);

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::write(0x1000, 8));
        assert_eq!(result, Err(Fault::new(Exception::StoreAccessFault, 0x1000)));
        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(0x1000, 8).atomic());
        assert_eq!(result, Err(Fault::new(Exception::LoadAccessFault, 0x1000)));
    }

    #[test]
    fn test_sv48_walk_and_canonical_check() {
        let root_pt = DRAM_BASE + 0x1_0000;
        let l2_pt = DRAM_BASE + 0x2_0000;
        let l1_pt = DRAM_BASE + 0x3_0000;
        let l0_pt = DRAM_BASE + 0x4_0000;
        let target = DRAM_BASE + 0x5_0000;
        let cfg = HartConfig::default().with_sv48(true);
        let (mut bus, csrs, mut mmu) = setup_with(cfg, root_pt, 9);

        // vaddr 0x80_0000_0000: VPN[3]=1
        let vaddr = 0x80_0000_0000u64;
        bus.write_u64(root_pt + 8, pointer_pte(l2_pt)).unwrap();
        bus.write_u64(l2_pt, pointer_pte(l1_pt)).unwrap();
        bus.write_u64(l1_pt, pointer_pte(l0_pt)).unwrap();
        bus.write_u64(l0_pt, leaf_pte(target >> 12, PTE_R | PTE_A)).unwrap();

        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(vaddr + 0x18, 8));
        assert_eq!(result.map(|t| t.paddr), Ok(target + 0x18));

        let bad = 0x0001_0000_0000_0000u64;
        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(bad, 8));
        assert_eq!(result, Err(Fault::new(Exception::LoadPageFault, bad)));
    }

    #[test]
    fn test_state_cache_tracks_mode_and_mprv() {
        let (_bus, mut csrs, mut mmu) = setup_sv39(DRAM_BASE);
        let fetch = TranslationRequest::fetch(0, 4);
        let load = TranslationRequest::read(0, 8);

        mmu.update_state(&csrs, PrivilegeMode::Machine, false);
        assert_eq!(mmu.state(&fetch), MmuState::Direct);
        assert_eq!(mmu.state(&load), MmuState::Direct);

        // MPRV with MPP=S makes M-mode loads translate, fetches unaffected
        let mstatus = csrs.mstatus() | csr::MSTATUS_MPRV | (1 << csr::MSTATUS_MPP_SHIFT);
        csrs.write(csr::MSTATUS, mstatus);
        assert!(mmu.update_state(&csrs, PrivilegeMode::Machine, false));
        assert_eq!(mmu.state(&fetch), MmuState::Direct);
        assert_eq!(mmu.state(&load), MmuState::Translate);

        csrs.write(SATP, 0);
        mmu.update_state(&csrs, PrivilegeMode::Supervisor, false);
        assert_eq!(mmu.state(&fetch), MmuState::Direct);
    }

    #[test]
    fn test_misaligned_trap_precheck() {
        let cfg = HartConfig::default().with_misaligned_trap(true);
        let (_bus, csrs, mmu) = setup_with(cfg, DRAM_BASE, 8);
        let req = TranslationRequest::read(0x1003, 4);
        assert_eq!(
            mmu.check(&csrs, PrivilegeMode::Supervisor, false, &req),
            Err(Fault::new(Exception::LoadMisaligned, 0x1003))
        );
        let req = TranslationRequest::write(0x1006, 4);
        assert_eq!(
            mmu.check(&csrs, PrivilegeMode::Supervisor, false, &req),
            Err(Fault::new(Exception::StoreMisaligned, 0x1006))
        );
        let req = TranslationRequest::read(0x1003, 4).atomic();
        assert_eq!(
            mmu.check(&csrs, PrivilegeMode::Supervisor, false, &req),
            Err(Fault::new(Exception::StoreMisaligned, 0x1003))
        );
        // fetches are never checked here
        let req = TranslationRequest::fetch(0x1002, 4);
        assert!(mmu.check(&csrs, PrivilegeMode::Supervisor, false, &req).is_ok());
    }

    #[test]
    fn test_tval_sign_extension() {
        let cfg = HartConfig::default().with_tval_sign_extend(true);
        let (mut bus, csrs, mut mmu) = setup_with(cfg, DRAM_BASE + 0x1_0000, 8);
        // bit 38 set, upper bits clear: non-canonical for Sv39
        let vaddr = 0x40_0000_0000u64;
        let result = translate_s(&mut mmu, &csrs, &mut bus, TranslationRequest::read(vaddr, 8));
        assert_eq!(
            result,
            Err(Fault::new(Exception::LoadPageFault, 0xFFFF_FFC0_0000_0000))
        );
    }

    #[test]
    fn test_crosses_page() {
        assert!(crosses_page(0xffe, 4));
        assert!(!crosses_page(0xffc, 4));
        assert!(!crosses_page(0x1000, 8));
    }
}
