pub mod config;
pub mod csr;
pub mod exception;
pub mod guide;
pub mod mmu;
pub mod perm;
pub mod pmp;
pub mod pte;
pub mod trap;

use crate::memory::Memory;
use config::HartConfig;
use csr::CsrFile;
use exception::{Exception, Fault};
use guide::{ExecutionGuide, ForceState};
use mmu::{AccessType, Mmu, MmuState, Translation, TranslationRequest};
use pte::PAGE_SIZE;

/// RISC-V privilege modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PrivilegeMode {
    pub fn from_u64(v: u64) -> Self {
        match v & 3 {
            0 => Self::User,
            1 => Self::Supervisor,
            _ => Self::Machine,
        }
    }
}

/// A physically addressed piece of an access. Accesses that cross a page
/// boundary resolve to two segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub vaddr: u64,
    pub paddr: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysAccess {
    pub first: Segment,
    pub second: Option<Segment>,
}

/// Translation and trap state of one hart
pub struct Cpu {
    /// Program counter
    pub pc: u64,
    /// Current privilege mode
    pub mode: PrivilegeMode,
    /// Virtualization mode (V)
    pub virt: bool,
    /// CSR file
    pub csrs: CsrFile,
    /// MMU
    pub mmu: Mmu,
    /// Fault injection from a reference model, when running guided
    pub guide: Option<ExecutionGuide>,
    force: ForceState,
    /// The access being faulted was a hypervisor load/store (feeds GVA)
    hyper_access: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(HartConfig::default())
    }
}

impl Cpu {
    pub fn new(config: HartConfig) -> Self {
        let mut cpu = Self {
            pc: 0,
            mode: PrivilegeMode::Machine,
            virt: false,
            csrs: CsrFile::for_hart(config),
            mmu: Mmu::new(),
            guide: None,
            force: ForceState::default(),
            hyper_access: false,
        };
        cpu.update_mmu_state();
        cpu
    }

    pub fn config(&self) -> &HartConfig {
        self.csrs.config()
    }

    /// Recompute the per-class translate/direct decisions. Called on every
    /// change of privilege, V, or translation-relevant CSRs.
    pub fn update_mmu_state(&mut self) {
        if self.mmu.update_state(&self.csrs, self.mode, self.virt) {
            log::debug!("data mmu state now {:?}", self.mmu.state(&TranslationRequest::read(0, 0)));
        }
    }

    /// Mandatory entry point before `translate`: misalignment and address
    /// range pre-checks. Reports whether the access needs a walk.
    pub fn check_mmu_mode(&mut self, req: &TranslationRequest) -> Result<MmuState, Fault> {
        let result = self.mmu.check(&self.csrs, self.mode, self.virt, req);
        self.note_fault(req, &result);
        result
    }

    /// Walk the page tables for the page containing `req.vaddr`. A forced
    /// fault from the execution guide may replace a successful result.
    pub fn translate<M: Memory + ?Sized>(
        &mut self,
        mem: &mut M,
        req: &TranslationRequest,
    ) -> Result<Translation, Fault> {
        let result = self
            .mmu
            .translate(&self.csrs, mem, self.mode, self.virt, req)
            .and_then(|t| {
                self.force_fault(req.vaddr, forced_kind(req))?;
                Ok(t)
            });
        self.note_fault(req, &result);
        result
    }

    /// Execution-guide hook. Returns the guide's fault if it applies to this
    /// access, otherwise `Ok(())`.
    pub fn force_fault(&mut self, vaddr: u64, access: AccessType) -> Result<(), Fault> {
        let Some(guide) = self.guide else {
            return Ok(());
        };
        let (csrs, mode, virt) = (&self.csrs, self.mode, self.virt);
        self.force
            .force_fault(&guide, vaddr, access, |cause| trap::trap_target(csrs, mode, virt, cause.into()))
    }

    /// Full access pipeline: pre-checks, translation of each page touched,
    /// then PMP and the isolation bitmap on every physical segment.
    pub fn access<M: Memory + ?Sized>(
        &mut self,
        mem: &mut M,
        req: &TranslationRequest,
    ) -> Result<PhysAccess, Fault> {
        let state = self.check_mmu_mode(req)?;

        let first_len = req.len.min(PAGE_SIZE - (req.vaddr & (PAGE_SIZE - 1)));
        let first = TranslationRequest {
            len: first_len,
            ..*req
        };
        let first = self.resolve(mem, state, &first)?;
        let second = if mmu::crosses_page(req.vaddr, req.len) {
            let rest = TranslationRequest {
                vaddr: req.vaddr.wrapping_add(first_len),
                len: req.len - first_len,
                ..*req
            };
            Some(self.resolve(mem, state, &rest)?)
        } else {
            None
        };
        Ok(PhysAccess { first, second })
    }

    fn resolve<M: Memory + ?Sized>(
        &mut self,
        mem: &mut M,
        state: MmuState,
        req: &TranslationRequest,
    ) -> Result<Segment, Fault> {
        let paddr = match state {
            MmuState::Direct => {
                self.mmu.last_level = 0;
                req.vaddr
            }
            MmuState::Translate => self.translate(mem, req)?.paddr,
        };

        let eff = mmu::effective(&self.csrs, self.mode, self.virt, req);
        let permitted = pmp::pmp_check(&self.csrs, mem, paddr, req.len, req.access, eff.mode)
            && pmp::bitmap_check(&self.csrs, mem, paddr, self.mmu.last_level);
        if !permitted {
            log::debug!("physical check denied {:?} at {:#x} (paddr {:#x})", req.access, req.vaddr, paddr);
            let fault = Fault::new(Exception::access_fault(req.access, req.amo), req.vaddr);
            self.hyper_access = req.hyper;
            return Err(fault);
        }
        Ok(Segment {
            vaddr: req.vaddr,
            paddr,
            len: req.len,
        })
    }

    fn note_fault<T>(&mut self, req: &TranslationRequest, result: &Result<T, Fault>) {
        if result.is_err() {
            self.hyper_access = req.hyper;
        }
    }

    /// CSR write from the current privilege mode with WARL filtering.
    /// S-level registers are redirected to their VS counterparts under V=1.
    pub fn write_csr(&mut self, addr: u16, val: u64) -> Result<(), Fault> {
        let addr = self.check_csr_access(addr)?;
        self.csrs.write(addr, val);
        if matches!(
            addr,
            csr::SATP
                | csr::VSATP
                | csr::HGATP
                | csr::MSTATUS
                | csr::SSTATUS
                | csr::HSTATUS
                | csr::VSSTATUS
        ) {
            self.update_mmu_state();
        }
        Ok(())
    }

    pub fn read_csr(&self, addr: u16) -> Result<u64, Fault> {
        let addr = self.csr_target(addr, false)?;
        Ok(self.csrs.read(addr))
    }

    fn check_csr_access(&self, addr: u16) -> Result<u16, Fault> {
        self.csr_target(addr, true)
    }

    fn csr_target(&self, addr: u16, write: bool) -> Result<u16, Fault> {
        let illegal = Fault::new(Exception::IllegalInstruction, 0);
        if write && self.csrs.is_read_only(addr) {
            return Err(illegal);
        }
        let level = (addr >> 8) & 3;
        if self.virt && self.mode != PrivilegeMode::Machine {
            // Hypervisor and VS registers are invisible from inside the guest
            if level == 2 {
                return Err(Fault::new(Exception::VirtualInstruction, 0));
            }
            if level == 1 && self.mode == PrivilegeMode::User {
                return Err(Fault::new(Exception::VirtualInstruction, 0));
            }
            if level == 1 {
                return Ok(vs_alias(addr));
            }
        }
        if !self.csrs.check_privilege(addr, self.mode) {
            return Err(illegal);
        }
        Ok(addr)
    }
}

/// Kind used when matching an access against a forced fault: atomics count as
/// stores.
fn forced_kind(req: &TranslationRequest) -> AccessType {
    if req.amo {
        AccessType::Write
    } else {
        req.access
    }
}

fn vs_alias(addr: u16) -> u16 {
    match addr {
        csr::SSTATUS => csr::VSSTATUS,
        csr::SIE => csr::VSIE,
        csr::STVEC => csr::VSTVEC,
        csr::SSCRATCH => csr::VSSCRATCH,
        csr::SEPC => csr::VSEPC,
        csr::SCAUSE => csr::VSCAUSE,
        csr::STVAL => csr::VSTVAL,
        csr::SIP => csr::VSIP,
        csr::SATP => csr::VSATP,
        other => other,
    }
}
