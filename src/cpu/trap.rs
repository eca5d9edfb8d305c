//! Trap delegation, interrupt selection and trap return.

use super::csr::{self, CsrFile};
use super::exception::{Exception, Fault, Interrupt, TrapCause, INTERRUPT_BIT};
use super::{Cpu, PrivilegeMode};

/// Level a trap is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapTarget {
    Machine,
    /// HS-mode when the hypervisor extension is present
    Supervisor,
    VirtualSupervisor,
}

/// Static interrupt priority, highest first.
const PRIORITY: [Interrupt; 6] = [
    Interrupt::MachineExternal,
    Interrupt::MachineSoftware,
    Interrupt::MachineTimer,
    Interrupt::SupervisorExternal,
    Interrupt::SupervisorSoftware,
    Interrupt::SupervisorTimer,
];

const GUEST_PRIORITY: [Interrupt; 4] = [
    Interrupt::VirtualSupervisorExternal,
    Interrupt::VirtualSupervisorSoftware,
    Interrupt::VirtualSupervisorTimer,
    Interrupt::SupervisorGuestExternal,
];

/// Pick the delegation target for `cause` from the current context.
pub fn trap_target(csrs: &CsrFile, mode: PrivilegeMode, virt: bool, cause: TrapCause) -> TrapTarget {
    let bit = 1u64 << cause.bit();
    let (mdeleg, hdeleg) = csrs.delegation(cause.is_interrupt());
    let deleg_s = mode != PrivilegeMode::Machine && mdeleg & bit != 0;
    let deleg_vs = deleg_s && virt && hdeleg & bit != 0;
    if deleg_vs {
        TrapTarget::VirtualSupervisor
    } else if deleg_s {
        TrapTarget::Supervisor
    } else {
        TrapTarget::Machine
    }
}

fn trap_pc(xtvec: u64, xcause: u64) -> u64 {
    let base = xtvec & !3;
    let interrupt = xcause & INTERRUPT_BIT != 0;
    if interrupt && xtvec & 1 == 1 {
        base + ((xcause & 0xff) << 2)
    } else {
        base
    }
}

impl Cpu {
    /// Deliver an architectural fault raised by the translate/check pipeline
    /// (or the dispatch loop). Returns the handler address.
    pub fn deliver_fault(&mut self, fault: Fault, epc: u64) -> u64 {
        self.deliver_trap(fault.cause.into(), fault.tval, fault.tval2, epc)
    }

    pub fn deliver_interrupt(&mut self, irq: Interrupt, epc: u64) -> u64 {
        self.deliver_trap(irq.into(), 0, 0, epc)
    }

    /// Take a trap: select the target level, record cause/epc/tval, stack the
    /// privilege and interrupt-enable bits, and jump to the target's vector.
    /// `tval2` is the already-shifted guest physical address for guest faults.
    pub fn deliver_trap(&mut self, cause: TrapCause, tval: u64, tval2: u64, epc: u64) -> u64 {
        let hyper_access = std::mem::take(&mut self.hyper_access);
        let target = trap_target(&self.csrs, self.mode, self.virt, cause);
        let tval = self.trap_value(cause, tval, epc);
        let guest = matches!(cause, TrapCause::Exception(e) if e.is_guest_page_fault());
        let tval2 = if guest { tval2 } else { 0 };
        log::debug!(
            "trap {:?} -> {:?} from {:?} (v={}) epc={:#x} tval={:#x}",
            cause,
            target,
            self.mode,
            self.virt,
            epc,
            tval
        );

        let hyp = self.csrs.config().hypervisor;
        let prev = self.mode;
        let pc = match target {
            TrapTarget::VirtualSupervisor => {
                let xcause = match cause {
                    TrapCause::Interrupt(irq) => INTERRUPT_BIT | irq.guest_code(),
                    TrapCause::Exception(e) => e.code(),
                };
                self.csrs.write_raw(csr::VSCAUSE, xcause);
                self.csrs.write_raw(csr::VSEPC, epc);
                self.csrs.write_raw(csr::VSTVAL, tval);
                let vsstatus = stack_sie(self.csrs.vsstatus(), prev);
                self.csrs.write_raw(csr::VSSTATUS, vsstatus);
                self.mode = PrivilegeMode::Supervisor;
                trap_pc(self.csrs.read(csr::VSTVEC), xcause)
            }
            TrapTarget::Supervisor => {
                if hyp {
                    let gva = self.records_guest_address(cause, hyper_access);
                    let mut hstatus = self.csrs.hstatus();
                    hstatus = set(hstatus, csr::HSTATUS_GVA, gva);
                    hstatus = set(hstatus, csr::HSTATUS_SPV, self.virt);
                    if self.virt {
                        hstatus = set(hstatus, csr::HSTATUS_SPVP, prev == PrivilegeMode::Supervisor);
                    }
                    self.csrs.write_raw(csr::HSTATUS, hstatus);
                    self.csrs.write_raw(csr::HTVAL, tval2);
                    self.csrs.write_raw(csr::HTINST, 0);
                    self.virt = false;
                }
                let xcause = cause.to_xcause();
                self.csrs.write_raw(csr::SCAUSE, xcause);
                self.csrs.write_raw(csr::SEPC, epc);
                self.csrs.write_raw(csr::STVAL, tval);
                let mstatus = stack_sie(self.csrs.mstatus(), prev);
                self.csrs.write_raw(csr::MSTATUS, mstatus);
                self.mode = PrivilegeMode::Supervisor;
                trap_pc(self.csrs.read(csr::STVEC), xcause)
            }
            TrapTarget::Machine => {
                let mut mstatus = self.csrs.mstatus();
                if hyp {
                    let gva = self.records_guest_address(cause, hyper_access);
                    mstatus = set(mstatus, csr::MSTATUS_GVA, gva);
                    mstatus = set(mstatus, csr::MSTATUS_MPV, self.virt);
                    self.csrs.write_raw(csr::MTVAL2, tval2);
                    self.csrs.write_raw(csr::MTINST, 0);
                    self.virt = false;
                }
                let xcause = cause.to_xcause();
                self.csrs.write_raw(csr::MCAUSE, xcause);
                self.csrs.write_raw(csr::MEPC, epc);
                self.csrs.write_raw(csr::MTVAL, tval);
                let mie = mstatus & csr::MSTATUS_MIE != 0;
                mstatus = set(mstatus, csr::MSTATUS_MPIE, mie);
                mstatus &= !(csr::MSTATUS_MIE | csr::MSTATUS_MPP);
                mstatus |= (prev as u64) << csr::MSTATUS_MPP_SHIFT;
                self.csrs.write_raw(csr::MSTATUS, mstatus);
                self.mode = PrivilegeMode::Machine;
                trap_pc(self.csrs.read(csr::MTVEC), xcause)
            }
        };
        self.update_mmu_state();
        self.pc = pc;
        pc
    }

    /// Trap value written for `cause`.
    fn trap_value(&self, cause: TrapCause, tval: u64, epc: u64) -> u64 {
        match cause {
            TrapCause::Interrupt(_) => 0,
            TrapCause::Exception(Exception::Breakpoint) => epc,
            TrapCause::Exception(Exception::IllegalInstruction | Exception::VirtualInstruction) => {
                if self.csrs.config().tval_illegal_instr {
                    tval
                } else {
                    0
                }
            }
            TrapCause::Exception(e) if e.records_address() => tval,
            TrapCause::Exception(_) => 0,
        }
    }

    /// GVA: set when tval holds a guest virtual address.
    fn records_guest_address(&self, cause: TrapCause, hyper_access: bool) -> bool {
        let TrapCause::Exception(e) = cause else {
            return false;
        };
        if e.is_guest_page_fault() {
            return true;
        }
        let mstatus = self.csrs.mstatus();
        let virt = if mstatus & csr::MSTATUS_MPRV != 0 {
            mstatus & csr::MSTATUS_MPV != 0
        } else {
            self.virt
        };
        let address_cause = (e.code() <= 7 && e != Exception::IllegalInstruction) || e.is_page_fault();
        (virt || hyper_access) && address_cause
    }

    /// Highest-priority pending, enabled and globally unmasked interrupt.
    pub fn select_pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.csrs.pending_enabled();
        if pending == 0 {
            return None;
        }
        let cfg = self.csrs.config();
        let guest: &[Interrupt] = if cfg.hypervisor { &GUEST_PRIORITY } else { &[] };
        let lcofi: &[Interrupt] = if cfg.lcofi {
            &[Interrupt::CounterOverflow]
        } else {
            &[]
        };

        let mideleg = self.csrs.read(csr::MIDELEG);
        let hideleg = self.csrs.read_raw(csr::HIDELEG);
        let mstatus = self.csrs.mstatus();
        let vsstatus = self.csrs.vsstatus();
        let mode = self.mode;
        let v = self.virt;

        PRIORITY
            .iter()
            .chain(guest)
            .chain(lcofi)
            .copied()
            .filter(|irq| pending & irq.mask() != 0)
            .find(|irq| {
                let deleg = mideleg & irq.mask() != 0;
                let hdeleg = hideleg & irq.mask() != 0;
                if deleg && hdeleg {
                    (v && mode == PrivilegeMode::Supervisor && vsstatus & csr::MSTATUS_SIE != 0)
                        || (v && mode == PrivilegeMode::User)
                } else if deleg {
                    (mode == PrivilegeMode::Supervisor && mstatus & csr::MSTATUS_SIE != 0)
                        || mode == PrivilegeMode::User
                        || v
                } else {
                    (mode == PrivilegeMode::Machine && mstatus & csr::MSTATUS_MIE != 0)
                        || mode != PrivilegeMode::Machine
                }
            })
    }

    /// MRET. Returns the resume pc.
    pub fn mret(&mut self) -> Result<u64, Fault> {
        if self.mode != PrivilegeMode::Machine {
            return Err(Fault::new(Exception::IllegalInstruction, 0));
        }
        let mut mstatus = self.csrs.mstatus();
        let mpp = PrivilegeMode::from_u64(mstatus >> csr::MSTATUS_MPP_SHIFT);
        let mpv = mstatus & csr::MSTATUS_MPV != 0;
        let mpie = mstatus & csr::MSTATUS_MPIE != 0;
        mstatus = set(mstatus, csr::MSTATUS_MIE, mpie);
        mstatus |= csr::MSTATUS_MPIE;
        mstatus &= !(csr::MSTATUS_MPP | csr::MSTATUS_MPV);
        if mpp != PrivilegeMode::Machine {
            mstatus &= !csr::MSTATUS_MPRV;
        }
        self.csrs.write_raw(csr::MSTATUS, mstatus);
        self.mode = mpp;
        self.virt = self.csrs.config().hypervisor && mpv && mpp != PrivilegeMode::Machine;
        self.update_mmu_state();
        self.pc = self.csrs.read(csr::MEPC);
        log::debug!("mret -> {:?} (v={}) pc={:#x}", self.mode, self.virt, self.pc);
        Ok(self.pc)
    }

    /// SRET from HS-mode or, when virtualized, from VS-mode.
    pub fn sret(&mut self) -> Result<u64, Fault> {
        if self.mode == PrivilegeMode::User {
            let cause = if self.virt {
                Exception::VirtualInstruction
            } else {
                Exception::IllegalInstruction
            };
            return Err(Fault::new(cause, 0));
        }
        if self.virt {
            let vsstatus = self.csrs.vsstatus();
            let (vsstatus, spp) = unstack_sie(vsstatus);
            self.csrs.write_raw(csr::VSSTATUS, vsstatus);
            self.mode = spp;
            self.pc = self.csrs.read(csr::VSEPC);
        } else {
            let (mut mstatus, spp) = unstack_sie(self.csrs.mstatus());
            if spp != PrivilegeMode::Machine {
                mstatus &= !csr::MSTATUS_MPRV;
            }
            self.csrs.write_raw(csr::MSTATUS, mstatus);
            if self.csrs.config().hypervisor {
                let hstatus = self.csrs.hstatus();
                self.virt = hstatus & csr::HSTATUS_SPV != 0;
                self.csrs.write_raw(csr::HSTATUS, hstatus & !csr::HSTATUS_SPV);
            }
            self.mode = spp;
            self.pc = self.csrs.read(csr::SEPC);
        }
        self.update_mmu_state();
        log::debug!("sret -> {:?} (v={}) pc={:#x}", self.mode, self.virt, self.pc);
        Ok(self.pc)
    }
}

fn set(val: u64, mask: u64, on: bool) -> u64 {
    if on {
        val | mask
    } else {
        val & !mask
    }
}

/// SPP <- mode, SPIE <- SIE, SIE <- 0 on an sstatus-layout register.
fn stack_sie(status: u64, prev: PrivilegeMode) -> u64 {
    let sie = status & csr::MSTATUS_SIE != 0;
    let mut status = set(status, csr::MSTATUS_SPIE, sie);
    status &= !csr::MSTATUS_SIE;
    set(status, csr::MSTATUS_SPP, prev != PrivilegeMode::User)
}

/// Inverse of `stack_sie`; returns the updated register and the mode to return to.
fn unstack_sie(status: u64) -> (u64, PrivilegeMode) {
    let spp = if status & csr::MSTATUS_SPP != 0 {
        PrivilegeMode::Supervisor
    } else {
        PrivilegeMode::User
    };
    let spie = status & csr::MSTATUS_SPIE != 0;
    let mut status = set(status, csr::MSTATUS_SIE, spie);
    status |= csr::MSTATUS_SPIE;
    status &= !csr::MSTATUS_SPP;
    (status, spp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::config::HartConfig;

    #[test]
    fn test_trap_pc_vectoring() {
        assert_eq!(trap_pc(0x8000_0001, INTERRUPT_BIT | 7), 0x8000_001C);
        assert_eq!(trap_pc(0x8000_0001, 13), 0x8000_0000);
        assert_eq!(trap_pc(0x8000_0000, INTERRUPT_BIT | 7), 0x8000_0000);
    }

    #[test]
    fn test_machine_trap_stacks_status() {
        let mut cpu = Cpu::new(HartConfig::default());
        cpu.mode = PrivilegeMode::Supervisor;
        cpu.csrs.write(csr::MTVEC, 0x8000_0100);
        let mstatus = cpu.csrs.mstatus() | csr::MSTATUS_MIE;
        cpu.csrs.write(csr::MSTATUS, mstatus);

        let pc = cpu.deliver_fault(Fault::new(Exception::LoadPageFault, 0x1234), 0x8000_2000);
        assert_eq!(pc, 0x8000_0100);
        assert_eq!(cpu.mode, PrivilegeMode::Machine);
        assert_eq!(cpu.csrs.read(csr::MCAUSE), 13);
        assert_eq!(cpu.csrs.read(csr::MEPC), 0x8000_2000);
        assert_eq!(cpu.csrs.read(csr::MTVAL), 0x1234);
        let mstatus = cpu.csrs.mstatus();
        assert_eq!(mstatus & csr::MSTATUS_MIE, 0);
        assert_ne!(mstatus & csr::MSTATUS_MPIE, 0);
        assert_eq!((mstatus & csr::MSTATUS_MPP) >> csr::MSTATUS_MPP_SHIFT, 1);
    }

    #[test]
    fn test_trap_value_table() {
        let mut cpu = Cpu::new(HartConfig::default().with_tval_illegal_instr(false));
        cpu.deliver_fault(Fault::new(Exception::IllegalInstruction, 0xdead), 0x100);
        assert_eq!(cpu.csrs.read(csr::MTVAL), 0);
        cpu.deliver_fault(Fault::new(Exception::Breakpoint, 0), 0x200);
        assert_eq!(cpu.csrs.read(csr::MTVAL), 0x200);
        cpu.deliver_fault(Fault::new(Exception::EcallFromM, 0x55), 0x300);
        assert_eq!(cpu.csrs.read(csr::MTVAL), 0);
    }

    #[test]
    fn test_mret_clears_mprv_and_restores_mode() {
        let mut cpu = Cpu::new(HartConfig::default());
        cpu.csrs.write(csr::MEPC, 0x8000_4000);
        let mstatus = cpu.csrs.mstatus() | csr::MSTATUS_MPRV | csr::MSTATUS_MPIE | (1 << csr::MSTATUS_MPP_SHIFT);
        cpu.csrs.write(csr::MSTATUS, mstatus);

        assert_eq!(cpu.mret(), Ok(0x8000_4000));
        assert_eq!(cpu.mode, PrivilegeMode::Supervisor);
        let mstatus = cpu.csrs.mstatus();
        assert_eq!(mstatus & csr::MSTATUS_MPRV, 0);
        assert_ne!(mstatus & csr::MSTATUS_MIE, 0);
        assert_eq!(mstatus & csr::MSTATUS_MPP, 0);
        assert_eq!(cpu.mret(), Err(Fault::new(Exception::IllegalInstruction, 0)));
    }

    #[test]
    fn test_sret_round_trip() {
        let mut cpu = Cpu::new(HartConfig::default());
        cpu.mode = PrivilegeMode::User;
        cpu.csrs.write(csr::MEDELEG, 1 << 8);
        cpu.csrs.write(csr::STVEC, 0x8000_0800);
        cpu.deliver_fault(Fault::new(Exception::EcallFromU, 0), 0x1000);
        assert_eq!(cpu.mode, PrivilegeMode::Supervisor);
        assert_eq!(cpu.csrs.read(csr::SCAUSE), 8);
        assert_eq!(cpu.csrs.mstatus() & csr::MSTATUS_SPP, 0);

        assert_eq!(cpu.sret(), Ok(0x1000));
        assert_eq!(cpu.mode, PrivilegeMode::User);
        assert_eq!(
            cpu.sret(),
            Err(Fault::new(Exception::IllegalInstruction, 0))
        );
    }
}
