//! Execution guide: lets a reference model force a page fault this hart did
//! not raise on its own, so the two stay in lockstep.

use super::exception::{Exception, Fault};
use super::mmu::AccessType;
use super::trap::TrapTarget;

/// Consecutive forced attempts at one address before the access is let through.
const FORCE_LIMIT: u32 = 5;

/// What the reference model reported for the current instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionGuide {
    pub force_raise: bool,
    pub cause: Exception,
    pub mtval: u64,
    pub stval: u64,
    pub vstval: u64,
    pub htval: u64,
    pub mtval2: u64,
}

impl ExecutionGuide {
    pub fn new(cause: Exception) -> Self {
        Self {
            force_raise: true,
            cause,
            mtval: 0,
            stval: 0,
            vstval: 0,
            htval: 0,
            mtval2: 0,
        }
    }

    pub fn with_tvals(mut self, mtval: u64, stval: u64, vstval: u64) -> Self {
        self.mtval = mtval;
        self.stval = stval;
        self.vstval = vstval;
        self
    }

    pub fn with_guest_tvals(mut self, htval: u64, mtval2: u64) -> Self {
        self.htval = htval;
        self.mtval2 = mtval2;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Counter {
    addr: u64,
    count: u32,
}

impl Counter {
    /// Count an attempt at `addr`; true on the attempt that should pass.
    fn record(&mut self, addr: u64) -> bool {
        if addr != self.addr {
            self.addr = addr;
            self.count = 0;
        }
        self.count += 1;
        self.count == FORCE_LIMIT
    }
}

/// Per-access-kind attempt counters, kept separately for page faults and
/// guest page faults.
#[derive(Debug, Default)]
pub struct ForceState {
    pf: [Counter; 3],
    gpf: [Counter; 3],
}

fn slot(access: AccessType) -> usize {
    match access {
        AccessType::Execute => 0,
        AccessType::Read => 1,
        AccessType::Write => 2,
    }
}

/// Guide tval the reference model saw for an instruction fault. A fetch that
/// straddles a page reports the second page, which is not a mismatch.
fn fetch_tval(vaddr: u64, guide_tval: u64, reg: &str) -> u64 {
    let cross_page = vaddr & 0xfff == 0xffe && guide_tval & 0xfff == 0;
    if vaddr != guide_tval && !cross_page {
        log::warn!("forced fault: local {} {:#x} does not match guide {:#x}", reg, vaddr, guide_tval);
    }
    guide_tval
}

impl ForceState {
    /// Raise the guide's page fault on a successful walk if the access kind
    /// matches. `target` is where the fault would be delivered and selects
    /// which of the guide's trap values apply.
    pub fn force_fault(
        &mut self,
        guide: &ExecutionGuide,
        vaddr: u64,
        access: AccessType,
        target: impl Fn(Exception) -> TrapTarget,
    ) -> Result<(), Fault> {
        if !guide.force_raise {
            return Ok(());
        }
        let fault = match (guide.cause, access) {
            (Exception::InstructionPageFault, AccessType::Execute) => {
                if self.pf[slot(access)].record(vaddr) {
                    return Ok(());
                }
                let tval = match target(guide.cause) {
                    TrapTarget::VirtualSupervisor => fetch_tval(vaddr, guide.vstval, "vstval"),
                    TrapTarget::Supervisor => fetch_tval(vaddr, guide.stval, "stval"),
                    TrapTarget::Machine => fetch_tval(vaddr, guide.mtval, "mtval"),
                };
                Fault::new(guide.cause, tval)
            }
            (Exception::LoadPageFault, AccessType::Read)
            | (Exception::StorePageFault, AccessType::Write) => {
                if self.pf[slot(access)].record(vaddr) {
                    return Ok(());
                }
                Fault::new(guide.cause, vaddr)
            }
            (Exception::InstructionGuestPageFault, AccessType::Execute) => {
                if self.gpf[slot(access)].record(vaddr) {
                    return Ok(());
                }
                match target(guide.cause) {
                    TrapTarget::Machine => Fault {
                        cause: guide.cause,
                        tval: fetch_tval(vaddr, guide.mtval, "mtval"),
                        tval2: guide.mtval2,
                    },
                    _ => Fault {
                        cause: guide.cause,
                        tval: fetch_tval(vaddr, guide.stval, "stval"),
                        tval2: guide.htval,
                    },
                }
            }
            (Exception::LoadGuestPageFault, AccessType::Read)
            | (Exception::StoreGuestPageFault, AccessType::Write) => {
                if self.gpf[slot(access)].record(vaddr) {
                    return Ok(());
                }
                let tval2 = match target(guide.cause) {
                    TrapTarget::Machine => guide.mtval2,
                    _ => guide.htval,
                };
                Fault {
                    cause: guide.cause,
                    tval: vaddr,
                    tval2,
                }
            }
            _ => return Ok(()),
        };
        log::debug!("forcing {:?} at {:#x}", fault.cause, vaddr);
        Err(fault)
    }
}
