//! Leaf permission checks for both translation stages.

use super::config::AdPolicy;
use super::exception::Exception;
use super::mmu::AccessType;
use super::pte::Pte;
use super::PrivilegeMode;

/// Everything the stage-1 permission check depends on besides the PTE.
#[derive(Debug, Clone, Copy)]
pub struct PermContext {
    /// Effective privilege after MPRV / hypervisor load-store resolution.
    pub mode: PrivilegeMode,
    /// SUM from vsstatus when virtualized, mstatus otherwise
    pub sum: bool,
    /// mstatus.MXR, or-ed with vsstatus.MXR when virtualized
    pub mxr: bool,
    /// Read counts only the execute bit (HLVX)
    pub hlvx: bool,
    pub ad: AdPolicy,
}

/// Evaluate a stage-1 leaf. Returns the page fault to raise on failure.
pub fn check_leaf(
    pte: Pte,
    access: AccessType,
    amo: bool,
    ctx: &PermContext,
) -> Result<(), Exception> {
    let fetch = access == AccessType::Execute;
    let mut ok = pte.valid();
    ok &= !(ctx.mode == PrivilegeMode::User && !pte.user());
    // S-mode never executes user pages; it reads them only with SUM
    ok &= !(pte.user() && ctx.mode == PrivilegeMode::Supervisor && (!ctx.sum || fetch));
    ok &= pte.pad() == 0;

    let software_ad = ctx.ad == AdPolicy::Software;
    let (granted, needs_update) = match access {
        AccessType::Execute => (pte.executable(), !pte.accessed()),
        AccessType::Read => {
            let can_load = if ctx.hlvx {
                pte.executable()
            } else {
                pte.readable() || (ctx.mxr && pte.executable())
            };
            (can_load, !pte.accessed())
        }
        AccessType::Write => (pte.writable(), !pte.accessed() || !pte.dirty()),
    };

    if ok && granted && !(software_ad && needs_update) {
        log::trace!("perm: pte={:#x} {:?} mode={:?} ok", pte.bits(), access, ctx.mode);
        return Ok(());
    }
    log::trace!(
        "perm: pte={:#x} {:?} mode={:?} denied (granted={}, ad_update={})",
        pte.bits(),
        access,
        ctx.mode,
        granted,
        software_ad && needs_update
    );
    Err(Exception::page_fault(access, amo))
}

/// Evaluate a stage-2 (G-stage) leaf. Every mapping must be user-accessible;
/// `mxr` is the hart-level mstatus.MXR.
pub fn check_guest_leaf(pte: Pte, access: AccessType, hlvx: bool, mxr: bool) -> bool {
    if !pte.user() || pte.pad() != 0 {
        return false;
    }
    match access {
        AccessType::Execute => pte.executable(),
        AccessType::Read if hlvx => pte.executable(),
        AccessType::Read => pte.readable() || (mxr && pte.executable()),
        AccessType::Write => pte.readable() && pte.writable(),
    }
}
